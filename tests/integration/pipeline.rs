//! End-to-end tests: bus → poller → storage/detector → dispatcher

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use substation_monitor::alerts::build_sink;
use substation_monitor::pipeline::Pipeline;
use substation_monitor::storage::StorageBackend;
use substation_monitor::storage::memory::MemoryBackend;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_five_meters_one_unreachable() {
    let csv_dir = TempDir::new().unwrap();
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alerts"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let mut json = create_test_config(csv_dir.path(), 5);
    json["alerts"] = serde_json::json!({
        "channel": { "webhook": { "url": format!("{}/alerts", mock_server.uri()) } },
        "backoff_ms": 1,
    });
    let config = parse_config(json);

    let bus = bus_with_dmf_meters(5);
    bus.silence(3);
    let clock = Arc::new(ManualClock::new(start_of_day()));
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let alerts = config.alerts.as_ref().unwrap();
    let sink = build_sink(&alerts.channel, Duration::from_secs(5)).unwrap();

    let pipeline =
        Pipeline::spawn(&config, bus, backend.clone(), Some(sink), clock.clone()).unwrap();

    for _ in 0..3 {
        clock.advance(30);
        let results = pipeline.poller.poll_now().await.unwrap();
        assert_eq!(results.len(), 5);
        assert_eq!(results.iter().filter(|r| r.is_success()).count(), 4);
    }

    let summary = pipeline.storage.flush().await.unwrap();
    assert_eq!(summary.readings, 12);
    assert_eq!(summary.aggregates, 4);

    let latest = pipeline.storage.query_latest(1, 10).await.unwrap();
    assert_eq!(latest.len(), 3);
    assert!(pipeline.storage.query_latest(3, 10).await.unwrap().is_empty());

    let snapshot = pipeline.storage.aggregates();
    assert_eq!(snapshot.open.len(), 4);
    assert!(!snapshot.open.contains_key(&3));
    for record in snapshot.open.values() {
        assert_eq!(record.sample_count, 3);
        assert_eq!(record.parameters["v_r"].avg(), 231.0);
    }

    let poller_stats = pipeline.poller.get_stats().await.unwrap();
    assert_eq!(poller_stats.rounds, 3);
    assert_eq!(poller_stats.meters[&3].consecutive_failures, 3);

    let detector = pipeline.detector.clone();
    eventually(|| {
        let detector = detector.clone();
        async move { detector.consecutive_failures(3).await.unwrap() == 3 }
    })
    .await;

    // Shutdown drops undelivered alerts, so wait for the send first
    let dispatcher = pipeline.dispatcher.clone().unwrap();
    eventually(|| {
        let dispatcher = dispatcher.clone();
        async move { dispatcher.get_stats().await.unwrap().alerts_sent == 1 }
    })
    .await;

    pipeline.shutdown(Duration::from_secs(5)).await.unwrap();

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1, "exactly one alert for the unreachable meter");
    let body: serde_json::Value = requests[0].body_json().unwrap();
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("Feeder 3 (ID: 3) - meter unreachable"));

    let csv_path = csv_dir.path().join("readings-2025-06-01.csv");
    let content = std::fs::read_to_string(csv_path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 1 + 12);
    assert!(lines[0].starts_with("timestamp,meter_id,"));
    assert!(lines[1].starts_with("2025-06-01 08:00:30,1,"));
    assert!(!lines.iter().any(|line| line.contains(",3,")));
}

#[tokio::test]
async fn test_overvoltage_alerts_once_within_window() {
    let csv_dir = TempDir::new().unwrap();
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let mut json = create_test_config(csv_dir.path(), 2);
    json["alerts"] = serde_json::json!({
        "channel": { "webhook": { "url": mock_server.uri() } },
        "suppression_window_secs": 600,
    });
    let config = parse_config(json);

    let bus = bus_with_dmf_meters(2);
    let clock = Arc::new(ManualClock::new(start_of_day()));
    let sink = build_sink(&config.alerts.as_ref().unwrap().channel, Duration::from_secs(5)).unwrap();
    let pipeline = Pipeline::spawn(
        &config,
        bus.clone(),
        Arc::new(MemoryBackend::new()),
        Some(sink),
        clock.clone(),
    )
    .unwrap();

    bus.set_value(2, "v_r", 270.0);
    for _ in 0..4 {
        clock.advance(30);
        pipeline.poller.poll_now().await.unwrap();
    }

    let dispatcher = pipeline.dispatcher.clone().unwrap();
    eventually(|| {
        let dispatcher = dispatcher.clone();
        async move { dispatcher.get_stats().await.unwrap().received == 4 }
    })
    .await;
    let stats = dispatcher.get_stats().await.unwrap();
    assert_eq!(stats.alerts_sent, 1);
    assert_eq!(stats.suppressed, 3);

    pipeline.shutdown(Duration::from_secs(5)).await.unwrap();

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = requests[0].body_json().unwrap();
    assert!(body["message"].as_str().unwrap().contains("v_r = 270.00"));
}

#[tokio::test]
async fn test_shutdown_flushes_buffered_readings() {
    let csv_dir = TempDir::new().unwrap();
    let config = parse_config(create_test_config(csv_dir.path(), 2));

    let clock = Arc::new(ManualClock::new(start_of_day()));
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let pipeline = Pipeline::spawn(
        &config,
        bus_with_dmf_meters(2),
        backend.clone(),
        None,
        clock.clone(),
    )
    .unwrap();
    assert!(pipeline.dispatcher.is_none());

    clock.advance(30);
    pipeline.poller.poll_now().await.unwrap();
    clock.advance(30);
    pipeline.poller.poll_now().await.unwrap();

    pipeline.shutdown(Duration::from_secs(5)).await.unwrap();

    assert_eq!(backend.query_latest(1, 10).await.unwrap().len(), 2);
    assert_eq!(backend.query_latest(2, 10).await.unwrap().len(), 2);
    let open = backend.load_open_aggregates().await.unwrap();
    assert_eq!(open.len(), 2);
}

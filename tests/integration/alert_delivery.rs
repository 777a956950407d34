//! Alert delivery against mock HTTP endpoints

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use substation_monitor::actors::dispatcher::{DispatcherContext, DispatcherHandle};
use substation_monitor::actors::poller::LatestResults;
use substation_monitor::alerts::build_sink;
use substation_monitor::config::{AlertChannel, AlertConfig, Telegram};
use substation_monitor::detector::{Anomaly, Rule, Severity};
use substation_monitor::pipeline::Pipeline;
use substation_monitor::storage::memory::MemoryBackend;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn telegram_config(api_url: &str) -> AlertConfig {
    AlertConfig {
        channel: AlertChannel::Telegram(Telegram {
            bot_token: Some("123:abc".to_string()),
            chat_id: "-1001".to_string(),
            api_url: api_url.to_string(),
        }),
        suppression_window_secs: 600,
        digest_interval_secs: None,
        max_attempts: 3,
        backoff_ms: 10,
        timeout_secs: 5,
        dedup_bucket_secs: 1,
    }
}

fn spawn_dispatcher(
    config: AlertConfig,
) -> (mpsc::Sender<Anomaly>, DispatcherHandle, JoinHandle<()>) {
    let sink = build_sink(&config.channel, Duration::from_secs(config.timeout_secs)).unwrap();
    let (_latest_tx, latest_rx) = watch::channel::<LatestResults>(Arc::new(BTreeMap::new()));
    let ctx = DispatcherContext {
        sink,
        target: config.channel.target(),
        names: BTreeMap::from([(7, "Pump House".to_string())]),
        latest_rx,
        clock: Arc::new(ManualClock::new(start_of_day())),
        utc_offset_minutes: 0,
    };
    let (tx, rx) = mpsc::channel(16);
    let (handle, task) = DispatcherHandle::spawn(ctx, config, rx);
    (tx, handle, task)
}

fn supply_loss(at: DateTime<Utc>) -> Anomaly {
    Anomaly {
        meter_id: 7,
        parameter: "supply".to_string(),
        observed: None,
        rule: Rule::SupplyLoss,
        detail: "all voltages and currents near zero".to_string(),
        timestamp: at,
        severity: Severity::Critical,
    }
}

#[tokio::test]
async fn test_server_error_retried_up_to_max_attempts() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bot123:abc/sendMessage"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&mock_server)
        .await;

    let (tx, handle, _task) = spawn_dispatcher(telegram_config(&mock_server.uri()));
    tx.send(supply_loss(start_of_day())).await.unwrap();

    eventually(|| {
        let handle = handle.clone();
        async move { handle.get_stats().await.unwrap().dropped == 1 }
    })
    .await;
    let stats = handle.get_stats().await.unwrap();
    assert_eq!(stats.messages_sent, 0);

    mock_server.verify().await;
}

#[tokio::test]
async fn test_shutdown_drops_alerts_while_endpoint_down() {
    let csv_dir = TempDir::new().unwrap();
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(400)))
        .mount(&mock_server)
        .await;

    let mut json = create_test_config(csv_dir.path(), 2);
    json["alerts"] = serde_json::json!({
        "channel": { "webhook": { "url": mock_server.uri() } },
        "max_attempts": 5,
        "backoff_ms": 10,
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
    for _ in 0..3 {
        clock.advance(30);
        pipeline.poller.poll_now().await.unwrap();
    }

    let server = &mock_server;
    eventually(move || async move { !server.received_requests().await.unwrap().is_empty() }).await;

    let started = std::time::Instant::now();
    let result = pipeline.shutdown(Duration::from_secs(2)).await;

    assert!(result.is_ok(), "shutdown failed: {result:?}");
    assert!(started.elapsed() < Duration::from_secs(1));
    let requests = mock_server.received_requests().await.unwrap();
    assert!(requests.len() < 5, "retries continued after shutdown");
}

#[tokio::test]
async fn test_bad_request_not_retried() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("chat not found"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (tx, handle, _task) = spawn_dispatcher(telegram_config(&mock_server.uri()));
    tx.send(supply_loss(start_of_day())).await.unwrap();

    eventually(|| {
        let handle = handle.clone();
        async move { handle.get_stats().await.unwrap().dropped == 1 }
    })
    .await;

    mock_server.verify().await;
}

#[tokio::test]
async fn test_recovers_after_transient_failure() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({ "chat_id": "-1001" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": true })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (tx, handle, _task) = spawn_dispatcher(telegram_config(&mock_server.uri()));
    tx.send(supply_loss(start_of_day())).await.unwrap();

    eventually(|| {
        let handle = handle.clone();
        async move { handle.get_stats().await.unwrap().messages_sent == 1 }
    })
    .await;

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let body: serde_json::Value = requests[1].body_json().unwrap();
    let text = body["text"].as_str().unwrap();
    assert!(text.contains("Pump House (ID: 7) - supply loss"));
}

#[tokio::test]
async fn test_digest_reports_latest_readings() {
    let csv_dir = TempDir::new().unwrap();
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let mut json = create_test_config(csv_dir.path(), 2);
    json["alerts"] = serde_json::json!({
        "channel": { "webhook": { "url": mock_server.uri(), "target": "control-room" } },
    });
    let config = parse_config(json);

    let bus = bus_with_dmf_meters(2);
    bus.silence(2);
    let clock = Arc::new(ManualClock::new(start_of_day()));
    let sink = build_sink(&config.alerts.as_ref().unwrap().channel, Duration::from_secs(5)).unwrap();
    let pipeline = Pipeline::spawn(
        &config,
        bus,
        Arc::new(MemoryBackend::new()),
        Some(sink),
        clock.clone(),
    )
    .unwrap();

    clock.advance(60);
    pipeline.poller.poll_now().await.unwrap();
    pipeline
        .dispatcher
        .as_ref()
        .unwrap()
        .send_digest_now()
        .await
        .unwrap();

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = requests[0].body_json().unwrap();
    assert_eq!(body["target"], "control-room");
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("date: 01/06/2025 time 08.01"));
    assert!(message.contains("* Feeder 1 (ID: 1) - Status: OK *"));
    assert!(message.contains("  Line Voltage: 400.00/401.00/399.00"));
    assert!(message.contains("* Feeder 2 (ID: 2) - Status: Communication Failed *"));

    pipeline.shutdown(Duration::from_secs(5)).await.unwrap();
}

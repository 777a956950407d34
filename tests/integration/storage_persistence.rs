//! Long-horizon persistence across restarts (SQLite)

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use substation_monitor::config::StorageConfig;
use substation_monitor::pipeline::Pipeline;
use substation_monitor::storage::open_backend;
use tempfile::TempDir;

use crate::helpers::*;

fn sqlite_config(dir: &TempDir) -> StorageConfig {
    StorageConfig::Sqlite {
        path: dir.path().join("db").join("readings.db"),
        retention_days: 365,
    }
}

#[tokio::test]
async fn test_aggregates_and_order_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = parse_config(create_test_config(&dir.path().join("csv"), 2));
    let clock = Arc::new(ManualClock::new(start_of_day()));

    let backend = open_backend(&sqlite_config(&dir)).await.unwrap();
    let pipeline =
        Pipeline::spawn(&config, bus_with_dmf_meters(2), backend, None, clock.clone()).unwrap();
    for _ in 0..2 {
        clock.advance(30);
        pipeline.poller.poll_now().await.unwrap();
    }
    pipeline.shutdown(Duration::from_secs(5)).await.unwrap();

    // Second run; the clock is set back behind the stored readings first
    let backend = open_backend(&sqlite_config(&dir)).await.unwrap();
    assert_eq!(backend.query_latest(1, 10).await.unwrap().len(), 2);

    let earlier = Arc::new(ManualClock::new(start_of_day()));
    let pipeline = Pipeline::spawn(
        &config,
        bus_with_dmf_meters(2),
        backend.clone(),
        None,
        earlier.clone(),
    )
    .unwrap();

    earlier.advance(10);
    pipeline.poller.poll_now().await.unwrap();
    let summary = pipeline.storage.flush().await.unwrap();
    assert_eq!(summary.readings, 0);
    let stats = pipeline.storage.get_stats().await.unwrap();
    assert_eq!(stats.rejected_out_of_order, 2);

    earlier.advance(80);
    pipeline.poller.poll_now().await.unwrap();
    let summary = pipeline.storage.flush().await.unwrap();
    assert_eq!(summary.readings, 2);

    let snapshot = pipeline.storage.aggregates();
    assert_eq!(snapshot.open[&1].sample_count, 3);
    assert_eq!(snapshot.open[&2].sample_count, 3);

    let day = start_of_day().date_naive();
    let stored = pipeline.storage.query_aggregates(1, day, day).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].sample_count, 3);
    assert!(!stored[0].finalized);

    let health = pipeline.storage.health_check().await.unwrap();
    assert!(health.healthy);

    pipeline.shutdown(Duration::from_secs(5)).await.unwrap();
}

//! Failure tests for the pipeline
//!
//! These tests verify that the system degrades instead of losing data:
//! - Backend outages keep readings buffered until a flush succeeds
//! - An unwritable CSV directory does not block the long-horizon store
//! - Meters that stop answering for a while are picked up again
//! - A poller stuck on the bus does not keep storage from its final flush

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use substation_monitor::actors::storage::{PersistenceSettings, StorageHandle};
use substation_monitor::link::Transport;
use substation_monitor::pipeline::Pipeline;
use substation_monitor::storage::csv_log::ShortHorizonWriter;
use substation_monitor::storage::memory::MemoryBackend;
use substation_monitor::storage::{
    AggregateRecord, HealthStatus, QueryRange, ReadingRow, StorageBackend, StorageError,
    StorageResult,
};
use substation_monitor::{PollOutcome, PollResult, Reading};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

use crate::helpers::*;

/// Memory backend whose writes fail while `failing` is set
#[derive(Default)]
struct FlakyBackend {
    inner: MemoryBackend,
    failing: AtomicBool,
}

impl FlakyBackend {
    fn check(&self) -> StorageResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionFailed("database is locked".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    async fn persist(
        &self,
        rows: Vec<ReadingRow>,
        aggregates: Vec<AggregateRecord>,
    ) -> StorageResult<()> {
        self.check()?;
        self.inner.persist(rows, aggregates).await
    }

    async fn query_range(&self, query: QueryRange) -> StorageResult<Vec<ReadingRow>> {
        self.inner.query_range(query).await
    }

    async fn query_latest(&self, meter_id: u32, limit: usize) -> StorageResult<Vec<ReadingRow>> {
        self.inner.query_latest(meter_id, limit).await
    }

    async fn query_aggregates(
        &self,
        meter_id: u32,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StorageResult<Vec<AggregateRecord>> {
        self.inner.query_aggregates(meter_id, from, to).await
    }

    async fn load_open_aggregates(&self) -> StorageResult<Vec<AggregateRecord>> {
        self.inner.load_open_aggregates().await
    }

    async fn last_timestamps(&self) -> StorageResult<HashMap<u32, DateTime<Utc>>> {
        self.inner.last_timestamps().await
    }

    async fn cleanup_old_readings(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        self.inner.cleanup_old_readings(before).await
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        self.inner.health_check().await
    }

    async fn get_stats(&self) -> StorageResult<String> {
        self.inner.get_stats().await
    }

    async fn close(&self) -> StorageResult<()> {
        self.inner.close().await
    }
}

/// Bus on which one address never answers and never times out by itself
struct StallingBus {
    bus: BusSimulator,
    stalled: u8,
}

#[async_trait]
impl Transport for StallingBus {
    async fn transact(&mut self, request: &[u8]) -> io::Result<Vec<u8>> {
        if request[0] == self.stalled {
            return std::future::pending().await;
        }
        self.bus.transact(request).await
    }
}

fn reading(meter_id: u32, timestamp: DateTime<Utc>) -> PollResult {
    PollResult {
        meter_id,
        attempted_at: timestamp,
        outcome: PollOutcome::Reading(Arc::new(Reading {
            meter_id,
            timestamp,
            values: BTreeMap::from([("v_r".to_string(), 230.0), ("frequency".to_string(), 50.0)]),
        })),
    }
}

fn settings() -> PersistenceSettings {
    PersistenceSettings {
        flush_interval: Duration::from_secs(3600),
        cleanup_interval: Duration::from_secs(3600),
        retention_days: None,
        utc_offset_minutes: 0,
    }
}

fn csv_writer(dir: &std::path::Path) -> ShortHorizonWriter {
    ShortHorizonWriter::new(dir, 7, 0, vec!["v_r".to_string(), "frequency".to_string()])
}

#[tokio::test]
async fn test_backend_outage_keeps_readings_buffered() {
    let csv_dir = TempDir::new().unwrap();
    let backend = Arc::new(FlakyBackend::default());
    backend.failing.store(true, Ordering::SeqCst);
    let clock = Arc::new(ManualClock::new(start_of_day()));

    let (event_tx, event_rx) = mpsc::channel(16);
    let (storage, task) = StorageHandle::spawn(
        backend.clone(),
        csv_writer(csv_dir.path()),
        clock,
        settings(),
        event_rx,
    );

    event_tx.send(reading(1, start_of_day())).await.unwrap();
    event_tx
        .send(reading(1, start_of_day() + chrono::Duration::seconds(30)))
        .await
        .unwrap();

    assert!(storage.flush().await.is_err());
    let stats = storage.get_stats().await.unwrap();
    assert_eq!(stats.buffered, 2);
    assert_eq!(stats.failed_flushes, 1);
    assert_eq!(stats.csv_rows_written, 2);
    assert!(storage.aggregates().open.is_empty());

    backend.failing.store(false, Ordering::SeqCst);
    let summary = assert_ok!(storage.flush().await);
    assert_eq!(summary.readings, 2);
    assert_eq!(storage.aggregates().open[&1].sample_count, 2);
    assert_eq!(backend.query_latest(1, 10).await.unwrap().len(), 2);

    drop(event_tx);
    task.await.unwrap();
}

#[tokio::test]
async fn test_unwritable_csv_dir_still_reaches_backend() {
    let scratch = TempDir::new().unwrap();
    let not_a_dir = scratch.path().join("occupied");
    std::fs::write(&not_a_dir, b"plain file").unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let clock = Arc::new(ManualClock::new(start_of_day()));
    let (event_tx, event_rx) = mpsc::channel(16);
    let (storage, task) =
        StorageHandle::spawn(backend.clone(), csv_writer(&not_a_dir), clock, settings(), event_rx);

    event_tx.send(reading(2, start_of_day())).await.unwrap();

    let summary = storage.flush().await.unwrap();
    assert_eq!(summary.readings, 1);
    let stats = storage.get_stats().await.unwrap();
    assert_eq!(stats.csv_rows_written, 0);
    assert_eq!(stats.csv_rows_pending, 1);

    drop(event_tx);
    task.await.unwrap();
    assert_eq!(backend.query_latest(2, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_meter_recovers_after_missed_polls() {
    let csv_dir = TempDir::new().unwrap();
    let config = parse_config(create_test_config(csv_dir.path(), 2));

    let bus = bus_with_dmf_meters(2);
    let clock = Arc::new(ManualClock::new(start_of_day()));
    let pipeline = Pipeline::spawn(
        &config,
        bus.clone(),
        Arc::new(MemoryBackend::new()),
        None,
        clock.clone(),
    )
    .unwrap();

    bus.silence(1);
    for _ in 0..2 {
        clock.advance(30);
        let results = pipeline.poller.poll_now().await.unwrap();
        assert!(!results[0].is_success());
        assert_eq!(results[0].failure().unwrap().attempts, 2);
    }

    let detector = pipeline.detector.clone();
    eventually(|| {
        let detector = detector.clone();
        async move { detector.consecutive_failures(1).await.unwrap() == 2 }
    })
    .await;

    bus.revive(1);
    clock.advance(30);
    let results = pipeline.poller.poll_now().await.unwrap();
    assert!(results.iter().all(|r| r.is_success()));

    let stats = pipeline.poller.get_stats().await.unwrap();
    assert_eq!(stats.meters[&1].failures, 2);
    assert_eq!(stats.meters[&1].consecutive_failures, 0);

    eventually(|| {
        let detector = detector.clone();
        async move { detector.consecutive_failures(1).await.unwrap() == 0 }
    })
    .await;

    let summary = pipeline.storage.flush().await.unwrap();
    assert_eq!(summary.readings, 4);

    pipeline.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_flushes_storage_when_poller_stalls() {
    let csv_dir = TempDir::new().unwrap();
    let mut json = create_test_config(csv_dir.path(), 2);
    json["link"] = serde_json::json!({ "timeout_ms": 600_000, "retries": 0, "backoff_ms": 1 });
    let config = parse_config(json);

    let transport = StallingBus {
        bus: bus_with_dmf_meters(2),
        stalled: 2,
    };
    let clock = Arc::new(ManualClock::new(start_of_day()));
    let backend = Arc::new(MemoryBackend::new());
    let pipeline =
        Pipeline::spawn(&config, transport, backend.clone(), None, clock.clone()).unwrap();

    clock.advance(30);
    let poller = pipeline.poller.clone();
    let round = tokio::spawn(async move { poller.poll_now().await });

    let storage = pipeline.storage.clone();
    eventually(|| {
        let storage = storage.clone();
        async move { storage.get_stats().await.unwrap().readings_received == 1 }
    })
    .await;
    drop(storage);

    let result = pipeline.shutdown(Duration::from_millis(200)).await;

    let error = result.unwrap_err();
    assert!(format!("{error:#}").contains("poller did not stop in time"));
    assert_eq!(backend.query_latest(1, 10).await.unwrap().len(), 1);
    assert!(round.await.unwrap().is_err());
}

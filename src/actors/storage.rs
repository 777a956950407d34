//! StorageActor - Persists readings to both horizons
//!
//! ## Write Path
//!
//! Each successful poll result is checked against the last timestamp stored
//! for its meter (equal: duplicate, skipped; older: rejected). Accepted
//! readings are appended to the day's CSV file right away and buffered for the
//! long-horizon backend.
//!
//! ## Flushing
//!
//! On every flush tick the buffer is folded into the daily aggregates and
//! written together with them in one backend transaction. Only after the
//! backend accepted the batch are the aggregates committed and published; a
//! failed flush leaves both the buffer and the aggregates as they were, so the
//! next tick retries the whole batch.
//!
//! The actor is the only writer of the aggregates. When the poller goes away
//! the remaining readings are flushed before the actor exits.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::storage::csv_log::ShortHorizonWriter;
use crate::storage::{
    AggregateBook, AggregateRecord, AggregateSnapshot, HealthStatus, QueryRange, ReadingRow,
    StorageBackend, StorageError,
};
use crate::util::Clock;
use crate::{PollResult, Reading};

use super::messages::{FlushSummary, StorageCommand, StorageStats};

/// Readings kept for the backend while it is failing
const MAX_BUFFERED_READINGS: usize = 100_000;

/// Settings of the storage actor
#[derive(Debug, Clone)]
pub struct PersistenceSettings {
    pub flush_interval: Duration,
    pub cleanup_interval: Duration,

    /// Readings older than this are deleted from the backend
    pub retention_days: Option<u32>,

    pub utc_offset_minutes: i32,
}

pub struct StorageActor {
    backend: Arc<dyn StorageBackend>,
    csv: ShortHorizonWriter,
    book: AggregateBook,
    clock: Arc<dyn Clock>,
    settings: PersistenceSettings,

    /// Readings waiting for the next flush, in arrival order
    buffer: VecDeque<Arc<Reading>>,

    /// Newest accepted timestamp per meter
    last_seen: HashMap<u32, DateTime<Utc>>,

    event_rx: mpsc::Receiver<PollResult>,
    command_rx: mpsc::Receiver<StorageCommand>,

    stats: StorageStats,
}

impl StorageActor {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        csv: ShortHorizonWriter,
        book: AggregateBook,
        clock: Arc<dyn Clock>,
        settings: PersistenceSettings,
        event_rx: mpsc::Receiver<PollResult>,
        command_rx: mpsc::Receiver<StorageCommand>,
    ) -> Self {
        Self {
            backend,
            csv,
            book,
            clock,
            settings,
            buffer: VecDeque::new(),
            last_seen: HashMap::new(),
            event_rx,
            command_rx,
            stats: StorageStats::default(),
        }
    }

    /// Pick up where a previous run stopped: open aggregates and last timestamps
    async fn restore(&mut self) {
        match self.backend.load_open_aggregates().await {
            Ok(records) => {
                if !records.is_empty() {
                    info!("resuming {} open daily aggregates", records.len());
                }
                self.book.restore(records);
            }
            Err(e) => error!("failed to load open aggregates: {}", e),
        }

        match self.backend.last_timestamps().await {
            Ok(last) => self.last_seen = last,
            Err(e) => error!("failed to load last reading timestamps: {}", e),
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting storage actor");

        self.restore().await;

        let has_retention = self.settings.retention_days.is_some();
        if has_retention {
            debug!("running initial retention cleanup on startup");
            self.run_cleanup().await;
        }

        let mut flush_ticker = interval_at(
            Instant::now() + self.settings.flush_interval,
            self.settings.flush_interval,
        );
        flush_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut cleanup_ticker = interval_at(
            Instant::now() + self.settings.cleanup_interval,
            self.settings.cleanup_interval,
        );
        cleanup_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    let Some(result) = event else {
                        debug!("event channel closed, shutting down");
                        break;
                    };
                    self.handle_result(result);
                }

                _ = flush_ticker.tick() => {
                    trace!("time-based flush triggered ({} readings)", self.buffer.len());
                    if let Err(e) = self.flush().await {
                        error!("failed to flush readings: {}", e);
                    }
                }

                _ = cleanup_ticker.tick(), if has_retention => {
                    debug!("retention cleanup triggered");
                    self.run_cleanup().await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    self.handle_command(cmd).await;
                }
            }
        }

        if !self.buffer.is_empty() {
            debug!("final flush before shutdown ({} readings)", self.buffer.len());
            if let Err(e) = self.flush().await {
                error!("final flush failed, {} readings lost: {}", self.buffer.len(), e);
            }
        }

        debug!("closing backend");
        if let Err(e) = self.backend.close().await {
            error!("error closing backend: {}", e);
        }

        debug!("storage actor stopped");
    }

    fn handle_result(&mut self, result: PollResult) {
        let Some(reading) = result.reading().cloned() else {
            return;
        };

        if let Some(&last) = self.last_seen.get(&reading.meter_id) {
            if reading.timestamp == last {
                trace!("duplicate reading for meter {} at {}", reading.meter_id, last);
                self.stats.duplicates += 1;
                return;
            }
            if reading.timestamp < last {
                let err = StorageError::OutOfOrder {
                    meter_id: reading.meter_id,
                    timestamp: reading.timestamp,
                    last,
                };
                warn!("rejecting reading: {}", err);
                self.stats.rejected_out_of_order += 1;
                return;
            }
        }
        self.last_seen.insert(reading.meter_id, reading.timestamp);
        self.stats.readings_received += 1;

        match self.csv.append(&reading) {
            Ok(written) => self.stats.csv_rows_written += written as u64,
            Err(e) => warn!(
                "failed to write CSV row ({} pending): {}",
                self.csv.pending_rows(),
                e
            ),
        }

        if push_bounded(&mut self.buffer, reading, MAX_BUFFERED_READINGS).is_some() {
            warn!("reading buffer full, dropping oldest reading");
        }
    }

    /// Write the buffered readings and their aggregates in one transaction
    async fn flush(&mut self) -> Result<FlushSummary, StorageError> {
        if self.buffer.is_empty() {
            return Ok(FlushSummary::default());
        }

        let staged = self.book.stage(self.buffer.make_contiguous());
        let aggregates = staged.records();
        let rows: Vec<ReadingRow> = self
            .buffer
            .iter()
            .map(|reading| ReadingRow::from_reading(reading))
            .collect();

        let summary = FlushSummary {
            readings: rows.len(),
            aggregates: aggregates.len(),
        };
        debug!(
            "flushing {} readings and {} aggregates",
            summary.readings, summary.aggregates
        );

        if let Err(e) = self.backend.persist(rows, aggregates).await {
            self.stats.failed_flushes += 1;
            return Err(e);
        }

        self.book.commit(staged);
        self.buffer.clear();

        self.stats.flush_count += 1;
        self.stats.readings_flushed += summary.readings as u64;
        self.stats.last_flush_time = Some(self.clock.now());
        trace!("flush #{} complete", self.stats.flush_count);

        Ok(summary)
    }

    async fn run_cleanup(&mut self) {
        let Some(retention_days) = self.settings.retention_days else {
            return;
        };
        let cutoff = self.clock.now() - chrono::Duration::days(i64::from(retention_days));

        debug!("running retention cleanup (deleting readings before {})", cutoff);

        match self.backend.cleanup_old_readings(cutoff).await {
            Ok(deleted) => {
                if deleted > 0 {
                    info!("retention cleanup complete: deleted {} old readings", deleted);
                }
                self.stats.total_readings_deleted += deleted as u64;
            }
            Err(e) => {
                error!("failed to clean up old readings: {}", e);
            }
        }
        self.stats.last_cleanup_time = Some(self.clock.now());
    }

    async fn handle_command(&mut self, cmd: StorageCommand) {
        match cmd {
            StorageCommand::Flush { respond_to } => {
                debug!("manual flush requested");
                while let Ok(result) = self.event_rx.try_recv() {
                    self.handle_result(result);
                }
                let result = self.flush().await.map_err(Into::into);
                let _ = respond_to.send(result);
            }

            StorageCommand::GetStats { respond_to } => {
                let mut stats = self.stats.clone();
                stats.buffered = self.buffer.len();
                stats.csv_rows_pending = self.csv.pending_rows();
                let _ = respond_to.send(stats);
            }

            StorageCommand::QueryRange { query, respond_to } => {
                let result = self.backend.query_range(query).await.map_err(Into::into);
                let _ = respond_to.send(result);
            }

            StorageCommand::QueryLatest {
                meter_id,
                limit,
                respond_to,
            } => {
                let result = self
                    .backend
                    .query_latest(meter_id, limit)
                    .await
                    .map_err(Into::into);
                let _ = respond_to.send(result);
            }

            StorageCommand::QueryAggregates {
                meter_id,
                from,
                to,
                respond_to,
            } => {
                let result = self
                    .backend
                    .query_aggregates(meter_id, from, to)
                    .await
                    .map_err(Into::into);
                let _ = respond_to.send(result);
            }

            StorageCommand::HealthCheck { respond_to } => {
                let result = self.backend.health_check().await.map_err(Into::into);
                let _ = respond_to.send(result);
            }
        }
    }
}

/// Handle for controlling the StorageActor
#[derive(Clone)]
pub struct StorageHandle {
    sender: mpsc::Sender<StorageCommand>,
    aggregates_rx: watch::Receiver<Arc<AggregateSnapshot>>,
}

impl StorageHandle {
    pub fn spawn(
        backend: Arc<dyn StorageBackend>,
        csv: ShortHorizonWriter,
        clock: Arc<dyn Clock>,
        settings: PersistenceSettings,
        event_rx: mpsc::Receiver<PollResult>,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let book = AggregateBook::new(settings.utc_offset_minutes);
        let aggregates_rx = book.subscribe();

        let actor = StorageActor::new(backend, csv, book, clock, settings, event_rx, cmd_rx);
        let task = tokio::spawn(actor.run());

        (
            Self {
                sender: cmd_tx,
                aggregates_rx,
            },
            task,
        )
    }

    /// Flush everything received so far to the long-horizon backend
    pub async fn flush(&self) -> Result<FlushSummary> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(StorageCommand::Flush { respond_to: tx })
            .await
            .context("failed to send Flush command")?;
        rx.await.context("storage actor dropped Flush response")?
    }

    pub async fn get_stats(&self) -> Result<StorageStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(StorageCommand::GetStats { respond_to: tx })
            .await
            .context("failed to send GetStats command")?;
        rx.await.context("storage actor dropped GetStats response")
    }

    pub async fn query_range(&self, query: QueryRange) -> Result<Vec<ReadingRow>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(StorageCommand::QueryRange {
                query,
                respond_to: tx,
            })
            .await
            .context("failed to send QueryRange command")?;
        rx.await.context("storage actor dropped QueryRange response")?
    }

    pub async fn query_latest(&self, meter_id: u32, limit: usize) -> Result<Vec<ReadingRow>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(StorageCommand::QueryLatest {
                meter_id,
                limit,
                respond_to: tx,
            })
            .await
            .context("failed to send QueryLatest command")?;
        rx.await.context("storage actor dropped QueryLatest response")?
    }

    pub async fn query_aggregates(
        &self,
        meter_id: u32,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AggregateRecord>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(StorageCommand::QueryAggregates {
                meter_id,
                from,
                to,
                respond_to: tx,
            })
            .await
            .context("failed to send QueryAggregates command")?;
        rx.await.context("storage actor dropped QueryAggregates response")?
    }

    pub async fn health_check(&self) -> Result<HealthStatus> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(StorageCommand::HealthCheck { respond_to: tx })
            .await
            .context("failed to send HealthCheck command")?;
        rx.await.context("storage actor dropped HealthCheck response")?
    }

    /// Current daily aggregates (open and last finalized per meter)
    pub fn aggregates(&self) -> Arc<AggregateSnapshot> {
        self.aggregates_rx.borrow().clone()
    }

    pub fn subscribe_aggregates(&self) -> watch::Receiver<Arc<AggregateSnapshot>> {
        self.aggregates_rx.clone()
    }
}

/// Append to a queue holding at most `cap` items; returns the evicted oldest
fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, cap: usize) -> Option<T> {
    let evicted = if queue.len() >= cap { queue.pop_front() } else { None };
    queue.push_back(item);
    evicted
}

//! Message types for actor communication
//!
//! ## Design Principles
//!
//! 1. **Events**: `PollResult` and `Anomaly` values flow downstream through
//!    bounded mpsc queues, so a slow consumer slows the poller instead of
//!    losing data
//! 2. **Commands**: Request/response messages sent to one actor via mpsc,
//!    answered on a oneshot channel
//! 3. **Snapshots**: State that outside readers need (latest poll results,
//!    daily aggregates) is published through `watch` as immutable `Arc`s

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::alerts::suppression::KeyState;
use crate::detector::AlertKey;
use crate::storage::{AggregateRecord, HealthStatus, QueryRange, ReadingRow};
use crate::PollResult;

/// Commands that can be sent to the PollerActor
#[derive(Debug)]
pub enum PollerCommand {
    /// Run one round immediately (bypassing the interval timer)
    PollNow {
        respond_to: oneshot::Sender<Vec<PollResult>>,
    },

    /// Change the polling interval; the next round runs one new interval from now
    UpdateInterval { interval_secs: u64 },

    GetStats {
        respond_to: oneshot::Sender<PollerStats>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MeterStats {
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Poller statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollerStats {
    /// Completed poll rounds
    pub rounds: u64,

    pub meters: BTreeMap<u32, MeterStats>,
}

/// Result of a long-horizon flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub readings: usize,
    pub aggregates: usize,
}

/// Commands that can be sent to the StorageActor
#[derive(Debug)]
pub enum StorageCommand {
    /// Take in every reading already queued, then flush to the backend
    Flush {
        respond_to: oneshot::Sender<anyhow::Result<FlushSummary>>,
    },

    GetStats {
        respond_to: oneshot::Sender<StorageStats>,
    },

    QueryRange {
        query: QueryRange,
        respond_to: oneshot::Sender<anyhow::Result<Vec<ReadingRow>>>,
    },

    QueryLatest {
        meter_id: u32,
        limit: usize,
        respond_to: oneshot::Sender<anyhow::Result<Vec<ReadingRow>>>,
    },

    /// Daily aggregates of a meter for days in `[from, to]`
    QueryAggregates {
        meter_id: u32,
        from: NaiveDate,
        to: NaiveDate,
        respond_to: oneshot::Sender<anyhow::Result<Vec<AggregateRecord>>>,
    },

    HealthCheck {
        respond_to: oneshot::Sender<anyhow::Result<HealthStatus>>,
    },
}

/// Storage statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageStats {
    /// Readings accepted into both writers
    pub readings_received: u64,

    /// Readings with the same timestamp as the previous one of their meter
    pub duplicates: u64,

    /// Readings older than the previous one of their meter
    pub rejected_out_of_order: u64,

    pub csv_rows_written: u64,
    pub csv_rows_pending: usize,

    /// Readings waiting for the next long-horizon flush
    pub buffered: usize,

    pub readings_flushed: u64,
    pub flush_count: u64,
    pub failed_flushes: u64,
    pub last_flush_time: Option<DateTime<Utc>>,

    pub last_cleanup_time: Option<DateTime<Utc>>,
    pub total_readings_deleted: u64,
}

/// Commands that can be sent to the DetectorActor
#[derive(Debug)]
pub enum DetectorCommand {
    /// Current run of failed polls for a meter
    ConsecutiveFailures {
        meter_id: u32,
        respond_to: oneshot::Sender<u32>,
    },
}

/// Commands that can be sent to the DispatcherActor
#[derive(Debug)]
pub enum DispatcherCommand {
    /// Suppression state of one alert key
    GetState {
        key: AlertKey,
        respond_to: oneshot::Sender<KeyState>,
    },

    /// Drop incoming anomalies for a duration (maintenance windows)
    Mute { duration_secs: u64 },

    Unmute,

    GetStats {
        respond_to: oneshot::Sender<DispatcherStats>,
    },

    /// Send the readings digest now instead of waiting for its timer
    SendDigestNow {
        respond_to: oneshot::Sender<anyhow::Result<()>>,
    },
}

/// Dispatcher statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatcherStats {
    /// Anomalies received from the detector
    pub received: u64,

    /// Anomalies that went out in a message
    pub alerts_sent: u64,

    pub messages_sent: u64,
    pub digests_sent: u64,
    pub suppressed: u64,
    pub duplicates: u64,

    /// Messages given up on after a terminal error or exhausted retries
    pub dropped: u64,

    /// Anomalies ignored while muted
    pub muted: u64,
}

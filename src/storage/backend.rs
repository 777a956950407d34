//! Storage backend trait definition
//!
//! This module defines the `StorageBackend` trait implemented by the
//! long-horizon stores.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::aggregate::AggregateRecord;
use super::error::StorageResult;
use super::schema::ReadingRow;

/// Query parameters for fetching readings within a time range
#[derive(Debug, Clone)]
pub struct QueryRange {
    pub meter_id: u32,

    /// Start of time range (inclusive)
    pub start: DateTime<Utc>,

    /// End of time range (inclusive)
    pub end: DateTime<Utc>,

    /// Maximum number of results to return
    pub limit: Option<usize>,
}

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Trait for long-horizon storage backends
///
/// Implementations must be `Send + Sync`; the storage task holds them behind
/// an `Arc` and query handlers may run concurrently with flushes.
///
/// Readings are keyed by `(meter_id, timestamp)` and aggregates by
/// `(meter_id, day, parameter)`. Writing the same key twice replaces the
/// earlier row, so a retried flush is harmless.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Insert readings and upsert aggregates in one transaction
    ///
    /// This is what a flush calls: either both become visible or neither.
    async fn persist(
        &self,
        rows: Vec<ReadingRow>,
        aggregates: Vec<AggregateRecord>,
    ) -> StorageResult<()>;

    /// Readings of one meter between start and end, oldest first
    async fn query_range(&self, query: QueryRange) -> StorageResult<Vec<ReadingRow>>;

    /// The `limit` most recent readings of a meter, oldest first
    async fn query_latest(&self, meter_id: u32, limit: usize) -> StorageResult<Vec<ReadingRow>>;

    /// Daily aggregates of one meter for days in `[from, to]`
    async fn query_aggregates(
        &self,
        meter_id: u32,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StorageResult<Vec<AggregateRecord>>;

    /// Aggregates that were not finalized yet, at most one per meter
    async fn load_open_aggregates(&self) -> StorageResult<Vec<AggregateRecord>>;

    /// Newest stored timestamp per meter
    async fn last_timestamps(&self) -> StorageResult<HashMap<u32, DateTime<Utc>>>;

    /// Delete readings older than `before`, returning the number deleted
    async fn cleanup_old_readings(&self, before: DateTime<Utc>) -> StorageResult<usize>;

    /// Lightweight check that the backend is operational
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Human-readable statistics (e.g. "SQLite: 1200 readings, ...")
    async fn get_stats(&self) -> StorageResult<String>;

    async fn close(&self) -> StorageResult<()>;
}

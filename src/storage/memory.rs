//! In-memory storage backend (no persistence)
//!
//! Used when no long-horizon backend is configured, and by tests that do not
//! need a database. All data is lost on restart.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::aggregate::AggregateRecord;
use super::backend::{HealthStatus, QueryRange, StorageBackend};
use super::error::StorageResult;
use super::schema::ReadingRow;

#[derive(Default)]
struct Tables {
    readings: HashMap<u32, BTreeMap<DateTime<Utc>, ReadingRow>>,
    aggregates: BTreeMap<(u32, NaiveDate), AggregateRecord>,
}

impl Tables {
    fn insert_readings(&mut self, rows: Vec<ReadingRow>) {
        for row in rows {
            self.readings
                .entry(row.meter_id)
                .or_default()
                .insert(row.timestamp, row);
        }
    }

    fn upsert_aggregates(&mut self, aggregates: Vec<AggregateRecord>) {
        for record in aggregates {
            self.aggregates.insert((record.meter_id, record.day), record);
        }
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn persist(
        &self,
        rows: Vec<ReadingRow>,
        aggregates: Vec<AggregateRecord>,
    ) -> StorageResult<()> {
        debug!(
            "in-memory backend: persisting {} readings, {} aggregates",
            rows.len(),
            aggregates.len()
        );
        let mut tables = self.tables.write().await;
        tables.insert_readings(rows);
        tables.upsert_aggregates(aggregates);
        Ok(())
    }

    async fn query_range(&self, query: QueryRange) -> StorageResult<Vec<ReadingRow>> {
        let tables = self.tables.read().await;
        let rows = tables
            .readings
            .get(&query.meter_id)
            .map(|rows| {
                rows.range(query.start..=query.end)
                    .map(|(_, row)| row.clone())
                    .take(query.limit.unwrap_or(usize::MAX))
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }

    async fn query_latest(&self, meter_id: u32, limit: usize) -> StorageResult<Vec<ReadingRow>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<ReadingRow> = tables
            .readings
            .get(&meter_id)
            .map(|rows| rows.values().rev().take(limit).cloned().collect())
            .unwrap_or_default();
        rows.reverse();
        Ok(rows)
    }

    async fn query_aggregates(
        &self,
        meter_id: u32,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StorageResult<Vec<AggregateRecord>> {
        if from > to {
            return Ok(Vec::new());
        }
        let tables = self.tables.read().await;
        Ok(tables
            .aggregates
            .range((meter_id, from)..=(meter_id, to))
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn load_open_aggregates(&self) -> StorageResult<Vec<AggregateRecord>> {
        let tables = self.tables.read().await;
        let mut open: HashMap<u32, AggregateRecord> = HashMap::new();
        for record in tables.aggregates.values().filter(|r| !r.finalized) {
            // Ordered by (meter, day), so the newest day wins
            open.insert(record.meter_id, record.clone());
        }
        Ok(open.into_values().collect())
    }

    async fn last_timestamps(&self) -> StorageResult<HashMap<u32, DateTime<Utc>>> {
        let tables = self.tables.read().await;
        Ok(tables
            .readings
            .iter()
            .filter_map(|(meter_id, rows)| rows.keys().next_back().map(|ts| (*meter_id, *ts)))
            .collect())
    }

    async fn cleanup_old_readings(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let mut tables = self.tables.write().await;
        let mut deleted = 0;
        for rows in tables.readings.values_mut() {
            let keep = rows.split_off(&before);
            deleted += rows.len();
            *rows = keep;
        }
        debug!("in-memory backend: deleted {} readings before {}", deleted, before);
        Ok(deleted)
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let tables = self.tables.read().await;
        let total: usize = tables.readings.values().map(BTreeMap::len).sum();
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("total_readings".to_string(), total.to_string()),
            ]),
        })
    }

    async fn get_stats(&self) -> StorageResult<String> {
        let tables = self.tables.read().await;
        let total: usize = tables.readings.values().map(BTreeMap::len).sum();
        Ok(format!(
            "In-Memory: {} readings across {} meters, {} daily aggregates",
            total,
            tables.readings.len(),
            tables.aggregates.len()
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}

//! SQLite storage backend implementation
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers are not blocked while a flush is writing
//! - **Connection pooling**: Queries from handles run beside the storage task
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! Timestamps are stored as Unix milliseconds, days as `YYYY-MM-DD` text.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite, SqliteConnection};
use tracing::{debug, info, instrument, warn};

use super::aggregate::{AggregateRecord, ParameterStats};
use super::backend::{HealthStatus, QueryRange, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::ReadingRow;

const DAY_FORMAT: &str = "%Y-%m-%d";

const READING_COLUMNS: &str =
    "meter_id, timestamp, voltage, current_total, power_total, frequency, parameters";

const AGGREGATE_COLUMNS: &str =
    "meter_id, day, parameter, min, max, sum_milli, count, sample_count, finalized";

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database and run migrations
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn millis_to_timestamp(millis: i64) -> StorageResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis).ok_or_else(|| {
            StorageError::SerializationError(format!("timestamp out of range: {millis}"))
        })
    }

    fn reading_from_row(row: &SqliteRow) -> StorageResult<ReadingRow> {
        let parameters: String = row.get("parameters");
        let values = serde_json::from_str(&parameters).map_err(|e| {
            StorageError::SerializationError(format!("failed to deserialize parameters: {e}"))
        })?;

        Ok(ReadingRow {
            meter_id: row.get::<i64, _>("meter_id") as u32,
            timestamp: Self::millis_to_timestamp(row.get("timestamp"))?,
            voltage: row.get("voltage"),
            current: row.get("current_total"),
            power: row.get("power_total"),
            frequency: row.get("frequency"),
            values,
        })
    }

    /// Fold per-parameter rows back into records, keyed by (meter, day)
    fn aggregates_from_rows(
        rows: Vec<SqliteRow>,
    ) -> StorageResult<BTreeMap<(u32, NaiveDate), AggregateRecord>> {
        let mut records: BTreeMap<(u32, NaiveDate), AggregateRecord> = BTreeMap::new();

        for row in rows {
            let meter_id = row.get::<i64, _>("meter_id") as u32;
            let day_str: String = row.get("day");
            let day = NaiveDate::parse_from_str(&day_str, DAY_FORMAT).map_err(|e| {
                StorageError::SerializationError(format!("invalid day '{day_str}': {e}"))
            })?;

            let record = records
                .entry((meter_id, day))
                .or_insert_with(|| AggregateRecord::new(meter_id, day));
            record.sample_count = row.get::<i64, _>("sample_count") as u64;
            record.finalized = row.get::<i64, _>("finalized") != 0;
            record.parameters.insert(
                row.get("parameter"),
                ParameterStats {
                    min: row.get("min"),
                    max: row.get("max"),
                    sum_milli: row.get("sum_milli"),
                    count: row.get::<i64, _>("count") as u64,
                },
            );
        }

        Ok(records)
    }

    async fn write_readings(conn: &mut SqliteConnection, rows: &[ReadingRow]) -> StorageResult<()> {
        for reading in rows {
            let parameters = serde_json::to_string(&reading.values).map_err(|e| {
                StorageError::SerializationError(format!("failed to serialize parameters: {e}"))
            })?;

            sqlx::query(
                r#"
                INSERT INTO meter_readings (
                    meter_id, timestamp, voltage, current_total, power_total, frequency,
                    parameters
                )
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (meter_id, timestamp) DO UPDATE SET
                    voltage = excluded.voltage,
                    current_total = excluded.current_total,
                    power_total = excluded.power_total,
                    frequency = excluded.frequency,
                    parameters = excluded.parameters
                "#,
            )
            .bind(reading.meter_id as i64)
            .bind(reading.timestamp.timestamp_millis())
            .bind(reading.voltage)
            .bind(reading.current)
            .bind(reading.power)
            .bind(reading.frequency)
            .bind(parameters)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    async fn write_aggregates(
        conn: &mut SqliteConnection,
        aggregates: &[AggregateRecord],
    ) -> StorageResult<()> {
        for record in aggregates {
            let day = record.day.format(DAY_FORMAT).to_string();
            for (parameter, stats) in &record.parameters {
                sqlx::query(
                    r#"
                    INSERT INTO daily_aggregates (
                        meter_id, day, parameter, min, max, avg, sum_milli, count,
                        sample_count, finalized
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT (meter_id, day, parameter) DO UPDATE SET
                        min = excluded.min,
                        max = excluded.max,
                        avg = excluded.avg,
                        sum_milli = excluded.sum_milli,
                        count = excluded.count,
                        sample_count = excluded.sample_count,
                        finalized = excluded.finalized
                    "#,
                )
                .bind(record.meter_id as i64)
                .bind(&day)
                .bind(parameter)
                .bind(stats.min)
                .bind(stats.max)
                .bind(stats.avg())
                .bind(stats.sum_milli)
                .bind(stats.count as i64)
                .bind(record.sample_count as i64)
                .bind(record.finalized as i64)
                .execute(&mut *conn)
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self, rows, aggregates), fields(readings = rows.len(), aggregates = aggregates.len()))]
    async fn persist(
        &self,
        rows: Vec<ReadingRow>,
        aggregates: Vec<AggregateRecord>,
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::write_readings(&mut tx, &rows).await?;
        Self::write_aggregates(&mut tx, &aggregates).await?;
        tx.commit().await?;

        debug!("flush committed");
        Ok(())
    }

    #[instrument(skip(self), fields(meter_id = query.meter_id))]
    async fn query_range(&self, query: QueryRange) -> StorageResult<Vec<ReadingRow>> {
        let limit_clause = query
            .limit
            .map(|l| format!("LIMIT {l}"))
            .unwrap_or_default();

        let sql = format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM meter_readings
            WHERE meter_id = ? AND timestamp >= ? AND timestamp <= ?
            ORDER BY timestamp ASC
            {limit_clause}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(query.meter_id as i64)
            .bind(query.start.timestamp_millis())
            .bind(query.end.timestamp_millis())
            .fetch_all(&self.pool)
            .await?;

        let results = rows
            .iter()
            .map(Self::reading_from_row)
            .collect::<StorageResult<Vec<_>>>()?;
        debug!("query returned {} readings", results.len());
        Ok(results)
    }

    #[instrument(skip(self))]
    async fn query_latest(&self, meter_id: u32, limit: usize) -> StorageResult<Vec<ReadingRow>> {
        let sql = format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM meter_readings
            WHERE meter_id = ?
            ORDER BY timestamp DESC
            LIMIT ?
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(meter_id as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut results = rows
            .iter()
            .map(Self::reading_from_row)
            .collect::<StorageResult<Vec<_>>>()?;
        // Oldest first
        results.reverse();
        Ok(results)
    }

    #[instrument(skip(self))]
    async fn query_aggregates(
        &self,
        meter_id: u32,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StorageResult<Vec<AggregateRecord>> {
        let sql = format!(
            r#"
            SELECT {AGGREGATE_COLUMNS}
            FROM daily_aggregates
            WHERE meter_id = ? AND day >= ? AND day <= ?
            ORDER BY day ASC, parameter ASC
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(meter_id as i64)
            .bind(from.format(DAY_FORMAT).to_string())
            .bind(to.format(DAY_FORMAT).to_string())
            .fetch_all(&self.pool)
            .await?;

        Ok(Self::aggregates_from_rows(rows)?.into_values().collect())
    }

    #[instrument(skip(self))]
    async fn load_open_aggregates(&self) -> StorageResult<Vec<AggregateRecord>> {
        let sql = format!(
            "SELECT {AGGREGATE_COLUMNS} FROM daily_aggregates WHERE finalized = 0 ORDER BY meter_id, day"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut open: HashMap<u32, AggregateRecord> = HashMap::new();
        for ((meter_id, _), record) in Self::aggregates_from_rows(rows)? {
            open.insert(meter_id, record);
        }
        debug!("loaded {} open aggregates", open.len());
        Ok(open.into_values().collect())
    }

    #[instrument(skip(self))]
    async fn last_timestamps(&self) -> StorageResult<HashMap<u32, DateTime<Utc>>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT meter_id, MAX(timestamp) FROM meter_readings GROUP BY meter_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(meter_id, millis)| Ok((meter_id as u32, Self::millis_to_timestamp(millis)?)))
            .collect()
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn cleanup_old_readings(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        info!("cleaning up readings older than {}", before);

        let result = sqlx::query("DELETE FROM meter_readings WHERE timestamp < ?")
            .bind(before.timestamp_millis())
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() as usize;
        info!("deleted {} old readings", deleted);

        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => Ok(HealthStatus {
                healthy: true,
                message: "SQLite backend operational".to_string(),
                metadata: HashMap::from([
                    ("backend".to_string(), "sqlite".to_string()),
                    ("db_path".to_string(), self.db_path.clone()),
                ]),
            }),
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {e}"),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_stats(&self) -> StorageResult<String> {
        let (total_rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM meter_readings")
            .fetch_one(&self.pool)
            .await?;

        let (aggregate_days,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM (SELECT DISTINCT meter_id, day FROM daily_aggregates)",
        )
        .fetch_one(&self.pool)
        .await?;

        let (oldest, newest): (Option<i64>, Option<i64>) =
            sqlx::query_as("SELECT MIN(timestamp), MAX(timestamp) FROM meter_readings")
                .fetch_one(&self.pool)
                .await?;

        let file_size = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let file_size_mb = file_size as f64 / 1_000_000.0;

        let time_range = match (oldest, newest) {
            (Some(old), Some(new)) => format!(
                "{} to {}",
                Self::millis_to_timestamp(old)?.format(DAY_FORMAT),
                Self::millis_to_timestamp(new)?.format(DAY_FORMAT)
            ),
            _ => "no data".to_string(),
        };

        Ok(format!(
            "SQLite: {total_rows} readings, {aggregate_days} meter-days aggregated, {file_size_mb:.2} MB on disk, time range: {time_range}"
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}

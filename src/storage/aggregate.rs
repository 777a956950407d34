//! Daily per-meter aggregates
//!
//! Sums are accumulated in integer milli-units so the result does not depend
//! on the order in which readings arrive.
//!
//! The [`AggregateBook`] is owned by the storage task and is the only writer.
//! Readers get an immutable [`AggregateSnapshot`] through a `watch` channel;
//! every update replaces the whole snapshot at once.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::Reading;
use crate::util::local_day;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterStats {
    pub min: f64,
    pub max: f64,
    pub sum_milli: i64,
    pub count: u64,
}

fn to_milli(value: f64) -> i64 {
    (value * 1000.0).round() as i64
}

impl ParameterStats {
    pub fn new(value: f64) -> Self {
        Self {
            min: value,
            max: value,
            sum_milli: to_milli(value),
            count: 1,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum_milli += to_milli(value);
        self.count += 1;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum_milli as f64 / 1000.0 / self.count as f64
    }
}

/// Aggregate of one meter over one calendar day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub meter_id: u32,
    pub day: NaiveDate,
    pub sample_count: u64,
    pub parameters: BTreeMap<String, ParameterStats>,
    pub finalized: bool,
}

impl AggregateRecord {
    pub fn new(meter_id: u32, day: NaiveDate) -> Self {
        Self {
            meter_id,
            day,
            sample_count: 0,
            parameters: BTreeMap::new(),
            finalized: false,
        }
    }

    pub fn push(&mut self, reading: &Reading) {
        for (name, &value) in &reading.values {
            self.parameters
                .entry(name.clone())
                .and_modify(|stats| stats.push(value))
                .or_insert_with(|| ParameterStats::new(value));
        }
        self.sample_count += 1;
    }

    /// Build a record from a whole day of readings
    pub fn from_readings<'a>(
        meter_id: u32,
        day: NaiveDate,
        readings: impl IntoIterator<Item = &'a Reading>,
    ) -> Self {
        let mut record = Self::new(meter_id, day);
        for reading in readings {
            record.push(reading);
        }
        record
    }
}

/// Published view: today's open records and the last finalized day per meter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateSnapshot {
    pub open: BTreeMap<u32, AggregateRecord>,
    pub finalized: BTreeMap<u32, AggregateRecord>,
}

/// Aggregates prepared from a batch but not yet committed
#[derive(Debug, Clone, Default)]
pub struct StagedAggregates {
    open: HashMap<u32, AggregateRecord>,
    finalized: Vec<AggregateRecord>,
}

impl StagedAggregates {
    /// Records to persist: everything finalized plus every open record touched
    pub fn records(&self) -> Vec<AggregateRecord> {
        let mut records = self.finalized.clone();
        records.extend(self.open.values().cloned());
        records
    }
}

pub struct AggregateBook {
    open: HashMap<u32, AggregateRecord>,
    finalized: BTreeMap<u32, AggregateRecord>,
    utc_offset_minutes: i32,
    snapshot_tx: watch::Sender<Arc<AggregateSnapshot>>,
}

impl AggregateBook {
    pub fn new(utc_offset_minutes: i32) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(AggregateSnapshot::default()));
        Self {
            open: HashMap::new(),
            finalized: BTreeMap::new(),
            utc_offset_minutes,
            snapshot_tx,
        }
    }

    /// Resume records that were still open when the process stopped
    pub fn restore(&mut self, records: Vec<AggregateRecord>) {
        for record in records {
            if record.finalized {
                continue;
            }
            debug!("resuming aggregate for meter {} on {}", record.meter_id, record.day);
            self.open.insert(record.meter_id, record);
        }
        self.publish();
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<AggregateSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> Arc<AggregateSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Fold `readings` into copies of the affected records
    ///
    /// Readings must be in timestamp order per meter. A reading on a later day
    /// finalizes the meter's open record; the latest day seen in the batch also
    /// finalizes records of meters that produced nothing that day.
    pub fn stage(&self, readings: &[Arc<Reading>]) -> StagedAggregates {
        let mut staged = StagedAggregates::default();
        let mut latest_day: Option<NaiveDate> = None;

        for reading in readings {
            let day = local_day(reading.timestamp, self.utc_offset_minutes);
            latest_day = latest_day.max(Some(day));

            let record = match staged.open.get_mut(&reading.meter_id) {
                Some(record) => record,
                None => {
                    let current = self
                        .open
                        .get(&reading.meter_id)
                        .cloned()
                        .unwrap_or_else(|| AggregateRecord::new(reading.meter_id, day));
                    staged.open.entry(reading.meter_id).or_insert(current)
                }
            };

            if record.day < day {
                let mut done = std::mem::replace(record, AggregateRecord::new(reading.meter_id, day));
                done.finalized = true;
                staged.finalized.push(done);
            }
            if record.day == day {
                record.push(reading);
            }
        }

        if let Some(today) = latest_day {
            for (meter_id, record) in &self.open {
                if record.day < today && !staged.open.contains_key(meter_id) {
                    let mut done = record.clone();
                    done.finalized = true;
                    staged.finalized.push(done);
                }
            }
        }

        staged
    }

    /// Make staged records current and publish a new snapshot
    pub fn commit(&mut self, staged: StagedAggregates) {
        for record in staged.finalized {
            let closes_open = self
                .open
                .get(&record.meter_id)
                .is_some_and(|open| open.day == record.day);
            if closes_open {
                self.open.remove(&record.meter_id);
            }
            self.finalized.insert(record.meter_id, record);
        }
        for (meter_id, record) in staged.open {
            self.open.insert(meter_id, record);
        }
        self.publish();
    }

    fn publish(&self) {
        let snapshot = AggregateSnapshot {
            open: self
                .open
                .iter()
                .map(|(id, record)| (*id, record.clone()))
                .collect(),
            finalized: self.finalized.clone(),
        };
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}

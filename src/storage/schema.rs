//! Row types for the long-horizon store
//!
//! Readings are stored in a **hybrid** layout: a few quantities that charts
//! query all the time get their own columns, the complete parameter map is
//! kept as JSON. Meter types with different register maps share one table
//! that way, and a new parameter needs no migration.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Reading;

/// One stored reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingRow {
    pub meter_id: u32,
    pub timestamp: DateTime<Utc>,

    // === Frequently queried (columns) ===
    /// Average line-neutral voltage (single-phase meters: their voltage)
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub frequency: Option<f64>,

    // === Everything (JSON) ===
    pub values: BTreeMap<String, f64>,
}

impl ReadingRow {
    pub fn from_reading(reading: &Reading) -> Self {
        let first = |names: &[&str]| names.iter().find_map(|name| reading.get(name));

        Self {
            meter_id: reading.meter_id,
            timestamp: reading.timestamp,
            voltage: first(&["vln_avg", "voltage"]),
            current: first(&["current_total", "current"]),
            power: first(&["watts_total", "active_power"]),
            frequency: first(&["frequency"]),
            values: reading.values.clone(),
        }
    }

    pub fn into_reading(self) -> Reading {
        Reading {
            meter_id: self.meter_id,
            timestamp: self.timestamp,
            values: self.values,
        }
    }
}

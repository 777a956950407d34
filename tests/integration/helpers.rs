//! Helper functions for integration tests

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use substation_monitor::config::Config;
use substation_monitor::link::{Transport, frame};
use substation_monitor::register_map::MeterType;
use substation_monitor::util::Clock;

#[derive(Default)]
struct BusState {
    meters: HashMap<u8, (MeterType, BTreeMap<String, f64>)>,
    silent: HashSet<u8>,
}

/// In-process stand-in for the serial bus
///
/// Cloned handles share the state, so a test can change what a meter reports
/// while the poller owns the transport.
#[derive(Clone, Default)]
pub struct BusSimulator {
    state: Arc<Mutex<BusState>>,
}

impl BusSimulator {
    pub fn with_meter(self, address: u8, meter_type: MeterType, values: BTreeMap<String, f64>) -> Self {
        self.state
            .lock()
            .unwrap()
            .meters
            .insert(address, (meter_type, values));
        self
    }

    pub fn set_value(&self, address: u8, parameter: &str, value: f64) {
        let mut state = self.state.lock().unwrap();
        if let Some((_, values)) = state.meters.get_mut(&address) {
            values.insert(parameter.to_string(), value);
        }
    }

    /// Stop answering requests for `address`
    pub fn silence(&self, address: u8) {
        self.state.lock().unwrap().silent.insert(address);
    }

    pub fn revive(&self, address: u8) {
        self.state.lock().unwrap().silent.remove(&address);
    }
}

#[async_trait]
impl Transport for BusSimulator {
    async fn transact(&mut self, request: &[u8]) -> io::Result<Vec<u8>> {
        let address = request[0];
        let state = self.state.lock().unwrap();
        if state.silent.contains(&address) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no answer"));
        }
        match state.meters.get(&address) {
            Some((meter_type, values)) => {
                Ok(frame::build_read_response(address, &meter_type.encode(values)))
            }
            None => Err(io::Error::new(io::ErrorKind::TimedOut, "no such meter")),
        }
    }
}

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, secs: i64) {
        *self.now.lock().unwrap() += Duration::seconds(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub fn start_of_day() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
}

/// Healthy three-phase values
pub fn dmf_values() -> BTreeMap<String, f64> {
    let mut values = BTreeMap::new();
    for (name, value) in [
        ("v_ry", 400.0),
        ("v_yb", 401.0),
        ("v_br", 399.0),
        ("vll_avg", 400.0),
        ("v_r", 231.0),
        ("v_y", 230.0),
        ("v_b", 232.0),
        ("vln_avg", 231.0),
        ("current_r", 10.0),
        ("current_y", 11.0),
        ("current_b", 9.0),
        ("current_total", 30.0),
        ("watts_total", 6500.0),
        ("va_total", 7000.0),
        ("var_total", 1200.0),
        ("frequency", 50.0),
        ("pf_avg_import", 0.95),
        ("wh_import", 125000.0),
    ] {
        values.insert(name.to_string(), value);
    }
    values
}

/// Config for `meter_count` three-phase meters at addresses `1..=meter_count`
///
/// The poll interval is long enough that only `poll_now` drives the rounds.
pub fn create_test_config(csv_dir: &Path, meter_count: u32) -> serde_json::Value {
    let meters: Vec<serde_json::Value> = (1..=meter_count)
        .map(|id| {
            serde_json::json!({
                "id": id,
                "name": format!("Feeder {id}"),
                "address": id,
                "register_map": "dmf",
            })
        })
        .collect();

    serde_json::json!({
        "serial": { "port": "/dev/null" },
        "link": { "timeout_ms": 50, "retries": 1, "backoff_ms": 1 },
        "poll_interval_secs": 3600,
        "meters": meters,
        "storage": {
            "csv_dir": csv_dir,
            "long_horizon": { "backend": "none" },
            "flush_interval_secs": 3600,
        },
    })
}

pub fn parse_config(value: serde_json::Value) -> Config {
    serde_json::from_value(value).unwrap()
}

pub fn bus_with_dmf_meters(meter_count: u8) -> BusSimulator {
    (1..=meter_count).fold(BusSimulator::default(), |bus, address| {
        bus.with_meter(address, MeterType::Dmf, dmf_values())
    })
}

/// Wait until `check` holds, polling every few milliseconds
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let wait = async {
        while !check().await {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(std::time::Duration::from_secs(5), wait)
        .await
        .expect("condition not reached in time");
}

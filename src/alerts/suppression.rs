//! Per-key alert rate limiting
//!
//! ```text
//! Idle ──anomaly──▶ Fired ──anomaly within window──▶ Suppressed (count += 1)
//!   ▲                                                     │
//!   └──────────── window expires ◀───────────────────────┘
//!                 next anomaly fires again and reports the count
//! ```
//!
//! Time is taken from the anomaly timestamps, not from the wall clock, so the
//! decisions follow the reading stream. The state lives only as long as the
//! dispatcher task.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};

use crate::detector::{AlertKey, Anomaly};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Idle,
    Fired { at: DateTime<Utc> },
    Suppressed { since: DateTime<Utc>, count: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Send now; `suppressed` anomalies were swallowed since the last send
    Send { suppressed: u32 },
    /// Inside the window; counted towards the next send
    Suppress { count: u32 },
    /// Same anomaly seen before (re-delivery)
    Duplicate,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    last_sent: DateTime<Utc>,
    suppressed: u32,
}

#[derive(Debug)]
pub struct AlertDeliveryState {
    window: Duration,
    bucket_secs: u64,
    entries: HashMap<AlertKey, Entry>,
    seen: HashSet<(AlertKey, i64)>,
}

impl AlertDeliveryState {
    pub fn new(window_secs: u64, bucket_secs: u64) -> Self {
        Self {
            window: Duration::seconds(window_secs as i64),
            bucket_secs: bucket_secs.max(1),
            entries: HashMap::new(),
            seen: HashSet::new(),
        }
    }

    pub fn observe(&mut self, anomaly: &Anomaly) -> Decision {
        if !self.seen.insert(anomaly.dedup_key(self.bucket_secs)) {
            return Decision::Duplicate;
        }
        self.forget_before(anomaly.timestamp);

        let now = anomaly.timestamp;
        match self.entries.get_mut(&anomaly.key()) {
            Some(entry) if now - entry.last_sent < self.window => {
                entry.suppressed += 1;
                Decision::Suppress {
                    count: entry.suppressed,
                }
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                *entry = Entry {
                    last_sent: now,
                    suppressed: 0,
                };
                Decision::Send { suppressed }
            }
            None => {
                self.entries.insert(
                    anomaly.key(),
                    Entry {
                        last_sent: now,
                        suppressed: 0,
                    },
                );
                Decision::Send { suppressed: 0 }
            }
        }
    }

    /// State of `key` as seen at `now`
    pub fn state(&self, key: &AlertKey, now: DateTime<Utc>) -> KeyState {
        match self.entries.get(key) {
            None => KeyState::Idle,
            Some(entry) if now - entry.last_sent >= self.window => KeyState::Idle,
            Some(entry) if entry.suppressed == 0 => KeyState::Fired {
                at: entry.last_sent,
            },
            Some(entry) => KeyState::Suppressed {
                since: entry.last_sent,
                count: entry.suppressed,
            },
        }
    }

    /// Suppressed anomalies waiting to be reported for `key`
    pub fn pending_count(&self, key: &AlertKey) -> u32 {
        self.entries.get(key).map_or(0, |entry| entry.suppressed)
    }

    fn forget_before(&mut self, now: DateTime<Utc>) {
        let horizon = self.window.max(Duration::hours(1));
        let oldest_bucket = (now - horizon).timestamp().div_euclid(self.bucket_secs as i64);
        self.seen.retain(|(_, bucket)| *bucket >= oldest_bucket);
    }
}

//! Anomaly detection on poll results
//!
//! Rules, per meter and parameter:
//!
//! - **Threshold**: value outside a configured `[min, max]`.
//! - **Deviation**: value further than `k` spreads from the mean of the last
//!   `window` values (spread is the population standard deviation, floored at
//!   `min_spread`). A value is compared against the window before it enters it.
//! - **Phase imbalance** / **missing phase** / **supply loss**: composite
//!   checks over the three phase voltages and currents. Supply loss hides the
//!   other two, and a missing phase hides the imbalance it causes.
//! - **Unreachable**: raised once when a meter's consecutive link failures
//!   reach the configured count, and armed again by the next successful poll.
//!   Failures that are not about the link (clock skew, implausible values)
//!   leave the count alone.
//!
//! Rolling windows live in memory only and start empty after a restart.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::{DetectorConfig, DeviationRule, MeterConfig, ParameterRule};
use crate::{PollOutcome, PollResult, Reading};

const PHASE_VOLTAGES: [&str; 3] = ["v_r", "v_y", "v_b"];
const LINE_VOLTAGES: [&str; 3] = ["v_ry", "v_yb", "v_br"];
const PHASE_CURRENTS: [&str; 3] = ["current_r", "current_y", "current_b"];
const PHASE_LABELS: [&str; 3] = ["R", "Y", "B"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    ThresholdViolation,
    StatisticalDeviation,
    MeterUnreachable,
    PhaseImbalance,
    MissingPhase,
    SupplyLoss,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Rule::ThresholdViolation => "threshold violation",
            Rule::StatisticalDeviation => "statistical deviation",
            Rule::MeterUnreachable => "meter unreachable",
            Rule::PhaseImbalance => "phase imbalance",
            Rule::MissingPhase => "missing phase",
            Rule::SupplyLoss => "supply loss",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

/// Identity of an alert condition, used for suppression
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlertKey {
    pub meter_id: u32,
    pub parameter: String,
    pub rule: Rule,
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "meter {}/{}/{:?}", self.meter_id, self.parameter, self.rule)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub meter_id: u32,
    pub parameter: String,
    /// Offending value; `None` for conditions without one (unreachable meter)
    pub observed: Option<f64>,
    pub rule: Rule,
    /// Human-readable limit or cause
    pub detail: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
}

impl Anomaly {
    pub fn key(&self) -> AlertKey {
        AlertKey {
            meter_id: self.meter_id,
            parameter: self.parameter.clone(),
            rule: self.rule,
        }
    }

    /// Key plus timestamp bucket; equal values mean the same event delivered twice
    pub fn dedup_key(&self, bucket_secs: u64) -> (AlertKey, i64) {
        let bucket = self.timestamp.timestamp().div_euclid(bucket_secs.max(1) as i64);
        (self.key(), bucket)
    }
}

/// Fixed-size window of recent values for one parameter
#[derive(Debug, Clone)]
struct RollingWindow {
    values: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn is_full(&self) -> bool {
        self.values.len() >= self.capacity
    }

    fn mean(&self) -> f64 {
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    fn std_dev(&self) -> f64 {
        let mean = self.mean();
        let variance = self
            .values
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / self.values.len() as f64;
        variance.sqrt()
    }

    fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }
}

pub struct AnomalyDetector {
    config: DetectorConfig,
    /// Per-meter rule overrides
    overrides: HashMap<u32, HashMap<String, ParameterRule>>,
    windows: HashMap<(u32, String), RollingWindow>,
    consecutive_failures: HashMap<u32, u32>,
}

impl AnomalyDetector {
    pub fn new(config: DetectorConfig, meters: &[MeterConfig]) -> Self {
        let overrides = meters
            .iter()
            .filter(|meter| !meter.rules.is_empty())
            .map(|meter| (meter.id, meter.rules.clone()))
            .collect();

        Self {
            config,
            overrides,
            windows: HashMap::new(),
            consecutive_failures: HashMap::new(),
        }
    }

    pub fn consecutive_failures(&self, meter_id: u32) -> u32 {
        self.consecutive_failures.get(&meter_id).copied().unwrap_or(0)
    }

    pub fn evaluate(&mut self, result: &PollResult) -> Vec<Anomaly> {
        match &result.outcome {
            PollOutcome::Failed(failure) if !failure.error.is_link_failure() => {
                trace!(
                    "meter {} failed without a link fault: {}",
                    result.meter_id, failure.error
                );
                Vec::new()
            }
            PollOutcome::Failed(failure) => {
                let count = self.consecutive_failures.entry(result.meter_id).or_insert(0);
                *count += 1;
                trace!("meter {} failed {} time(s) in a row", result.meter_id, count);

                if *count == self.config.unreachable_after {
                    vec![Anomaly {
                        meter_id: result.meter_id,
                        parameter: "link".to_string(),
                        observed: None,
                        rule: Rule::MeterUnreachable,
                        detail: format!("{count} consecutive failed polls, last: {}", failure.error),
                        timestamp: result.attempted_at,
                        severity: Severity::Critical,
                    }]
                } else {
                    Vec::new()
                }
            }
            PollOutcome::Reading(reading) => {
                self.consecutive_failures.insert(result.meter_id, 0);
                self.evaluate_reading(reading)
            }
        }
    }

    fn rule_for(&self, meter_id: u32, parameter: &str) -> Option<ParameterRule> {
        self.overrides
            .get(&meter_id)
            .and_then(|rules| rules.get(parameter))
            .or_else(|| self.config.rules.get(parameter))
            .cloned()
    }

    fn evaluate_reading(&mut self, reading: &Reading) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        for (parameter, &value) in &reading.values {
            let Some(rule) = self.rule_for(reading.meter_id, parameter) else {
                continue;
            };

            if let Some(detail) = threshold_violation(&rule, value) {
                anomalies.push(Anomaly {
                    meter_id: reading.meter_id,
                    parameter: parameter.clone(),
                    observed: Some(value),
                    rule: Rule::ThresholdViolation,
                    detail,
                    timestamp: reading.timestamp,
                    severity: Severity::Warning,
                });
            }

            if let Some(deviation) = &rule.deviation {
                if let Some(detail) = self.check_deviation(reading.meter_id, parameter, deviation, value) {
                    anomalies.push(Anomaly {
                        meter_id: reading.meter_id,
                        parameter: parameter.clone(),
                        observed: Some(value),
                        rule: Rule::StatisticalDeviation,
                        detail,
                        timestamp: reading.timestamp,
                        severity: Severity::Warning,
                    });
                }
            }
        }

        if !self.check_supply_loss(reading, &mut anomalies)
            && !self.check_missing_phase(reading, &mut anomalies)
        {
            self.check_phase_imbalance(reading, &mut anomalies);
        }

        anomalies
    }

    /// Compare against the window, then add the value to it
    fn check_deviation(
        &mut self,
        meter_id: u32,
        parameter: &str,
        rule: &DeviationRule,
        value: f64,
    ) -> Option<String> {
        let window = self
            .windows
            .entry((meter_id, parameter.to_string()))
            .or_insert_with(|| RollingWindow::new(rule.window));

        let verdict = if window.is_full() {
            let mean = window.mean();
            let spread = window.std_dev().max(rule.min_spread);
            if (value - mean).abs() > rule.k * spread {
                Some(format!(
                    "{:.2} away from rolling mean {mean:.2} (limit {:.2})",
                    (value - mean).abs(),
                    rule.k * spread
                ))
            } else {
                None
            }
        } else {
            None
        };

        window.push(value);
        verdict
    }

    fn check_supply_loss(&self, reading: &Reading, anomalies: &mut Vec<Anomaly>) -> bool {
        let Some(floor) = self.config.supply_loss_below else {
            return false;
        };

        let observed: Vec<f64> = LINE_VOLTAGES
            .iter()
            .chain(PHASE_VOLTAGES.iter())
            .chain(PHASE_CURRENTS.iter())
            .filter_map(|name| reading.get(name))
            .collect();

        // Only three-phase maps carry these quantities
        if observed.len() < PHASE_VOLTAGES.len() || observed.iter().any(|v| *v >= floor) {
            return false;
        }

        anomalies.push(Anomaly {
            meter_id: reading.meter_id,
            parameter: "supply".to_string(),
            observed: observed.iter().copied().reduce(f64::max),
            rule: Rule::SupplyLoss,
            detail: format!("all voltages and currents below {floor}"),
            timestamp: reading.timestamp,
            severity: Severity::Critical,
        });
        true
    }

    /// One or two phases dead or not reported while another one is live
    fn check_missing_phase(&self, reading: &Reading, anomalies: &mut Vec<Anomaly>) -> bool {
        let Some(floor) = self.config.missing_phase_below else {
            return false;
        };

        let phases: Vec<Option<f64>> = PHASE_VOLTAGES.iter().map(|name| reading.get(name)).collect();
        if phases.iter().all(Option::is_none) {
            return false;
        }

        let missing: Vec<&str> = phases
            .iter()
            .zip(PHASE_LABELS)
            .filter(|(value, _)| value.is_none_or(|v| v < floor))
            .map(|(_, label)| label)
            .collect();
        if missing.is_empty() || missing.len() == PHASE_VOLTAGES.len() {
            return false;
        }

        anomalies.push(Anomaly {
            meter_id: reading.meter_id,
            parameter: "phases".to_string(),
            observed: phases.iter().flatten().copied().reduce(f64::min),
            rule: Rule::MissingPhase,
            detail: format!(
                "no voltage on phase {}, {} of 3 live",
                missing.join("/"),
                PHASE_VOLTAGES.len() - missing.len()
            ),
            timestamp: reading.timestamp,
            severity: Severity::Critical,
        });
        true
    }

    fn check_phase_imbalance(&self, reading: &Reading, anomalies: &mut Vec<Anomaly>) {
        let Some(ratio) = self.config.phase_imbalance_ratio else {
            return;
        };

        let phases: Vec<f64> = PHASE_VOLTAGES
            .iter()
            .filter_map(|name| reading.get(name))
            .collect();
        if phases.len() != PHASE_VOLTAGES.len() {
            return;
        }

        let min = phases.iter().copied().fold(f64::INFINITY, f64::min);
        let max = phases.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        if max > 0.0 && min < max * (1.0 - ratio) {
            anomalies.push(Anomaly {
                meter_id: reading.meter_id,
                parameter: "phase_voltage".to_string(),
                observed: Some(min),
                rule: Rule::PhaseImbalance,
                detail: format!(
                    "R {:.2} V, Y {:.2} V, B {:.2} V",
                    phases[0], phases[1], phases[2]
                ),
                timestamp: reading.timestamp,
                severity: Severity::Critical,
            });
        }
    }
}

fn threshold_violation(rule: &ParameterRule, value: f64) -> Option<String> {
    match (rule.min, rule.max) {
        (Some(min), _) if value < min => Some(format!("below minimum {min:.2}")),
        (_, Some(max)) if value > max => Some(format!("above maximum {max:.2}")),
        _ => None,
    }
}

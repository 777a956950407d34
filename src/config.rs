use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use serde::Deserialize;
use tracing::trace;

use crate::register_map::MeterType;

/// Storage backend configuration for the long-horizon store
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Keep readings in memory only (lost on restart)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default for most deployments)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        /// Retention period in days (readings older than this are deleted)
        #[serde(default = "default_retention_days")]
        retention_days: u32,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
            retention_days: default_retention_days(),
        }
    }
}

impl StorageConfig {
    pub fn retention_days(&self) -> Option<u32> {
        match self {
            StorageConfig::None => None,
            StorageConfig::Sqlite { retention_days, .. } => Some(*retention_days),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./meter_readings.db")
}

fn default_retention_days() -> u32 {
    365
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub serial: SerialConfig,

    #[serde(default)]
    pub link: LinkConfig,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    pub meters: Vec<MeterConfig>,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub detector: DetectorConfig,

    /// Alerting is optional; without it anomalies are only logged
    pub alerts: Option<AlertConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_parity")]
    pub parity: Parity,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_parity() -> Parity {
    Parity::Even
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

/// Timeout and retry policy of the meter link
#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra attempts after the first one
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    200
}

fn default_poll_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeterConfig {
    pub id: u32,
    pub name: Option<String>,
    /// Bus address of the meter (1..=247)
    pub address: u8,
    pub register_map: MeterType,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Rules that replace the detector defaults for this meter only
    #[serde(default)]
    pub rules: HashMap<String, ParameterRule>,
}

impl MeterConfig {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Meter {}", self.id))
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Directory holding the daily short-horizon CSV files
    #[serde(default = "default_csv_dir")]
    pub csv_dir: PathBuf,

    #[serde(default = "default_csv_retain_days")]
    pub csv_retain_days: u32,

    #[serde(default)]
    pub long_horizon: StorageConfig,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_hours: u32,

    /// Offset of the site's calendar day from UTC, in minutes
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            csv_dir: default_csv_dir(),
            csv_retain_days: default_csv_retain_days(),
            long_horizon: StorageConfig::default(),
            flush_interval_secs: default_flush_interval(),
            cleanup_interval_hours: default_cleanup_interval(),
            utc_offset_minutes: 0,
        }
    }
}

fn default_csv_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_csv_retain_days() -> u32 {
    2
}

fn default_flush_interval() -> u64 {
    1800
}

fn default_cleanup_interval() -> u32 {
    24
}

/// Static limits and statistical rule for one parameter
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ParameterRule {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub deviation: Option<DeviationRule>,
}

/// Flags values further than `k` spreads away from the rolling mean
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviationRule {
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_k")]
    pub k: f64,
    /// Lower bound for the spread, so flat windows do not flag noise
    #[serde(default = "default_min_spread")]
    pub min_spread: f64,
}

fn default_window() -> usize {
    10
}

fn default_k() -> f64 {
    3.0
}

fn default_min_spread() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_rules")]
    pub rules: HashMap<String, ParameterRule>,

    /// Consecutive failed polls before a meter is reported unreachable
    #[serde(default = "default_unreachable_after")]
    pub unreachable_after: u32,

    /// Report a phase imbalance when the lowest phase voltage drops below
    /// `(1 - ratio)` of the highest
    #[serde(default = "default_phase_imbalance")]
    pub phase_imbalance_ratio: Option<f64>,

    /// Report supply loss when all voltages and currents are below this
    #[serde(default = "default_supply_loss")]
    pub supply_loss_below: Option<f64>,

    /// Report a missing phase when one or two phase voltages are below this
    /// (or absent) while another phase is live
    #[serde(default = "default_missing_phase")]
    pub missing_phase_below: Option<f64>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            unreachable_after: default_unreachable_after(),
            phase_imbalance_ratio: default_phase_imbalance(),
            supply_loss_below: default_supply_loss(),
            missing_phase_below: default_missing_phase(),
        }
    }
}

const LINE_VOLTAGE_NOMINAL: f64 = 415.0;
const PHASE_VOLTAGE_NOMINAL: f64 = 240.0;
const VOLTAGE_TOLERANCE: f64 = 0.10;

/// Under/over-voltage limits at ±10 % of nominal for three-phase meters.
fn default_rules() -> HashMap<String, ParameterRule> {
    let band = |nominal: f64| ParameterRule {
        min: Some(nominal * (1.0 - VOLTAGE_TOLERANCE)),
        max: Some(nominal * (1.0 + VOLTAGE_TOLERANCE)),
        deviation: None,
    };

    let mut rules = HashMap::new();
    for name in ["v_ry", "v_yb", "v_br"] {
        rules.insert(name.to_string(), band(LINE_VOLTAGE_NOMINAL));
    }
    for name in ["v_r", "v_y", "v_b"] {
        rules.insert(name.to_string(), band(PHASE_VOLTAGE_NOMINAL));
    }
    rules
}

fn default_unreachable_after() -> u32 {
    3
}

fn default_phase_imbalance() -> Option<f64> {
    Some(0.5)
}

fn default_supply_loss() -> Option<f64> {
    Some(5.0)
}

fn default_missing_phase() -> Option<f64> {
    Some(20.0)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertChannel {
    Telegram(Telegram),
    Webhook(Webhook),
}

impl AlertChannel {
    /// Identifier of the recipient handed to the sink with every message
    pub fn target(&self) -> String {
        match self {
            AlertChannel::Telegram(telegram) => telegram.chat_id.clone(),
            AlertChannel::Webhook(webhook) => webhook
                .target
                .clone()
                .unwrap_or_else(|| webhook.url.clone()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Telegram {
    /// Falls back to the `TELEGRAM_BOT_TOKEN` environment variable
    pub bot_token: Option<String>,
    pub chat_id: String,
    #[serde(default = "default_telegram_api")]
    pub api_url: String,
}

fn default_telegram_api() -> String {
    String::from("https://api.telegram.org")
}

#[derive(Debug, Clone, Deserialize)]
pub struct Webhook {
    pub url: String,
    pub target: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    pub channel: AlertChannel,

    /// Minimum time between two messages for the same alert key
    #[serde(default = "default_suppression_window")]
    pub suppression_window_secs: u64,

    /// Periodic "latest readings" summary; disabled when absent
    pub digest_interval_secs: Option<u64>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_alert_backoff")]
    pub backoff_ms: u64,

    #[serde(default = "default_alert_timeout")]
    pub timeout_secs: u64,

    /// Width of the timestamp bucket used to recognise re-delivered anomalies
    #[serde(default = "default_dedup_bucket")]
    pub dedup_bucket_secs: u64,
}

fn default_suppression_window() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_alert_backoff() -> u64 {
    500
}

fn default_alert_timeout() -> u64 {
    10
}

fn default_dedup_bucket() -> u64 {
    1
}

impl Config {
    pub fn enabled_meters(&self) -> impl Iterator<Item = &MeterConfig> {
        self.meters.iter().filter(|meter| meter.enabled)
    }

    /// Display names of the enabled meters
    pub fn meter_names(&self) -> BTreeMap<u32, String> {
        self.enabled_meters()
            .map(|meter| (meter.id, meter.display_name()))
            .collect()
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be greater than zero");
        }
        if self.storage.flush_interval_secs == 0 {
            bail!("storage.flush_interval_secs must be greater than zero");
        }
        if self.storage.cleanup_interval_hours == 0 {
            bail!("storage.cleanup_interval_hours must be greater than zero");
        }
        if self.link.timeout_ms == 0 {
            bail!("link.timeout_ms must be greater than zero");
        }
        if self.enabled_meters().next().is_none() {
            bail!("at least one enabled meter must be configured");
        }

        let mut ids = HashSet::new();
        let mut addresses = HashSet::new();
        for meter in &self.meters {
            if !ids.insert(meter.id) {
                bail!("duplicate meter id {}", meter.id);
            }
            if !(1..=247).contains(&meter.address) {
                bail!("meter {} has invalid bus address {}", meter.id, meter.address);
            }
            if !addresses.insert(meter.address) {
                bail!("meter {} reuses bus address {}", meter.id, meter.address);
            }
            for (parameter, rule) in &meter.rules {
                validate_rule(parameter, rule)
                    .with_context(|| format!("invalid rule on meter {}", meter.id))?;
            }
        }

        for (parameter, rule) in &self.detector.rules {
            validate_rule(parameter, rule)?;
        }
        if self.detector.unreachable_after == 0 {
            bail!("detector.unreachable_after must be at least 1");
        }

        if let Some(alerts) = &self.alerts {
            if alerts.max_attempts == 0 {
                bail!("alerts.max_attempts must be at least 1");
            }
            if alerts.dedup_bucket_secs == 0 {
                bail!("alerts.dedup_bucket_secs must be greater than zero");
            }
            if alerts.digest_interval_secs == Some(0) {
                bail!("alerts.digest_interval_secs must be greater than zero");
            }
        }

        Ok(())
    }
}

fn validate_rule(parameter: &str, rule: &ParameterRule) -> anyhow::Result<()> {
    if let (Some(min), Some(max)) = (rule.min, rule.max) {
        if min > max {
            bail!("rule for {parameter}: min {min} is above max {max}");
        }
    }
    if let Some(deviation) = &rule.deviation {
        if deviation.window < 2 || deviation.k <= 0.0 {
            bail!("rule for {parameter}: deviation needs window >= 2 and k > 0");
        }
    }
    Ok(())
}

pub fn read_config_file(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config =
        serde_json::from_str(&file_content).context("invalid configuration file")?;
    config.validate()?;
    trace!("loaded config: {config:?}");
    Ok(config)
}

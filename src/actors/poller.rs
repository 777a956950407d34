//! PollerActor - Reads every enabled meter once per interval
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → for each meter: MeterLink::poll → decode → PollResult
//!     ↑                                                     │
//!     │                      ┌──────────────────────────────┤
//!     │                      ▼                              ▼
//!     │              [StorageActor, DetectorActor]   latest-results watch
//!     └─── Commands (PollNow, UpdateInterval, GetStats)
//! ```
//!
//! Meters share one bus, so a round visits them one after another and rounds
//! never overlap. Every result is handed to all consumers before the next
//! meter is polled; a full consumer queue makes the poller wait.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::MeterConfig;
use crate::link::{MeterLink, Transport};
use crate::util::{Clock, truncate_to_second};
use crate::{PollError, PollFailure, PollOutcome, PollResult, Reading};

use super::messages::{PollerCommand, PollerStats};

/// Totals that read 0 on every phase when a meter has lost supply
const POWER_FAIL_TOTALS: [&str; 4] = ["watts_total", "current_total", "va_total", "var_total"];

pub type LatestResults = Arc<BTreeMap<u32, PollResult>>;

pub struct PollerActor<T> {
    meters: Arc<[MeterConfig]>,
    link: MeterLink<T>,
    clock: Arc<dyn Clock>,

    /// Every result goes to each of these, in order
    subscribers: Vec<mpsc::Sender<PollResult>>,

    latest_tx: watch::Sender<LatestResults>,
    command_rx: mpsc::Receiver<PollerCommand>,
    stop_rx: watch::Receiver<bool>,

    interval_duration: Duration,
    last_timestamps: HashMap<u32, DateTime<Utc>>,
    stats: PollerStats,
}

impl<T: Transport> PollerActor<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        meters: Vec<MeterConfig>,
        link: MeterLink<T>,
        interval_duration: Duration,
        clock: Arc<dyn Clock>,
        subscribers: Vec<mpsc::Sender<PollResult>>,
        latest_tx: watch::Sender<LatestResults>,
        command_rx: mpsc::Receiver<PollerCommand>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        let meters: Arc<[MeterConfig]> = meters.into_iter().filter(|m| m.enabled).collect();
        let stats = PollerStats {
            rounds: 0,
            meters: meters.iter().map(|m| (m.id, Default::default())).collect(),
        };

        Self {
            meters,
            link,
            clock,
            subscribers,
            latest_tx,
            command_rx,
            stop_rx,
            interval_duration,
            last_timestamps: HashMap::new(),
            stats,
        }
    }

    fn ticker(&self) -> tokio::time::Interval {
        let mut ticker = interval_at(
            Instant::now() + self.interval_duration,
            self.interval_duration,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Run until the stop signal is raised (or its sender is dropped)
    #[instrument(skip(self), fields(meters = self.meters.len()))]
    pub async fn run(mut self) {
        debug!(
            "starting poller with interval {}s",
            self.interval_duration.as_secs()
        );

        let mut ticker = self.ticker();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_round().await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        PollerCommand::PollNow { respond_to } => {
                            debug!("received PollNow command");
                            let results = self.poll_round().await;
                            let _ = respond_to.send(results);
                        }

                        PollerCommand::UpdateInterval { interval_secs } => {
                            debug!("updating interval to {interval_secs}s");
                            self.interval_duration = Duration::from_secs(interval_secs.max(1));
                            ticker = self.ticker();
                        }

                        PollerCommand::GetStats { respond_to } => {
                            let _ = respond_to.send(self.stats.clone());
                        }
                    }
                }

                _ = self.stop_rx.changed() => {
                    debug!("stop requested");
                    break;
                }
            }

            if *self.stop_rx.borrow() {
                break;
            }
        }

        info!("poller stopped after {} rounds", self.stats.rounds);
    }

    /// Poll every enabled meter once, in configuration order
    ///
    /// A stop request ends the round after the meter being polled.
    pub async fn poll_round(&mut self) -> Vec<PollResult> {
        let meters = self.meters.clone();
        let mut results = Vec::with_capacity(meters.len());

        for meter in meters.iter() {
            if *self.stop_rx.borrow() {
                debug!("round interrupted by stop request");
                return results;
            }

            let result = self.poll_meter(meter).await;
            self.record(&result);
            self.publish(&result).await;
            results.push(result);
        }

        self.stats.rounds += 1;
        trace!("round {} complete", self.stats.rounds);
        results
    }

    #[instrument(skip(self, meter), fields(meter = meter.id))]
    async fn poll_meter(&mut self, meter: &MeterConfig) -> PollResult {
        let attempted_at = truncate_to_second(self.clock.now());

        let outcome = match self.link.poll(meter).await {
            Err(failure) => PollOutcome::Failed(failure),
            Ok(raw) => match meter.register_map.decode(&raw.registers) {
                Err(error) => {
                    warn!("{}: {error}", meter.display_name());
                    PollOutcome::Failed(PollFailure {
                        error,
                        attempts: raw.attempts,
                    })
                }
                Ok(values) => match self.last_timestamps.get(&meter.id) {
                    Some(previous) if attempted_at < *previous => {
                        let error = PollError::ClockSkew {
                            previous: *previous,
                            current: attempted_at,
                        };
                        warn!("{}: {error}", meter.display_name());
                        PollOutcome::Failed(PollFailure {
                            error,
                            attempts: raw.attempts,
                        })
                    }
                    _ => {
                        self.last_timestamps.insert(meter.id, attempted_at);
                        let reading = Reading {
                            meter_id: meter.id,
                            timestamp: attempted_at,
                            values,
                        };
                        log_power_fail(meter, &reading);
                        PollOutcome::Reading(Arc::new(reading))
                    }
                },
            },
        };

        PollResult {
            meter_id: meter.id,
            attempted_at,
            outcome,
        }
    }

    fn record(&mut self, result: &PollResult) {
        let stats = self.stats.meters.entry(result.meter_id).or_default();
        match &result.outcome {
            PollOutcome::Reading(_) => {
                stats.successes += 1;
                stats.consecutive_failures = 0;
            }
            PollOutcome::Failed(failure) => {
                stats.failures += 1;
                stats.consecutive_failures += 1;
                stats.last_error = Some(failure.error.to_string());
            }
        }

        let mut latest = BTreeMap::clone(&self.latest_tx.borrow());
        latest.insert(result.meter_id, result.clone());
        self.latest_tx.send_replace(Arc::new(latest));
    }

    async fn publish(&self, result: &PollResult) {
        for subscriber in &self.subscribers {
            if subscriber.send(result.clone()).await.is_err() {
                trace!("consumer gone, result for meter {} not delivered", result.meter_id);
            }
        }
    }
}

fn log_power_fail(meter: &MeterConfig, reading: &Reading) {
    let totals: Vec<f64> = POWER_FAIL_TOTALS
        .iter()
        .filter_map(|name| reading.get(name))
        .collect();
    if totals.len() == POWER_FAIL_TOTALS.len() && totals.iter().all(|v| *v == 0.0) {
        warn!("{}: all totals read 0, possible power failure", meter.display_name());
    }
}

/// Handle for controlling the PollerActor
#[derive(Clone)]
pub struct PollerHandle {
    sender: mpsc::Sender<PollerCommand>,
    stop_tx: Arc<watch::Sender<bool>>,
    latest_rx: watch::Receiver<LatestResults>,
}

impl PollerHandle {
    /// Spawn the poller; it owns the link (and with it the bus) from now on
    pub fn spawn<T: Transport + Sync + 'static>(
        meters: Vec<MeterConfig>,
        link: MeterLink<T>,
        interval: Duration,
        clock: Arc<dyn Clock>,
        subscribers: Vec<mpsc::Sender<PollResult>>,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (latest_tx, latest_rx) = watch::channel(Arc::new(BTreeMap::new()));

        let actor = PollerActor::new(
            meters,
            link,
            interval,
            clock,
            subscribers,
            latest_tx,
            cmd_rx,
            stop_rx,
        );
        let task = tokio::spawn(actor.run());

        (
            Self {
                sender: cmd_tx,
                stop_tx: Arc::new(stop_tx),
                latest_rx,
            },
            task,
        )
    }

    /// Run one round now and return its results
    pub async fn poll_now(&self) -> Result<Vec<PollResult>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PollerCommand::PollNow { respond_to: tx })
            .await
            .context("failed to send PollNow command")?;
        rx.await.context("poller dropped PollNow response")
    }

    pub async fn update_interval(&self, interval_secs: u64) -> Result<()> {
        self.sender
            .send(PollerCommand::UpdateInterval { interval_secs })
            .await
            .context("failed to send UpdateInterval command")
    }

    pub async fn get_stats(&self) -> Result<PollerStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PollerCommand::GetStats { respond_to: tx })
            .await
            .context("failed to send GetStats command")?;
        rx.await.context("poller dropped GetStats response")
    }

    /// Latest result per meter
    pub fn latest(&self) -> LatestResults {
        self.latest_rx.borrow().clone()
    }

    pub fn subscribe_latest(&self) -> watch::Receiver<LatestResults> {
        self.latest_rx.clone()
    }

    /// Stop after the meter currently being polled
    pub fn shutdown(&self) {
        self.stop_tx.send_replace(true);
    }
}

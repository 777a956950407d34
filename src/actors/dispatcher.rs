//! DispatcherActor - Turns anomalies into outbound messages
//!
//! Anomalies that are already queued when one arrives are handled as a batch
//! and sent as one message. Each anomaly first passes the per-key suppression
//! state ([`AlertDeliveryState`]); only the ones that fire are sent.
//!
//! ## Delivery
//!
//! ```text
//! send ──ok──▶ done
//!   │
//!   ├─terminal──▶ dropped (logged)
//!   └─retryable─▶ wait (backoff doubles, capped) ─▶ send ... up to max_attempts ─▶ dropped
//! ```
//!
//! A key counts as fired even when its message is finally dropped, so a sink
//! that is down does not lead to a burst of resends later.
//!
//! A stop request interrupts a send or a retry wait in progress. Whatever has
//! not been delivered by then, including anomalies still queued, is dropped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, instrument, trace, warn};

use crate::alerts::format::{format_anomalies, format_digest};
use crate::alerts::suppression::{AlertDeliveryState, Decision, KeyState};
use crate::alerts::{AlertSink, DeliveryError};
use crate::config::AlertConfig;
use crate::detector::{AlertKey, Anomaly};
use crate::util::Clock;

use super::messages::{DispatcherCommand, DispatcherStats};
use super::poller::LatestResults;

/// Anomalies folded into one message at most
const MAX_BATCH: usize = 32;

/// Upper bound for the pause between delivery attempts
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Digest timer period when no digest is configured (branch stays disabled)
const IDLE_DIGEST_PERIOD: Duration = Duration::from_secs(24 * 3600);

/// What the dispatcher needs besides its channels
pub struct DispatcherContext {
    pub sink: Arc<dyn AlertSink>,
    pub target: String,
    pub names: BTreeMap<u32, String>,
    pub latest_rx: watch::Receiver<LatestResults>,
    pub clock: Arc<dyn Clock>,
    pub utc_offset_minutes: i32,
}

pub struct DispatcherActor {
    ctx: DispatcherContext,
    config: AlertConfig,
    state: AlertDeliveryState,
    anomaly_rx: mpsc::Receiver<Anomaly>,
    command_rx: mpsc::Receiver<DispatcherCommand>,
    stop_rx: watch::Receiver<bool>,
    stopping: bool,
    muted_until: Option<Instant>,
    stats: DispatcherStats,
}

/// Resolves once a stop is requested; never if the handles are simply dropped
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    if stop_rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl DispatcherActor {
    pub fn new(
        ctx: DispatcherContext,
        config: AlertConfig,
        anomaly_rx: mpsc::Receiver<Anomaly>,
        command_rx: mpsc::Receiver<DispatcherCommand>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        let state = AlertDeliveryState::new(config.suppression_window_secs, config.dedup_bucket_secs);
        Self {
            ctx,
            config,
            state,
            anomaly_rx,
            command_rx,
            stop_rx,
            stopping: false,
            muted_until: None,
            stats: DispatcherStats::default(),
        }
    }

    fn is_muted(&mut self) -> bool {
        match self.muted_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                info!("mute expired, alerts enabled again");
                self.muted_until = None;
                false
            }
            None => false,
        }
    }

    /// Run until a stop is requested or the detector side of the queue is gone
    #[instrument(skip(self), fields(target = %self.ctx.target))]
    pub async fn run(mut self) {
        debug!("starting alert dispatcher");

        let digest_every = self.config.digest_interval_secs.map(Duration::from_secs);
        let period = digest_every.unwrap_or(IDLE_DIGEST_PERIOD);
        let mut digest_ticker = interval_at(Instant::now() + period, period);
        digest_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = stop_requested(&mut self.stop_rx) => {
                    debug!("stop requested");
                    self.stopping = true;
                }

                anomaly = self.anomaly_rx.recv() => {
                    let Some(first) = anomaly else {
                        debug!("anomaly channel closed, shutting down");
                        break;
                    };
                    let mut batch = vec![first];
                    while batch.len() < MAX_BATCH {
                        match self.anomaly_rx.try_recv() {
                            Ok(next) => batch.push(next),
                            Err(_) => break,
                        }
                    }
                    self.handle_batch(batch).await;
                }

                _ = digest_ticker.tick(), if digest_every.is_some() => {
                    if let Err(e) = self.send_digest().await {
                        warn!("digest not delivered: {}", e);
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    self.handle_command(cmd).await;
                }
            }

            if self.stopping {
                self.drop_queued();
                break;
            }
        }

        debug!("alert dispatcher stopped");
    }

    fn drop_queued(&mut self) {
        self.anomaly_rx.close();
        let mut dropped = 0;
        while self.anomaly_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("dropping {dropped} queued anomalies on shutdown");
        }
    }

    async fn handle_batch(&mut self, batch: Vec<Anomaly>) {
        self.stats.received += batch.len() as u64;

        if self.is_muted() {
            trace!("muted, ignoring {} anomalies", batch.len());
            self.stats.muted += batch.len() as u64;
            return;
        }

        let mut firing = Vec::new();
        for anomaly in batch {
            match self.state.observe(&anomaly) {
                Decision::Send { suppressed } => firing.push((anomaly, suppressed)),
                Decision::Suppress { count } => {
                    trace!("{} suppressed ({} in window)", anomaly.key(), count);
                    self.stats.suppressed += 1;
                }
                Decision::Duplicate => {
                    trace!("{} duplicate", anomaly.key());
                    self.stats.duplicates += 1;
                }
            }
        }

        if firing.is_empty() {
            return;
        }

        let text = format_anomalies(&firing, &self.ctx.names);
        match self.deliver(&text).await {
            Ok(()) => self.stats.alerts_sent += firing.len() as u64,
            Err(_) if self.stopping => {
                warn!("dropping {} unsent alerts on shutdown", firing.len());
            }
            Err(_) => {}
        }
    }

    async fn send_digest(&mut self) -> Result<(), DeliveryError> {
        let latest = self.ctx.latest_rx.borrow().clone();
        let text = format_digest(
            self.ctx.clock.now(),
            self.ctx.utc_offset_minutes,
            &latest,
            &self.ctx.names,
        );
        self.deliver(&text).await?;
        self.stats.digests_sent += 1;
        Ok(())
    }

    /// Send with bounded retries; the message is dropped on the final failure
    /// or when a stop is requested meanwhile
    async fn deliver(&mut self, text: &str) -> Result<(), DeliveryError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff = Duration::from_millis(self.config.backoff_ms);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop_rx) => return Err(self.interrupted()),
                result = self.ctx.sink.send(&self.ctx.target, text) => result,
            };

            match result {
                Ok(()) => {
                    debug!("message delivered on attempt {attempt}");
                    self.stats.messages_sent += 1;
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    warn!("dropping message after {e}");
                    self.stats.dropped += 1;
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    warn!("dropping message after {attempt} attempts, last error: {e}");
                    self.stats.dropped += 1;
                    return Err(e);
                }
                Err(e) => {
                    debug!("attempt {attempt}/{max_attempts} failed: {e}, retrying in {backoff:?}");
                    tokio::select! {
                        biased;
                        _ = stop_requested(&mut self.stop_rx) => return Err(self.interrupted()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    fn interrupted(&mut self) -> DeliveryError {
        self.stopping = true;
        self.stats.dropped += 1;
        DeliveryError::Terminal("stopped before delivery".to_string())
    }

    async fn handle_command(&mut self, cmd: DispatcherCommand) {
        match cmd {
            DispatcherCommand::GetState { key, respond_to } => {
                let _ = respond_to.send(self.state.state(&key, self.ctx.clock.now()));
            }

            DispatcherCommand::Mute { duration_secs } => {
                info!("muting alerts for {duration_secs}s");
                self.muted_until = Some(Instant::now() + Duration::from_secs(duration_secs));
            }

            DispatcherCommand::Unmute => {
                info!("unmuting alerts");
                self.muted_until = None;
            }

            DispatcherCommand::GetStats { respond_to } => {
                let _ = respond_to.send(self.stats.clone());
            }

            DispatcherCommand::SendDigestNow { respond_to } => {
                let result = self.send_digest().await.map_err(Into::into);
                let _ = respond_to.send(result);
            }
        }
    }
}

/// Handle for controlling the DispatcherActor
#[derive(Clone)]
pub struct DispatcherHandle {
    sender: mpsc::Sender<DispatcherCommand>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl DispatcherHandle {
    pub fn spawn(
        ctx: DispatcherContext,
        config: AlertConfig,
        anomaly_rx: mpsc::Receiver<Anomaly>,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (stop_tx, stop_rx) = watch::channel(false);

        let actor = DispatcherActor::new(ctx, config, anomaly_rx, cmd_rx, stop_rx);
        let task = tokio::spawn(actor.run());

        (
            Self {
                sender: cmd_tx,
                stop_tx: Arc::new(stop_tx),
            },
            task,
        )
    }

    pub async fn get_state(&self, key: AlertKey) -> Result<KeyState> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DispatcherCommand::GetState {
                key,
                respond_to: tx,
            })
            .await
            .context("failed to send GetState command")?;
        rx.await.context("dispatcher dropped GetState response")
    }

    /// Ignore anomalies for a while; they are not sent afterwards either
    pub async fn mute(&self, duration_secs: u64) {
        let _ = self
            .sender
            .send(DispatcherCommand::Mute { duration_secs })
            .await;
    }

    pub async fn unmute(&self) {
        let _ = self.sender.send(DispatcherCommand::Unmute).await;
    }

    pub async fn get_stats(&self) -> Result<DispatcherStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DispatcherCommand::GetStats { respond_to: tx })
            .await
            .context("failed to send GetStats command")?;
        rx.await.context("dispatcher dropped GetStats response")
    }

    pub async fn send_digest_now(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DispatcherCommand::SendDigestNow { respond_to: tx })
            .await
            .context("failed to send SendDigestNow command")?;
        rx.await.context("dispatcher dropped SendDigestNow response")?
    }

    /// Stop now; unsent alerts are dropped
    pub fn shutdown(&self) {
        self.stop_tx.send_replace(true);
    }
}

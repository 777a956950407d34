//! DetectorActor - Runs the anomaly rules over every poll result
//!
//! The actor owns the [`AnomalyDetector`], so window updates and rule
//! evaluation for one result happen without interleaving. Anomalies are
//! forwarded to the dispatcher; without one they are only logged.


use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace};

use crate::PollResult;
use crate::config::{DetectorConfig, MeterConfig};
use crate::detector::{Anomaly, AnomalyDetector};

use super::messages::DetectorCommand;

pub struct DetectorActor {
    detector: AnomalyDetector,
    event_rx: mpsc::Receiver<PollResult>,
    command_rx: mpsc::Receiver<DetectorCommand>,
    anomaly_tx: Option<mpsc::Sender<Anomaly>>,
}

impl DetectorActor {
    pub fn new(
        detector: AnomalyDetector,
        event_rx: mpsc::Receiver<PollResult>,
        command_rx: mpsc::Receiver<DetectorCommand>,
        anomaly_tx: Option<mpsc::Sender<Anomaly>>,
    ) -> Self {
        Self {
            detector,
            event_rx,
            command_rx,
            anomaly_tx,
        }
    }

    /// Run until the poller side of the event queue is gone
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting detector actor");

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    let Some(result) = event else {
                        debug!("event channel closed, shutting down");
                        break;
                    };
                    self.handle_result(&result).await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        DetectorCommand::ConsecutiveFailures { meter_id, respond_to } => {
                            let _ = respond_to.send(self.detector.consecutive_failures(meter_id));
                        }
                    }
                }
            }
        }

        debug!("detector actor stopped");
    }

    async fn handle_result(&mut self, result: &PollResult) {
        let anomalies = self.detector.evaluate(result);
        trace!(
            "meter {}: {} anomalies",
            result.meter_id,
            anomalies.len()
        );

        for anomaly in anomalies {
            info!(
                "anomaly on meter {}: {} {} ({})",
                anomaly.meter_id, anomaly.rule, anomaly.parameter, anomaly.detail
            );

            if let Some(tx) = &self.anomaly_tx {
                if tx.send(anomaly).await.is_err() {
                    debug!("dispatcher gone, no longer forwarding anomalies");
                    self.anomaly_tx = None;
                }
            }
        }
    }
}

/// Handle for querying the DetectorActor
#[derive(Clone)]
pub struct DetectorHandle {
    sender: mpsc::Sender<DetectorCommand>,
}

impl DetectorHandle {
    pub fn spawn(
        config: DetectorConfig,
        meters: &[MeterConfig],
        event_rx: mpsc::Receiver<PollResult>,
        anomaly_tx: Option<mpsc::Sender<Anomaly>>,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let detector = AnomalyDetector::new(config, meters);
        let actor = DetectorActor::new(detector, event_rx, cmd_rx, anomaly_tx);
        let task = tokio::spawn(actor.run());

        (Self { sender: cmd_tx }, task)
    }

    pub async fn consecutive_failures(&self, meter_id: u32) -> Result<u32> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DetectorCommand::ConsecutiveFailures {
                meter_id,
                respond_to: tx,
            })
            .await
            .context("failed to send ConsecutiveFailures command")?;
        rx.await.context("detector dropped response")
    }
}

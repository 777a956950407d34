//! Wiring of the actors into one running pipeline

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::actors::detector::DetectorHandle;
use crate::actors::dispatcher::{DispatcherContext, DispatcherHandle};
use crate::actors::poller::PollerHandle;
use crate::actors::storage::{PersistenceSettings, StorageHandle};
use crate::alerts::AlertSink;
use crate::config::{Config, MeterConfig};
use crate::link::{MeterLink, Transport};
use crate::storage::StorageBackend;
use crate::storage::csv_log::ShortHorizonWriter;
use crate::util::Clock;

/// Poll results queued per consumer before the poller waits
const EVENT_QUEUE: usize = 64;

/// Anomalies queued before the detector waits for the dispatcher
const ANOMALY_QUEUE: usize = 256;

/// CSV columns: every parameter of the enabled meters, first occurrence wins
pub fn csv_columns(meters: &[MeterConfig]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for meter in meters.iter().filter(|meter| meter.enabled) {
        for name in meter.register_map.parameter_names() {
            if !columns.iter().any(|column| column == name) {
                columns.push(name.to_string());
            }
        }
    }
    columns
}

/// Handles of all running actors
pub struct Pipeline {
    pub poller: PollerHandle,
    pub storage: StorageHandle,
    pub detector: DetectorHandle,
    pub dispatcher: Option<DispatcherHandle>,
    poller_task: JoinHandle<()>,
    storage_task: JoinHandle<()>,
    detector_task: JoinHandle<()>,
    dispatcher_task: Option<JoinHandle<()>>,
}

/// Wait up to `grace` for an actor task; abort it when that runs out
async fn join_or_abort(name: &'static str, mut task: JoinHandle<()>, grace: Duration) -> Result<()> {
    match timeout(grace, &mut task).await {
        Ok(joined) => joined.with_context(|| format!("{name} task failed")),
        Err(_) => {
            warn!("{name} did not stop within {grace:?}, aborting");
            task.abort();
            let _ = task.await;
            bail!("{name} did not stop in time")
        }
    }
}

impl Pipeline {
    /// Start every actor; polling begins one interval from now
    pub fn spawn<T: Transport + Sync + 'static>(
        config: &Config,
        transport: T,
        backend: Arc<dyn StorageBackend>,
        sink: Option<Arc<dyn AlertSink>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let storage_config = &config.storage;
        let (storage_tx, storage_rx) = mpsc::channel(EVENT_QUEUE);
        let (detector_tx, detector_rx) = mpsc::channel(EVENT_QUEUE);

        let csv = ShortHorizonWriter::new(
            &storage_config.csv_dir,
            storage_config.csv_retain_days,
            storage_config.utc_offset_minutes,
            csv_columns(&config.meters),
        );
        let settings = PersistenceSettings {
            flush_interval: Duration::from_secs(storage_config.flush_interval_secs),
            cleanup_interval: Duration::from_secs(
                u64::from(storage_config.cleanup_interval_hours) * 3600,
            ),
            retention_days: storage_config.long_horizon.retention_days(),
            utc_offset_minutes: storage_config.utc_offset_minutes,
        };
        let (storage, storage_task) =
            StorageHandle::spawn(backend, csv, clock.clone(), settings, storage_rx);

        let link = MeterLink::new(transport, &config.link);
        let (poller, poller_task) = PollerHandle::spawn(
            config.meters.clone(),
            link,
            Duration::from_secs(config.poll_interval_secs),
            clock.clone(),
            vec![storage_tx, detector_tx],
        );

        let (dispatcher, dispatcher_task, anomaly_tx) = match (&config.alerts, sink) {
            (Some(alerts), Some(sink)) => {
                let (anomaly_tx, anomaly_rx) = mpsc::channel(ANOMALY_QUEUE);
                let ctx = DispatcherContext {
                    sink,
                    target: alerts.channel.target(),
                    names: config.meter_names(),
                    latest_rx: poller.subscribe_latest(),
                    clock,
                    utc_offset_minutes: storage_config.utc_offset_minutes,
                };
                let (handle, task) = DispatcherHandle::spawn(ctx, alerts.clone(), anomaly_rx);
                (Some(handle), Some(task), Some(anomaly_tx))
            }
            _ => {
                info!("no alert channel configured, anomalies are only logged");
                (None, None, None)
            }
        };

        let (detector, detector_task) = DetectorHandle::spawn(
            config.detector.clone(),
            &config.meters,
            detector_rx,
            anomaly_tx,
        );

        info!(
            "pipeline started: {} meters every {}s",
            config.enabled_meters().count(),
            config.poll_interval_secs
        );

        Ok(Self {
            poller,
            storage,
            detector,
            dispatcher,
            poller_task,
            storage_task,
            detector_task,
            dispatcher_task,
        })
    }

    /// Stop polling and let storage and the detector drain
    ///
    /// Each stage gets `grace` and is aborted when it overruns. Alerts not
    /// yet delivered are dropped. Every stage is waited for even when an
    /// earlier one failed; the failures are reported together.
    pub async fn shutdown(self, grace: Duration) -> Result<()> {
        info!("shutting down pipeline");
        self.poller.shutdown();
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.shutdown();
        }

        let Self {
            poller,
            storage,
            detector,
            dispatcher,
            poller_task,
            storage_task,
            detector_task,
            dispatcher_task,
        } = self;
        drop((poller, storage, detector, dispatcher));

        let mut failures = Vec::new();

        // An aborted poller still drops its senders, so the consumers drain
        if let Err(e) = join_or_abort("poller", poller_task, grace).await {
            failures.push(e);
        }
        debug!("poller stopped");

        let mut stages = vec![
            join_or_abort("storage", storage_task, grace),
            join_or_abort("detector", detector_task, grace),
        ];
        if let Some(task) = dispatcher_task {
            stages.push(join_or_abort("dispatcher", task, grace));
        }
        for result in join_all(stages).await {
            if let Err(e) = result {
                failures.push(e);
            }
        }

        if failures.is_empty() {
            info!("pipeline stopped");
            return Ok(());
        }

        let message = failures
            .iter()
            .map(|e| format!("{e:#}"))
            .collect::<Vec<_>>()
            .join("; ");
        warn!("pipeline stopped with errors: {message}");
        Err(anyhow!("pipeline did not stop cleanly: {message}"))
    }
}

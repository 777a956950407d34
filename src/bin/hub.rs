use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use substation_monitor::{
    alerts::build_sink,
    config::read_config_file,
    link::serial::SerialTransport,
    pipeline::Pipeline,
    storage::open_backend,
    util::SystemClock,
};
use tracing::{debug, error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Time each pipeline stage gets to finish on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Log level for the monitor
    #[arg(long, default_value_t = LevelFilter::DEBUG)]
    log_level: LevelFilter,
}

fn init(level: LevelFilter) {
    let filter = filter::Targets::new().with_targets(vec![
        ("substation_monitor", level),
        ("substation_hub", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.log_level);
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;

    let transport = match SerialTransport::open(config.serial.clone()) {
        Ok(transport) => transport,
        Err(e) => {
            // The link reopens the port on the next request
            warn!("could not open {}: {}", config.serial.port, e);
            SerialTransport::new(config.serial.clone())
        }
    };

    let backend = open_backend(&config.storage.long_horizon)
        .await
        .context("failed to open long-horizon storage")?;

    let sink = match &config.alerts {
        Some(alerts) => Some(build_sink(
            &alerts.channel,
            Duration::from_secs(alerts.timeout_secs),
        )?),
        None => None,
    };

    let pipeline = Pipeline::spawn(&config, transport, backend, sink, Arc::new(SystemClock))?;

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received"),
        Err(e) => error!("failed to listen for interrupt: {}", e),
    }

    pipeline.shutdown(SHUTDOWN_GRACE).await?;
    debug!("bye");

    Ok(())
}

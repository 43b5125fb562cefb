//! Frame relay running against the built-in loopback device

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use framerelay::capture::BgraPassthrough;
use framerelay::output::LoopbackDevice;
use framerelay::{utils, Relay};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framerelay=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Frame relay launching...");

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = utils::load_config(path.as_deref())?;
    framerelay::CONFIG.store(Arc::new(config.clone()));

    info!(
        "Capture {} -> output {}, pacing {:?}, buffering {:?}",
        config.capture.mode.name,
        config.output.mode.name,
        config.pipeline.pacing,
        config.capture.buffering
    );

    let device = Arc::new(LoopbackDevice::from_config(&config));
    let run_for = config.loopback.run_seconds.map(Duration::from_secs);
    let mut relay = Relay::new(config, device.clone(), device, Arc::new(BgraPassthrough))?;
    let faults = relay.faults();

    relay.start()?;

    let deadline = async {
        match run_for {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted");
            Ok(())
        }
        fault = faults.recv_async() => match fault {
            Ok(fault) => {
                error!("Relay fault: {}", fault);
                Err(eyre!(fault))
            }
            Err(_) => Ok(()),
        },
        _ = deadline => {
            info!("Run time elapsed");
            Ok(())
        }
    };

    if let Err(e) = relay.stop() {
        warn!("Error while stopping: {}", e);
    }
    info!("Final stats: {:?}", relay.stats());

    info!("Frame relay shutting down");
    outcome
}

use std::sync::Arc;

use anyhow::Context;
use tap_api::Diagnostics;
use tapper::{Pipeline, TapperConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = TapperConfig::from_env().context("reading configuration")?;
    init_tracing(config.debug);
    info!(
        event.name = "tapper.starting",
        interface = %config.interface,
        pcap_file = ?config.pcap_file,
        host_mode = config.host_mode,
        pods = config.tapped_pods.len(),
        "starting tapper"
    );

    let diagnostics = Arc::new(Diagnostics::new(config.debug));
    let pipeline = Pipeline::new(config, diagnostics).context("building pipeline")?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!(event.name = "tapper.sigint", "interrupt received");
                on_signal.cancel();
            },
            Err(e) => warn!(error = %e, "cannot listen for SIGINT"),
        }
    });

    match pipeline.run(shutdown).await {
        Ok(summary) => {
            info!(published = summary.published, "tapper exited");
            Ok(())
        },
        Err(e) => {
            error!(event.name = "tapper.fatal", tag = e.tag(), error = %e, "tapper failed");
            Err(anyhow::Error::new(e).context("running pipeline"))
        },
    }
}

//! Castwave relay daemon.
//!
//! Boots the relay control plane against a configuration file: pulls the
//! configured relays, polls the master streamlist when one is set up, and
//! keeps the slave-host table for listener redirects.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use castwave_core::{ConfigStore, Stats};
use castwave_relay::control::{ControlFlags, RelaySystem};
use castwave_relay::master::HttpStreamlistFetcher;
use castwave_relay::mounts::MountRegistry;
use castwave_relay::pipeline::{NullDirectory, PassthroughPipeline};
use castwave_relay::slaves::SlaveRegistry;
use castwave_relay::supervisor::{RelayContext, RelaySupervisor};

#[derive(Parser, Debug)]
#[command(name = "castwave-relay")]
#[command(version, about = "Castwave relay control plane daemon")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "castwave.json", env = "CASTWAVE_CONFIG")]
    config: PathBuf,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "CASTWAVE_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "CASTWAVE_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    castwave_core::init_tracing(&args.log_level, args.log_json);

    let config = Arc::new(ConfigStore::from_file(&args.config)?);
    let stats = Arc::new(Stats::new());
    let mounts = Arc::new(MountRegistry::new());
    let flags = Arc::new(ControlFlags::default());
    let slaves = Arc::new(SlaveRegistry::new(stats.clone()));

    let ctx = Arc::new(RelayContext {
        config,
        mounts,
        stats,
        pipeline: Arc::new(PassthroughPipeline::default()),
        directory: Arc::new(NullDirectory),
        flags,
    });
    let supervisor = Arc::new(RelaySupervisor::new(ctx));
    let fetcher = Arc::new(HttpStreamlistFetcher::new()?);

    let handle = RelaySystem::new(supervisor, slaves, fetcher).spawn();
    info!(config = %args.config.display(), "castwave relay control plane started");

    // SIGHUP re-reads the configuration file on the next tick.
    #[cfg(unix)]
    {
        let controls = handle.controls();
        tokio::spawn(async move {
            let mut hangup =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        error!(error = %e, "failed to install SIGHUP handler");
                        return;
                    }
                };
            while hangup.recv().await.is_some() {
                info!("SIGHUP received, scheduling config re-read");
                controls.request_config_reread();
                controls.recheck_mounts();
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

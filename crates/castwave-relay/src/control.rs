//! The relay control loop and its external control signals.
//!
//! One long-running task wakes every second and decides between a full
//! cycle (config reload, streamlist poll, static reconcile) and a light
//! rescan of the existing lists. Other subsystems steer it exclusively
//! through the atomic flags on [`ControlFlags`]; nothing else reaches
//! into the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use castwave_core::Config;

use crate::master::{self, StreamlistFetcher};
use crate::relay::RelayConfig;
use crate::slaves::SlaveRegistry;
use crate::supervisor::RelaySupervisor;

const TICK: Duration = Duration::from_secs(1);

/// Control signals shared between the loop, the workers and the rest of
/// the server.
#[derive(Debug, Default)]
pub struct ControlFlags {
    rescan_relays: AtomicBool,
    update_settings: AtomicBool,
    max_interval: AtomicU64,
    config_reread: AtomicBool,
    running: AtomicBool,
}

impl ControlFlags {
    /// Force a full relay recheck on the next tick, including the master
    /// streamlist.
    pub fn recheck_mounts(&self) {
        self.max_interval.store(0, Ordering::SeqCst);
        self.update_settings.store(true, Ordering::SeqCst);
    }

    /// Ask the loop to rescan the existing relays, e.g. to wake
    /// on-demand relays whose fallbacks gained listeners.
    pub fn rescan(&self) {
        self.rescan_relays.store(true, Ordering::SeqCst);
    }

    /// Rescan the relays and recompute mount settings.
    pub fn rebuild_mounts(&self) {
        self.update_settings.store(true, Ordering::SeqCst);
        self.rescan_relays.store(true, Ordering::SeqCst);
    }

    /// Have the loop re-read the configuration file before its next
    /// cycle.
    pub fn request_config_reread(&self) {
        self.config_reread.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    fn max_interval(&self) -> u64 {
        self.max_interval.load(Ordering::SeqCst)
    }

    fn set_max_interval(&self, ticks: u64) {
        self.max_interval.store(ticks, Ordering::SeqCst);
    }

    fn rescan_pending(&self) -> bool {
        self.rescan_relays.load(Ordering::SeqCst)
    }

    fn clear_rescan(&self) {
        self.rescan_relays.store(false, Ordering::SeqCst);
    }

    fn take_update_settings(&self) -> bool {
        self.update_settings.swap(false, Ordering::SeqCst)
    }

    fn take_config_reread(&self) -> bool {
        self.config_reread.swap(false, Ordering::SeqCst)
    }
}

/// The assembled relay control plane.
pub struct RelaySystem {
    supervisor: Arc<RelaySupervisor>,
    slaves: Arc<SlaveRegistry>,
    fetcher: Arc<dyn StreamlistFetcher>,
}

impl RelaySystem {
    pub fn new(
        supervisor: Arc<RelaySupervisor>,
        slaves: Arc<SlaveRegistry>,
        fetcher: Arc<dyn StreamlistFetcher>,
    ) -> Self {
        Self {
            supervisor,
            slaves,
            fetcher,
        }
    }

    /// Start the control loop and return the handle other subsystems use
    /// to steer and eventually stop it.
    pub fn spawn(self) -> RelaySystemHandle {
        let flags = self.supervisor.context().flags.clone();
        flags.set_running(true);
        // zeroed interval forces a full cycle on the first tick
        flags.set_max_interval(0);
        let join = tokio::spawn(self.run());
        RelaySystemHandle { flags, join }
    }

    async fn run(self) {
        let ctx = self.supervisor.context().clone();
        {
            let config = ctx.config.current();
            self.update_master_as_slave(&config).await;
            ctx.mounts.recheck(&config, &ctx.stats);
        }

        let mut interval_ticks: u64 = 0;
        loop {
            if ctx.flags.take_config_reread()
                && let Err(e) = ctx.config.reload()
            {
                error!(error = %e, "scheduled config re-read failed");
            }

            tokio::time::sleep(TICK).await;
            if !ctx.flags.is_running() {
                break;
            }
            interval_ticks += 1;

            let max_interval = ctx.flags.max_interval();
            if !ctx.flags.rescan_pending() && max_interval > interval_ticks {
                continue;
            }

            if max_interval <= interval_ticks {
                debug!("checking master stream list");
                if let Err(e) = ctx.config.reload() {
                    warn!(error = %e, "config reload failed, keeping current config");
                }
                let config = ctx.config.current();
                interval_ticks = 0;
                ctx.flags.set_max_interval(config.master.update_interval);

                self.update_master_as_slave(&config).await;
                self.spawn_streamlist_poll(&config);
                self.supervisor
                    .apply_static(static_relay_configs(&config))
                    .await;
            } else {
                debug!("rescanning relay lists");
                self.supervisor.rescan().await;
            }

            ctx.flags.clear_rescan();
            if ctx.flags.take_update_settings() {
                let config = ctx.config.current();
                ctx.mounts.recheck(&config, &ctx.stats);
            }
        }

        debug!("shutting down current relays");
        self.supervisor.shutdown_all().await;
        info!("relay control loop shutdown complete");
    }

    /// Keep the master itself in the slave table while this node
    /// participates in load sharing.
    async fn update_master_as_slave(&self, config: &Config) {
        let master = &config.master;
        if let (Some(server), Some(redirect_port)) = (&master.server, master.redirect_port) {
            debug!(redirect_port, "registering master as redirect peer");
            self.slaves.ensure(server, master.server_port).await;
        }
    }

    /// Fire one streamlist poll on a detached task so a slow master
    /// never blocks the loop.
    fn spawn_streamlist_poll(&self, config: &Config) {
        let supervisor = self.supervisor.clone();
        let fetcher = self.fetcher.clone();
        let config = config.clone();
        tokio::spawn(async move {
            master::poll_master(&supervisor, fetcher.as_ref(), &config).await;
        });
    }
}

/// Handle to a spawned [`RelaySystem`].
pub struct RelaySystemHandle {
    flags: Arc<ControlFlags>,
    join: JoinHandle<()>,
}

impl RelaySystemHandle {
    /// The control flag block, for subsystems that signal the loop.
    pub fn controls(&self) -> Arc<ControlFlags> {
        self.flags.clone()
    }

    pub fn recheck_mounts(&self) {
        self.flags.recheck_mounts();
    }

    pub fn rescan(&self) {
        self.flags.rescan();
    }

    pub fn rebuild_mounts(&self) {
        self.flags.rebuild_mounts();
    }

    pub fn request_config_reread(&self) {
        self.flags.request_config_reread();
    }

    /// Stop the loop and wait for every relay to tear down.
    pub async fn shutdown(self) {
        self.flags.set_running(false);
        if let Err(e) = self.join.await {
            error!(error = %e, "relay control loop panicked");
        }
    }
}

/// Desired static relay list from the current configuration.
fn static_relay_configs(config: &Config) -> Vec<RelayConfig> {
    config.relays.iter().map(RelayConfig::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recheck_zeroes_the_interval() {
        let flags = ControlFlags::default();
        flags.set_max_interval(120);
        flags.recheck_mounts();
        assert_eq!(flags.max_interval(), 0);
        assert!(flags.take_update_settings());
        // consumed
        assert!(!flags.take_update_settings());
    }

    #[test]
    fn rebuild_sets_both_flags() {
        let flags = ControlFlags::default();
        flags.rebuild_mounts();
        assert!(flags.rescan_pending());
        assert!(flags.take_update_settings());
        flags.clear_rescan();
        assert!(!flags.rescan_pending());
    }

    #[test]
    fn config_reread_is_one_shot() {
        let flags = ControlFlags::default();
        assert!(!flags.take_config_reread());
        flags.request_config_reread();
        assert!(flags.take_config_reread());
        assert!(!flags.take_config_reread());
    }

    #[test]
    fn static_relay_configs_map_entries() {
        let config: Config = serde_json::from_str(
            r#"{"relay": [
                {"server": "a.example.org", "mount": "/a"},
                {"server": "b.example.org", "mount": "/b", "local_mount": "/local-b",
                 "enable": false}
            ]}"#,
        )
        .unwrap();
        let relays = static_relay_configs(&config);
        assert_eq!(relays.len(), 2);
        assert_eq!(relays[0].local_mount, "/a");
        assert_eq!(relays[1].local_mount, "/local-b");
        assert!(!relays[1].enabled);
    }
}

//! The relay supervisor: owns both relay lists and every worker's
//! lifecycle.
//!
//! All mutation of the lists runs under one lock, so reconciliation,
//! teardown and promotion never race each other. Workers are spawned
//! under the lock and then left alone; they communicate back through
//! their shared flag block and the control flags, never by taking the
//! relay lock themselves.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use castwave_core::{ConfigStore, Stats};

use crate::control::ControlFlags;
use crate::mounts::MountRegistry;
use crate::pipeline::{Directory, SourcePipeline};
use crate::reconcile::update_relays;
use crate::relay::{RelayConfig, RelayOrigin, RelayRecord};
use crate::worker;

/// Shared dependencies handed to the supervisor and its workers.
pub struct RelayContext {
    pub config: Arc<ConfigStore>,
    pub mounts: Arc<MountRegistry>,
    pub stats: Arc<Stats>,
    pub pipeline: Arc<dyn SourcePipeline>,
    pub directory: Arc<dyn Directory>,
    pub flags: Arc<ControlFlags>,
}

#[derive(Default)]
struct RelayLists {
    static_relays: Vec<RelayRecord>,
    master_relays: Vec<RelayRecord>,
}

/// Owns the two relay lists and serialises every mutation of them.
pub struct RelaySupervisor {
    lists: Mutex<RelayLists>,
    ctx: Arc<RelayContext>,
}

impl RelaySupervisor {
    pub fn new(ctx: Arc<RelayContext>) -> Self {
        Self {
            lists: Mutex::new(RelayLists::default()),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }

    /// Reconcile the configured relays against a fresh desired set.
    pub async fn apply_static(&self, desired: Vec<RelayConfig>) {
        let mut lists = self.lists.lock().await;
        let desired = records(desired, RelayOrigin::Configured);
        let to_free = update_relays(&mut lists.static_relays, desired);
        self.tear_down(to_free).await;
        self.promote(&mut lists.static_relays).await;
    }

    /// Reconcile the master-advertised relays against a fresh desired
    /// set (one accepted streamlist).
    pub async fn apply_master(&self, desired: Vec<RelayConfig>) {
        let mut lists = self.lists.lock().await;
        let desired = records(desired, RelayOrigin::Master);
        let to_free = update_relays(&mut lists.master_relays, desired);
        self.tear_down(to_free).await;
        self.promote(&mut lists.master_relays).await;
    }

    /// Promote both lists without reconciliation; wakes on-demand relays
    /// and joins workers that terminated on their own.
    pub async fn rescan(&self) {
        let mut lists = self.lists.lock().await;
        self.promote(&mut lists.static_relays).await;
        self.promote(&mut lists.master_relays).await;
    }

    /// Stop and free every relay in both lists.
    pub async fn shutdown_all(&self) {
        let mut lists = self.lists.lock().await;
        let static_relays = std::mem::take(&mut lists.static_relays);
        self.tear_down(static_relays).await;
        let master_relays = std::mem::take(&mut lists.master_relays);
        self.tear_down(master_relays).await;
    }

    /// Local mounts currently tracked, for the admin surface:
    /// `(static, master)`.
    pub async fn tracked_mounts(&self) -> (Vec<String>, Vec<String>) {
        let lists = self.lists.lock().await;
        let collect = |records: &Vec<RelayRecord>| {
            records
                .iter()
                .map(|r| r.local_mount().to_string())
                .collect()
        };
        (collect(&lists.static_relays), collect(&lists.master_relays))
    }

    /// Whether the relay for `mount` currently has a live worker.
    pub async fn relay_running(&self, mount: &str) -> bool {
        let lists = self.lists.lock().await;
        lists
            .static_relays
            .iter()
            .chain(lists.master_relays.iter())
            .find(|r| r.local_mount() == mount)
            .is_some_and(|r| r.shared.is_running())
    }

    /// Stop every record in `list`, join its worker and release its slot.
    async fn tear_down(&self, list: Vec<RelayRecord>) {
        let mut rebuild = false;
        for mut record in list {
            if let Some(handle) = record.worker.take() {
                debug!(mount = record.local_mount(), "source shutdown request");
                if let Some(source) = &record.source {
                    source.set_running(false);
                }
                if let Err(e) = handle.await {
                    warn!(mount = record.local_mount(), error = %e, "relay worker panicked");
                }
                record.shared.set_running(false);
                record.shared.clear_cleanup();
                rebuild = true;
            }
            if let Some(source) = record.source.take() {
                self.ctx.stats.clear_mount(source.mount());
                self.ctx.mounts.release(source.mount());
            }
            debug!(mount = record.local_mount(), "freed relay");
        }
        if rebuild {
            self.ctx.flags.rebuild_mounts();
        }
    }

    async fn promote(&self, list: &mut Vec<RelayRecord>) {
        for record in list.iter_mut() {
            self.promote_one(record).await;
        }
    }

    /// Apply the promotion rules to one record: reserve its slot, start
    /// its worker if it should run, reap it if it stopped.
    async fn promote_one(&self, record: &mut RelayRecord) {
        if record.source.is_none() {
            if !record.config.local_mount.starts_with('/') {
                warn!(
                    mount = record.local_mount(),
                    "relay mountpoint does not start with /, skipping"
                );
                return;
            }
            match self.ctx.mounts.reserve(&record.config.local_mount) {
                Ok(source) => {
                    debug!(mount = record.local_mount(), "adding relay source");
                    record.source = Some(source);
                }
                Err(e) => {
                    warn!(mount = record.local_mount(), error = %e, "new relay but mountpoint exists");
                }
            }
        }
        if self.try_start(record).await {
            return;
        }
        self.reap(record).await;
    }

    /// Start the record's worker when it should run. Returns true when a
    /// worker was spawned.
    async fn try_start(&self, record: &mut RelayRecord) -> bool {
        let Some(source) = record.source.clone() else {
            return false;
        };
        if !record.config.enabled {
            self.stop_disabled(record).await;
            return false;
        }
        if record.shared.is_running() {
            return false;
        }

        source.set_on_demand(record.config.on_demand);
        if record.config.on_demand {
            let config = self.ctx.config.current();
            self.ctx.mounts.update_settings(&config, &source);
            self.ctx.flags.rebuild_mounts();
            self.ctx
                .stats
                .set_mount(record.local_mount(), "listeners", "0");

            if let Some(fallback_mount) = source.fallback_mount()
                && source.fallback_override()
            {
                debug!(
                    mount = record.local_mount(),
                    fallback = %fallback_mount,
                    "checking fallback for override"
                );
                if let Some(fallback) = self.ctx.mounts.find(&fallback_mount)
                    && fallback.is_running()
                    && fallback.listeners() > 0
                {
                    debug!(
                        fallback = %fallback_mount,
                        listeners = fallback.listeners(),
                        "fallback running with listeners"
                    );
                    source.set_on_demand_req(true);
                }
            }
            if !source.on_demand_req() {
                return false;
            }
            source.set_on_demand_req(false);
        }

        debug!(
            mount = record.local_mount(),
            origin = ?record.origin,
            "spawning relay worker"
        );
        source.set_running(true);
        record.shared.set_running(true);
        record.shared.clear_cleanup();
        record.worker = Some(tokio::spawn(worker::run_relay(
            record.config.clone(),
            record.shared.clone(),
            source,
            self.ctx.clone(),
        )));
        true
    }

    /// A disabled record: stop a live worker if any, then clear its
    /// stats row. The record itself is retained.
    async fn stop_disabled(&self, record: &mut RelayRecord) {
        if let Some(handle) = record.worker.take() {
            info!(mount = record.local_mount(), "disabling running relay");
            if let Some(source) = &record.source {
                source.set_running(false);
            }
            if let Err(e) = handle.await {
                warn!(mount = record.local_mount(), error = %e, "relay worker panicked");
            }
            record.shared.set_running(false);
            record.shared.clear_cleanup();
            self.ctx.flags.rebuild_mounts();
        }
        self.ctx.stats.clear_mount(record.local_mount());
    }

    /// Join a worker that signalled its own termination, and put the
    /// record back into a startable state.
    async fn reap(&self, record: &mut RelayRecord) {
        if !record.shared.cleanup_requested() {
            return;
        }
        let Some(handle) = record.worker.take() else {
            return;
        };
        debug!(mount = record.local_mount(), "waiting for relay worker");
        if let Err(e) = handle.await {
            warn!(mount = record.local_mount(), error = %e, "relay worker panicked");
        }
        record.shared.clear_cleanup();
        record.shared.set_running(false);

        if !record.config.enabled {
            self.ctx.stats.clear_mount(record.local_mount());
            self.ctx.flags.rebuild_mounts();
            return;
        }
        if record.config.on_demand
            && let Some(source) = &record.source
        {
            let config = self.ctx.config.current();
            self.ctx.mounts.update_settings(&config, source);
            self.ctx
                .stats
                .set_mount(record.local_mount(), "listeners", "0");
        }
    }
}

fn records(desired: Vec<RelayConfig>, origin: RelayOrigin) -> Vec<RelayRecord> {
    desired
        .into_iter()
        .map(|config| RelayRecord::new(config, origin))
        .collect()
}

//! Relay records: the description of one relay plus its runtime handles.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;

use castwave_core::config::RelayEntry;

use crate::mounts::Source;

/// Where a relay description came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOrigin {
    /// From the static `relay` configuration list.
    Configured,
    /// Advertised by the master server's streamlist.
    Master,
}

/// Immutable-once-running description of a relay.
///
/// `on_demand` and `enabled` are the exceptions: the reconciler updates
/// them in place on a kept record, since neither warrants restarting a
/// live upstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Mountpoint exposed on this server. Must begin with `/`.
    pub local_mount: String,
    pub upstream_host: String,
    pub upstream_port: u16,
    /// Mountpoint requested from the upstream server.
    pub upstream_mount: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Ask the upstream for ICY metadata. Harmless on non-mp3 streams.
    pub send_icy_metadata: bool,
    /// Connect only when a downstream consumer wants the stream.
    pub on_demand: bool,
    pub enabled: bool,
}

impl RelayConfig {
    /// Username/password pair, when both are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        }
    }
}

impl From<&RelayEntry> for RelayConfig {
    fn from(entry: &RelayEntry) -> Self {
        Self {
            local_mount: entry.local_mount().to_string(),
            upstream_host: entry.server.clone(),
            upstream_port: entry.port,
            upstream_mount: entry.mount.clone(),
            username: entry.username.clone(),
            password: entry.password.clone(),
            send_icy_metadata: entry.mp3metadata,
            on_demand: entry.on_demand,
            enabled: entry.enable,
        }
    }
}

/// Flag block shared between a record and its spawned worker.
///
/// `running` is set by the supervisor when it spawns the worker and
/// cleared when the worker is joined. `cleanup` is raised by the worker on
/// any exit path (or by the supervisor on removal) and cleared after the
/// join.
#[derive(Debug, Default)]
pub struct RelayShared {
    running: AtomicBool,
    cleanup: AtomicBool,
}

impl RelayShared {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn cleanup_requested(&self) -> bool {
        self.cleanup.load(Ordering::SeqCst)
    }

    pub fn request_cleanup(&self) {
        self.cleanup.store(true, Ordering::SeqCst);
    }

    pub fn clear_cleanup(&self) {
        self.cleanup.store(false, Ordering::SeqCst);
    }
}

/// One relay tracked by the supervisor.
///
/// The record keeps its identity across reconciliations: a kept record
/// moves between list generations with its reserved source slot, live
/// worker handle and shared flag block intact.
pub struct RelayRecord {
    pub config: RelayConfig,
    pub origin: RelayOrigin,
    /// Source slot reserved in the mount registry, held from first
    /// acceptance until final teardown. `None` while the mountpoint is
    /// invalid or taken by another source.
    pub source: Option<Arc<Source>>,
    /// Handle of the running worker task, `None` when no task is alive.
    pub worker: Option<JoinHandle<()>>,
    pub shared: Arc<RelayShared>,
}

impl RelayRecord {
    pub fn new(config: RelayConfig, origin: RelayOrigin) -> Self {
        Self {
            config,
            origin,
            source: None,
            worker: None,
            shared: Arc::new(RelayShared::default()),
        }
    }

    pub fn local_mount(&self) -> &str {
        &self.config.local_mount
    }
}

//! Source slots and the mount registry.
//!
//! A [`Source`] is the runtime state of one mountpoint: the relay worker
//! installs the upstream connection on it, the pipeline drives it, and
//! the supervisor signals shutdown through its `running` flag. The
//! [`MountRegistry`] hands out slots keyed by mountpoint and guarantees a
//! mount is reserved by at most one owner at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use castwave_core::{Config, Stats};

use crate::http::ResponseHead;

#[derive(Debug, Error)]
pub enum MountError {
    #[error("mountpoint {0} is already reserved")]
    Taken(String),
}

/// Upstream connection installed on a source while a relay streams.
#[derive(Debug)]
pub struct SourceClient {
    pub stream: TcpStream,
    pub response: ResponseHead,
    /// Bytes read past the response head; consumed before the socket.
    pub read_ahead: Vec<u8>,
}

/// Runtime state of one mountpoint.
#[derive(Debug)]
pub struct Source {
    mount: String,
    running: AtomicBool,
    on_demand: AtomicBool,
    on_demand_req: AtomicBool,
    listeners: AtomicU64,
    yp_public: AtomicI64,
    fallback_mount: RwLock<Option<String>>,
    fallback_override: AtomicBool,
    client: Mutex<Option<SourceClient>>,
}

impl Source {
    fn new(mount: String) -> Self {
        Self {
            mount,
            running: AtomicBool::new(false),
            on_demand: AtomicBool::new(false),
            on_demand_req: AtomicBool::new(false),
            listeners: AtomicU64::new(0),
            yp_public: AtomicI64::new(0),
            fallback_mount: RwLock::new(None),
            fallback_override: AtomicBool::new(false),
            client: Mutex::new(None),
        }
    }

    pub fn mount(&self) -> &str {
        &self.mount
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The supervisor clears this to stop a streaming relay; the pipeline
    /// observes it between reads.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn on_demand(&self) -> bool {
        self.on_demand.load(Ordering::SeqCst)
    }

    pub fn set_on_demand(&self, on_demand: bool) {
        self.on_demand.store(on_demand, Ordering::SeqCst);
    }

    /// Pending request to connect an on-demand relay now.
    pub fn on_demand_req(&self) -> bool {
        self.on_demand_req.load(Ordering::SeqCst)
    }

    pub fn set_on_demand_req(&self, req: bool) {
        self.on_demand_req.store(req, Ordering::SeqCst);
    }

    pub fn listeners(&self) -> u64 {
        self.listeners.load(Ordering::SeqCst)
    }

    pub fn set_listeners(&self, listeners: u64) {
        self.listeners.store(listeners, Ordering::SeqCst);
    }

    pub fn add_listeners(&self, listeners: u64) {
        self.listeners.fetch_add(listeners, Ordering::SeqCst);
    }

    /// Move the listener count off this source, returning it.
    pub fn take_listeners(&self) -> u64 {
        self.listeners.swap(0, Ordering::SeqCst)
    }

    pub fn yp_public(&self) -> i64 {
        self.yp_public.load(Ordering::SeqCst)
    }

    pub fn set_yp_public(&self, value: i64) {
        self.yp_public.store(value, Ordering::SeqCst);
    }

    pub fn fallback_mount(&self) -> Option<String> {
        self.fallback_mount
            .read()
            .expect("fallback lock poisoned")
            .clone()
    }

    pub fn fallback_override(&self) -> bool {
        self.fallback_override.load(Ordering::SeqCst)
    }

    pub fn set_fallback(&self, mount: Option<String>, fallback_override: bool) {
        *self
            .fallback_mount
            .write()
            .expect("fallback lock poisoned") = mount;
        self.fallback_override
            .store(fallback_override, Ordering::SeqCst);
    }

    /// Bind a freshly established upstream connection to this source.
    pub async fn install_client(&self, client: SourceClient) {
        *self.client.lock().await = Some(client);
    }

    pub async fn take_client(&self) -> Option<SourceClient> {
        self.client.lock().await.take()
    }

    pub async fn has_client(&self) -> bool {
        self.client.lock().await.is_some()
    }
}

/// Registry of source slots, keyed by mountpoint.
#[derive(Debug, Default)]
pub struct MountRegistry {
    sources: RwLock<HashMap<String, Arc<Source>>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a mountpoint, failing if another source already holds it.
    pub fn reserve(&self, mount: &str) -> Result<Arc<Source>, MountError> {
        let mut sources = self.sources.write().expect("mount lock poisoned");
        if sources.contains_key(mount) {
            return Err(MountError::Taken(mount.to_string()));
        }
        let source = Arc::new(Source::new(mount.to_string()));
        sources.insert(mount.to_string(), source.clone());
        Ok(source)
    }

    pub fn find(&self, mount: &str) -> Option<Arc<Source>> {
        let sources = self.sources.read().expect("mount lock poisoned");
        sources.get(mount).cloned()
    }

    /// Drop a mountpoint's slot. Safe to call for a mount that was never
    /// reserved.
    pub fn release(&self, mount: &str) {
        let mut sources = self.sources.write().expect("mount lock poisoned");
        if sources.remove(mount).is_some() {
            debug!(mount, "released source slot");
        }
    }

    /// Apply the configured per-mount settings to one source.
    pub fn update_settings(&self, config: &Config, source: &Source) {
        match config.find_mount(source.mount()) {
            Some(entry) => {
                source.set_fallback(entry.fallback_mount.clone(), entry.fallback_override);
            }
            None => source.set_fallback(None, false),
        }
    }

    /// Recompute settings for every reserved mount and refresh the
    /// listener counts on the stats table.
    pub fn recheck(&self, config: &Config, stats: &Stats) {
        let sources: Vec<Arc<Source>> = {
            let sources = self.sources.read().expect("mount lock poisoned");
            sources.values().cloned().collect()
        };
        for source in sources {
            self.update_settings(config, &source);
            stats.set_mount(source.mount(), "listeners", source.listeners().to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.sources.read().expect("mount lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use castwave_core::config::MountEntry;

    #[test]
    fn reserve_is_exclusive() {
        let registry = MountRegistry::new();
        let source = registry.reserve("/live").unwrap();
        assert_eq!(source.mount(), "/live");
        assert!(matches!(
            registry.reserve("/live"),
            Err(MountError::Taken(_))
        ));
        registry.release("/live");
        assert!(registry.reserve("/live").is_ok());
    }

    #[test]
    fn settings_follow_config() {
        let registry = MountRegistry::new();
        let source = registry.reserve("/live").unwrap();

        let mut config = Config::default();
        config.mounts.push(MountEntry {
            mount: "/live".to_string(),
            fallback_mount: Some("/backup".to_string()),
            fallback_override: true,
        });
        registry.update_settings(&config, &source);
        assert_eq!(source.fallback_mount().as_deref(), Some("/backup"));
        assert!(source.fallback_override());

        // entry removed from config: settings reset
        config.mounts.clear();
        registry.update_settings(&config, &source);
        assert!(source.fallback_mount().is_none());
        assert!(!source.fallback_override());
    }

    #[test]
    fn listeners_move_in_one_step() {
        let registry = MountRegistry::new();
        let from = registry.reserve("/a").unwrap();
        let to = registry.reserve("/b").unwrap();
        from.set_listeners(7);
        to.add_listeners(from.take_listeners());
        assert_eq!(from.listeners(), 0);
        assert_eq!(to.listeners(), 7);
    }
}

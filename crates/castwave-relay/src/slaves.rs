//! Registry of slave hosts this node can redirect listeners to.
//!
//! Peers announce themselves through the `ice-redirect: server:port`
//! header on their relay fetches; each entry counts the listeners that
//! arrived carrying it and disappears when that count reaches zero.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use castwave_core::Stats;

/// Concurrent `(server, port) -> listener count` table.
pub struct SlaveRegistry {
    hosts: RwLock<HashMap<(String, u16), u32>>,
    stats: Arc<Stats>,
}

impl SlaveRegistry {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            stats,
        }
    }

    /// Register a listener's origin peer from its `ice-redirect` header
    /// value (e.g. `"stream2.example.org:8000"`). Malformed values are
    /// ignored.
    pub async fn host_add(&self, header: &str) {
        let Some((server, port)) = parse_host_port(header) else {
            return;
        };
        let mut hosts = self.hosts.write().await;
        match hosts.get_mut(&(server.clone(), port)) {
            Some(count) => {
                *count += 1;
                debug!(server = %server, port, "slave host already known, increasing count");
            }
            None => {
                hosts.insert((server.clone(), port), 1);
                info!(total = hosts.len(), server = %server, port, "slave host added");
            }
        }
        self.stats.set_counter("slave_count", hosts.len() as u64);
    }

    /// Drop one listener from the peer named by its `ice-redirect`
    /// header, unlinking the entry when the count reaches zero.
    pub async fn host_remove(&self, header: &str) {
        let Some((server, port)) = parse_host_port(header) else {
            return;
        };
        let mut hosts = self.hosts.write().await;
        let key = (server, port);
        if let Some(count) = hosts.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                hosts.remove(&key);
                info!(server = %key.0, port = key.1, "slave host removed");
            }
        }
        self.stats.set_counter("slave_count", hosts.len() as u64);
    }

    /// Seed a peer without touching an existing entry's count. Used for
    /// the master itself when this node participates in load sharing.
    pub async fn ensure(&self, server: &str, port: u16) {
        let mut hosts = self.hosts.write().await;
        let key = (server.to_string(), port);
        if !hosts.contains_key(&key) {
            hosts.insert(key, 1);
            info!(total = hosts.len(), server, port, "slave host added");
            self.stats.set_counter("slave_count", hosts.len() as u64);
        }
    }

    /// Choose a peer uniformly at random.
    pub async fn pick_random(&self) -> Option<(String, u16)> {
        let hosts = self.hosts.read().await;
        if hosts.is_empty() {
            return None;
        }
        let which = rand::random::<u64>() as usize % hosts.len();
        hosts
            .keys()
            .nth(which)
            .map(|(server, port)| (server.clone(), *port))
    }

    /// Redirect target for a saturated mount: the `Location` for an HTTP
    /// 302 pointing a listener at a random peer.
    pub async fn redirect_location(&self, mountpoint: &str) -> Option<String> {
        let (server, port) = self.pick_random().await?;
        info!(server = %server, port, "redirecting client to slave server");
        Some(format!("http://{server}:{port}{mountpoint}"))
    }

    pub async fn count(&self) -> usize {
        self.hosts.read().await.len()
    }
}

fn parse_host_port(header: &str) -> Option<(String, u16)> {
    let (server, port) = header.split_once(':')?;
    let port = port.trim().parse::<u16>().ok()?;
    if server.is_empty() {
        return None;
    }
    Some((server.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SlaveRegistry {
        SlaveRegistry::new(Arc::new(Stats::new()))
    }

    #[tokio::test]
    async fn add_remove_balance() {
        let slaves = registry();
        slaves.host_add("peer.example.org:8000").await;
        slaves.host_add("peer.example.org:8000").await;
        assert_eq!(slaves.count().await, 1);

        slaves.host_remove("peer.example.org:8000").await;
        assert_eq!(slaves.count().await, 1);
        slaves.host_remove("peer.example.org:8000").await;
        assert_eq!(slaves.count().await, 0);
    }

    #[tokio::test]
    async fn slave_count_gauge_tracks_entries() {
        let stats = Arc::new(Stats::new());
        let slaves = SlaveRegistry::new(stats.clone());
        slaves.host_add("a.example.org:8000").await;
        slaves.host_add("b.example.org:8000").await;
        assert_eq!(stats.counter("slave_count"), 2);
        slaves.host_remove("a.example.org:8000").await;
        assert_eq!(stats.counter("slave_count"), 1);
    }

    #[tokio::test]
    async fn ensure_does_not_bump_existing() {
        let slaves = registry();
        slaves.host_add("master.example.org:8000").await;
        slaves.ensure("master.example.org", 8000).await;
        slaves.host_remove("master.example.org:8000").await;
        // the ensure did not add a second reference
        assert_eq!(slaves.count().await, 0);
    }

    #[tokio::test]
    async fn malformed_headers_ignored() {
        let slaves = registry();
        slaves.host_add("no-port-here").await;
        slaves.host_add(":8000").await;
        slaves.host_add("host:not-a-port").await;
        assert_eq!(slaves.count().await, 0);
    }

    #[tokio::test]
    async fn pick_random_empty_and_single() {
        let slaves = registry();
        assert!(slaves.pick_random().await.is_none());
        slaves.host_add("only.example.org:8000").await;
        assert_eq!(
            slaves.pick_random().await,
            Some(("only.example.org".to_string(), 8000))
        );
    }

    #[tokio::test]
    async fn redirect_location_includes_mount() {
        let slaves = registry();
        slaves.host_add("peer.example.org:8000").await;
        let location = slaves.redirect_location("/live").await.unwrap();
        assert_eq!(location, "http://peer.example.org:8000/live");
    }
}

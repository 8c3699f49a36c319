//! In-process statistics table.
//!
//! Global counters plus per-mount variable rows, published by the relay
//! control plane and read by the admin surface. Writers take short write
//! locks; readers get point-in-time values.

use std::collections::HashMap;
use std::sync::RwLock;

/// Statistics table shared across the server.
#[derive(Debug, Default)]
pub struct Stats {
    counters: RwLock<HashMap<String, u64>>,
    mounts: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one to a global counter, creating it at zero first.
    pub fn increment(&self, counter: &str) {
        let mut counters = self.counters.write().expect("stats lock poisoned");
        *counters.entry(counter.to_string()).or_insert(0) += 1;
    }

    /// Set a global counter to an absolute value (gauges).
    pub fn set_counter(&self, counter: &str, value: u64) {
        let mut counters = self.counters.write().expect("stats lock poisoned");
        counters.insert(counter.to_string(), value);
    }

    /// Current value of a global counter; missing counters read as zero.
    pub fn counter(&self, counter: &str) -> u64 {
        let counters = self.counters.read().expect("stats lock poisoned");
        counters.get(counter).copied().unwrap_or(0)
    }

    /// Set a variable on a mount's row, creating the row if needed.
    pub fn set_mount(&self, mount: &str, var: &str, value: impl Into<String>) {
        let mut mounts = self.mounts.write().expect("stats lock poisoned");
        mounts
            .entry(mount.to_string())
            .or_default()
            .insert(var.to_string(), value.into());
    }

    /// Read a variable from a mount's row.
    pub fn mount_var(&self, mount: &str, var: &str) -> Option<String> {
        let mounts = self.mounts.read().expect("stats lock poisoned");
        mounts.get(mount).and_then(|row| row.get(var)).cloned()
    }

    /// Drop a mount's whole row. Used when a relay is removed or disabled.
    pub fn clear_mount(&self, mount: &str) {
        let mut mounts = self.mounts.write().expect("stats lock poisoned");
        mounts.remove(mount);
    }

    /// Whether a mount currently has a stats row.
    pub fn has_mount(&self, mount: &str) -> bool {
        let mounts = self.mounts.read().expect("stats lock poisoned");
        mounts.contains_key(mount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::new();
        assert_eq!(stats.counter("source_relay_connections"), 0);
        stats.increment("source_relay_connections");
        stats.increment("source_relay_connections");
        assert_eq!(stats.counter("source_relay_connections"), 2);
    }

    #[test]
    fn gauge_overwrites() {
        let stats = Stats::new();
        stats.set_counter("slave_count", 3);
        stats.set_counter("slave_count", 1);
        assert_eq!(stats.counter("slave_count"), 1);
    }

    #[test]
    fn mount_rows_set_and_clear() {
        let stats = Stats::new();
        stats.set_mount("/live", "source_ip", "198.51.100.7");
        stats.set_mount("/live", "listeners", "0");
        assert_eq!(
            stats.mount_var("/live", "source_ip").as_deref(),
            Some("198.51.100.7")
        );
        stats.clear_mount("/live");
        assert!(!stats.has_mount("/live"));
        assert!(stats.mount_var("/live", "listeners").is_none());
    }
}

//! Server configuration for castwave.
//!
//! Loaded from a JSON file. Every section and field carries a default so a
//! partial file works. The live configuration is held behind a
//! [`ConfigStore`] and swapped atomically on reload; holders of a previous
//! snapshot keep reading it until they drop their `Arc`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Complete castwave configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Hostname this server advertises, used for the `ice-redirect`
    /// header when participating in upstream load sharing.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Port listeners connect to on this server.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub master: MasterConfig,
    /// Statically configured relays.
    #[serde(default, rename = "relay")]
    pub relays: Vec<RelayEntry>,
    /// Per-mount settings (fallback wiring).
    #[serde(default, rename = "mount")]
    pub mounts: Vec<MountEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            listen_port: default_listen_port(),
            master: MasterConfig::default(),
            relays: Vec::new(),
            mounts: Vec::new(),
        }
    }
}

/// Master-server settings: where the streamlist is polled from and how
/// this node presents itself as a slave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Master hostname. Polling is disabled while unset.
    pub server: Option<String>,
    /// Plain HTTP port on the master; also the port relayed streams are
    /// pulled from.
    #[serde(default = "default_listen_port")]
    pub server_port: u16,
    /// When set, the streamlist is fetched over HTTPS on this port.
    pub ssl_port: Option<u16>,
    #[serde(default = "default_master_username")]
    pub username: String,
    /// Polling is disabled while unset.
    pub password: Option<String>,
    /// Seconds between streamlist polls.
    #[serde(default = "default_update_interval")]
    pub update_interval: u64,
    /// Forward our master credentials on master-advertised relays.
    #[serde(default)]
    pub relay_auth: bool,
    /// When set, this node registers itself with the master for listener
    /// redirects via the `ice-redirect` header.
    pub redirect_port: Option<u16>,
    /// Default `on_demand` flag for master-advertised relays.
    #[serde(default)]
    pub on_demand: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            server: None,
            server_port: default_listen_port(),
            ssl_port: None,
            username: default_master_username(),
            password: None,
            update_interval: default_update_interval(),
            relay_auth: false,
            redirect_port: None,
            on_demand: false,
        }
    }
}

/// One statically configured relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEntry {
    /// Upstream hostname.
    pub server: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
    /// Mountpoint on the upstream server.
    pub mount: String,
    /// Mountpoint exposed locally; defaults to `mount` when omitted.
    pub local_mount: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Request ICY metadata from the upstream.
    #[serde(default = "default_true")]
    pub mp3metadata: bool,
    #[serde(default)]
    pub on_demand: bool,
    #[serde(default = "default_true")]
    pub enable: bool,
}

impl RelayEntry {
    /// Locally exposed mountpoint for this relay.
    pub fn local_mount(&self) -> &str {
        self.local_mount.as_deref().unwrap_or(&self.mount)
    }
}

/// Per-mount settings applied to reserved sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountEntry {
    pub mount: String,
    /// Mount listeners are moved to when this one fails.
    pub fallback_mount: Option<String>,
    /// Let a running fallback's listeners be reclaimed by this mount.
    #[serde(default)]
    pub fallback_override: bool,
}

impl Config {
    /// Find the settings entry for a mount, if one is configured.
    pub fn find_mount(&self, mount: &str) -> Option<&MountEntry> {
        self.mounts.iter().find(|m| m.mount == mount)
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_listen_port() -> u16 {
    8000
}

fn default_master_username() -> String {
    "relay".to_string()
}

fn default_update_interval() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

/// Load and parse a configuration file.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Holds the live configuration and swaps it atomically on reload.
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<Config>>,
}

impl ConfigStore {
    /// Create a store around an already-built configuration, with no
    /// backing file. `reload` is a no-op for such a store.
    pub fn new(config: Config) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Create a store backed by a config file, loading it once.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = load_config_file(&path)?;
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// Snapshot of the current configuration.
    pub fn current(&self) -> Arc<Config> {
        self.current.read().expect("config lock poisoned").clone()
    }

    /// Swap in a new configuration.
    pub fn replace(&self, config: Config) {
        let old = self.current();
        warn_credential_rotations(&old, &config);
        *self.current.write().expect("config lock poisoned") = Arc::new(config);
    }

    /// Re-read the backing file and swap the result in. Stores without a
    /// backing file keep their current configuration.
    pub fn reload(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let config = load_config_file(path)?;
            self.replace(config);
        }
        Ok(())
    }
}

/// Relays are only restarted when their upstream endpoint or metadata
/// setting changes, so a credential-only edit leaves the running relay on
/// the old credentials until it reconnects for another reason. Warn about
/// each such relay at swap time.
fn warn_credential_rotations(old: &Config, new: &Config) {
    for entry in &new.relays {
        let Some(previous) = old
            .relays
            .iter()
            .find(|r| r.local_mount() == entry.local_mount())
        else {
            continue;
        };
        let endpoint_unchanged = previous.server == entry.server
            && previous.port == entry.port
            && previous.mount == entry.mount
            && previous.mp3metadata == entry.mp3metadata;
        let credentials_changed =
            previous.username != entry.username || previous.password != entry.password;
        if endpoint_unchanged && credentials_changed {
            warn!(
                mount = entry.local_mount(),
                "relay credentials changed; a running relay keeps the old \
                 credentials until it next reconnects"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.master.username, "relay");
        assert_eq!(config.master.update_interval, 120);
        assert!(config.master.server.is_none());
        assert!(config.relays.is_empty());
    }

    #[test]
    fn relay_entry_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"relay": [{"server": "upstream.example.org", "mount": "/live"}]}"#,
        )
        .unwrap();
        let relay = &config.relays[0];
        assert_eq!(relay.port, 8000);
        assert_eq!(relay.local_mount(), "/live");
        assert!(relay.mp3metadata);
        assert!(relay.enable);
        assert!(!relay.on_demand);
    }

    #[test]
    fn local_mount_override() {
        let config: Config = serde_json::from_str(
            r#"{"relay": [{"server": "h", "mount": "/a", "local_mount": "/b"}]}"#,
        )
        .unwrap();
        assert_eq!(config.relays[0].local_mount(), "/b");
    }

    #[test]
    fn master_section_parses() {
        let config: Config = serde_json::from_str(
            r#"{"master": {"server": "master.example.org", "server_port": 8100,
                "password": "hackme", "relay_auth": true, "on_demand": true}}"#,
        )
        .unwrap();
        assert_eq!(config.master.server.as_deref(), Some("master.example.org"));
        assert_eq!(config.master.server_port, 8100);
        assert!(config.master.relay_auth);
        assert!(config.master.on_demand);
        assert!(config.master.ssl_port.is_none());
    }

    #[test]
    fn store_replace_swaps_snapshot() {
        let store = ConfigStore::new(Config::default());
        let before = store.current();
        let mut updated = Config::default();
        updated.hostname = "stream.example.org".to_string();
        store.replace(updated);
        assert_eq!(before.hostname, "localhost");
        assert_eq!(store.current().hostname, "stream.example.org");
    }

    #[test]
    fn find_mount_settings() {
        let config: Config = serde_json::from_str(
            r#"{"mount": [{"mount": "/live", "fallback_mount": "/backup",
                "fallback_override": true}]}"#,
        )
        .unwrap();
        let entry = config.find_mount("/live").unwrap();
        assert_eq!(entry.fallback_mount.as_deref(), Some("/backup"));
        assert!(entry.fallback_override);
        assert!(config.find_mount("/other").is_none());
    }
}

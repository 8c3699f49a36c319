//! Master streamlist polling.
//!
//! On each full control-loop cycle one fetch is fired (detached, so a
//! slow master never blocks the loop) against
//! `/admin/streamlist.txt` on the master. A 200 response body is a
//! newline-separated list of mounts, each of which becomes a desired
//! master relay; any other outcome discards the fetch and leaves the
//! current master relays untouched.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use castwave_core::Config;
use castwave_core::config::MasterConfig;

use crate::relay::RelayConfig;
use crate::supervisor::RelaySupervisor;

/// Overall cap on one streamlist fetch.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("streamlist request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Where and how to fetch the streamlist.
#[derive(Debug, Clone)]
pub struct StreamlistRequest {
    pub url: String,
    pub username: String,
    pub password: String,
}

impl StreamlistRequest {
    /// Build from the master section; `None` while polling is
    /// unconfigured (no server, no password, or port zero).
    pub fn from_config(master: &MasterConfig) -> Option<Self> {
        let server = master.server.as_deref()?;
        let password = master.password.as_deref()?;
        if master.server_port == 0 {
            return None;
        }
        let (protocol, port) = match master.ssl_port {
            Some(ssl_port) => ("https", ssl_port),
            None => ("http", master.server_port),
        };
        Some(Self {
            url: format!("{protocol}://{server}:{port}/admin/streamlist.txt"),
            username: master.username.clone(),
            password: password.to_string(),
        })
    }
}

/// A streamlist response: final status plus body chunks as they arrive.
pub struct StreamlistResponse {
    pub status: u16,
    pub body: mpsc::Receiver<Vec<u8>>,
}

/// Fetcher seam so the poller can be driven without a live master.
#[async_trait]
pub trait StreamlistFetcher: Send + Sync {
    async fn fetch(&self, request: &StreamlistRequest) -> Result<StreamlistResponse, FetchError>;
}

/// reqwest-backed fetcher used in production.
pub struct HttpStreamlistFetcher {
    client: reqwest::Client,
}

impl HttpStreamlistFetcher {
    pub fn new() -> Result<Self, FetchError> {
        // Slaves commonly talk to masters with self-signed certificates,
        // so peer verification stays off for this fetch.
        let client = reqwest::Client::builder()
            .user_agent(castwave_core::SERVER_VERSION)
            .danger_accept_invalid_certs(true)
            .timeout(FETCH_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StreamlistFetcher for HttpStreamlistFetcher {
    async fn fetch(&self, request: &StreamlistRequest) -> Result<StreamlistResponse, FetchError> {
        let mut response = self
            .client
            .get(&request.url)
            .basic_auth(&request.username, Some(&request.password))
            .send()
            .await?;
        let status = response.status().as_u16();
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            loop {
                match response.chunk().await {
                    Ok(Some(chunk)) => {
                        if tx.send(chunk.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "streamlist body read failed");
                        break;
                    }
                }
            }
        });
        Ok(StreamlistResponse { status, body: rx })
    }
}

/// Accumulates streamlist body chunks into relay descriptions.
///
/// Only lines terminated by `\n` are consumed; a trailing unterminated
/// line is buffered and prepended to the next chunk, and dropped if the
/// body ends without a final newline. `\r` and blank lines are ignored.
pub struct StreamlistParser {
    host: String,
    port: u16,
    on_demand: bool,
    credentials: Option<(String, String)>,
    pending: Vec<u8>,
    relays: Vec<RelayConfig>,
}

impl StreamlistParser {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        on_demand: bool,
        credentials: Option<(String, String)>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            on_demand,
            credentials,
            pending: Vec::new(),
            relays: Vec::new(),
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let mount = line.trim_end_matches(['\n', '\r']);
            if mount.is_empty() {
                continue;
            }
            debug!(mount, "read from master");
            self.relays.push(RelayConfig {
                local_mount: mount.to_string(),
                upstream_host: self.host.clone(),
                upstream_port: self.port,
                upstream_mount: mount.to_string(),
                username: self.credentials.as_ref().map(|(user, _)| user.clone()),
                password: self.credentials.as_ref().map(|(_, pass)| pass.clone()),
                send_icy_metadata: true,
                on_demand: self.on_demand,
                enabled: true,
            });
        }
    }

    pub fn finish(self) -> Vec<RelayConfig> {
        if !self.pending.is_empty() {
            debug!(
                bytes = self.pending.len(),
                "dropping unterminated trailing streamlist line"
            );
        }
        self.relays
    }
}

/// Run one streamlist poll and apply the result.
///
/// Does nothing while master polling is unconfigured; discards the fetch
/// on transport failure or any non-200 status.
pub async fn poll_master(
    supervisor: &RelaySupervisor,
    fetcher: &dyn StreamlistFetcher,
    config: &Config,
) {
    let master = &config.master;
    let Some(request) = StreamlistRequest::from_config(master) else {
        return;
    };
    let host = master.server.clone().unwrap_or_default();
    let credentials = master
        .relay_auth
        .then(|| (master.username.clone(), master.password.clone().unwrap_or_default()));
    let mut parser = StreamlistParser::new(host, master.server_port, master.on_demand, credentials);

    debug!(url = %request.url, "checking master stream list");
    let mut response = match fetcher.fetch(&request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(url = %request.url, error = %e, "streamlist fetch failed");
            return;
        }
    };
    if response.status != 200 {
        warn!(
            url = %request.url,
            status = response.status,
            "failed response from master"
        );
        return;
    }
    while let Some(chunk) = response.body.recv().await {
        parser.push_chunk(&chunk);
    }
    supervisor.apply_master(parser.finish()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> StreamlistParser {
        StreamlistParser::new("master.example.org", 8000, false, None)
    }

    fn mounts(relays: &[RelayConfig]) -> Vec<&str> {
        relays.iter().map(|r| r.local_mount.as_str()).collect()
    }

    #[test]
    fn single_chunk_body() {
        let mut p = parser();
        p.push_chunk(b"/m1\r\n/m2\n");
        let relays = p.finish();
        assert_eq!(mounts(&relays), ["/m1", "/m2"]);
        let relay = &relays[0];
        assert_eq!(relay.upstream_host, "master.example.org");
        assert_eq!(relay.upstream_port, 8000);
        assert_eq!(relay.upstream_mount, "/m1");
        assert!(relay.send_icy_metadata);
        assert!(relay.enabled);
        assert!(relay.username.is_none());
    }

    #[test]
    fn chunk_split_mid_line_is_equivalent() {
        let mut whole = parser();
        whole.push_chunk(b"/first\n/second\n/third\n");

        let mut split = parser();
        split.push_chunk(b"/fir");
        split.push_chunk(b"st\n/seco");
        split.push_chunk(b"nd\n/third\n");

        assert_eq!(mounts(&whole.finish()), mounts(&split.finish()));
    }

    #[test]
    fn blank_lines_skipped() {
        let mut p = parser();
        p.push_chunk(b"\n/one\n\r\n/two\n\n");
        assert_eq!(mounts(&p.finish()), ["/one", "/two"]);
    }

    #[test]
    fn unterminated_tail_dropped() {
        let mut p = parser();
        p.push_chunk(b"/kept\n/no-newline");
        assert_eq!(mounts(&p.finish()), ["/kept"]);
    }

    #[test]
    fn credentials_copied_when_relay_auth() {
        let mut p = StreamlistParser::new(
            "master.example.org",
            8000,
            true,
            Some(("relay".to_string(), "hackme".to_string())),
        );
        p.push_chunk(b"/auth\n");
        let relays = p.finish();
        assert_eq!(relays[0].username.as_deref(), Some("relay"));
        assert_eq!(relays[0].password.as_deref(), Some("hackme"));
        assert!(relays[0].on_demand);
    }

    #[test]
    fn request_url_selects_ssl_port() {
        let mut master = MasterConfig::default();
        master.server = Some("master.example.org".to_string());
        master.password = Some("hackme".to_string());
        master.server_port = 8000;
        let request = StreamlistRequest::from_config(&master).unwrap();
        assert_eq!(
            request.url,
            "http://master.example.org:8000/admin/streamlist.txt"
        );

        master.ssl_port = Some(8443);
        let request = StreamlistRequest::from_config(&master).unwrap();
        assert_eq!(
            request.url,
            "https://master.example.org:8443/admin/streamlist.txt"
        );
    }

    #[test]
    fn unconfigured_master_yields_no_request() {
        assert!(StreamlistRequest::from_config(&MasterConfig::default()).is_none());
        let mut master = MasterConfig::default();
        master.server = Some("master.example.org".to_string());
        // still no password
        assert!(StreamlistRequest::from_config(&master).is_none());
    }
}

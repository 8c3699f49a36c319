//! HTTP/1.0 plumbing for upstream relay fetches.
//!
//! The relay request is written raw onto the upstream socket and the
//! response head is read with a bounded buffer, leaving the socket
//! positioned at the start of the stream body. Bytes read past the head
//! are returned so nothing is lost.

use base64::Engine as _;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::relay::RelayConfig;

/// Upper bound on the upstream response head.
pub const MAX_HEAD_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("connection closed before the response head completed")]
    UnexpectedEof,

    #[error("response head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,

    #[error("response head is not valid UTF-8")]
    NotUtf8,

    #[error("malformed status line {0:?}")]
    BadStatusLine(String),

    #[error("upstream returned {status} {reason}")]
    ErrorStatus { status: u16, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parsed response head: status line plus headers.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Parse a head block (without the terminating blank line).
    ///
    /// The protocol token is not inspected, so `ICY 200 OK` responses
    /// from shoutcast-style upstreams parse like `HTTP/1.0 200 OK`.
    pub fn parse(raw: &str) -> Result<Self, HttpError> {
        let mut lines = raw.split("\r\n").filter(|l| !l.is_empty());
        let status_line = lines
            .next()
            .ok_or_else(|| HttpError::BadStatusLine(String::new()))?;

        let mut parts = status_line.splitn(3, ' ');
        let _protocol = parts
            .next()
            .ok_or_else(|| HttpError::BadStatusLine(status_line.to_string()))?;
        let status = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| HttpError::BadStatusLine(status_line.to_string()))?;
        let reason = parts.next().unwrap_or("").to_string();

        let mut headers = Vec::new();
        for line in lines {
            // header lines without a colon are dropped, not fatal
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        Ok(Self {
            status,
            reason,
            headers,
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Reject anything outside the 2xx range.
    pub fn ensure_success(self) -> Result<Self, HttpError> {
        if (200..300).contains(&self.status) {
            Ok(self)
        } else {
            Err(HttpError::ErrorStatus {
                status: self.status,
                reason: self.reason,
            })
        }
    }
}

/// Format the upstream GET request for a relay.
///
/// `redirect` carries this server's `hostname:master_redirect_port` pair
/// when it participates in upstream load sharing.
pub fn format_relay_request(relay: &RelayConfig, redirect: Option<(&str, u16)>) -> String {
    let mut request = format!(
        "GET {} HTTP/1.0\r\nUser-Agent: {}\r\n",
        relay.upstream_mount,
        castwave_core::SERVER_VERSION,
    );
    if relay.send_icy_metadata {
        request.push_str("Icy-MetaData: 1\r\n");
    }
    if let Some((hostname, port)) = redirect {
        request.push_str(&format!("ice-redirect: {hostname}:{port}\r\n"));
    }
    if let Some((user, pass)) = relay.credentials() {
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    request
}

/// Read the response head off a fresh upstream connection.
///
/// Returns the parsed head and any body bytes that arrived with it.
pub async fn read_response_head(
    stream: &mut TcpStream,
) -> Result<(ResponseHead, Vec<u8>), HttpError> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::UnexpectedEof);
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = head_end(&buf) {
            let raw = std::str::from_utf8(&buf[..end]).map_err(|_| HttpError::NotUtf8)?;
            let head = ResponseHead::parse(raw)?;
            let read_ahead = buf[end + 4..].to_vec();
            return Ok((head, read_ahead));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(HttpError::HeadTooLarge);
        }
    }
}

fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(icy: bool, creds: bool) -> RelayConfig {
        RelayConfig {
            local_mount: "/local".to_string(),
            upstream_host: "upstream.example.org".to_string(),
            upstream_port: 8000,
            upstream_mount: "/stream".to_string(),
            username: creds.then(|| "user".to_string()),
            password: creds.then(|| "pass".to_string()),
            send_icy_metadata: icy,
            on_demand: false,
            enabled: true,
        }
    }

    #[test]
    fn request_minimal() {
        let request = format_relay_request(&relay(false, false), None);
        assert!(request.starts_with("GET /stream HTTP/1.0\r\n"));
        assert!(request.contains("User-Agent: castwave/"));
        assert!(!request.contains("Icy-MetaData"));
        assert!(!request.contains("Authorization"));
        assert!(!request.contains("ice-redirect"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn request_full() {
        let request = format_relay_request(&relay(true, true), Some(("local.example.org", 8001)));
        assert!(request.contains("Icy-MetaData: 1\r\n"));
        assert!(request.contains("ice-redirect: local.example.org:8001\r\n"));
        // base64("user:pass")
        assert!(request.contains("Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[test]
    fn parse_ok_response() {
        let head = ResponseHead::parse(
            "HTTP/1.0 200 OK\r\nContent-Type: audio/mpeg\r\nicy-name: test radio",
        )
        .unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.header("content-type"), Some("audio/mpeg"));
        assert_eq!(head.header("ICY-Name"), Some("test radio"));
        assert!(head.ensure_success().is_ok());
    }

    #[test]
    fn parse_icy_protocol() {
        let head = ResponseHead::parse("ICY 200 OK").unwrap();
        assert_eq!(head.status, 200);
    }

    #[test]
    fn error_status_rejected() {
        let head = ResponseHead::parse("HTTP/1.0 403 Forbidden").unwrap();
        match head.ensure_success() {
            Err(HttpError::ErrorStatus { status, reason }) => {
                assert_eq!(status, 403);
                assert_eq!(reason, "Forbidden");
            }
            other => panic!("expected ErrorStatus, got {other:?}"),
        }
    }

    #[test]
    fn garbage_status_line_rejected() {
        assert!(matches!(
            ResponseHead::parse("not a response"),
            Err(HttpError::BadStatusLine(_))
        ));
    }
}

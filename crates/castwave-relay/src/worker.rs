//! The per-relay worker task.
//!
//! One worker owns one upstream connection: it fetches the stream over
//! HTTP/1.0, hands the byte stream to the source pipeline and reports its
//! own termination through the record's shared flag block. State machine:
//! Connecting -> HeaderRead -> Streaming -> Terminating, where any state
//! may jump to Terminating on error.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::http::{self, HttpError};
use crate::mounts::{Source, SourceClient};
use crate::pipeline::PipelineError;
use crate::relay::{RelayConfig, RelayShared};
use crate::supervisor::RelayContext;

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
enum RelayError {
    #[error("connect timed out")]
    ConnectTimeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("source wiring failed: {0}")]
    Pipeline(PipelineError),
}

/// Body of one relay worker task.
///
/// On any exit path the worker raises `cleanup` on the shared flag block
/// and asks the control loop to rescan, so the supervisor joins it
/// promptly.
pub(crate) async fn run_relay(
    config: RelayConfig,
    shared: Arc<RelayShared>,
    source: Arc<Source>,
    ctx: Arc<RelayContext>,
) {
    shared.set_running(true);
    info!(mount = %config.local_mount, "starting relayed source");

    match establish(&config, &source, &ctx).await {
        Ok(()) => {
            ctx.pipeline.run(&source).await;
            if !config.on_demand {
                // only on-demand relays keep their directory entry alive
                // while dormant
                ctx.directory.remove(&config.local_mount);
                source.set_yp_public(-1);
            }
        }
        Err(e) => {
            let upstream = format!(
                "http://{}:{}{}",
                config.upstream_host, config.upstream_port, config.upstream_mount
            );
            warn!(
                mount = %config.local_mount,
                upstream = %upstream,
                error = %e,
                "failed to relay stream"
            );
            move_to_fallback(&source, &ctx);
            ctx.pipeline.clear_source(&source).await;
        }
    }

    shared.request_cleanup();
    ctx.flags.rescan();
}

/// Connect, fetch and wire the upstream stream onto the reserved source.
async fn establish(
    config: &RelayConfig,
    source: &Arc<Source>,
    ctx: &Arc<RelayContext>,
) -> Result<(), RelayError> {
    let server_config = ctx.config.current();
    let redirect = server_config
        .master
        .redirect_port
        .map(|port| (server_config.hostname.as_str(), port));
    let request = http::format_relay_request(config, redirect);

    let address = (config.upstream_host.as_str(), config.upstream_port);
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| RelayError::ConnectTimeout)??;

    stream.write_all(request.as_bytes()).await?;
    let (head, read_ahead) = http::read_response_head(&mut stream).await?;
    let head = head.ensure_success()?;
    debug!(
        mount = %config.local_mount,
        content_type = head.header("content-type").unwrap_or("unknown"),
        "relay response head read"
    );

    source
        .install_client(SourceClient {
            stream,
            response: head,
            read_ahead,
        })
        .await;
    ctx.pipeline
        .complete_source(source)
        .await
        .map_err(RelayError::Pipeline)?;

    ctx.stats.increment("source_relay_connections");
    ctx.stats
        .set_mount(&config.local_mount, "source_ip", config.upstream_host.clone());
    Ok(())
}

/// Preserve listeners across a relay outage: if the source has a
/// fallback mount, move them there.
fn move_to_fallback(source: &Arc<Source>, ctx: &Arc<RelayContext>) {
    let Some(fallback_mount) = source.fallback_mount() else {
        return;
    };
    debug!(
        mount = source.mount(),
        fallback = %fallback_mount,
        "failed relay, falling back"
    );
    if let Some(fallback) = ctx.mounts.find(&fallback_mount) {
        ctx.pipeline.move_clients(source, &fallback);
    }
}

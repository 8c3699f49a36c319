//! Seams to the source pipeline and directory subsystems.
//!
//! The control plane drives sources through the [`SourcePipeline`] trait;
//! the audio demux/remux lives behind it. [`PassthroughPipeline`] is the
//! minimal implementation: it drains the relay bytes without interpreting
//! them, honouring the source `running` flag, which is enough for the
//! daemon binary and the integration tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::mounts::Source;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no client installed on {0}")]
    NoClient(String),

    #[error("unrecognised stream format on {0}")]
    Format(String),
}

/// The source pipeline: format detection and the per-source streaming
/// loop.
#[async_trait]
pub trait SourcePipeline: Send + Sync {
    /// Wire a freshly installed client: format detection and source
    /// initialisation. Failure terminates the relay attempt.
    async fn complete_source(&self, source: &Arc<Source>) -> Result<(), PipelineError>;

    /// Drive the source until the stream ends or `running` is cleared.
    async fn run(&self, source: &Arc<Source>);

    /// Tear down the source's connection state after a failed attempt.
    async fn clear_source(&self, source: &Arc<Source>);

    /// Move listeners from one source to another (fallback handling).
    fn move_clients(&self, from: &Arc<Source>, to: &Arc<Source>);
}

/// Directory (YP) deregistration seam.
pub trait Directory: Send + Sync {
    fn remove(&self, mount: &str);
}

/// Directory used when no YP integration is wired in.
#[derive(Debug, Default)]
pub struct NullDirectory;

impl Directory for NullDirectory {
    fn remove(&self, _mount: &str) {}
}

/// Pipeline that drains relay bytes without demuxing them.
pub struct PassthroughPipeline {
    /// Poll granularity for observing the `running` flag between reads.
    read_timeout: Duration,
}

impl PassthroughPipeline {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl Default for PassthroughPipeline {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

#[async_trait]
impl SourcePipeline for PassthroughPipeline {
    async fn complete_source(&self, source: &Arc<Source>) -> Result<(), PipelineError> {
        if !source.has_client().await {
            return Err(PipelineError::NoClient(source.mount().to_string()));
        }
        Ok(())
    }

    async fn run(&self, source: &Arc<Source>) {
        let Some(mut client) = source.take_client().await else {
            return;
        };
        let mut buf = [0u8; 4096];
        let mut total = client.read_ahead.len() as u64;
        client.read_ahead.clear();
        while source.is_running() {
            match tokio::time::timeout(self.read_timeout, client.stream.read(&mut buf)).await {
                // timed out: recheck the running flag
                Err(_) => continue,
                // upstream EOF
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => total += n as u64,
                Ok(Err(e)) => {
                    debug!(mount = source.mount(), error = %e, "relay stream read failed");
                    break;
                }
            }
        }
        debug!(mount = source.mount(), bytes = total, "relay stream ended");
        source.set_running(false);
    }

    async fn clear_source(&self, source: &Arc<Source>) {
        source.take_client().await;
        source.set_running(false);
    }

    fn move_clients(&self, from: &Arc<Source>, to: &Arc<Source>) {
        let moved = from.take_listeners();
        if moved > 0 {
            debug!(
                from = from.mount(),
                to = to.mount(),
                moved,
                "moved listeners to fallback"
            );
            to.add_listeners(moved);
        }
    }
}

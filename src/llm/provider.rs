use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::llm::types::{ChatMessage, ModelParams};

/// Unified model provider trait. New providers implement this trait and are
/// registered in config.toml under `[llm.providers.<id>]`.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Returns the provider's identifier (matches the config.toml key).
    fn name(&self) -> &str;

    /// Runs one chat completion and returns the assistant text.
    ///
    /// Transient failures (5xx, timeouts, connection errors) are retried
    /// internally with fixed-interval backoff; the error that surfaces here is
    /// fatal and must not be retried by the caller.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &ModelParams,
    ) -> DeskPilotResult<String>;

    /// Streams completion text chunks. Providers without streaming support
    /// keep the default, which reports the capability gap.
    async fn stream_complete(
        &self,
        _messages: &[ChatMessage],
        _params: &ModelParams,
    ) -> DeskPilotResult<mpsc::Receiver<String>> {
        Err(DeskPilotError::Provider(format!(
            "provider '{}' does not support streaming",
            self.name()
        )))
    }
}

/// Fixed-interval retry policy applied at the transport boundary.
pub(crate) const MAX_RETRY_ATTEMPTS: u32 = 5;
pub(crate) const RETRY_INTERVAL_SECS: u64 = 3;

/// Transient errors are worth another attempt; everything else propagates.
pub(crate) fn is_transient(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() {
        return true;
    }
    err.status().map(|s| s.is_server_error()).unwrap_or(false)
}

use std::time::Duration;
use thiserror::Error;

/// Error taxonomy for the acquisition engine.
///
/// Only `HardwareTimeout` is retryable; the worker gives up after a bounded
/// number of retries. `PositionOutOfRange` and `OverAverageLimit` are handled
/// in-pipeline (sample dropped, counted, logged) and never propagate this far.
#[derive(Debug, Error)]
pub enum AcqError {
    #[error("no trigger edge on {line} within {timeout:?}")]
    HardwareTimeout { line: String, timeout: Duration },

    #[error("malformed sample tuple from backend: {0}")]
    ChannelRead(String),

    #[error("acquisition is already running")]
    AlreadyRunning,

    #[error("acquisition backend error: {0}")]
    Backend(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AcqError {
    /// Timeouts are worth retrying a few times before a worker gives up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AcqError::HardwareTimeout { .. })
    }
}

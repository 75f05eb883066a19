//! Error types shared across the pipeline stages.

use std::time::Duration;

/// Errors raised while turning a sentence unit into audio.
#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("failed to spawn synthesis process `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("synthesis process exited: {0}")]
    Crashed(String),

    #[error("synthesis request timed out after {0:?}")]
    Timeout(Duration),

    /// The process answered, but reported failure for this request.
    #[error("synthesis backend rejected request: {0}")]
    Rejected(String),

    #[error("failed to decode synthesized audio: {0}")]
    Decode(String),

    #[error("synthesis process I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("synthesis process restarted {restarts} times within {window:?}, giving up")]
    RestartLimit { restarts: usize, window: Duration },

    /// The unit failed again after its single retry and was dropped.
    #[error("unit {seq} dropped after retry: {reason}")]
    Dropped { seq: u64, reason: String },

    #[error("unit has no speakable text")]
    NothingToSay,

    #[error("turn cancelled")]
    Cancelled,

    #[error("synthesis worker has shut down")]
    WorkerClosed,
}

impl SynthesisError {
    /// Faults that mean the process itself is unusable and must be restarted.
    pub fn is_process_fault(&self) -> bool {
        matches!(self, Self::Crashed(_) | Self::Timeout(_) | Self::Io(_))
    }

    /// Faults after which the pipeline can no longer make progress.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            Self::RestartLimit { .. } | Self::Spawn { .. } | Self::WorkerClosed
        )
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PlaybackError {
    #[error("audio output unavailable: {0}")]
    DeviceUnavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("text source request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("text source returned status {0}")]
    Status(u16),

    #[error("malformed text source payload: {0}")]
    Protocol(String),
}

//! Error taxonomy shared by the capture, pacing and lifecycle layers

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Frame buffer could not be created. Fatal when it happens during start.
    #[error("cannot allocate a {width}x{height} frame buffer")]
    Allocation { width: u32, height: u32 },

    #[error("frame buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSize { expected: usize, actual: usize },

    /// A device enable/start/schedule call failed. Never retried.
    #[error("device operation `{operation}` failed: {reason}")]
    Device {
        operation: &'static str,
        reason: String,
    },

    /// Per-frame conversion failure; the frame is dropped and streaming continues.
    #[error("frame conversion failed: {0}")]
    Conversion(String),

    #[error("frame source is closed")]
    QueueClosed,

    #[error("relay is already running")]
    AlreadyRunning,

    #[error("relay is already stopped")]
    AlreadyStopped,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl RelayError {
    pub fn device(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Device {
            operation,
            reason: reason.into(),
        }
    }

    /// Whether the error only affects a single frame.
    pub fn is_per_frame(&self) -> bool {
        matches!(self, Self::Conversion(_) | Self::BufferSize { .. })
    }
}

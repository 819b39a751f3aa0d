//! Error types for the renderer notification channel

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Which half of a frame was being written when the socket failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStage {
    /// The 2-byte length prefix
    Length,
    /// The NUL-terminated payload
    Payload,
}

impl fmt::Display for WriteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteStage::Length => f.write_str("length"),
            WriteStage::Payload => f.write_str("payload"),
        }
    }
}

/// Failure of a single notification attempt
///
/// None of these are fatal: the client stays usable and reconnects on the
/// next call when the connection was lost.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The component name cannot be framed (null, empty or containing NUL)
    #[error("invalid component name: {0}")]
    InvalidComponent(&'static str),

    /// Payload (including the trailing NUL) is over the configured bound
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    /// Socket creation or connect failed; the client stays disconnected
    #[error("error connecting to renderer at {}: {source}", .path.display())]
    Connect { path: PathBuf, source: io::Error },

    /// Writing the frame failed; the connection has been closed
    #[error("failed to send application info {stage}: {source}")]
    Write { stage: WriteStage, source: io::Error },

    /// A received frame does not follow the wire format
    #[error("malformed frame: {0}")]
    Decode(String),
}

impl NotifyError {
    /// Whether the error was raised before any I/O took place
    pub fn is_rejected_input(&self) -> bool {
        matches!(
            self,
            NotifyError::InvalidComponent(_) | NotifyError::PayloadTooLarge { .. }
        )
    }
}

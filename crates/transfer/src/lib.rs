//! File transfer state machine with progress tracking and checksums.

mod files;
mod progress;
mod types;
mod validation;

pub use files::{calculate_file_checksum, checksum_bytes, create_unique};
pub use progress::{ProgressThrottle, SpeedEstimator, format_eta, render_bar};
pub use types::{
    Direction, FileTransfer, ProgressSnapshot, TransferId, TransferSpec, TransferStatus,
};
pub use validation::{has_drive_prefix, resolve_in_root, validate_relative_path};

/// Size of one FILEDATA chunk: 256 KiB.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Default cap on concurrently InProgress transfers.
pub const DEFAULT_MAX_TRANSFERS: usize = 3;

/// Interval at which a paused send loop re-checks its status.
pub const PAUSE_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("cannot {action} a transfer that is {status}")]
    InvalidState {
        action: &'static str,
        status: TransferStatus,
    },
}

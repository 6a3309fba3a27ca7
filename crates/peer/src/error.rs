//! Error types for the peer node.

use lanshare_protocol::{CodecError, PayloadError};
use lanshare_transfer::TransferError;
use tokio_util::codec::LinesCodecError;

/// Errors produced by connections, commands and file pipelines.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error(transparent)]
    Format(#[from] CodecError),

    #[error("malformed payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("file size {size} bytes exceeds the {limit_mb} MB limit")]
    SizeLimitExceeded { size: u64, limit_mb: u64 },

    #[error("checksum verification failed for {0}")]
    ChecksumMismatch(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// An ERROR reply from the peer.
    #[error("{0}")]
    Remote(String),

    #[error("too many active transfers (limit {0})")]
    TooManyTransfers(usize),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("connection closed")]
    Closed,

    #[error("not connected to a peer")]
    NotConnected,
}

impl From<TransferError> for PeerError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Io(e) => PeerError::Io(e),
            TransferError::ChecksumMismatch { expected, actual } => {
                PeerError::ChecksumMismatch(format!("expected {expected}, got {actual}"))
            }
            TransferError::InvalidPath(p) | TransferError::AccessDenied(p) => {
                PeerError::AccessDenied(p)
            }
            e @ TransferError::InvalidState { .. } => PeerError::Protocol(e.to_string()),
        }
    }
}

impl From<LinesCodecError> for PeerError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => {
                PeerError::Protocol("message exceeds the maximum line length".into())
            }
            LinesCodecError::Io(e) => PeerError::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_errors_map_onto_peer_errors() {
        let denied: PeerError = TransferError::InvalidPath("../x".into()).into();
        assert!(matches!(denied, PeerError::AccessDenied(p) if p == "../x"));

        let state: PeerError = TransferError::InvalidState {
            action: "pause",
            status: lanshare_transfer::TransferStatus::Complete,
        }
        .into();
        assert_eq!(
            state.to_string(),
            "protocol error: cannot pause a transfer that is complete"
        );
    }

    #[test]
    fn size_limit_message_names_both_sides() {
        let err = PeerError::SizeLimitExceeded {
            size: 52_428_800,
            limit_mb: 10,
        };
        assert_eq!(
            err.to_string(),
            "file size 52428800 bytes exceeds the 10 MB limit"
        );
    }
}

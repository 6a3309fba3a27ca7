//! Node configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::PeerError;

/// Runtime configuration of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name announced in the handshake (hostname by default).
    #[serde(default = "default_name")]
    pub name: String,

    /// Shared folder; every served or received path resolves inside it.
    #[serde(default = "default_folder")]
    pub folder: PathBuf,

    /// Address the server role listens on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Peer to dial on start; the node acts as client when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,

    /// Refuse everything that would write into the shared folder.
    #[serde(default)]
    pub read_only: bool,

    /// Refuse everything that would read from the shared folder.
    #[serde(default)]
    pub write_only: bool,

    /// Largest file accepted or offered, in MB (0 = unlimited).
    #[serde(default)]
    pub max_size_mb: u64,

    /// Compute and verify SHA-256 checksums.
    #[serde(default = "default_true")]
    pub verify: bool,

    /// Cap on concurrently active transfers.
    #[serde(default = "default_max_transfers")]
    pub max_transfers: usize,

    /// Debug-level logging.
    #[serde(default)]
    pub verbose: bool,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "lanshare".into())
}

fn default_folder() -> PathBuf {
    PathBuf::from(".")
}

fn default_listen() -> String {
    "0.0.0.0:8080".into()
}

fn default_true() -> bool {
    true
}

fn default_max_transfers() -> usize {
    lanshare_transfer::DEFAULT_MAX_TRANSFERS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            folder: default_folder(),
            listen: default_listen(),
            peer: None,
            read_only: false,
            write_only: false,
            max_size_mb: 0,
            verify: default_true(),
            max_transfers: default_max_transfers(),
            verbose: false,
        }
    }
}

impl Config {
    /// Size limit in bytes, `None` when unlimited.
    pub fn max_size_bytes(&self) -> Option<u64> {
        (self.max_size_mb > 0).then(|| self.max_size_mb.saturating_mul(1024 * 1024))
    }

    /// Rejects files larger than the configured limit.
    pub fn check_size(&self, size: u64) -> Result<(), PeerError> {
        match self.max_size_bytes() {
            Some(limit) if size > limit => Err(PeerError::SizeLimitExceeded {
                size,
                limit_mb: self.max_size_mb,
            }),
            _ => Ok(()),
        }
    }

    /// Fails when the node is write-only.
    pub fn allow_reads(&self) -> Result<(), PeerError> {
        if self.write_only {
            return Err(PeerError::AccessDenied("node is write-only".into()));
        }
        Ok(())
    }

    /// Fails when the node is read-only.
    pub fn allow_writes(&self) -> Result<(), PeerError> {
        if self.read_only {
            return Err(PeerError::AccessDenied("node is read-only".into()));
        }
        Ok(())
    }
}

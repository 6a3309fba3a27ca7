use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncReadExt;

use crate::TransferError;

/// Calculates the SHA-256 hex digest of a byte slice.
pub fn checksum_bytes(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    hex::encode(hash)
}

/// Calculates the SHA-256 hex digest of a file, streaming 64 KiB at a time.
pub async fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Creates `path`, or the first free `name (n).ext` next to it when taken.
///
/// Each candidate is opened with `create_new`, so an existing file is never
/// truncated and two concurrent callers never get the same destination.
pub async fn create_unique(path: &Path) -> Result<(File, PathBuf), TransferError> {
    let mut candidate = path.to_path_buf();
    let mut n = 0u32;
    loop {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => return Ok((file, candidate)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                n += 1;
                candidate = numbered(path, n);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// `dir/name (n).ext` for `dir/name.ext`.
fn numbered(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    parent.join(format!("{stem} ({n}){ext}"))
}

//! Outbound file pipeline.
//!
//! A send is prepared (validated, admitted, opened) synchronously with the
//! request that triggered it, so failures such as an oversized file reach
//! the requester before any FILESTART goes out. Streaming then runs on its
//! own task. Streams on one connection are serialized: FILESTART, FILEDATA
//! and FILEEND of two files never interleave.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lanshare_protocol::{FileEnd, FileStart, Message, MessageType};
use lanshare_transfer::{
    Direction, FileTransfer, TransferSpec, TransferStatus, calculate_file_checksum,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::PeerError;
use crate::node::Node;
use crate::pipeline::{aborted_by_peer, notify_abort};

/// Validates `source`, registers a Send transfer and opens the file.
///
/// Nothing is written to the peer. Fails with
/// [`PeerError::SizeLimitExceeded`] or [`PeerError::TooManyTransfers`]
/// before any state is created.
pub async fn prepare_send(
    node: &Node,
    conn: &Connection,
    wire_path: &str,
    source: &Path,
) -> Result<Arc<FileTransfer>, PeerError> {
    if wire_path.contains('|') {
        return Err(PeerError::Protocol(format!(
            "file names containing '|' cannot be sent: {wire_path}"
        )));
    }

    let meta = tokio::fs::metadata(source).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PeerError::NotFound(wire_path.to_string())
        } else {
            PeerError::Io(e)
        }
    })?;
    if !meta.is_file() {
        return Err(PeerError::Protocol(format!("{wire_path} is not a regular file")));
    }
    node.config().check_size(meta.len())?;

    let transfer = node.registry().try_add_transfer(TransferSpec {
        path: wire_path.to_string(),
        local_path: source.to_path_buf(),
        direction: Direction::Send,
        total_bytes: meta.len(),
        connection_id: conn.id().to_string(),
    })?;

    match tokio::fs::File::open(source).await {
        Ok(file) => {
            transfer.attach_file(file).await;
            Ok(transfer)
        }
        Err(e) => {
            node.registry().remove_transfer(transfer.id());
            Err(PeerError::Io(e))
        }
    }
}

/// Streams a prepared transfer on a background task.
pub fn start_send(
    node: Arc<Node>,
    conn: Arc<Connection>,
    transfer: Arc<FileTransfer>,
) -> JoinHandle<Result<(), PeerError>> {
    tokio::spawn(async move { run_send(&node, &conn, &transfer).await })
}

/// Streams a prepared transfer to completion and unregisters it.
pub async fn run_send(
    node: &Node,
    conn: &Connection,
    transfer: &FileTransfer,
) -> Result<(), PeerError> {
    let result = stream_file(node, conn, transfer).await;

    if let Err(e) = transfer.close_file().await {
        debug!(path = %transfer.path(), "closing source file: {e}");
    }
    node.registry().remove_transfer(transfer.id());

    match &result {
        Ok(()) => {
            info!(conn = %conn.id(), path = %transfer.path(), bytes = transfer.total_bytes(), "file sent");
            node.output().transfer_finished(transfer.snapshot(), None);
        }
        Err(e) => {
            let reason = transfer.error().unwrap_or_else(|| e.to_string());
            transfer.fail(reason.clone());
            let peer_side = matches!(e, PeerError::Remote(_) | PeerError::Closed)
                || aborted_by_peer(transfer);
            if !peer_side {
                notify_abort(conn, transfer.path(), &reason).await;
            }
            warn!(conn = %conn.id(), path = %transfer.path(), "send failed: {reason}");
            node.output()
                .transfer_finished(transfer.snapshot(), Some(reason));
        }
    }
    result
}

async fn stream_file(
    node: &Node,
    conn: &Connection,
    transfer: &FileTransfer,
) -> Result<(), PeerError> {
    let _stream = conn.lock_outbound_stream().await;
    if !transfer.is_active() {
        return Err(PeerError::Cancelled);
    }

    let checksum = if node.config().verify {
        Some(calculate_file_checksum(transfer.local_path()).await?)
    } else {
        None
    };
    transfer.set_checksum(checksum.clone());

    let start = FileStart {
        path: transfer.path().to_string(),
        size: transfer.total_bytes(),
        checksum: checksum.clone(),
    };
    conn.send_reliable(Message::new(MessageType::FileStart, start.to_string()))
        .await?;
    debug!(conn = %conn.id(), path = %transfer.path(), "receiver accepted FILESTART");

    let options = conn.options();
    let mut buf = vec![0u8; options.chunk_size.max(1)];
    loop {
        let remaining = transfer
            .total_bytes()
            .saturating_sub(transfer.transferred_bytes());
        if remaining == 0 {
            break;
        }
        if !transfer.wait_while_paused(options.pause_poll).await {
            return Err(PeerError::Cancelled);
        }

        let want = remaining.min(buf.len() as u64) as usize;
        let n = match transfer.read_chunk(&mut buf[..want]).await? {
            None => return Err(PeerError::Cancelled),
            Some(0) => {
                return Err(PeerError::Protocol(format!(
                    "{} shrank while being sent",
                    transfer.path()
                )));
            }
            Some(n) => n,
        };

        conn.send(Message::binary(MessageType::FileData, buf[..n].to_vec()))
            .await?;
        if let Some(snapshot) = transfer.record_progress(n as u64) {
            let report = snapshot.to_report();
            node.output().progress(snapshot);
            conn.send(Message::new(MessageType::Progress, report.to_string()))
                .await?;
        }
    }

    if !transfer.wait_while_paused(options.pause_poll).await {
        return Err(PeerError::Cancelled);
    }
    transfer.begin_ack_wait()?;

    let end = FileEnd {
        path: transfer.path().to_string(),
        checksum,
    };
    if let Err(e) = conn
        .send_reliable(Message::new(MessageType::FileEnd, end.to_string()))
        .await
    {
        // The path ACK may have confirmed the file while the id ACK was lost.
        if transfer.status() != TransferStatus::Complete {
            return Err(e);
        }
        debug!(path = %transfer.path(), "FILEEND confirmed by path ACK: {e}");
    }
    if !transfer.complete() && transfer.status() == TransferStatus::Failed {
        return Err(PeerError::Cancelled);
    }
    Ok(())
}

/// Sends `files` one after another, waiting for an admission slot when the
/// node is busy. Returns how many arrived.
pub async fn send_files(node: &Node, conn: &Connection, files: Vec<(String, PathBuf)>) -> usize {
    let total = files.len();
    let mut sent = 0;

    for (wire_path, source) in files {
        if !conn.is_active() {
            break;
        }
        let prepared = loop {
            match prepare_send(node, conn, &wire_path, &source).await {
                Err(PeerError::TooManyTransfers(_)) if conn.is_active() => {
                    tokio::time::sleep(conn.options().pause_poll).await;
                }
                other => break other,
            }
        };
        match prepared {
            Ok(transfer) => {
                if run_send(node, conn, &transfer).await.is_ok() {
                    sent += 1;
                }
            }
            Err(e) => {
                warn!(conn = %conn.id(), path = %wire_path, "skipping file: {e}");
                node.output().error(format!("Skipping {wire_path}: {e}"));
            }
        }
    }

    node.output()
        .info(format!("Sent {sent} of {total} files"));
    sent
}

/// Handles the receiver's path-carrying ACK for a finished file.
pub(crate) fn on_path_ack(node: &Node, conn: &Connection, path: &str) {
    if let Some(transfer) = node
        .registry()
        .find_transfer(conn.id(), path, Direction::Send)
        && transfer.status() == TransferStatus::WaitingAck
        && transfer.complete()
    {
        debug!(conn = %conn.id(), path, "receiver confirmed file");
    }
}

//! Inbound file pipeline: FILESTART opens, FILEDATA appends, FILEEND
//! verifies.

use std::sync::Arc;

use lanshare_protocol::{FileEnd, FileStart, Message, ProgressReport};
use lanshare_transfer::{Direction, FileTransfer, TransferSpec, create_unique, resolve_in_root};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::PeerError;
use crate::ignore::is_ignore_file;
use crate::node::Node;
use crate::pipeline::notify_abort;

/// Opens the destination for an announced file.
///
/// The destination is resolved inside the shared folder; an existing file
/// is never overwritten, a numbered sibling is used instead. A receive
/// still open on the same connection is failed and discarded.
pub(crate) async fn on_file_start(
    node: &Node,
    conn: &Connection,
    msg: &Message,
) -> Result<(), PeerError> {
    let start: FileStart = msg.text().parse()?;
    match open_receive(node, conn, &start).await {
        Ok(transfer) => {
            info!(conn = %conn.id(), path = %start.path, size = start.size, "receiving file");
            node.output().info(format!(
                "Receiving {} ({} bytes) from {}",
                start.path,
                start.size,
                conn.remote_name()
            ));
            if start.size == 0 {
                node.output().progress(transfer.snapshot());
            }
            Ok(())
        }
        Err(e) => {
            warn!(conn = %conn.id(), path = %start.path, "refusing file: {e}");
            node.output()
                .error(format!("Refused {} from {}: {e}", start.path, conn.remote_name()));
            Err(e)
        }
    }
}

async fn open_receive(
    node: &Node,
    conn: &Connection,
    start: &FileStart,
) -> Result<Arc<FileTransfer>, PeerError> {
    let config = node.config();
    config.allow_writes()?;
    if is_ignore_file(&start.path) {
        return Err(PeerError::AccessDenied(format!(
            "{} is a restricted file",
            start.path
        )));
    }
    config.check_size(start.size)?;

    let dest = resolve_in_root(&config.folder, &start.path)?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if let Some(previous) = node.registry().current_receive(conn.id()) {
        abort_receive(node, None, &previous, "superseded by a new file").await;
    }

    let (file, dest) = create_unique(&dest).await?;
    let transfer = node.registry().add_transfer(TransferSpec {
        path: start.path.clone(),
        local_path: dest,
        direction: Direction::Receive,
        total_bytes: start.size,
        connection_id: conn.id().to_string(),
    });
    transfer.set_checksum(start.checksum.clone());
    transfer.attach_file(file).await;
    Ok(transfer)
}

/// Appends a chunk to the connection's current receive.
///
/// Chunks arriving with no receive open are dropped: they trail a file this
/// side already gave up on. Write failures and overruns abort the receive
/// and notify the peer.
pub(crate) async fn on_file_data(node: &Node, conn: &Arc<Connection>, msg: &Message) {
    let Some(transfer) = node.registry().current_receive(conn.id()) else {
        debug!(conn = %conn.id(), "dropping FILEDATA with no open receive");
        return;
    };

    let data = match msg.binary_data() {
        Ok(data) => data,
        Err(e) => {
            abort_receive(node, Some(conn), &transfer, &format!("bad chunk: {e}")).await;
            return;
        }
    };

    let after = transfer.transferred_bytes() + data.len() as u64;
    if after > transfer.total_bytes() {
        let reason = format!(
            "received {after} bytes, {} announced",
            transfer.total_bytes()
        );
        abort_receive(node, Some(conn), &transfer, &reason).await;
        return;
    }

    match transfer.write_chunk(&data).await {
        Ok(true) => {
            if let Some(snapshot) = transfer.record_progress(data.len() as u64) {
                node.output().progress(snapshot);
            }
        }
        Ok(false) => debug!(conn = %conn.id(), path = %transfer.path(), "chunk after close"),
        Err(e) => {
            abort_receive(node, Some(conn), &transfer, &format!("write failed: {e}")).await;
        }
    }
}

/// Closes and verifies a received file.
///
/// Checks, in order: every announced byte arrived, and (when verification
/// is on and a checksum is known) the SHA-256 matches. The digest is kept
/// while chunks are written, so nothing is re-read here. A failed file is
/// deleted. On success the path-carrying ACK is sent repeatedly in the
/// background.
pub(crate) async fn on_file_end(
    node: &Node,
    conn: &Arc<Connection>,
    msg: &Message,
) -> Result<(), PeerError> {
    let end: FileEnd = msg.text().parse()?;
    let transfer = node
        .registry()
        .find_transfer(conn.id(), &end.path, Direction::Receive)
        .filter(|t| t.is_active())
        .ok_or_else(|| PeerError::NotFound(format!("no open transfer for {}", end.path)))?;

    let outcome = match transfer.close_file().await {
        Ok(_) => verify(node, &transfer, &end).await,
        Err(e) => Err(e.into()),
    };
    node.registry().remove_transfer(transfer.id());

    match outcome {
        Ok(()) => {
            transfer.complete();
            info!(conn = %conn.id(), path = %end.path, dest = %transfer.local_path().display(), "file received");
            node.output().transfer_finished(transfer.snapshot(), None);
            conn.spawn_final_acks(end.path);
            Ok(())
        }
        Err(e) => {
            warn!(conn = %conn.id(), path = %end.path, "discarding received file: {e}");
            transfer.fail(e.to_string());
            remove_partial(&transfer).await;
            node.output()
                .transfer_finished(transfer.snapshot(), Some(e.to_string()));
            Err(e)
        }
    }
}

async fn verify(node: &Node, transfer: &FileTransfer, end: &FileEnd) -> Result<(), PeerError> {
    let received = transfer.transferred_bytes();
    if received != transfer.total_bytes() {
        return Err(PeerError::Protocol(format!(
            "incomplete file {}: {received} of {} bytes",
            transfer.path(),
            transfer.total_bytes()
        )));
    }

    if !node.config().verify {
        return Ok(());
    }
    let Some(expected) = end.checksum.clone().or_else(|| transfer.checksum()) else {
        return Ok(());
    };
    let actual = transfer.written_checksum().await;
    if actual.eq_ignore_ascii_case(&expected) {
        Ok(())
    } else {
        debug!(path = %transfer.path(), %expected, %actual, "checksum mismatch");
        Err(PeerError::ChecksumMismatch(transfer.path().to_string()))
    }
}

/// Logs a PROGRESS report from the sending side.
pub(crate) fn on_progress(conn: &Connection, msg: &Message) {
    match msg.text().parse::<ProgressReport>() {
        Ok(report) => debug!(
            conn = %conn.id(),
            path = %report.path,
            bytes = report.bytes,
            total = report.total,
            speed_kbps = report.speed_kbps,
            "peer progress"
        ),
        Err(e) => debug!(conn = %conn.id(), "ignoring malformed PROGRESS: {e}"),
    }
}

/// Fails a receive, deletes its partial file and unregisters it. With a
/// connection, the peer is told to stop sending.
pub(crate) async fn abort_receive(
    node: &Node,
    conn: Option<&Connection>,
    transfer: &FileTransfer,
    reason: &str,
) {
    let failed = transfer.fail(reason);
    let _ = transfer.close_file().await;
    node.registry().remove_transfer(transfer.id());
    if !failed {
        return;
    }

    warn!(path = %transfer.path(), "receive aborted: {reason}");
    remove_partial(transfer).await;
    node.output()
        .transfer_finished(transfer.snapshot(), Some(reason.to_string()));
    if let Some(conn) = conn {
        notify_abort(conn, transfer.path(), reason).await;
    }
}

pub(crate) async fn remove_partial(transfer: &FileTransfer) {
    if let Err(e) = tokio::fs::remove_file(transfer.local_path()).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %transfer.local_path().display(), "cannot remove partial file: {e}");
    }
}

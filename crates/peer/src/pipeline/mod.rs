//! File pipelines: streaming a file out and writing one in.

pub mod receiver;
pub mod sender;

use lanshare_protocol::{Message, TransferAborted};
use lanshare_transfer::{Direction, FileTransfer};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::node::Node;

/// Failure reasons that start with this came from the peer's abort notice.
pub(crate) const ABORTED_BY_PEER: &str = "aborted by peer";

/// Tells the peer to stop feeding or expecting `path`.
pub(crate) async fn notify_abort(conn: &Connection, path: &str, reason: &str) {
    let notice = TransferAborted {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    if let Err(e) = conn.send(Message::error(notice.to_string())).await {
        debug!(conn = %conn.id(), "cannot deliver abort notice for {path}: {e}");
    }
}

/// Applies a peer's abort notice to the matching local transfer.
pub(crate) async fn on_abort_notice(node: &Node, conn: &Connection, notice: TransferAborted) {
    let registry = node.registry();
    let reason = format!("{ABORTED_BY_PEER}: {}", notice.reason);

    if let Some(transfer) = registry.find_transfer(conn.id(), &notice.path, Direction::Receive)
        && transfer.is_active()
    {
        receiver::abort_receive(node, None, &transfer, &reason).await;
        return;
    }

    match registry.find_transfer(conn.id(), &notice.path, Direction::Send) {
        Some(transfer) if transfer.is_active() => {
            warn!(conn = %conn.id(), path = %notice.path, "peer aborted transfer: {}", notice.reason);
            // The send task notices the closed file and reports the failure.
            transfer.fail(reason);
            let _ = transfer.close_file().await;
        }
        _ => debug!(conn = %conn.id(), path = %notice.path, "abort notice for unknown transfer"),
    }
}

/// Whether `transfer` failed because the peer asked it to.
pub(crate) fn aborted_by_peer(transfer: &FileTransfer) -> bool {
    transfer
        .error()
        .is_some_and(|e| e.starts_with(ABORTED_BY_PEER))
}

//! Keepalive pump: pings idle connections.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::Connection;

/// Every keepalive interval: forgets PINGs that went unanswered too long,
/// then sends a new PING if the link has been silent long enough and none
/// is outstanding. An unanswered PING only gets logged; the connection
/// stays open.
pub(crate) async fn keepalive_pump(conn: Arc<Connection>, cancel: CancellationToken) {
    let options = conn.options().clone();
    let mut interval = tokio::time::interval(options.keepalive_interval);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                for id in conn.pending().expire_pings(options.ping_expiry) {
                    warn!(conn = %conn.id(), id = %id, "PING unanswered after {:?}", options.ping_expiry);
                }
                if conn.idle_for() >= options.idle_before_ping
                    && !conn.pending().has_outstanding_ping()
                    && let Err(e) = conn.ping().await
                {
                    debug!(conn = %conn.id(), "keepalive PING failed: {e}");
                }
            }
        }
    }
}

//! Read pump: decodes inbound lines and routes them.
//!
//! Routing order for each message:
//! 1. ACK or ERROR settles our retransmission of the same id.
//! 2. A repeat of an ACK-requiring message already answered gets the
//!    cached reply again and is not processed twice.
//! 3. A reply to one of our pending requests is handed to its waiter.
//! 4. Everything else is handled by type.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use lanshare_protocol::envelope::salvage_id;
use lanshare_protocol::{Message, MessageType, TransferAborted};
use tokio_util::codec::LinesCodecError;
use tracing::{debug, trace, warn};

use crate::connection::Connection;
use crate::handler::{CommandContext, dispatch_command};
use crate::node::Node;
use crate::pending::Routed;
use crate::pipeline::{on_abort_notice, receiver, sender};

/// Replies remembered for duplicate suppression.
const REPLY_CACHE_SIZE: usize = 256;

/// Bounded id → reply map, oldest entries evicted first.
pub(crate) struct ReplyCache {
    replies: HashMap<String, Message>,
    order: VecDeque<String>,
    capacity: usize,
}

impl ReplyCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            replies: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn get(&self, id: &str) -> Option<&Message> {
        self.replies.get(id)
    }

    pub(crate) fn insert(&mut self, id: String, reply: Message) {
        if self.replies.insert(id.clone(), reply).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.replies.remove(&old);
            }
        }
    }
}

/// Reads lines until EOF, a read error or cancellation.
pub(crate) async fn read_pump<S>(mut lines: S, node: Arc<Node>, conn: Arc<Connection>)
where
    S: Stream<Item = Result<String, LinesCodecError>> + Unpin,
{
    let cancel = conn.cancel_token();
    let mut replies = ReplyCache::new(REPLY_CACHE_SIZE);
    // After a codec error the framed stream yields one `None` and then
    // resumes reading; that `None` is not end of stream.
    let mut after_codec_error = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next() => match line {
                Some(Ok(line)) => {
                    after_codec_error = false;
                    conn.touch();
                    if !line.trim().is_empty() {
                        handle_line(&node, &conn, &mut replies, &line).await;
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    conn.touch();
                    warn!(conn = %conn.id(), "discarding oversized line");
                    after_codec_error = true;
                    let _ = conn.send(Message::error("message exceeds the maximum line length")).await;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    debug!(conn = %conn.id(), "read error: {e}");
                    break;
                }
                None if after_codec_error => after_codec_error = false,
                None => {
                    debug!(conn = %conn.id(), "peer closed the stream");
                    break;
                }
            }
        }
    }
}

async fn handle_line(node: &Arc<Node>, conn: &Arc<Connection>, replies: &mut ReplyCache, line: &str) {
    let msg = match Message::decode(line) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(conn = %conn.id(), "undecodable message: {e}");
            let mut reply = Message::error(format!("invalid message: {e}"));
            reply.id = salvage_id(line);
            let _ = conn.send(reply).await;
            return;
        }
    };
    trace!(conn = %conn.id(), %msg, retry = msg.retry_count, "recv");

    let dedup_id = msg.id.clone().filter(|_| msg.requires_ack());
    if let Some(id) = &dedup_id
        && let Some(cached) = replies.get(id)
    {
        debug!(conn = %conn.id(), id = %id, "duplicate message, repeating reply");
        let _ = conn.send(cached.clone()).await;
        return;
    }

    if let Some(reply) = dispatch(node, conn, msg).await {
        if let Some(id) = dedup_id {
            replies.insert(id, reply.clone());
        }
        if let Err(e) = conn.send(reply).await {
            debug!(conn = %conn.id(), "reply not sent: {e}");
        }
    }
}

/// ACK for `msg`, carrying its id.
fn receipt(msg: &Message) -> Message {
    msg.reply(MessageType::Ack, "")
}

/// Handles one decoded message; returns the reply to send, if any.
///
/// For ACK-requiring messages the reply is the receipt (ACK or ERROR with
/// the message id) and is cached against duplicates by the caller.
async fn dispatch(node: &Arc<Node>, conn: &Arc<Connection>, msg: Message) -> Option<Message> {
    if matches!(msg.msg_type, MessageType::Ack | MessageType::Error)
        && let Some(id) = &msg.id
    {
        conn.retry().settle(id);
    }

    // COMMAND and COMMANDRESULT are acknowledged on receipt.
    let immediate = matches!(
        msg.msg_type,
        MessageType::Command | MessageType::CommandResult
    )
    .then(|| receipt(&msg));

    let msg = match conn.pending().route(msg) {
        Routed::Consumed => return immediate,
        Routed::Unclaimed(msg) => msg,
    };

    match msg.msg_type {
        MessageType::Command => {
            spawn_command(Arc::clone(node), Arc::clone(conn), msg);
            immediate
        }
        MessageType::CommandResult => {
            // Its request already timed out.
            node.output().info(msg.text());
            immediate
        }
        MessageType::FileStart => Some(match receiver::on_file_start(node, conn, &msg).await {
            Ok(()) => receipt(&msg),
            Err(e) => msg.reply_error(e.to_string()),
        }),
        MessageType::FileData => {
            receiver::on_file_data(node, conn, &msg).await;
            None
        }
        MessageType::FileEnd => Some(match receiver::on_file_end(node, conn, &msg).await {
            Ok(()) => receipt(&msg),
            Err(e) => msg.reply_error(e.to_string()),
        }),
        MessageType::Progress => {
            receiver::on_progress(conn, &msg);
            None
        }
        MessageType::Ack => {
            if !msg.text().is_empty() {
                sender::on_path_ack(node, conn, msg.text());
            }
            None
        }
        MessageType::Error => {
            match msg.text().parse::<TransferAborted>() {
                Ok(notice) => {
                    node.output().warning(format!(
                        "{} stopped {}: {}",
                        conn.remote_name(),
                        notice.path,
                        notice.reason
                    ));
                    on_abort_notice(node, conn, notice).await;
                }
                Err(_) => node
                    .output()
                    .error(format!("{}: {}", conn.remote_name(), msg.text())),
            }
            None
        }
        MessageType::Message => {
            node.output().chat(conn.remote_name(), msg.text());
            None
        }
        MessageType::Ping => Some(msg.reply(MessageType::Pong, "")),
        MessageType::Pong => {
            trace!(conn = %conn.id(), "unsolicited PONG");
            None
        }
        MessageType::Handshake => {
            warn!(conn = %conn.id(), "HANDSHAKE after the connection was established");
            Some(msg.reply_error("unexpected HANDSHAKE"))
        }
    }
}

/// Runs a COMMAND on its own task so slow commands never stall the stream.
fn spawn_command(node: Arc<Node>, conn: Arc<Connection>, msg: Message) {
    tokio::spawn(async move {
        let reply = match msg.text().parse() {
            Ok(cmd) => {
                debug!(conn = %conn.id(), command = %msg.text(), "running remote command");
                let handler = node.handler();
                let ctx = CommandContext {
                    node: Arc::clone(&node),
                    conn: Arc::clone(&conn),
                };
                match dispatch_command(handler.as_ref(), ctx, cmd).await {
                    Ok(text) => msg.reply(MessageType::CommandResult, text),
                    Err(e) => msg.reply_error(e.to_string()),
                }
            }
            Err(e) => msg.reply_error(format!("invalid command: {e}")),
        };
        if let Err(e) = conn.send(reply).await {
            debug!(conn = %conn.id(), "command result not sent: {e}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_cache_evicts_oldest() {
        let mut cache = ReplyCache::new(2);
        cache.insert("a".into(), Message::ack("a"));
        cache.insert("b".into(), Message::ack("b"));
        cache.insert("c".into(), Message::ack("c"));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b").unwrap().id_str(), "b");
        assert_eq!(cache.get("c").unwrap().id_str(), "c");
    }

    #[test]
    fn reply_cache_reinsert_keeps_single_slot() {
        let mut cache = ReplyCache::new(2);
        cache.insert("a".into(), Message::ack("a"));
        cache.insert("a".into(), Message::error("x").with_id("a"));
        cache.insert("b".into(), Message::ack("b"));
        assert_eq!(cache.get("a").unwrap().msg_type, MessageType::Error);
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn receipt_carries_id() {
        let msg = Message::new(MessageType::FileStart, "a|1").with_id("fs-1");
        let ack = receipt(&msg);
        assert_eq!(ack.msg_type, MessageType::Ack);
        assert_eq!(ack.id_str(), "fs-1");
        assert_eq!(ack.text(), "");
    }
}

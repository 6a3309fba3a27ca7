//! Outstanding requests awaiting a correlated reply.
//!
//! Each entry knows what it is waiting for, so routing a reply is a match
//! on the entry kind rather than on a guess about the message.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use lanshare_protocol::{Message, MessageType};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

/// What an outstanding id is waiting for.
pub(crate) enum PendingRequest {
    /// A COMMAND; resolved by COMMANDRESULT or ERROR. Its ACK is absorbed.
    CommandReply(oneshot::Sender<Message>),
    /// A reliable send; resolved by the first reply carrying the id.
    AckWait(oneshot::Sender<Message>),
    /// A keepalive PING; resolved by PONG.
    Ping { sent_at: Instant },
}

/// Outcome of offering an inbound message to the pending map.
pub(crate) enum Routed {
    /// The message belonged to a pending request.
    Consumed,
    /// Nobody was waiting for it.
    Unclaimed(Message),
}

enum Claim {
    Resolve,
    Absorb,
    Pass,
}

#[derive(Default)]
pub(crate) struct PendingRequests {
    inner: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingRequests {
    pub(crate) fn register(&self, id: String, request: PendingRequest) {
        self.inner.lock().unwrap().insert(id, request);
    }

    pub(crate) fn remove(&self, id: &str) -> bool {
        self.inner.lock().unwrap().remove(id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Drops every entry; waiters observe a closed channel.
    pub(crate) fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    /// Hands `msg` to the request waiting on its id, if any.
    pub(crate) fn route(&self, msg: Message) -> Routed {
        let Some(id) = msg.id.clone() else {
            return Routed::Unclaimed(msg);
        };

        let mut map = self.inner.lock().unwrap();
        let claim = match map.get(&id) {
            None => return Routed::Unclaimed(msg),
            Some(PendingRequest::CommandReply(_)) => match msg.msg_type {
                MessageType::CommandResult | MessageType::Error => Claim::Resolve,
                MessageType::Ack => Claim::Absorb,
                _ => Claim::Pass,
            },
            Some(PendingRequest::AckWait(_)) => Claim::Resolve,
            Some(PendingRequest::Ping { .. }) => {
                if msg.msg_type == MessageType::Pong {
                    Claim::Resolve
                } else {
                    Claim::Pass
                }
            }
        };

        match claim {
            Claim::Pass => Routed::Unclaimed(msg),
            Claim::Absorb => Routed::Consumed,
            Claim::Resolve => {
                match map.remove(&id) {
                    Some(PendingRequest::CommandReply(tx) | PendingRequest::AckWait(tx)) => {
                        let _ = tx.send(msg);
                    }
                    Some(PendingRequest::Ping { sent_at }) => {
                        trace!(id = %id, rtt_ms = sent_at.elapsed().as_millis() as u64, "pong");
                    }
                    None => {}
                }
                Routed::Consumed
            }
        }
    }

    /// Returns `true` while a PING is unanswered.
    pub(crate) fn has_outstanding_ping(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .values()
            .any(|r| matches!(r, PendingRequest::Ping { .. }))
    }

    /// Removes PINGs older than `max_age`, returning their ids.
    pub(crate) fn expire_pings(&self, max_age: Duration) -> Vec<String> {
        let mut map = self.inner.lock().unwrap();
        let expired: Vec<String> = map
            .iter()
            .filter_map(|(id, r)| match r {
                PendingRequest::Ping { sent_at } if sent_at.elapsed() >= max_age => {
                    Some(id.clone())
                }
                _ => None,
            })
            .collect();
        for id in &expired {
            map.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_reply_absorbs_ack_and_resolves_on_result() {
        let pending = PendingRequests::default();
        let (tx, mut rx) = oneshot::channel();
        pending.register("cmd-1".into(), PendingRequest::CommandReply(tx));

        assert!(matches!(
            pending.route(Message::ack("cmd-1")),
            Routed::Consumed
        ));
        assert_eq!(pending.len(), 1);
        assert!(rx.try_recv().is_err());

        let result = Message::new(MessageType::CommandResult, "ok").with_id("cmd-1");
        assert!(matches!(pending.route(result), Routed::Consumed));
        assert_eq!(pending.len(), 0);
        assert_eq!(rx.try_recv().unwrap().text(), "ok");
    }

    #[test]
    fn command_reply_resolves_on_error() {
        let pending = PendingRequests::default();
        let (tx, mut rx) = oneshot::channel();
        pending.register("cmd-2".into(), PendingRequest::CommandReply(tx));

        let err = Message::error("unknown command").with_id("cmd-2");
        assert!(matches!(pending.route(err), Routed::Consumed));
        assert_eq!(rx.try_recv().unwrap().msg_type, MessageType::Error);
    }

    #[test]
    fn ack_wait_resolves_on_ack() {
        let pending = PendingRequests::default();
        let (tx, mut rx) = oneshot::channel();
        pending.register("reliable-1".into(), PendingRequest::AckWait(tx));

        assert!(matches!(
            pending.route(Message::ack("reliable-1")),
            Routed::Consumed
        ));
        assert_eq!(rx.try_recv().unwrap().msg_type, MessageType::Ack);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn unknown_or_missing_ids_pass_through() {
        let pending = PendingRequests::default();
        assert!(matches!(
            pending.route(Message::ack("nobody")),
            Routed::Unclaimed(_)
        ));
        assert!(matches!(
            pending.route(Message::new(MessageType::Message, "hi")),
            Routed::Unclaimed(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pings_resolve_on_pong_and_expire() {
        let pending = PendingRequests::default();
        pending.register(
            "ping-1".into(),
            PendingRequest::Ping {
                sent_at: Instant::now(),
            },
        );
        assert!(pending.has_outstanding_ping());

        // An ACK with the same id is not a PONG.
        assert!(matches!(
            pending.route(Message::ack("ping-1")),
            Routed::Unclaimed(_)
        ));
        assert!(matches!(
            pending.route(Message::new(MessageType::Pong, "").with_id("ping-1")),
            Routed::Consumed
        ));
        assert!(!pending.has_outstanding_ping());

        pending.register(
            "ping-2".into(),
            PendingRequest::Ping {
                sent_at: Instant::now(),
            },
        );
        assert!(pending.expire_pings(Duration::from_secs(30)).is_empty());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(pending.expire_pings(Duration::from_secs(30)), vec!["ping-2"]);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn clear_drops_waiters() {
        let pending = PendingRequests::default();
        let (tx, mut rx) = oneshot::channel();
        pending.register("x".into(), PendingRequest::AckWait(tx));
        pending.clear();
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }
}

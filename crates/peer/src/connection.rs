//! One live TCP link to a peer.
//!
//! A connection owns the write side of the stream, the table of requests
//! awaiting replies and the retry schedule. The read side is driven by
//! [`crate::pumps::read`], which feeds inbound messages back through
//! [`Connection::pending`] and [`Connection::retry`].

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use lanshare_protocol::{Command, Message, MessageType};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::codec::LinesCodecError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::PeerError;
use crate::options::PeerOptions;
use crate::pending::{PendingRequest, PendingRequests};
use crate::retry::{RetryDriver, RetryQueue};
use crate::writer::{BoxedWrite, LineWriter};

/// Which side opened the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We dialed out.
    Client,
    /// We accepted.
    Server,
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Active,
    Closing,
    Closed,
}

pub struct Connection {
    id: String,
    role: Role,
    remote_name: OnceLock<String>,
    writer: Arc<LineWriter>,
    pending: PendingRequests,
    retry: RetryQueue,
    state: Mutex<ConnectionState>,
    last_received: Mutex<Instant>,
    outbound_stream: tokio::sync::Mutex<()>,
    options: PeerOptions,
    cancel: CancellationToken,
}

impl Connection {
    /// Wraps the write half of a stream. The returned driver must be spawned
    /// for retransmissions to happen.
    pub(crate) fn new(
        id: String,
        role: Role,
        write: BoxedWrite,
        options: PeerOptions,
        cancel: CancellationToken,
    ) -> (Arc<Self>, RetryDriver) {
        let writer = Arc::new(LineWriter::new(write, options.write_timeout));
        let (retry, driver) = RetryQueue::new(Arc::clone(&writer), options.retry, cancel.clone());
        let conn = Arc::new(Self {
            id,
            role,
            remote_name: OnceLock::new(),
            writer,
            pending: PendingRequests::default(),
            retry,
            state: Mutex::new(ConnectionState::Connecting),
            last_received: Mutex::new(Instant::now()),
            outbound_stream: tokio::sync::Mutex::new(()),
            options,
            cancel,
        });
        (conn, driver)
    }

    /// Remote socket address; the registry key.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Name the peer announced in its handshake.
    pub fn remote_name(&self) -> &str {
        self.remote_name.get().map(String::as_str).unwrap_or("")
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active && !self.cancel.is_cancelled()
    }

    pub fn options(&self) -> &PeerOptions {
        &self.options
    }

    pub(crate) fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub(crate) fn retry(&self) -> &RetryQueue {
        &self.retry
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Exchanges HANDSHAKE messages. Must complete before the read pump
    /// starts, so the first inbound line is consumed here.
    pub(crate) async fn handshake<S>(&self, lines: &mut S, local_name: &str) -> Result<(), PeerError>
    where
        S: Stream<Item = Result<String, LinesCodecError>> + Unpin,
    {
        self.set_state(ConnectionState::Handshaking);
        self.writer
            .write_message(&Message::new(MessageType::Handshake, local_name))
            .await?;

        let line = match tokio::time::timeout(self.options.handshake_timeout, lines.next()).await {
            Err(_) => return Err(PeerError::Timeout("handshake")),
            Ok(None) => return Err(PeerError::Closed),
            Ok(Some(line)) => line?,
        };

        let msg = Message::decode(&line)?;
        if msg.msg_type != MessageType::Handshake {
            return Err(PeerError::Protocol(format!(
                "expected HANDSHAKE, got {}",
                msg.msg_type
            )));
        }

        let _ = self.remote_name.set(msg.text().to_string());
        self.touch();
        self.set_state(ConnectionState::Active);
        debug!(conn = %self.id, peer = %self.remote_name(), "handshake complete");
        Ok(())
    }

    /// Writes one message.
    ///
    /// Messages of ACK-requiring types get an id if they lack one and are
    /// scheduled for retransmission before the write. A write failure closes
    /// the connection.
    pub async fn send(&self, mut msg: Message) -> Result<(), PeerError> {
        if self.cancel.is_cancelled() {
            return Err(PeerError::Closed);
        }

        let tracked = if msg.requires_ack() {
            let id = msg
                .id
                .get_or_insert_with(|| format!("msg-{}", uuid::Uuid::new_v4()))
                .clone();
            self.retry.track(msg.clone());
            Some(id)
        } else {
            None
        };

        trace!(conn = %self.id, %msg, "send");
        match self.writer.write_message(&msg).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(id) = tracked {
                    self.retry.settle(&id);
                }
                if matches!(e, PeerError::Io(_) | PeerError::Timeout(_)) {
                    warn!(conn = %self.id, "write failed, closing: {e}");
                    self.close();
                }
                Err(e)
            }
        }
    }

    /// Sends `msg` and waits for the reply carrying its id.
    ///
    /// An ERROR reply becomes [`PeerError::Remote`]. On timeout the message
    /// is dropped from both the pending map and the retry schedule.
    pub async fn send_reliable(&self, mut msg: Message) -> Result<Message, PeerError> {
        let id = msg
            .id
            .get_or_insert_with(|| format!("reliable-{}", uuid::Uuid::new_v4()))
            .clone();
        let (tx, rx) = oneshot::channel();
        self.pending
            .register(id.clone(), PendingRequest::AckWait(tx));

        self.await_reply(id, msg, rx, self.options.reliable_timeout, "acknowledgement")
            .await
    }

    /// Sends a COMMAND and returns the text of its COMMANDRESULT.
    pub async fn request(&self, command: &Command) -> Result<String, PeerError> {
        let id = format!("cmd-{}", uuid::Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        self.pending
            .register(id.clone(), PendingRequest::CommandReply(tx));

        let msg = Message::new(MessageType::Command, command.to_string()).with_id(id.clone());
        let reply = self
            .await_reply(id, msg, rx, self.options.command_timeout, "command result")
            .await?;
        Ok(reply.text().to_string())
    }

    async fn await_reply(
        &self,
        id: String,
        msg: Message,
        rx: oneshot::Receiver<Message>,
        wait: Duration,
        what: &'static str,
    ) -> Result<Message, PeerError> {
        if let Err(e) = self.send(msg).await {
            self.pending.remove(&id);
            return Err(e);
        }

        let outcome = tokio::time::timeout(wait, rx).await;
        self.pending.remove(&id);
        match outcome {
            Ok(Ok(reply)) => {
                // A reply proves delivery even if its ACK was lost.
                self.retry.settle(&id);
                if reply.msg_type == MessageType::Error {
                    Err(PeerError::Remote(reply.text().to_string()))
                } else {
                    Ok(reply)
                }
            }
            Ok(Err(_)) => {
                self.retry.settle(&id);
                Err(PeerError::Closed)
            }
            Err(_) => {
                self.retry.settle(&id);
                warn!(conn = %self.id, id = %id, "no {what} within {wait:?}");
                Err(PeerError::Timeout(what))
            }
        }
    }

    /// Sends a keepalive PING and records it as outstanding.
    pub(crate) async fn ping(&self) -> Result<(), PeerError> {
        let id = format!("ping-{}", uuid::Uuid::new_v4());
        self.pending.register(
            id.clone(),
            PendingRequest::Ping {
                sent_at: Instant::now(),
            },
        );
        let result = self
            .send(Message::new(MessageType::Ping, "").with_id(id.clone()))
            .await;
        if result.is_err() {
            self.pending.remove(&id);
        }
        result
    }

    /// Sends the path-carrying ACK for a finished file several times.
    pub(crate) fn spawn_final_acks(self: &Arc<Self>, path: String) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            for _ in 0..conn.options.final_ack_repeat {
                if conn.send(Message::new(MessageType::Ack, path.as_str())).await.is_err() {
                    break;
                }
                tokio::time::sleep(conn.options.final_ack_interval).await;
            }
        });
    }

    /// Serializes outbound file streams; held from FILESTART through FILEEND.
    pub(crate) async fn lock_outbound_stream(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.outbound_stream.lock().await
    }

    /// Records inbound activity.
    pub(crate) fn touch(&self) {
        *self.last_received.lock().unwrap() = Instant::now();
    }

    /// Time since the last inbound line.
    pub(crate) fn idle_for(&self) -> Duration {
        self.last_received.lock().unwrap().elapsed()
    }

    /// Number of outstanding correlated requests.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Number of messages still scheduled for retransmission.
    pub async fn pending_retries(&self) -> usize {
        self.retry.count().await
    }

    /// Starts closing. Idempotent; the read pump finishes the teardown.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ConnectionState::Closed {
                *state = ConnectionState::Closing;
            }
        }
        self.cancel.cancel();
    }

    /// Resolves once the connection starts closing.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Final teardown: fails every waiter and shuts the write half.
    pub(crate) async fn finish_close(&self) {
        self.cancel.cancel();
        self.pending.clear();
        self.writer.shutdown().await;
        self.set_state(ConnectionState::Closed);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("remote_name", &self.remote_name())
            .field("state", &self.state())
            .finish()
    }
}

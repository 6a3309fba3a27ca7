//! Retransmission of messages that expect an ACK.
//!
//! One task per connection owns the retry state. Senders talk to it over a
//! channel: `track` before a write, `settle` when any ACK or ERROR carrying
//! the id arrives. The task sleeps until the earliest deadline and resends
//! with exponential backoff until the retry budget runs out. A resend that
//! hits a broken stream closes the connection.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use lanshare_protocol::Message;
use lanshare_protocol::constants::{MAX_RETRIES, RETRY_INITIAL_DELAY};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PeerError;
use crate::writer::LineWriter;

/// Backoff schedule for unacknowledged messages.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the first resend.
    pub initial_delay: Duration,
    /// Resends before a message is dropped.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: RETRY_INITIAL_DELAY,
            max_retries: MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Wait after `attempt` resends (0-based): the initial delay, doubled
    /// for each resend already made.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

enum RetryCommand {
    Track(Message),
    Settle(String),
    Count(oneshot::Sender<usize>),
}

/// Handle to a connection's retry task.
#[derive(Clone)]
pub(crate) struct RetryQueue {
    tx: mpsc::UnboundedSender<RetryCommand>,
}

impl RetryQueue {
    pub(crate) fn new(
        writer: Arc<LineWriter>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> (Self, RetryDriver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = RetryDriver {
            rx,
            writer,
            policy,
            cancel,
        };
        (Self { tx }, driver)
    }

    /// Starts the resend schedule for a message that carries an id.
    pub(crate) fn track(&self, msg: Message) {
        let _ = self.tx.send(RetryCommand::Track(msg));
    }

    /// Stops resending `id`.
    pub(crate) fn settle(&self, id: &str) {
        let _ = self.tx.send(RetryCommand::Settle(id.to_string()));
    }

    /// Number of messages still awaiting an ACK.
    pub(crate) async fn count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(RetryCommand::Count(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

struct Entry {
    message: Message,
    attempts: u32,
    deadline: Instant,
}

/// The task side of a [`RetryQueue`].
pub(crate) struct RetryDriver {
    rx: mpsc::UnboundedReceiver<RetryCommand>,
    writer: Arc<LineWriter>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryDriver {
    pub(crate) async fn run(mut self) {
        let mut entries: HashMap<String, Entry> = HashMap::new();
        let mut timers: BTreeSet<(Instant, String)> = BTreeSet::new();

        loop {
            let next = timers.first().map(|(at, _)| *at);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(RetryCommand::Track(message)) => {
                        let Some(id) = message.id.clone() else { continue };
                        if let Some(old) = entries.remove(&id) {
                            timers.remove(&(old.deadline, id.clone()));
                        }
                        let deadline = Instant::now() + self.policy.delay_for(0);
                        timers.insert((deadline, id.clone()));
                        entries.insert(id, Entry { message, attempts: 0, deadline });
                    }
                    Some(RetryCommand::Settle(id)) => {
                        if let Some(entry) = entries.remove(&id) {
                            timers.remove(&(entry.deadline, id));
                        }
                    }
                    Some(RetryCommand::Count(reply)) => {
                        let _ = reply.send(entries.len());
                    }
                    None => break,
                },
                _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                    if !self.resend_due(&mut entries, &mut timers).await {
                        break;
                    }
                }
            }
        }
    }

    /// Resends every entry whose deadline passed. Returns `false` once the
    /// stream is broken and the connection has been told to close.
    async fn resend_due(
        &self,
        entries: &mut HashMap<String, Entry>,
        timers: &mut BTreeSet<(Instant, String)>,
    ) -> bool {
        let now = Instant::now();
        while let Some((at, id)) = timers.pop_first() {
            if at > now {
                timers.insert((at, id));
                break;
            }
            let Some(entry) = entries.get_mut(&id) else {
                continue;
            };

            if entry.attempts >= self.policy.max_retries {
                warn!(
                    id = %id,
                    msg_type = %entry.message.msg_type,
                    "giving up after {} retries",
                    entry.attempts
                );
                entries.remove(&id);
                continue;
            }

            entry.attempts += 1;
            entry.message.retry_count = entry.attempts;
            debug!(id = %id, attempt = entry.attempts, "resending unacknowledged message");
            match self.writer.write_message(&entry.message).await {
                Ok(()) => {}
                Err(e @ (PeerError::Io(_) | PeerError::Timeout(_))) => {
                    warn!(id = %id, "resend failed, closing: {e}");
                    self.cancel.cancel();
                    return false;
                }
                Err(e) => debug!(id = %id, "resend failed: {e}"),
            }
            entry.deadline = Instant::now() + self.policy.delay_for(entry.attempts);
            timers.insert((entry.deadline, id));
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use lanshare_protocol::MessageType;
    use tokio_util::codec::{FramedRead, LinesCodec};

    fn queue() -> (
        RetryQueue,
        FramedRead<tokio::io::DuplexStream, LinesCodec>,
        CancellationToken,
    ) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let writer = Arc::new(LineWriter::new(Box::new(client), Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let (queue, driver) = RetryQueue::new(writer, RetryPolicy::default(), cancel.clone());
        tokio::spawn(driver.run());
        (queue, FramedRead::new(server, LinesCodec::new()), cancel)
    }

    fn file_end(id: &str) -> Message {
        Message::new(MessageType::FileEnd, "a.txt").with_id(id)
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn resends_until_settled() {
        let (queue, mut lines, _cancel) = queue();
        queue.track(file_end("fe-1"));

        let first = Message::decode(&lines.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.id.as_deref(), Some("fe-1"));
        assert_eq!(first.retry_count, 1);

        let second = Message::decode(&lines.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(second.retry_count, 2);

        queue.settle("fe-1");
        assert_eq!(queue.count().await, 0);

        let quiet = tokio::time::timeout(Duration::from_secs(60), lines.next()).await;
        assert!(quiet.is_err(), "no resend after settle");
    }

    #[tokio::test(start_paused = true)]
    async fn drops_message_after_retry_budget() {
        let (queue, mut lines, _cancel) = queue();
        queue.track(file_end("fe-2"));
        assert_eq!(queue.count().await, 1);

        for attempt in 1..=MAX_RETRIES {
            let resent = Message::decode(&lines.next().await.unwrap().unwrap()).unwrap();
            assert_eq!(resent.retry_count, attempt);
        }

        // One more backoff period lets the driver notice the exhausted entry.
        let backoff = RetryPolicy::default().delay_for(MAX_RETRIES);
        tokio::time::sleep(backoff + Duration::from_secs(1)).await;
        assert_eq!(queue.count().await, 0);
        let quiet = tokio::time::timeout(Duration::from_secs(120), lines.next()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn settle_before_first_deadline_sends_nothing() {
        let (queue, mut lines, _cancel) = queue();
        queue.track(file_end("fe-3"));
        queue.settle("fe-3");

        let quiet = tokio::time::timeout(Duration::from_secs(10), lines.next()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn broken_stream_on_resend_closes_connection() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let writer = Arc::new(LineWriter::new(Box::new(client), Duration::from_secs(1)));
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(20),
            max_retries: 5,
        };
        let (queue, driver) = RetryQueue::new(writer, policy, cancel.clone());
        let task = tokio::spawn(driver.run());

        queue.track(file_end("fe-5"));
        tokio::time::timeout(Duration::from_secs(5), cancel.cancelled())
            .await
            .expect("connection left open");
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("retry task kept running")
            .unwrap();
    }

    #[tokio::test]
    async fn count_is_zero_after_cancel() {
        let (queue, _lines, cancel) = queue();
        queue.track(file_end("fe-4"));
        cancel.cancel();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.count().await, 0);
    }
}

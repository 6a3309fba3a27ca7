//! Shared line writer for one connection.

use std::time::Duration;

use lanshare_protocol::Message;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use crate::error::PeerError;

pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Serializes whole lines onto the write half of a stream.
///
/// Each message is written and flushed under one lock hold, so lines from
/// concurrent senders never interleave.
pub(crate) struct LineWriter {
    inner: Mutex<BufWriter<BoxedWrite>>,
    timeout: Duration,
}

impl LineWriter {
    pub(crate) fn new(write: BoxedWrite, timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BufWriter::new(write)),
            timeout,
        }
    }

    pub(crate) async fn write_message(&self, msg: &Message) -> Result<(), PeerError> {
        let line = msg.encode()?;
        let mut w = self.inner.lock().await;
        let io = async {
            w.write_all(line.as_bytes()).await?;
            w.flush().await
        };
        match tokio::time::timeout(self.timeout, io).await {
            Ok(result) => result.map_err(PeerError::Io),
            Err(_) => Err(PeerError::Timeout("write")),
        }
    }

    /// Flushes and shuts down the write half.
    pub(crate) async fn shutdown(&self) {
        let mut w = self.inner.lock().await;
        let _ = tokio::time::timeout(self.timeout, w.shutdown()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanshare_protocol::MessageType;
    use tokio::io::AsyncBufReadExt;

    #[tokio::test]
    async fn writes_one_line_per_message() {
        let (client, server) = tokio::io::duplex(4096);
        let writer = LineWriter::new(Box::new(client), Duration::from_secs(1));

        writer
            .write_message(&Message::new(MessageType::Message, "hello"))
            .await
            .unwrap();
        writer
            .write_message(&Message::new(MessageType::Ping, "").with_id("p"))
            .await
            .unwrap();

        let mut lines = tokio::io::BufReader::new(server).lines();
        let first = Message::decode(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let second = Message::decode(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.text(), "hello");
        assert_eq!(second.id.as_deref(), Some("p"));
    }

    #[tokio::test]
    async fn write_to_closed_peer_fails() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let writer = LineWriter::new(Box::new(client), Duration::from_secs(1));
        let err = writer
            .write_message(&Message::new(MessageType::Message, "lost"))
            .await;
        assert!(matches!(err, Err(PeerError::Io(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_peer_times_out() {
        let (client, _server) = tokio::io::duplex(16);
        let writer = LineWriter::new(Box::new(client), Duration::from_secs(10));
        let err = writer
            .write_message(&Message::new(MessageType::Message, "x".repeat(1024)))
            .await;
        assert!(matches!(err, Err(PeerError::Timeout("write"))));
    }
}

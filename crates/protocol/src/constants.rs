use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time allowed for the peer's HANDSHAKE to arrive after ours was written.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a reliable send waits for a correlated response.
pub const RELIABLE_SEND_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a remote COMMAND waits for its COMMANDRESULT or ERROR.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed to write and flush one line.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the keep-alive pump wakes up.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Silence after which the keep-alive pump sends a PING.
pub const IDLE_BEFORE_PING: Duration = Duration::from_secs(25);

/// A PING without PONG for this long is logged and forgotten.
///
/// Liveness signal only: an expired ping never closes the connection.
pub const PING_EXPIRY: Duration = Duration::from_secs(30);

/// First retry delay for unacknowledged messages; doubles on every retry.
pub const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// Retries before an unacknowledged message is dropped as failed.
pub const MAX_RETRIES: u32 = 5;

/// Number of path-carrying ACKs a receiver sends after a verified FILEEND.
pub const FINAL_ACK_REPEAT: u32 = 3;

/// Gap between repeated path-carrying ACKs.
pub const FINAL_ACK_INTERVAL: Duration = Duration::from_millis(200);

/// Maximum encoded line length in bytes (8 MiB).
///
/// A 256 KiB chunk is roughly 350 KB once base64-encoded.
pub const MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// Wire message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Handshake,
    Command,
    CommandResult,
    FileStart,
    FileData,
    FileEnd,
    Progress,
    Ack,
    Error,
    Message,
    Ping,
    Pong,
}

impl MessageType {
    /// Returns `true` for types the receiver must acknowledge.
    pub fn requires_ack(self) -> bool {
        matches!(
            self,
            MessageType::FileStart
                | MessageType::FileEnd
                | MessageType::Command
                | MessageType::CommandResult
        )
    }

    /// Returns the wire name of this type.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Handshake => "HANDSHAKE",
            MessageType::Command => "COMMAND",
            MessageType::CommandResult => "COMMANDRESULT",
            MessageType::FileStart => "FILESTART",
            MessageType::FileData => "FILEDATA",
            MessageType::FileEnd => "FILEEND",
            MessageType::Progress => "PROGRESS",
            MessageType::Ack => "ACK",
            MessageType::Error => "ERROR",
            MessageType::Message => "MESSAGE",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_wire_names() {
        for (ty, name) in [
            (MessageType::CommandResult, "\"COMMANDRESULT\""),
            (MessageType::FileStart, "\"FILESTART\""),
            (MessageType::FileData, "\"FILEDATA\""),
            (MessageType::Ack, "\"ACK\""),
        ] {
            assert_eq!(serde_json::to_string(&ty).unwrap(), name);
            assert_eq!(format!("\"{ty}\""), name);
        }
    }

    #[test]
    fn requires_ack_is_exact() {
        let acked: Vec<MessageType> = [
            MessageType::Handshake,
            MessageType::Command,
            MessageType::CommandResult,
            MessageType::FileStart,
            MessageType::FileData,
            MessageType::FileEnd,
            MessageType::Progress,
            MessageType::Ack,
            MessageType::Error,
            MessageType::Message,
            MessageType::Ping,
            MessageType::Pong,
        ]
        .into_iter()
        .filter(|t| t.requires_ack())
        .collect();

        assert_eq!(
            acked,
            vec![
                MessageType::Command,
                MessageType::CommandResult,
                MessageType::FileStart,
                MessageType::FileEnd,
            ]
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<MessageType>("\"NACK\"").is_err());
    }
}

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MessageType;

/// Errors produced while framing or unframing a message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid message format: {0}")]
    Format(#[from] serde_json::Error),

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Message body.
///
/// Binary bodies travel base64-encoded in `data`; after decoding they arrive
/// as [`Payload::Text`] and are recovered with [`Message::binary_data`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Text(String::new())
    }
}

/// A single protocol message, one JSON object per line on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub msg_type: MessageType,
    pub payload: Payload,
    /// Correlation token; stable across retries once assigned.
    pub id: Option<String>,
    /// Send time as stamped by the peer; `None` for locally built messages.
    pub timestamp: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

/// Exact JSON shape of a line.
#[derive(Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    msg_type: MessageType,
    #[serde(default)]
    data: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    binary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero")]
    retry_count: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Message {
    /// Creates a text message.
    pub fn new(msg_type: MessageType, data: impl Into<String>) -> Self {
        Self {
            msg_type,
            payload: Payload::Text(data.into()),
            id: None,
            timestamp: None,
            retry_count: 0,
        }
    }

    /// Creates a message carrying raw bytes.
    pub fn binary(msg_type: MessageType, data: Vec<u8>) -> Self {
        Self {
            payload: Payload::Binary(data),
            ..Self::new(msg_type, "")
        }
    }

    /// Creates an ACK for the given correlation id.
    pub fn ack(id: impl Into<String>) -> Self {
        Self::new(MessageType::Ack, "").with_id(id)
    }

    /// Creates an ERROR message.
    pub fn error(text: impl Into<String>) -> Self {
        Self::new(MessageType::Error, text)
    }

    /// Sets the correlation id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Creates a response to this message, preserving its id.
    pub fn reply(&self, msg_type: MessageType, data: impl Into<String>) -> Self {
        let mut msg = Message::new(msg_type, data);
        msg.id = self.id.clone();
        msg
    }

    /// Creates an ERROR response to this message, preserving its id.
    pub fn reply_error(&self, text: impl Into<String>) -> Self {
        self.reply(MessageType::Error, text)
    }

    /// Returns `true` if the receiver must acknowledge this message.
    pub fn requires_ack(&self) -> bool {
        self.msg_type.requires_ack()
    }

    /// Returns the correlation id or `""`.
    pub fn id_str(&self) -> &str {
        self.id.as_deref().unwrap_or("")
    }

    /// Returns the text body (empty for binary payloads).
    pub fn text(&self) -> &str {
        match &self.payload {
            Payload::Text(s) => s,
            Payload::Binary(_) => "",
        }
    }

    /// Returns the raw bytes of the body.
    ///
    /// Text bodies are base64-decoded; binary bodies are returned as-is.
    pub fn binary_data(&self) -> Result<Vec<u8>, CodecError> {
        match &self.payload {
            Payload::Binary(bytes) => Ok(bytes.clone()),
            Payload::Text(s) => Ok(STANDARD.decode(s)?),
        }
    }

    /// Serializes to one JSON line terminated by `\n`.
    ///
    /// Binary payloads are base64-encoded and the `binary` flag is cleared.
    pub fn encode(&self) -> Result<String, CodecError> {
        let data = match &self.payload {
            Payload::Text(s) => s.clone(),
            Payload::Binary(bytes) => STANDARD.encode(bytes),
        };
        let wire = WireMessage {
            msg_type: self.msg_type,
            data,
            binary: false,
            id: self.id.clone(),
            timestamp: Some(Utc::now()),
            retry_count: self.retry_count,
        };
        let mut line = serde_json::to_string(&wire)?;
        line.push('\n');
        Ok(line)
    }

    /// Parses one line (with or without the trailing newline).
    pub fn decode(line: &str) -> Result<Self, CodecError> {
        let wire: WireMessage = serde_json::from_str(line.trim_end_matches(['\r', '\n']))?;
        let payload = if wire.binary {
            Payload::Binary(wire.data.into_bytes())
        } else {
            Payload::Text(wire.data)
        };
        Ok(Self {
            msg_type: wire.msg_type,
            payload,
            id: wire.id.filter(|id| !id.is_empty()),
            timestamp: wire.timestamp,
            retry_count: wire.retry_count,
        })
    }
}

/// Best-effort extraction of the `id` field from a line that failed to decode.
pub fn salvage_id(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    value
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = match &self.payload {
            Payload::Text(s) => s.as_str(),
            Payload::Binary(_) => "<binary>",
        };
        match &self.id {
            Some(id) => write!(f, "{}[{id}] {body}", self.msg_type),
            None => write!(f, "{} {body}", self.msg_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_single_terminated_line() {
        let line = Message::new(MessageType::Command, "LS docs")
            .with_id("cmd-1")
            .encode()
            .unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.contains("\"type\":\"COMMAND\""));
        assert!(line.contains("\"id\":\"cmd-1\""));
    }

    #[test]
    fn text_roundtrip_preserves_type_data_and_id() {
        let msg = Message::new(MessageType::FileStart, "report.pdf|10000").with_id("r-1");
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::FileStart);
        assert_eq!(decoded.text(), "report.pdf|10000");
        assert_eq!(decoded.id.as_deref(), Some("r-1"));
        assert!(decoded.timestamp.is_some());
    }

    #[test]
    fn binary_payload_survives_base64() {
        let bytes: Vec<u8> = (0..=255u8).chain([0, 10, 13, 255]).collect();
        let line = Message::binary(MessageType::FileData, bytes.clone())
            .encode()
            .unwrap();
        assert!(!line.contains("\"binary\""));

        let decoded = Message::decode(&line).unwrap();
        assert_eq!(decoded.msg_type, MessageType::FileData);
        assert_eq!(decoded.binary_data().unwrap(), bytes);
    }

    #[test]
    fn decode_honours_binary_flag_from_peer() {
        let decoded =
            Message::decode(r#"{"type":"FILEDATA","data":"raw bytes","binary":true}"#).unwrap();
        assert_eq!(decoded.binary_data().unwrap(), b"raw bytes");
    }

    #[test]
    fn decode_accepts_missing_optional_fields() {
        let decoded = Message::decode(r#"{"type":"PING"}"#).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Ping);
        assert_eq!(decoded.text(), "");
        assert!(decoded.id.is_none());
        assert_eq!(decoded.retry_count, 0);
    }

    #[test]
    fn decode_treats_empty_id_as_absent() {
        let decoded = Message::decode(r#"{"type":"ACK","data":"","id":""}"#).unwrap();
        assert!(decoded.id.is_none());
    }

    #[test]
    fn decode_rejects_bad_framing() {
        assert!(matches!(
            Message::decode("not json {{"),
            Err(CodecError::Format(_))
        ));
        assert!(Message::decode(r#"{"type":"NACK","data":""}"#).is_err());
        assert!(Message::decode(r#"{"data":"no type"}"#).is_err());
    }

    #[test]
    fn binary_data_rejects_invalid_base64() {
        let msg = Message::new(MessageType::FileData, "%%%not base64");
        assert!(matches!(msg.binary_data(), Err(CodecError::Base64(_))));
    }

    #[test]
    fn retry_count_only_on_wire_when_set() {
        let mut msg = Message::new(MessageType::FileEnd, "a.txt").with_id("x");
        assert!(!msg.encode().unwrap().contains("retry_count"));
        msg.retry_count = 2;
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.retry_count, 2);
    }

    #[test]
    fn reply_preserves_id() {
        let request = Message::new(MessageType::Command, "STATUS").with_id("cmd-7");
        let reply = request.reply(MessageType::CommandResult, "No active transfers");
        assert_eq!(reply.id.as_deref(), Some("cmd-7"));
        assert_eq!(reply.msg_type, MessageType::CommandResult);

        let err = request.reply_error("unknown command");
        assert_eq!(err.id.as_deref(), Some("cmd-7"));
        assert_eq!(err.msg_type, MessageType::Error);
    }

    #[test]
    fn ack_carries_id() {
        let ack = Message::ack("reliable-1");
        assert_eq!(ack.msg_type, MessageType::Ack);
        assert_eq!(ack.id_str(), "reliable-1");
        assert!(!ack.requires_ack());
    }

    #[test]
    fn salvage_id_from_undecodable_line() {
        assert_eq!(
            salvage_id(r#"{"type":"BOGUS","id":"m-3"}"#).as_deref(),
            Some("m-3")
        );
        assert_eq!(salvage_id("garbage"), None);
    }

    #[test]
    fn display_includes_id() {
        let msg = Message::new(MessageType::Command, "LS").with_id("c1");
        assert_eq!(msg.to_string(), "COMMAND[c1] LS");
        assert_eq!(
            Message::binary(MessageType::FileData, vec![1]).to_string(),
            "FILEDATA <binary>"
        );
    }
}

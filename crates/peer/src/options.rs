//! Timing and sizing knobs shared by every connection of a node.

use std::time::Duration;

use lanshare_protocol::constants::{
    COMMAND_TIMEOUT, FINAL_ACK_INTERVAL, FINAL_ACK_REPEAT, HANDSHAKE_TIMEOUT, IDLE_BEFORE_PING,
    KEEPALIVE_INTERVAL, MAX_LINE_LENGTH, PING_EXPIRY, RELIABLE_SEND_TIMEOUT, WRITE_TIMEOUT,
};
use lanshare_transfer::{CHUNK_SIZE, PAUSE_POLL_INTERVAL};

use crate::retry::RetryPolicy;

/// Protocol timings. Defaults match the wire protocol; tests shorten them.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub handshake_timeout: Duration,
    /// How long a reliable send waits for its ACK.
    pub reliable_timeout: Duration,
    /// How long a COMMAND waits for its COMMANDRESULT.
    pub command_timeout: Duration,
    pub write_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Silence after which a PING is sent.
    pub idle_before_ping: Duration,
    /// Age at which an unanswered PING is forgotten.
    pub ping_expiry: Duration,
    pub retry: RetryPolicy,
    pub final_ack_repeat: u32,
    pub final_ack_interval: Duration,
    /// Delay between a client-role disconnect and node shutdown.
    pub close_grace: Duration,
    pub chunk_size: usize,
    pub pause_poll: Duration,
    /// Longest inbound line accepted; longer ones are discarded.
    pub max_line_length: usize,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            reliable_timeout: RELIABLE_SEND_TIMEOUT,
            command_timeout: COMMAND_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            idle_before_ping: IDLE_BEFORE_PING,
            ping_expiry: PING_EXPIRY,
            retry: RetryPolicy::default(),
            final_ack_repeat: FINAL_ACK_REPEAT,
            final_ack_interval: FINAL_ACK_INTERVAL,
            close_grace: Duration::from_millis(500),
            chunk_size: CHUNK_SIZE,
            pause_poll: PAUSE_POLL_INTERVAL,
            max_line_length: MAX_LINE_LENGTH,
        }
    }
}

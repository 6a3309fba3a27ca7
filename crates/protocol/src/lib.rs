//! Wire protocol for LAN file sharing peers.
//!
//! Every message is one JSON object per line over a raw TCP stream.

pub mod constants;
pub mod envelope;
pub mod messages;

pub use constants::MessageType;
pub use envelope::{CodecError, Message, Payload};
pub use messages::{
    Command, FileEnd, FileStart, PayloadError, ProgressReport, TransferAborted,
};

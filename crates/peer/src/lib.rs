//! Peer node for LAN file sharing.
//!
//! A [`Node`] serves its shared folder to connected peers and drives the
//! local side of transfers. Each TCP link is a [`Connection`] speaking the
//! line-delimited JSON protocol from `lanshare-protocol`; inbound lines are
//! routed by a read pump, remote COMMANDs go to a [`CommandHandler`] and
//! files move through the send and receive pipelines.

pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod ignore;
pub mod node;
pub mod options;
pub mod output;
pub mod pipeline;
pub mod registry;

mod pending;
mod pumps;
mod retry;
mod writer;

pub use commands::{FileCommands, status_report};
pub use config::Config;
pub use connection::{Connection, ConnectionState, Role};
pub use error::PeerError;
pub use handler::{CommandContext, CommandHandler, HandlerFuture, dispatch_command};
pub use ignore::{IgnoreFilter, IgnoreList};
pub use node::{Node, NodeBuilder};
pub use options::PeerOptions;
pub use output::{Level, Output, OutputEvent, render_progress};
pub use registry::Registry;
pub use retry::RetryPolicy;

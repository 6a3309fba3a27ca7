//! Per-connection background tasks.

pub(crate) mod keepalive;
pub(crate) mod read;

//! Handler trait for remote COMMANDs.
//!
//! Implementors provide the command semantics; the read pump takes care of
//! acknowledging the COMMAND and wrapping the outcome in a COMMANDRESULT or
//! ERROR that carries the request id.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use lanshare_protocol::Command;

use crate::connection::Connection;
use crate::error::PeerError;
use crate::node::Node;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<String, PeerError>> + Send + 'a>>;

/// Where a command came from.
#[derive(Clone)]
pub struct CommandContext {
    pub node: Arc<Node>,
    pub conn: Arc<Connection>,
}

fn not_implemented<'a>(cmd: Command) -> HandlerFuture<'a> {
    Box::pin(async move { Err(PeerError::Protocol(format!("{} not implemented", cmd.name))) })
}

/// Trait for answering COMMANDs from a peer.
///
/// Default implementations answer "not implemented", so handlers only
/// override the commands they support.
pub trait CommandHandler: Send + Sync + 'static {
    /// `LS [dir]`
    fn on_list(&self, _ctx: CommandContext, cmd: Command) -> HandlerFuture<'_> {
        not_implemented(cmd)
    }

    /// `CDR dir`
    fn on_change_dir(&self, _ctx: CommandContext, cmd: Command) -> HandlerFuture<'_> {
        not_implemented(cmd)
    }

    /// `GET file`
    fn on_get(&self, _ctx: CommandContext, cmd: Command) -> HandlerFuture<'_> {
        not_implemented(cmd)
    }

    /// `PUT file`
    fn on_put(&self, _ctx: CommandContext, cmd: Command) -> HandlerFuture<'_> {
        not_implemented(cmd)
    }

    /// `GETDIR dir`
    fn on_get_dir(&self, _ctx: CommandContext, cmd: Command) -> HandlerFuture<'_> {
        not_implemented(cmd)
    }

    /// `PUTDIR dir`
    fn on_put_dir(&self, _ctx: CommandContext, cmd: Command) -> HandlerFuture<'_> {
        not_implemented(cmd)
    }

    /// `GETM pattern...`
    fn on_get_many(&self, _ctx: CommandContext, cmd: Command) -> HandlerFuture<'_> {
        not_implemented(cmd)
    }

    /// `PUTM`
    fn on_put_many(&self, _ctx: CommandContext, cmd: Command) -> HandlerFuture<'_> {
        not_implemented(cmd)
    }

    /// `STATUS`
    fn on_status(&self, _ctx: CommandContext, cmd: Command) -> HandlerFuture<'_> {
        not_implemented(cmd)
    }

    /// `INFO`
    fn on_info(&self, _ctx: CommandContext, cmd: Command) -> HandlerFuture<'_> {
        not_implemented(cmd)
    }
}

/// Routes a command to the matching handler method.
pub fn dispatch_command<'a>(
    handler: &'a dyn CommandHandler,
    ctx: CommandContext,
    cmd: Command,
) -> HandlerFuture<'a> {
    match cmd.name.as_str() {
        "LS" | "LIST" => handler.on_list(ctx, cmd),
        "CDR" => handler.on_change_dir(ctx, cmd),
        "GET" => handler.on_get(ctx, cmd),
        "PUT" => handler.on_put(ctx, cmd),
        "GETDIR" => handler.on_get_dir(ctx, cmd),
        "PUTDIR" => handler.on_put_dir(ctx, cmd),
        "GETM" => handler.on_get_many(ctx, cmd),
        "PUTM" => handler.on_put_many(ctx, cmd),
        "STATUS" => handler.on_status(ctx, cmd),
        "INFO" => handler.on_info(ctx, cmd),
        _ => Box::pin(async move { Err(PeerError::Protocol(format!("unknown command: {}", cmd.name))) }),
    }
}

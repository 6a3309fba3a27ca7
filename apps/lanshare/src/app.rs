//! Application orchestrator: output, node, listener or dialer, console.

use std::sync::Arc;

use lanshare_peer::{Config, Node, Output};

use crate::console;

/// Runs the node until the console quits, Ctrl-C, or (in the client role)
/// the peer disconnects.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let (output, printer) = Output::spawn(tokio::io::stdout());
    let node = Node::new(config.clone(), output);
    let shutdown = node.shutdown_token();

    match &config.peer {
        Some(addr) => {
            tracing::info!(peer = %addr, "dialing");
            node.dial(addr).await?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(&config.listen).await?;
            let server = Arc::clone(&node);
            tokio::spawn(async move {
                if let Err(e) = server.serve(listener).await {
                    tracing::error!("server error: {e}");
                }
            });
        }
    }

    tokio::select! {
        _ = shutdown.cancelled() => {
            tracing::info!("node stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
        _ = console::run(Arc::clone(&node)) => {
            tracing::info!("console closed");
        }
    }

    node.shutdown();
    if node.is_any_transfer_active() {
        tracing::warn!("exiting with transfers still active");
    }
    // The printer drains once the last output handle is gone.
    drop(node);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), printer).await;
    Ok(())
}

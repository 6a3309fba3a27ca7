//! lanshare entry point.

mod app;
mod config;
mod console;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let mut config = config::load()?;
    if let Some(peer) = std::env::args().nth(1) {
        config.peer = Some(peer);
    }

    // Logs go to stderr; stdout belongs to the console output.
    let default_level = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        name = %config.name,
        folder = %config.folder.display(),
        "starting lanshare"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("lanshare shut down cleanly");
    Ok(())
}

//! Node configuration file.
//!
//! Stored as TOML at `~/.config/lanshare/node.toml` (`%APPDATA%` on
//! Windows); `LANSHARE_CONFIG` points somewhere else.

use std::path::{Path, PathBuf};

use lanshare_peer::Config;

const CONFIG_ENV: &str = "LANSHARE_CONFIG";

/// Loads the configuration, writing the defaults out first if absent.
pub fn load() -> anyhow::Result<Config> {
    load_from(&config_path())
}

pub fn load_from(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
        Ok(config)
    } else {
        let config = Config::default();
        save_to(&config, path)?;
        Ok(config)
    }
}

pub fn save_to(config: &Config, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(config)?)?;
    tracing::debug!(path = %path.display(), "configuration saved");
    Ok(())
}

fn config_path() -> PathBuf {
    resolve_path(std::env::var_os(CONFIG_ENV).map(PathBuf::from))
}

/// The override if given, otherwise the platform default.
fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit.filter(|p| !p.as_os_str().is_empty()) {
        return path;
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("lanshare").join("node.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("lanshare")
            .join("node.toml")
    }
}

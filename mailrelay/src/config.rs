//! Locating, loading and displaying the relay configuration.

use std::path::{Path, PathBuf};

use anyhow::Context;
use mailrelay_common::{
    address::mask_password,
    config::{RelayConfig, Secret},
    internal,
};

pub const CONFIG_ENV: &str = "MAILRELAY_CONFIG";

const DEFAULT_PATHS: [&str; 2] = [
    "./mailrelay.config.ron",
    "/etc/mailrelay/mailrelay.config.ron",
];

/// Find the configuration file using the following precedence:
/// 1. An explicit path (the `--config` flag)
/// 2. `MAILRELAY_CONFIG` environment variable
/// 3. ./mailrelay.config.ron (current working directory)
/// 4. /etc/mailrelay/mailrelay.config.ron (system-wide config)
///
/// `Ok(None)` means nothing was found and defaults apply.
pub fn find_config_file(explicit: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    find_config_file_in(
        explicit,
        std::env::var_os(CONFIG_ENV).map(PathBuf::from),
        &DEFAULT_PATHS.map(PathBuf::from),
    )
}

fn find_config_file_in(
    explicit: Option<&Path>,
    from_env: Option<PathBuf>,
    defaults: &[PathBuf],
) -> anyhow::Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        anyhow::ensure!(
            path.exists(),
            "--config points to non-existent file: {}",
            path.display()
        );
        return Ok(Some(path.to_path_buf()));
    }

    if let Some(path) = from_env {
        anyhow::ensure!(
            path.exists(),
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
        return Ok(Some(path));
    }

    Ok(defaults.iter().find(|path| path.exists()).cloned())
}

/// Reads the configuration, falling back to built-in defaults when no file
/// exists anywhere.
///
/// # Errors
///
/// A path that was named but does not exist, or a file that cannot be read or
/// parsed.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<RelayConfig> {
    let Some(path) = find_config_file(explicit)? else {
        internal!(
            level = WARN,
            "No configuration file found, using built-in defaults"
        );
        return Ok(RelayConfig::default());
    };

    parse_file(&path)
}

fn parse_file(path: &Path) -> anyhow::Result<RelayConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;

    let config = ron::from_str(&content)
        .with_context(|| format!("Failed to parse config from {}", path.display()))?;

    internal!(level = INFO, "Loaded configuration from {}", path.display());
    Ok(config)
}

/// A copy of `config` with every password replaced by its mask.
pub fn masked(config: &RelayConfig) -> RelayConfig {
    let mask = |secret: &Secret| Secret::new(mask_password(secret.expose()));

    let mut masked = config.clone();
    masked.forward_password = config.forward_password.as_ref().map(mask);
    for provider in &mut masked.forward_providers {
        provider.password = provider.password.as_ref().map(mask);
    }

    masked
}

/// The effective configuration as pretty RON, passwords masked.
///
/// # Errors
///
/// If serialization fails.
pub fn render(config: &RelayConfig) -> anyhow::Result<String> {
    ron::ser::to_string_pretty(&masked(config), ron::ser::PrettyConfig::default())
        .context("Failed to render configuration")
}

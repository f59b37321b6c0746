use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::AppConfig;
use crate::error::{AppError, Result};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "ROBOT_CLIENT_CONFIG";

/// Resolve the configuration file path (CLI argument takes precedence)
pub fn resolve_config_path(cli_path: Option<PathBuf>) -> Option<PathBuf> {
    cli_path.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
}

/// Load configuration from a TOML file, or defaults when no path is given
///
/// Sections and fields missing from the file keep their default values.
pub async fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => {
            let text = tokio::fs::read_to_string(path).await.map_err(|e| {
                AppError::Config(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let config = parse_config(&text)?;
            info!("Configuration loaded from {}", path.display());
            config
        }
        None => {
            debug!("No configuration file given, using defaults");
            AppConfig::default()
        }
    };

    config.validate()?;
    Ok(config)
}

/// Parse configuration from TOML text
pub fn parse_config(text: &str) -> Result<AppConfig> {
    toml::from_str(text).map_err(|e| AppError::Config(format!("Invalid configuration: {}", e)))
}

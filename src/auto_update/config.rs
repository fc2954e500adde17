// Updater Configuration File Handler
// Loads and saves updater configuration from/to a JSON file

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::auto_update::UpdateError;

/// Configuration file name
const CONFIG_FILE_NAME: &str = "updater_config.json";

/// Release feed of the mod manager
pub const DEFAULT_FEED_URL: &str = "https://api.github.com/repos/olegbl/d2rmm/releases/latest";

/// Configuration for the self-update subsystem
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpdaterConfig {
    /// URL of the release feed (GitHub "latest release" shape)
    pub feed_url: String,

    /// Suffix an asset name must end with to be installable
    pub package_extension: String,

    /// The package unpacks into `<prefix> <version>/`
    pub package_dir_prefix: String,

    /// Seconds the handoff script waits for this process to exit
    pub handoff_delay_secs: u64,

    /// User-Agent sent with every request (GitHub rejects requests without one)
    pub user_agent: String,

    /// Connect timeout in seconds; `None` waits forever
    pub connect_timeout_secs: Option<u64>,

    /// Whole-request timeout in seconds; `None` lets large downloads run as long as they need
    pub request_timeout_secs: Option<u64>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            feed_url: DEFAULT_FEED_URL.to_string(),
            package_extension: ".zip".to_string(),
            package_dir_prefix: "D2RMM".to_string(),
            handoff_delay_secs: 1,
            user_agent: format!("D2RMM-Updater/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: Some(30),
            request_timeout_secs: None,
        }
    }
}

/// Get the configuration file path
/// Stores in the user's home directory: ~/.d2rmm/updater_config.json
pub fn get_config_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".d2rmm").join(CONFIG_FILE_NAME)
}

/// Load updater configuration from the default location
pub fn load_config() -> UpdaterConfig {
    load_config_from(&get_config_path())
}

/// Load updater configuration from `config_path`
/// Returns defaults if the file doesn't exist or cannot be parsed
pub fn load_config_from(config_path: &Path) -> UpdaterConfig {
    if !config_path.exists() {
        log::info!("[UpdaterConfig] Config file not found, using defaults");
        return UpdaterConfig::default();
    }

    match fs::read_to_string(config_path) {
        Ok(content) => match serde_json::from_str::<UpdaterConfig>(&content) {
            Ok(config) => {
                log::info!("[UpdaterConfig] Loaded config from {:?}", config_path);
                log::info!("[UpdaterConfig] Feed URL: {}", config.feed_url);
                config
            }
            Err(e) => {
                log::warn!("[UpdaterConfig] Failed to parse config: {}, using defaults", e);
                UpdaterConfig::default()
            }
        },
        Err(e) => {
            log::warn!("[UpdaterConfig] Failed to read config: {}, using defaults", e);
            UpdaterConfig::default()
        }
    }
}

/// Save updater configuration to the default location
pub fn save_config(config: &UpdaterConfig) -> Result<(), UpdateError> {
    save_config_to(config, &get_config_path())
}

/// Save updater configuration to `config_path`
pub fn save_config_to(config: &UpdaterConfig, config_path: &Path) -> Result<(), UpdateError> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            UpdateError::Config(format!("Failed to create config directory: {}", e))
        })?;
    }

    let json = serde_json::to_string_pretty(config)
        .map_err(|e| UpdateError::Config(format!("Failed to serialize config: {}", e)))?;

    fs::write(config_path, json)
        .map_err(|e| UpdateError::Config(format!("Failed to write config: {}", e)))?;

    log::info!("[UpdaterConfig] Saved config to {:?}", config_path);
    Ok(())
}

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Extender (plugin) config files scanned at startup
    pub extender_configs: Vec<PathBuf>,

    /// Per-listener runtime state directory
    pub listener_state_dir: PathBuf,

    /// Path to SQLite database; absent means no persistence
    pub database_path: Option<PathBuf>,

    /// Listeners started at boot
    pub listeners: Vec<ListenerStartup>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// A listener instance to bring up at startup: `registry` is the module key
/// (`type/protocol/name`), `profile` the JSON profile handed to the module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerStartup {
    pub name: String,
    pub registry: String,
    pub profile: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            extender_configs: Vec::new(),
            listener_state_dir: PathBuf::from("listener_state"),
            database_path: Some(PathBuf::from("umbra_c2.db")),
            listeners: Vec::new(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
            },
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &PathBuf) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig =
            toml::from_str(&content).map_err(|e| crate::UmbraError::Config(e.to_string()))?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &PathBuf) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::UmbraError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

//! Kiln configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main kiln configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Project layout
    pub project: ProjectConfig,

    /// Worker pool limits
    pub concurrency: ConcurrencyConfig,

    /// Event bus and run retention
    pub events: EventsConfig,

    /// Daemon client settings
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config: .kiln.yml
        let local_config = PathBuf::from(".kiln.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config: ~/.config/kiln/kiln.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("kiln").join("kiln.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Log level only, read before logging is initialized
    ///
    /// Errors are swallowed; the full load that follows reports them.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates = match config_path {
            Some(path) => vec![path.clone()],
            None => {
                let mut paths = vec![PathBuf::from(".kiln.yml")];
                if let Some(config_dir) = dirs::config_dir() {
                    paths.push(config_dir.join("kiln").join("kiln.yml"));
                }
                paths
            }
        };

        candidates
            .iter()
            .filter(|p| p.exists())
            .find_map(|p| Self::load_from_file(p).ok())
            .and_then(|config| config.log_level)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Project layout, relative to the project directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Target graph file
    pub manifest: String,

    /// Repository directory holding cache, objects and runs
    #[serde(rename = "repo-dir")]
    pub repo_dir: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            manifest: "kiln-build.yml".to_string(),
            repo_dir: ".kiln".to_string(),
        }
    }
}

/// Worker pool limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Maximum rule steps running at once
    #[serde(rename = "max-parallelism")]
    pub max_parallelism: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_parallelism: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Broadcast capacity of the event bus
    #[serde(rename = "channel-capacity")]
    pub channel_capacity: usize,

    /// Finished runs kept in memory for late observers
    #[serde(rename = "retained-runs")]
    pub retained_runs: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: crate::events::DEFAULT_CHANNEL_CAPACITY,
            retained_runs: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Client connect and write timeout in milliseconds
    #[serde(rename = "request-timeout-ms")]
    pub request_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
        }
    }
}

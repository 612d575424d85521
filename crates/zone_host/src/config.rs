//! Host configuration loaded from TOML.
//!
//! ```toml
//! [loader]
//! modules_file = "modules.toml"
//! unit_directory = "units"
//! unload_attempts = 5
//! unload_retry_ms = 500
//!
//! [logging]
//! level = "info"
//! json_format = false
//! ```

use crate::cli::CliArgs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub loader: LoaderSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Where modules come from and how long shutdown waits for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderSettings {
    /// Module list read at startup
    pub modules_file: PathBuf,
    /// Directory searched for units referenced by bare name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_directory: Option<PathBuf>,
    /// How often shutdown retries an unload refused as busy
    #[serde(default = "default_unload_attempts")]
    pub unload_attempts: u32,
    #[serde(default = "default_unload_retry_ms")]
    pub unload_retry_ms: u64,
}

fn default_unload_attempts() -> u32 {
    5
}

fn default_unload_retry_ms() -> u64 {
    500
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            modules_file: PathBuf::from("modules.toml"),
            unit_directory: None,
            unload_attempts: default_unload_attempts(),
            unload_retry_ms: default_unload_retry_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Reads the configuration at `path`. A missing file is created with
    /// the default configuration, which is then returned.
    ///
    /// The flag is true when the file was created. Nothing is logged here;
    /// this runs before logging is configured.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<(Self, bool)> {
        if tokio::fs::try_exists(path).await? {
            let content = tokio::fs::read_to_string(path).await?;
            Ok((toml::from_str(&content)?, false))
        } else {
            let config = AppConfig::default();
            tokio::fs::write(path, toml::to_string_pretty(&config)?).await?;
            Ok((config, true))
        }
    }

    /// Applies command-line overrides.
    pub fn apply_cli(&mut self, args: &CliArgs) {
        if let Some(modules_file) = &args.modules_file {
            self.loader.modules_file = modules_file.clone();
        }
        if let Some(unit_directory) = &args.unit_directory {
            self.loader.unit_directory = Some(unit_directory.clone());
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.loader.modules_file.as_os_str().is_empty() {
            return Err("Module list path cannot be empty".to_string());
        }

        if let Some(directory) = &self.loader.unit_directory {
            if directory.as_os_str().is_empty() {
                return Err("Unit directory cannot be empty".to_string());
            }
        }

        if self.loader.unload_attempts == 0 {
            return Err("unload_attempts must be at least 1".to_string());
        }

        if !VALID_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {VALID_LEVELS:?}",
                self.logging.level
            ));
        }

        Ok(())
    }
}

//! TOML-based configuration for Stratum.
//!
//! Supports a config file (stratum.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [storage]
//! load_template = 'CREATE TABLE "{table}" AS SELECT * FROM read_parquet(''{path}/{pattern}'')'
//!
//! [refresh]
//! enabled = true
//!
//! [cache]
//! path = "${STRATUM_HOME}/cache.db"
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Failed to determine home directory")]
    NoHomeDir,
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Export-storage configuration for loading files into the cache engine.
    pub storage: StorageSettings,

    /// Refresh scheduler configuration.
    pub refresh: RefreshSettings,

    /// Cache-engine database configuration.
    pub cache: CacheSettings,
}

/// Export-storage configuration.
///
/// The load template is the parametrized statement that ingests an export
/// location into a physical cache table. `{path}`, `{pattern}` and `{table}`
/// placeholders are substituted per load.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Statement template for loading exported files into the cache engine.
    pub load_template: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            load_template:
                "CREATE TABLE \"{table}\" AS SELECT * FROM read_parquet('{path}/{pattern}')"
                    .to_string(),
        }
    }
}

impl StorageSettings {
    /// Generate the load statement for one export location and target table.
    pub fn load_statement(&self, path: &str, pattern: &str, table: &str) -> String {
        self.load_template
            .replace("{path}", path)
            .replace("{pattern}", pattern)
            .replace("{table}", table)
    }
}

/// Refresh scheduler configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RefreshSettings {
    /// Install recurring refresh jobs after the initial materialization.
    ///
    /// Disabling this still runs every initial materialization; it only
    /// suppresses the background schedule (useful for one-shot rebuilds).
    pub enabled: bool,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Cache-engine database configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Path to the cache database file (supports ${ENV_VAR} expansion).
    ///
    /// When absent the engine runs in memory.
    pub path: Option<String>,
}

impl CacheSettings {
    /// Resolve the cache database path with environment variables expanded.
    pub fn resolved_path(&self) -> Result<Option<PathBuf>, SettingsError> {
        match &self.path {
            Some(path) => Ok(Some(PathBuf::from(expand_env_vars(path)?))),
            None => Ok(None),
        }
    }

    /// Default on-disk location: `~/.stratum/cache.db`.
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        let base = dirs::home_dir().ok_or(SettingsError::NoHomeDir)?;
        Ok(base.join(".stratum").join("cache.db"))
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Parse settings from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(content)?)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `STRATUM_CONFIG`
    /// 2. `./stratum.toml`
    /// 3. `~/.config/stratum/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("STRATUM_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("stratum.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("stratum").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' {
            if chars.peek() == Some(&'{') {
                chars.next(); // consume '{'
                let mut var_name = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch == '}' {
                        chars.next(); // consume '}'
                        break;
                    }
                    var_name.push(chars.next().unwrap());
                }
                let value = env::var(&var_name)
                    .map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
                result.push_str(&value);
            } else {
                // $VAR (ends at non-alphanumeric/underscore)
                let mut var_name = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        var_name.push(chars.next().unwrap());
                    } else {
                        break;
                    }
                }
                if var_name.is_empty() {
                    // Just a lone $, keep it
                    result.push('$');
                } else {
                    let value = env::var(&var_name)
                        .map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
                    result.push_str(&value);
                }
            }
        } else {
            result.push(c);
        }
    }

    Ok(result)
}

//! Configuration Loader
//!
//! Environment-aware configuration loading. Discovers a base YAML file plus
//! an optional environment overlay, deep-merges them, and deserializes into
//! the validated [`FiscalConfig`] structure. Missing files fall back to the
//! built-in defaults rather than failing startup.

use super::error::{ConfigResult, ConfigurationError};
use super::FiscalConfig;
use serde_yaml::Value as YamlValue;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const BASE_CONFIG_FILE: &str = "fiscal-config.yaml";

/// Loaded configuration together with the environment it was resolved for.
pub struct ConfigManager {
    config: FiscalConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection from the default
    /// `config/` directory.
    pub fn load() -> ConfigResult<Self> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory.
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Self> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with an explicit
    /// environment, useful in tests that must not touch process env vars.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Self> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            environment = %environment,
            directory = %config_directory.display(),
            "Loading fiscal-core configuration"
        );

        let config = Self::load_and_merge(&config_directory, environment)?;
        config.validate()?;

        Ok(Self {
            config,
            environment: environment.to_string(),
            config_directory,
        })
    }

    pub fn config(&self) -> &FiscalConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Detect the current environment from conventional variables.
    pub fn detect_environment() -> String {
        env::var("FISCAL_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn load_and_merge(directory: &Path, environment: &str) -> ConfigResult<FiscalConfig> {
        let base_path = directory.join(BASE_CONFIG_FILE);
        let overlay_path = directory.join(format!("fiscal-config.{environment}.yaml"));

        let base = match Self::read_yaml(&base_path)? {
            Some(value) => value,
            None => {
                warn!(
                    path = %base_path.display(),
                    "No configuration file found, using built-in defaults"
                );
                return Ok(FiscalConfig::default());
            }
        };

        let merged = match Self::read_yaml(&overlay_path)? {
            Some(overlay) => {
                debug!(
                    path = %overlay_path.display(),
                    "Applying environment overlay"
                );
                Self::deep_merge(base, overlay)
            }
            None => base,
        };

        serde_yaml::from_value(merged).map_err(|source| ConfigurationError::Parse {
            path: base_path,
            source,
        })
    }

    fn read_yaml(path: &Path) -> ConfigResult<Option<YamlValue>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path).map_err(|source| {
            ConfigurationError::FileRead {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let value =
            serde_yaml::from_str(&contents).map_err(|source| ConfigurationError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Some(value))
    }

    /// Recursive mapping merge; overlay scalars and sequences replace base
    /// values wholesale.
    fn deep_merge(base: YamlValue, overlay: YamlValue) -> YamlValue {
        match (base, overlay) {
            (YamlValue::Mapping(mut base_map), YamlValue::Mapping(overlay_map)) => {
                for (key, overlay_value) in overlay_map {
                    let merged = match base_map.remove(&key) {
                        Some(base_value) => Self::deep_merge(base_value, overlay_value),
                        None => overlay_value,
                    };
                    base_map.insert(key, merged);
                }
                YamlValue::Mapping(base_map)
            }
            (_, overlay) => overlay,
        }
    }
}

use crate::models::{RunConfig, Settings};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;

/// Settings file name inside the config directory
pub const SETTINGS_FILE: &str = "Trial Settings.yaml";

/// Run configuration file name inside the config directory
pub const RUN_CONFIG_FILE: &str = "Trial Run.yaml";

/// Older run files were written as JSON, which parses as YAML
const LEGACY_RUN_CONFIG_FILE: &str = "Trial Run.json";

/// Configuration manager for loading and saving YAML configuration files.
///
/// Manages two configuration files:
/// - Settings (`Trial Settings.yaml`): display, controller and logging settings
/// - Run config (`Trial Run.yaml`, or legacy `Trial Run.json`): images,
///   delay, repetitions and transforms for a trial
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    settings_path: Utf8PathBuf,
    run_config_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager with the specified configuration directory.
    ///
    /// # Arguments
    /// * `config_dir` - Directory containing configuration files (e.g., "Trial Data").
    ///   Created if it does not exist.
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            settings_path: config_dir.join(SETTINGS_FILE),
            run_config_path: config_dir.join(RUN_CONFIG_FILE),
            config_dir,
        })
    }

    /// Load the settings file, or defaults if it doesn't exist
    pub fn load_settings(&self) -> Result<Settings> {
        if !self.settings_path.exists() {
            tracing::warn!(
                "Settings file not found at {}, using defaults",
                self.settings_path
            );
            return Ok(Settings::default());
        }

        let settings = read_yaml(&self.settings_path, "settings")?;
        tracing::info!("Loaded settings from {}", self.settings_path);
        Ok(settings)
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        write_yaml(&self.settings_path, settings, "settings")?;
        tracing::info!("Saved settings to {}", self.settings_path);
        Ok(())
    }

    /// Load the run configuration.
    ///
    /// # Returns
    /// The loaded RunConfig, or a default (no images) if neither the YAML nor
    /// the legacy JSON file exists
    pub fn load_run_config(&self) -> Result<RunConfig> {
        let legacy_path = self.config_dir.join(LEGACY_RUN_CONFIG_FILE);

        let config_path = if self.run_config_path.exists() {
            &self.run_config_path
        } else if legacy_path.exists() {
            tracing::info!("Using legacy run config file: {}", legacy_path);
            &legacy_path
        } else {
            tracing::warn!(
                "Run config file not found at {} or {}, using defaults",
                self.run_config_path,
                legacy_path
            );
            return Ok(RunConfig::default());
        };

        self.load_run_config_from(config_path)
    }

    /// Load a run configuration from an explicit path
    pub fn load_run_config_from(&self, path: &Utf8Path) -> Result<RunConfig> {
        let config: RunConfig = read_yaml(path, "run config")?;
        if !config.extra.is_empty() {
            tracing::debug!(
                "Run config has {} unrecognised keys, keeping them",
                config.extra.len()
            );
        }
        tracing::info!(
            "Loaded run config from {}: {} images x{}",
            path,
            config.image_paths.len(),
            config.repetitions
        );
        Ok(config)
    }

    pub fn save_run_config(&self, config: &RunConfig) -> Result<()> {
        write_yaml(&self.run_config_path, config, "run config")?;
        tracing::info!("Saved run config to {}", self.run_config_path);
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }
}

fn read_yaml<T: DeserializeOwned>(path: &Utf8Path, what: &str) -> Result<T> {
    let file_contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}: {}", what, path))?;

    serde_yaml_ng::from_str(&file_contents)
        .with_context(|| format!("Failed to parse {}: {}", what, path))
}

fn write_yaml<T: Serialize>(path: &Utf8Path, value: &T, what: &str) -> Result<()> {
    let yaml_string = serde_yaml_ng::to_string(value)
        .with_context(|| format!("Failed to serialize {} to YAML", what))?;

    fs::write(path, yaml_string).with_context(|| format!("Failed to write {}: {}", what, path))
}

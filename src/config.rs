//! Configuration module for persistent settings.
//!
//! This module handles loading, saving, and validating daemon configuration.

use crate::core_logic::EngineSettings;
use crate::display_control::{DisplayCommand, DEFAULT_ATTEMPTS, DEFAULT_BACKOFF};
use crate::error::ConfigError;
use crate::monitor::MonitorSettings;
use crate::resolution::{Resolution, ResolutionPair};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

const MAX_STABILITY_CHECKS: usize = 20;
const MAX_BASELINE_READINGS: usize = 50;
const MAX_END_CHECKS: u32 = 10;
/// Slack on top of the worst-case restore when stopping at shutdown.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(2);

/// Daemon configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub game_resolution: Resolution,
    pub desktop_resolution: Resolution,
    pub tick_interval_ms: u64,
    pub start_delay_ms: u64,
    pub end_delay_ms: u64,
    pub end_check_count: u32,
    pub end_check_interval_ms: u64,
    pub baseline_readings: usize,
    pub stability_checks: usize,
    /// Core count used to normalize CPU usage; detected when unset.
    pub cpu_cores: Option<usize>,
    pub display_command: DisplayCommand,
    pub display_timeout_ms: u64,
    /// Start monitoring as soon as the daemon launches.
    pub autostart: bool,
}

impl Default for Config {
    fn default() -> Self {
        let pair = ResolutionPair::default();
        Self {
            game_resolution: pair.game,
            desktop_resolution: pair.desktop,
            tick_interval_ms: 3000,
            start_delay_ms: 5000,
            end_delay_ms: 5000,
            end_check_count: 3,
            end_check_interval_ms: 2000,
            baseline_readings: 3,
            stability_checks: 3,
            cpu_cores: None,
            display_command: DisplayCommand::default(),
            display_timeout_ms: 10_000,
            autostart: true,
        }
    }
}

impl Config {
    /// Validate configuration values.
    /// Returns Ok(()) if valid, Err with descriptive message if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("tick_interval_ms", self.tick_interval_ms),
            ("start_delay_ms", self.start_delay_ms),
            ("end_delay_ms", self.end_delay_ms),
            ("end_check_interval_ms", self.end_check_interval_ms),
            ("display_timeout_ms", self.display_timeout_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        check_count("stability_checks", self.stability_checks, MAX_STABILITY_CHECKS)?;
        check_count("baseline_readings", self.baseline_readings, MAX_BASELINE_READINGS)?;
        check_count(
            "end_check_count",
            self.end_check_count as usize,
            MAX_END_CHECKS as usize,
        )?;

        if self.cpu_cores == Some(0) {
            return Err(ConfigError::ValidationError(
                "cpu_cores must be greater than 0 when set".to_string(),
            ));
        }

        if self.display_command.program.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "display_command.program must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn resolution_pair(&self) -> ResolutionPair {
        ResolutionPair::new(self.game_resolution, self.desktop_resolution)
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            engine: EngineSettings {
                baseline_readings: self.baseline_readings,
                stability_checks: self.stability_checks,
                start_delay: Duration::from_millis(self.start_delay_ms),
                end_delay: Duration::from_millis(self.end_delay_ms),
                end_check_count: self.end_check_count,
                end_check_interval: Duration::from_millis(self.end_check_interval_ms),
            },
        }
    }

    pub fn display_timeout(&self) -> Duration {
        Duration::from_millis(self.display_timeout_ms)
    }

    /// Bound for stopping monitoring at shutdown: every restore attempt may
    /// run into the helper timeout, with the retry backoff in between.
    pub fn shutdown_timeout(&self) -> Duration {
        self.display_timeout() * DEFAULT_ATTEMPTS
            + DEFAULT_BACKOFF * DEFAULT_ATTEMPTS.saturating_sub(1)
            + SHUTDOWN_MARGIN
    }
}

fn check_count(name: &str, value: usize, max: usize) -> Result<(), ConfigError> {
    if value == 0 || value > max {
        return Err(ConfigError::ValidationError(format!(
            "{} ({}) must be between 1 and {}",
            name, value, max
        )));
    }
    Ok(())
}

/// Configuration manager with file I/O.
pub struct ConfigManager {
    config: RwLock<Config>,
    path: PathBuf,
}

impl ConfigManager {
    /// Load configuration from file or use defaults.
    /// If the file doesn't exist, returns a manager with default config.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let contents = fs::read_to_string(path).map_err(|e| {
                ConfigError::ParseError(format!("Failed to read config file: {}", e))
            })?;

            let config: Config = serde_json::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(format!("Invalid JSON: {}", e)))?;

            config.validate()?;
            config
        } else {
            Config::default()
        };

        Ok(Self {
            config: RwLock::new(config),
            path: path.to_path_buf(),
        })
    }

    /// Save configuration to file using atomic write.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config = self.get();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to a sibling temp file, then rename over the target.
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&config)
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {}", e)))?;

        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    /// Get current configuration.
    pub fn get(&self) -> Config {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Validate, replace and persist the configuration.
    pub fn update(&self, config: Config) -> Result<(), ConfigError> {
        config.validate()?;

        {
            let mut current = self.config.write().map_err(|_| {
                ConfigError::ValidationError("Failed to acquire write lock".to_string())
            })?;
            *current = config;
        }

        self.save()
    }

    /// Persist a new resolution pair, keeping every other setting.
    pub fn update_resolutions(&self, pair: ResolutionPair) -> Result<(), ConfigError> {
        let mut config = self.get();
        config.game_resolution = pair.game;
        config.desktop_resolution = pair.desktop;
        self.update(config)
    }

    /// Get the config file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Default config path (`<config_dir>/match-res/config.json`).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("match-res")
            .join("config.json")
    }
}

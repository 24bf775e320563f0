//! Configuration management for replaycast

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// OBS WebSocket configuration
    #[serde(default)]
    pub obs: ObsConfig,

    /// Playback engine configuration
    #[serde(default)]
    pub playback: PlaybackConfig,

    /// Recording defaults
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObsConfig {
    /// OBS WebSocket host
    #[serde(default = "default_obs_host")]
    pub host: String,

    /// OBS WebSocket port
    #[serde(default = "default_obs_port")]
    pub port: u16,

    /// OBS WebSocket password (optional)
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Playback engine executable; playback cannot start while unset
    pub executable: Option<PathBuf>,

    /// Extra arguments appended to every engine launch
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Record playback without needing the --record flag
    #[serde(default)]
    pub enabled: bool,

    /// Pause/unpause at entry boundaries instead of stop/start
    #[serde(default = "default_true")]
    pub pause_between_entries: bool,
}

// Default value functions
fn default_obs_host() -> String {
    "localhost".to_string()
}

fn default_obs_port() -> u16 {
    4455
}

fn default_true() -> bool {
    true
}

impl Default for ObsConfig {
    fn default() -> Self {
        Self {
            host: default_obs_host(),
            port: default_obs_port(),
            password: None,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pause_between_entries: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            obs: ObsConfig::default(),
            playback: PlaybackConfig::default(),
            recording: RecordingConfig::default(),
            config_path: None,
        }
    }
}

impl Config {
    /// Load configuration from the default location or create the default
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

            config.config_path = Some(config_path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = match self.config_path.clone() {
            Some(path) => path,
            None => Self::default_config_path()?,
        };

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match self.config_path.clone() {
            Some(path) => Ok(path),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "replaycast", "replaycast")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();

        assert_eq!(parsed.obs.host, "localhost");
        assert_eq!(parsed.obs.port, 4455);
        assert!(!parsed.recording.enabled);
        assert!(parsed.recording.pause_between_entries);
        assert!(parsed.playback.executable.is_none());
    }
}

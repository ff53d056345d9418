//! Player configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read config {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Failed to parse config: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("{0}")]
  Invalid(String),
}

/// State applied once right after the player starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialState {
  /// Absolute volume (0-100).
  #[serde(default)]
  pub volume: Option<f64>,

  /// Loop count (0 = forever, -1 = off).
  #[serde(default, rename = "loop")]
  pub loop_count: Option<i32>,

  /// Start time in seconds.
  #[serde(default)]
  pub time: Option<f64>,

  /// Start position in percent of the length.
  #[serde(default)]
  pub position: Option<f64>,

  /// Playback speed factor.
  #[serde(default)]
  pub speed: Option<f64>,

  /// Start muted, or explicitly unmuted.
  #[serde(default)]
  pub mute: Option<bool>,
}

impl InitialState {
  /// Field-wise merge, values set in `overrides` win.
  pub fn merged(&self, overrides: &InitialState) -> InitialState {
    InitialState {
      volume: overrides.volume.or(self.volume),
      loop_count: overrides.loop_count.or(self.loop_count),
      time: overrides.time.or(self.time),
      position: overrides.position.or(self.position),
      speed: overrides.speed.or(self.speed),
      mute: overrides.mute.or(self.mute),
    }
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if let Some(volume) = self.volume {
      if !(0.0..=100.0).contains(&volume) {
        return Err(ConfigError::Invalid(
          "Volume must be between 0 and 100".to_string(),
        ));
      }
    }
    if let Some(position) = self.position {
      if !(0.0..=100.0).contains(&position) {
        return Err(ConfigError::Invalid(
          "Position must be between 0 and 100 percent".to_string(),
        ));
      }
    }
    if let Some(time) = self.time {
      if time < 0.0 {
        return Err(ConfigError::Invalid("Start time cannot be negative".to_string()));
      }
    }
    if let Some(speed) = self.speed {
      if speed <= 0.0 {
        return Err(ConfigError::Invalid("Speed must be positive".to_string()));
      }
    }
    Ok(())
  }
}

/// Filesystem locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathsConfig {
  /// Control pipe the player reads commands from.
  #[serde(default = "default_fifo_path")]
  pub fifo: String,
}

impl Default for PathsConfig {
  fn default() -> Self {
    Self {
      fifo: default_fifo_path(),
    }
  }
}

/// Player configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerConfig {
  /// Time position polling interval in milliseconds (0 = no polling).
  #[serde(default = "default_update_interval")]
  pub update_interval: u64,

  #[serde(default)]
  pub paths: PathsConfig,

  /// Custom MPlayer executable path (None = auto-detect).
  #[serde(default)]
  pub mplayer_path: Option<String>,

  /// Additional MPlayer command-line arguments.
  #[serde(default)]
  pub mplayer_args: Vec<String>,

  /// Give up on unanswered queries after this many milliseconds (None = wait forever).
  #[serde(default)]
  pub query_timeout_ms: Option<u64>,

  #[serde(flatten)]
  pub initial: InitialState,
}

fn default_update_interval() -> u64 {
  1000
}

fn default_fifo_path() -> String {
  "./.mplayer".to_string()
}

impl Default for PlayerConfig {
  fn default() -> Self {
    Self {
      update_interval: default_update_interval(),
      paths: PathsConfig::default(),
      mplayer_path: None,
      mplayer_args: Vec::new(),
      query_timeout_ms: None,
      initial: InitialState::default(),
    }
  }
}

impl PlayerConfig {
  /// Load and validate a JSON config file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let config: PlayerConfig = serde_json::from_str(&text)?;
    config.validate()?;
    log::info!("Loaded config from {:?}", path);
    Ok(config)
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.paths.fifo.trim().is_empty() {
      return Err(ConfigError::Invalid(
        "Control pipe path cannot be empty".to_string(),
      ));
    }
    if self.query_timeout_ms == Some(0) {
      return Err(ConfigError::Invalid(
        "Query timeout must be positive when set".to_string(),
      ));
    }
    if matches!(&self.mplayer_path, Some(p) if p.trim().is_empty()) {
      return Err(ConfigError::Invalid(
        "MPlayer path cannot be empty when set".to_string(),
      ));
    }
    self.initial.validate()
  }

  pub fn fifo_path(&self) -> PathBuf {
    PathBuf::from(&self.paths.fifo)
  }

  pub fn mplayer_path(&self) -> Option<&Path> {
    self.mplayer_path.as_deref().map(Path::new)
  }

  /// Polling interval, `None` when polling is disabled.
  pub fn update_interval(&self) -> Option<Duration> {
    (self.update_interval > 0).then(|| Duration::from_millis(self.update_interval))
  }

  pub fn query_timeout(&self) -> Option<Duration> {
    self.query_timeout_ms.map(Duration::from_millis)
  }
}

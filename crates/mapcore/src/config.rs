use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_TALK_DISTANCE: f64 = 8.0;
pub const DEFAULT_FRAME_RATE: u32 = 60;

/// Input/interaction configuration for the engine. Loaded from JSON or
/// built up through validated setters; invalid values are rejected,
/// never clamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum pixel distance at which talk activation reaches a
    /// person in front of the player.
    pub talk_distance: f64,
    /// Host button id bound to talk activation.
    pub talk_button: u32,
    /// Frame rate used when a caller does not supply one.
    pub default_frame_rate: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            talk_distance: DEFAULT_TALK_DISTANCE,
            talk_button: 0,
            default_frame_rate: DEFAULT_FRAME_RATE,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("talk distance {distance} is not a positive finite number")]
    InvalidTalkDistance { distance: f64 },
    #[error("frame rate must be positive")]
    InvalidFrameRate,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.talk_distance.is_finite() || self.talk_distance <= 0.0 {
            return Err(ConfigError::InvalidTalkDistance {
                distance: self.talk_distance,
            });
        }
        if self.default_frame_rate == 0 {
            return Err(ConfigError::InvalidFrameRate);
        }
        Ok(())
    }
}

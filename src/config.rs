//! Configuration file handling.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::dithering::Orientation;
use crate::palette::ColorMode;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Top-level `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub ble: BleConfig,
    pub image: ImageConfig,
}

/// How to find and talk to the frame over BLE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Advertised name prefix to match during scans; empty matches everything.
    pub name_prefix: String,
    pub scan_secs: u64,
    pub connect_timeout_secs: u64,
    pub service_uuid: Uuid,
    /// Commands, write with response.
    pub command_uuid: Uuid,
    /// Responses, notify.
    pub response_uuid: Uuid,
    /// Raw upload chunks, write with response.
    pub data_uuid: Uuid,
}

pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);
pub const DEFAULT_COMMAND_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);
pub const DEFAULT_RESPONSE_UUID: Uuid = Uuid::from_u128(0xbeb5483f_36e1_4688_b7f5_ea07361b26a8);
pub const DEFAULT_DATA_UUID: Uuid = Uuid::from_u128(0xbeb54840_36e1_4688_b7f5_ea07361b26a8);

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            name_prefix: "PhotoFrame".to_string(),
            scan_secs: 5,
            connect_timeout_secs: 10,
            service_uuid: DEFAULT_SERVICE_UUID,
            command_uuid: DEFAULT_COMMAND_UUID,
            response_uuid: DEFAULT_RESPONSE_UUID,
            data_uuid: DEFAULT_DATA_UUID,
        }
    }
}

impl BleConfig {
    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Defaults for image conversion when the CLI doesn't say otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub color_mode: ColorMode,
    pub orientation: Orientation,
}

impl FrameConfig {
    /// Per-user config file location, falling back to the working directory.
    pub fn default_path() -> PathBuf {
        ProjectDirs::from("", "", "epaper-frame")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Loads `path`. A missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: FrameConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ble.scan_secs == 0 {
            return Err(ConfigError::Validation("ble.scan_secs must be greater than 0".to_string()));
        }
        if self.ble.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "ble.connect_timeout_secs must be greater than 0".to_string(),
            ));
        }
        let uuids = [
            self.ble.command_uuid,
            self.ble.response_uuid,
            self.ble.data_uuid,
        ];
        if uuids[0] == uuids[1] || uuids[0] == uuids[2] || uuids[1] == uuids[2] {
            return Err(ConfigError::Validation(
                "command, response and data characteristics must differ".to_string(),
            ));
        }
        Ok(())
    }
}

//! Service settings and the camera configuration object.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::driver::Resolution;
use crate::error::ControlError;

/// Error loading settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The settings file could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The settings file is not valid JSON for [`Settings`].
    #[error("Invalid settings: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Resolutions used for the two kinds of capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionSettings {
    /// Single preview photos.
    pub preview: Resolution,
    /// Timelapse frames, unless the camera configuration overrides it.
    pub timelapse: Resolution,
}

impl Default for ResolutionSettings {
    fn default() -> Self {
        Self {
            preview: Resolution::new(1024, 768),
            timelapse: Resolution::new(1640, 1232),
        }
    }
}

/// Service settings, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Video device index (`/dev/video{index}`).
    pub device_index: u32,
    /// Root directory for timelapse run directories.
    pub output_root: PathBuf,
    /// Where preview photos are written.
    pub preview_path: PathBuf,
    /// Capture resolutions.
    pub resolution: ResolutionSettings,
    /// Camera configuration object exposed to clients.
    pub camera: CameraConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_index: 0,
            output_root: PathBuf::from("timelapse"),
            preview_path: PathBuf::from("static/img/preview.jpg"),
            resolution: ResolutionSettings::default(),
            camera: CameraConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Parse settings from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Opaque camera configuration object.
///
/// Only the `title` member is required. An optional `resolution` member
/// (`{"width": .., "height": ..}`) overrides the timelapse resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct CameraConfig {
    fields: Map<String, Value>,
    resolution: Option<Resolution>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fields: Map::from_iter([("title".to_owned(), json!("Pi Camera"))]),
            resolution: None,
        }
    }
}

impl CameraConfig {
    /// Title of the configuration.
    pub fn title(&self) -> Option<&str> {
        self.fields.get("title").and_then(Value::as_str)
    }

    /// Timelapse resolution override, if any.
    pub const fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    /// Configuration as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

impl TryFrom<Value> for CameraConfig {
    type Error = ControlError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(fields) = value else {
            return Err(ControlError::Validation(
                "camera configuration must be an object".to_owned(),
            ));
        };
        if !fields.contains_key("title") {
            return Err(ControlError::Validation(
                "camera configuration requires a title".to_owned(),
            ));
        }

        let resolution = match fields.get("resolution") {
            None | Some(Value::Null) => None,
            Some(value) => Some(Resolution::deserialize(value).map_err(|err| {
                ControlError::Validation(format!("invalid resolution: {err}"))
            })?),
        };

        Ok(Self { fields, resolution })
    }
}

impl From<CameraConfig> for Value {
    fn from(config: CameraConfig) -> Self {
        Self::Object(config.fields)
    }
}

//! Pipeline configuration.
//!
//! Loaded from TOML with every field defaulted, so an empty file (or no
//! file at all) yields a working single-face setup. Hosts embedding the
//! pipeline declaratively can instead supply string attributes via
//! [`FilterAttributes`], which are parsed leniently: invalid values fall
//! back to defaults with a warning instead of failing.

use std::collections::HashMap;
use std::path::Path;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::behaviours::FaceLayout;
use crate::error::{ConfigError, Result};

/// Top-level configuration for the tracking pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Maximum number of faces to track simultaneously. 0 disables face
    /// tracking entirely.
    pub max_faces: u32,
    /// Maximum number of hands to track. 0 disables hand tracking.
    pub max_hands: u32,
    pub enable_pose: bool,
    pub enable_segmentation: bool,
    /// Automatically reduce `max_faces` under sustained low frame rates.
    pub auto_manage_performance: bool,
    /// Allow cycling filters with the keyboard.
    pub use_keyboard: bool,
    /// URL query parameter used to persist the selected filter index.
    pub url_parameter: Option<String>,
    /// Create the built-in head occluder for filters that don't bring one.
    pub create_occlusion_mesh: bool,
    /// Optional custom occluder asset; replaces the built-in ellipsoid.
    pub occluder_url: Option<String>,
    /// Mirror the scene horizontally (selfie view).
    pub mirror: bool,
    /// Show the raw camera video behind the scene.
    pub show_video: bool,
    /// Uniform scale applied to filter visuals on top of the face transform.
    pub filter_scale: f32,
    /// Face-local offset applied to filter visuals, in metres.
    pub filter_offset: [f32; 3],
    pub tuning: TuningConfig,
}

/// Smoothing and performance-governor parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub matrix_min_cutoff: f32,
    pub matrix_beta: f32,
    pub blendshape_min_cutoff: f32,
    pub blendshape_beta: f32,
    /// Smoothed fps below which the performance governor starts counting.
    pub fps_threshold: f32,
    /// Seconds of sustained low fps before a downscale fires.
    pub downscale_cooldown_secs: f64,
    /// Seconds a face entity survives without a fresh detection before it
    /// is retired.
    pub entity_grace_secs: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_faces: default_max_faces(),
            max_hands: 0,
            enable_pose: false,
            enable_segmentation: false,
            auto_manage_performance: true,
            use_keyboard: true,
            url_parameter: None,
            create_occlusion_mesh: true,
            occluder_url: None,
            mirror: true,
            show_video: true,
            filter_scale: 1.0,
            filter_offset: [0.0; 3],
            tuning: TuningConfig::default(),
        }
    }
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            matrix_min_cutoff: 3.0,
            matrix_beta: 0.5,
            blendshape_min_cutoff: 0.05,
            blendshape_beta: 0.2,
            fps_threshold: 26.0,
            downscale_cooldown_secs: 5.0,
            entity_grace_secs: 0.5,
        }
    }
}

fn default_max_faces() -> u32 {
    1
}

impl FilterConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadFile(e.to_string()))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file if it exists, otherwise use defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            tracing::info!(path = %path.display(), "loading config");
            Self::from_file(path)
        } else {
            tracing::info!("no config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.filter_scale.is_finite() || self.filter_scale <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "filter_scale".into(),
                message: "must be positive".into(),
            }
            .into());
        }
        if self.tuning.matrix_min_cutoff <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "tuning.matrix_min_cutoff".into(),
                message: "must be positive".into(),
            }
            .into());
        }
        if self.tuning.blendshape_min_cutoff <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "tuning.blendshape_min_cutoff".into(),
                message: "must be positive".into(),
            }
            .into());
        }
        if self.tuning.fps_threshold <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "tuning.fps_threshold".into(),
                message: "must be positive".into(),
            }
            .into());
        }
        if self.tuning.downscale_cooldown_secs < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "tuning.downscale_cooldown_secs".into(),
                message: "must not be negative".into(),
            }
            .into());
        }
        if self.tuning.entity_grace_secs < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "tuning.entity_grace_secs".into(),
                message: "must not be negative".into(),
            }
            .into());
        }
        Ok(())
    }
}

/// Declarative string attributes, as a host markup layer would supply them.
///
/// Keys mirror the config fields they override. Parsing is lenient: an
/// unparseable value logs a warning and keeps the existing setting.
#[derive(Debug, Clone, Default)]
pub struct FilterAttributes {
    values: HashMap<String, String>,
}

impl FilterAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Comma-separated filter asset URLs declared on the element.
    pub fn filter_urls(&self) -> Vec<String> {
        self.get("filter")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Declared face texture layout; defaults to mediapipe.
    pub fn layout(&self) -> FaceLayout {
        self.get("layout").map(FaceLayout::parse).unwrap_or_default()
    }

    /// Optional alpha mask texture URL for the face material.
    pub fn mask_url(&self) -> Option<&str> {
        self.get("mask")
    }

    /// Uniform scale applied to the filter visual. Defaults to 1.
    pub fn scale(&self) -> f32 {
        match self.get("scale") {
            None => 1.0,
            Some(raw) => match raw.trim().parse::<f32>() {
                Ok(value) if value.is_finite() && value > 0.0 => value,
                _ => {
                    warn_invalid("scale", raw);
                    1.0
                }
            },
        }
    }

    /// Positional offset of the filter visual, as "x y z" or "x,y,z".
    pub fn offset(&self) -> Option<Vec3> {
        let raw = self.get("offset")?;
        let parts: Vec<f32> = raw
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .collect();
        if parts.len() == 3 {
            Some(Vec3::new(parts[0], parts[1], parts[2]))
        } else {
            warn_invalid("offset", raw);
            None
        }
    }

    /// Apply recognized attributes on top of an existing config.
    pub fn apply_to(&self, config: &mut FilterConfig) {
        if let Some(raw) = self.get("max-faces") {
            match raw.parse::<u32>() {
                Ok(value) => config.max_faces = value,
                Err(_) => warn_invalid("max-faces", raw),
            }
        }
        if let Some(raw) = self.get("max-hands") {
            match raw.parse::<u32>() {
                Ok(value) => config.max_hands = value,
                Err(_) => warn_invalid("max-hands", raw),
            }
        }
        if let Some(raw) = self.get("show-video") {
            match parse_bool(raw) {
                Some(value) => config.show_video = value,
                None => warn_invalid("show-video", raw),
            }
        }
        if let Some(raw) = self.get("mirror") {
            match parse_bool(raw) {
                Some(value) => config.mirror = value,
                None => warn_invalid("mirror", raw),
            }
        }
        if let Some(raw) = self.get("occlusion-mesh") {
            match parse_bool(raw) {
                Some(value) => config.create_occlusion_mesh = value,
                None => warn_invalid("occlusion-mesh", raw),
            }
        }
        if let Some(raw) = self.get("occluder") {
            config.occluder_url = Some(raw.to_owned());
        }
        if let Some(raw) = self.get("url-parameter") {
            config.url_parameter = Some(raw.to_owned());
        }
        if self.get("scale").is_some() {
            config.filter_scale = self.scale();
        }
        if let Some(offset) = self.offset() {
            config.filter_offset = offset.to_array();
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn warn_invalid(key: &str, raw: &str) {
    if cfg!(debug_assertions) {
        tracing::warn!(attribute = key, value = raw, "ignoring unparseable attribute");
    }
}

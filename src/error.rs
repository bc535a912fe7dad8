//! Error types for the facefilter pipeline

use thiserror::Error;

/// Main error type for facefilter
#[derive(Error, Debug)]
pub enum FacefilterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("Detector error: {0}")]
    Detector(#[from] DetectorError),

    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadFile(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration value: {field} - {message}")]
    InvalidValue { field: String, message: String },
}

/// Camera acquisition errors
#[derive(Error, Debug, Clone)]
pub enum CameraError {
    #[error("Camera permission denied: {0}")]
    PermissionDenied(String),

    #[error("Camera device busy: {0}")]
    DeviceBusy(String),

    #[error("No camera device available: {0}")]
    Unavailable(String),
}

/// Detector lifecycle and inference errors
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Detector creation failed: {0}")]
    CreationFailed(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Failed to apply detector options: {0}")]
    Reconfigure(String),
}

/// Asset and texture loading errors
#[derive(Error, Debug)]
pub enum AssetError {
    #[error("Asset not found: {0}")]
    NotFound(String),

    #[error("Failed to load asset: {0}")]
    LoadFailed(String),
}

/// Result type alias for facefilter operations
pub type Result<T> = std::result::Result<T, FacefilterError>;

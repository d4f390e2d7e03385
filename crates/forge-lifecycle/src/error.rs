use forge_engine::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("invalid byte unit format: {0}")]
    InvalidByteUnit(String),

    #[error("invalid byte number format: {0}")]
    InvalidByteNumber(String),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error("container exited with status {status}")]
    ContainerExited { status: i64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Failures resolving a buildpack download URL
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("network unavailable: {0}")]
    Network(String),

    #[error("version service unavailable: {0}")]
    Unavailable(String),

    #[error("version lookup failed: {0}")]
    Other(String),
}

impl VersionError {
    /// Whether staging may continue with the buildpacks already in the image
    pub fn is_degraded(&self) -> bool {
        matches!(self, VersionError::Network(_) | VersionError::Unavailable(_))
    }
}

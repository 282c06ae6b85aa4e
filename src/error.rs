use thiserror::Error;

use crate::capture::PixelFormat;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("bridge capacity must be at least 1")]
    ZeroCapacity,
    #[error("invalid frame dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("{format:?} frame needs {expected} planes, got {actual}")]
    PlaneMismatch {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("execution context stopped")]
    ContextStopped,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source already started")]
    AlreadyStarted,
    #[error("source frame rate must be at least 1")]
    InvalidRate,
    #[error("failed to spawn producer thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

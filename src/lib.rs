pub mod capture;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod session;

use std::path::Path;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SettingsError;
use crate::pipeline::OverflowPolicy;

pub use capture::{Frame, FrameFormat};
pub use pipeline::{Admission, FrameBridge};
pub use session::{MediaSession, SampleResponse};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub source: SourceConfig,
    pub consumer: ConsumerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub frame_count: Option<u64>, // None = run until stopped
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub fps: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            capacity: 3,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 60,
            format: PixelFormat::I420,
            frame_count: Some(600),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        // Pulling slower than the source exercises eviction.
        Self { fps: 30 }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.bridge.capacity == 0 {
            return Err(SettingsError::Invalid("bridge.capacity must be at least 1"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(SettingsError::Invalid("source dimensions must be non-zero"));
        }
        if self.source.fps == 0 {
            return Err(SettingsError::Invalid("source.fps must be at least 1"));
        }
        if self.consumer.fps == 0 {
            return Err(SettingsError::Invalid("consumer.fps must be at least 1"));
        }
        Ok(())
    }
}

/// Layer defaults, an optional TOML file and `FRAMEBRIDGE__*` environment
/// variables (e.g. `FRAMEBRIDGE__BRIDGE__CAPACITY=5`).
pub fn load_config(path: Option<&Path>) -> Result<Config, SettingsError> {
    let mut builder =
        config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

    if let Some(path) = path {
        info!("Loading configuration from {}", path.display());
        builder = builder.add_source(config::File::from(path));
    }

    let config: Config = builder
        .add_source(
            config::Environment::with_prefix("FRAMEBRIDGE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    config.validate()?;
    Ok(config)
}

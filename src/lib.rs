pub mod capture;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod stream;
pub mod utils;

use std::net::SocketAddr;
use std::time::Duration;

use capture::frame::{IoMethod, PixelFormat};
use error::CaptureError;
use serde::{Deserialize, Serialize};

/// Configuration file read when `CAMFEED_CONFIG` is not set.
pub const DEFAULT_CONFIG_FILE: &str = "camfeed.toml";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub server: ServerConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device node; empty to pick the first suitable `/dev/video*`.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub io_method: IoMethod,
    /// JPEG quality, 0-100, for drivers that compress on board.
    pub quality: u8,
    /// Driver buffers requested for streaming I/O.
    pub buffer_count: u32,
    pub poll_timeout_ms: u64,
    pub cpu_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Parts per multipart response, 0 for no limit.
    pub stream_frames: u64,
    pub wait_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives; `RUST_LOG` wins when set.
    pub filter: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Mjpeg,
            io_method: IoMethod::Mmap,
            quality: 75,
            buffer_count: 4,
            poll_timeout_ms: 500,
            cpu_core: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3636)),
            stream_frames: 60,
            wait_timeout_ms: 1000,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "camfeed=info".into(),
        }
    }
}

impl Config {
    /// Defaults, then the file named by `CAMFEED_CONFIG` (or
    /// [`DEFAULT_CONFIG_FILE`]) if present, then `CAMFEED_*` variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let path =
            std::env::var("CAMFEED_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("CAMFEED")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        let capture = &self.capture;
        if capture.width == 0 || capture.height == 0 {
            return Err(CaptureError::InvalidConfig(format!(
                "frame size {}x{} must not be empty",
                capture.width, capture.height
            )));
        }
        if capture.fps == 0 {
            return Err(CaptureError::InvalidConfig("fps must be at least 1".into()));
        }
        if capture.quality > 100 {
            return Err(CaptureError::InvalidConfig(format!(
                "quality {} is not within 0-100",
                capture.quality
            )));
        }
        if capture.io_method.is_streaming() && capture.buffer_count < 2 {
            return Err(CaptureError::InvalidConfig(format!(
                "{:?} i/o needs at least 2 buffers, got {}",
                capture.io_method, capture.buffer_count
            )));
        }
        Ok(())
    }
}

impl CaptureConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl ServerConfig {
    pub fn stream_limit(&self) -> Option<u64> {
        (self.stream_frames > 0).then_some(self.stream_frames)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

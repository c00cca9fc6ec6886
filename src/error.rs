use std::io;

use thiserror::Error;

/// Failure of a frame store synchronization primitive.
///
/// A poisoned lock means a publisher panicked half way through swapping the
/// current frame; nothing read through the store can be trusted afterwards.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame store {lock} lock poisoned")]
    Poisoned { lock: &'static str },
}

/// How far a capture error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The device cannot satisfy the requested setup; capture never starts.
    Configuration,
    /// The device or the frame hand-off broke after startup.
    Runtime,
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: io::Error },

    #[error("no suitable capture device found")]
    NoDevice,

    #[error("{path} is no video capture device")]
    NotCapture { path: String },

    #[error("{path} does not support {capability}")]
    Unsupported {
        path: String,
        capability: &'static str,
    },

    #[error("unable to set requested pixel format {requested} (driver chose {negotiated})")]
    FormatRejected {
        requested: String,
        negotiated: String,
    },

    #[error("insufficient buffer memory on {path}: driver granted {granted} buffers")]
    InsufficientBuffers { path: String, granted: u32 },

    #[error("invalid capture configuration: {0}")]
    InvalidConfig(String),

    #[error("{op} failed: {source}")]
    Device { op: &'static str, source: io::Error },

    #[error("driver returned buffer {index} which does not belong to the pool of {pool_size}")]
    BufferMismatch { index: usize, pool_size: usize },

    #[error("no free capture buffer: the pool of {pool_size} is all in use")]
    PoolExhausted { pool_size: usize },

    #[error("device lock poisoned")]
    DeviceLockPoisoned,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl CaptureError {
    pub(crate) fn device(op: &'static str, source: io::Error) -> Self {
        Self::Device { op, source }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Open { .. }
            | Self::NoDevice
            | Self::NotCapture { .. }
            | Self::Unsupported { .. }
            | Self::FormatRejected { .. }
            | Self::InsufficientBuffers { .. }
            | Self::InvalidConfig(_) => Severity::Configuration,
            Self::Device { .. }
            | Self::BufferMismatch { .. }
            | Self::PoolExhausted { .. }
            | Self::DeviceLockPoisoned
            | Self::Frame(_) => Severity::Runtime,
        }
    }
}

pub type Result<T, E = CaptureError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_formatting() {
        let err = CaptureError::Unsupported {
            path: "/dev/video0".into(),
            capability: "streaming i/o",
        };
        assert_eq!(err.to_string(), "/dev/video0 does not support streaming i/o");

        let err = CaptureError::device(
            "VIDIOC_DQBUF",
            io::Error::from_raw_os_error(libc::EIO),
        );
        assert!(err.to_string().starts_with("VIDIOC_DQBUF failed: "));

        let err: CaptureError = FrameError::Poisoned { lock: "publication" }.into();
        assert_eq!(err.to_string(), "frame store publication lock poisoned");
    }

    #[test]
    fn test_severity_classification() {
        let config_errors = [
            CaptureError::NoDevice,
            CaptureError::InsufficientBuffers {
                path: "/dev/video0".into(),
                granted: 1,
            },
            CaptureError::FormatRejected {
                requested: "MJPG".into(),
                negotiated: "YUYV".into(),
            },
        ];
        for err in &config_errors {
            assert_eq!(err.severity(), Severity::Configuration, "{err}");
        }

        let runtime_errors = [
            CaptureError::DeviceLockPoisoned,
            CaptureError::BufferMismatch {
                index: 9,
                pool_size: 4,
            },
            CaptureError::Frame(FrameError::Poisoned { lock: "generation" }),
        ];
        for err in &runtime_errors {
            assert_eq!(err.severity(), Severity::Runtime, "{err}");
        }
    }
}

use std::path::Path;

use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device};

use crate::capture::frame::PixelFormat;
use crate::error::{CaptureError, Result};

/// Find the first `/dev/video*` node that captures video in `format`.
pub fn auto_detect_device(format: PixelFormat) -> Result<String> {
    info!("Auto-detecting capture devices...");
    let wanted = format.fourcc();

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            debug!("cannot open {}", path);
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }

        let offers_format = dev
            .enum_formats()
            .map(|formats| formats.iter().any(|fmt| fmt.fourcc == wanted))
            .unwrap_or(false);
        if offers_format {
            info!("Found {} device: {} - {}", wanted, path, caps.card);
            return Ok(path);
        }
        debug!("{} ({}) does not offer {}", path, caps.card, wanted);
    }

    Err(CaptureError::NoDevice)
}

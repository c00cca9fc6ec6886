use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::info;

use super::frame::{Buffer, IoMethod};
use super::source::{CaptureSource, Readiness};
use crate::error::{CaptureError, Result};

/// A capture source behind the device-wide lock.
///
/// Every operation on the underlying handle (acquisition, release, start,
/// stop, control requests) goes through the same mutex. Only the readiness
/// wait happens outside it.
pub struct CaptureDevice<S> {
    source: Mutex<S>,
    readiness: Readiness,
    io_method: IoMethod,
}

impl<S: CaptureSource> CaptureDevice<S> {
    pub fn new(source: S) -> Self {
        Self {
            readiness: source.readiness(),
            io_method: source.io_method(),
            source: Mutex::new(source),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, S>> {
        self.source
            .lock()
            .map_err(|_| CaptureError::DeviceLockPoisoned)
    }

    pub fn io_method(&self) -> IoMethod {
        self.io_method
    }

    pub fn start(&self) -> Result<()> {
        self.lock()?.start()?;
        info!(io_method = ?self.io_method, "capture started");
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.lock()?.stop()?;
        info!("capture stopped");
        Ok(())
    }

    /// Block, without the device lock, until a frame may be ready.
    pub fn wait_ready(&self, timeout: Duration) -> Result<bool> {
        self.readiness
            .wait(timeout)
            .map_err(|e| CaptureError::device("poll", e))
    }

    pub fn acquire_next(&self) -> Result<Option<Buffer>> {
        self.lock()?.acquire_next()
    }

    /// Only the capture loop gives buffers back.
    pub(crate) fn release(&self, buffer: Buffer) -> Result<()> {
        self.lock()?.release(buffer)
    }

    /// Run `op` on the source under the device lock.
    pub fn with_device<R>(&self, op: impl FnOnce(&mut S) -> R) -> Result<R> {
        let mut source = self.lock()?;
        Ok(op(&mut source))
    }
}

use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::frame::{Buffer, IoMethod};
use crate::error::Result;

/// How the capture loop learns that a frame may be ready.
#[derive(Debug, Clone, Copy)]
pub enum Readiness {
    /// Poll this descriptor for input.
    Fd(RawFd),
    /// Always try; the source itself reports "not ready".
    Immediate,
}

impl Readiness {
    /// Wait up to `timeout` for the source to become readable.
    ///
    /// `Ok(false)` on timeout or interruption.
    pub fn wait(&self, timeout: Duration) -> io::Result<bool> {
        match *self {
            Readiness::Immediate => Ok(true),
            Readiness::Fd(fd) => {
                // SAFETY: the source owning `fd` outlives every wait on it.
                let fd = unsafe { BorrowedFd::borrow_raw(fd) };
                let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
                let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
                match poll(&mut fds, PollTimeout::from(millis)) {
                    Ok(ready) => Ok(ready > 0),
                    Err(Errno::EINTR) => Ok(false),
                    Err(errno) => Err(errno.into()),
                }
            }
        }
    }
}

/// A video source as seen by the capture loop.
///
/// Implementations are not expected to be thread safe;
/// [`CaptureDevice`](super::CaptureDevice) serializes every call.
pub trait CaptureSource: Send {
    fn io_method(&self) -> IoMethod;

    fn readiness(&self) -> Readiness;

    /// Hand every buffer to the driver and start streaming.
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Retrieve one completed frame, `Ok(None)` if none is ready after all.
    fn acquire_next(&mut self) -> Result<Option<Buffer>>;

    /// Give a buffer back so the driver can fill it again.
    fn release(&mut self, buffer: Buffer) -> Result<()>;
}

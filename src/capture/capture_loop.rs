use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, error, info, instrument, warn};

use super::device::CaptureDevice;
use super::frame::Buffer;
use super::source::CaptureSource;
use crate::error::Result;
use crate::pipeline::FrameStore;

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// What one run of the capture loop did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    /// Frames acquired and published.
    pub captured: u64,
    /// Acquisitions that found nothing ready after a readiness wakeup.
    pub not_ready: u64,
    /// Buffers handed back to the driver after being displaced.
    pub released: u64,
}

/// Moves frames from a capture device into a frame store.
///
/// Exactly one loop runs per device. It is the only code that hands buffers
/// back to the driver, and only after the store has displaced them.
pub struct CaptureLoop<S> {
    device: Arc<CaptureDevice<S>>,
    store: Arc<FrameStore<Buffer>>,
    shutdown: Arc<AtomicBool>,
    poll_timeout: Duration,
}

impl<S: CaptureSource + 'static> CaptureLoop<S> {
    pub fn new(device: Arc<CaptureDevice<S>>, store: Arc<FrameStore<Buffer>>) -> Self {
        Self {
            device,
            store,
            shutdown: Arc::new(AtomicBool::new(false)),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    /// Upper bound on how long the loop goes without checking for shutdown.
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Flag that stops the loop at its next iteration once set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Capture until shutdown or a fatal error.
    ///
    /// The device is expected to be started already; stopping it is left to
    /// the owner, after this returns.
    #[instrument(skip(self), name = "capture_loop")]
    pub fn run(&self) -> Result<CaptureStats> {
        let mut stats = CaptureStats::default();
        info!(io_method = ?self.device.io_method(), "capture loop running");

        while !self.shutdown.load(Ordering::Acquire) {
            if !self.device.wait_ready(self.poll_timeout)? {
                continue;
            }

            let buffer = match self.device.acquire_next()? {
                Some(buffer) => buffer,
                None => {
                    stats.not_ready += 1;
                    counter!("capture_not_ready").increment(1);
                    continue;
                }
            };
            debug!(index = buffer.index(), len = buffer.len(), "frame acquired");
            stats.captured += 1;
            counter!("frames_captured").increment(1);

            if let Some(previous) = self.store.publish(buffer)? {
                self.device.release(previous)?;
                stats.released += 1;
            }
        }

        info!(
            captured = stats.captured,
            not_ready = stats.not_ready,
            released = stats.released,
            "capture loop stopped"
        );
        Ok(stats)
    }

    /// Run the loop on a dedicated thread, optionally pinned to `cpu_core`.
    ///
    /// The receiver yields the loop's outcome exactly once.
    pub fn spawn(self, cpu_core: Option<usize>) -> io::Result<flume::Receiver<Result<CaptureStats>>> {
        let (tx, rx) = flume::bounded(1);
        thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                if let Some(core) = cpu_core {
                    pin_to_core(core);
                }
                let outcome = self.run();
                if let Err(e) = &outcome {
                    error!("capture loop failed: {}", e);
                }
                // Nobody listening means the supervisor is gone already.
                let _ = tx.send(outcome);
            })?;
        Ok(rx)
    }
}

fn pin_to_core(core: usize) {
    let cores = core_affinity::get_core_ids().unwrap_or_default();
    match cores.into_iter().find(|id| id.id == core) {
        Some(id) if core_affinity::set_for_current(id) => {
            info!("capture thread pinned to core {}", core);
        }
        _ => warn!("failed to pin capture thread to core {}", core),
    }
}

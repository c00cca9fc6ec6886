use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camfeed::capture::{
    Buffer, BufferPool, CaptureDevice, CaptureLoop, CaptureSource, IoMethod, Readiness,
};
use camfeed::error::{CaptureError, Severity};
use camfeed::pipeline::FrameStore;

const POOL_SIZE: usize = 4;
const FRAME_LEN: usize = 32;

/// What the fake driver saw happen to its buffers.
#[derive(Debug, Default)]
struct Ledger {
    acquired: Vec<usize>,
    released: Vec<usize>,
}

/// A driver that fills queued buffers in order, pretending every other
/// wakeup was spurious.
struct ScriptedSource {
    pool: Arc<BufferPool>,
    queued: VecDeque<usize>,
    frames_left: usize,
    fail_after: Option<usize>,
    spurious: bool,
    next_value: u8,
    ledger: Arc<Mutex<Ledger>>,
    /// Set once the script runs out so the loop stops.
    exhausted: Arc<AtomicBool>,
}

impl ScriptedSource {
    fn new(frames: usize, exhausted: Arc<AtomicBool>) -> Self {
        Self {
            pool: Arc::new(BufferPool::heap(POOL_SIZE, FRAME_LEN).unwrap()),
            queued: VecDeque::new(),
            frames_left: frames,
            fail_after: None,
            spurious: false,
            next_value: 1,
            ledger: Arc::default(),
            exhausted,
        }
    }
}

impl CaptureSource for ScriptedSource {
    fn io_method(&self) -> IoMethod {
        IoMethod::Mmap
    }

    fn readiness(&self) -> Readiness {
        Readiness::Immediate
    }

    fn start(&mut self) -> camfeed::error::Result<()> {
        self.queued = (0..self.pool.len()).collect();
        Ok(())
    }

    fn stop(&mut self) -> camfeed::error::Result<()> {
        Ok(())
    }

    fn acquire_next(&mut self) -> camfeed::error::Result<Option<Buffer>> {
        if let Some(0) = self.fail_after {
            return Err(CaptureError::Device {
                op: "VIDIOC_DQBUF",
                source: io::Error::from_raw_os_error(libc::EIO),
            });
        }
        if self.frames_left == 0 {
            self.exhausted.store(true, Ordering::Release);
            return Ok(None);
        }
        self.spurious = !self.spurious;
        if self.spurious {
            return Ok(None);
        }

        let index = self.queued.pop_front().ok_or(CaptureError::PoolExhausted {
            pool_size: self.pool.len(),
        })?;
        let value = self.next_value;
        self.next_value = self.next_value.wrapping_add(1).max(1);
        unsafe { self.pool.slot_mut(index)[..FRAME_LEN].fill(value) };

        self.frames_left -= 1;
        if let Some(n) = self.fail_after.as_mut() {
            *n -= 1;
        }
        self.ledger.lock().unwrap().acquired.push(index);
        Ok(Some(unsafe { self.pool.claim(index, FRAME_LEN) }))
    }

    fn release(&mut self, buffer: Buffer) -> camfeed::error::Result<()> {
        assert!(Arc::ptr_eq(buffer.pool(), &self.pool));
        let index = buffer.into_index();
        assert!(!self.queued.contains(&index), "buffer {index} released twice");
        self.ledger.lock().unwrap().released.push(index);
        self.queued.push_back(index);
        Ok(())
    }
}

fn setup(
    source: ScriptedSource,
) -> (
    Arc<CaptureDevice<ScriptedSource>>,
    Arc<FrameStore<Buffer>>,
    CaptureLoop<ScriptedSource>,
) {
    let device = Arc::new(CaptureDevice::new(source));
    device.start().unwrap();
    let store = Arc::new(FrameStore::passthrough());
    let capture = CaptureLoop::new(Arc::clone(&device), Arc::clone(&store))
        .with_poll_timeout(Duration::from_millis(10));
    (device, store, capture)
}

#[test]
fn test_every_buffer_is_published_or_requeued() {
    let exhausted = Arc::new(AtomicBool::new(false));
    let source = ScriptedSource::new(25, Arc::clone(&exhausted));
    let ledger = Arc::clone(&source.ledger);
    let (device, store, capture) = setup(source);

    // Stop as soon as the script is done.
    let shutdown = capture.shutdown_handle();
    let watcher = std::thread::spawn(move || {
        while !exhausted.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
        }
        shutdown.store(true, Ordering::Release);
    });

    let stats = capture.run().unwrap();
    watcher.join().unwrap();

    assert_eq!(stats.captured, 25);
    assert_eq!(stats.released, 24);
    assert!(stats.not_ready >= 25);

    // The newest frame is the published one.
    let (generation, first_byte, len) = store
        .read_current(|frame| (frame.generation(), frame.chunks()[0][0], frame.len()))
        .unwrap();
    assert_eq!(generation, 25);
    assert_eq!(first_byte, 25);
    assert_eq!(len, FRAME_LEN);

    let ledger = ledger.lock().unwrap();
    assert_eq!(ledger.acquired.len(), 25);
    // Released in acquisition order, one frame behind.
    assert_eq!(ledger.released[..], ledger.acquired[..24]);

    let published = *ledger.acquired.last().unwrap();
    device
        .with_device(|source| {
            assert_eq!(source.queued.len(), POOL_SIZE - 1);
            assert!(!source.queued.contains(&published));
        })
        .unwrap();
}

#[test]
fn test_shutdown_before_start_captures_nothing() {
    let source = ScriptedSource::new(10, Arc::new(AtomicBool::new(false)));
    let (_device, store, capture) = setup(source);
    capture.shutdown_handle().store(true, Ordering::Release);

    let stats = capture.run().unwrap();
    assert_eq!(stats.captured, 0);
    assert_eq!(store.generation().unwrap(), 0);
}

#[test]
fn test_device_failure_is_runtime_fatal() {
    let mut source = ScriptedSource::new(100, Arc::new(AtomicBool::new(false)));
    source.fail_after = Some(3);
    let (_device, store, capture) = setup(source);

    let err = capture.run().unwrap_err();
    assert_eq!(err.severity(), Severity::Runtime);
    assert!(matches!(err, CaptureError::Device { op: "VIDIOC_DQBUF", .. }));
    // Frames before the failure were still published.
    assert_eq!(store.generation().unwrap(), 3);
}

#[test]
fn test_spawned_loop_reports_its_outcome() {
    let source = ScriptedSource::new(usize::MAX, Arc::new(AtomicBool::new(false)));
    let (_device, store, capture) = setup(source);
    let shutdown = capture.shutdown_handle();
    let done = capture.spawn(None).unwrap();

    // Wait for some frames, then stop the loop.
    store.read_after(4, |_| ()).unwrap();
    shutdown.store(true, Ordering::Release);

    let stats = done
        .recv_timeout(Duration::from_secs(5))
        .expect("capture loop did not stop")
        .unwrap();
    assert!(stats.captured >= 5);
    assert_eq!(stats.released, stats.captured - 1);
}

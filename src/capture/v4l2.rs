//! V4L2 capture with read, memory-mapped and user pointer I/O

use std::io;
use std::mem;
use std::os::raw::{c_ulong, c_void};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use memmap2::MmapOptions;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::memory::Memory;
use v4l::v4l2::{self, vidioc};
use v4l::v4l_sys::{v4l2_buffer, v4l2_jpegcompression, v4l2_requestbuffers};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format};

use super::frame::{Buffer, BufferPool, IoMethod};
use super::source::{CaptureSource, Readiness};
use crate::error::{CaptureError, Result};
use crate::CaptureConfig;

/// The read strategy double-buffers: one slot published, one being filled.
const READ_POOL_SIZE: usize = 2;

/// Minimum driver buffers for streaming I/O to make progress.
const MIN_STREAMING_BUFFERS: u32 = 2;

/// Retry a device request interrupted by a signal.
fn retry_eintr(mut request: impl FnMut() -> io::Result<()>) -> io::Result<()> {
    loop {
        match request() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn is_unsupported(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOTTY))
}

fn is_not_ready(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

fn buffer_desc(memory: Memory, index: u32) -> v4l2_buffer {
    // SAFETY: v4l2_buffer is plain old data; all-zero is a valid value.
    let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
    buf.type_ = Type::VideoCapture as u32;
    buf.memory = memory as u32;
    buf.index = index;
    buf
}

fn request_buffers(fd: RawFd, memory: Memory, count: u32) -> io::Result<u32> {
    // SAFETY: plain old data.
    let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
    req.count = count;
    req.type_ = Type::VideoCapture as u32;
    req.memory = memory as u32;
    retry_eintr(|| unsafe {
        v4l2::ioctl(
            fd,
            vidioc::VIDIOC_REQBUFS,
            &mut req as *mut v4l2_requestbuffers as *mut c_void,
        )
    })?;
    Ok(req.count)
}

/// Video4Linux capture source.
pub struct V4l2Source {
    device: Device,
    fd: RawFd,
    path: String,
    io_method: IoMethod,
    format: Format,
    pool: Arc<BufferPool>,
    /// Read strategy only: slots the application can read into.
    free: Vec<usize>,
    streaming: bool,
}

impl V4l2Source {
    /// Open `path`, negotiate the format and allocate the buffer pool for the
    /// configured I/O method.
    #[instrument(skip(config), fields(io_method = ?config.io_method))]
    pub fn configure(path: &str, config: &CaptureConfig) -> Result<Self> {
        info!("Initializing V4L2 capture: {}", path);

        let device = Device::with_path(path).map_err(|source| CaptureError::Open {
            path: path.to_string(),
            source,
        })?;
        let fd = device.handle().fd();

        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::device("VIDIOC_QUERYCAP", e))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::NotCapture {
                path: path.to_string(),
            });
        }
        let (required, capability) = match config.io_method {
            IoMethod::Read => (CapFlags::READ_WRITE, "read i/o"),
            IoMethod::Mmap | IoMethod::UserPtr => (CapFlags::STREAMING, "streaming i/o"),
        };
        if !caps.capabilities.contains(required) {
            return Err(CaptureError::Unsupported {
                path: path.to_string(),
                capability,
            });
        }

        let format = Self::negotiate_format(&device, config)?;
        apply_quality(fd, config.quality)?;
        apply_frame_rate(&device, config.fps);

        // Buggy driver paranoia.
        let stride = format.stride.max(format.width * 2);
        let image_size = format.size.max(stride * format.height) as usize;

        let pool = match config.io_method {
            IoMethod::Read => BufferPool::heap(READ_POOL_SIZE, image_size)
                .map_err(|e| CaptureError::device("allocate read buffers", e))?,
            IoMethod::Mmap => map_driver_buffers(fd, path, config.buffer_count)?,
            IoMethod::UserPtr => {
                match request_buffers(fd, Memory::UserPtr, config.buffer_count) {
                    Ok(_) => {}
                    Err(e) if is_unsupported(&e) => {
                        return Err(CaptureError::Unsupported {
                            path: path.to_string(),
                            capability: "user pointer i/o",
                        })
                    }
                    Err(e) => return Err(CaptureError::device("VIDIOC_REQBUFS", e)),
                }
                BufferPool::heap(config.buffer_count as usize, image_size)
                    .map_err(|e| CaptureError::device("allocate user buffers", e))?
            }
        };
        info!(buffers = pool.len(), image_size, "capture buffers ready");

        let free = match config.io_method {
            IoMethod::Read => (0..pool.len()).collect(),
            IoMethod::Mmap | IoMethod::UserPtr => Vec::new(),
        };

        Ok(Self {
            device,
            fd,
            path: path.to_string(),
            io_method: config.io_method,
            format,
            pool: Arc::new(pool),
            free,
            streaming: false,
        })
    }

    /// Set the requested format, then read back what the driver really chose.
    fn negotiate_format(device: &Device, config: &CaptureConfig) -> Result<Format> {
        let requested = config.format.fourcc();

        let mut fmt = device
            .format()
            .map_err(|e| CaptureError::device("VIDIOC_G_FMT", e))?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = requested;
        debug!("formatting {}x{} pf={}", fmt.width, fmt.height, fmt.fourcc);

        device
            .set_format(&fmt)
            .map_err(|e| CaptureError::device("VIDIOC_S_FMT", e))?;
        // The driver may adjust the size; trust only what it reports back.
        let fmt = device
            .format()
            .map_err(|e| CaptureError::device("VIDIOC_G_FMT", e))?;
        info!("got format {}x{} pf={}", fmt.width, fmt.height, fmt.fourcc);

        if fmt.fourcc != requested {
            return Err(CaptureError::FormatRejected {
                requested: requested.to_string(),
                negotiated: fmt.fourcc.to_string(),
            });
        }
        Ok(fmt)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn format(&self) -> &Format {
        &self.format
    }

    fn memory(&self) -> Memory {
        match self.io_method {
            IoMethod::UserPtr => Memory::UserPtr,
            IoMethod::Read | IoMethod::Mmap => Memory::Mmap,
        }
    }

    fn queue(&self, index: usize) -> Result<()> {
        let mut buf = buffer_desc(self.memory(), index as u32);
        if self.io_method == IoMethod::UserPtr {
            buf.m.userptr = self.pool.as_ptr(index) as c_ulong;
            buf.length = self.pool.capacity(index) as u32;
        }
        retry_eintr(|| unsafe {
            v4l2::ioctl(
                self.fd,
                vidioc::VIDIOC_QBUF,
                &mut buf as *mut v4l2_buffer as *mut c_void,
            )
        })
        .map_err(|e| CaptureError::device("VIDIOC_QBUF", e))
    }

    fn set_streaming(&self, on: bool) -> Result<()> {
        let (request, op) = if on {
            (vidioc::VIDIOC_STREAMON, "VIDIOC_STREAMON")
        } else {
            (vidioc::VIDIOC_STREAMOFF, "VIDIOC_STREAMOFF")
        };
        let mut typ = Type::VideoCapture as u32;
        retry_eintr(|| unsafe {
            v4l2::ioctl(self.fd, request, &mut typ as *mut u32 as *mut c_void)
        })
        .map_err(|e| CaptureError::device(op, e))
    }

    fn read_frame(&mut self) -> Result<Option<Buffer>> {
        let index = self.free.pop().ok_or(CaptureError::PoolExhausted {
            pool_size: self.pool.len(),
        })?;

        // SAFETY: `index` came off the free list, so no Buffer refers to it.
        let slot = unsafe { self.pool.slot_mut(index) };
        let read = unsafe { libc::read(self.fd, slot.as_mut_ptr() as *mut c_void, slot.len()) };
        if read < 0 {
            let e = io::Error::last_os_error();
            self.free.push(index);
            if is_not_ready(&e) || e.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(CaptureError::device("read", e));
        }

        // SAFETY: the read completed and the slot is off the free list.
        Ok(Some(unsafe { self.pool.claim(index, read as usize) }))
    }

    fn dequeue(&mut self) -> Result<Option<Buffer>> {
        let mut buf = buffer_desc(self.memory(), 0);
        let dequeued = retry_eintr(|| unsafe {
            v4l2::ioctl(
                self.fd,
                vidioc::VIDIOC_DQBUF,
                &mut buf as *mut v4l2_buffer as *mut c_void,
            )
        });
        match dequeued {
            Ok(()) => {}
            Err(e) if is_not_ready(&e) => return Ok(None),
            Err(e) => return Err(CaptureError::device("VIDIOC_DQBUF", e)),
        }

        let index = buf.index as usize;
        if index >= self.pool.len() {
            return Err(CaptureError::BufferMismatch {
                index,
                pool_size: self.pool.len(),
            });
        }
        if self.io_method == IoMethod::UserPtr {
            // SAFETY: the driver filled the userptr member for USERPTR memory.
            let userptr = unsafe { buf.m.userptr } as usize;
            if userptr != self.pool.as_ptr(index) as usize {
                return Err(CaptureError::BufferMismatch {
                    index,
                    pool_size: self.pool.len(),
                });
            }
        }

        // SAFETY: the driver just handed the slot back to us.
        Ok(Some(unsafe { self.pool.claim(index, buf.bytesused as usize) }))
    }
}

impl CaptureSource for V4l2Source {
    fn io_method(&self) -> IoMethod {
        self.io_method
    }

    fn readiness(&self) -> Readiness {
        Readiness::Fd(self.fd)
    }

    fn start(&mut self) -> Result<()> {
        if !self.io_method.is_streaming() || self.streaming {
            return Ok(());
        }
        for index in 0..self.pool.len() {
            self.queue(index)?;
        }
        self.set_streaming(true)?;
        self.streaming = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }
        self.set_streaming(false)?;
        self.streaming = false;
        Ok(())
    }

    fn acquire_next(&mut self) -> Result<Option<Buffer>> {
        match self.io_method {
            IoMethod::Read => self.read_frame(),
            IoMethod::Mmap | IoMethod::UserPtr => self.dequeue(),
        }
    }

    fn release(&mut self, buffer: Buffer) -> Result<()> {
        if !Arc::ptr_eq(buffer.pool(), &self.pool) {
            return Err(CaptureError::BufferMismatch {
                index: buffer.index(),
                pool_size: self.pool.len(),
            });
        }
        let index = buffer.into_index();
        match self.io_method {
            IoMethod::Read => {
                self.free.push(index);
                Ok(())
            }
            IoMethod::Mmap | IoMethod::UserPtr => self.queue(index),
        }
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("failed to stop streaming on {}: {}", self.path, e);
        }
    }
}

/// Request driver buffers and map each one shared read/write.
fn map_driver_buffers(fd: RawFd, path: &str, count: u32) -> Result<BufferPool> {
    let granted = match request_buffers(fd, Memory::Mmap, count) {
        Ok(granted) => granted,
        Err(e) if is_unsupported(&e) => {
            return Err(CaptureError::Unsupported {
                path: path.to_string(),
                capability: "memory mapping",
            })
        }
        Err(e) => return Err(CaptureError::device("VIDIOC_REQBUFS", e)),
    };
    if granted < MIN_STREAMING_BUFFERS {
        return Err(CaptureError::InsufficientBuffers {
            path: path.to_string(),
            granted,
        });
    }

    let mut maps = Vec::with_capacity(granted as usize);
    for index in 0..granted {
        let mut buf = buffer_desc(Memory::Mmap, index);
        retry_eintr(|| unsafe {
            v4l2::ioctl(
                fd,
                vidioc::VIDIOC_QUERYBUF,
                &mut buf as *mut v4l2_buffer as *mut c_void,
            )
        })
        .map_err(|e| CaptureError::device("VIDIOC_QUERYBUF", e))?;

        // SAFETY: the driver filled the offset member for MMAP memory.
        let offset = unsafe { buf.m.offset };
        let map = MmapOptions::new()
            .offset(u64::from(offset))
            .len(buf.length as usize)
            .map_raw(fd)
            .map_err(|e| CaptureError::device("mmap", e))?;
        maps.push(map);
    }
    Ok(BufferPool::mapped(maps))
}

/// Apply the JPEG quality if the driver has the knob at all.
fn apply_quality(fd: RawFd, quality: u8) -> Result<()> {
    // SAFETY: plain old data.
    let mut comp: v4l2_jpegcompression = unsafe { mem::zeroed() };
    let jpegcomp = |request, comp: &mut v4l2_jpegcompression| {
        retry_eintr(|| unsafe {
            v4l2::ioctl(
                fd,
                request,
                &mut *comp as *mut v4l2_jpegcompression as *mut c_void,
            )
        })
    };

    match jpegcomp(vidioc::VIDIOC_G_JPEGCOMP, &mut comp) {
        Ok(()) => {}
        Err(e) if is_unsupported(&e) => {
            info!("driver does not support VIDIOC_G_JPEGCOMP");
            return Ok(());
        }
        Err(e) => return Err(CaptureError::device("VIDIOC_G_JPEGCOMP", e)),
    }

    comp.quality = i32::from(quality);
    jpegcomp(vidioc::VIDIOC_S_JPEGCOMP, &mut comp)
        .map_err(|e| CaptureError::device("VIDIOC_S_JPEGCOMP", e))?;
    jpegcomp(vidioc::VIDIOC_G_JPEGCOMP, &mut comp)
        .map_err(|e| CaptureError::device("VIDIOC_G_JPEGCOMP", e))?;
    info!("jpegcomp quality came out at {}", comp.quality);
    Ok(())
}

/// Ask for `fps`; drivers without frame interval control just keep theirs.
fn apply_frame_rate(device: &Device, fps: u32) {
    match device.set_params(&Parameters::with_fps(fps)) {
        Ok(params) => info!(
            "fps came out {}/{}",
            params.interval.numerator, params.interval.denominator
        ),
        Err(e) => warn!("failed to set fps to {}: {}", fps, e),
    }
}

use std::alloc::{self, Layout};
use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;

use memmap2::MmapRaw;
use serde::{Deserialize, Serialize};
use v4l::FourCC;

/// Pixel formats we can capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Mjpeg,
    Jpeg,
    Yuyv,
}

impl PixelFormat {
    pub fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Jpeg => FourCC::new(b"JPEG"),
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
        }
    }

    /// Whether frames are JPEG images that may need their tables repaired.
    pub fn is_jpeg(self) -> bool {
        matches!(self, PixelFormat::Mjpeg | PixelFormat::Jpeg)
    }

    pub fn content_type(self) -> &'static str {
        if self.is_jpeg() {
            "image/jpeg"
        } else {
            "application/octet-stream"
        }
    }
}

/// How frame memory moves between the driver and us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMethod {
    /// Blocking `read(2)` into application buffers.
    Read,
    /// Driver buffers mapped into our address space.
    Mmap,
    /// Page-aligned application buffers the driver writes into.
    UserPtr,
}

impl IoMethod {
    /// Whether buffers are queued to and dequeued from the driver.
    pub fn is_streaming(self) -> bool {
        !matches!(self, IoMethod::Read)
    }
}

enum Backing {
    Heap(Layout),
    Mapped(#[allow(dead_code)] MmapRaw),
}

struct Region {
    ptr: NonNull<u8>,
    capacity: usize,
    backing: Backing,
}

/// Fixed set of capture buffers, allocated once and never resized.
///
/// At any instant each slot is owned either by the driver (contents
/// undefined, being written) or by exactly one [`Buffer`] handle.
pub struct BufferPool {
    regions: Vec<Region>,
}

// The raw regions are only dereferenced through `Buffer`, which is unique per
// slot, or through the unsafe driver-side accessors.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Allocate `count` zeroed, page-aligned buffers of at least `capacity`
    /// bytes each. Capacity is rounded up to whole pages.
    pub fn heap(count: usize, capacity: usize) -> io::Result<Self> {
        let page = page_size::get();
        let capacity = capacity.max(1).div_ceil(page) * page;
        let layout = Layout::from_size_align(capacity, page)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        // Built in place so a failed allocation frees the earlier ones.
        let mut pool = Self {
            regions: Vec::with_capacity(count),
        };
        for _ in 0..count {
            // SAFETY: layout has non-zero size.
            let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).ok_or_else(|| {
                io::Error::new(io::ErrorKind::OutOfMemory, "capture buffer allocation failed")
            })?;
            pool.regions.push(Region {
                ptr,
                capacity,
                backing: Backing::Heap(layout),
            });
        }
        Ok(pool)
    }

    /// Pool over driver buffers mapped into memory.
    pub fn mapped(maps: Vec<MmapRaw>) -> Self {
        let regions = maps
            .into_iter()
            .map(|map| Region {
                ptr: NonNull::new(map.as_mut_ptr()).unwrap_or(NonNull::dangling()),
                capacity: map.len(),
                backing: Backing::Mapped(map),
            })
            .collect();
        Self { regions }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn capacity(&self, index: usize) -> usize {
        self.regions[index].capacity
    }

    /// Start of slot `index`, as handed to the driver for user pointer I/O.
    pub fn as_ptr(&self, index: usize) -> *mut u8 {
        self.regions[index].ptr.as_ptr()
    }

    /// Writable view of a whole slot, for sources that fill buffers
    /// themselves.
    ///
    /// # Safety
    ///
    /// No [`Buffer`] for `index` may be alive and nothing else may access the
    /// slot while the returned slice is in use.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot_mut(&self, index: usize) -> &mut [u8] {
        let region = &self.regions[index];
        slice::from_raw_parts_mut(region.ptr.as_ptr(), region.capacity)
    }

    /// Take application ownership of slot `index`, holding `bytes_used` valid
    /// bytes.
    ///
    /// # Safety
    ///
    /// The driver must have finished writing the slot and no other `Buffer`
    /// for `index` may be alive.
    pub unsafe fn claim(self: &Arc<Self>, index: usize, bytes_used: usize) -> Buffer {
        let len = bytes_used.min(self.capacity(index));
        Buffer {
            pool: Arc::clone(self),
            index,
            len,
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        for region in &self.regions {
            if let Backing::Heap(layout) = region.backing {
                // SAFETY: allocated in `heap` with this exact layout.
                unsafe { alloc::dealloc(region.ptr.as_ptr(), layout) };
            }
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffers", &self.regions.len())
            .finish()
    }
}

/// Application ownership of one captured frame in a [`BufferPool`].
///
/// Not `Clone`: whoever holds the `Buffer` is the only one allowed to read
/// the slot, and giving it back to the driver consumes it.
pub struct Buffer {
    pool: Arc<BufferPool>,
    index: usize,
    len: usize,
}

impl Buffer {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Give up application ownership, leaving only the slot index.
    pub fn into_index(self) -> usize {
        self.index
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: this handle is the unique owner of the slot and `len` never
        // exceeds its capacity.
        unsafe { slice::from_raw_parts(self.pool.as_ptr(self.index), self.len) }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_pool_is_page_aligned() {
        let pool = BufferPool::heap(3, 1000).unwrap();
        let page = page_size::get();
        assert_eq!(pool.len(), 3);
        for index in 0..pool.len() {
            assert_eq!(pool.capacity(index) % page, 0);
            assert!(pool.capacity(index) >= 1000);
            assert_eq!(pool.as_ptr(index) as usize % page, 0);
        }
    }

    #[test]
    fn test_claim_exposes_written_bytes() {
        let pool = Arc::new(BufferPool::heap(2, 64).unwrap());
        unsafe { pool.slot_mut(1)[..4].copy_from_slice(b"abcd") };
        let buffer = unsafe { pool.claim(1, 4) };
        assert_eq!(buffer.index(), 1);
        assert_eq!(buffer.as_ref(), b"abcd");
        assert_eq!(buffer.into_index(), 1);
    }

    #[test]
    fn test_claim_clamps_to_capacity() {
        let pool = Arc::new(BufferPool::heap(1, 16).unwrap());
        let capacity = pool.capacity(0);
        let buffer = unsafe { pool.claim(0, capacity + 100) };
        assert_eq!(buffer.len(), capacity);
    }

    #[test]
    fn test_pixel_format_properties() {
        assert!(PixelFormat::Mjpeg.is_jpeg());
        assert!(!PixelFormat::Yuyv.is_jpeg());
        assert_eq!(PixelFormat::Yuyv.fourcc(), FourCC::new(b"YUYV"));
        assert!(IoMethod::Mmap.is_streaming());
        assert!(!IoMethod::Read.is_streaming());
    }
}

//! Latest-frame store shared by the capture loop and every consumer.

use std::io::{self, Write};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use super::repair::{self, HuffmanScan, STANDARD_DHT};
use super::signal::GenerationSignal;
use crate::capture::Buffer;
use crate::error::FrameError;

/// Read-only view into either frame memory or the static repair blob.
pub type Chunk<'a> = &'a [u8];

/// The currently published frame as handed to a visitor.
///
/// Concatenating [`chunks`](Frame::chunks) yields the logical frame bytes,
/// with the Huffman tables spliced in when the capture lacked them. The
/// chunks borrow capture memory that is recycled once the visitor returns.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    parts: [Chunk<'a>; 3],
    count: usize,
    generation: u64,
}

impl<'a> Frame<'a> {
    fn new(data: &'a [u8], insert_at: Option<usize>, generation: u64) -> Self {
        let (parts, count) = match insert_at {
            Some(offset) => {
                let (head, tail) = data.split_at(offset);
                ([head, &STANDARD_DHT[..], tail], 3)
            }
            None => ([data, &[][..], &[][..]], 1),
        };
        Self {
            parts,
            count,
            generation,
        }
    }

    fn cold() -> Self {
        Self {
            parts: [&[][..]; 3],
            count: 0,
            generation: 0,
        }
    }

    pub fn chunks(&self) -> &[Chunk<'a>] {
        &self.parts[..self.count]
    }

    /// Generation this frame was published under; 0 before the first publish.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.chunks().iter().map(|chunk| chunk.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_repaired(&self) -> bool {
        self.count == 3
    }

    /// Copy the logical frame out, for transports that outlive the visitor.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len());
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for chunk in self.chunks() {
            out.write_all(chunk)?;
        }
        Ok(())
    }
}

/// What the publication lock guards.
struct Slot<B> {
    buffer: Option<B>,
    insert_at: Option<usize>,
    generation: u64,
}

/// One writer, many readers, one current frame.
///
/// The published buffer, its repair offset and generation live behind a
/// shared/exclusive lock; the generation is also announced through a separate
/// [`GenerationSignal`] so blocked readers can be woken without touching the
/// frame lock.
pub struct FrameStore<B = Buffer> {
    slot: RwLock<Slot<B>>,
    signal: GenerationSignal,
    repair: bool,
}

impl<B: AsRef<[u8]>> Default for FrameStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: AsRef<[u8]>> FrameStore<B> {
    /// Store that splices standard Huffman tables into frames missing them.
    pub fn new() -> Self {
        Self::with_repair(true)
    }

    /// Store for raw formats: frames are handed out untouched.
    pub fn passthrough() -> Self {
        Self::with_repair(false)
    }

    fn with_repair(repair: bool) -> Self {
        Self {
            slot: RwLock::new(Slot {
                buffer: None,
                insert_at: None,
                generation: 0,
            }),
            signal: GenerationSignal::new(),
            repair,
        }
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Slot<B>>, FrameError> {
        self.slot
            .write()
            .map_err(|_| FrameError::Poisoned { lock: "publication" })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Slot<B>>, FrameError> {
        self.slot
            .read()
            .map_err(|_| FrameError::Poisoned { lock: "publication" })
    }

    fn insert_offset(&self, data: &[u8]) -> Option<usize> {
        if !self.repair {
            return None;
        }
        let scan = repair::scan(data);
        match scan {
            HuffmanScan::MissingAt(offset) => {
                metrics::counter!("frames_repaired").increment(1);
                trace!(offset, "frame is missing its huffman tables");
            }
            HuffmanScan::NoScanMarker => {
                metrics::counter!("frames_without_scan_marker").increment(1);
                debug!(len = data.len(), "no start-of-scan marker in frame");
            }
            HuffmanScan::Present => {}
        }
        scan.insert_offset()
    }

    /// Make `buffer` the current frame and hand back the one it replaces.
    ///
    /// Returns `None` on the very first publish.
    pub fn publish(&self, buffer: B) -> Result<Option<B>, FrameError> {
        // Scanned before taking the lock: readers only wait for the swap.
        let insert_at = self.insert_offset(buffer.as_ref());

        let (previous, generation) = {
            let mut slot = self.write()?;
            slot.generation += 1;
            slot.insert_at = insert_at;
            (slot.buffer.replace(buffer), slot.generation)
        };

        self.signal.announce(generation)?;
        metrics::counter!("frames_published").increment(1);
        Ok(previous)
    }

    /// Visit the current frame.
    ///
    /// Runs concurrently with other readers but never with a publish. Before
    /// the first publish the visitor sees an empty frame. The visitor must
    /// not call back into the store.
    pub fn read_current<R>(&self, visitor: impl FnOnce(&Frame<'_>) -> R) -> Result<R, FrameError> {
        let slot = self.read()?;
        let frame = match &slot.buffer {
            Some(buffer) => Frame::new(buffer.as_ref(), slot.insert_at, slot.generation),
            None => Frame::cold(),
        };
        Ok(visitor(&frame))
    }

    /// Wait for a publish after this call, then visit the current frame.
    pub fn read_next<R>(&self, visitor: impl FnOnce(&Frame<'_>) -> R) -> Result<R, FrameError> {
        // The slot is updated before the signal is announced, so its
        // generation is never behind anything a previous visit saw.
        let seen = self.read()?.generation;
        self.read_after(seen, visitor)
    }

    /// Wait until a generation newer than `seen` is published, then visit the
    /// current frame. Feeding back the generation of the previous visit gives
    /// a caller strictly increasing generations.
    pub fn read_after<R>(
        &self,
        seen: u64,
        visitor: impl FnOnce(&Frame<'_>) -> R,
    ) -> Result<R, FrameError> {
        self.signal.wait_past(seen)?;
        self.read_current(visitor)
    }

    /// [`read_after`](Self::read_after) that abandons the wait after
    /// `timeout`, returning `None` without visiting.
    pub fn read_after_timeout<R>(
        &self,
        seen: u64,
        timeout: Duration,
        visitor: impl FnOnce(&Frame<'_>) -> R,
    ) -> Result<Option<R>, FrameError> {
        match self.signal.wait_past_timeout(seen, timeout)? {
            Some(_) => self.read_current(visitor).map(Some),
            None => Ok(None),
        }
    }

    /// Last announced generation, without blocking on the frame lock.
    pub fn generation(&self) -> Result<u64, FrameError> {
        self.signal.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg_without_tables(len: usize, sos_at: usize) -> Vec<u8> {
        let mut data: Vec<u8> = (0..len).map(|i| (i % 0x7f) as u8).collect();
        data[sos_at] = 0xff;
        data[sos_at + 1] = 0xda;
        data
    }

    #[test]
    fn test_cold_start_is_empty() {
        let store: FrameStore<Vec<u8>> = FrameStore::new();
        let (len, chunks, generation) = store
            .read_current(|frame| (frame.len(), frame.chunks().len(), frame.generation()))
            .unwrap();
        assert_eq!(len, 0);
        assert_eq!(chunks, 0);
        assert_eq!(generation, 0);
    }

    #[test]
    fn test_first_frame_single_chunk() {
        let store = FrameStore::new();
        let previous = store.publish(vec![7u8; 100]).unwrap();
        assert!(previous.is_none());

        store
            .read_current(|frame| {
                assert_eq!(frame.chunks().len(), 1);
                assert_eq!(frame.chunks()[0], &[7u8; 100][..]);
                assert_eq!(frame.generation(), 1);
                assert!(!frame.is_repaired());
            })
            .unwrap();
    }

    #[test]
    fn test_repaired_frame_three_chunks() {
        let store = FrameStore::new();
        let data = jpeg_without_tables(50, 20);
        store.publish(data.clone()).unwrap();

        store
            .read_current(|frame| {
                let lengths: Vec<usize> = frame.chunks().iter().map(|c| c.len()).collect();
                assert_eq!(lengths, vec![20, STANDARD_DHT.len(), 30]);
                assert_eq!(frame.chunks()[0], &data[..20]);
                assert_eq!(frame.chunks()[1], &STANDARD_DHT[..]);
                assert_eq!(frame.chunks()[2], &data[20..]);
                assert_eq!(frame.len(), 50 + STANDARD_DHT.len());
            })
            .unwrap();
    }

    #[test]
    fn test_frame_with_tables_is_untouched() {
        let store = FrameStore::new();
        let mut data = vec![0u8; 64];
        data[4] = 0xff;
        data[5] = 0xc4;
        data[30] = 0xff;
        data[31] = 0xda;
        store.publish(data.clone()).unwrap();

        let bytes = store.read_current(|frame| frame.to_bytes()).unwrap();
        assert_eq!(&bytes[..], &data[..]);
    }

    #[test]
    fn test_passthrough_never_repairs() {
        let store = FrameStore::passthrough();
        store.publish(jpeg_without_tables(50, 20)).unwrap();
        let chunks = store.read_current(|frame| frame.chunks().len()).unwrap();
        assert_eq!(chunks, 1);
    }

    #[test]
    fn test_publish_returns_previous_buffer() {
        let store = FrameStore::new();
        assert_eq!(store.publish(vec![1u8]).unwrap(), None);
        assert_eq!(store.publish(vec![2u8]).unwrap(), Some(vec![1u8]));
        assert_eq!(store.publish(vec![3u8]).unwrap(), Some(vec![2u8]));
        assert_eq!(store.generation().unwrap(), 3);
    }

    #[test]
    fn test_write_to_matches_to_bytes() {
        let store = FrameStore::new();
        store.publish(jpeg_without_tables(40, 10)).unwrap();
        let (bytes, written) = store
            .read_current(|frame| {
                let mut written = Vec::new();
                frame.write_to(&mut written).unwrap();
                (frame.to_bytes(), written)
            })
            .unwrap();
        assert_eq!(&bytes[..], &written[..]);
    }

    #[test]
    fn test_read_after_timeout_without_publish() {
        let store: FrameStore<Vec<u8>> = FrameStore::new();
        let visited = store
            .read_after_timeout(0, Duration::from_millis(10), |_| ())
            .unwrap();
        assert!(visited.is_none());
    }

    #[test]
    fn test_read_after_sees_newer_generation() {
        let store = FrameStore::new();
        store.publish(vec![1u8; 4]).unwrap();
        store.publish(vec![2u8; 4]).unwrap();
        // Already past generation 1, so no wait.
        let generation = store.read_after(1, |frame| frame.generation()).unwrap();
        assert_eq!(generation, 2);
    }
}

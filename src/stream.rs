//! Frame delivery to consumers: one still, or a live multipart feed.

use std::io;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use metrics::counter;
use tracing::debug;

use crate::error::FrameError;
use crate::pipeline::{Frame, FrameStore};

pub const BOUNDARY: &str = "camfeedboundary";

pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=camfeedboundary";

/// A consumer of frames.
///
/// Delivery happens in two steps so that nothing slow runs while the frame
/// is borrowed from the store: [`capture`](FrameSink::capture) runs under the
/// frame lock and must only copy or encode, [`send`](FrameSink::send) runs
/// after the lock is released and may block on the transport.
pub trait FrameSink {
    type Item;

    fn capture(&mut self, frame: &Frame<'_>) -> Self::Item;

    fn send(&mut self, item: Self::Item) -> io::Result<()>;

    /// Whether the other end has gone away; checked between waits.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Why a delivery ended.
#[derive(Debug)]
pub enum Outcome {
    /// Every requested frame went out.
    Completed,
    /// Nothing has been published yet.
    Cold,
    /// The sink closed while waiting for a frame.
    SinkClosed,
    /// The sink failed to take a frame.
    SendFailed(io::Error),
}

#[derive(Debug)]
pub struct Delivery {
    pub frames: u64,
    pub last_generation: u64,
    pub outcome: Outcome,
}

/// Send whatever frame is current right now.
pub fn deliver_still<B, S>(store: &FrameStore<B>, sink: &mut S) -> Result<Delivery, FrameError>
where
    B: AsRef<[u8]>,
    S: FrameSink,
{
    let (generation, item) = store.read_current(|frame| {
        if frame.generation() == 0 {
            (0, None)
        } else {
            (frame.generation(), Some(sink.capture(frame)))
        }
    })?;

    let Some(item) = item else {
        return Ok(Delivery {
            frames: 0,
            last_generation: 0,
            outcome: Outcome::Cold,
        });
    };
    let outcome = match sink.send(item) {
        Ok(()) => {
            counter!("frames_delivered").increment(1);
            Outcome::Completed
        }
        Err(e) => Outcome::SendFailed(e),
    };
    Ok(Delivery {
        frames: u64::from(matches!(outcome, Outcome::Completed)),
        last_generation: generation,
        outcome,
    })
}

/// Send each newly published frame until `limit` frames went out, the sink
/// fails, or it closes.
///
/// Starts with the first frame published after the call. Generations handed
/// to the sink are strictly increasing; frames published while the sink is
/// busy are skipped. `wait_timeout` bounds how long a closed sink goes
/// unnoticed.
pub fn deliver_stream<B, S>(
    store: &FrameStore<B>,
    sink: &mut S,
    limit: Option<u64>,
    wait_timeout: Duration,
) -> Result<Delivery, FrameError>
where
    B: AsRef<[u8]>,
    S: FrameSink,
{
    let mut seen = store.generation()?;
    let mut frames = 0;

    let outcome = loop {
        if limit.is_some_and(|limit| frames >= limit) {
            break Outcome::Completed;
        }
        if sink.is_closed() {
            break Outcome::SinkClosed;
        }

        let visited = store.read_after_timeout(seen, wait_timeout, |frame| {
            (frame.generation(), sink.capture(frame))
        })?;
        let Some((generation, item)) = visited else {
            continue;
        };
        seen = generation;

        if let Err(e) = sink.send(item) {
            break Outcome::SendFailed(e);
        }
        frames += 1;
        counter!("frames_delivered").increment(1);
    };

    debug!(frames, last_generation = seen, ?outcome, "stream delivery ended");
    Ok(Delivery {
        frames,
        last_generation: seen,
        outcome,
    })
}

/// Encode `frame` as one part of a `multipart/x-mixed-replace` body.
pub fn encode_part(frame: &Frame<'_>, content_type: &str) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        content_type,
        frame.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + frame.len() + 2);
    part.put_slice(header.as_bytes());
    for chunk in frame.chunks() {
        part.put_slice(chunk);
    }
    part.put_slice(b"\r\n");
    part.freeze()
}

/// One piece of a streamed response body.
pub type BodyChunk = io::Result<Bytes>;

/// Feeds multipart parts into a bounded channel drained by the transport.
///
/// A full channel blocks `send`, which is all the flow control a slow
/// consumer gets.
pub struct MultipartSink {
    tx: flume::Sender<BodyChunk>,
    content_type: &'static str,
}

impl MultipartSink {
    pub fn new(tx: flume::Sender<BodyChunk>, content_type: &'static str) -> Self {
        Self { tx, content_type }
    }
}

impl FrameSink for MultipartSink {
    type Item = Bytes;

    fn capture(&mut self, frame: &Frame<'_>) -> Bytes {
        encode_part(frame, self.content_type)
    }

    fn send(&mut self, part: Bytes) -> io::Result<()> {
        self.tx
            .send(Ok(part))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "consumer disconnected"))
    }

    fn is_closed(&self) -> bool {
        self.tx.is_disconnected()
    }
}

/// Keeps copies of delivered frames with their generations.
#[derive(Debug, Default)]
pub struct CollectSink {
    pub frames: Vec<(u64, Bytes)>,
}

impl FrameSink for CollectSink {
    type Item = (u64, Bytes);

    fn capture(&mut self, frame: &Frame<'_>) -> (u64, Bytes) {
        (frame.generation(), frame.to_bytes())
    }

    fn send(&mut self, item: (u64, Bytes)) -> io::Result<()> {
        self.frames.push(item);
        Ok(())
    }
}

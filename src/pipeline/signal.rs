//! Wait/notify on the frame generation counter.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::FrameError;

/// Counter of published generations, paired with a condition variable.
///
/// Kept apart from the frame data lock: waking every waiter only takes this
/// small mutex, never the lock the next publish needs.
#[derive(Debug, Default)]
pub struct GenerationSignal {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl GenerationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, u64>, FrameError> {
        self.generation
            .lock()
            .map_err(|_| FrameError::Poisoned { lock: "generation" })
    }

    /// Last announced generation.
    pub fn current(&self) -> Result<u64, FrameError> {
        Ok(*self.lock()?)
    }

    /// Announce `generation` and wake every waiter.
    ///
    /// Generations only move forward; a stale announcement is ignored.
    pub fn announce(&self, generation: u64) -> Result<(), FrameError> {
        let mut current = self.lock()?;
        if generation > *current {
            *current = generation;
        }
        drop(current);
        self.changed.notify_all();
        Ok(())
    }

    /// Block until the announced generation is strictly greater than `seen`.
    pub fn wait_past(&self, seen: u64) -> Result<u64, FrameError> {
        let guard = self.lock()?;
        let guard = self
            .changed
            .wait_while(guard, |generation| *generation <= seen)
            .map_err(|_| FrameError::Poisoned { lock: "generation" })?;
        Ok(*guard)
    }

    /// Like [`wait_past`](Self::wait_past) but gives up after `timeout`,
    /// returning `None`.
    pub fn wait_past_timeout(
        &self,
        seen: u64,
        timeout: Duration,
    ) -> Result<Option<u64>, FrameError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock()?;
        while *guard <= seen {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let (next, _) = self
                .changed
                .wait_timeout(guard, remaining)
                .map_err(|_| FrameError::Poisoned { lock: "generation" })?;
            guard = next;
        }
        Ok(Some(*guard))
    }
}

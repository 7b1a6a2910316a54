//! Memory managers and reservations.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common_error::{RivuletError, RivuletResult};

/// Tracks bytes held by operators against an optional limit.
pub trait MemoryManager: Send + Sync + fmt::Debug {
    /// Reserve `bytes`; fails with `ResourceExhausted` past the limit.
    fn reserve(&self, bytes: usize) -> RivuletResult<()>;

    /// Return previously reserved bytes.
    fn release(&self, bytes: usize);

    /// Bytes currently reserved.
    fn used(&self) -> usize;

    /// Limit in bytes, `None` when unlimited.
    fn limit(&self) -> Option<usize>;

    /// Highest value `used` has reached.
    fn peak(&self) -> usize {
        self.used()
    }

    fn available(&self) -> usize {
        self.limit()
            .map_or(usize::MAX, |limit| limit.saturating_sub(self.used()))
    }
}

/// Manager that accepts every reservation and tracks nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMemoryManager;

impl MemoryManager for NoopMemoryManager {
    fn reserve(&self, _bytes: usize) -> RivuletResult<()> {
        Ok(())
    }

    fn release(&self, _bytes: usize) {}

    fn used(&self) -> usize {
        0
    }

    fn limit(&self) -> Option<usize> {
        None
    }
}

/// Atomic byte counter with an optional hard limit.
#[derive(Debug, Default)]
pub struct TrackingMemoryManager {
    used: AtomicUsize,
    peak: AtomicUsize,
    limit: Option<usize>,
}

impl TrackingMemoryManager {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            limit,
        }
    }

    pub fn with_limit(limit: usize) -> Self {
        Self::new(Some(limit))
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }
}

impl MemoryManager for TrackingMemoryManager {
    fn reserve(&self, bytes: usize) -> RivuletResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        let limit = self.limit;
        let previous = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::Relaxed, |current| {
                let next = current.saturating_add(bytes);
                match limit {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            })
            .map_err(|current| {
                RivuletError::resource_exhausted(format!(
                    "memory limit exceeded: {current} + {bytes} > {} bytes",
                    limit.unwrap_or(usize::MAX)
                ))
            })?;
        self.peak.fetch_max(previous + bytes, Ordering::Relaxed);
        Ok(())
    }

    fn release(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        // saturating so a double release cannot wrap
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    fn limit(&self) -> Option<usize> {
        self.limit
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Bytes held by one operator; released when dropped.
pub struct MemoryReservation {
    manager: Arc<dyn MemoryManager>,
    consumer: String,
    size: usize,
}

impl fmt::Debug for MemoryReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryReservation")
            .field("consumer", &self.consumer)
            .field("size", &self.size)
            .finish()
    }
}

impl MemoryReservation {
    /// Empty reservation tagged with the consumer's name.
    pub fn new(manager: Arc<dyn MemoryManager>, consumer: impl Into<String>) -> Self {
        Self {
            manager,
            consumer: consumer.into(),
            size: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn try_grow(&mut self, additional: usize) -> RivuletResult<()> {
        self.manager.reserve(additional).map_err(|e| match e {
            RivuletError::ResourceExhausted(msg) => {
                RivuletError::resource_exhausted(format!("{}: {msg}", self.consumer))
            }
            other => other,
        })?;
        self.size += additional;
        Ok(())
    }

    pub fn shrink(&mut self, amount: usize) {
        let amount = amount.min(self.size);
        self.manager.release(amount);
        self.size -= amount;
    }

    /// Grow or shrink to exactly `size` bytes.
    pub fn try_resize(&mut self, size: usize) -> RivuletResult<()> {
        if size > self.size {
            self.try_grow(size - self.size)
        } else {
            self.shrink(self.size - size);
            Ok(())
        }
    }

    pub fn free(&mut self) {
        self.shrink(self.size);
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.free();
    }
}

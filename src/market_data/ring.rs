// =============================================================================
// Fixed-capacity ring buffer
// =============================================================================
//
// The backbone of every snapshot in the engine. Write slot arithmetic:
//
//   write index          = (start + count) % size
//   k-th-from-end start  = (start + count - k + size) % size
//
// The data array is guarded by a read-write lock; `start` and `count` are
// atomic so single-cell reads (`len`, emptiness checks) skip the lock. The
// counters are only written while holding the write lock, which keeps them
// consistent with the array for readers that do take the lock.
// =============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::error::{EngineError, Result};

/// A fixed-capacity circular buffer. At capacity, `add` overwrites the
/// oldest entry and advances `start`.
#[derive(Debug)]
pub struct Ring<T> {
    data: RwLock<Vec<Option<T>>>,
    start: AtomicUsize,
    count: AtomicUsize,
    size: usize,
}

impl<T: Clone> Ring<T> {
    /// Create a ring holding at most `size` entries.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(EngineError::InvalidArgument(
                "ring size must be positive".to_string(),
            ));
        }
        Ok(Self {
            data: RwLock::new(vec![None; size]),
            start: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            size,
        })
    }

    /// Number of entries currently stored. Lock-free.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Whether the ring holds no entries. Lock-free.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the oldest entry. Lock-free; exposed for tests and
    /// diagnostics.
    pub fn start(&self) -> usize {
        self.start.load(Ordering::Acquire)
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Append `item`, overwriting the oldest entry at capacity.
    pub fn add(&self, item: T) {
        let mut data = self.data.write();
        let start = self.start.load(Ordering::Acquire);
        let count = self.count.load(Ordering::Acquire);

        let slot = (start + count) % self.size;
        data[slot] = Some(item);

        if count == self.size {
            self.start.store((start + 1) % self.size, Ordering::Release);
        } else {
            self.count.store(count + 1, Ordering::Release);
        }
    }

    /// The most recent entry.
    pub fn last(&self) -> Option<T> {
        self.last_n(1).pop()
    }

    /// Up to `min(k, len)` most recent entries in chronological order,
    /// preserved across wrap.
    pub fn last_n(&self, k: usize) -> Vec<T> {
        let data = self.data.read();
        let start = self.start.load(Ordering::Acquire);
        let count = self.count.load(Ordering::Acquire);

        let n = k.min(count);
        let begin = (start + count - n) % self.size;

        (0..n)
            .filter_map(|i| data[(begin + i) % self.size].clone())
            .collect()
    }

    /// Entries matching `predicate`, in insertion order.
    pub fn filter<F>(&self, predicate: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        let data = self.data.read();
        let start = self.start.load(Ordering::Acquire);
        let count = self.count.load(Ordering::Acquire);

        (0..count)
            .filter_map(|i| data[(start + i) % self.size].as_ref())
            .filter(|entry| predicate(entry))
            .cloned()
            .collect()
    }

    /// Visit every entry in insertion order.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&T),
    {
        let data = self.data.read();
        let start = self.start.load(Ordering::Acquire);
        let count = self.count.load(Ordering::Acquire);

        for i in 0..count {
            if let Some(entry) = data[(start + i) % self.size].as_ref() {
                visit(entry);
            }
        }
    }
}

//! Bounded, sequence-numbered line capture for worker output streams.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
struct Inner {
    lines: VecDeque<String>,
    /// Sequence number of the next line to be pushed.
    next_seq: u64,
    capacity: usize,
}

/// A ring of the most recent lines from one output stream.
///
/// Cloning shares the buffer. Each pushed line gets a monotonically
/// increasing sequence number so pollers can ask for only what is new via
/// [`lines_since`](Self::lines_since).
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl OutputBuffer {
    /// Creates a buffer that retains at most `capacity` lines (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                lines: VecDeque::with_capacity(capacity.min(1024)),
                next_seq: 0,
                capacity,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the ring inconsistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends a line, evicting the oldest when full.
    pub fn push(&self, line: impl Into<String>) {
        let mut inner = self.lock();
        if inner.lines.len() == inner.capacity {
            inner.lines.pop_front();
        }
        inner.lines.push_back(line.into());
        inner.next_seq += 1;
    }

    /// Total number of lines ever pushed.
    pub fn total(&self) -> u64 {
        self.lock().next_seq
    }

    /// Number of lines currently retained.
    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().lines.is_empty()
    }

    /// All retained lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lock().lines.iter().cloned().collect()
    }

    /// The last `n` retained lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let inner = self.lock();
        let skip = inner.lines.len().saturating_sub(n);
        inner.lines.iter().skip(skip).cloned().collect()
    }

    /// Retained lines with sequence number `>= seq`, plus the cursor to pass
    /// next time.
    ///
    /// Lines that were evicted before being read are skipped silently.
    pub fn lines_since(&self, seq: u64) -> (Vec<String>, u64) {
        let inner = self.lock();
        let oldest = inner.next_seq - inner.lines.len() as u64;
        let start = seq.max(oldest);
        let skip = usize::try_from(start - oldest).unwrap_or(usize::MAX);
        let lines = inner.lines.iter().skip(skip).cloned().collect();
        (lines, inner.next_seq)
    }

    /// Returns `true` if any retained line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lock().lines.iter().any(|l| l.contains(needle))
    }
}

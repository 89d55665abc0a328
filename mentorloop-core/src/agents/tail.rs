//! Bounded tail of process output
//!
//! Uses crossbeam_queue::ArrayQueue; when full, the oldest line is evicted
//! to make room for the new one.

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Last lines written by a child process
#[derive(Clone)]
pub struct OutputTail {
    lines: Arc<ArrayQueue<String>>,
    evicted: Arc<AtomicU64>,
}

impl OutputTail {
    /// Keep at most `capacity` lines (at least one)
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(ArrayQueue::new(capacity.max(1))),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append a line, evicting the oldest when full
    pub fn push(&self, line: String) {
        if let Some(_evicted) = self.lines.force_push(line) {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines dropped to respect the capacity
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Drain the buffered lines into one string, oldest first
    pub fn take(&self) -> String {
        let mut lines = Vec::with_capacity(self.lines.len() + 1);
        let evicted = self.evicted();
        if evicted > 0 {
            lines.push(format!("... {} earlier lines omitted", evicted));
        }
        while let Some(line) = self.lines.pop() {
            lines.push(line);
        }
        lines.join("\n")
    }
}

impl Default for OutputTail {
    fn default() -> Self {
        Self::new(20)
    }
}

use std::sync::atomic::{AtomicI64, Ordering};

/// Process-wide scan counters, safe to bump from any task.
#[derive(Debug, Default)]
pub struct Stats {
    pub received: AtomicI64,
    pub processed: AtomicI64,
    pub retried: AtomicI64,
}

/// A point-in-time copy of all counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub received: i64,
    pub processed: i64,
    pub retried: i64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

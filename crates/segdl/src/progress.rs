use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fetch phases of a segment task, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Key,
    InitSegment,
    Payload,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Key => "key",
            Phase::InitSegment => "init-segment",
            Phase::Payload => "payload",
        }
    }

    /// Key bytes share the initialization counter; the init segment resets it anyway.
    pub fn counter(&self) -> Counter {
        match self {
            Phase::Key | Phase::InitSegment => Counter::Init,
            Phase::Payload => Counter::Payload,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Init,
    Payload,
}

/// Per-task byte counters, one for initialization data and one for the payload.
///
/// Each counter is updated atomically. [`block_so_far`](Self::block_so_far) may observe
/// one counter's update before the other's, which is fine for progress reporting.
#[derive(Debug, Default)]
pub struct ProgressAccumulator {
    init: AtomicU64,
    payload: AtomicU64,
}

impl ProgressAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Init => &self.init,
            Counter::Payload => &self.payload,
        }
    }

    pub fn reset(&self) {
        self.init.store(0, Ordering::Relaxed);
        self.payload.store(0, Ordering::Relaxed);
    }

    pub fn set(&self, counter: Counter, value: u64) {
        self.slot(counter).store(value, Ordering::Relaxed);
    }

    /// Returns the counter value after the addition.
    pub fn add(&self, counter: Counter, delta: u64) -> u64 {
        self.slot(counter).fetch_add(delta, Ordering::Relaxed) + delta
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.slot(counter).load(Ordering::Relaxed)
    }

    pub fn block_so_far(&self) -> u64 {
        self.init
            .load(Ordering::Relaxed)
            .saturating_add(self.payload.load(Ordering::Relaxed))
    }
}

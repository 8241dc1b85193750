//! Host-visible completion counters.
//!
//! Every hardware queue owns one [`Fence`]. The CPU side increments the expected value each
//! time it asks the queue to signal, and the hardware side raises the completed value once all
//! work submitted before that signal has finished. Both values only ever increase, and the
//! completed value never passes the expected value.
//!
//! ```
//! use scoria::sync::Fence;
//!
//! let fence = Fence::new();
//! let value = fence.signal_next();
//! assert!(!fence.is_reached(value));
//!
//! std::thread::scope(|scope| {
//!     scope.spawn(|| fence.complete(value));
//!     fence.wait(value, None).unwrap();
//! });
//! assert!(fence.is_reached(value));
//! ```

use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use event_listener::{Event, Listener};

use crate::{Error, Result};

/// A monotonically increasing completion counter shared between the CPU and a hardware queue.
pub struct Fence {
    /// Highest value the CPU has asked to be signaled.
    expected: AtomicU64,
    /// Highest value the hardware has reported. Updated with `fetch_max` so that out-of-order
    /// reports never move it backwards.
    completed: AtomicU64,
    lost: AtomicBool,
    event: Event,
}
impl Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("expected", &self.expected_value())
            .field("completed", &self.completed_value())
            .field("lost", &self.is_lost())
            .finish()
    }
}

pub type SharedFence = Arc<Fence>;

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl Fence {
    pub fn new() -> Self {
        Self {
            expected: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            lost: AtomicBool::new(false),
            event: Event::new(),
        }
    }

    /// Reserves the next counter value for a signal and returns it.
    pub fn signal_next(&self) -> u64 {
        self.expected.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn expected_value(&self) -> u64 {
        self.expected.load(Ordering::Acquire)
    }

    pub fn completed_value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_reached(&self, value: u64) -> bool {
        self.completed_value() >= value
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Reports that the hardware has finished everything up to `value`.
    ///
    /// Reports lower than the current completed value are ignored.
    pub fn complete(&self, value: u64) {
        debug_assert!(
            value <= self.expected_value(),
            "completed value {value} was never signaled"
        );
        let previous = self.completed.fetch_max(value, Ordering::AcqRel);
        if value > previous {
            self.event.notify(usize::MAX);
        }
    }

    /// Marks the device behind this fence as lost. Every unsatisfied wait fails from now on.
    pub fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
        self.event.notify(usize::MAX);
    }

    /// Blocks the calling thread until the completed value reaches `value`.
    ///
    /// Returns immediately when the value has already been reached. Fails with
    /// [`Error::DeviceLost`] if the fence is lost or `timeout` elapses first, and with
    /// [`Error::ProtocolViolation`] if `value` was never signaled.
    pub fn wait(&self, value: u64, timeout: Option<Duration>) -> Result<()> {
        if self.is_reached(value) {
            return Ok(());
        }
        if value > self.expected_value() {
            return Err(Error::ProtocolViolation(
                "waiting for a fence value that was never signaled",
            ));
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if self.is_reached(value) {
                return Ok(());
            }
            if self.is_lost() {
                return Err(Error::DeviceLost { value });
            }
            let listener = self.event.listen();
            // The value may have changed before the listener was registered.
            if self.is_reached(value) {
                return Ok(());
            }
            if self.is_lost() {
                return Err(Error::DeviceLost { value });
            }
            match deadline {
                None => listener.wait(),
                Some(deadline) => {
                    if listener.wait_deadline(deadline).is_none() {
                        if self.is_reached(value) {
                            return Ok(());
                        }
                        tracing::error!(
                            value,
                            completed = self.completed_value(),
                            "Timed out waiting for fence"
                        );
                        return Err(Error::DeviceLost { value });
                    }
                }
            }
        }
    }
}

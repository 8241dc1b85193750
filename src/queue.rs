//! Hardware queue management.
//!
//! This module provides the [`HardwareQueue`] type for submitting command buffers to a
//! [`QueueBackend`].
//!
//! # Overview
//!
//! Submissions to a queue execute in submission order. Each submission signals the queue's
//! [`Fence`](crate::sync::Fence), so the CPU can tell when the work, and with it the command
//! allocators that stored it, is no longer in use.
//!
//! Submission is also where the usage states recorded by independent command buffers are
//! reconciled: every buffer is closed against the
//! [`GlobalStateTracker`](crate::tracking::GlobalStateTracker) while its lock is held, and
//! transitions that needed the global state are executed from a patch buffer placed right
//! before it.

use std::{
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::{
    Error, Result,
    command::{Command, CommandAllocatorPool, CommandBuffer, CommandBufferState},
    sync::{Fence, SharedFence},
    tracking::{GlobalStateTracker, ResourceUsageTable},
};

/// The kind of work a queue accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Copy,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Graphics, QueueKind::Compute, QueueKind::Copy];

    pub fn name(self) -> &'static str {
        match self {
            QueueKind::Graphics => "graphics",
            QueueKind::Compute => "compute",
            QueueKind::Copy => "copy",
        }
    }
}

/// The hardware side of a queue.
///
/// Implementations must process [`execute`](Self::execute) and [`signal`](Self::signal) calls
/// in the order they were made: a signal completes only after every command list executed
/// before it has finished.
pub trait QueueBackend: Send + Sync {
    /// Executes command lists in order.
    fn execute(&self, lists: &[&[Command]]) -> Result<()>;

    /// Completes `fence` to `value` once all previously executed work has finished.
    fn signal(&self, fence: &SharedFence, value: u64) -> Result<()>;
}

/// A queue of one [`QueueKind`] with its completion counter and command allocator pool.
pub struct HardwareQueue {
    kind: QueueKind,
    fence: SharedFence,
    pool: CommandAllocatorPool,
    backend: Arc<dyn QueueBackend>,
    /// Submitted command buffer shells, ready to record again.
    idle: Mutex<Vec<CommandBuffer>>,
    wait_timeout: Option<Duration>,
}

impl Debug for HardwareQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareQueue")
            .field("kind", &self.kind)
            .field("fence", &self.fence)
            .finish_non_exhaustive()
    }
}

impl HardwareQueue {
    /// Creates a queue feeding `backend`.
    ///
    /// Waits on this queue fail with [`Error::DeviceLost`] after `wait_timeout`, or never time
    /// out when it is `None`.
    pub fn new(
        kind: QueueKind,
        backend: Arc<dyn QueueBackend>,
        wait_timeout: Option<Duration>,
    ) -> Self {
        tracing::info!(queue = kind.name(), ?wait_timeout, "Creating hardware queue");
        Self {
            kind,
            fence: Arc::new(Fence::new()),
            pool: CommandAllocatorPool::new(),
            backend,
            idle: Mutex::new(Vec::new()),
            wait_timeout,
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn fence(&self) -> &SharedFence {
        &self.fence
    }

    pub fn allocator_pool(&self) -> &CommandAllocatorPool {
        &self.pool
    }

    fn idle(&self) -> MutexGuard<'_, Vec<CommandBuffer>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a command buffer in the recording state.
    ///
    /// The buffer records into an allocator the hardware is done with. It may be sent to another
    /// thread for recording and must come back through [`submit`](Self::submit).
    pub fn command_buffer(&self) -> CommandBuffer {
        let allocator = self.pool.request(self.fence.completed_value());
        let mut buffer = self.idle().pop().unwrap_or_default();
        buffer.start(allocator);
        buffer
    }

    /// Closes `buffers` against `global` and executes them in order.
    ///
    /// Returns the fence value that is reached once all of them have finished.
    pub fn submit(
        &self,
        global: &GlobalStateTracker,
        mut buffers: Vec<CommandBuffer>,
    ) -> Result<u64> {
        if buffers
            .iter()
            .any(|buffer| buffer.state() != CommandBufferState::Recording)
        {
            return Err(Error::ProtocolViolation(
                "only recording command buffers can be submitted",
            ));
        }

        // Resolution order must match execution order, so the global table stays locked until
        // the work is queued on the backend.
        let mut table = global.lock();
        let snapshot = table.clone();
        let (value, patches) = match self.close_and_execute(&mut table, &mut buffers) {
            Ok(submitted) => submitted,
            Err(error) => {
                // Rejected work must not publish its final states.
                *table = snapshot;
                tracing::error!(queue = self.kind.name(), %error, "Submission failed");
                return Err(error);
            }
        };
        drop(table);

        tracing::debug!(
            queue = self.kind.name(),
            value,
            buffers = buffers.len(),
            patches = patches.iter().filter(|(_, patched)| *patched).count(),
            "Submitted command buffers"
        );

        let mut idle = self.idle();
        for mut buffer in patches.into_iter().map(|(patch, _)| patch).chain(buffers) {
            self.pool.retire(value, buffer.mark_submitted()?);
            idle.push(buffer);
        }
        Ok(value)
    }

    fn close_and_execute(
        &self,
        table: &mut ResourceUsageTable,
        buffers: &mut [CommandBuffer],
    ) -> Result<(u64, Vec<(CommandBuffer, bool)>)> {
        let mut patches = Vec::with_capacity(buffers.len());
        for buffer in buffers.iter_mut() {
            let mut patch = self.command_buffer();
            let patched = buffer.close(&mut patch, table)?;
            patch.close_without_resolution()?;
            patches.push((patch, patched));
        }

        let mut lists: Vec<&[Command]> = Vec::with_capacity(buffers.len() * 2);
        for ((patch, patched), buffer) in patches.iter().zip(buffers.iter()) {
            if *patched {
                lists.push(patch.commands());
            }
            lists.push(buffer.commands());
        }
        self.backend.execute(&lists)?;
        let value = self.signal()?;
        Ok((value, patches))
    }

    /// Asks the backend to signal the next fence value once all work queued so far finished.
    ///
    /// If the backend refuses, the fence is marked lost: the value it was promised can never
    /// be reached.
    pub fn signal(&self) -> Result<u64> {
        let value = self.fence.signal_next();
        if let Err(error) = self.backend.signal(&self.fence, value) {
            self.fence.mark_lost();
            return Err(error);
        }
        Ok(value)
    }

    pub fn is_reached(&self, value: u64) -> bool {
        self.fence.is_reached(value)
    }

    /// Blocks until the fence reaches `value`.
    pub fn wait_until(&self, value: u64) -> Result<()> {
        self.fence.wait(value, self.wait_timeout)
    }

    /// Blocks until everything submitted so far has finished.
    pub fn flush(&self) -> Result<()> {
        let value = self.signal()?;
        self.wait_until(value)
    }

    /// Blocks until the last value already signaled is reached, without signaling again.
    pub fn wait_idle(&self) -> Result<()> {
        self.wait_until(self.fence.expected_value())
    }
}

impl Drop for HardwareQueue {
    fn drop(&mut self) {
        if let Err(error) = self.wait_idle() {
            tracing::error!(queue = self.kind.name(), %error, "Failed to flush queue on drop");
        }
        tracing::info!(
            queue = self.kind.name(),
            allocators = self.pool.allocators_created(),
            "Destroying hardware queue"
        );
    }
}

//! # Command Recording
//!
//! This module provides command buffers that record work for a hardware queue while tracking
//! the usage state of every resource they touch.
//!
//! During recording, a command buffer is responsible for:
//! - Resource Tracking. The command buffer must keep track of the usage state of each resource
//!   it touches and insert barriers where a resource changes state.
//! - Barrier Batching. Barriers are collected and written into the command stream as one
//!   [`Command::Barriers`] record right before the next command that depends on them.
//!
//! ## Key Concepts
//! - Command Allocator: Backing storage for a command stream. An allocator can only be reused
//!   once the hardware is done executing the commands it holds, so allocators are recycled
//!   through a [`CommandAllocatorPool`] keyed by completion counter values.
//! - Pending Transition: The first transition of a resource inside a command buffer. Its
//!   before-state depends on command buffers submitted earlier, so it can only be resolved at
//!   submission time.
//! - Patch Buffer: A small command buffer submitted immediately before another one. It
//!   carries the barriers that resolve the other buffer's pending transitions.
//!
//! ## Lifecycle
//!
//! ```text
//! Initial -> Recording -> Closed -> Submitted
//!               ^                      |
//!               +------- (reset) ------+
//! ```
//!
//! Command buffers are normally obtained from
//! [`HardwareQueue::command_buffer`](crate::queue::HardwareQueue::command_buffer) and handed back
//! through [`HardwareQueue::submit`](crate::queue::HardwareQueue::submit), which closes them.
//! They can also be driven by hand:
//!
//! ```
//! use scoria::command::{Command, CommandAllocatorPool, CommandBuffer, CommandBufferState};
//! use scoria::tracking::{ResourceId, ResourceUsageTable, Subresource, UsageState};
//!
//! let pool = CommandAllocatorPool::new();
//! let texture = ResourceId::from_raw(3);
//! let mut global = ResourceUsageTable::new();
//! global.set_state(texture, Subresource::All, UsageState::COMMON);
//!
//! let mut cmd = CommandBuffer::new();
//! cmd.begin(pool.request(0)).unwrap();
//! cmd.transition(texture, Subresource::All, UsageState::RENDER_TARGET).unwrap();
//! cmd.clear_render_target(texture, [0.0, 0.0, 0.0, 1.0]).unwrap();
//!
//! let mut patch = CommandBuffer::new();
//! patch.begin(pool.request(0)).unwrap();
//! assert!(cmd.close(&mut patch, &mut global).unwrap());
//! assert_eq!(cmd.state(), CommandBufferState::Closed);
//! assert!(matches!(patch.commands()[0], Command::Barriers(_)));
//! ```

mod compute;
mod pool;
mod render;
mod transfer;

use crate::{
    Error, Result,
    tracking::{
        Access, Barrier, CommandBufferStateTracker, PendingTransition, ResourceId,
        ResourceUsageTable, Subresource, UsageState,
    },
};
pub use pool::*;

/// One recorded operation in a command stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// A batch of barriers executed as one pipeline barrier.
    Barriers(Vec<Barrier>),
    CopyResource {
        src: ResourceId,
        dst: ResourceId,
    },
    CopyBufferRegion {
        src: ResourceId,
        src_offset: u64,
        dst: ResourceId,
        dst_offset: u64,
        size: u64,
    },
    Dispatch {
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    },
    ClearRenderTarget {
        target: ResourceId,
        color: [f32; 4],
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
}

/// Represents the current state of a command buffer in its lifecycle.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum CommandBufferState {
    /// Newly created, no allocator attached yet.
    Initial,

    /// Accepting commands and transitions.
    Recording,

    /// Recording finished and pending transitions resolved, ready to be handed to the backend.
    Closed,

    /// Handed to the backend. The allocator has been detached and retired.
    Submitted,
}

/// A command stream under construction, together with the usage-state knowledge gathered while
/// recording it.
///
/// Command buffers are `Send` and record without any synchronization, so several of them can be
/// filled in parallel on worker threads.
#[derive(Debug)]
pub struct CommandBuffer {
    state: CommandBufferState,
    allocator: Option<CommandAllocator>,
    tracker: CommandBufferStateTracker,
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self {
            state: CommandBufferState::Initial,
            allocator: None,
            tracker: CommandBufferStateTracker::new(),
        }
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    /// Attaches `allocator` and starts recording.
    pub fn begin(&mut self, allocator: CommandAllocator) -> Result<()> {
        if self.state != CommandBufferState::Initial {
            return Err(Error::ProtocolViolation(
                "begin requires a command buffer in the initial state",
            ));
        }
        self.attach(allocator);
        Ok(())
    }

    /// Restarts recording on a submitted command buffer with a fresh `allocator`.
    ///
    /// All usage-state knowledge of the previous recording is discarded.
    pub fn reset(&mut self, allocator: CommandAllocator) -> Result<()> {
        if self.state != CommandBufferState::Submitted {
            return Err(Error::ProtocolViolation(
                "only submitted command buffers can be reset",
            ));
        }
        self.tracker.reset();
        self.attach(allocator);
        Ok(())
    }

    /// Starts recording on a fresh or submitted command buffer.
    pub(crate) fn start(&mut self, allocator: CommandAllocator) {
        debug_assert!(matches!(
            self.state,
            CommandBufferState::Initial | CommandBufferState::Submitted
        ));
        self.tracker.reset();
        self.attach(allocator);
    }

    fn attach(&mut self, mut allocator: CommandAllocator) {
        allocator.reset();
        self.allocator = Some(allocator);
        self.state = CommandBufferState::Recording;
    }

    /// The commands recorded so far.
    pub fn commands(&self) -> &[Command] {
        self.allocator
            .as_ref()
            .map(|allocator| allocator.commands())
            .unwrap_or_default()
    }

    pub fn pending_transitions(&self) -> &[PendingTransition] {
        self.tracker.pending_transitions()
    }

    pub fn has_pending_barriers(&self) -> bool {
        self.tracker.has_pending_barriers()
    }

    fn stream(&mut self) -> Result<&mut CommandAllocator> {
        match (self.state, self.allocator.as_mut()) {
            (CommandBufferState::Recording, Some(allocator)) => Ok(allocator),
            _ => Err(Error::ProtocolViolation(
                "command buffer is not recording",
            )),
        }
    }

    fn ensure_recording(&self) -> Result<()> {
        if self.state != CommandBufferState::Recording {
            return Err(Error::ProtocolViolation(
                "command buffer is not recording",
            ));
        }
        Ok(())
    }

    /// Appends a command without flushing batched barriers.
    pub(crate) fn record(&mut self, command: Command) -> Result<()> {
        self.stream()?.push(command);
        Ok(())
    }

    /// Declares that `subresource` of `resource` is used in state `after` from here on.
    ///
    /// The barrier, if one is needed, is batched until the next
    /// [`flush_resource_barriers`](Self::flush_resource_barriers).
    pub fn transition(
        &mut self,
        resource: ResourceId,
        subresource: Subresource,
        after: UsageState,
    ) -> Result<()> {
        self.ensure_recording()?;
        self.tracker.request_transition(resource, subresource, after);
        Ok(())
    }

    /// Batches an execution and memory dependency without a state change.
    ///
    /// This creates
    /// - An execution dependency such that `before.stage` completes before any operations in
    ///   `after.stage` begin
    /// - A memory dependency such that memory touched by `before.access` is made visible to
    ///   `after.access`.
    pub fn memory_barrier(&mut self, before: Access, after: Access) -> Result<()> {
        self.ensure_recording()?;
        self.tracker.memory_barrier(before, after);
        Ok(())
    }

    /// Writes all batched barriers into the command stream as one [`Command::Barriers`].
    ///
    /// Does nothing when no barrier is batched.
    pub fn flush_resource_barriers(&mut self) -> Result<()> {
        self.ensure_recording()?;
        if !self.tracker.has_pending_barriers() {
            return Ok(());
        }
        let barriers = self.tracker.flush_barriers();
        self.record(Command::Barriers(barriers))
    }

    /// Finishes recording and reconciles this buffer with the device-wide `global` table.
    ///
    /// Remaining batched barriers are flushed. Pending transitions are resolved against
    /// `global` and recorded into `patch`, which must be recording and must be executed right
    /// before this buffer. The final states of this buffer then become the global states.
    ///
    /// Returns whether `patch` received any barriers.
    pub fn close(
        &mut self,
        patch: &mut CommandBuffer,
        global: &mut ResourceUsageTable,
    ) -> Result<bool> {
        self.ensure_recording()?;
        if patch.state != CommandBufferState::Recording {
            return Err(Error::ProtocolViolation("patch buffer is not recording"));
        }
        self.flush_resource_barriers()?;

        let resolved = self.tracker.resolve_pending(global);
        let patched = !resolved.is_empty();
        if patched {
            tracing::trace!(count = resolved.len(), "recording resolved barriers into patch buffer");
            patch.record(Command::Barriers(resolved))?;
        }
        self.tracker.commit_final_states(global);
        self.tracker.reset();
        self.state = CommandBufferState::Closed;
        Ok(patched)
    }

    /// Finishes recording of a buffer that has no pending transitions, such as a patch buffer.
    pub fn close_without_resolution(&mut self) -> Result<()> {
        self.ensure_recording()?;
        if !self.tracker.pending_transitions().is_empty() {
            return Err(Error::ProtocolViolation(
                "command buffer has transitions that need the global state",
            ));
        }
        self.flush_resource_barriers()?;
        self.tracker.reset();
        self.state = CommandBufferState::Closed;
        Ok(())
    }

    /// Marks a closed buffer as handed to the backend and detaches its allocator.
    pub(crate) fn mark_submitted(&mut self) -> Result<CommandAllocator> {
        if self.state != CommandBufferState::Closed {
            return Err(Error::ProtocolViolation(
                "only closed command buffers can be submitted",
            ));
        }
        let allocator = self
            .allocator
            .take()
            .ok_or(Error::ProtocolViolation("closed command buffer lost its allocator"))?;
        self.state = CommandBufferState::Submitted;
        Ok(allocator)
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        match self.state {
            CommandBufferState::Recording => {
                tracing::warn!(
                    commands = self.commands().len(),
                    "Dropping a CommandBuffer that is still recording"
                );
            }
            CommandBufferState::Closed => {
                tracing::warn!("Dropping a closed CommandBuffer that was never submitted");
            }
            CommandBufferState::Initial | CommandBufferState::Submitted => (),
        }
    }
}

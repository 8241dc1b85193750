//! # Scoria
//!
//! The sub-allocation, resource state tracking and queue synchronization core of a real-time
//! GPU renderer.
//!
//! Scoria does not talk to a graphics driver. Hardware execution sits behind the
//! [`QueueBackend`](queue::QueueBackend) trait, and the [`ash`] Vulkan types serve as the
//! vocabulary for pipeline stages, access masks and image layouts.
//!
//! ## Quick Start
//!
//! ```
//! use scoria::prelude::*;
//!
//! let device = Device::new(DeviceConfig::default()).unwrap();
//! let vertices = ResourceId::from_raw(1);
//! device.register_resource(vertices, UsageState::COPY_DST);
//!
//! let queue = device.queue(QueueKind::Graphics).unwrap();
//! let mut cmd = queue.command_buffer();
//! cmd.transition(vertices, Subresource::All, UsageState::VERTEX_BUFFER).unwrap();
//! cmd.draw(0..3, 0..1).unwrap();
//! let value = device.submit(QueueKind::Graphics, vec![cmd]).unwrap();
//! queue.wait_until(value).unwrap();
//! ```
//!
//! ## Overview
//!
//! ### Sub-allocation
//!
//! [`FreeSpaceAllocator`](alloc::FreeSpaceAllocator) carves ranges out of a fixed-size pool
//! with best-fit placement and coalesces them again on release.
//! [`RetiredRanges`](alloc::RetiredRanges) holds released ranges back until the hardware is done
//! with them.
//!
//! ```
//! use scoria::alloc::FreeSpaceAllocator;
//!
//! let mut heap = FreeSpaceAllocator::new(1 << 20);
//! let range = heap.allocate(4096).unwrap();
//! heap.free(range.offset, range.size);
//! assert_eq!(heap.current_available(), 1 << 20);
//! ```
//!
//! ### Resource State Tracking
//!
//! Command buffers track the usage state of every resource they touch and batch the barriers
//! they need. Transitions whose before-state depends on earlier submissions are resolved at
//! submission time against the device-wide [`GlobalStateTracker`](tracking::GlobalStateTracker).
//! See the [`tracking`] module.
//!
//! ### Submission and Synchronization
//!
//! - [`HardwareQueue`] - Executes command buffers in submission order and recycles their
//!   command allocators
//! - [`Fence`](sync::Fence) - Monotonic completion counter the CPU can wait on
//! - [`Device`] - Owns the queues and the global state table

use std::borrow::Cow;

pub mod alloc;
pub mod backend;
pub mod command;
pub mod device;
pub mod queue;
pub mod sync;
pub mod tracking;
pub mod utils;

pub use device::{Device, DeviceConfig};
pub use queue::{HardwareQueue, QueueKind};

pub use ash;

/// Errors reported by command recording, submission and waits.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operation was called in a state that does not allow it.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// A wait did not complete, either because the device was lost or the configured wait
    /// timeout elapsed.
    #[error("device lost while waiting for fence value {value}")]
    DeviceLost { value: u64 },
    /// The backend refused the submission.
    #[error("submission failed: {0}")]
    SubmissionFailed(Cow<'static, str>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod prelude {
    pub use crate::{
        Device, DeviceConfig, Error, HardwareQueue, QueueKind, Result,
        alloc::{Allocation, FreeSpaceAllocator},
        ash::vk,
        command::{CommandBuffer, CommandBufferState},
        tracking::{Access, ResourceId, Subresource, UsageState},
    };
}

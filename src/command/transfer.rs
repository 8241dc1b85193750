//! Buffer and image transfer commands.
//!
//! The source is expected in [`UsageState::COPY_SRC`](crate::tracking::UsageState::COPY_SRC)
//! and the destination in [`UsageState::COPY_DST`](crate::tracking::UsageState::COPY_DST).
//! Transition them before recording the copy.
use crate::{Result, tracking::ResourceId};

use super::{Command, CommandBuffer};

impl CommandBuffer {
    /// Copies the entire contents of one resource to another.
    pub fn copy_resource(&mut self, src: ResourceId, dst: ResourceId) -> Result<()> {
        self.flush_resource_barriers()?;
        self.record(Command::CopyResource { src, dst })
    }

    /// Copies a region from one buffer to another.
    pub fn copy_buffer_region(
        &mut self,
        src: ResourceId,
        src_offset: u64,
        dst: ResourceId,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.flush_resource_barriers()?;
        self.record(Command::CopyBufferRegion {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        })
    }
}

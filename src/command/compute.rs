//! Compute dispatch commands.

use crate::Result;

use super::{Command, CommandBuffer};

impl CommandBuffer {
    /// Dispatches compute work.
    ///
    /// Batched barriers are flushed first, so resources transitioned beforehand are in their
    /// requested states when the dispatch runs.
    pub fn dispatch(
        &mut self,
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    ) -> Result<()> {
        self.flush_resource_barriers()?;
        self.record(Command::Dispatch {
            group_count_x,
            group_count_y,
            group_count_z,
        })
    }
}

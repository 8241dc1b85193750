//! Render target clears and draw commands.

use std::ops::Range;

use crate::{Result, tracking::ResourceId};

use super::{Command, CommandBuffer};

impl CommandBuffer {
    /// Clears a render target to `color`.
    ///
    /// The target must have been transitioned to
    /// [`UsageState::RENDER_TARGET`](crate::tracking::UsageState::RENDER_TARGET).
    pub fn clear_render_target(&mut self, target: ResourceId, color: [f32; 4]) -> Result<()> {
        self.flush_resource_barriers()?;
        self.record(Command::ClearRenderTarget { target, color })
    }

    /// Draws primitives.
    pub fn draw(&mut self, vertex_range: Range<u32>, instance_range: Range<u32>) -> Result<()> {
        self.flush_resource_barriers()?;
        self.record(Command::Draw {
            vertex_count: vertex_range.end - vertex_range.start,
            instance_count: instance_range.end - instance_range.start,
            first_vertex: vertex_range.start,
            first_instance: instance_range.start,
        })
    }

    /// Draws indexed primitives using the bound index buffer.
    pub fn draw_indexed(
        &mut self,
        index_range: Range<u32>,
        instance_range: Range<u32>,
        vertex_offset: i32,
    ) -> Result<()> {
        self.flush_resource_barriers()?;
        self.record(Command::DrawIndexed {
            index_count: index_range.end - index_range.start,
            instance_count: instance_range.end - instance_range.start,
            first_index: index_range.start,
            vertex_offset,
            first_instance: instance_range.start,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        command::{Command, CommandAllocatorPool, CommandBuffer},
        tracking::{ResourceId, Subresource, UsageState},
    };

    #[test]
    fn per_mip_transitions_before_a_draw() {
        let target = ResourceId::from_raw(9);
        let pool = CommandAllocatorPool::new();
        let mut cmd = CommandBuffer::new();
        cmd.begin(pool.request(0)).unwrap();

        cmd.transition(target, Subresource::All, UsageState::RENDER_TARGET)
            .unwrap();
        cmd.clear_render_target(target, [0.0; 4]).unwrap();
        cmd.transition(target, Subresource::Index(0), UsageState::SHADER_READ)
            .unwrap();
        cmd.transition(target, Subresource::Index(1), UsageState::SHADER_READ)
            .unwrap();
        cmd.draw_indexed(6..12, 0..2, -4).unwrap();

        let commands = cmd.commands();
        assert_eq!(commands.len(), 3);
        let Command::Barriers(barriers) = &commands[1] else {
            panic!("expected barriers before the draw, got {:?}", commands[1]);
        };
        assert_eq!(barriers.len(), 2);
        assert_eq!(
            commands[2],
            Command::DrawIndexed {
                index_count: 6,
                instance_count: 2,
                first_index: 6,
                vertex_offset: -4,
                first_instance: 0,
            }
        );
    }
}

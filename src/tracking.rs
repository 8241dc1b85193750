//! Resource usage-state tracking and barrier resolution.
//!
//! Before the GPU may use a resource in a new way (say, sample from an image that was just
//! copied into) the resource must be moved from its old usage state into the new one with a
//! barrier. Emitting such a barrier requires both the "before" and the "after" state. The
//! "after" state is always known at the call site. The "before" state is not: it depends on
//! whatever the previously submitted command buffers did with the resource.
//!
//! # Two-phase resolution
//!
//! Command buffers are recorded in parallel on worker threads, so no command buffer can know
//! at recording time what another buffer will have done to a resource by the time it runs.
//! Tracking is therefore split in two:
//!
//! - Each command buffer owns a [`CommandBufferStateTracker`]. The first time the buffer
//!   touches a resource, the transition is recorded as a [`PendingTransition`] with no
//!   before-state. Every later transition of that resource inside the same buffer resolves
//!   immediately against the buffer's local knowledge.
//! - At submission time, under the lock of the [`GlobalStateTracker`], pending transitions are
//!   resolved against the device-wide last known state and written into a small patch command
//!   buffer that runs right before the real one. The buffer's final states then become the new
//!   global states.
//!
//! ```
//! use scoria::tracking::{
//!     Barrier, CommandBufferStateTracker, ResourceId, ResourceUsageTable, Subresource, UsageState,
//! };
//!
//! let texture = ResourceId::from_raw(7);
//! let mut global = ResourceUsageTable::default();
//! global.set_state(texture, Subresource::All, UsageState::COPY_DST);
//!
//! let mut local = CommandBufferStateTracker::new();
//! // First use in this command buffer: nothing can be emitted yet.
//! local.request_transition(texture, Subresource::All, UsageState::SHADER_READ);
//! assert!(!local.has_pending_barriers());
//! // Second use resolves locally.
//! local.request_transition(texture, Subresource::All, UsageState::RENDER_TARGET);
//! assert_eq!(local.flush_barriers().len(), 1);
//!
//! // At submission the first use is resolved against the global state.
//! let patch = local.resolve_pending(&global);
//! let Barrier::Transition(barrier) = &patch[0] else { unreachable!() };
//! assert_eq!(barrier.before, UsageState::COPY_DST);
//! assert_eq!(barrier.after, UsageState::SHADER_READ);
//!
//! local.commit_final_states(&mut global);
//! assert_eq!(
//!     global.get_state(texture, Subresource::All),
//!     Some(UsageState::RENDER_TARGET)
//! );
//! ```
//!
//! # Subresources
//!
//! A resource is tracked either as a whole or per subresource (a mip level of an array layer,
//! numbered `mip + layer * mip_levels`). A [`ResourceRecord`] holds an optional whole-resource
//! state plus per-subresource overrides. Transitioning [`Subresource::All`] collapses the
//! overrides back into one state.

use std::{
    collections::{BTreeMap, HashMap, hash_map::Entry},
    fmt::Debug,
    ops::{BitOr, BitOrAssign},
    sync::{Mutex, MutexGuard, PoisonError},
};

use ash::vk::{self, Handle};

/// When (pipeline stage) and how (access mask) a resource is used.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Access {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}
impl BitOr for Access {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            stage: self.stage | rhs.stage,
            access: self.access | rhs.access,
        }
    }
}
impl BitOrAssign for Access {
    fn bitor_assign(&mut self, rhs: Self) {
        self.stage |= rhs.stage;
        self.access |= rhs.access;
    }
}

impl Access {
    pub const NONE: Access = Access {
        stage: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
    };
    pub const VERTEX_READ: Access = Access {
        stage: vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
        access: vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
    };
    pub const INDEX_READ: Access = Access {
        stage: vk::PipelineStageFlags2::INDEX_INPUT,
        access: vk::AccessFlags2::INDEX_READ,
    };
    pub const INDIRECT_READ: Access = Access {
        stage: vk::PipelineStageFlags2::DRAW_INDIRECT,
        access: vk::AccessFlags2::INDIRECT_COMMAND_READ,
    };
    pub const COPY_READ: Access = Access {
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_READ,
    };
    pub const COPY_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_WRITE,
    };
    pub const SHADER_SAMPLED_READ: Access = Access {
        stage: vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::VERTEX_SHADER.as_raw()
                | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw()
                | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw(),
        ),
        access: vk::AccessFlags2::SHADER_SAMPLED_READ,
    };
    pub const COMPUTE_READ: Access = Access {
        stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        access: vk::AccessFlags2::SHADER_STORAGE_READ,
    };
    pub const COMPUTE_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        access: vk::AccessFlags2::SHADER_STORAGE_WRITE,
    };
    pub const COLOR_ATTACHMENT_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
    };
    pub const DEPTH_STENCIL_READ: Access = Access {
        stage: vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
        ),
        access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
    };
    pub const DEPTH_STENCIL_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
        ),
        access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
    };
    pub const ALL_COMMANDS: Access = Access {
        stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
        ),
    };
}

/// The mode a resource is currently usable in.
///
/// A usage state pairs an [`Access`] with the image layout the access requires. Buffers leave
/// the layout at [`vk::ImageLayout::UNDEFINED`]. Two states that compare unequal always need a
/// barrier between them.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageState {
    pub access: Access,
    pub layout: vk::ImageLayout,
}
impl Debug for UsageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("UsageState");
        debug.field("stage", &self.access.stage);
        debug.field("access", &self.access.access);
        if self.layout != vk::ImageLayout::UNDEFINED {
            debug.field("layout", &self.layout);
        }
        debug.finish()
    }
}

impl UsageState {
    /// Freshly created, not in use by any pipeline stage.
    pub const COMMON: UsageState = UsageState::new(Access::NONE, vk::ImageLayout::GENERAL);
    pub const COPY_SRC: UsageState =
        UsageState::new(Access::COPY_READ, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    pub const COPY_DST: UsageState =
        UsageState::new(Access::COPY_WRITE, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    pub const SHADER_READ: UsageState = UsageState::new(
        Access::SHADER_SAMPLED_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    );
    pub const UNORDERED_ACCESS: UsageState = UsageState::new(
        Access {
            stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
            access: vk::AccessFlags2::from_raw(
                vk::AccessFlags2::SHADER_STORAGE_READ.as_raw()
                    | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw(),
            ),
        },
        vk::ImageLayout::GENERAL,
    );
    pub const RENDER_TARGET: UsageState = UsageState::new(
        Access::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    );
    pub const DEPTH_WRITE: UsageState = UsageState::new(
        Access::DEPTH_STENCIL_WRITE,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    );
    pub const DEPTH_READ: UsageState = UsageState::new(
        Access::DEPTH_STENCIL_READ,
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
    );
    pub const VERTEX_BUFFER: UsageState = UsageState::buffer(Access::VERTEX_READ);
    pub const INDEX_BUFFER: UsageState = UsageState::buffer(Access::INDEX_READ);
    pub const INDIRECT_ARGUMENT: UsageState = UsageState::buffer(Access::INDIRECT_READ);
    pub const PRESENT: UsageState = UsageState::new(Access::NONE, vk::ImageLayout::PRESENT_SRC_KHR);

    pub const fn new(access: Access, layout: vk::ImageLayout) -> Self {
        Self { access, layout }
    }
    /// A state for resources without an image layout.
    pub const fn buffer(access: Access) -> Self {
        Self {
            access,
            layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

/// Opaque identity of a caller-owned resource.
///
/// The tracker never owns resources, it only keys metadata by their identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ResourceId(u64);

impl ResourceId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}
impl From<vk::Buffer> for ResourceId {
    fn from(buffer: vk::Buffer) -> Self {
        Self(buffer.as_raw())
    }
}
impl From<vk::Image> for ResourceId {
    fn from(image: vk::Image) -> Self {
        Self(image.as_raw())
    }
}

/// Which part of a resource a transition applies to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum Subresource {
    /// Every subresource at once.
    #[default]
    All,
    /// One subresource, numbered `mip + layer * mip_levels`.
    Index(u32),
}

impl Subresource {
    /// Numbers a mip level of an array layer. `None` if the index does not fit in a `u32`.
    pub fn from_mip_layer(mip_level: u32, array_layer: u32, mip_levels: u32) -> Option<Self> {
        array_layer
            .checked_mul(mip_levels)?
            .checked_add(mip_level)
            .map(Subresource::Index)
    }
}

/// Everything a table knows about one resource.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceRecord {
    /// State of every subresource without an override. `None` when only individual
    /// subresources have been seen.
    state: Option<UsageState>,
    subresources: BTreeMap<u32, UsageState>,
}

impl ResourceRecord {
    pub fn new(state: UsageState) -> Self {
        Self {
            state: Some(state),
            subresources: BTreeMap::new(),
        }
    }

    /// The whole-resource state. When [`has_overrides`](Self::has_overrides) is true this is
    /// only the fallback for subresources without an override.
    pub fn whole_state(&self) -> Option<UsageState> {
        self.state
    }

    pub fn has_overrides(&self) -> bool {
        !self.subresources.is_empty()
    }

    /// Per-subresource overrides in index order.
    pub fn overrides(&self) -> impl Iterator<Item = (u32, UsageState)> + '_ {
        self.subresources.iter().map(|(&index, &state)| (index, state))
    }

    /// The state of `subresource`, falling back to the whole-resource state.
    pub fn get(&self, subresource: Subresource) -> Option<UsageState> {
        match subresource {
            Subresource::All => self.state,
            Subresource::Index(index) => self.subresources.get(&index).copied().or(self.state),
        }
    }

    pub fn set(&mut self, subresource: Subresource, state: UsageState) {
        match subresource {
            Subresource::All => {
                self.state = Some(state);
                self.subresources.clear();
            }
            Subresource::Index(index) => {
                self.subresources.insert(index, state);
            }
        }
    }

    /// Moves `subresource` into `after` and pushes the barriers that move needs.
    ///
    /// Moving [`Subresource::All`] over a record with overrides first brings every override
    /// back to the whole-resource state, so that a single whole-resource barrier can follow.
    /// Subresources with no known state are left alone.
    fn transition(
        &mut self,
        resource: ResourceId,
        subresource: Subresource,
        after: UsageState,
        barriers: &mut Vec<Barrier>,
    ) {
        let mut push = |subresource, before: UsageState, after: UsageState| {
            if before != after {
                barriers.push(Barrier::Transition(TransitionBarrier {
                    resource,
                    subresource,
                    before,
                    after,
                }));
            }
        };
        match (subresource, self.state) {
            (Subresource::All, Some(whole)) if whole == after => {
                for (index, before) in self.overrides() {
                    push(Subresource::Index(index), before, after);
                }
                self.set(Subresource::All, after);
            }
            (Subresource::All, Some(whole)) => {
                for (index, before) in self.overrides() {
                    push(Subresource::Index(index), before, whole);
                }
                push(Subresource::All, whole, after);
                self.set(Subresource::All, after);
            }
            (Subresource::All, None) => {
                for (index, before) in self.overrides() {
                    push(Subresource::Index(index), before, after);
                }
                self.subresources.values_mut().for_each(|state| *state = after);
            }
            (Subresource::Index(_), _) => {
                if let Some(before) = self.get(subresource) {
                    push(subresource, before, after);
                    self.set(subresource, after);
                }
            }
        }
    }
}

/// Usage states of a set of resources.
#[derive(Clone, Debug, Default)]
pub struct ResourceUsageTable {
    records: HashMap<ResourceId, ResourceRecord>,
}

impl ResourceUsageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&mut self, resource: ResourceId, subresource: Subresource, state: UsageState) {
        self.records
            .entry(resource)
            .or_default()
            .set(subresource, state);
    }

    /// The state of a subresource, or of the whole resource when it has no override.
    pub fn get_state(&self, resource: ResourceId, subresource: Subresource) -> Option<UsageState> {
        self.records.get(&resource)?.get(subresource)
    }

    pub fn find(&self, resource: ResourceId) -> Option<&ResourceRecord> {
        self.records.get(&resource)
    }

    pub fn remove(&mut self, resource: ResourceId) -> Option<ResourceRecord> {
        self.records.remove(&resource)
    }

    /// Overwrites this table with everything `other` knows.
    ///
    /// Records of `other` that carry a whole-resource state replace the corresponding record
    /// here. Records that only know individual subresources write those subresources over the
    /// existing record and leave the rest of it intact.
    pub fn merge(&mut self, other: &ResourceUsageTable) {
        for (&resource, record) in other.records.iter() {
            if record.state.is_some() {
                self.records.insert(resource, record.clone());
            } else {
                let target = self.records.entry(resource).or_default();
                target.subresources.extend(record.overrides());
            }
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceId, &ResourceRecord)> {
        self.records.iter().map(|(&id, record)| (id, record))
    }
}

/// A usage-state change for one (sub)resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionBarrier {
    pub resource: ResourceId,
    pub subresource: Subresource,
    pub before: UsageState,
    pub after: UsageState,
}

impl TransitionBarrier {
    /// Expresses the transition as a Vulkan image barrier.
    ///
    /// `mip_levels` is the mip count of `image`, needed to split a subresource index into a mip
    /// level and an array layer.
    ///
    /// # Panics
    /// If the barrier targets a single subresource and `mip_levels` is zero.
    pub fn image_barrier(
        &self,
        image: vk::Image,
        aspect_mask: vk::ImageAspectFlags,
        mip_levels: u32,
    ) -> vk::ImageMemoryBarrier2<'static> {
        let subresource_range = match self.subresource {
            Subresource::All => vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            },
            Subresource::Index(index) => {
                assert!(mip_levels > 0, "image has no mip levels");
                vk::ImageSubresourceRange {
                    aspect_mask,
                    base_mip_level: index % mip_levels,
                    level_count: 1,
                    base_array_layer: index / mip_levels,
                    layer_count: 1,
                }
            }
        };
        vk::ImageMemoryBarrier2 {
            src_stage_mask: self.before.access.stage,
            src_access_mask: self.before.access.access,
            dst_stage_mask: self.after.access.stage,
            dst_access_mask: self.after.access.access,
            old_layout: self.before.layout,
            new_layout: self.after.layout,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image,
            subresource_range,
            ..Default::default()
        }
    }

    /// Expresses the transition as a Vulkan buffer barrier over the whole buffer.
    pub fn buffer_barrier(&self, buffer: vk::Buffer) -> vk::BufferMemoryBarrier2<'static> {
        vk::BufferMemoryBarrier2 {
            src_stage_mask: self.before.access.stage,
            src_access_mask: self.before.access.access,
            dst_stage_mask: self.after.access.stage,
            dst_access_mask: self.after.access.access,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            buffer,
            offset: 0,
            size: vk::WHOLE_SIZE,
            ..Default::default()
        }
    }
}

/// An execution and memory dependency without a state change, such as between two passes
/// writing the same storage image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src: Access,
    pub dst: Access,
}
impl BitOr for MemoryBarrier {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            src: self.src | rhs.src,
            dst: self.dst | rhs.dst,
        }
    }
}
impl BitOrAssign for MemoryBarrier {
    fn bitor_assign(&mut self, rhs: Self) {
        self.src |= rhs.src;
        self.dst |= rhs.dst;
    }
}
impl MemoryBarrier {
    pub fn to_vk(&self) -> vk::MemoryBarrier2<'static> {
        vk::MemoryBarrier2 {
            src_stage_mask: self.src.stage,
            src_access_mask: self.src.access,
            dst_stage_mask: self.dst.stage,
            dst_access_mask: self.dst.access,
            ..Default::default()
        }
    }
}

/// A resolved barrier, ready to be written into a command stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Barrier {
    Transition(TransitionBarrier),
    Memory(MemoryBarrier),
}

/// A transition requested on a (sub)resource whose state the command buffer does not know yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingTransition {
    pub resource: ResourceId,
    pub subresource: Subresource,
    pub after: UsageState,
}

/// Usage-state knowledge scoped to one command buffer recording.
///
/// Holds the buffer's local [`ResourceUsageTable`], the transitions that still need a
/// before-state from the global table, and the batch of resolved barriers not yet written into
/// the command stream.
#[derive(Debug, Default)]
pub struct CommandBufferStateTracker {
    local: ResourceUsageTable,
    pending: Vec<PendingTransition>,
    barriers: Vec<Barrier>,
}

impl CommandBufferStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that `subresource` of `resource` be in state `after` from here on.
    ///
    /// If this tracker already knows the current state, the barrier is resolved and batched
    /// right away (or skipped if the state does not change). Otherwise the request is kept as a
    /// [`PendingTransition`] for [`resolve_pending`](Self::resolve_pending).
    ///
    /// A whole-resource request on a resource of which only some subresources were touched
    /// does both: the touched subresources are moved locally, and the untouched ones are left
    /// to a pending transition that resolves ahead of the earlier first uses.
    pub fn request_transition(
        &mut self,
        resource: ResourceId,
        subresource: Subresource,
        after: UsageState,
    ) {
        let pending = PendingTransition {
            resource,
            subresource,
            after,
        };
        match self.local.records.get_mut(&resource) {
            Some(record) if subresource == Subresource::All && record.state.is_none() => {
                record.transition(resource, subresource, after, &mut self.barriers);
                let first_use = self
                    .pending
                    .iter()
                    .position(|earlier| earlier.resource == resource)
                    .unwrap_or(self.pending.len());
                tracing::trace!(?resource, ?after, "pending transition of untouched subresources");
                self.pending.insert(first_use, pending);
            }
            Some(record) if record.get(subresource).is_some() => {
                record.transition(resource, subresource, after, &mut self.barriers);
            }
            _ => {
                tracing::trace!(?resource, ?subresource, ?after, "pending transition");
                self.pending.push(pending);
            }
        }
        self.local.set_state(resource, subresource, after);
    }

    /// Batches an execution and memory dependency between `src` and `dst`.
    ///
    /// All memory barriers batched between two flushes are folded into one.
    pub fn memory_barrier(&mut self, src: Access, dst: Access) {
        let barrier = MemoryBarrier { src, dst };
        let existing = self.barriers.iter_mut().find_map(|batched| match batched {
            Barrier::Memory(memory) => Some(memory),
            Barrier::Transition(_) => None,
        });
        match existing {
            Some(memory) => *memory |= barrier,
            None => self.barriers.push(Barrier::Memory(barrier)),
        }
    }

    pub fn has_pending_barriers(&self) -> bool {
        !self.barriers.is_empty()
    }

    /// Takes the batched barriers, leaving the batch empty.
    pub fn flush_barriers(&mut self) -> Vec<Barrier> {
        std::mem::take(&mut self.barriers)
    }

    pub fn pending_transitions(&self) -> &[PendingTransition] {
        &self.pending
    }

    /// What this command buffer has done to each resource so far.
    pub fn local_states(&self) -> &ResourceUsageTable {
        &self.local
    }

    /// Resolves the pending transitions against the device-wide `global` table.
    ///
    /// Transitions are applied in order to a scratch copy of the global records, so a later
    /// transition of the same resource starts from where an earlier one left it. Resources the
    /// global table has never seen are skipped: there is no prior state to transition from.
    pub fn resolve_pending(&self, global: &ResourceUsageTable) -> Vec<Barrier> {
        let mut barriers = Vec::new();
        let mut scratch: HashMap<ResourceId, ResourceRecord> = HashMap::new();
        for pending in self.pending.iter() {
            let record = match scratch.entry(pending.resource) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => match global.find(pending.resource) {
                    Some(record) => entry.insert(record.clone()),
                    None => {
                        tracing::trace!(resource = ?pending.resource, "first use, nothing to resolve");
                        continue;
                    }
                },
            };
            record.transition(pending.resource, pending.subresource, pending.after, &mut barriers);
        }
        barriers
    }

    /// Publishes this buffer's final states into `global`.
    pub fn commit_final_states(&self, global: &mut ResourceUsageTable) {
        global.merge(&self.local);
    }

    pub fn reset(&mut self) {
        self.local.clear();
        self.pending.clear();
        self.barriers.clear();
    }
}

/// The authoritative, device-wide last known state of every resource.
///
/// Updated only when command buffers are submitted, in submission order. Lock it for the whole
/// of a submission so that resolution order matches execution order.
#[derive(Debug, Default)]
pub struct GlobalStateTracker {
    table: Mutex<ResourceUsageTable>,
}

impl GlobalStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ResourceUsageTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes a newly created resource known in its initial state.
    pub fn register(&self, resource: ResourceId, state: UsageState) {
        self.lock().set_state(resource, Subresource::All, state);
    }

    /// Forgets a destroyed resource.
    pub fn unregister(&self, resource: ResourceId) -> Option<ResourceRecord> {
        self.lock().remove(resource)
    }

    pub fn state(&self, resource: ResourceId, subresource: Subresource) -> Option<UsageState> {
        self.lock().get_state(resource, subresource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ResourceId = ResourceId::from_raw(1);
    const B: ResourceId = ResourceId::from_raw(2);

    fn transition(
        resource: ResourceId,
        subresource: Subresource,
        before: UsageState,
        after: UsageState,
    ) -> Barrier {
        Barrier::Transition(TransitionBarrier {
            resource,
            subresource,
            before,
            after,
        })
    }

    #[test]
    fn subresource_lookup_falls_back_to_whole_state() {
        let mut table = ResourceUsageTable::new();
        table.set_state(A, Subresource::All, UsageState::COPY_DST);
        table.set_state(A, Subresource::Index(2), UsageState::SHADER_READ);
        assert_eq!(table.get_state(A, Subresource::Index(2)), Some(UsageState::SHADER_READ));
        assert_eq!(table.get_state(A, Subresource::Index(3)), Some(UsageState::COPY_DST));
        assert_eq!(table.get_state(A, Subresource::All), Some(UsageState::COPY_DST));
        assert_eq!(table.get_state(B, Subresource::All), None);

        table.set_state(A, Subresource::All, UsageState::RENDER_TARGET);
        let record = table.find(A).unwrap();
        assert!(!record.has_overrides());
        assert_eq!(record.get(Subresource::Index(2)), Some(UsageState::RENDER_TARGET));

        assert!(table.remove(A).is_some());
        assert!(table.find(A).is_none());
    }

    #[test]
    fn subresource_only_records_have_no_whole_state() {
        let mut table = ResourceUsageTable::new();
        table.set_state(A, Subresource::Index(1), UsageState::COPY_SRC);
        assert_eq!(table.get_state(A, Subresource::Index(0)), None);
        assert_eq!(table.get_state(A, Subresource::All), None);
        assert_eq!(table.find(A).unwrap().whole_state(), None);
    }

    #[test]
    fn merge_overwrites_known_states() {
        let mut global = ResourceUsageTable::new();
        global.set_state(A, Subresource::All, UsageState::COMMON);
        global.set_state(A, Subresource::Index(0), UsageState::COPY_DST);
        global.set_state(B, Subresource::All, UsageState::COMMON);

        let mut local = ResourceUsageTable::new();
        local.set_state(A, Subresource::All, UsageState::SHADER_READ);
        local.set_state(B, Subresource::Index(3), UsageState::UNORDERED_ACCESS);
        global.merge(&local);

        // A's record was replaced as a whole, dropping the stale override.
        assert_eq!(global.find(A), Some(&ResourceRecord::new(UsageState::SHADER_READ)));
        // B only had one subresource touched; the rest keeps its state.
        assert_eq!(global.get_state(B, Subresource::Index(3)), Some(UsageState::UNORDERED_ACCESS));
        assert_eq!(global.get_state(B, Subresource::Index(0)), Some(UsageState::COMMON));
        assert_eq!(global.len(), 2);
    }

    #[test]
    fn redundant_transitions_are_elided() {
        let mut tracker = CommandBufferStateTracker::new();
        tracker.request_transition(A, Subresource::All, UsageState::COPY_DST);
        tracker.request_transition(A, Subresource::All, UsageState::SHADER_READ);
        tracker.request_transition(A, Subresource::All, UsageState::SHADER_READ);
        assert_eq!(
            tracker.flush_barriers(),
            vec![transition(A, Subresource::All, UsageState::COPY_DST, UsageState::SHADER_READ)]
        );
        tracker.request_transition(A, Subresource::All, UsageState::SHADER_READ);
        assert!(!tracker.has_pending_barriers());
        assert_eq!(tracker.pending_transitions().len(), 1);
    }

    #[test]
    fn all_subresource_request_expands_over_overrides() {
        let mut tracker = CommandBufferStateTracker::new();
        tracker.request_transition(A, Subresource::All, UsageState::COPY_DST);
        tracker.request_transition(A, Subresource::Index(0), UsageState::COPY_SRC);
        tracker.request_transition(A, Subresource::Index(1), UsageState::SHADER_READ);
        tracker.flush_barriers();

        tracker.request_transition(A, Subresource::All, UsageState::SHADER_READ);
        // The overrides rejoin the rest of the resource before it moves as a whole.
        assert_eq!(
            tracker.flush_barriers(),
            vec![
                transition(A, Subresource::Index(0), UsageState::COPY_SRC, UsageState::COPY_DST),
                transition(A, Subresource::Index(1), UsageState::SHADER_READ, UsageState::COPY_DST),
                transition(A, Subresource::All, UsageState::COPY_DST, UsageState::SHADER_READ),
            ]
        );
        let record = tracker.local_states().find(A).unwrap();
        assert!(!record.has_overrides());
        assert_eq!(record.whole_state(), Some(UsageState::SHADER_READ));
    }

    #[test]
    fn unseen_subresource_stays_pending() {
        let mut tracker = CommandBufferStateTracker::new();
        tracker.request_transition(A, Subresource::Index(0), UsageState::COPY_DST);
        tracker.request_transition(A, Subresource::Index(1), UsageState::COPY_DST);
        tracker.request_transition(A, Subresource::Index(0), UsageState::SHADER_READ);
        assert_eq!(tracker.pending_transitions().len(), 2);
        assert_eq!(
            tracker.flush_barriers(),
            vec![transition(A, Subresource::Index(0), UsageState::COPY_DST, UsageState::SHADER_READ)]
        );
    }

    #[test]
    fn pending_transition_resolves_against_global_state() {
        let mut global = ResourceUsageTable::new();
        global.set_state(A, Subresource::All, UsageState::COMMON);

        let mut tracker = CommandBufferStateTracker::new();
        tracker.request_transition(A, Subresource::All, UsageState::COPY_DST);
        tracker.request_transition(B, Subresource::All, UsageState::COPY_SRC);
        assert!(!tracker.has_pending_barriers());

        let resolved = tracker.resolve_pending(&global);
        // B is unknown to the global table and therefore skipped.
        assert_eq!(
            resolved,
            vec![transition(A, Subresource::All, UsageState::COMMON, UsageState::COPY_DST)]
        );

        tracker.commit_final_states(&mut global);
        assert_eq!(global.get_state(A, Subresource::All), Some(UsageState::COPY_DST));
        assert_eq!(global.get_state(B, Subresource::All), Some(UsageState::COPY_SRC));
    }

    #[test]
    fn pending_all_expands_over_global_overrides() {
        let mut global = ResourceUsageTable::new();
        global.set_state(A, Subresource::All, UsageState::SHADER_READ);
        global.set_state(A, Subresource::Index(0), UsageState::RENDER_TARGET);
        global.set_state(A, Subresource::Index(1), UsageState::SHADER_READ);

        let mut tracker = CommandBufferStateTracker::new();
        tracker.request_transition(A, Subresource::All, UsageState::SHADER_READ);
        assert_eq!(
            tracker.resolve_pending(&global),
            vec![transition(A, Subresource::Index(0), UsageState::RENDER_TARGET, UsageState::SHADER_READ)]
        );
    }

    #[test]
    fn all_request_matching_the_whole_state_only_moves_overrides() {
        let mut tracker = CommandBufferStateTracker::new();
        tracker.request_transition(A, Subresource::All, UsageState::SHADER_READ);
        tracker.request_transition(A, Subresource::Index(2), UsageState::RENDER_TARGET);
        tracker.flush_barriers();

        tracker.request_transition(A, Subresource::All, UsageState::SHADER_READ);
        assert_eq!(
            tracker.flush_barriers(),
            vec![transition(A, Subresource::Index(2), UsageState::RENDER_TARGET, UsageState::SHADER_READ)]
        );
    }

    #[test]
    fn pending_all_moves_subresources_without_overrides() {
        let mut global = ResourceUsageTable::new();
        global.set_state(A, Subresource::All, UsageState::COMMON);
        global.set_state(A, Subresource::Index(0), UsageState::RENDER_TARGET);

        let mut tracker = CommandBufferStateTracker::new();
        tracker.request_transition(A, Subresource::All, UsageState::COPY_DST);
        assert_eq!(
            tracker.resolve_pending(&global),
            vec![
                transition(A, Subresource::Index(0), UsageState::RENDER_TARGET, UsageState::COMMON),
                transition(A, Subresource::All, UsageState::COMMON, UsageState::COPY_DST),
            ]
        );
        tracker.commit_final_states(&mut global);
        assert_eq!(global.get_state(A, Subresource::Index(1)), Some(UsageState::COPY_DST));
    }

    #[test]
    fn all_request_after_touching_one_subresource_defers_the_rest() {
        let mut global = ResourceUsageTable::new();
        global.set_state(A, Subresource::All, UsageState::COMMON);

        let mut tracker = CommandBufferStateTracker::new();
        tracker.request_transition(B, Subresource::All, UsageState::COPY_SRC);
        tracker.request_transition(A, Subresource::Index(0), UsageState::COPY_DST);
        tracker.request_transition(A, Subresource::All, UsageState::SHADER_READ);

        // Only subresource 0 is known locally.
        assert_eq!(
            tracker.flush_barriers(),
            vec![transition(A, Subresource::Index(0), UsageState::COPY_DST, UsageState::SHADER_READ)]
        );
        assert_eq!(
            tracker.pending_transitions(),
            &[
                PendingTransition {
                    resource: B,
                    subresource: Subresource::All,
                    after: UsageState::COPY_SRC,
                },
                PendingTransition {
                    resource: A,
                    subresource: Subresource::All,
                    after: UsageState::SHADER_READ,
                },
                PendingTransition {
                    resource: A,
                    subresource: Subresource::Index(0),
                    after: UsageState::COPY_DST,
                },
            ]
        );

        // The patch moves every subresource to the later state, then hands subresource 0 the
        // state of its first use.
        assert_eq!(
            tracker.resolve_pending(&global),
            vec![
                transition(A, Subresource::All, UsageState::COMMON, UsageState::SHADER_READ),
                transition(A, Subresource::Index(0), UsageState::SHADER_READ, UsageState::COPY_DST),
            ]
        );
        tracker.commit_final_states(&mut global);
        let record = global.find(A).unwrap();
        assert!(!record.has_overrides());
        assert_eq!(record.whole_state(), Some(UsageState::SHADER_READ));
    }

    #[test]
    fn pending_all_over_partially_known_global_record() {
        let mut global = ResourceUsageTable::new();
        global.set_state(A, Subresource::Index(3), UsageState::COPY_DST);

        let mut tracker = CommandBufferStateTracker::new();
        tracker.request_transition(A, Subresource::Index(5), UsageState::RENDER_TARGET);
        tracker.request_transition(A, Subresource::All, UsageState::SHADER_READ);
        // Subresource 5 is unknown to the device, so only subresource 3 needs a barrier.
        assert_eq!(
            tracker.resolve_pending(&global),
            vec![transition(A, Subresource::Index(3), UsageState::COPY_DST, UsageState::SHADER_READ)]
        );
    }

    #[test]
    fn pending_transition_already_in_state_needs_no_barrier() {
        let mut global = ResourceUsageTable::new();
        global.set_state(A, Subresource::All, UsageState::SHADER_READ);
        let mut tracker = CommandBufferStateTracker::new();
        tracker.request_transition(A, Subresource::Index(4), UsageState::SHADER_READ);
        assert!(tracker.resolve_pending(&global).is_empty());
    }

    #[test]
    fn memory_barriers_fold_into_one() {
        let mut tracker = CommandBufferStateTracker::new();
        tracker.memory_barrier(Access::COMPUTE_WRITE, Access::COMPUTE_READ);
        tracker.request_transition(A, Subresource::All, UsageState::COPY_DST);
        tracker.memory_barrier(Access::COPY_WRITE, Access::VERTEX_READ);
        assert_eq!(
            tracker.flush_barriers(),
            vec![Barrier::Memory(MemoryBarrier {
                src: Access::COMPUTE_WRITE | Access::COPY_WRITE,
                dst: Access::COMPUTE_READ | Access::VERTEX_READ,
            })]
        );
    }

    #[test]
    fn reset_forgets_everything() {
        let mut tracker = CommandBufferStateTracker::new();
        tracker.request_transition(A, Subresource::All, UsageState::COPY_DST);
        tracker.request_transition(A, Subresource::All, UsageState::COPY_SRC);
        tracker.reset();
        assert!(tracker.local_states().is_empty());
        assert!(tracker.pending_transitions().is_empty());
        assert!(!tracker.has_pending_barriers());
    }

    #[test]
    fn global_tracker_registration() {
        let global = GlobalStateTracker::new();
        global.register(A, UsageState::COMMON);
        assert_eq!(global.state(A, Subresource::Index(9)), Some(UsageState::COMMON));
        assert!(global.unregister(A).is_some());
        assert_eq!(global.state(A, Subresource::All), None);
    }

    #[test]
    fn vulkan_barrier_conversion() {
        let barrier = TransitionBarrier {
            resource: A,
            subresource: Subresource::from_mip_layer(2, 3, 4).unwrap(),
            before: UsageState::COPY_DST,
            after: UsageState::SHADER_READ,
        };
        let image = barrier.image_barrier(vk::Image::null(), vk::ImageAspectFlags::COLOR, 4);
        assert_eq!(image.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(image.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(image.subresource_range.base_mip_level, 2);
        assert_eq!(image.subresource_range.base_array_layer, 3);
        assert_eq!(image.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);

        let buffer = TransitionBarrier {
            subresource: Subresource::All,
            before: UsageState::COPY_DST,
            after: UsageState::VERTEX_BUFFER,
            ..barrier
        }
        .buffer_barrier(vk::Buffer::null());
        assert_eq!(buffer.size, vk::WHOLE_SIZE);
        assert_eq!(buffer.dst_stage_mask, vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT);

        let memory = MemoryBarrier {
            src: Access::COMPUTE_WRITE,
            dst: Access::COMPUTE_READ,
        }
        .to_vk();
        assert_eq!(memory.dst_access_mask, vk::AccessFlags2::SHADER_STORAGE_READ);
    }

    #[test]
    fn subresource_numbering_does_not_overflow() {
        assert_eq!(Subresource::from_mip_layer(1, 2, 10), Some(Subresource::Index(21)));
        assert_eq!(Subresource::from_mip_layer(0, u32::MAX, 2), None);
        assert_eq!(Subresource::from_mip_layer(1, u32::MAX, 1), None);
    }

    #[test]
    #[should_panic(expected = "image has no mip levels")]
    fn image_barrier_needs_mip_levels() {
        TransitionBarrier {
            resource: A,
            subresource: Subresource::Index(1),
            before: UsageState::COPY_DST,
            after: UsageState::SHADER_READ,
        }
        .image_barrier(vk::Image::null(), vk::ImageAspectFlags::COLOR, 0);
    }

    #[test]
    fn resource_ids_from_vulkan_handles() {
        let image = vk::Image::from_raw(0xdead);
        assert_eq!(ResourceId::from(image), ResourceId::from_raw(0xdead));
        assert_eq!(ResourceId::from(vk::Buffer::from_raw(5)).as_raw(), 5);
    }
}

//! Recycling of command stream storage.
//!
//! A [`CommandAllocator`] may only be reused once the hardware has finished executing the
//! commands stored in it. The [`CommandAllocatorPool`] keeps retired allocators in retirement
//! order, each tagged with the completion counter value that marks the end of its execution.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use super::Command;

/// Backing storage for one command stream.
///
/// Resetting an allocator keeps its capacity, so a recycled allocator records without
/// reallocating.
#[derive(Debug)]
pub struct CommandAllocator {
    id: u64,
    stream: Vec<Command>,
}

impl CommandAllocator {
    fn new(id: u64) -> Self {
        Self {
            id,
            stream: Vec::new(),
        }
    }

    /// Stable identity of this allocator, unique within its pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn commands(&self) -> &[Command] {
        &self.stream
    }

    pub(crate) fn push(&mut self, command: Command) {
        self.stream.push(command);
    }

    pub fn reset(&mut self) {
        self.stream.clear();
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    /// Retired allocators, oldest first. Retire values never decrease on a single queue.
    ready: VecDeque<(u64, CommandAllocator)>,
    created: u64,
}

/// A FIFO of retired command allocators, safe to share between recording threads.
#[derive(Debug, Default)]
pub struct CommandAllocatorPool {
    inner: Mutex<PoolInner>,
}

impl CommandAllocatorPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands out an allocator that is no longer in use by the hardware.
    ///
    /// `completed_value` is the queue's current completed counter value. The oldest retired
    /// allocator is reused if its retire value has been reached, otherwise a new allocator is
    /// created.
    pub fn request(&self, completed_value: u64) -> CommandAllocator {
        let mut inner = self.lock();
        if let Some(&(retired_at, _)) = inner.ready.front()
            && retired_at <= completed_value
            && let Some((_, mut allocator)) = inner.ready.pop_front()
        {
            allocator.reset();
            return allocator;
        }
        let id = inner.created;
        inner.created += 1;
        tracing::trace!(id, "creating command allocator");
        CommandAllocator::new(id)
    }

    /// Returns `allocator` to the pool. It becomes reusable once the completed counter reaches
    /// `expected_value`.
    pub fn retire(&self, expected_value: u64, allocator: CommandAllocator) {
        self.lock().ready.push_back((expected_value, allocator));
    }

    /// Number of allocators this pool has ever created.
    pub fn allocators_created(&self) -> u64 {
        self.lock().created
    }

    /// Number of retired allocators waiting for reuse.
    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuse_waits_for_completion() {
        let pool = CommandAllocatorPool::new();
        let first = pool.request(0);
        let first_id = first.id();
        pool.retire(5, first);

        // Not done yet: a new allocator is created instead.
        let second = pool.request(4);
        assert_ne!(second.id(), first_id);
        assert_eq!(pool.allocators_created(), 2);
        assert_eq!(pool.ready_len(), 1);

        let reused = pool.request(5);
        assert_eq!(reused.id(), first_id);
        assert_eq!(pool.ready_len(), 0);
        assert_eq!(pool.allocators_created(), 2);
        drop(second);
    }

    #[test]
    fn only_the_oldest_allocator_is_considered() {
        let pool = CommandAllocatorPool::new();
        let a = pool.request(0);
        let b = pool.request(0);
        let (a_id, b_id) = (a.id(), b.id());
        pool.retire(1, a);
        pool.retire(2, b);

        assert_eq!(pool.request(2).id(), a_id);
        assert_eq!(pool.request(2).id(), b_id);
        assert_eq!(pool.allocators_created(), 2);
    }

    #[test]
    fn recycled_allocators_are_empty_but_keep_capacity() {
        let pool = CommandAllocatorPool::new();
        let mut allocator = pool.request(0);
        for _ in 0..32 {
            allocator.push(Command::Dispatch {
                group_count_x: 1,
                group_count_y: 1,
                group_count_z: 1,
            });
        }
        let capacity = allocator.stream.capacity();
        pool.retire(1, allocator);
        let allocator = pool.request(1);
        assert!(allocator.commands().is_empty());
        assert_eq!(allocator.stream.capacity(), capacity);
    }

    #[test]
    fn concurrent_requests_never_hand_out_busy_allocators() {
        let pool = CommandAllocatorPool::new();
        std::thread::scope(|scope| {
            for thread in 0..4u64 {
                let pool = &pool;
                scope.spawn(move || {
                    for round in 0..100u64 {
                        let value = thread * 1000 + round;
                        let allocator = pool.request(value);
                        // Retired at a value no completed counter reaches.
                        pool.retire(u64::MAX, allocator);
                    }
                });
            }
        });
        // Nothing was ever completed, so every request created a fresh allocator.
        assert_eq!(pool.allocators_created(), 400);
        assert_eq!(pool.ready_len(), 400);
    }
}

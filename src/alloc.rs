//! Sub-allocation of linear pools.
//!
//! This module provides the [`FreeSpaceAllocator`], which carves variable-sized ranges out of one
//! fixed-size linear pool (the bytes of a large buffer, or the slots of a descriptor heap), and
//! [`RetiredRanges`], which holds freed ranges back until the GPU is done with them.
//!
//! # Overview
//!
//! The allocator only does bookkeeping over offsets. It never touches the memory it describes,
//! so the same type serves for byte ranges and descriptor ranges alike.
//!
//! - Allocation is best-fit: the smallest free block that can hold the request is split.
//! - Freeing coalesces the range with its free neighbours, so fragmentation heals as ranges
//!   come back.
//! - Allocation fails (returns `None`) when the pool is exhausted *or* too fragmented to hold
//!   the request in one block. Both are expected outcomes, not errors.
//!
//! ```
//! use scoria::alloc::FreeSpaceAllocator;
//!
//! let mut pool = FreeSpaceAllocator::new(1024);
//! let a = pool.allocate(256).unwrap();
//! let b = pool.allocate(256).unwrap();
//! assert_eq!((a.offset, b.offset), (0, 256));
//!
//! pool.free(a.offset, a.size);
//! pool.free(b.offset, b.size);
//! assert_eq!(pool.current_available(), 1024);
//! assert_eq!(pool.free_block_count(), 1);
//! ```
//!
//! # Thread Safety
//!
//! Every mutating method takes `&mut self`. Share an allocator between threads by putting it
//! behind the same lock that guards the resource it describes.

use std::collections::{BTreeMap, VecDeque};

use crate::utils::IdAlloc;

/// A range handed out by [`FreeSpaceAllocator::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    pub offset: u64,
    pub size: u64,
}

impl Allocation {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Arena record for one free block.
///
/// The record doubles as the key of both index entries: `offset` for the offset index and
/// `(size, offset)` for the size index.
#[derive(Debug, Clone, Copy)]
struct FreeBlock {
    offset: u64,
    size: u64,
}

impl FreeBlock {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
    fn size_key(&self) -> (u64, u64) {
        (self.size, self.offset)
    }
}

/// Variable-size allocator over the offsets `[0, capacity)` of one linear pool.
///
/// Free blocks live in an arena and are reachable through two ordered indices:
/// - by offset, to find the neighbours of a range being freed;
/// - by `(size, offset)`, to find the best fit in *O*(log *n*).
///
/// Both indices always hold exactly the same blocks.
///
/// When several free blocks share the smallest size that fits a request, the one with the
/// lowest offset is used.
#[derive(Debug, Clone)]
pub struct FreeSpaceAllocator {
    capacity: u64,
    available: u64,

    /// Free block records, indexed by slot id.
    blocks: Vec<FreeBlock>,
    slots: IdAlloc,

    by_offset: BTreeMap<u64, u32>,
    by_size: BTreeMap<(u64, u64), u32>,
}

impl FreeSpaceAllocator {
    /// Creates an allocator whose whole pool of `capacity` units is free.
    pub fn new(capacity: u64) -> Self {
        let mut allocator = Self {
            capacity,
            available: 0,
            blocks: Vec::new(),
            slots: IdAlloc::new(),
            by_offset: BTreeMap::new(),
            by_size: BTreeMap::new(),
        };
        allocator.reset();
        allocator
    }

    /// Size of the pool this allocator manages.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Total free space. Not necessarily available as one contiguous range.
    pub fn current_available(&self) -> u64 {
        self.available
    }

    pub fn free_block_count(&self) -> usize {
        self.by_offset.len()
    }

    /// Size of the largest contiguous free range, or 0 if the pool is full.
    pub fn largest_free_block(&self) -> u64 {
        self.by_size
            .last_key_value()
            .map(|(&(size, _), _)| size)
            .unwrap_or(0)
    }

    /// Iterates the free ranges in offset order.
    pub fn free_blocks(&self) -> impl Iterator<Item = Allocation> + '_ {
        self.by_offset.values().map(|&slot| {
            let block = self.blocks[slot as usize];
            Allocation {
                offset: block.offset,
                size: block.size,
            }
        })
    }

    /// Allocates `size` contiguous units.
    ///
    /// Returns `None` if `size` is zero, exceeds the free space, or if no single free block is
    /// large enough.
    pub fn allocate(&mut self, size: u64) -> Option<Allocation> {
        if size == 0 || size > self.available {
            return None;
        }
        let slot = self
            .by_size
            .range((size, 0)..)
            .next()
            .map(|(_, &slot)| slot)?;
        let block = self.remove_block(slot);
        if block.size > size {
            self.insert_block(FreeBlock {
                offset: block.offset + size,
                size: block.size - size,
            });
        }
        self.available -= size;
        tracing::trace!(
            offset = block.offset,
            size,
            available = self.available,
            "allocated range"
        );
        Some(Allocation {
            offset: block.offset,
            size,
        })
    }

    /// Returns a range to the pool, merging it with adjacent free blocks.
    ///
    /// The range must have come from [`allocate`](Self::allocate) on this allocator and must
    /// not have been freed since. This is only checked in debug builds.
    pub fn free(&mut self, offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        debug_assert!(
            offset
                .checked_add(size)
                .is_some_and(|end| end <= self.capacity),
            "range {offset}+{size} lies outside of the pool"
        );
        let mut merged = FreeBlock { offset, size };

        let prev = self
            .by_offset
            .range(..offset)
            .next_back()
            .map(|(_, &slot)| slot);
        if let Some(slot) = prev {
            let prev = self.blocks[slot as usize];
            debug_assert!(
                prev.end() <= offset,
                "range {offset}+{size} overlaps a free block, was it freed twice?"
            );
            if prev.end() == offset {
                self.remove_block(slot);
                merged.offset = prev.offset;
                merged.size += prev.size;
            }
        }

        let next = self
            .by_offset
            .range(offset..)
            .next()
            .map(|(_, &slot)| slot);
        if let Some(slot) = next {
            let next = self.blocks[slot as usize];
            debug_assert!(
                next.offset >= offset + size,
                "range {offset}+{size} overlaps a free block, was it freed twice?"
            );
            if next.offset == merged.end() {
                self.remove_block(slot);
                merged.size += next.size;
            }
        }

        self.insert_block(merged);
        self.available += size;
        tracing::trace!(
            offset,
            size,
            merged_offset = merged.offset,
            merged_size = merged.size,
            "freed range"
        );
    }

    /// Forgets every allocation. The whole pool becomes one free block again.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.slots.clear();
        self.by_offset.clear();
        self.by_size.clear();
        self.available = self.capacity;
        if self.capacity > 0 {
            self.insert_block(FreeBlock {
                offset: 0,
                size: self.capacity,
            });
        }
    }

    fn insert_block(&mut self, block: FreeBlock) {
        let slot = self.slots.alloc_one();
        if slot as usize == self.blocks.len() {
            self.blocks.push(block);
        } else {
            self.blocks[slot as usize] = block;
        }
        let replaced = self.by_offset.insert(block.offset, slot);
        debug_assert!(replaced.is_none());
        self.by_size.insert(block.size_key(), slot);
    }

    fn remove_block(&mut self, slot: u32) -> FreeBlock {
        let block = self.blocks[slot as usize];
        self.by_offset.remove(&block.offset);
        self.by_size.remove(&block.size_key());
        self.slots.free(slot);
        block
    }
}

/// Freed ranges waiting for the GPU to stop using them.
///
/// A range can only be handed out again once the completion counter covering its last GPU use
/// has been reached. Retire ranges with that counter value, then periodically call
/// [`release_completed`](Self::release_completed) with the queue's completed value.
///
/// Ranges are released in the order they were retired. Retire with non-decreasing counter
/// values (values from one queue always are).
///
/// ```
/// use scoria::alloc::{FreeSpaceAllocator, RetiredRanges};
///
/// let mut pool = FreeSpaceAllocator::new(64);
/// let mut retired = RetiredRanges::new();
///
/// let range = pool.allocate(64).unwrap();
/// // ... GPU work using `range` is covered by counter value 3 ...
/// retired.retire(range, 3);
///
/// assert_eq!(retired.release_completed(2, &mut pool), 0);
/// assert_eq!(pool.current_available(), 0);
/// assert_eq!(retired.release_completed(3, &mut pool), 1);
/// assert_eq!(pool.current_available(), 64);
/// ```
#[derive(Debug, Default)]
pub struct RetiredRanges {
    queue: VecDeque<(u64, Allocation)>,
    pending_bytes: u64,
}

impl RetiredRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `allocation` to be freed once the completion counter reaches `fence_value`.
    pub fn retire(&mut self, allocation: Allocation, fence_value: u64) {
        self.pending_bytes += allocation.size;
        self.queue.push_back((fence_value, allocation));
    }

    /// Frees every queued range whose counter value is at most `completed_value`.
    ///
    /// Returns the number of ranges released.
    pub fn release_completed(
        &mut self,
        completed_value: u64,
        allocator: &mut FreeSpaceAllocator,
    ) -> usize {
        let mut released = 0;
        while let Some(&(value, allocation)) = self.queue.front() {
            if value > completed_value {
                break;
            }
            self.queue.pop_front();
            allocator.free(allocation.offset, allocation.size);
            self.pending_bytes -= allocation.size;
            released += 1;
        }
        released
    }

    /// Units held back from the allocator.
    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

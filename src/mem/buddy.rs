//! Implementation of a Buddy Allocator that is responsible for allocating
//! physical frames, that will then be used by either the heap
//! or directly by the kernel.
//!
//! Every physical frame is described by a record inside one array that is
//! allocated once. Free blocks are kept in one list per order, where a block
//! of order `k` spans `2^k` frames and is represented by the record of its
//! first frame.

use super::{
    list::{ListNode, Links},
    AllocStats, Error, Result, FRAME_SIZE,
};
use alloc::vec::Vec;

/// The number of orders inside the buddy allocator.
///
/// Orders go from `0` to `MAX_ORDER - 1`, so the largest block
/// spans `1024` frames.
pub const MAX_ORDER: usize = 11;

/// Calculates the number of frames inside a block of the given order.
pub const fn frames_for_order(order: usize) -> usize {
    1 << order
}

/// Calculates the size in bytes for the given order.
pub const fn size_for_order(order: usize) -> usize {
    frames_for_order(order) * FRAME_SIZE
}

/// Calculates the first order where the given `size` would fit in.
///
/// This function may return an order that is larger or equal to [`MAX_ORDER`].
pub fn order_for_size(size: usize) -> usize {
    let frames = (size.max(1) + FRAME_SIZE - 1) / FRAME_SIZE;
    frames.next_power_of_two().trailing_zeros() as usize
}

/// The state of a single frame record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The frame is part of a free block.
    Free,
    /// The frame is part of a block that was handed out.
    Allocated,
}

/// Handle to the first frame of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(usize);

impl Frame {
    /// The index of this frame inside the frame array.
    pub fn index(self) -> usize {
        self.0
    }

    /// The frame that differs from this one only in the bit for `order`.
    fn buddy(self, order: usize) -> Frame {
        Frame(self.0 ^ frames_for_order(order))
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameRecord {
    node: ListNode,
    order: u8,
    status: FrameStatus,
}

/// The frame array together with one list head per order.
///
/// Index `0..MAX_ORDER` are the list heads, the node of
/// frame `n` lives at index `MAX_ORDER + n`.
struct FreeLists {
    heads: [ListNode; MAX_ORDER],
    frames: Vec<FrameRecord>,
}

impl FreeLists {
    fn node_of(frame: Frame) -> usize {
        MAX_ORDER + frame.0
    }

    fn frame_of(node: usize) -> Frame {
        Frame(node - MAX_ORDER)
    }
}

impl Links for FreeLists {
    fn node(&self, at: usize) -> &ListNode {
        match at.checked_sub(MAX_ORDER) {
            Some(frame) => &self.frames[frame].node,
            None => &self.heads[at],
        }
    }

    fn node_mut(&mut self, at: usize) -> &mut ListNode {
        match at.checked_sub(MAX_ORDER) {
            Some(frame) => &mut self.frames[frame].node,
            None => &mut self.heads[at],
        }
    }
}

/// The central structure that is responsible for allocating
/// physical frames using the buddy allocation algorithm.
pub struct FrameAllocator {
    lists: FreeLists,
    free_count: [usize; MAX_ORDER],
    base: usize,
}

impl FrameAllocator {
    /// Create an allocator that manages `frame_count` frames, where the first
    /// frame is located at physical address `0`.
    pub fn new(frame_count: usize) -> Self {
        let mut this = Self {
            lists: FreeLists {
                heads: core::array::from_fn(ListNode::standalone),
                frames: (0..frame_count)
                    .map(|idx| FrameRecord {
                        node: ListNode::standalone(FreeLists::node_of(Frame(idx))),
                        order: 0,
                        status: FrameStatus::Free,
                    })
                    .collect(),
            },
            free_count: [0; MAX_ORDER],
            base: 0,
        };

        // split the frame count into the largest power-of-two groups
        let mut start = 0;
        for order in (0..MAX_ORDER).rev() {
            while frame_count - start >= frames_for_order(order) {
                log::debug!(
                    "Adding frames {}..{} as order {} block",
                    start,
                    start + frames_for_order(order),
                    order
                );

                this.push_free(Frame(start), order);
                start += frames_for_order(order);
            }
        }

        this
    }

    /// Create an allocator that manages `frame_count` frames, where the first
    /// frame is located at physical address `base`.
    ///
    /// `base` must be aligned to the [frame size](FRAME_SIZE).
    pub fn with_base(base: usize, frame_count: usize) -> Result<Self> {
        if base % FRAME_SIZE != 0 {
            return Err(Error::InvalidConfig);
        }

        let end = frame_count
            .checked_mul(FRAME_SIZE)
            .and_then(|size| size.checked_add(base));
        if end.is_none() {
            return Err(Error::InvalidConfig);
        }

        let mut this = Self::new(frame_count);
        this.base = base;
        Ok(this)
    }

    /// The number of frames managed by this allocator.
    pub fn frame_count(&self) -> usize {
        self.lists.frames.len()
    }

    /// The number of free blocks with the given order.
    pub fn free_count(&self, order: usize) -> usize {
        self.free_count[order]
    }

    /// Allocates a block of frames that has the given order.
    ///
    /// The size for returned block can be calculated using [`size_for_order`].
    pub fn allocate(&mut self, order: usize) -> Result<Frame> {
        if order >= MAX_ORDER {
            return Err(Error::OrderTooLarge);
        }

        // find the smallest order that has a free block
        let found = (order..MAX_ORDER)
            .find(|&order| self.free_count[order] > 0)
            .ok_or(Error::NoMemoryAvailable)?;
        let block = self.pop_free(found).ok_or(Error::NoMemoryAvailable)?;

        {
            let record = &mut self.lists.frames[block.0];
            record.status = FrameStatus::Allocated;
            record.order = order as u8;
        }

        // split the block until it has the requested order.
        //
        // the addresses of two buddies only differ in one bit, so every
        // split returns the upper half of the current block to the free lists.
        for split in (order..found).rev() {
            self.push_free(block.buddy(split), split);
        }

        #[cfg(feature = "logging")]
        log::trace!("Allocated frame {} with order {}", block.0, order);

        Ok(block)
    }

    /// Allocates the smallest block that contains at least `count` contiguous frames.
    pub fn allocate_pages(&mut self, count: usize) -> Result<Frame> {
        if count == 0 {
            return Err(Error::ZeroSize);
        }

        let order = count.next_power_of_two().trailing_zeros() as usize;
        self.allocate(order)
    }

    /// Returns the block starting at `frame` to this allocator.
    ///
    /// The block is merged with its buddy as long as the buddy is free too.
    pub fn free(&mut self, frame: Frame) -> Result<()> {
        let record = match self.lists.frames.get(frame.0) {
            Some(record) if record.status == FrameStatus::Allocated => *record,
            _ => {
                log::error!("Tried to free invalid frame {}", frame.0);
                return Err(Error::InvalidFrame);
            }
        };

        // if this frame ends up inside a larger block, its record must not
        // look allocated anymore, so a second free of it is rejected.
        self.lists.frames[frame.0].status = FrameStatus::Free;

        let mut block = frame;
        let mut order = record.order as usize;

        while order < MAX_ORDER - 1 {
            let buddy = block.buddy(order);
            if !self.is_free_block(buddy, order) {
                break;
            }

            // the buddy is free, so take it off its list and
            // continue with the merged block
            self.lists.remove(FreeLists::node_of(buddy));
            self.free_count[order] -= 1;
            block = block.min(buddy);
            order += 1;
        }

        self.push_free(block, order);

        #[cfg(feature = "logging")]
        log::trace!("Freed frame {} as order {} block", frame.0, order);

        debug_assert!(
            order == MAX_ORDER - 1 || !self.is_free_block(block.buddy(order), order),
            "missed merge of frame {} with its buddy",
            block.0
        );
        Ok(())
    }

    /// Returns the physical address of the given frame.
    pub fn address_of(&self, frame: Frame) -> usize {
        self.base + frame.0 * FRAME_SIZE
    }

    /// Returns the frame that starts at the given physical address.
    pub fn frame_at(&self, addr: usize) -> Option<Frame> {
        let offset = addr.checked_sub(self.base)?;
        if offset % FRAME_SIZE != 0 {
            return None;
        }

        let idx = offset / FRAME_SIZE;
        (idx < self.frame_count()).then(|| Frame(idx))
    }

    /// The number of bytes that are available for allocation.
    pub fn free_memory_size(&self) -> usize {
        self.free_count
            .iter()
            .enumerate()
            .map(|(order, count)| count * size_for_order(order))
            .sum()
    }

    /// The number of bytes managed by this allocator.
    pub fn total_memory_size(&self) -> usize {
        self.frame_count() * FRAME_SIZE
    }

    /// The number of bytes that are currently handed out.
    pub fn allocated_memory_size(&self) -> usize {
        self.total_memory_size() - self.free_memory_size()
    }

    /// Return the statistics for this allocator.
    pub fn stats(&self) -> AllocStats {
        AllocStats {
            allocated: self.allocated_memory_size(),
            free: self.free_memory_size(),
            total: self.total_memory_size(),
            ..AllocStats::with_name("Buddy Allocator")
        }
    }

    /// Walk every free list and check the invariants of the allocator.
    pub fn verify(&self) -> core::result::Result<(), &'static str> {
        let mut free_frames = 0;

        for order in 0..MAX_ORDER {
            let mut len = 0;
            for node in self.lists.iter(order) {
                let block = FreeLists::frame_of(node);
                let record = &self.lists.frames[block.0];

                if record.status != FrameStatus::Free || record.order as usize != order {
                    return Err("block on free list has wrong status or order");
                }
                if block.0 % frames_for_order(order) != 0 {
                    return Err("block is not aligned to its order");
                }
                if block.0 + frames_for_order(order) > self.frame_count() {
                    return Err("block exceeds frame array");
                }
                if order < MAX_ORDER - 1 && self.is_free_block(block.buddy(order), order) {
                    return Err("two free buddies were not merged");
                }

                len += 1;
            }

            if len != self.free_count[order] {
                return Err("free count does not match free list length");
            }
            free_frames += len * frames_for_order(order);
        }

        if free_frames * FRAME_SIZE != self.free_memory_size() {
            return Err("free frames do not add up");
        }
        Ok(())
    }

    /// Check if `frame` is the first frame of a free block with the given order.
    fn is_free_block(&self, frame: Frame, order: usize) -> bool {
        self.lists
            .frames
            .get(frame.0)
            .map_or(false, |record| {
                record.status == FrameStatus::Free && record.order as usize == order
            })
    }

    fn push_free(&mut self, frame: Frame, order: usize) {
        let record = &mut self.lists.frames[frame.0];
        record.status = FrameStatus::Free;
        record.order = order as u8;

        self.lists.insert_after(order, FreeLists::node_of(frame));
        self.free_count[order] += 1;
    }

    fn pop_free(&mut self, order: usize) -> Option<Frame> {
        let node = self.lists.first(order)?;
        self.lists.remove(node);
        self.free_count[order] -= 1;
        Some(FreeLists::frame_of(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_counts(alloc: &FrameAllocator) -> [usize; MAX_ORDER] {
        core::array::from_fn(|order| alloc.free_count(order))
    }

    #[test]
    fn order_helpers() {
        assert_eq!(size_for_order(0), FRAME_SIZE);
        assert_eq!(size_for_order(3), 8 * FRAME_SIZE);
        assert_eq!(order_for_size(1), 0);
        assert_eq!(order_for_size(FRAME_SIZE), 0);
        assert_eq!(order_for_size(FRAME_SIZE + 1), 1);
        assert_eq!(order_for_size(5 * FRAME_SIZE), 3);
    }

    #[test]
    fn single_frame_pool() {
        let mut alloc = FrameAllocator::new(1);
        assert_eq!(alloc.free_count(0), 1);

        let frame = alloc.allocate(0).unwrap();
        assert_eq!(alloc.allocate(0), Err(Error::NoMemoryAvailable));
        assert_eq!(alloc.free_memory_size(), 0);

        alloc.free(frame).unwrap();
        assert_eq!(alloc.free_count(0), 1);
        assert_eq!(alloc.free_memory_size(), FRAME_SIZE);
        alloc.verify().unwrap();
    }

    #[test]
    fn init_uses_binary_decomposition() {
        let alloc = FrameAllocator::new(3);
        assert_eq!(alloc.free_count(1), 1);
        assert_eq!(alloc.free_count(0), 1);
        assert_eq!(alloc.free_memory_size(), 3 * FRAME_SIZE);
        assert_eq!(alloc.allocated_memory_size(), 0);
        alloc.verify().unwrap();

        // more frames than the largest order can hold
        let alloc = FrameAllocator::new(2 * 1024 + 5);
        assert_eq!(alloc.free_count(MAX_ORDER - 1), 2);
        assert_eq!(alloc.free_count(2), 1);
        assert_eq!(alloc.free_count(0), 1);
        assert_eq!(alloc.free_memory_size(), (2 * 1024 + 5) * FRAME_SIZE);
        alloc.verify().unwrap();
    }

    #[test]
    fn empty_pool() {
        let mut alloc = FrameAllocator::new(0);
        assert_eq!(alloc.allocate(0), Err(Error::NoMemoryAvailable));
        assert_eq!(alloc.total_memory_size(), 0);
        alloc.verify().unwrap();
    }

    #[test]
    fn rejects_too_large_order() {
        let mut alloc = FrameAllocator::new(8);
        assert_eq!(alloc.allocate(MAX_ORDER), Err(Error::OrderTooLarge));
        assert_eq!(alloc.free_count(3), 1);
    }

    #[test]
    fn allocate_splits_and_free_restores() {
        let mut alloc = FrameAllocator::new(16);
        let before = free_counts(&alloc);

        let frame = alloc.allocate(0).unwrap();
        assert_eq!(frame.index(), 0);
        // 16 frames = 8 + 4 + 2 + 1 + the allocated one
        assert_eq!(&free_counts(&alloc)[..5], &[1, 1, 1, 1, 0]);
        alloc.verify().unwrap();

        alloc.free(frame).unwrap();
        assert_eq!(free_counts(&alloc), before);
        alloc.verify().unwrap();
    }

    #[test]
    fn never_builds_larger_blocks_than_available() {
        // 3 frames can't satisfy an order 2 request
        let mut alloc = FrameAllocator::new(3);
        assert_eq!(alloc.allocate(2), Err(Error::NoMemoryAvailable));

        let frame = alloc.allocate(1).unwrap();
        assert_eq!(alloc.address_of(frame), 0);
        assert_eq!(alloc.allocate(1), Err(Error::NoMemoryAvailable));
        assert!(alloc.allocate(0).is_ok());
    }

    #[test]
    fn merge_happens_in_any_order() {
        let mut alloc = FrameAllocator::new(4);
        let frames = [
            alloc.allocate(0).unwrap(),
            alloc.allocate(0).unwrap(),
            alloc.allocate(0).unwrap(),
            alloc.allocate(0).unwrap(),
        ];
        assert_eq!(alloc.free_memory_size(), 0);

        for &idx in &[2, 0, 3, 1] {
            alloc.free(frames[idx]).unwrap();
            alloc.verify().unwrap();
        }
        assert_eq!(alloc.free_count(2), 1);
        assert_eq!(&free_counts(&alloc)[..2], &[0, 0]);
    }

    #[test]
    fn rejects_double_and_foreign_free() {
        let mut alloc = FrameAllocator::new(4);
        let frame = alloc.allocate(1).unwrap();
        alloc.free(frame).unwrap();

        assert_eq!(alloc.free(frame), Err(Error::InvalidFrame));
        assert_eq!(alloc.free(Frame(100)), Err(Error::InvalidFrame));
        alloc.verify().unwrap();
    }

    #[test]
    fn addresses_respect_base() {
        let base = 0x8020_0000;
        let mut alloc = FrameAllocator::with_base(base, 8).unwrap();
        let frame = alloc.allocate(1).unwrap();
        let second = alloc.allocate(1).unwrap();

        assert_eq!(alloc.address_of(frame), base);
        assert_eq!(alloc.address_of(second), base + 2 * FRAME_SIZE);
        assert_eq!(alloc.frame_at(base + 2 * FRAME_SIZE), Some(second));
        assert_eq!(alloc.frame_at(base + 1), None);
        assert_eq!(alloc.frame_at(base - FRAME_SIZE), None);
        assert_eq!(alloc.frame_at(base + 8 * FRAME_SIZE), None);

        assert_eq!(
            FrameAllocator::with_base(base + 1, 8).err(),
            Some(Error::InvalidConfig)
        );
        assert_eq!(
            FrameAllocator::with_base(base, usize::MAX / FRAME_SIZE).err(),
            Some(Error::InvalidConfig)
        );
        assert!(Error::InvalidConfig.is_invalid_argument());
    }

    #[test]
    fn allocate_pages_rounds_up() {
        let mut alloc = FrameAllocator::new(16);
        assert_eq!(alloc.allocate_pages(0), Err(Error::ZeroSize));

        alloc.allocate_pages(3).unwrap();
        assert_eq!(alloc.allocated_memory_size(), 4 * FRAME_SIZE);
        alloc.allocate_pages(1).unwrap();
        assert_eq!(alloc.allocated_memory_size(), 5 * FRAME_SIZE);
        alloc.verify().unwrap();
    }

    #[test]
    fn stats_report_bytes() {
        let mut alloc = FrameAllocator::new(4);
        alloc.allocate(0).unwrap();

        let stats = alloc.stats();
        assert_eq!(stats.total, 4 * FRAME_SIZE);
        assert_eq!(stats.free, 3 * FRAME_SIZE);
        assert_eq!(stats.allocated, FRAME_SIZE);
    }

    #[test]
    fn random_sequences_keep_invariants() {
        let mut alloc = FrameAllocator::new(300);
        let before = free_counts(&alloc);
        let mut live = Vec::new();
        let mut seed = 0x2545_f491_4f6c_dd1du64;

        for _ in 0..2_000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;

            if seed % 3 != 0 || live.is_empty() {
                if let Ok(frame) = alloc.allocate((seed >> 8) as usize % 5) {
                    live.push(frame);
                }
            } else {
                let idx = (seed >> 16) as usize % live.len();
                alloc.free(live.swap_remove(idx)).unwrap();
            }
        }
        alloc.verify().unwrap();

        for frame in live {
            alloc.free(frame).unwrap();
        }
        alloc.verify().unwrap();
        assert_eq!(free_counts(&alloc), before);
    }
}

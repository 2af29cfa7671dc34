//! Block records of the heap and the free lists they are linked into.

use super::mapping::LIST_COUNT;
use crate::mem::{
    arena::Arena,
    list::{ListNode, Links},
};
use bitflags::bitflags;

/// The header in front of every allocated payload.
///
/// It only stores enough to find the block record again.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(super) struct Tag {
    pub index: usize,
    pub magic: usize,
}

/// Marks a header as belonging to a live allocation.
pub(super) const TAG_MAGIC: usize = 0x5749_4e44_5948_4541;

/// The number of bytes in front of every payload.
pub const HEADER_SIZE: usize = core::mem::size_of::<Tag>();

bitflags! {
    /// State bits stored next to the size of every block.
    pub struct BlockFlags: u8 {
        /// This block is free.
        const FREE = 1 << 0;
        /// The physical predecessor of this block is free.
        const PREV_FREE = 1 << 1;
    }
}

/// Free list membership of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BlockLink {
    /// The block sits on the free list matching its size.
    Free(ListNode),
    /// The block is allocated, or is being worked on and not linked.
    Unlinked,
}

/// A contiguous piece of a heap page.
#[derive(Debug, Clone)]
pub(super) struct Block {
    /// Address of the first byte, where the header lives.
    pub addr: usize,
    /// Size including the header. Zero for the sentinel at the end of a page.
    pub size: usize,
    pub flags: BlockFlags,
    /// The block right before this one in memory.
    pub prev_phys: Option<usize>,
    /// The block right after this one in memory, `None` for the sentinel.
    pub next_phys: Option<usize>,
    /// The page this block belongs to.
    pub page: usize,
    pub link: BlockLink,
}

impl Block {
    pub fn is_free(&self) -> bool {
        self.flags.contains(BlockFlags::FREE)
    }

    pub fn is_prev_free(&self) -> bool {
        self.flags.contains(BlockFlags::PREV_FREE)
    }

    pub fn is_sentinel(&self) -> bool {
        self.size == 0
    }

    pub fn end(&self) -> usize {
        self.addr + self.size
    }
}

/// The free list heads together with every block record.
///
/// Node indices below [`LIST_COUNT`] are list heads, the node
/// of block `n` lives at index `LIST_COUNT + n`.
pub(super) struct Blocks {
    heads: [ListNode; LIST_COUNT],
    pub records: Arena<Block>,
}

impl Blocks {
    pub fn new() -> Self {
        Self {
            heads: core::array::from_fn(ListNode::standalone),
            records: Arena::new(),
        }
    }

    pub fn node_of(block: usize) -> usize {
        LIST_COUNT + block
    }

    pub fn block_of(node: usize) -> usize {
        node - LIST_COUNT
    }
}

impl Links for Blocks {
    fn node(&self, at: usize) -> &ListNode {
        match at.checked_sub(LIST_COUNT) {
            None => &self.heads[at],
            Some(block) => match &self.records[block].link {
                BlockLink::Free(node) => node,
                BlockLink::Unlinked => panic!("block {} is not on a free list", block),
            },
        }
    }

    fn node_mut(&mut self, at: usize) -> &mut ListNode {
        match at.checked_sub(LIST_COUNT) {
            None => &mut self.heads[at],
            Some(block) => match &mut self.records[block].link {
                BlockLink::Free(node) => node,
                BlockLink::Unlinked => panic!("block {} is not on a free list", block),
            },
        }
    }
}

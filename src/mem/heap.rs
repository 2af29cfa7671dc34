//! Kernel heap using two-level segregated free lists.
//!
//! The heap gets its memory page by page from a [`PageSupplier`] and splits
//! every page into blocks. Free blocks are kept in one list per size class,
//! where a two-level bitmap tells which lists are non-empty, so finding a
//! block that is large enough takes constant time.
//!
//! Every block knows its physical neighbours and whether the block before it
//! is free, so freeing a block merges it with free neighbours right away.
//! Two free blocks are never next to each other.

mod block;
pub mod mapping;

pub use block::HEADER_SIZE;
pub use mapping::{BLOCK_ALIGN, MAX_BLOCK_SIZE};

use self::{
    block::{Block, BlockFlags, BlockLink, Blocks, Tag, TAG_MAGIC},
    mapping::{FL_INDEX_COUNT, SL_INDEX_COUNT},
};
use super::{
    align_down, align_up,
    arena::Arena,
    list::{ListNode, Links},
    supplier::{PageSupplier, Region},
    AllocStats, Error, Result, FRAME_SIZE,
};
use crate::unit;
use core::ptr::{self, NonNull};

/// The smallest block that can exist on its own.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + BLOCK_ALIGN;

/// Runtime configuration of a [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// The number of bytes that are requested from the supplier for every new page.
    pub page_size: usize,
    /// If there's no free block of at least this size, a new page is requested
    /// before serving the next allocation.
    pub grow_watermark: usize,
    /// The number of completely free pages that are kept around,
    /// instead of being released to the supplier.
    pub spare_pages: usize,
    /// The largest alignment that can be requested.
    pub max_align: usize,
}

impl HeapConfig {
    /// Check if this configuration can be used for a heap.
    pub fn validate(&self) -> Result<()> {
        let valid = self.page_size >= 2 * MIN_BLOCK_SIZE
            && self.page_size <= MAX_BLOCK_SIZE
            && self.page_size % BLOCK_ALIGN == 0
            && self.grow_watermark > 0
            && mapping::round_up(self.grow_watermark) <= self.page_size
            && self.max_align.is_power_of_two()
            && self.max_align < self.page_size;

        if valid {
            Ok(())
        } else {
            Err(Error::InvalidConfig)
        }
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            page_size: 4 * FRAME_SIZE,
            grow_watermark: FRAME_SIZE,
            spare_pages: 1,
            max_align: FRAME_SIZE,
        }
    }
}

/// A region of memory that was handed to the heap by the supplier.
#[derive(Debug)]
struct Page {
    base: usize,
    size: usize,
    sentinel: usize,
}

/// The heap allocator.
pub struct Heap<S> {
    blocks: Blocks,
    pages: Arena<Page>,
    fl_bitmap: u32,
    sl_bitmap: [u32; FL_INDEX_COUNT],
    total: usize,
    free: usize,
    free_pages: usize,
    config: HeapConfig,
    supplier: S,
}

impl<S: PageSupplier> Heap<S> {
    /// Create a new heap and request the first page from `supplier`.
    pub fn new(supplier: S, config: HeapConfig) -> Result<Self> {
        config.validate()?;

        let mut this = Self {
            blocks: Blocks::new(),
            pages: Arena::new(),
            fl_bitmap: 0,
            sl_bitmap: [0; FL_INDEX_COUNT],
            total: 0,
            free: 0,
            free_pages: 0,
            config,
            supplier,
        };

        this.grow(config.page_size)?;
        Ok(this)
    }

    /// Return the configuration of this heap.
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Return the page supplier of this heap.
    pub fn supplier(&self) -> &S {
        &self.supplier
    }

    /// The number of bytes inside free blocks, including their headers.
    pub fn free_bytes(&self) -> usize {
        self.free
    }

    /// The number of bytes of all pages owned by this heap.
    pub fn total_bytes(&self) -> usize {
        self.total
    }

    /// The number of pages owned by this heap.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Return the statistics for this heap.
    pub fn stats(&self) -> AllocStats {
        AllocStats {
            allocated: self.total - self.free,
            free: self.free,
            total: self.total,
            ..AllocStats::with_name("Heap")
        }
    }

    /// Allocate `size` bytes aligned to [`BLOCK_ALIGN`].
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.allocate_aligned(size, BLOCK_ALIGN)
    }

    /// Allocate `size` bytes, where the returned pointer is aligned to `align`.
    ///
    /// `align` must be a power of two that is not larger than
    /// [`HeapConfig::max_align`]. If the request is invalid,
    /// the heap is not touched at all.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::ZeroSize);
        }
        if !align.is_power_of_two() || align > self.config.max_align {
            return Err(Error::InvalidAlignment);
        }
        let align = align.max(BLOCK_ALIGN);

        // the size of the block that will be handed out
        let need = align_up(size, BLOCK_ALIGN)
            .and_then(|size| size.checked_add(HEADER_SIZE))
            .map(mapping::round_up)
            .filter(|&size| size <= MAX_BLOCK_SIZE)
            .ok_or(Error::NoMemoryAvailable)?;

        // the size of the block that must be found, so there's room
        // to move the payload to the requested alignment
        let search = if align > BLOCK_ALIGN {
            need + align + MIN_BLOCK_SIZE
        } else {
            need
        };
        if search > MAX_BLOCK_SIZE {
            return Err(Error::NoMemoryAvailable);
        }

        self.grow_if_low();

        let block = match self.find_free(search) {
            Some(block) => block,
            None => {
                self.grow(mapping::round_up(search))
                    .map_err(|_| Error::NoMemoryAvailable)?;
                self.find_free(search).ok_or(Error::NoMemoryAvailable)?
            }
        };

        self.remove_free(block);
        if self.spans_page(block) {
            self.free_pages -= 1;
        }

        let block = self.carve(block, need, align);
        self.set_free(block, false);

        let Block { addr, size, .. } = self.blocks.records[block];
        self.free -= size;

        // SAFETY
        // The block lies inside a page that was supplied to us, and the supplier
        // guarantees that the page is valid for writes. Blocks are always aligned
        // to `BLOCK_ALIGN`, which is enough for the tag.
        unsafe {
            ptr::write(
                addr as *mut Tag,
                Tag {
                    index: block,
                    magic: TAG_MAGIC,
                },
            );
        }

        NonNull::new((addr + HEADER_SIZE) as *mut u8).ok_or(Error::NoMemoryAvailable)
    }

    /// Return the allocation at `ptr` to the heap.
    ///
    /// A null pointer is ignored. Double frees and pointers with a
    /// damaged header are detected and rejected.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer that was returned by this heap.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) -> Result<()> {
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => return Ok(()),
        };

        let mut block = self.block_of(ptr)?;
        let addr = self.blocks.records[block].addr;
        ptr::write(
            addr as *mut Tag,
            Tag {
                index: usize::MAX,
                magic: 0,
            },
        );

        self.free += self.blocks.records[block].size;
        self.set_free(block, true);

        // merge with the block after this one
        if let Some(next) = self.blocks.records[block].next_phys {
            let next_block = &self.blocks.records[next];
            if next_block.is_free() && !next_block.is_sentinel() {
                self.remove_free(next);
                self.absorb(block, next);
            }
        }

        // merge with the block before this one
        if self.blocks.records[block].is_prev_free() {
            if let Some(prev) = self.blocks.records[block].prev_phys {
                self.remove_free(prev);
                self.absorb(prev, block);
                block = prev;
            }
        }

        let merged = &self.blocks.records[block];
        assert!(
            !merged.is_prev_free()
                && merged
                    .next_phys
                    .map_or(true, |next| !self.blocks.records[next].is_free()),
            "free block at {:#x} has a free neighbour",
            merged.addr
        );

        self.insert_free(block);

        if self.spans_page(block) {
            self.free_pages += 1;
            if self.free_pages > self.config.spare_pages {
                let page = self.blocks.records[block].page;
                self.release_page(page);
            }
        }

        Ok(())
    }

    /// Return the number of bytes that can be used behind `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a pointer that was returned by this heap.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        let block = self.block_of(ptr)?;
        Ok(self.blocks.records[block].size - HEADER_SIZE)
    }

    /// Release every page back to the supplier and return the supplier.
    ///
    /// All pointers handed out by this heap become dangling.
    pub fn destruct(self) -> S {
        let Heap {
            pages,
            mut supplier,
            ..
        } = self;

        for (_, page) in pages.iter() {
            log::debug!("Releasing heap page at {:#x}", page.base);
            supplier.release(page.base);
        }

        supplier
    }

    /// Walk every page and every free list and check the invariants of the heap.
    pub fn verify(&self) -> core::result::Result<(), &'static str> {
        let records = &self.blocks.records;
        let mut free = 0;
        let mut free_blocks = 0;
        let mut total = 0;
        let mut free_pages = 0;

        for (page_idx, page) in self.pages.iter() {
            total += page.size;

            let mut prev: Option<usize> = None;
            let mut addr = page.base;
            let mut cur = Some(self.first_block(page_idx));

            while let Some(idx) = cur {
                let block = records.get(idx).ok_or("physical chain points to vacant record")?;

                if block.page != page_idx {
                    return Err("block belongs to a different page");
                }
                if block.addr != addr {
                    return Err("blocks are not contiguous");
                }
                if block.prev_phys != prev {
                    return Err("broken back-reference to physical predecessor");
                }

                let prev_free = prev.map_or(false, |prev| records[prev].is_free());
                if block.is_prev_free() != prev_free {
                    return Err("predecessor free flag is out of sync");
                }

                if block.is_sentinel() {
                    if idx != page.sentinel || block.next_phys.is_some() || block.is_free() {
                        return Err("invalid sentinel block");
                    }
                } else {
                    if block.size < MIN_BLOCK_SIZE || block.size % BLOCK_ALIGN != 0 {
                        return Err("invalid block size");
                    }
                    if block.is_free() {
                        if prev_free {
                            return Err("two adjacent free blocks");
                        }
                        if !matches!(block.link, BlockLink::Free(_)) {
                            return Err("free block is not linked");
                        }

                        free += block.size;
                        free_blocks += 1;
                        if prev.is_none() && block.size == page.size {
                            free_pages += 1;
                        }
                    } else if block.link != BlockLink::Unlinked {
                        return Err("allocated block is linked");
                    }
                }

                addr = block.end();
                prev = Some(idx);
                cur = block.next_phys;
            }

            if prev != Some(page.sentinel) || addr != page.base + page.size {
                return Err("page does not end with its sentinel");
            }
        }

        let mut linked = 0;
        for fl in 0..FL_INDEX_COUNT {
            if (self.fl_bitmap & (1 << fl) != 0) != (self.sl_bitmap[fl] != 0) {
                return Err("first level bitmap is out of sync");
            }

            for sl in 0..SL_INDEX_COUNT {
                let head = mapping::list_index(fl, sl);
                if (self.sl_bitmap[fl] & (1 << sl) != 0) == self.blocks.is_empty(head) {
                    return Err("second level bitmap is out of sync");
                }

                for node in self.blocks.iter(head) {
                    let block = &records[Blocks::block_of(node)];
                    if !block.is_free() || mapping::mapping_insert(block.size) != (fl, sl) {
                        return Err("block is on the wrong free list");
                    }
                    linked += 1;
                }
            }
        }

        if linked != free_blocks {
            return Err("not every free block is linked");
        }
        if free != self.free || total != self.total {
            return Err("byte counters are out of sync");
        }
        if free_pages != self.free_pages {
            return Err("free page counter is out of sync");
        }
        Ok(())
    }

    /// Request a new page if there's no block larger than the watermark.
    ///
    /// Failing to get a page is not an error here, the allocation
    /// may still be served by the existing blocks.
    fn grow_if_low(&mut self) {
        if self.find_free(self.config.grow_watermark).is_some() {
            return;
        }

        if let Err(err) = self.grow(self.config.page_size) {
            log::warn!("Failed to grow heap above watermark: {}", err);
        }
    }

    /// Request a page of at least `size` bytes and add it to this heap.
    fn grow(&mut self, size: usize) -> Result<()> {
        let size = size.max(self.config.page_size);
        let region = self.supplier.supply(size)?;
        self.add_page(region)
    }

    fn add_page(&mut self, region: Region) -> Result<()> {
        if region.base % BLOCK_ALIGN != 0 || region.base == 0 {
            log::error!("Page supplier returned misaligned region at {:#x}", region.base);
            self.supplier.release(region.base);
            return Err(Error::MisalignedRegion);
        }

        let size = align_down(region.size.min(MAX_BLOCK_SIZE), BLOCK_ALIGN);
        if size < MIN_BLOCK_SIZE {
            self.supplier.release(region.base);
            return Err(Error::NoMemoryAvailable);
        }

        let page = self.pages.insert(Page {
            base: region.base,
            size,
            sentinel: 0,
        });

        let records = &mut self.blocks.records;
        let first = records.insert(Block {
            addr: region.base,
            size,
            flags: BlockFlags::FREE,
            prev_phys: None,
            next_phys: None,
            page,
            link: BlockLink::Unlinked,
        });
        let sentinel = records.insert(Block {
            addr: region.base + size,
            size: 0,
            flags: BlockFlags::PREV_FREE,
            prev_phys: Some(first),
            next_phys: None,
            page,
            link: BlockLink::Unlinked,
        });
        records[first].next_phys = Some(sentinel);
        self.pages[page].sentinel = sentinel;

        self.total += size;
        self.free += size;
        self.free_pages += 1;
        self.insert_free(first);

        log::debug!(
            "Added heap page at {:#x} with {}",
            region.base,
            unit::bytes(size)
        );
        Ok(())
    }

    fn release_page(&mut self, page: usize) {
        let first = self.first_block(page);
        let sentinel = self.pages[page].sentinel;
        self.remove_free(first);

        let records = &mut self.blocks.records;
        records.remove(first);
        records.remove(sentinel);

        if let Some(Page { base, size, .. }) = self.pages.remove(page) {
            self.total -= size;
            self.free -= size;
            self.free_pages -= 1;

            log::debug!("Releasing heap page at {:#x} ({})", base, unit::bytes(size));
            self.supplier.release(base);
        }
    }

    /// The first block of a page is the only one without a predecessor,
    /// so walk back from the sentinel.
    fn first_block(&self, page: usize) -> usize {
        let mut block = self.pages[page].sentinel;
        while let Some(prev) = self.blocks.records[block].prev_phys {
            block = prev;
        }
        block
    }

    /// Check if `block` covers its whole page.
    fn spans_page(&self, block: usize) -> bool {
        let block = &self.blocks.records[block];
        block.prev_phys.is_none() && block.size == self.pages[block.page].size
    }

    /// Find a free block that is at least `size` bytes large.
    fn find_free(&self, size: usize) -> Option<usize> {
        let (mut fl, sl) = mapping::mapping_search(size);
        if fl >= FL_INDEX_COUNT {
            return None;
        }

        let mut sl_map = self.sl_bitmap[fl] & (!0u32 << sl);
        if sl_map == 0 {
            // every list of a higher first level has large enough blocks
            let fl_map = self.fl_bitmap & (!0u32).checked_shl(fl as u32 + 1).unwrap_or(0);
            if fl_map == 0 {
                return None;
            }

            fl = fl_map.trailing_zeros() as usize;
            sl_map = self.sl_bitmap[fl];
        }

        let sl = sl_map.trailing_zeros() as usize;
        self.blocks
            .first(mapping::list_index(fl, sl))
            .map(Blocks::block_of)
    }

    fn insert_free(&mut self, block: usize) {
        let (fl, sl) = mapping::mapping_insert(self.blocks.records[block].size);
        let node = Blocks::node_of(block);

        self.blocks.records[block].link = BlockLink::Free(ListNode::standalone(node));
        self.blocks.insert_after(mapping::list_index(fl, sl), node);

        self.sl_bitmap[fl] |= 1 << sl;
        self.fl_bitmap |= 1 << fl;
    }

    fn remove_free(&mut self, block: usize) {
        let (fl, sl) = mapping::mapping_insert(self.blocks.records[block].size);

        self.blocks.remove(Blocks::node_of(block));
        self.blocks.records[block].link = BlockLink::Unlinked;

        if self.blocks.is_empty(mapping::list_index(fl, sl)) {
            self.sl_bitmap[fl] &= !(1 << sl);
            if self.sl_bitmap[fl] == 0 {
                self.fl_bitmap &= !(1 << fl);
            }
        }
    }

    /// Set the free state of `block` and mirror it into its successor.
    fn set_free(&mut self, block: usize, free: bool) {
        let records = &mut self.blocks.records;
        records[block].flags.set(BlockFlags::FREE, free);
        if let Some(next) = records[block].next_phys {
            records[next].flags.set(BlockFlags::PREV_FREE, free);
        }
    }

    /// Cut the unlinked free `block` so it's exactly `need` bytes large and
    /// its payload is aligned to `align`. The leftovers are put back on the free lists.
    ///
    /// Returns the block that will be handed out.
    fn carve(&mut self, block: usize, need: usize, align: usize) -> usize {
        let Block { addr, size, .. } = self.blocks.records[block];

        let used = if (addr + HEADER_SIZE) % align == 0 {
            block
        } else {
            // take the payload from the end of the block, and leave
            // the front as a free block
            let payload = align_down(addr + size - (need - HEADER_SIZE), align);
            let start = payload - HEADER_SIZE;
            debug_assert!(start - addr >= MIN_BLOCK_SIZE);

            let used = self.split(block, start - addr);
            self.insert_free(block);
            used
        };

        if self.blocks.records[used].size - need >= MIN_BLOCK_SIZE {
            let rest = self.split(used, need);
            self.insert_free(rest);
        }

        used
    }

    /// Split the free, unlinked `block` at `offset` and return the new
    /// block that starts there. Both halves are free and unlinked.
    fn split(&mut self, block: usize, offset: usize) -> usize {
        let records = &mut self.blocks.records;
        let Block {
            addr,
            size,
            next_phys,
            page,
            ..
        } = records[block];
        debug_assert!(records[block].is_free());
        debug_assert!(offset >= MIN_BLOCK_SIZE && size - offset >= MIN_BLOCK_SIZE);

        let rest = records.insert(Block {
            addr: addr + offset,
            size: size - offset,
            flags: BlockFlags::FREE | BlockFlags::PREV_FREE,
            prev_phys: Some(block),
            next_phys,
            page,
            link: BlockLink::Unlinked,
        });

        records[block].size = offset;
        records[block].next_phys = Some(rest);
        if let Some(next) = next_phys {
            records[next].prev_phys = Some(rest);
            records[next].flags.insert(BlockFlags::PREV_FREE);
        }

        rest
    }

    /// Merge the unlinked `next` into the unlinked `block` right before it.
    fn absorb(&mut self, block: usize, next: usize) {
        let records = &mut self.blocks.records;
        debug_assert_eq!(records[block].next_phys, Some(next));

        if let Some(gone) = records.remove(next) {
            records[block].size += gone.size;
            records[block].next_phys = gone.next_phys;

            let free = records[block].is_free();
            if let Some(after) = gone.next_phys {
                records[after].prev_phys = Some(block);
                records[after].flags.set(BlockFlags::PREV_FREE, free);
            }
        }
    }

    /// Find the block for a pointer that was returned by [`Self::allocate`].
    unsafe fn block_of(&self, ptr: NonNull<u8>) -> Result<usize> {
        let addr = match (ptr.as_ptr() as usize).checked_sub(HEADER_SIZE) {
            Some(addr) if addr % BLOCK_ALIGN == 0 => addr,
            _ => return Err(self.reject(ptr)),
        };

        let tag = ptr::read(addr as *const Tag);
        if tag.magic != TAG_MAGIC {
            return Err(self.reject(ptr));
        }

        match self.blocks.records.get(tag.index) {
            Some(block) if block.addr == addr && !block.is_free() && !block.is_sentinel() => {
                Ok(tag.index)
            }
            _ => Err(self.reject(ptr)),
        }
    }

    fn reject(&self, ptr: NonNull<u8>) -> Error {
        log::error!("Tried to free invalid heap pointer {:p}", ptr);
        Error::InvalidPointer
    }
}

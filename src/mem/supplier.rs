//! The interface the heap uses to get pages, and an implementation
//! that backs them with physical frames.

use super::{
    buddy::{order_for_size, size_for_order, MAX_ORDER},
    Error, Result,
};
use crate::sync::LockedFrameAllocator;

/// A contiguous region of memory handed out by a [`PageSupplier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Address of the first byte.
    pub base: usize,
    /// The actual size of the region, which may be larger than requested.
    pub size: usize,
}

/// Something that can hand out pages of memory to a heap.
///
/// # Safety
///
/// Every region returned by [`supply`](PageSupplier::supply) must be valid for
/// reads and writes for its whole size and must not be used by anyone else
/// until it was given back using [`release`](PageSupplier::release).
pub unsafe trait PageSupplier {
    /// Return a region of at least `size` bytes.
    fn supply(&mut self, size: usize) -> Result<Region>;

    /// Take back the region starting at `base`, that was returned by [`supply`](Self::supply).
    fn release(&mut self, base: usize);
}

unsafe impl<S: PageSupplier + ?Sized> PageSupplier for &mut S {
    fn supply(&mut self, size: usize) -> Result<Region> {
        (**self).supply(size)
    }

    fn release(&mut self, base: usize) {
        (**self).release(base)
    }
}

/// Supplies pages by allocating blocks from a frame allocator.
///
/// Physical addresses are turned into virtual ones by adding a fixed offset.
pub struct FrameSupplier<'frames> {
    frames: &'frames LockedFrameAllocator,
    offset: usize,
}

impl<'frames> FrameSupplier<'frames> {
    /// Create a supplier that takes frames out of `frames`.
    ///
    /// # Safety
    ///
    /// Every frame of `frames` must be mapped at its physical address plus `offset`,
    /// and the mapping must be valid for reads and writes.
    pub unsafe fn new(frames: &'frames LockedFrameAllocator, offset: usize) -> Self {
        Self { frames, offset }
    }
}

unsafe impl PageSupplier for FrameSupplier<'_> {
    fn supply(&mut self, size: usize) -> Result<Region> {
        let order = order_for_size(size);
        if order >= MAX_ORDER {
            return Err(Error::OrderTooLarge);
        }

        let mut frames = self.frames.lock();
        let frame = frames.allocate(order)?;
        let base = frames.address_of(frame) + self.offset;

        Ok(Region {
            base,
            size: size_for_order(order),
        })
    }

    fn release(&mut self, base: usize) {
        let mut frames = self.frames.lock();
        let frame = base
            .checked_sub(self.offset)
            .and_then(|addr| frames.frame_at(addr));

        match frame {
            Some(frame) => {
                if let Err(err) = frames.free(frame) {
                    log::error!("Failed to release heap page at {:#x}: {}", base, err);
                }
            }
            None => log::error!("Released heap page {:#x} is not backed by a frame", base),
        }
    }
}

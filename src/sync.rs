//! Lock protected wrappers around the allocators, so they can be
//! shared between harts or stored inside a `static`.

use crate::mem::{
    buddy::{Frame, FrameAllocator},
    heap::{Heap, HeapConfig},
    supplier::PageSupplier,
    AllocStats, Error, Result,
};
use core::ptr::NonNull;
use spin::{Mutex, MutexGuard};

/// A [`FrameAllocator`] behind a spin lock.
pub struct LockedFrameAllocator(Mutex<FrameAllocator>);

impl LockedFrameAllocator {
    /// Wrap the given allocator.
    pub const fn new(frames: FrameAllocator) -> Self {
        Self(Mutex::new(frames))
    }

    /// Lock the allocator to do multiple operations without releasing the lock in between.
    pub fn lock(&self) -> MutexGuard<'_, FrameAllocator> {
        self.0.lock()
    }

    /// Allocate a block of `2^order` frames.
    pub fn allocate(&self, order: usize) -> Result<Frame> {
        self.0.lock().allocate(order)
    }

    /// Give a block of frames back to the allocator.
    pub fn free(&self, frame: Frame) -> Result<()> {
        self.0.lock().free(frame)
    }

    /// Return the physical address of the given frame.
    pub fn address_of(&self, frame: Frame) -> usize {
        self.0.lock().address_of(frame)
    }

    /// Return the frame that starts at the given physical address.
    pub fn frame_at(&self, addr: usize) -> Option<Frame> {
        self.0.lock().frame_at(addr)
    }

    /// Collect statistics about the wrapped allocator.
    pub fn stats(&self) -> AllocStats {
        self.0.lock().stats()
    }
}

/// A [`Heap`] behind a spin lock, that is initialized at runtime.
///
/// Every operation on an uninitialized heap fails with
/// [`Error::NoMemoryAvailable`].
pub struct LockedHeap<S>(Mutex<Option<Heap<S>>>);

impl<S: PageSupplier> LockedHeap<S> {
    /// Create a heap that has no memory yet.
    pub const fn empty() -> Self {
        Self(Mutex::new(None))
    }

    /// Initialize the heap, replacing the previous heap if there was one.
    ///
    /// Allocations of a previous heap must not be used after this call.
    pub fn init(&self, supplier: S, config: HeapConfig) -> Result<()> {
        let heap = Heap::new(supplier, config)?;
        let old = self.0.lock().replace(heap);
        if let Some(old) = old {
            log::warn!("Replaced an already initialized heap");
            drop(old.destruct());
        }
        Ok(())
    }

    /// Check if [`init`](Self::init) was called successfully.
    pub fn is_initialized(&self) -> bool {
        self.0.lock().is_some()
    }

    /// See [`Heap::allocate`].
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        self.0
            .lock()
            .as_mut()
            .ok_or(Error::NoMemoryAvailable)?
            .allocate(size)
    }

    /// See [`Heap::allocate_aligned`].
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        self.0
            .lock()
            .as_mut()
            .ok_or(Error::NoMemoryAvailable)?
            .allocate_aligned(size, align)
    }

    /// See [`Heap::deallocate`].
    ///
    /// # Safety
    ///
    /// Same as for [`Heap::deallocate`].
    pub unsafe fn deallocate(&self, ptr: *mut u8) -> Result<()> {
        match self.0.lock().as_mut() {
            Some(heap) => heap.deallocate(ptr),
            None => Err(Error::InvalidPointer),
        }
    }

    /// Collect statistics about the heap, or `None` if it's not initialized.
    pub fn stats(&self) -> Option<AllocStats> {
        self.0.lock().as_ref().map(Heap::stats)
    }

    /// Tear the heap down, giving every page back, and return the supplier.
    ///
    /// The heap is uninitialized afterwards.
    pub fn destruct(&self) -> Option<S> {
        let heap = self.0.lock().take()?;
        Some(heap.destruct())
    }
}

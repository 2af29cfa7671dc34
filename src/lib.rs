//! Dynamic memory for the Windy kernel.
//!
//! Two allocators live here:
//!
//! - [`mem::buddy::FrameAllocator`] hands out physical frames in power-of-two
//!   blocks using the buddy algorithm.
//! - [`mem::heap::Heap`] carves byte sized allocations out of pages it gets
//!   from a [`mem::supplier::PageSupplier`], using two-level segregated free lists.
//!
//! Both allocators are plain owned objects without any internal locking.
//! Use the wrappers inside [`sync`] if they have to be shared.
#![deny(rust_2018_idioms, rustdoc::broken_intra_doc_links)]
#![cfg_attr(not(test), no_std)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("Windy can only run on 64 bit systems");

extern crate alloc;

pub mod logger;
pub mod mem;
pub mod sync;
pub mod unit;

pub use mem::{
    buddy::{Frame, FrameAllocator},
    heap::{Heap, HeapConfig},
    supplier::{FrameSupplier, PageSupplier, Region},
    AllocStats, Error, Result,
};
pub use sync::{LockedFrameAllocator, LockedHeap};

use std::alloc::{self, Layout};
use windy_mem::{
    mem::FRAME_SIZE, FrameAllocator, FrameSupplier, Heap, HeapConfig, LockedFrameAllocator,
};

/// Memory from the host that pretends to be physical memory.
struct Memory {
    base: usize,
    layout: Layout,
}

impl Memory {
    fn new(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames * FRAME_SIZE, FRAME_SIZE).unwrap();
        let base = unsafe { alloc::alloc(layout) } as usize;
        assert_ne!(base, 0);
        Self { base, layout }
    }

    fn frames(&self) -> LockedFrameAllocator {
        let count = self.layout.size() / FRAME_SIZE;
        LockedFrameAllocator::new(FrameAllocator::with_base(self.base, count).unwrap())
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base as *mut u8, self.layout) };
    }
}

#[test]
fn heap_pages_come_from_frames() {
    let memory = Memory::new(64);
    let frames = memory.frames();
    let supplier = unsafe { FrameSupplier::new(&frames, 0) };
    let mut heap = Heap::new(supplier, HeapConfig::default()).unwrap();

    assert_eq!(frames.stats().allocated, heap.total_bytes());

    let mut live = Vec::new();
    for i in 0..40u8 {
        let ptr = heap.allocate(1000).unwrap();
        let addr = ptr.as_ptr() as usize;
        assert!(addr >= memory.base && addr + 1000 <= memory.base + 64 * FRAME_SIZE);

        unsafe { ptr.as_ptr().write_bytes(i, 1000) };
        live.push((ptr, i));
    }

    assert!(heap.page_count() >= 3);
    assert_eq!(frames.stats().allocated, heap.total_bytes());
    heap.verify().unwrap();

    for (ptr, i) in live {
        unsafe {
            assert_eq!(*ptr.as_ptr(), i);
            assert_eq!(*ptr.as_ptr().add(999), i);
            heap.deallocate(ptr.as_ptr()).unwrap();
        }
    }

    let stats = heap.stats();
    assert_eq!(stats.allocated, 0);
    assert_eq!(frames.stats().allocated, heap.total_bytes());
    heap.verify().unwrap();

    drop(heap.destruct());
    assert_eq!(frames.stats().allocated, 0);
    frames.lock().verify().unwrap();
}

#[test]
fn heap_runs_out_with_frames() {
    let memory = Memory::new(8);
    let frames = memory.frames();
    let supplier = unsafe { FrameSupplier::new(&frames, 0) };
    let mut heap = Heap::new(supplier, HeapConfig::default()).unwrap();

    let mut live = Vec::new();
    let err = loop {
        match heap.allocate(2000) {
            Ok(ptr) => live.push(ptr),
            Err(err) => break err,
        }
    };

    assert!(err.is_out_of_memory());
    assert_eq!(heap.page_count(), 2);
    assert_eq!(frames.stats().free, 0);
    heap.verify().unwrap();

    for ptr in live {
        unsafe { heap.deallocate(ptr.as_ptr()).unwrap() };
    }

    // every byte is free again, but one spare page stays with the heap
    assert_eq!(heap.page_count(), 1);
    assert_eq!(frames.stats().free, 4 * FRAME_SIZE);
}

//! `malloc`/`realloc`/`free`, dispatching by requested size either to one of
//! six preset slab caches or to the frame allocator, with a small in-band
//! header in front of every allocation.
//!
//! Pointer arithmetic that crosses the `HEAP_BASE` boundary is confined to
//! the [`HeapFrames`] adapter the kernel binary supplies; everything in this
//! module works in terms of the heap-window virtual addresses that adapter
//! hands back, never raw physical addresses.

use core::alloc::{AllocError, Allocator, GlobalAlloc, Layout};
use core::ptr::NonNull;

use spin::Mutex;
use static_assertions::assert_eq_size;

use crate::memory::addr::VirtAddress;
use crate::memory::alloc::slab::{FrameSource, SlabCache, SlabFlags};
use crate::memory::page::PAGE_SIZE;

/// Size, in bytes, of the header prepended to every heap allocation.
pub const HEADER_SIZE: usize = 16;

const CACHE_SIZES: [usize; 6] = [16, 32, 64, 128, 256, 512];
const NUM_CACHES: usize = CACHE_SIZES.len();
const MAX_SLAB_RAW: usize = 512;

const DEFAULT_FLAGS: SlabFlags = SlabFlags::PANIC.union(SlabFlags::AUTO_GROW);

/// The 16-byte in-band header. `size` holds either a slab cache index (slab
/// origin) or a page count (frame origin); which one it means is recovered
/// by testing the header's own address for frame alignment.
#[repr(C)]
struct Header {
    size: u64,
    _reserved: u64,
}

assert_eq_size!(Header, [u8; HEADER_SIZE]);

/// Supplies the heap facade with frame-path backing memory: contiguous,
/// zeroed, multi-page runs addressed in the `HEAP_BASE` window.
///
/// # Safety
///
/// `alloc_zeroed(count)` must return `count` contiguous, zeroed, frame-sized
/// and frame-aligned bytes of memory not aliased anywhere else; `free` must
/// only be called with an address and count previously returned together by
/// `alloc_zeroed`.
pub unsafe trait HeapFrames {
    fn alloc_zeroed(&mut self, count: usize) -> Option<VirtAddress>;
    fn free(&mut self, addr: VirtAddress, count: usize);
}

/// `malloc`/`realloc`/`free` over six slab caches {16,32,64,128,256,512} and
/// a frame-path fallback for larger requests.
pub struct Heap<SlabFrames: FrameSource + Clone, Frames: HeapFrames> {
    caches: [SlabCache<SlabFrames>; NUM_CACHES],
    frames: Mutex<Frames>,
}

impl<SlabFrames: FrameSource + Clone, Frames: HeapFrames> Heap<SlabFrames, Frames> {
    pub fn new(slab_frames: SlabFrames, frames: Frames) -> Self {
        let caches = CACHE_SIZES
            .map(|size| SlabCache::create("heap", size, DEFAULT_FLAGS, slab_frames.clone()));
        Heap {
            caches,
            frames: Mutex::new(frames),
        }
    }

    fn cache_index_for_object_size(size: usize) -> Option<usize> {
        CACHE_SIZES.iter().position(|&s| s == size)
    }

    /// `malloc(0)` is defined to behave like `malloc(1)`: callers get a
    /// unique, non-null pointer into the smallest cache rather than `null`.
    pub fn malloc(&self, request: usize) -> Option<VirtAddress> {
        let raw = request + HEADER_SIZE;

        if request <= MAX_SLAB_RAW {
            let object_size = raw.next_power_of_two().clamp(CACHE_SIZES[0], MAX_SLAB_RAW);
            let index = Self::cache_index_for_object_size(object_size)?;
            let base = self.caches[index].alloc(DEFAULT_FLAGS)?;
            unsafe {
                base.as_mut_ptr::<Header>().write(Header {
                    size: index as u64,
                    _reserved: 0,
                });
            }
            Some(VirtAddress::from_raw(base.as_raw() + HEADER_SIZE as u64))
        } else {
            let page_count = div_ceil_u64(raw as u64, PAGE_SIZE.as_raw());
            let base = self.frames.lock().alloc_zeroed(page_count as usize)?;
            unsafe {
                base.as_mut_ptr::<Header>().write(Header {
                    size: page_count,
                    _reserved: 0,
                });
            }
            Some(VirtAddress::from_raw(base.as_raw() + HEADER_SIZE as u64))
        }
    }

    pub fn free(&self, pointer: Option<VirtAddress>) {
        let Some(pointer) = pointer else {
            return;
        };
        let base = VirtAddress::from_raw(pointer.as_raw() - HEADER_SIZE as u64);

        if base.is_aligned_to(PAGE_SIZE.as_raw()) {
            let page_count = unsafe { (*base.as_ptr::<Header>()).size } as usize;
            self.frames.lock().free(base, page_count);
        } else {
            let index = unsafe { (*base.as_ptr::<Header>()).size } as usize;
            self.caches[index].free(base, SlabFlags::PANIC);
        }
    }

    /// Capacity (in bytes, including the header) behind `pointer`, origin
    /// discriminated by frame alignment exactly as `free` does.
    fn capacity_of(&self, pointer: VirtAddress) -> usize {
        let base = VirtAddress::from_raw(pointer.as_raw() - HEADER_SIZE as u64);
        if base.is_aligned_to(PAGE_SIZE.as_raw()) {
            let page_count = unsafe { (*base.as_ptr::<Header>()).size };
            (page_count * PAGE_SIZE.as_raw()) as usize
        } else {
            let index = unsafe { (*base.as_ptr::<Header>()).size } as usize;
            CACHE_SIZES[index]
        }
    }

    /// `realloc(null, n)` behaves as `malloc(n)`; `realloc(p, 0)` behaves as
    /// `free(p)` and returns `None`. Otherwise a fresh allocation is always
    /// made and the old one copied and freed (the specification leaves the
    /// same-size fast path optional; this implementation does not take it,
    /// keeping `realloc` a straightforward compose of `malloc`+copy+`free`).
    pub fn realloc(&self, pointer: Option<VirtAddress>, new_size: usize) -> Option<VirtAddress> {
        let Some(pointer) = pointer else {
            return self.malloc(new_size);
        };
        if new_size == 0 {
            self.free(Some(pointer));
            return None;
        }

        let old_capacity = self.capacity_of(pointer) - HEADER_SIZE;
        let new_pointer = self.malloc(new_size)?;

        let copy_len = core::cmp::min(old_capacity, new_size);
        unsafe {
            core::ptr::copy_nonoverlapping(
                pointer.as_ptr::<u8>(),
                new_pointer.as_mut_ptr::<u8>(),
                copy_len,
            );
        }
        self.free(Some(pointer));
        Some(new_pointer)
    }
}

fn div_ceil_u64(x: u64, divisor: u64) -> u64 {
    (x + divisor - 1) / divisor
}

unsafe impl<SlabFrames: FrameSource + Clone, Frames: HeapFrames> GlobalAlloc
    for Heap<SlabFrames, Frames>
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        assert!(layout.align() <= 8, "heap facade guarantees only 8-byte alignment");
        match self.malloc(layout.size()) {
            Some(addr) => addr.as_mut_ptr(),
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(Some(VirtAddress::from_ptr(ptr)));
    }
}

unsafe impl<SlabFrames: FrameSource + Clone, Frames: HeapFrames> Allocator
    for Heap<SlabFrames, Frames>
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > 8 {
            return Err(AllocError);
        }
        let addr = self.malloc(layout.size()).ok_or(AllocError)?;
        let ptr = NonNull::new(addr.as_mut_ptr::<u8>()).ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        self.free(Some(VirtAddress::from_ptr(ptr.as_ptr())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::addr::PhysAddress;
    use crate::memory::page::Frame;
    use std::alloc::{alloc_zeroed as std_alloc_zeroed, dealloc as std_dealloc, Layout as StdLayout};
    use std::collections::HashMap;

    #[derive(Clone)]
    struct TestSlabFrames {
        inner: std::rc::Rc<core::cell::RefCell<TestSlabFramesInner>>,
    }

    struct TestSlabFramesInner {
        next_phys: u64,
        backing: HashMap<u64, *mut u8>,
    }

    impl TestSlabFrames {
        fn new() -> Self {
            TestSlabFrames {
                inner: std::rc::Rc::new(core::cell::RefCell::new(TestSlabFramesInner {
                    next_phys: PAGE_SIZE.as_raw(),
                    backing: HashMap::new(),
                })),
            }
        }
    }

    unsafe impl FrameSource for TestSlabFrames {
        fn alloc_zeroed(&mut self) -> Option<Frame> {
            let layout = StdLayout::from_size_align(4096, 4096).unwrap();
            let ptr = unsafe { std_alloc_zeroed(layout) };
            let mut inner = self.inner.borrow_mut();
            let phys = inner.next_phys;
            inner.next_phys += PAGE_SIZE.as_raw();
            inner.backing.insert(phys, ptr);
            Some(Frame::new(PhysAddress::from_raw(phys)))
        }

        fn free(&mut self, frame: Frame) {
            let mut inner = self.inner.borrow_mut();
            if let Some(ptr) = inner.backing.remove(&frame.start().as_raw()) {
                let layout = StdLayout::from_size_align(4096, 4096).unwrap();
                unsafe { std_dealloc(ptr, layout) };
            }
        }

        fn to_virt(&self, frame: Frame) -> VirtAddress {
            VirtAddress::from_ptr(self.inner.borrow().backing[&frame.start().as_raw()])
        }

        fn virt_to_frame(&self, virt: VirtAddress) -> Frame {
            let addr = virt.as_ptr::<u8>() as u64;
            for (&phys, &ptr) in &self.inner.borrow().backing {
                if ptr as u64 == addr {
                    return Frame::new(PhysAddress::from_raw(phys));
                }
            }
            panic!("unknown frame for virt address");
        }
    }

    struct TestHeapFrames {
        backing: HashMap<u64, (*mut u8, usize)>,
        next_tag: u64,
    }

    impl TestHeapFrames {
        fn new() -> Self {
            TestHeapFrames {
                backing: HashMap::new(),
                next_tag: PAGE_SIZE.as_raw() * 1_000_000,
            }
        }
    }

    unsafe impl HeapFrames for TestHeapFrames {
        fn alloc_zeroed(&mut self, count: usize) -> Option<VirtAddress> {
            let len = count * PAGE_SIZE.as_raw() as usize;
            let layout = StdLayout::from_size_align(len, PAGE_SIZE.as_raw() as usize).unwrap();
            let ptr = unsafe { std_alloc_zeroed(layout) };
            let tag = self.next_tag;
            self.next_tag += len as u64;
            self.backing.insert(tag, (ptr, len));
            Some(VirtAddress::from_raw(tag))
        }

        fn free(&mut self, addr: VirtAddress, _count: usize) {
            if let Some((ptr, len)) = self.backing.remove(&addr.as_raw()) {
                let layout = StdLayout::from_size_align(len, PAGE_SIZE.as_raw() as usize).unwrap();
                unsafe { std_dealloc(ptr, layout) };
            }
        }
    }

    // The test harness keeps the frame-path's "heap window" addresses
    // disjoint from the slab caches' by tagging them far apart; it doesn't
    // model a real HHDM/HEAP_BASE mapping, but the header discrimination
    // under test only depends on frame alignment, which holds for both.
    fn make_heap() -> Heap<TestSlabFrames, TestHeapFrames> {
        Heap::new(TestSlabFrames::new(), TestHeapFrames::new())
    }

    #[test]
    fn small_allocation_is_not_frame_aligned() {
        let heap = make_heap();
        let p = heap.malloc(30).unwrap();
        assert_ne!(p.as_raw() % PAGE_SIZE.as_raw(), 0);
        heap.free(Some(p));
    }

    #[test]
    fn large_allocation_is_frame_aligned() {
        let heap = make_heap();
        let p = heap.malloc(5000).unwrap();
        let base = p.as_raw() - HEADER_SIZE as u64;
        assert_eq!(base % PAGE_SIZE.as_raw(), 0);
        heap.free(Some(p));
    }

    #[test]
    fn malloc_zero_returns_unique_nonnull_pointer() {
        let heap = make_heap();
        let a = heap.malloc(0).unwrap();
        let b = heap.malloc(0).unwrap();
        assert_ne!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn realloc_null_is_malloc() {
        let heap = make_heap();
        let p = heap.realloc(None, 42).unwrap();
        heap.free(Some(p));
    }

    #[test]
    fn realloc_zero_is_free_and_returns_none() {
        let heap = make_heap();
        let p = heap.malloc(42).unwrap();
        assert!(heap.realloc(Some(p), 0).is_none());
    }

    #[test]
    fn realloc_grow_preserves_leading_bytes() {
        let heap = make_heap();
        let p = heap.malloc(3 * core::mem::size_of::<i32>()).unwrap();
        unsafe {
            let slice = core::slice::from_raw_parts_mut(p.as_mut_ptr::<i32>(), 3);
            slice.copy_from_slice(&[43, 37, 763]);
        }

        let p = heap.realloc(Some(p), 10 * core::mem::size_of::<i32>()).unwrap();
        unsafe {
            let slice = core::slice::from_raw_parts(p.as_ptr::<i32>(), 3);
            assert_eq!(slice, &[43, 37, 763]);
        }
        heap.free(Some(p));
    }

    #[test]
    fn realloc_shrink_preserves_overlapping_bytes() {
        let heap = make_heap();
        let p = heap.malloc(10 * core::mem::size_of::<i32>()).unwrap();
        unsafe {
            *p.as_mut_ptr::<i32>().add(3) = -120;
        }

        let p = heap.realloc(Some(p), 4 * core::mem::size_of::<i32>()).unwrap();
        unsafe {
            assert_eq!(*p.as_ptr::<i32>().add(3), -120);
        }
        heap.free(Some(p));
    }

    #[test]
    fn size_500_rounds_to_512_cache_513_routes_to_frame() {
        let heap = make_heap();
        let p500 = heap.malloc(500).unwrap();
        assert_ne!((p500.as_raw() - HEADER_SIZE as u64) % PAGE_SIZE.as_raw(), 0);

        let p513 = heap.malloc(513).unwrap();
        assert_eq!((p513.as_raw() - HEADER_SIZE as u64) % PAGE_SIZE.as_raw(), 0);

        heap.free(Some(p500));
        heap.free(Some(p513));
    }
}

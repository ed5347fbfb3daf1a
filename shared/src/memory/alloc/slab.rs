//! A slab allocator for small, fixed-size objects.
//!
//! Each slab is exactly one physical frame, partitioned into
//! `object_size`-sized buffers. The slab header sits at the tail of the
//! frame; the buffers occupy the prefix. Free buffers are threaded into an
//! intrusive singly-linked free-list (the *bufctls*); the memory of an
//! allocated buffer is opaque to the cache.

use crate::memory::addr::VirtAddress;
use crate::memory::page::{Frame, PAGE_SIZE};

use bitflags::bitflags;
use core::ptr::NonNull;
use spin::Mutex;

bitflags! {
    /// Flags accepted by every `SlabCache` entry point.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct SlabFlags: u32 {
        /// Treat a null return or cache misuse as fatal (log-panic).
        const PANIC = 1 << 0;
        /// On an exhausted `alloc`, grow the cache by one slab and retry once.
        const AUTO_GROW = 1 << 1;
    }
}

/// Supplies the slab allocator with zeroed frames and their virtual alias.
///
/// # Safety
///
/// `to_virt` must return a virtual address through which the whole frame is
/// readable and writable, and `alloc_zeroed`/`free` must not alias a live
/// frame with anything else.
pub unsafe trait FrameSource {
    fn alloc_zeroed(&mut self) -> Option<Frame>;
    fn free(&mut self, frame: Frame);
    fn to_virt(&self, frame: Frame) -> VirtAddress;
    /// Inverse of `to_virt`, restricted to addresses it has returned. Used to
    /// recover the frame a slab lives in from the slab header's own address.
    fn virt_to_frame(&self, virt: VirtAddress) -> Frame;
}

/// A free buffer descriptor. Overlays the first two machine words of a free
/// buffer; opaque once the buffer is allocated.
#[repr(C)]
struct Bufctl {
    next: *mut Bufctl,
    /// Sanity token: always equal to the bufctl's own address while free.
    pointer: *mut Bufctl,
}

/// The per-slab control structure, placed at the last `size_of::<Slab>()`
/// bytes of the frame it describes.
#[repr(C)]
struct Slab {
    next: Option<NonNull<Slab>>,
    free_count: usize,
    free_list: *mut Bufctl,
}

struct Inner<Frames: FrameSource> {
    name: &'static str,
    object_size: usize,
    max_buffers: usize,
    slabs: Option<NonNull<Slab>>,
    frames: Frames,
}

/// A named pool of same-sized objects, backed by one-frame slabs.
pub struct SlabCache<Frames: FrameSource>(Mutex<Inner<Frames>>);

fn panic_site(name: &str, what: &str) -> ! {
    log::error!("slab cache '{}': {}", name, what);
    loop {
        core::hint::spin_loop();
    }
}

impl<Frames: FrameSource> SlabCache<Frames> {
    /// `object_size` must be a power of two, 4..=512.
    pub fn create(
        name: &'static str,
        object_size: usize,
        flags: SlabFlags,
        frames: Frames,
    ) -> Self {
        assert!(object_size.is_power_of_two());
        assert!(object_size <= 512);

        let max_buffers = (PAGE_SIZE.as_raw() as usize - core::mem::size_of::<Slab>()) / object_size;
        assert!(max_buffers > 0);

        let cache = SlabCache(Mutex::new(Inner {
            name,
            object_size,
            max_buffers,
            slabs: None,
            frames,
        }));
        cache.grow(1, flags);
        cache
    }

    pub fn name(&self) -> &'static str {
        self.0.lock().name
    }

    pub fn object_size(&self) -> usize {
        self.0.lock().object_size
    }

    pub fn max_buffers(&self) -> usize {
        self.0.lock().max_buffers
    }

    /// Number of free-list entries across every slab. Exposed for testing.
    pub fn free_buffer_count(&self) -> usize {
        let inner = self.0.lock();
        let mut slab = inner.slabs;
        let mut total = 0;
        while let Some(s) = slab {
            let s = unsafe { s.as_ref() };
            total += s.free_count;
            slab = s.next;
        }
        total
    }

    pub fn grow(&self, count: usize, flags: SlabFlags) {
        let mut inner = self.0.lock();
        for _ in 0..count {
            let frame = match inner.frames.alloc_zeroed() {
                Some(frame) => frame,
                None if flags.contains(SlabFlags::PANIC) => {
                    let name = inner.name;
                    drop(inner);
                    panic_site(name, "couldn't allocate a frame to grow");
                }
                None => return,
            };

            let base = inner.frames.to_virt(frame);
            let slab_ptr = VirtAddress::from_raw(
                base.as_raw() + PAGE_SIZE.as_raw() - core::mem::size_of::<Slab>() as u64,
            )
            .as_mut_ptr::<Slab>();

            let object_size = inner.object_size;
            let max_buffers = inner.max_buffers;

            let mut head: *mut Bufctl = core::ptr::null_mut();
            let mut tail: *mut Bufctl = core::ptr::null_mut();
            for index in 0..max_buffers {
                let bufctl_ptr =
                    VirtAddress::from_raw(base.as_raw() + (index * object_size) as u64)
                        .as_mut_ptr::<Bufctl>();
                unsafe {
                    (*bufctl_ptr).pointer = bufctl_ptr;
                    (*bufctl_ptr).next = core::ptr::null_mut();
                    if tail.is_null() {
                        head = bufctl_ptr;
                    } else {
                        (*tail).next = bufctl_ptr;
                    }
                    tail = bufctl_ptr;
                }
            }

            unsafe {
                slab_ptr.write(Slab {
                    next: None,
                    free_count: max_buffers,
                    free_list: head,
                });
            }

            let new_slab = NonNull::new(slab_ptr).unwrap();
            match last_slab(inner.slabs) {
                Some(mut tail_slab) => unsafe { tail_slab.as_mut().next = Some(new_slab) },
                None => inner.slabs = Some(new_slab),
            }
        }
    }

    /// Pops the first free bufctl found while walking the slab list, if any.
    fn try_alloc_once(&self) -> Option<VirtAddress> {
        let mut inner = self.0.lock();
        let mut slab = inner.slabs;
        while let Some(mut s) = slab {
            let s_ref = unsafe { s.as_mut() };
            if !s_ref.free_list.is_null() {
                let bufctl = s_ref.free_list;
                unsafe {
                    s_ref.free_list = (*bufctl).next;
                }
                s_ref.free_count -= 1;
                return Some(VirtAddress::from_ptr(bufctl));
            }
            slab = s_ref.next;
        }
        None
    }

    pub fn alloc(&self, flags: SlabFlags) -> Option<VirtAddress> {
        if let Some(ptr) = self.try_alloc_once() {
            return Some(ptr);
        }

        if flags.contains(SlabFlags::AUTO_GROW) {
            self.grow(1, flags);
            if let Some(ptr) = self.try_alloc_once() {
                return Some(ptr);
            }
        }

        if flags.contains(SlabFlags::PANIC) {
            let name = self.0.lock().name;
            panic_site(name, "couldn't find allocatable memory");
        }
        None
    }

    pub fn free(&self, pointer: VirtAddress, flags: SlabFlags) {
        let mut inner = self.0.lock();
        let max_buffers = inner.max_buffers;
        let mut slab = inner.slabs;
        while let Some(mut s) = slab {
            let s_ref = unsafe { s.as_mut() };
            if s_ref.free_count < max_buffers {
                let bufctl: *mut Bufctl = pointer.as_mut_ptr();
                unsafe {
                    (*bufctl).next = s_ref.free_list;
                    (*bufctl).pointer = bufctl;
                }
                s_ref.free_list = bufctl;
                s_ref.free_count += 1;
                return;
            }
            slab = s_ref.next;
        }

        if flags.contains(SlabFlags::PANIC) {
            let name = inner.name;
            drop(inner);
            panic_site(name, "couldn't find a slab for the freed pointer");
        }
    }

    /// Release every fully-free slab's frame back to the frame source.
    pub fn reap(&self, _flags: SlabFlags) {
        let mut inner = self.0.lock();
        let max_buffers = inner.max_buffers;

        let mut kept_head: Option<NonNull<Slab>> = None;
        let mut kept_tail: Option<NonNull<Slab>> = None;
        let mut slab = inner.slabs.take();

        while let Some(s) = slab {
            let s_ref = unsafe { &*s.as_ptr() };
            let next = s_ref.next;

            if s_ref.free_count == max_buffers {
                let base = slab_frame_base(s);
                let frame = inner.frames.virt_to_frame(base);
                inner.frames.free(frame);
            } else {
                match kept_tail {
                    Some(mut t) => unsafe {
                        t.as_mut().next = Some(s);
                        s.as_ptr().as_mut().unwrap().next = None;
                        kept_tail = Some(s);
                    },
                    None => {
                        kept_head = Some(s);
                        unsafe {
                            s.as_ptr().as_mut().unwrap().next = None;
                        }
                        kept_tail = Some(s);
                    }
                }
            }

            slab = next;
        }

        inner.slabs = kept_head;
    }

    /// Consume the cache, freeing every slab and its frames.
    ///
    /// If any slab is not fully free and `PANIC` is set, log-panics instead
    /// of leaking.
    pub fn destroy(self, flags: SlabFlags) {
        let mut inner = self.0.into_inner();
        let max_buffers = inner.max_buffers;

        let mut slab = inner.slabs;
        while let Some(s) = slab {
            let s_ref = unsafe { s.as_ref() };
            if s_ref.free_count != max_buffers && flags.contains(SlabFlags::PANIC) {
                let name = inner.name;
                panic_site(name, "a slab wasn't completely free");
            }
            slab = s_ref.next;
        }

        let mut slab = inner.slabs;
        while let Some(s) = slab {
            let s_ref = unsafe { s.as_ref() };
            let next = s_ref.next;
            let base = slab_frame_base(s);
            let frame = inner.frames.virt_to_frame(base);
            inner.frames.free(frame);
            slab = next;
        }
        inner.slabs = None;
    }

    /// Diagnostic dump of every slab and bufctl through the log sink.
    pub fn dump(&self) {
        let inner = self.0.lock();
        log::info!("dump for cache '{}'", inner.name);
        let mut slab = inner.slabs;
        let mut slab_count = 0;
        while let Some(s) = slab {
            let s_ref = unsafe { s.as_ref() };
            log::info!("\tslab no. {} is at {:p}", slab_count, s.as_ptr());
            let mut bufctl = s_ref.free_list;
            let mut bufctl_count = 0;
            while !bufctl.is_null() {
                log::info!(
                    "\t\tbufctl no. {} has pointer {:p}",
                    bufctl_count,
                    unsafe { (*bufctl).pointer }
                );
                bufctl = unsafe { (*bufctl).next };
                bufctl_count += 1;
            }
            slab = s_ref.next;
            slab_count += 1;
        }
    }
}

fn last_slab(mut slab: Option<NonNull<Slab>>) -> Option<NonNull<Slab>> {
    slab.as_ref()?;
    loop {
        let next = unsafe { slab.unwrap().as_ref().next };
        if next.is_none() {
            return slab;
        }
        slab = next;
    }
}

/// The base of the frame a slab header lives at the tail of: the slab
/// address aligned down to `PAGE_SIZE`.
fn slab_frame_base(slab: NonNull<Slab>) -> VirtAddress {
    VirtAddress::from_raw(slab.as_ptr() as u64 & !(PAGE_SIZE.as_raw() - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::addr::PhysAddress;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::collections::HashMap;

    struct TestFrames {
        next_phys: u64,
        backing: HashMap<u64, *mut u8>,
    }

    impl TestFrames {
        fn new() -> Self {
            TestFrames {
                next_phys: PAGE_SIZE.as_raw(),
                backing: HashMap::new(),
            }
        }
    }

    unsafe impl FrameSource for TestFrames {
        fn alloc_zeroed(&mut self) -> Option<Frame> {
            let layout = Layout::from_size_align(4096, 4096).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            let phys = self.next_phys;
            self.next_phys += PAGE_SIZE.as_raw();
            self.backing.insert(phys, ptr);
            Some(Frame::new(PhysAddress::from_raw(phys)))
        }

        fn free(&mut self, frame: Frame) {
            if let Some(ptr) = self.backing.remove(&frame.start().as_raw()) {
                let layout = Layout::from_size_align(4096, 4096).unwrap();
                unsafe { dealloc(ptr, layout) };
            }
        }

        fn to_virt(&self, frame: Frame) -> VirtAddress {
            let ptr = self.backing[&frame.start().as_raw()];
            VirtAddress::from_ptr(ptr)
        }

        fn virt_to_frame(&self, virt: VirtAddress) -> Frame {
            let addr = virt.as_ptr::<u8>() as u64;
            for (&phys, &ptr) in &self.backing {
                if ptr as u64 == addr {
                    return Frame::new(PhysAddress::from_raw(phys));
                }
            }
            panic!("unknown frame for virt address");
        }
    }

    #[test]
    fn create_grows_one_slab() {
        let cache = SlabCache::create("test64", 64, SlabFlags::PANIC, TestFrames::new());
        assert_eq!(cache.max_buffers(), (4096 - 24) / 64);
        assert_eq!(cache.free_buffer_count(), cache.max_buffers());
    }

    #[test]
    fn alloc_free_symmetry_with_auto_grow() {
        let cache = SlabCache::create(
            "test64",
            64,
            SlabFlags::PANIC | SlabFlags::AUTO_GROW,
            TestFrames::new(),
        );

        let mut allocations = Vec::new();
        for _ in 0..100 {
            allocations.push(
                cache
                    .alloc(SlabFlags::PANIC | SlabFlags::AUTO_GROW)
                    .expect("allocation"),
            );
        }

        for ptr in allocations.into_iter().rev() {
            cache.free(ptr, SlabFlags::PANIC);
        }

        cache.reap(SlabFlags::PANIC);
        assert_eq!(cache.free_buffer_count(), cache.max_buffers());
    }

    #[test]
    fn free_list_pointers_stay_within_slab_bounds() {
        let cache = SlabCache::create(
            "test32",
            32,
            SlabFlags::PANIC | SlabFlags::AUTO_GROW,
            TestFrames::new(),
        );
        let object_size = cache.object_size();
        let mut allocations = Vec::new();
        for _ in 0..10 {
            allocations.push(cache.alloc(SlabFlags::PANIC).unwrap());
        }
        for ptr in allocations {
            assert_eq!(ptr.as_raw() % object_size as u64, 0);
        }
    }
}

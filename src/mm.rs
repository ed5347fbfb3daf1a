//! Kernel memory management

pub mod paging;

pub use shared::memory::addr::*;
pub use shared::memory::page::*;

use shared::memory::alloc::*;
use shared::memory::*;

use paging::*;

use core::alloc::{GlobalAlloc, Layout};

use log::info;
use multiboot2 as mb2;
use x86_64::registers::control::{Cr3, Cr3Flags};

/// The map of virtual address space. Assigns different ranges to various
/// purposes.
pub struct VirtualMap;

#[allow(unused)]
impl VirtualMap {
    /// The first MiB is identity mapped and not available for other mappings.
    ///
    /// TODO: remove this restriction.
    pub const fn first_mib() -> VirtExtent {
        VirtExtent::from_raw(0, 1024 * 1024)
    }

    /// Range of all user virtual address space. This is almost all of the
    /// lower-half.
    pub const fn user() -> VirtExtent {
        VirtExtent::from_raw_range_exclusive(
            Self::first_mib().address().as_raw(),
            0x0000_8000_0000_0000,
        )
    }

    /// Mapping of all physical memory in kernel space. This is currently 2^40
    /// bytes worth.
    pub const fn phys_map() -> VirtExtent {
        VirtExtent::from_raw_range_exclusive(0xffff_8000_0000_0000, 0xffff_80ff_ffff_ffff)
    }

    /// Kernel image's address. This is the last 2GiB of memory.
    pub const fn kernel_image() -> VirtExtent {
        VirtExtent::from_raw_range_exclusive(0xffff_ffff_8000_0000, 0xffff_ffff_ffff_ffff)
    }

    /// Higher-half direct map of all physical memory. Same window as
    /// `phys_map`; named to match the cache-mode-table entries below.
    pub const fn hhdm() -> VirtExtent {
        Self::phys_map()
    }

    /// Window the heap facade's slab and frame allocations are addressed
    /// through. Disjoint from `phys_map`/`hhdm`, kernel image, and user space.
    pub const fn heap_base() -> VirtExtent {
        VirtExtent::from_raw_range_exclusive(0xffff_8100_0000_0000, 0xffff_8200_0000_0000)
    }

    /// Virtual base the kernel image is linked at. Same as `kernel_image`;
    /// named to match the cache-mode-table entries below.
    pub const fn kernel_code_base() -> VirtExtent {
        Self::kernel_image()
    }

    /// Identity mapping of the first 4 GiB of physical memory.
    pub const fn identity() -> VirtExtent {
        VirtExtent::from_raw_range_exclusive(0, 4 * 1024 * 1024 * 1024)
    }
}

static FRAME_ALLOCATOR: spin::Mutex<once_cell::unsync::OnceCell<BitmapFrameAllocator>> =
    spin::Mutex::new(once_cell::unsync::OnceCell::new());

// The maximum amount of memory the physical memory allocator supports. Exactly
// 128 GiB. TODO: remove this limit.
const MAX_MEMORY: Length = Length::from_raw(137438953472u64);

/// Initializes the memory management system. Must only be called once; panics
/// otherwise.
pub fn init(boot_info: &mb2::BootInformation, reserved: impl Clone + Iterator<Item = PhysExtent>) {
    // Make sure we are only called once.
    static IS_INITIALIZED: core::sync::atomic::AtomicBool =
        core::sync::atomic::AtomicBool::new(false);
    assert!(!IS_INITIALIZED.swap(true, core::sync::atomic::Ordering::SeqCst));

    unsafe {
        paging::init_pat();
    }

    let kernel_extent = get_kernel_phys_extent();
    info!("Kernel extent: {kernel_extent:x?}");

    let orig_memory_map = translate_memory_map(boot_info);

    // Rewrite the memory map to exclude kernel areas.
    let mut memory_map = Map::from_entries(mark_kernel_areas(
        mark_kernel_areas(orig_memory_map.entries().copied(), reserved.clone()),
        core::iter::once(kernel_extent),
    ));

    for e in memory_map.entries() {
        info!("{e:x?}");
    }

    // Set up a bump allocator for bootstrapping allocations that will live
    // forever, especially the kernel page tables.
    //
    // Each full leaf page table maps 512 pages. As a generous overestimate, we
    // can reserve 1 frame for every 256 frames we're mapping. Most of what we
    // map here will be the entirety of physical memory, so use that for the
    // estimate.
    let total_phys_frames: u64 = memory_map
        .entries()
        .map(|e| FrameRange::containing_extent(e.extent).count())
        .sum();
    let init_alloc_frames = total_phys_frames / 256;

    // TODO: change memory map to work with frames instead of addresses. This is
    // more sensible since it is how we will basically always consume memory.

    // Find a chunk of available memory. Skip the first 1 MiB.
    let (init_alloc_map_ndx, _) = memory_map
        .entries()
        .enumerate()
        .skip_while(|(_, e)| e.extent.address() < PhysAddress::from_raw(1024 * 1024))
        .find(|(_, e)| {
            e.mem_type == MemoryType::Available
                && FrameRange::contained_by_extent(e.extent).unwrap().count() >= init_alloc_frames
        })
        .unwrap();

    // We mutate this in place.
    let entry_for_init_alloc = memory_map.entry_mut(init_alloc_map_ndx);
    let init_alloc_frames = FrameRange::new(
        FrameRange::contained_by_extent(entry_for_init_alloc.extent)
            .unwrap()
            .first(),
        init_alloc_frames,
    )
    .unwrap();
    entry_for_init_alloc.extent = PhysExtent::from_range_exclusive(
        init_alloc_frames.end().unwrap().start(),
        entry_for_init_alloc.extent.end_address(),
    );

    // In our bootstrap phase, we are limited to our identity mapping of the
    // first 1 GiB. Ensure we are within that.
    assert!(
        init_alloc_frames.end().unwrap().extent().address() - PhysAddress::zero()
            <= Length::from_raw(1024 * 1024 * 1024)
    );

    assert!(init_alloc_frames.first().start() >= get_kernel_phys_extent().end_address());

    let mut init_allocator = BumpFrameAllocator::new(init_alloc_frames);

    // Our bootstrap page table identity maps the first GB of memory.
    let first_gb_translator = |phys: PhysAddress| {
        assert!(phys.as_raw() < 1024 * 1024 * 1024, "{phys:?}");
        Some(VirtAddress::from_raw(phys.as_raw()))
    };

    let page_table_template = unsafe {
        create_page_table_template(
            boot_info,
            &orig_memory_map,
            || init_allocator.allocate(),
            first_gb_translator,
        )
    };

    // The frames used for the page-table template are perma-reserved. Maybe we
    // will add to them later, but the current ones are leaked: they are not
    // known to either `memory_map` or the future allocator.
    //
    // Restore the remaining frames to the map entry.
    if let Some(remain) = init_allocator.unwrap() {
        let extent = &mut memory_map.entry_mut(init_alloc_map_ndx).extent;
        *extent = PhysExtent::from_range_exclusive(remain.first().start(), extent.end_address());
    }

    // Install the real page table now. Only from this point on does the HHDM
    // window this module's page table template built actually back live
    // memory, which the bitmap placed below needs in order to be addressed
    // through its higher-half alias rather than kernel BSS.
    unsafe {
        set_up_initial_page_table(&page_table_template);
    }

    // Pick the first usable entry big enough to hold the bitmap, place the
    // bitmap at its base, and shorten the entry accordingly.
    let highest_usable_top = memory_map.highest_usable_top();
    let bitmap_len = phys::required_bitmap_len(highest_usable_top);

    let (bitmap_map_ndx, _) = memory_map
        .entries()
        .enumerate()
        .skip_while(|(_, e)| e.extent.address() < PhysAddress::from_raw(1024 * 1024))
        .find(|(_, e)| {
            e.mem_type == MemoryType::Available
                && e.extent.length() >= Length::from_raw(bitmap_len)
        })
        .unwrap();

    let bitmap_entry = memory_map.entry_mut(bitmap_map_ndx);
    let bitmap_phys_base = bitmap_entry.extent.address();
    bitmap_entry.extent = PhysExtent::from_range_exclusive(
        bitmap_phys_base + Length::from_raw(bitmap_len),
        bitmap_entry.extent.end_address(),
    );

    // SAFETY: the entry above was just carved out of available memory
    // exclusively for this use, and the HHDM window now backs real memory.
    let frame_bitmap: &'static mut [u8] = unsafe {
        core::slice::from_raw_parts_mut(
            phys_to_virt(bitmap_phys_base).as_mut_ptr::<u8>(),
            bitmap_len as usize,
        )
    };
    phys::fill_bitmap_from_map(frame_bitmap, &memory_map);

    let mut frame_allocator = unsafe { BitmapFrameAllocator::new(frame_bitmap) };

    // Mark all reserved areas. Important so we don't hand out memory containing
    // kernel code or data structures.
    for reserved_extent in reserved.chain([
        // Exclude the kernel image itself.
        get_kernel_phys_extent(),
        // Exclude the boot_info structure.
        PhysExtent::from_raw(
            boot_info.start_address() as u64,
            boot_info.total_size() as u64,
        ),
        // Exclude the first MB.
        PhysExtent::from_raw(0, 1024 * 1024),
    ]) {
        info!("reserving extent {reserved_extent:?}");
        for frame in FrameRange::containing_extent(reserved_extent).iter() {
            // Ignore if the frame isn't available. TODO: investigate why
            // unwrapping fails.
            let _ = frame_allocator.reserve(frame);
        }
    }

    FRAME_ALLOCATOR.lock().set(frame_allocator).unwrap();

    // Only now can the heap facade's slab/frame-path caches reach out for
    // their first frames.
    GLOBAL_HEAP.call_once(|| heap::Heap::new(KernelSlabFrames, KernelHeapFrames));
}

#[inline(never)]
#[allow(unused)]
pub fn allocate_frame() -> Option<Frame> {
    Some(allocate_frames(0)?.first())
}

#[inline(never)]
pub fn allocate_frames(order: usize) -> Option<FrameRange> {
    let mut guard = FRAME_ALLOCATOR.lock();
    let frame_allocator = guard.get_mut().unwrap();
    frame_allocator.allocate_range(order)
}

#[inline(never)]
pub unsafe fn deallocate_frames(frames: FrameRange) {
    let mut guard = FRAME_ALLOCATOR.lock();
    let frame_allocator = guard.get_mut().unwrap();
    frame_allocator.deallocate_range(frames);
}

#[inline(never)]
pub fn allocate_owned_frames(order: usize) -> Option<OwnedFrameRange> {
    Some(OwnedFrameRange {
        frames: allocate_frames(order)?,
    })
}

/// An exclusively owned frame range that will be deallocated on destruction.
pub struct OwnedFrameRange {
    frames: FrameRange,
}

impl OwnedFrameRange {
    pub fn frames(&self) -> FrameRange {
        self.frames
    }
}

impl Drop for OwnedFrameRange {
    fn drop(&mut self) {
        unsafe {
            deallocate_frames(self.frames);
        }
    }
}

/// Re-tags the portion of every `Available` entry that overlaps a reserved
/// extent as `KernelAndModules`, splitting entries at the overlap's edges as
/// needed. Non-available entries pass through untouched.
fn mark_kernel_areas(
    entries: impl Iterator<Item = MapEntry>,
    reserved: impl Clone + Iterator<Item = PhysExtent>,
) -> impl Iterator<Item = MapEntry> {
    entries.flat_map(move |entry| split_around_reserved(entry, reserved.clone()))
}

fn split_around_reserved(
    entry: MapEntry,
    reserved: impl Iterator<Item = PhysExtent>,
) -> arrayvec::ArrayVec<MapEntry, 16> {
    let mut pieces = arrayvec::ArrayVec::<MapEntry, 16>::new();
    pieces.push(entry);

    for reserved_extent in reserved {
        let mut next = arrayvec::ArrayVec::<MapEntry, 16>::new();
        for piece in pieces.drain(..) {
            if piece.mem_type != MemoryType::Available {
                next.push(piece);
                continue;
            }
            match piece.extent.overlap(reserved_extent) {
                None => next.push(piece),
                Some(overlap) => {
                    if let Some(left) = piece.extent.left_difference(overlap) {
                        next.push(MapEntry {
                            extent: left,
                            mem_type: piece.mem_type,
                        });
                    }
                    next.push(MapEntry {
                        extent: overlap,
                        mem_type: MemoryType::KernelAndModules,
                    });
                    if let Some(right) = piece.extent.right_difference(overlap) {
                        next.push(MapEntry {
                            extent: right,
                            mem_type: piece.mem_type,
                        });
                    }
                }
            }
        }
        pieces = next;
    }

    pieces
}

pub fn translate_memory_map(mb2_info: &mb2::BootInformation) -> Map {
    let mem_map_tag = mb2_info.memory_map_tag().unwrap();
    Map::from_entries(mem_map_tag.memory_areas().iter().map(|area| MapEntry {
        extent: PhysExtent::from_raw(area.start_address(), area.size()),
        mem_type: match area.typ().into() {
            mb2::MemoryAreaType::Available => MemoryType::Available,
            mb2::MemoryAreaType::Reserved => MemoryType::Reserved,
            mb2::MemoryAreaType::AcpiAvailable => MemoryType::AcpiReclaimable,
            mb2::MemoryAreaType::ReservedHibernate => MemoryType::AcpiNvs,
            mb2::MemoryAreaType::Defective => MemoryType::BadMemory,
            t => panic!("unknown mb2 memory type {t:?}"),
        },
    }))
}

unsafe fn create_page_table_template<
    F: FnMut() -> Option<Frame>,
    T: Fn(PhysAddress) -> Option<VirtAddress>,
>(
    boot_info: &mb2::BootInformation,
    memory_map: &Map,
    get_frame: F,
    translator: T,
) -> PageTable {
    let mut table = PageTable::zero();
    let mut mapper = unsafe { paging::Mapper::new(&mut table, translator, get_frame) };

    // All mappings here will have the global flag. This table is shared for
    // all address spaces.
    let shared_parent_flags = PageTableFlags::PRESENT | PageTableFlags::GLOBAL;

    // Every standard range in the spec's initial mapping table is uncacheable;
    // `cache_mode_flags` is a no-op here but documents that explicitly rather
    // than leaving the PAT/PCD/PWT bits implicitly zero.
    let uncacheable = paging::cache_mode_flags(paging::CacheMode::Uncacheable);

    // First, set up the physical memory mapping (HHDM). It must be
    // read/write. For safety make it non-executable.
    let leaf_flags = PageTableFlags::PRESENT
        | PageTableFlags::WRITABLE
        | PageTableFlags::EXECUTE_DISABLE
        | uncacheable;
    let parent_flags = shared_parent_flags | PageTableFlags::WRITABLE;
    for frame in memory_map
        .entries()
        .flat_map(|e| FrameRange::containing_extent(e.extent).iter())
    {
        let phys = frame.start();
        let page = Page::new(phys_to_virt(phys));
        unsafe {
            mapper
                .map(page, frame, leaf_flags, parent_flags)
                .unwrap();
        }
    }

    // Identity map the first 4 GiB of physical memory.
    let leaf_flags = PageTableFlags::PRESENT
        | PageTableFlags::WRITABLE
        | PageTableFlags::EXECUTE_DISABLE
        | uncacheable;
    let parent_flags = shared_parent_flags | PageTableFlags::WRITABLE;
    for frame in FrameRange::containing_extent(VirtualMap::identity()).iter() {
        let page = Page::new(VirtAddress::from_raw(frame.start().as_raw()));
        unsafe {
            mapper
                .map(page, frame, leaf_flags, parent_flags)
                .unwrap();
        }
    }

    // Map the heap facade's window onto the same first 4 GiB of physical
    // memory the identity mapping covers.
    let leaf_flags = PageTableFlags::PRESENT
        | PageTableFlags::WRITABLE
        | PageTableFlags::EXECUTE_DISABLE
        | uncacheable;
    let parent_flags = shared_parent_flags | PageTableFlags::WRITABLE;
    for frame in FrameRange::containing_extent(VirtualMap::identity()).iter() {
        let page = Page::new(
            VirtualMap::heap_base().address() + Length::from_raw(frame.start().as_raw()),
        );
        unsafe {
            mapper
                .map(page, frame, leaf_flags, parent_flags)
                .unwrap();
        }
    }

    // We still identity map the first 1 MiB. We still hold a couple absolute
    // pointers (e.g. VGA memory) here. TODO: fix this and get rid of this
    // mapping.
    let leaf_flags = PageTableFlags::PRESENT
        | PageTableFlags::WRITABLE
        | PageTableFlags::EXECUTE_DISABLE
        | uncacheable;
    let parent_flags = shared_parent_flags | PageTableFlags::WRITABLE;
    for page in PageRange::containing_extent(VirtualMap::first_mib()).iter() {
        let frame = Frame::new(PhysAddress::from_raw(page.start().as_raw()));
        unsafe {
            mapper
                .map(page, frame, leaf_flags, parent_flags)
                .unwrap();
        }
    }

    // Map the kernel image. Leaf flags are determined per-section.
    let parent_flags = shared_parent_flags | PageTableFlags::WRITABLE;
    for section in boot_info.elf_sections().unwrap() {
        let section_type = section.section_type();
        let section_flags = section.flags();
        let section_extent = VirtExtent::from_raw(section.start_address(), section.size());

        // Filter sections that don't occupy address space.
        if !section_flags.contains(mb2::ElfSectionFlags::ALLOCATED) {
            continue;
        }

        // Filter lower-half sections, used for bootstrap.
        if section.name().unwrap().starts_with(".bootstrap") {
            continue;
        }

        // Confirm the section is in the area we expect.
        assert!(
            VirtualMap::kernel_image().contains(section_extent),
            "{}: {:x?} does not contain {:x?}",
            section.name().unwrap_or("<invalid utf8>"),
            VirtualMap::kernel_image(),
            section_extent
        );

        match section_type {
            mb2::ElfSectionType::ProgramSection | mb2::ElfSectionType::Uninitialized => (),
            _ => continue,
        }

        let mut leaf_flags = PageTableFlags::PRESENT;
        if !section_flags.contains(mb2::ElfSectionFlags::EXECUTABLE) {
            leaf_flags |= PageTableFlags::EXECUTE_DISABLE;
        }
        if section_flags.contains(mb2::ElfSectionFlags::WRITABLE) {
            assert!(!section_flags.contains(mb2::ElfSectionFlags::EXECUTABLE));
            leaf_flags |= PageTableFlags::WRITABLE;
        }

        for page in PageRange::containing_extent(section_extent).iter() {
            let frame = Frame::new(PhysAddress::from_zero(
                page.start() - get_kernel_virt_base(),
            ));
            unsafe {
                mapper
                    .map(page, frame, leaf_flags, parent_flags)
                    .unwrap();
            }
        }
    }

    core::mem::drop(mapper);
    table
}

unsafe fn set_up_initial_page_table(template: &PageTable) {
    let mut root_table = INIT_PAGE_TABLE.lock();
    *root_table = template.clone();

    unsafe {
        install_page_table(&mut root_table);
    }
}

static INIT_PAGE_TABLE: spin::Mutex<paging::PageTable> =
    spin::Mutex::new(paging::PageTable::zero());

/// Install `root_table` as the active page table.
///
/// # Safety
/// * Must be a root PML4 table.
/// * Must correctly map the kernel's address space.
unsafe fn install_page_table(root_table: &mut paging::PageTable) {
    let phys_addr = kernel_ptr_to_phys_addr(root_table as *const _);
    unsafe {
        Cr3::write(
            x86_64::structures::paging::PhysFrame::from_start_address(x86_64::addr::PhysAddr::new(
                phys_addr.as_raw(),
            ))
            .unwrap(),
            Cr3Flags::empty(),
        );
    }
}

fn flush_tlb(page: Page) {
    unsafe {
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(page.start().as_raw()));
    }
}

/// Physical address of the root PML4 table. This kernel has exactly one
/// address space (no per-process tables; see `VirtualMap`'s callers), so
/// unlike a multi-address-space VMM this carries no root argument of its
/// own — it always refers to the one static `INIT_PAGE_TABLE`.
pub fn root() -> PhysAddress {
    let root = INIT_PAGE_TABLE.lock();
    kernel_ptr_to_phys_addr(&*root as *const paging::PageTable)
}

/// Writes the root page table's physical address into CR3. `init` already
/// does this once while bootstrapping; exposed separately for a caller that
/// mutates `INIT_PAGE_TABLE` wholesale rather than through `map_page`/
/// `unmap_page` (which edit it in place and only need a targeted `invlpg`).
pub fn load() {
    let mut root = INIT_PAGE_TABLE.lock();
    unsafe {
        install_page_table(&mut root);
    }
}

/// Maps `virt`'s containing page to `phys`'s containing frame with the given
/// access rights and cache behaviour, allocating any missing intermediate
/// page-table levels. Invalidates the TLB entry for `virt`.
pub fn map_page(phys: PhysAddress, virt: VirtAddress, rights: paging::Rights, cache: paging::CacheMode) {
    let page = Page::containing(virt);
    let frame = Frame::containing(phys);
    let leaf_flags = paging::rights_flags(rights) | paging::cache_mode_flags(cache);
    let parent_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::GLOBAL;

    let mut root = INIT_PAGE_TABLE.lock();
    let mut mapper =
        unsafe { paging::Mapper::new(&mut root, |p| Some(phys_to_virt(p)), allocate_frame) };
    unsafe {
        mapper.map(page, frame, leaf_flags, parent_flags).unwrap();
    }
    core::mem::drop(mapper);
    core::mem::drop(root);

    flush_tlb(page);
}

/// Clears `virt`'s containing page's leaf entry, if present, and invalidates
/// its TLB entry. Idempotent: unmapping an already-unmapped page is a no-op
/// beyond the redundant `invlpg`. Intermediate levels are never reclaimed.
pub fn unmap_page(virt: VirtAddress) {
    let page = Page::containing(virt);

    let mut root = INIT_PAGE_TABLE.lock();
    let mut mapper =
        unsafe { paging::Mapper::new(&mut root, |p| Some(phys_to_virt(p)), allocate_frame) };
    mapper.unmap(page).unwrap();
    core::mem::drop(mapper);
    core::mem::drop(root);

    flush_tlb(page);
}

/// Maps every frame-aligned step of `start..end` (start aligned down, end
/// aligned up) to the matching offset from `offset`, with `rights`/`cache`
/// applied uniformly. Equivalent to calling `map_page` once per page.
pub fn map_range(
    start: VirtAddress,
    end: VirtAddress,
    offset: PhysAddress,
    rights: paging::Rights,
    cache: paging::CacheMode,
) {
    let range = PageRange::containing_extent(VirtExtent::from_range_exclusive(start, end));
    let leaf_flags = paging::rights_flags(rights) | paging::cache_mode_flags(cache);
    let parent_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::GLOBAL;

    {
        let mut root = INIT_PAGE_TABLE.lock();
        let mut mapper =
            unsafe { paging::Mapper::new(&mut root, |p| Some(phys_to_virt(p)), allocate_frame) };
        for page in range.iter() {
            let delta = page.start() - range.first().start();
            let frame = Frame::new(offset + delta);
            unsafe {
                mapper.map(page, frame, leaf_flags, parent_flags).unwrap();
            }
        }
    }

    for page in range.iter() {
        flush_tlb(page);
    }
}

/// Symmetric with `map_range`: clears every frame-aligned step of
/// `start..end` (start aligned down, end aligned up).
pub fn unmap_range(start: VirtAddress, end: VirtAddress) {
    let range = PageRange::containing_extent(VirtExtent::from_range_exclusive(start, end));

    {
        let mut root = INIT_PAGE_TABLE.lock();
        let mut mapper =
            unsafe { paging::Mapper::new(&mut root, |p| Some(phys_to_virt(p)), allocate_frame) };
        for page in range.iter() {
            mapper.unmap(page).unwrap();
        }
    }

    for page in range.iter() {
        flush_tlb(page);
    }
}

/// Get a kernel space virtual address corresponding to a physical memory
/// adddress.
///
/// The address is suitable but not necessarily safe for dereferencing as a
/// pointer in kernel code. This is unsafe if aliasing rules are broken
/// including if `phys` refers to memory backing another virtual mapping.
/// Furthermore, the memory at `phys` must be safe to read/write (which may not
/// be true e.g. for memory-mapped IO addresses).
///
/// This can be safe if `phys` was allocated by `allocate_frames` and not
/// subsequently deallocated. Even so, care must be taken to ensure to use it
/// safely if it was shared with other users.
#[inline]
pub fn phys_to_virt(phys: PhysAddress) -> VirtAddress {
    assert!(phys < PhysAddress::from_zero(MAX_MEMORY));
    VirtualMap::phys_map().address() + (phys - PhysAddress::zero())
}

/// Get a kernel space virtual extent corresponding to a physical memory
/// extent.
///
/// The same safety considerations as for `phys_to_virt` apply.
#[inline]
pub fn phys_extent_to_virt(phys: PhysExtent) -> VirtExtent {
    VirtExtent::new(phys_to_virt(phys.address()), phys.length())
}

/// Given a pointer `p` in the kernel's address space, return the physical
/// address referenced. `p` *must* point within the kernel's address space above
/// `get_kernel_virt_base()`.
#[inline]
pub fn kernel_ptr_to_phys_addr<T>(p: *const T) -> PhysAddress {
    let virt_addr = VirtAddress::from_ptr(p);
    assert!(virt_addr >= get_kernel_virt_base(), "{virt_addr:?}");
    PhysAddress::from_zero(virt_addr - get_kernel_virt_base())
}

#[inline]
pub fn get_kernel_virt_base() -> VirtAddress {
    // SAFETY: `KERNEL_VIRT_BASE` does not have a value, but it is zero-sized.
    // Its address is set appropriately by the linker so we may get a raw
    // pointers to it, as long as we never dereference it.
    unsafe { VirtAddress::from_raw(&internal::KERNEL_VIRT_BASE as *const _ as usize as u64) }
}

#[inline]
pub fn get_kernel_phys_extent() -> PhysExtent {
    // SAFETY: `KERNEL_PHYS_BEGIN_SYM` and `KERNEL_PHYS_END_SYM` do not have
    // values, but they zero-sized. The addresses are set appropriately by the
    // linker so we may get raw pointers to them, as long as we never
    // dereference them.
    unsafe {
        PhysExtent::from_raw_range_exclusive(
            &internal::KERNEL_PHYS_BEGIN_SYM as *const _ as usize as u64,
            &internal::KERNEL_PHYS_END_SYM as *const _ as usize as u64,
        )
    }
}

/// Backs the heap facade's slab caches. Every slab is a single frame, aliased
/// through the ordinary HHDM mapping since slab headers and bufctls are never
/// touched outside the kernel's own address space.
#[derive(Clone, Copy)]
struct KernelSlabFrames;

unsafe impl slab::FrameSource for KernelSlabFrames {
    fn alloc_zeroed(&mut self) -> Option<Frame> {
        let mut guard = FRAME_ALLOCATOR.lock();
        let frame_alloc = guard.get_mut().unwrap();
        Some(frame_alloc.allocate_range_zeroed(0, phys_to_virt)?.first())
    }

    fn free(&mut self, frame: Frame) {
        unsafe {
            deallocate_frames(FrameRange::one(frame));
        }
    }

    fn to_virt(&self, frame: Frame) -> VirtAddress {
        phys_to_virt(frame.start())
    }

    fn virt_to_frame(&self, virt: VirtAddress) -> Frame {
        Frame::new(PhysAddress::from_zero(virt - VirtualMap::phys_map().address()))
    }
}

/// Backs the heap facade's frame-path fallback for requests too large for any
/// slab cache. Allocations are addressed through `VirtualMap::heap_base`,
/// which this module's page-table template maps onto the same first 4 GiB of
/// physical memory the identity mapping covers.
///
/// TODO: this only ever hands out memory from the first 4 GiB; a kernel with
/// more physical memory to spare for large heap requests will need a wider
/// `heap_base` mapping.
struct KernelHeapFrames;

fn heap_base_to_frame(addr: VirtAddress) -> Frame {
    Frame::new(PhysAddress::from_zero(addr - VirtualMap::heap_base().address()))
}

fn frame_to_heap_base(frame: Frame) -> VirtAddress {
    VirtualMap::heap_base().address() + (frame.start() - PhysAddress::zero())
}

unsafe impl heap::HeapFrames for KernelHeapFrames {
    fn alloc_zeroed(&mut self, count: usize) -> Option<VirtAddress> {
        let order = count.next_power_of_two().trailing_zeros() as usize;
        let mut guard = FRAME_ALLOCATOR.lock();
        let frame_alloc = guard.get_mut().unwrap();
        let frames = frame_alloc.allocate_range_zeroed(order, |phys| {
            VirtualMap::heap_base().address() + (phys - PhysAddress::zero())
        })?;
        Some(frame_to_heap_base(frames.first()))
    }

    fn free(&mut self, addr: VirtAddress, count: usize) {
        let order = count.next_power_of_two().trailing_zeros() as usize;
        let first = heap_base_to_frame(addr);
        let frames = FrameRange::new(first, 1 << order).unwrap();
        unsafe {
            deallocate_frames(frames);
        }
    }
}

// The heap facade's caches grab their first frame eagerly at construction
// time, so it can't be built in a `static` initializer: the frame allocator
// and the HHDM/`heap_base` mappings it depends on only exist once `init` has
// run. `GLOBAL_HEAP` is populated at the end of `init`; `KernelHeap` forwards
// every `GlobalAlloc` call through it.
static GLOBAL_HEAP: spin::Once<heap::Heap<KernelSlabFrames, KernelHeapFrames>> = spin::Once::new();

struct KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let heap = GLOBAL_HEAP.get().expect("heap not initialized");
        unsafe { heap.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let heap = GLOBAL_HEAP.get().expect("heap not initialized");
        unsafe { heap.dealloc(ptr, layout) }
    }
}

// Only the real kernel binary routes allocation through the heap facade.
// Under `cargo test` this crate runs as an ordinary std binary and tests
// (e.g. `mm::paging`'s host-side table-walk tests) need a working allocator
// without having run `mm::init` first, so they fall back to std's default.
#[cfg(not(test))]
#[global_allocator]
static GLOBAL_ALLOCATOR: KernelHeap = KernelHeap;

mod internal {
    extern "C" {
        #![allow(improper_ctypes)]
        // These may not be dereferenced. Only their address is meaningful.
        pub static KERNEL_PHYS_BEGIN_SYM: ();
        pub static KERNEL_PHYS_END_SYM: ();
        pub static KERNEL_VIRT_BASE: ();
    }
}

use shared::memory::{addr::*, page::*};

use core::ptr;

use static_assertions as sa;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::registers::model_specific::Msr;

const IA32_PAT_MSR: u32 = 0x277;

/// Writes the fixed cache-type layout `CacheMode`/`cache_mode_flags` are
/// defined against to the PAT MSR. Must run once at boot, before installing
/// any mapping that relies on a non-default `CacheMode`.
///
/// # Safety
/// Must only run while interrupts that could context-switch onto another
/// core with a stale PAT are not a concern, i.e. during single-core boot.
pub unsafe fn init_pat() {
    let mut msr = Msr::new(IA32_PAT_MSR);
    unsafe {
        msr.write(PAT_MSR_VALUE);
    }
}

pub const MAX_PHYS_ADDR_BITS: u32 = 52;
pub const MAX_PHYS_ADDR: PhysAddress = PhysAddress::from_raw(2 << MAX_PHYS_ADDR_BITS);

#[derive(Clone, Debug)]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

impl PageTable {
    #[inline]
    /// Create a table where all entries are zero.
    pub const fn zero() -> PageTable {
        PageTable {
            entries: [PageTableEntry::zero(); 512],
        }
    }
}

// Assert that `PageTable` is 4 KiB.
sa::assert_eq_size!(PageTable, [u8; 4096]);

#[derive(Clone, Copy, Debug)]
#[repr(transparent)]
pub struct PageTableEntry {
    raw: u64,
}

impl PageTableEntry {
    /// Create an entry with all bits set to zero.
    #[inline]
    pub const fn zero() -> PageTableEntry {
        PageTableEntry { raw: 0 }
    }

    /// Set the entry's physical address. For L1 entries this is the memory
    /// frame being mapped to. For L2+, this is the address of a lower-level
    /// table.
    ///
    /// # Panics
    /// Panics if `addr` is not aligned to a 4KiB boundary. Note that this
    /// doesn't guarantee safety: if using 2 MiB or 1 GiB pages, the address
    /// must be aligned likewise.
    ///
    /// Panics if `addr` exceeds 2^52, which is the upper bound on supported
    /// physical addresses. Does not check the CPU-specific maximum.
    #[inline]
    pub fn set_addr(&mut self, addr: PhysAddress) {
        assert!(addr.is_aligned_to_length(PAGE_SIZE), "{addr:?}");
        assert!(addr < MAX_PHYS_ADDR);
        // Page table entries are essentially an aligned physical addresses with
        // flag bits OR'ed in. Bits 0-11 and 52-63 of the address always zero
        // due to the alignment requirement and the maximum address. These are
        // used as paging flags.
        self.raw |= addr.as_raw();
    }

    #[inline]
    pub fn get_addr(&self) -> PhysAddress {
        PhysAddress::from_raw(self.raw & PAGE_TABLE_ENTRY_ADDR_BITS)
    }

    /// Set flags (as documented in `PageTableFlags`).
    #[inline]
    pub fn set_flags(&mut self, flags: PageTableFlags) {
        self.raw |= flags.bits();
    }

    /// Get flags (as documented in `PageTableFlags`).
    #[inline]
    pub fn get_flags(&mut self) -> PageTableFlags {
        // SAFETY: PageTableFlags::all().bits() only returns bits valid for
        // PageTableFlags. Bitwise-and with any other value will yield only
        // valid bits.
        unsafe { PageTableFlags::from_bits_unchecked(self.raw & PageTableFlags::all().bits()) }
    }
}

pub const PAGE_TABLE_ENTRY_ADDR_BITS: u64 = ((1 << 36) - 1) << 12;

bitflags::bitflags! {
    /// Control bits for a page table entry. Documented in architecture manual.
    /// Note that some bits may not be valid for some table levels, and not
    /// every combination of bits may be valid.
    pub struct PageTableFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const PAGE_SIZE = 1 << 7;
        /// PAT bit for a 4 KiB leaf (level 1) entry. Aliases `PAGE_SIZE`'s bit,
        /// which instead means "huge page" at levels 2 and 3; this mapper only
        /// ever builds 4 KiB leaves, so the alias is never ambiguous in practice.
        const PAT = 1 << 7;
        const GLOBAL = 1 << 8;
        const EXECUTE_DISABLE = 1 << 63;

        const DEFAULT_PARENT_TABLE_FLAGS = Self::PRESENT.bits | Self::WRITABLE.bits;
    }
}

/// The six cache behaviours the PAT is configured with at boot, in PAT-index
/// order. `pat_msr_value` writes this exact ordering to the PAT MSR, and
/// `cache_mode_flags` returns the PAT/PCD/PWT bit triple that selects each one
/// from a 4 KiB leaf entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheMode {
    Uncacheable,
    WriteCombining,
    WriteThrough,
    WriteProtected,
    WriteBack,
    Uncached,
}

/// PAT MSR value (0x277) establishing the fixed cache-type layout
/// `CacheMode`/`cache_mode_flags` is defined against: PA0 = UC, PA1 = WC,
/// PA4 = WT, PA5 = WP, PA6 = WB, PA7 = UC-. PA2 and PA3 are unused by this
/// mapper but must still name a valid memory type.
pub const PAT_MSR_VALUE: u64 = 0x07_06_05_04_00_00_01_00;

/// Bit triple (PAT, PCD, PWT) selecting `mode` from a 4 KiB leaf entry,
/// assuming the PAT MSR holds `PAT_MSR_VALUE`. A pure lookup, per the
/// specification's preference for cache-type dispatch as data.
pub const fn cache_mode_flags(mode: CacheMode) -> PageTableFlags {
    const TABLE: [PageTableFlags; 6] = [
        PageTableFlags::empty(),                                              // uncacheable
        PageTableFlags::WRITE_THROUGH,                                        // write-combining
        PageTableFlags::PAT,                                                  // write-through
        PageTableFlags::from_bits_truncate(PageTableFlags::PAT.bits | PageTableFlags::WRITE_THROUGH.bits), // write-protected
        PageTableFlags::from_bits_truncate(PageTableFlags::PAT.bits | PageTableFlags::NO_CACHE.bits),       // write-back
        PageTableFlags::from_bits_truncate(
            PageTableFlags::PAT.bits | PageTableFlags::NO_CACHE.bits | PageTableFlags::WRITE_THROUGH.bits,
        ), // uncached
    ];
    TABLE[mode as usize]
}

/// Access rights for a mapping, independent of its cache behaviour.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rights {
    KernelRead,
    KernelReadWrite,
    UserRead,
    UserReadWrite,
}

/// Leaf flags (minus `PRESENT`, which every mapping needs and which is added
/// by the caller) implied by `rights`.
pub const fn rights_flags(rights: Rights) -> PageTableFlags {
    match rights {
        Rights::KernelRead => PageTableFlags::EXECUTE_DISABLE,
        Rights::KernelReadWrite => {
            PageTableFlags::from_bits_truncate(
                PageTableFlags::WRITABLE.bits | PageTableFlags::EXECUTE_DISABLE.bits,
            )
        }
        Rights::UserRead => {
            PageTableFlags::from_bits_truncate(
                PageTableFlags::USER.bits | PageTableFlags::EXECUTE_DISABLE.bits,
            )
        }
        Rights::UserReadWrite => PageTableFlags::from_bits_truncate(
            PageTableFlags::USER.bits
                | PageTableFlags::WRITABLE.bits
                | PageTableFlags::EXECUTE_DISABLE.bits,
        ),
    }
}

#[derive(Clone, Copy, Debug)]
pub enum MapError {
    FrameAllocationFailed,
    TranslationFailed,
}

pub struct Mapper<'a, Translator, Allocator> {
    level_4: &'a mut PageTable,
    translator: Translator,
    frame_allocator: Allocator,
    _unsend: core::marker::PhantomData<*const ()>,
}

impl<'a, Translator, Allocator> Mapper<'a, Translator, Allocator>
where
    Translator: FnMut(PhysAddress) -> Option<VirtAddress>,
    Allocator: FnMut() -> Option<Frame>,
{
    /// Create a `Mapper` for the given `level_4` page table, using `translator`
    /// to map physical to virtual addresses. `frame_allocator` is used to get
    /// frames to place new page tables in.
    ///
    /// # Safety
    /// * `level_4` must be a valid L4 page table, and all physical addresses
    ///   referenced from L2+ tables must refer to valid page tables.
    /// * `translator` must return valid accessible virtual addresss for the
    ///   current address space, or `None`.
    /// * `frame_allocator` must return valid physical memory frames not in use
    ///   anywhere else, or `None`.
    /// * If `level_4` is the active page table, client must ensure translations
    ///   actively in use are not broken.
    pub unsafe fn new(
        level_4: &'a mut PageTable,
        translator: Translator,
        frame_allocator: Allocator,
    ) -> Self {
        Mapper {
            level_4,
            translator,
            frame_allocator,
            _unsend: core::marker::PhantomData,
        }
    }

    /// Map `page` to `frame` with leaf-entry flags `leaf_flags` (`PRESENT` is
    /// added automatically), allocating any missing intermediate tables with
    /// `parent_flags`.
    #[must_use]
    pub unsafe fn map(
        &mut self,
        page: Page,
        frame: Frame,
        leaf_flags: PageTableFlags,
        parent_flags: PageTableFlags,
    ) -> Result<(), MapError> {
        let l4e: &mut PageTableEntry = &mut self.level_4.entries[page.l4_index()];
        // SAFETY: each traversal requires that the passed entry is a valid
        // entry in a non-leaf table. We know this to be the case for each call.
        let l3: &mut PageTable = unsafe {
            Self::next_level_alloc(l4e, &mut self.translator, &mut self.frame_allocator, parent_flags)?
        };
        let l3e = &mut l3.entries[page.l3_index()];
        let l2: &mut PageTable = unsafe {
            Self::next_level_alloc(l3e, &mut self.translator, &mut self.frame_allocator, parent_flags)?
        };
        let l2e = &mut l2.entries[page.l2_index()];
        let l1: &mut PageTable = unsafe {
            Self::next_level_alloc(l2e, &mut self.translator, &mut self.frame_allocator, parent_flags)?
        };
        let mut l1e = PageTableEntry::zero();
        // TODO: handle existing mapping.
        l1e.set_addr(frame.start());
        l1e.set_flags(leaf_flags | PageTableFlags::PRESENT);
        unsafe {
            ptr::write_volatile(&mut l1.entries[page.l1_index()] as *mut _, l1e);
        }

        Ok(())
    }

    /// Clear `page`'s leaf entry, if present. Does not reclaim now-empty
    /// intermediate tables and does not flush the TLB; the caller is
    /// responsible for `invlpg`.
    pub fn unmap(&mut self, page: Page) -> Result<(), MapError> {
        let l4e = &mut self.level_4.entries[page.l4_index()];
        if !l4e.get_flags().contains(PageTableFlags::PRESENT) {
            return Ok(());
        }
        let l3: &mut PageTable = unsafe {
            &mut *(self.translator)(l4e.get_addr())
                .ok_or(MapError::TranslationFailed)?
                .as_mut_ptr()
        };
        let l3e = &mut l3.entries[page.l3_index()];
        if !l3e.get_flags().contains(PageTableFlags::PRESENT) {
            return Ok(());
        }
        let l2: &mut PageTable = unsafe {
            &mut *(self.translator)(l3e.get_addr())
                .ok_or(MapError::TranslationFailed)?
                .as_mut_ptr()
        };
        let l2e = &mut l2.entries[page.l2_index()];
        if !l2e.get_flags().contains(PageTableFlags::PRESENT) {
            return Ok(());
        }
        let l1: &mut PageTable = unsafe {
            &mut *(self.translator)(l2e.get_addr())
                .ok_or(MapError::TranslationFailed)?
                .as_mut_ptr()
        };
        unsafe {
            ptr::write_volatile(
                &mut l1.entries[page.l1_index()] as *mut _,
                PageTableEntry::zero(),
            );
        }
        Ok(())
    }

    /// Traverse from `entry` in a parent table to the lower-level table it
    /// points to. If it is not present, fetches a physical memory frame with
    /// `frame_allocator`, places an empty table there, and points `entry` to it
    /// with `new_flags`. Otherwise, does not modify `entry`.
    ///
    /// `translator` is used to map physical to virtual addresses to access the
    /// next table. `translator` and `frame_allocator` must abide by the same
    /// contract specified for `new()`. `entry` must be in a parent table, not a
    /// leaf table.
    ///
    /// Returns a mutable reference to the next table or an error.
    #[inline]
    unsafe fn next_level_alloc<'b>(
        entry: &'b mut PageTableEntry,
        translator: &mut Translator,
        frame_allocator: &mut Allocator,
        new_flags: PageTableFlags,
    ) -> Result<&'b mut PageTable, MapError> {
        let mut translate = |phys: PhysAddress| {
            let virt = translator(phys).ok_or(MapError::TranslationFailed)?;
            assert!(!virt.is_zero());
            assert!(virt.is_aligned_to(4096), "{virt:?}");
            Ok(virt.as_mut_ptr())
        };

        // NOTE: here we assume that if the PRESENT flag is not set, then this
        // entry does not "own" a valid frame. If this were not the case we'd
        // leak a frame. This is not unsafe, but it is a case to watch out for.
        let next_table_ptr: *mut PageTable = if entry.get_flags().contains(PageTableFlags::PRESENT)
        {
            translate(entry.get_addr())?
        } else {
            // Allocate a new frame to hold the next level table and zero it.
            let new_frame = frame_allocator().ok_or(MapError::FrameAllocationFailed)?;
            let ptr = translate(new_frame.start())?;
            unsafe {
                ptr::write(ptr, PageTable::zero());
            }
            entry.set_addr(new_frame.start());
            entry.set_flags(new_flags.union(PageTableFlags::PRESENT));
            ptr
        };

        // SAFETY: given the assumptions:
        // 1. If applicable, `new_frame` above was a valid unused frame.
        // 2. `entry.get_addr()` references a valid physical frame that is not
        //    referenced by any other page tables.
        // 3. `next_table_addr` is a valid mapping of the frame into the current
        //    virtual address space.
        //
        // ... this is sound. (1) and (3) rely on the client upholding their
        // contract. (2) relies on us upholding our invariants.
        unsafe { Ok(&mut *next_table_ptr) }
    }

    #[inline]
    pub fn get_l4_entry(&mut self, page: Page) -> &mut PageTableEntry {
        &mut self.level_4.entries[page.l4_index()]
    }

    #[inline]
    pub fn get_l3_entry<'s>(&'s mut self, page: Page) -> Option<&'s mut PageTableEntry> {
        let l4 = self.get_l4_entry(page).clone();
        let l3: *mut PageTable = (self.translator)(l4.get_addr())?.as_mut_ptr();
        // SAFETY: assuming the invariants required by the other unsafe methods
        // are upheld, we can dereference.
        let l3: &mut PageTable = unsafe { &mut *l3 };
        Some(&mut l3.entries[page.l3_index()])
    }

    #[inline]
    pub fn get_l2_entry(&mut self, page: Page) -> Option<&mut PageTableEntry> {
        let l3 = self.get_l3_entry(page)?.clone();
        let l2: *mut PageTable = (self.translator)(l3.get_addr())?.as_mut_ptr();
        // SAFETY: assuming the invariants required by the other unsafe methods
        // are upheld, we can dereference.
        let l2: &mut PageTable = unsafe { &mut *l2 };
        Some(&mut l2.entries[page.l2_index()])
    }

    #[inline]
    pub fn get_l1_entry(&mut self, page: Page) -> Option<&mut PageTableEntry> {
        let l2 = self.get_l2_entry(page)?.clone();
        let l1: *mut PageTable = (self.translator)(l2.get_addr())?.as_mut_ptr();
        // SAFETY: assuming the invariants required by the other unsafe methods
        // are upheld, we can dereference.
        let l1: &mut PageTable = unsafe { &mut *l1 };
        Some(&mut l1.entries[page.l1_index()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Host-side stand-in for the real allocator/HHDM: physical "addresses"
    // here are just host pointers, so the translator is the identity
    // function, the same shape as `mm::init`'s bootstrap `first_gb_translator`.
    struct HostFrames {
        leaked: std::vec::Vec<*mut u8>,
    }

    impl HostFrames {
        fn new() -> Self {
            HostFrames { leaked: std::vec::Vec::new() }
        }

        fn alloc(&mut self) -> Frame {
            let layout = std::alloc::Layout::from_size_align(4096, 4096).unwrap();
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            self.leaked.push(ptr);
            Frame::new(PhysAddress::from_raw(ptr as u64))
        }
    }

    impl Drop for HostFrames {
        fn drop(&mut self) {
            let layout = std::alloc::Layout::from_size_align(4096, 4096).unwrap();
            for ptr in self.leaked.drain(..) {
                unsafe { std::alloc::dealloc(ptr, layout) };
            }
        }
    }

    fn identity_translator(phys: PhysAddress) -> Option<VirtAddress> {
        Some(VirtAddress::from_raw(phys.as_raw()))
    }

    #[test]
    fn map_then_read_back_via_table_walk() {
        let mut frames = HostFrames::new();
        let data_frame = frames.alloc();

        let mut root = PageTable::zero();
        let page = Page::new(VirtAddress::from_raw(0x1_0000_0000));

        {
            let mut mapper = unsafe {
                Mapper::new(&mut root, identity_translator, || Some(frames.alloc()))
            };
            let leaf_flags = rights_flags(Rights::KernelReadWrite) | cache_mode_flags(CacheMode::WriteBack);
            let parent_flags = PageTableFlags::DEFAULT_PARENT_TABLE_FLAGS;
            unsafe {
                mapper.map(page, data_frame, leaf_flags, parent_flags).unwrap();
            }
        }

        let mut mapper =
            unsafe { Mapper::new(&mut root, identity_translator, || None) };
        let l1e = mapper.get_l1_entry(page).unwrap();
        assert_eq!(l1e.get_addr(), data_frame.start());
        assert!(l1e.get_flags().contains(PageTableFlags::PRESENT));
        assert!(l1e.get_flags().contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn unmap_clears_leaf_entry() {
        let mut frames = HostFrames::new();
        let data_frame = frames.alloc();

        let mut root = PageTable::zero();
        let page = Page::new(VirtAddress::from_raw(0x2_0000_0000));

        let mut mapper =
            unsafe { Mapper::new(&mut root, identity_translator, || Some(frames.alloc())) };
        let leaf_flags = rights_flags(Rights::KernelRead) | cache_mode_flags(CacheMode::Uncacheable);
        let parent_flags = PageTableFlags::DEFAULT_PARENT_TABLE_FLAGS;
        unsafe {
            mapper.map(page, data_frame, leaf_flags, parent_flags).unwrap();
        }

        mapper.unmap(page).unwrap();
        let l1e = mapper.get_l1_entry(page).unwrap();
        assert!(!l1e.get_flags().contains(PageTableFlags::PRESENT));

        // Unmapping again is a no-op, not an error.
        mapper.unmap(page).unwrap();
    }

    #[test]
    fn cache_mode_flags_are_distinct_per_mode() {
        let modes = [
            CacheMode::Uncacheable,
            CacheMode::WriteCombining,
            CacheMode::WriteThrough,
            CacheMode::WriteProtected,
            CacheMode::WriteBack,
            CacheMode::Uncached,
        ];
        for (i, &a) in modes.iter().enumerate() {
            for &b in &modes[i + 1..] {
                assert_ne!(cache_mode_flags(a), cache_mode_flags(b));
            }
        }
    }
}

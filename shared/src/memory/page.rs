//! Data structures representing pages and frames

use super::addr::{Length, PhysAddress, PhysExtent, VirtAddress, VirtExtent};

pub const PAGE_SIZE: Length = Length::from_raw(4096);

/// A 4 KiB physical memory frame
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Frame {
    start: PhysAddress,
}

impl Frame {
    /// Creates a `Frame` representing the frame beginning at `start`.
    ///
    /// # Panics
    ///
    /// Panics if `start` is not aligned to `PAGE_SIZE`.
    pub fn new(start: PhysAddress) -> Frame {
        assert!(start.is_aligned_to(PAGE_SIZE.as_raw()));
        Frame { start }
    }

    /// Gets the `Frame` that contains `addr`.
    pub fn containing(addr: PhysAddress) -> Frame {
        Self::new(addr.align_down(PAGE_SIZE.as_raw()))
    }

    /// Start address of the frame
    pub fn start(self) -> PhysAddress {
        self.start
    }

    /// Extent of memory contained in the frame
    pub fn extent(self) -> PhysExtent {
        PhysExtent::new(self.start, PAGE_SIZE)
    }

    /// The nth frame after `self`, or `None` if it's not addressable
    pub fn next(self, n: u64) -> Option<Frame> {
        let next_start = self
            .start
            .offset_by_checked(Length::from_raw(PAGE_SIZE.as_raw().checked_mul(n)?))?;
        Some(Self::new(next_start))
    }

    /// This frame's index: `start / PAGE_SIZE`. Used to index a frame bitmap.
    pub fn index(self) -> u64 {
        self.start.as_raw() / PAGE_SIZE.as_raw()
    }

    /// The frame whose index is `index`.
    pub fn from_index(index: u64) -> Frame {
        Frame::new(PhysAddress::from_raw(index * PAGE_SIZE.as_raw()))
    }
}

/// A 4 KiB virtual memory page
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Page {
    start: VirtAddress,
}

impl Page {
    /// Creates a `Page` representing the page beginning at `start`.
    ///
    /// # Panics
    ///
    /// Panics if `start` is not aligned to `PAGE_SIZE`.
    pub fn new(start: VirtAddress) -> Page {
        assert!(start.is_aligned_to(PAGE_SIZE.as_raw()));
        Page { start }
    }

    /// Gets the `Page` that contains `addr`.
    pub fn containing(addr: VirtAddress) -> Page {
        Self::new(addr.align_down(PAGE_SIZE.as_raw()))
    }

    /// Start address of the page
    pub fn start(&self) -> VirtAddress {
        self.start
    }

    /// Extent of virtual address space contained in the page
    pub fn extent(&self) -> VirtExtent {
        VirtExtent::new(self.start, PAGE_SIZE)
    }

    /// The nth page after `self`, or `None` if it's not addressable
    pub fn next(self, n: u64) -> Option<Page> {
        let next_start = self
            .start
            .offset_by_checked(Length::from_raw(PAGE_SIZE.as_raw().checked_mul(n)?))?;
        Some(Self::new(next_start))
    }

    /// Index into the PML4 (level 4) table: bits 39..47 of the address.
    pub fn l4_index(self) -> usize {
        ((self.start.as_raw() >> 39) & 0x1ff) as usize
    }

    /// Index into the PDPT (level 3) table: bits 30..38.
    pub fn l3_index(self) -> usize {
        ((self.start.as_raw() >> 30) & 0x1ff) as usize
    }

    /// Index into the PD (level 2) table: bits 21..29.
    pub fn l2_index(self) -> usize {
        ((self.start.as_raw() >> 21) & 0x1ff) as usize
    }

    /// Index into the PT (level 1) table: bits 12..20.
    pub fn l1_index(self) -> usize {
        ((self.start.as_raw() >> 12) & 0x1ff) as usize
    }
}

/// A contiguous range of physical memory frames. Always non-empty.
pub struct FrameRange {
    first: Frame,
    count: u64,
}

impl FrameRange {
    pub fn new(first: Frame, count: u64) -> Option<FrameRange> {
        if count == 0 {
            return None;
        }

        // Check that `count` frames after and including `first` are
        // addressable. `first.next(count)` may not be addressable if the range
        // includes the last frame.
        if first.next(count - 1).is_none() {
            return None;
        }

        Some(FrameRange { first, count })
    }

    // All frames between and including `first` to `last`
    pub fn between_inclusive(first: Frame, last: Frame) -> FrameRange {
        let len = last.start().distance_from(first.start());
        let count = len.as_raw() / PAGE_SIZE.as_raw();
        FrameRange { first, count }
    }

    // All frames between `first` to `last`, including `first` but not `last`
    pub fn between_exclusive(first: Frame, last: Frame) -> FrameRange {
        let len = last.start().distance_from(first.start());
        let count = len.as_raw() / PAGE_SIZE.as_raw() + 1;
        FrameRange { first, count }
    }

    pub fn first(&self) -> Frame {
        self.first
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    // The last `Frame` within the range
    pub fn last(&self) -> Frame {
        self.first.next(self.count - 1).unwrap()
    }

    // The first `Frame` after the range, or `None` if it ends at the last frame.
    pub fn end(&self) -> Option<Frame> {
        self.first.next(self.count)
    }

    /// A single-frame range containing just `frame`.
    pub fn one(frame: Frame) -> FrameRange {
        FrameRange {
            first: frame,
            count: 1,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Frame> {
        let first = self.first;
        (0..self.count).map(move |i| first.next(i).unwrap())
    }

    /// The smallest frame range that fully contains `extent`, extending past
    /// its edges to whole-frame boundaries if necessary.
    pub fn containing_extent(extent: PhysExtent) -> FrameRange {
        let first = Frame::containing(extent.address());
        let last = Frame::containing(extent.last_address());
        FrameRange::between_inclusive(first, last)
    }

    /// The largest frame range fully contained within `extent`, dropping any
    /// partial frame at either edge. `None` if no whole frame fits.
    pub fn contained_by_extent(extent: PhysExtent) -> Option<FrameRange> {
        let first = extent.address().align_up(PAGE_SIZE.as_raw());
        let end = extent.end_address().align_down(PAGE_SIZE.as_raw());
        if end <= first {
            return None;
        }
        let count = end.distance_from(first).as_raw() / PAGE_SIZE.as_raw();
        FrameRange::new(Frame::new(first), count)
    }
}

/// A contiguous range of virtual memory pages. Always non-empty.
pub struct PageRange {
    first: Page,
    count: u64,
}

impl PageRange {
    pub fn new(first: Page, count: u64) -> Option<PageRange> {
        if count == 0 {
            return None;
        }

        // Check that `count` frames after and including `first` are
        // addressable. `first.next(count)` may not be addressable if the range
        // includes the last frame.
        if first.next(count - 1).is_none() {
            return None;
        }

        Some(PageRange { first, count })
    }

    // All frames between and including `first` to `last`
    pub fn between_inclusive(first: Page, last: Page) -> PageRange {
        let len = last.start().distance_from(first.start());
        let count = len.as_raw() / PAGE_SIZE.as_raw();
        PageRange { first, count }
    }

    // All frames between `first` to `last`, including `first` but not `last`
    pub fn between_exclusive(first: Page, last: Page) -> PageRange {
        let len = last.start().distance_from(first.start());
        let count = len.as_raw() / PAGE_SIZE.as_raw() + 1;
        PageRange { first, count }
    }

    pub fn first(&self) -> Page {
        self.first
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    // The last `Page` within the range
    pub fn last(&self) -> Page {
        self.first.next(self.count - 1).unwrap()
    }

    // The first `Page` after the range, or `None` if it ends at the last frame.
    pub fn end(&self) -> Option<Page> {
        self.first.next(self.count)
    }

    pub fn iter(&self) -> impl Iterator<Item = Page> {
        let first = self.first;
        (0..self.count).map(move |i| first.next(i).unwrap())
    }

    /// The smallest page range that fully contains `extent`, extending past
    /// its edges to whole-page boundaries if necessary.
    pub fn containing_extent(extent: VirtExtent) -> PageRange {
        let first = Page::containing(extent.address());
        let last = Page::containing(extent.last_address());
        PageRange::between_inclusive(first, last)
    }
}

//! Physical memory map types, as handed down by the bootloader.

pub mod addr;
pub mod alloc;
pub mod page;

pub use addr::{PhysAddress, PhysExtent, VirtAddress, VirtExtent};
use page::{Frame, FrameRange, PAGE_SIZE};

/// Recognised memory-map region types.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum MemoryType {
    Available,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
    BootloaderReclaimable,
    KernelAndModules,
    Framebuffer,
}

/// One bootloader-reported physical region.
#[derive(Clone, Copy, Debug)]
pub struct MapEntry {
    pub extent: PhysExtent,
    pub mem_type: MemoryType,
}

/// Maximum number of entries a [`Map`] can hold. Generous for any real
/// firmware memory map.
pub const MAX_MAP_ENTRIES: usize = 128;

/// A fixed-capacity, ordered, non-overlapping memory map.
#[derive(Clone)]
pub struct Map {
    entries: [Option<MapEntry>; MAX_MAP_ENTRIES],
    len: usize,
}

impl Map {
    pub fn from_entries<T: IntoIterator<Item = MapEntry>>(entries: T) -> Map {
        let mut map = Map {
            entries: [None; MAX_MAP_ENTRIES],
            len: 0,
        };
        for entry in entries {
            map.entries[map.len] = Some(entry);
            map.len += 1;
        }
        map
    }

    pub fn entries(&self) -> impl Iterator<Item = &MapEntry> {
        self.entries[..self.len].iter().map(|e| e.as_ref().unwrap())
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut MapEntry> {
        self.entries[..self.len].iter_mut().map(|e| e.as_mut().unwrap())
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut MapEntry {
        self.entries[index].as_mut().unwrap()
    }

    /// Appends `entry`, panicking if the map is already at capacity.
    pub fn push(&mut self, entry: MapEntry) {
        assert!(self.len < MAX_MAP_ENTRIES, "memory map is full");
        self.entries[self.len] = Some(entry);
        self.len += 1;
    }

    pub fn iter_type(&self, mem_type: MemoryType) -> impl Iterator<Item = PhysExtent> + '_ {
        self.entries()
            .filter(move |e| e.mem_type == mem_type)
            .map(|e| e.extent)
    }

    /// `base + length` over entries of type Available, BootloaderReclaimable
    /// or KernelAndModules: the highest physical address the frame allocator
    /// needs a bit for.
    pub fn highest_usable_top(&self) -> PhysAddress {
        self.entries()
            .filter(|e| {
                matches!(
                    e.mem_type,
                    MemoryType::Available
                        | MemoryType::BootloaderReclaimable
                        | MemoryType::KernelAndModules
                )
            })
            .map(|e| e.extent.end_address())
            .max_by_key(|a| a.as_raw())
            .unwrap_or(PhysAddress::zero())
    }
}

impl Default for Map {
    fn default() -> Self {
        Map::from_entries(core::iter::empty())
    }
}

/// Converts an iterator of physical extents into the `FrameRange`s they
/// fully cover, skipping any partial frame at either end.
pub fn iter_map_frames(
    extents: impl Iterator<Item = PhysExtent>,
) -> impl Iterator<Item = FrameRange> {
    extents.filter_map(|extent| {
        let aligned = extent.shrink_to_alignment(PAGE_SIZE.as_raw())?;
        let count = aligned.length().as_raw() / PAGE_SIZE.as_raw();
        if count == 0 {
            return None;
        }
        FrameRange::new(Frame::new(aligned.address()), count)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_usable_top_ignores_reserved() {
        let map = Map::from_entries([
            MapEntry {
                extent: PhysExtent::from_raw_range_exclusive(0, PAGE_SIZE.as_raw() * 4),
                mem_type: MemoryType::Available,
            },
            MapEntry {
                extent: PhysExtent::from_raw_range_exclusive(
                    PAGE_SIZE.as_raw() * 4,
                    PAGE_SIZE.as_raw() * 100,
                ),
                mem_type: MemoryType::Reserved,
            },
        ]);
        assert_eq!(
            map.highest_usable_top(),
            PhysAddress::from_raw(PAGE_SIZE.as_raw() * 4)
        );
    }

    #[test]
    fn iter_map_frames_covers_whole_frames_only() {
        let extents = [PhysExtent::from_raw_range_exclusive(
            PAGE_SIZE.as_raw(),
            PAGE_SIZE.as_raw() * 3 + 1,
        )];
        let ranges: Vec<_> = iter_map_frames(extents.into_iter()).collect();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].count(), 2);
        assert_eq!(ranges[0].first(), Frame::new(PhysAddress::from_raw(PAGE_SIZE.as_raw())));
    }
}

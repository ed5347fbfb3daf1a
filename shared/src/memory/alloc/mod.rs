//! Allocators built on top of the physical memory map: the frame allocator,
//! the slab allocator, and the heap facade layered over both.

pub mod heap;
pub mod phys;
pub mod slab;

pub use phys::{BitmapFrameAllocator, BumpFrameAllocator, FrameAllocator, FrameReserveError};

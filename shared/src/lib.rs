#![cfg_attr(not(test), no_std)]
#![feature(int_roundings)]
#![feature(allocator_api)]
#![feature(ptr_metadata)]
#![feature(slice_ptr_get)]

//! The testable core of the kernel's memory subsystem: physical frame
//! allocation, the slab allocator, and the heap facade built on top. Built as
//! a library so it can be unit- and property-tested on the host target.

pub mod elf;
pub mod log;
pub mod memory;
pub mod terminal;
pub mod vga;

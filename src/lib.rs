//! Core kernel subsystems of a small RISC-V operating system: the
//! buddy-based physical page allocator and the virtual filesystem layer
//! with its in-memory filesystem.
//!
//! The layers below (boot, traps, device drivers, scheduler) and beside
//! (slab allocator, FDT parser) are collaborators with narrow contracts:
//! the FDT parser delivers a [`platform::PlatformInfo`], the slab
//! allocator stands behind `alloc`, and the lock primitives come from
//! `spin`. Everything here is buildable and testable on a host for that
//! reason.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod addr;
pub mod console;
pub mod error;
pub mod fd;
pub mod file;
pub mod fs;
pub mod hal;
pub mod kalloc;
pub mod kernel;
pub mod param;
pub mod platform;

//! The machine underneath nestos.
//!
//! `bedrock` is the only crate that knows how the i386 hardware is laid out:
//! address widths, register images, packed paging entries, the MMU walk and
//! the narrow device interfaces the kernel consumes. The hardware itself is
//! simulated (physical memory is a byte array, control registers are atomics)
//! so that the kernel above runs unmodified under a hosted test harness.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod kprint;

pub mod addressing;
pub mod dev;
pub mod interrupt;
pub mod memory;
pub mod mmu;
pub mod x86;

pub use spin_lock;

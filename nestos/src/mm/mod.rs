//! Memory management.
//!
//! Physical memory is split at the user boundary. Below it, the kernel image
//! and the [`KernelPages`] arena, direct-mapped into every address space by
//! one shared set of page tables. Above it, the frames the
//! [`FrameAllocator`] hands out for user pages.
//!
//! [`page_dir`] builds the per-process page directories on top of both.
pub mod arena;
pub mod frame;
pub mod page_dir;

pub use arena::KernelPages;
pub use frame::FrameAllocator;
pub use page_dir::{Access, Mapping, PageDir};

use crate::error::MappingError;
use alloc::vec::Vec;
use bedrock::{
    addressing::{Pa, Va, PAGE_SIZE},
    info,
    memory::{MemoryLayout, PhysicalMemory},
    x86::paging::{Pte, PteFlags, PAGE_TABLE_SPAN, PTE_COUNT},
};

/// Owner of physical memory and everything allocated from it.
pub struct MemoryManager {
    /// Installed memory.
    pub mem: PhysicalMemory,
    /// User frames.
    pub frames: FrameAllocator,
    /// Kernel pages.
    pub arena: KernelPages,
    /// The machine's memory map.
    pub layout: MemoryLayout,
    kernel_tables: Vec<Pa>,
}

impl MemoryManager {
    /// Install memory for `layout`, clear the zero frame and build the page
    /// tables that direct-map the kernel region.
    pub fn new(layout: MemoryLayout) -> Result<Self, MappingError> {
        if !layout.is_valid() {
            return Err(MappingError::Unaligned);
        }
        let mut mem = PhysicalMemory::new(layout.phys_size);
        let frames = FrameAllocator::new(
            Pa::new(layout.user_mem_start),
            Pa::new(layout.phys_size),
        );
        let mut arena = KernelPages::new(
            Pa::new(layout.kernel_image_end),
            Pa::new(layout.user_mem_start),
        );
        mem.zero_page(frames.zero_frame());

        let mut kernel_tables = Vec::new();
        for base in (0..layout.user_mem_start as u64).step_by(PAGE_TABLE_SPAN as usize) {
            let table = arena.alloc(1).ok_or(MappingError::NoMemory)?;
            for i in 0..PTE_COUNT {
                let frame = Pa::new((base as usize + i * PAGE_SIZE) as u32);
                let pte = Pte::present(frame, PteFlags::RW | PteFlags::G)
                    .ok_or(MappingError::Unaligned)?;
                mem.write_u32(table + (i * 4) as u32, pte.0);
            }
            kernel_tables.push(table);
        }
        info!(
            "Memory: {} user frames, {} kernel pages, {} kernel tables.",
            frames.free_count(),
            arena.unused(),
            kernel_tables.len()
        );

        Ok(Self {
            mem,
            frames,
            arena,
            layout,
            kernel_tables,
        })
    }

    /// The kernel/user boundary.
    #[inline]
    pub fn user_start(&self) -> Va {
        Va::new(self.layout.user_mem_start)
    }

    /// The frame every zero-fill-on-demand page reads from.
    #[inline]
    pub fn zero_frame(&self) -> Pa {
        self.frames.zero_frame()
    }

    /// Tables that direct-map the kernel region.
    pub(crate) fn kernel_tables(&self) -> &[Pa] {
        &self.kernel_tables
    }
}

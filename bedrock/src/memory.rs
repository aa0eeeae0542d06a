//! Physical memory and the machine's memory map.
use crate::{
    addressing::{Pa, PAGE_SIZE},
    x86::paging::PAGE_TABLE_SPAN,
};
use alloc::vec::Vec;

/// Where things are in physical memory.
///
/// `[0, kernel_image_end)` holds the kernel image,
/// `[kernel_image_end, user_mem_start)` is the kernel's page arena, and
/// `[user_mem_start, phys_size)` are the frames handed to user space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Bytes of installed memory.
    pub phys_size: u32,
    /// End of the kernel image.
    pub kernel_image_end: u32,
    /// The kernel/user boundary.
    pub user_mem_start: u32,
    /// Bytes of memory a guest kernel is given.
    pub guest_mem_size: u32,
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            phys_size: 0x0400_0000,
            kernel_image_end: 0x0020_0000,
            user_mem_start: 0x0100_0000,
            guest_mem_size: 0x0140_0000,
        }
    }
}

impl MemoryLayout {
    /// A small machine: 4 MiB of kernel, 4 MiB of user frames, 128 KiB guests.
    pub const fn compact() -> Self {
        Self {
            phys_size: 0x0080_0000,
            kernel_image_end: 0x0004_0000,
            user_mem_start: 0x0040_0000,
            guest_mem_size: 0x0002_0000,
        }
    }

    /// Whether every boundary is page aligned and in order.
    ///
    /// The user boundary must also start a page table, since every address
    /// space shares the kernel's tables below it.
    pub fn is_valid(&self) -> bool {
        let aligned = |v: u32| v as usize % PAGE_SIZE == 0;
        self.user_mem_start as u64 % PAGE_TABLE_SPAN == 0
            && aligned(self.phys_size)
            && aligned(self.kernel_image_end)
            && aligned(self.user_mem_start)
            && aligned(self.guest_mem_size)
            && self.kernel_image_end < self.user_mem_start
            && self.user_mem_start < self.phys_size
            && self.guest_mem_size > 0
            && (self.user_mem_start as u64 + self.guest_mem_size as u64) < (1 << 32)
    }

    /// Number of pages the kernel direct-maps.
    pub const fn kernel_pages(&self) -> usize {
        self.user_mem_start as usize / PAGE_SIZE
    }

    /// Number of guest pages.
    pub const fn guest_pages(&self) -> usize {
        self.guest_mem_size as usize / PAGE_SIZE
    }
}

/// Installed memory.
///
/// Accesses outside the installed range are a bus error, i.e. a kernel bug,
/// and panic.
pub struct PhysicalMemory {
    bytes: Vec<u8>,
}

impl PhysicalMemory {
    /// Install `size` bytes of zeroed memory.
    pub fn new(size: u32) -> Self {
        Self {
            bytes: alloc::vec![0; size as usize],
        }
    }

    /// Installed bytes.
    pub fn size(&self) -> u32 {
        self.bytes.len() as u32
    }

    fn range(&self, pa: Pa, len: usize) -> core::ops::Range<usize> {
        let start = pa.into_usize();
        assert!(
            start + len <= self.bytes.len(),
            "bus error: {:?}+{:#x} is outside installed memory",
            pa,
            len
        );
        start..start + len
    }

    /// Read `buf.len()` bytes at `pa`.
    pub fn read(&self, pa: Pa, buf: &mut [u8]) {
        let r = self.range(pa, buf.len());
        buf.copy_from_slice(&self.bytes[r]);
    }

    /// Write `data` at `pa`.
    pub fn write(&mut self, pa: Pa, data: &[u8]) {
        let r = self.range(pa, data.len());
        self.bytes[r].copy_from_slice(data);
    }

    /// Read a little-endian word.
    pub fn read_u32(&self, pa: Pa) -> u32 {
        let mut b = [0; 4];
        self.read(pa, &mut b);
        u32::from_le_bytes(b)
    }

    /// Write a little-endian word.
    pub fn write_u32(&mut self, pa: Pa, v: u32) {
        self.write(pa, &v.to_le_bytes());
    }

    /// Fill the frame at `pa` with zeroes.
    pub fn zero_page(&mut self, pa: Pa) {
        let r = self.range(pa.page_down(), PAGE_SIZE);
        self.bytes[r].fill(0);
    }

    /// Copy the frame at `src` over the frame at `dst`.
    pub fn copy_page(&mut self, dst: Pa, src: Pa) {
        let from = self.range(src.page_down(), PAGE_SIZE);
        let to = self.range(dst.page_down(), PAGE_SIZE);
        self.bytes.copy_within(from, to.start);
    }

    /// The frame at `pa`.
    pub fn page(&self, pa: Pa) -> &[u8] {
        let r = self.range(pa.page_down(), PAGE_SIZE);
        &self.bytes[r]
    }
}

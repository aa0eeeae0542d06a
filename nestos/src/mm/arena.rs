//! Kernel page arena.
//!
//! Page directories, page tables, kernel stacks and the fork copy buffer are
//! carved out of the kernel region above the kernel image. The arena tracks
//! those pages with a bitmap, one bit per page.
use alloc::vec::Vec;
use bedrock::addressing::{Pa, PAGE_SHIFT, PAGE_SIZE};

/// Pages of the kernel region not occupied by the image.
pub struct KernelPages {
    // 0: used, 1: unused
    bitmap: Vec<u64>,
    start: Pa,
    pages: usize,
}

impl KernelPages {
    /// Manage the pages of `[start, end)`.
    pub fn new(start: Pa, end: Pa) -> Self {
        let pages = (end - start) as usize >> PAGE_SHIFT;
        let mut bitmap = alloc::vec![u64::MAX; (pages + 63) / 64];
        // Pad back.
        for i in pages..bitmap.len() * 64 {
            bitmap[i / 64] &= !(1 << (i % 64));
        }
        Self {
            bitmap,
            start,
            pages,
        }
    }

    fn is_unused(&self, index: usize) -> bool {
        self.bitmap[index / 64] & (1 << (index % 64)) != 0
    }

    fn set_used(&mut self, index: usize) {
        let (pos, ofs) = (index / 64, index % 64);
        debug_assert_ne!(self.bitmap[pos] & (1 << ofs), 0);
        self.bitmap[pos] &= !(1 << ofs);
    }

    fn set_unused(&mut self, index: usize) {
        let (pos, ofs) = (index / 64, index % 64);
        assert_eq!(
            self.bitmap[pos] & (1 << ofs),
            0,
            "kernel page {:?} freed twice",
            self.start + (index << PAGE_SHIFT) as u32
        );
        self.bitmap[pos] |= 1 << ofs;
    }

    /// Allocate `cnt` contiguous pages. Their content is unspecified.
    pub fn alloc(&mut self, cnt: usize) -> Option<Pa> {
        let mut search = 0;
        while search + cnt <= self.pages {
            // Skip fully used qwords.
            if search % 64 == 0 && self.bitmap[search / 64] == 0 {
                search += 64;
                continue;
            }
            match (search..search + cnt).find(|&i| !self.is_unused(i)) {
                Some(used) => search = used + 1,
                None => {
                    for i in search..search + cnt {
                        self.set_used(i);
                    }
                    return Some(self.start + (search << PAGE_SHIFT) as u32);
                }
            }
        }
        None
    }

    /// Return `cnt` pages starting at `pa`.
    pub fn dealloc(&mut self, pa: Pa, cnt: usize) {
        let ofs = (pa - self.start) as usize >> PAGE_SHIFT;
        for i in ofs..ofs + cnt {
            self.set_unused(i);
        }
    }

    /// Number of unused pages.
    pub fn unused(&self) -> usize {
        self.bitmap.iter().map(|q| q.count_ones() as usize).sum()
    }

    /// Bytes spanned by `cnt` pages.
    pub const fn span(cnt: usize) -> u32 {
        (cnt * PAGE_SIZE) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_runs() {
        let mut arena = KernelPages::new(Pa::new(0x4_0000), Pa::new(0x4_0000 + 70 * 0x1000));
        assert_eq!(arena.unused(), 70);
        let one = arena.alloc(1).unwrap();
        let four = arena.alloc(4).unwrap();
        assert_eq!(one, Pa::new(0x4_0000));
        assert_eq!(four, Pa::new(0x4_1000));
        arena.dealloc(one, 1);
        // The hole is too small for a stack.
        assert_eq!(arena.alloc(4), Some(Pa::new(0x4_5000)));
        assert_eq!(arena.alloc(1), Some(one));
        assert_eq!(arena.unused(), 70 - 9);
    }

    #[test]
    fn exhaustion() {
        let mut arena = KernelPages::new(Pa::new(0), Pa::new(0x3000));
        assert!(arena.alloc(4).is_none());
        assert!(arena.alloc(3).is_some());
        assert!(arena.alloc(1).is_none());
    }
}

//! Memory abstraction.
//!
//! The kernel maps its own region `[0, USER_MEM_START)` directly: the first
//! page of kernel virtual memory is the first frame of physical memory, the
//! second page the second frame, and so on. Below the user boundary a kernel
//! virtual address and a physical address are therefore the same number.

/// Page size.
pub const PAGE_SIZE: usize = 0x1000;
/// Shift amount to get page index.
pub const PAGE_SHIFT: usize = 12;
/// Mask for page offset.
pub const PAGE_MASK: usize = 0xfff;
/// One past the last linear address of the 32-bit address space.
pub const VIRTUAL_ADDR_END: u64 = 1 << 32;

/// Physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Pa(u32);

impl Pa {
    /// PA with address 0.
    pub const ZERO: Self = Self(0);

    /// Create a new physical address.
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Cast into u32.
    #[inline]
    pub const fn into_u32(self) -> u32 {
        self.0
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0 as usize
    }

    /// The frame containing this address.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !(PAGE_MASK as u32))
    }

    /// Offset of this address within its frame.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 as usize & PAGE_MASK
    }

    /// Whether the address starts a frame.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Cast into the direct-mapped kernel virtual address.
    #[inline]
    pub const fn into_va(self) -> Va {
        Va(self.0)
    }
}

/// Virtual (linear) address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Va(u32);

impl Va {
    /// Create a new virtual address.
    #[inline(always)]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Cast into u32.
    #[inline]
    pub const fn into_u32(self) -> u32 {
        self.0
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0 as usize
    }

    /// The page containing this address.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !(PAGE_MASK as u32))
    }

    /// The first page boundary at or above this address, if it exists.
    #[inline]
    pub const fn page_up(self) -> Option<Self> {
        match self.0.checked_add(PAGE_MASK as u32) {
            Some(v) => Some(Self(v & !(PAGE_MASK as u32))),
            None => None,
        }
    }

    /// Offset of this address within its page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 as usize & PAGE_MASK
    }

    /// Whether the address starts a page.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Index into the page directory.
    #[inline]
    pub const fn pde_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Index into the page table.
    #[inline]
    pub const fn pte_index(self) -> usize {
        ((self.0 >> PAGE_SHIFT) & 0x3ff) as usize
    }

    /// Add `off`, failing on wrap-around.
    #[inline]
    pub const fn checked_add(self, off: u32) -> Option<Self> {
        match self.0.checked_add(off) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Cast a direct-mapped kernel address into physical address.
    #[inline]
    pub const fn into_pa(self) -> Pa {
        Pa(self.0)
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<u32> for $t {
            type Output = Self;

            fn add(self, other: u32) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<u32> for $t {
            fn add_assign(&mut self, other: u32) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<u32> for $t {
            type Output = Self;

            fn sub(self, other: u32) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::SubAssign<u32> for $t {
            fn sub_assign(&mut self, other: u32) {
                self.0 = self.0 - other
            }
        }
        impl core::ops::Sub<$t> for $t {
            type Output = u32;

            fn sub(self, other: $t) -> u32 {
                self.0 - other.0
            }
        }
        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}(0x{:x})", stringify!($t), self.0)
            }
        }
        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}(0x{:x})", stringify!($t), self.0)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_indices() {
        let va = Va::new(0x0140_3abc);
        assert_eq!(va.pde_index(), 5);
        assert_eq!(va.pte_index(), 3);
        assert_eq!(va.page_offset(), 0xabc);
        assert_eq!(va.page_down(), Va::new(0x0140_3000));
    }

    #[test]
    fn page_up_saturates_at_top() {
        assert_eq!(Va::new(0x1001).page_up(), Some(Va::new(0x2000)));
        assert_eq!(Va::new(0x2000).page_up(), Some(Va::new(0x2000)));
        assert_eq!(Va::new(0xffff_f001).page_up(), None);
    }
}

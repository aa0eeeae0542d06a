//! Two-level i386 paging structures.
//!
//! A page directory holds [`PDE_COUNT`] entries, each naming a page table of
//! [`PTE_COUNT`] entries, each naming a 4 KiB frame. The three bits the
//! hardware leaves to software (9..=11) carry the page's [`Availability`]
//! while the entry is not present: whether a future fault may materialize it.
//!
//! Entries are plain `u32` words. Code outside this module reads them through
//! the accessors only.
use crate::addressing::{Pa, PAGE_SIZE};

/// Entries of a page directory.
pub const PDE_COUNT: usize = 1024;
/// Entries of a page table.
pub const PTE_COUNT: usize = 1024;
/// Bytes of address space covered by one page table.
pub const PAGE_TABLE_SPAN: u64 = (PTE_COUNT * PAGE_SIZE) as u64;

const AVAILABLE_SHIFT: u32 = 9;
const AVAILABLE_MASK: u32 = 0b111 << AVAILABLE_SHIFT;
const ADDR_MASK: u32 = 0xffff_f000;

/// Whether an absent page may be brought in on demand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Availability {
    /// An access is illegal.
    Unavailable,
    /// A fault may map the page (zero-fill-on-demand).
    Available,
}

impl Availability {
    const fn into_bits(self) -> u32 {
        match self {
            Self::Unavailable => 0,
            Self::Available => 1 << AVAILABLE_SHIFT,
        }
    }

    const fn from_bits(entry: u32) -> Self {
        if entry & AVAILABLE_MASK != 0 {
            Self::Available
        } else {
            Self::Unavailable
        }
    }
}

bitflags::bitflags! {
    /// Flags for pde.
    pub struct PdeFlags: u32 {
        /// Present; must be 1 to reference a page table
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 4-MByte region controlled by this entry
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 4-MByte region controlled by this entry
        const US = 1 << 2;
        /// Page-level write-through
        const PWT = 1 << 3;
        /// Page-level cache disable
        const PCD = 1 << 4;
        /// Accessed
        const A = 1 << 5;
        #[doc(hidden)] const _IGN_6 = 1 << 6;
        /// Page size; must be 0 to reference a page table
        const PS = 1 << 7;
        /// Global; ignored by the hardware for a 4-KByte table, kept for symmetry with the kernel's PTEs
        const G = 1 << 8;
    }
}

bitflags::bitflags! {
    /// Flags for pte.
    pub struct PteFlags: u32 {
        /// Present; must be 1 to map a 4-KByte page
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 4-KByte page referenced by this entry
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 4-KByte page referenced by this entry
        const US = 1 << 2;
        /// Page-level write-through
        const PWT = 1 << 3;
        /// Page-level cache disable
        const PCD = 1 << 4;
        /// Accessed
        const A = 1 << 5;
        /// Dirty
        const D = 1 << 6;
        /// Page attribute table
        const PAT = 1 << 7;
        /// Global; the translation survives a CR3 reload
        const G = 1 << 8;
    }
}

macro_rules! impl_entry {
    ($t: ident, $flags: ident) => {
        impl $t {
            /// A not-present entry carrying `availability`.
            #[inline]
            pub const fn absent(availability: Availability) -> Self {
                Self(availability.into_bits())
            }

            /// A present entry naming `pa` with `flags`.
            ///
            /// Returns `None` if `pa` is not frame aligned.
            #[inline]
            pub fn present(pa: Pa, flags: $flags) -> Option<Self> {
                if !pa.is_page_aligned() {
                    None
                } else {
                    Some(Self(pa.into_u32() | (flags | $flags::P).bits()))
                }
            }

            /// Get a flags this entry.
            #[inline]
            pub const fn flags(&self) -> $flags {
                $flags::from_bits_truncate(self.0)
            }

            /// Whether the entry is present.
            #[inline]
            pub const fn is_present(&self) -> bool {
                self.0 & $flags::P.bits() != 0
            }

            /// Get a physical address pointed by this entry.
            #[inline]
            pub const fn pa(&self) -> Option<Pa> {
                if self.is_present() {
                    Some(Pa::new(self.0 & ADDR_MASK))
                } else {
                    None
                }
            }

            /// Availability recorded in the software bits.
            #[inline]
            pub const fn availability(&self) -> Availability {
                Availability::from_bits(self.0)
            }

            /// Record `availability` in the software bits.
            #[inline]
            pub fn set_availability(&mut self, availability: Availability) -> &mut Self {
                self.0 = (self.0 & !AVAILABLE_MASK) | availability.into_bits();
                self
            }

            /// Set or clear `flag`, leaving the rest of the entry untouched.
            #[inline]
            pub fn set_flag(&mut self, flag: $flags, on: bool) -> &mut Self {
                if on {
                    self.0 |= flag.bits();
                } else {
                    self.0 &= !flag.bits();
                }
                self
            }
        }

        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self.pa() {
                    Some(pa) => write!(f, "{}({:?}, {:?})", stringify!($t), pa, self.flags()),
                    None => write!(f, "{}(absent, {:?})", stringify!($t), self.availability()),
                }
            }
        }
    };
}

/// Page directory entry.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pde(pub u32);

/// Page table entry.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub u32);

impl_entry!(Pde, PdeFlags);
impl_entry!(Pte, PteFlags);

const _: () = assert!(core::mem::size_of::<Pde>() == 4);
const _: () = assert!(core::mem::size_of::<Pte>() == 4);

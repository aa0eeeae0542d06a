//! Segment selectors.
//!
//! The flat kernel and user segments span the whole address space. The four
//! guest segments live in the spare GDT slots and are based at the user
//! boundary, so a guest sees its memory starting at linear address zero.

/// Kernel code segment selector.
pub const SEGSEL_KERNEL_CS: u32 = 0x10;
/// Kernel data segment selector.
pub const SEGSEL_KERNEL_DS: u32 = 0x18;
/// User code segment selector.
pub const SEGSEL_USER_CS: u32 = 0x23;
/// User data segment selector.
pub const SEGSEL_USER_DS: u32 = 0x2b;

const SEGSEL_SPARE0: u32 = 0x30;
const SEGSEL_SPARE1: u32 = 0x38;
const SEGSEL_SPARE2: u32 = 0x40;
const SEGSEL_SPARE3: u32 = 0x48;
// Guest segments are always entered at ring 3.
const SEGSEL_GUEST_RPL_MASK: u32 = 3;

/// Guest kernel code segment selector.
pub const SEGSEL_GUEST_KERNEL_CS: u32 = SEGSEL_SPARE0 | SEGSEL_GUEST_RPL_MASK;
/// Guest kernel data segment selector.
pub const SEGSEL_GUEST_KERNEL_DS: u32 = SEGSEL_SPARE1 | SEGSEL_GUEST_RPL_MASK;
/// Guest user code segment selector.
pub const SEGSEL_GUEST_USER_CS: u32 = SEGSEL_SPARE2 | SEGSEL_GUEST_RPL_MASK;
/// Guest user data segment selector.
pub const SEGSEL_GUEST_USER_DS: u32 = SEGSEL_SPARE3 | SEGSEL_GUEST_RPL_MASK;

/// Segments known to the GDT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Segment {
    KernelCode,
    KernelData,
    UserCode,
    UserData,
    GuestKernelCode,
    GuestKernelData,
    GuestUserCode,
    GuestUserData,
}

impl Segment {
    /// Selector of this segment.
    pub const fn into_selector(self) -> u32 {
        match self {
            Self::KernelCode => SEGSEL_KERNEL_CS,
            Self::KernelData => SEGSEL_KERNEL_DS,
            Self::UserCode => SEGSEL_USER_CS,
            Self::UserData => SEGSEL_USER_DS,
            Self::GuestKernelCode => SEGSEL_GUEST_KERNEL_CS,
            Self::GuestKernelData => SEGSEL_GUEST_KERNEL_DS,
            Self::GuestUserCode => SEGSEL_GUEST_USER_CS,
            Self::GuestUserData => SEGSEL_GUEST_USER_DS,
        }
    }

    /// Look up the segment named by `selector`.
    pub const fn from_selector(selector: u32) -> Option<Self> {
        match selector {
            SEGSEL_KERNEL_CS => Some(Self::KernelCode),
            SEGSEL_KERNEL_DS => Some(Self::KernelData),
            SEGSEL_USER_CS => Some(Self::UserCode),
            SEGSEL_USER_DS => Some(Self::UserData),
            SEGSEL_GUEST_KERNEL_CS => Some(Self::GuestKernelCode),
            SEGSEL_GUEST_KERNEL_DS => Some(Self::GuestKernelData),
            SEGSEL_GUEST_USER_CS => Some(Self::GuestUserCode),
            SEGSEL_GUEST_USER_DS => Some(Self::GuestUserData),
            _ => None,
        }
    }

    /// Whether this is one of the guest segments.
    pub const fn is_guest(self) -> bool {
        matches!(
            self,
            Self::GuestKernelCode | Self::GuestKernelData | Self::GuestUserCode | Self::GuestUserData
        )
    }

    /// Linear base of the segment.
    pub const fn base(self, user_mem_start: u32) -> u32 {
        if self.is_guest() {
            user_mem_start
        } else {
            0
        }
    }
}

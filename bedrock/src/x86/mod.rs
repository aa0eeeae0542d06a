//! i386 specific

pub mod interrupt;
pub mod paging;
pub mod segmentation;

/// Privilege Levels.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum PrivilegeLevel {
    Ring0 = 0,
    Ring1 = 1,
    Ring2 = 2,
    Ring3 = 3,
}

impl PrivilegeLevel {
    /// The requested privilege level encoded in a segment selector.
    pub const fn from_selector(selector: u32) -> Self {
        match selector & 3 {
            0 => Self::Ring0,
            1 => Self::Ring1,
            2 => Self::Ring2,
            _ => Self::Ring3,
        }
    }
}

bitflags::bitflags! {
    /// eflags.
    #[repr(transparent)]
    pub struct Eflags: u32 {
        /// Carry Flag
        const CF = 1 << 0;
        /// Must be 1.
        const _1 = 1 << 1;
        /// Parity Flag
        const PF = 1 << 2;
        /// Adjust Flag
        const AF = 1 << 4;
        /// Zero Flag
        const ZF = 1 << 6;
        /// Sign Flag
        const SF = 1 << 7;
        /// Trap Flag
        const TF = 1 << 8;
        /// Interrupt enable.
        ///
        /// Set to respond to maskable hardware interrupts; cleared to
        /// inhibit them. Exceptions are not affected.
        const IF = 1 << 9;
        /// Direction Flag
        const DF = 1 << 10;
        /// Overflow Flag
        const OF = 1 << 11;
        /// I/O privilege level field - bit 0
        const IOPL0 = 1 << 12;
        /// I/O privilege level field - bit 1
        const IOPL1 = 1 << 13;
        /// Nested task
        const NT = 1 << 14;
        /// Resume
        const RF = 1 << 16;
        /// Virtual-8086 mode
        const VM = 1 << 17;
        /// Alignment check
        const AC = 1 << 18;
        /// Virtual interrupt flag
        const VIF = 1 << 19;
        /// Virtual interrupt pending
        const VIP = 1 << 20;
        /// Able to use CPUID instruction.
        const ID = 1 << 21;
    }
}

impl Eflags {
    /// Flags that only privileged code may change.
    pub fn privileged() -> Self {
        Self::IOPL0 | Self::IOPL1 | Self::NT | Self::RF | Self::VM | Self::VIF | Self::VIP | Self::ID
    }

    /// Whether a return path running with `self` may install the raw flag
    /// word `new`.
    ///
    /// `new` must keep the reserved-one bit, set no reserved-zero bit, and
    /// leave every privileged flag as it is in `self`.
    pub fn permits(self, new: u32) -> bool {
        match Eflags::from_bits(new) {
            Some(new) => {
                new.contains(Self::_1)
                    && (new & Self::privileged()) == (self & Self::privileged())
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_arithmetic_flags_only() {
        let old = Eflags::_1 | Eflags::IF;
        assert!(old.permits((Eflags::_1 | Eflags::CF | Eflags::ZF).bits()));
        assert!(!old.permits((Eflags::_1 | Eflags::IOPL0).bits()));
        assert!(!old.permits(Eflags::IF.bits()));
        // bit 3 is reserved.
        assert!(!old.permits(Eflags::_1.bits() | 1 << 3));
    }

    #[test]
    fn selector_rpl() {
        assert_eq!(PrivilegeLevel::from_selector(0x10), PrivilegeLevel::Ring0);
        assert_eq!(PrivilegeLevel::from_selector(0x23), PrivilegeLevel::Ring3);
    }
}

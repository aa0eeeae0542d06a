//! Interrupt vectors, gate descriptors and the trap frame.
use super::{
    segmentation::{Segment, SEGSEL_USER_CS},
    Eflags, PrivilegeLevel,
};

/// Number of entries of the interrupt descriptor table.
pub const IDT_ENTS: usize = 256;

/// Processor-defined exception vectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum ExceptionVector {
    DivideError = 0,
    Debug = 1,
    NonMaskableInterrupt = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRangeExceeded = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    CoprocessorSegmentOverrun = 9,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackSegmentFault = 12,
    GeneralProtection = 13,
    PageFault = 14,
    FloatingPoint = 16,
    AlignmentCheck = 17,
    MachineCheck = 18,
    SimdFloatingPoint = 19,
}

impl ExceptionVector {
    /// The vector number.
    pub const fn vector(self) -> u8 {
        self as u8
    }

    /// Whether the processor pushes an error code for this exception.
    pub const fn has_error_code(self) -> bool {
        matches!(
            self,
            Self::DoubleFault
                | Self::InvalidTss
                | Self::SegmentNotPresent
                | Self::StackSegmentFault
                | Self::GeneralProtection
                | Self::PageFault
                | Self::AlignmentCheck
        )
    }
}

/// Kind of an IDT gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateKind {
    /// Entering the gate leaves IF as it is.
    Trap,
    /// Entering the gate clears IF.
    Interrupt,
}

/// A decoded IDT gate descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gate {
    pub kind: GateKind,
    pub dpl: PrivilegeLevel,
}

impl Gate {
    /// The gate every vector starts with: a kernel-only trap gate into the
    /// common dispatcher.
    pub const fn default_wrapper() -> Self {
        Self {
            kind: GateKind::Trap,
            dpl: PrivilegeLevel::Ring0,
        }
    }

    /// Whether software running at `cpl` may raise this vector with `int`.
    pub fn permits(&self, cpl: PrivilegeLevel) -> bool {
        cpl <= self.dpl
    }
}

/// Number of 32-bit words in a [`TrapFrame`].
pub const TRAP_FRAME_WORDS: usize = 20;
/// Size of a [`TrapFrame`] in bytes.
pub const TRAP_FRAME_SIZE: usize = TRAP_FRAME_WORDS * 4;

/// Registers saved on every trap, in the order the common entry stub pushes
/// them (lowest address first).
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    /// Vector of the trap.
    pub cause: u32,
    /// Faulting linear address, for page faults.
    pub cr2: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Slot of the `esp` pushed by `pusha`; ignored.
    pub zero: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

const _: () = assert!(core::mem::size_of::<TrapFrame>() == TRAP_FRAME_SIZE);

impl TrapFrame {
    /// Create frame for new user thread.
    pub fn new_user(eip: u32, esp: u32) -> Self {
        Self::with_segments(Segment::UserCode, Segment::UserData, eip, esp)
    }

    /// Create a frame that enters `code`/`data` at `eip` with stack `esp`.
    pub fn with_segments(code: Segment, data: Segment, eip: u32, esp: u32) -> Self {
        let ds = data.into_selector();
        Self {
            ds,
            es: ds,
            fs: ds,
            gs: ds,
            ss: ds,
            cs: code.into_selector(),
            eip,
            esp,
            eflags: (Eflags::IF | Eflags::_1).bits(),
            ..Default::default()
        }
    }

    /// The vector this frame was saved for.
    #[inline]
    pub fn vector(&self) -> u8 {
        self.cause as u8
    }

    /// Privilege level the trapped code ran at.
    #[inline]
    pub fn privilege_level(&self) -> PrivilegeLevel {
        PrivilegeLevel::from_selector(self.cs)
    }

    /// Whether the trapped code is the flat user segment.
    #[inline]
    pub fn is_user_code(&self) -> bool {
        self.cs == SEGSEL_USER_CS
    }

    /// Serialize into the in-memory layout.
    pub fn to_words(&self) -> [u32; TRAP_FRAME_WORDS] {
        [
            self.cause,
            self.cr2,
            self.ds,
            self.es,
            self.fs,
            self.gs,
            self.edi,
            self.esi,
            self.ebp,
            self.zero,
            self.ebx,
            self.edx,
            self.ecx,
            self.eax,
            self.error_code,
            self.eip,
            self.cs,
            self.eflags,
            self.esp,
            self.ss,
        ]
    }

    /// Deserialize from the in-memory layout.
    pub fn from_words(w: &[u32; TRAP_FRAME_WORDS]) -> Self {
        Self {
            cause: w[0],
            cr2: w[1],
            ds: w[2],
            es: w[3],
            fs: w[4],
            gs: w[5],
            edi: w[6],
            esi: w[7],
            ebp: w[8],
            zero: w[9],
            ebx: w[10],
            edx: w[11],
            ecx: w[12],
            eax: w[13],
            error_code: w[14],
            eip: w[15],
            cs: w[16],
            eflags: w[17],
            esp: w[18],
            ss: w[19],
        }
    }

    /// Serialize into bytes, little endian.
    pub fn to_bytes(&self) -> [u8; TRAP_FRAME_SIZE] {
        let mut out = [0; TRAP_FRAME_SIZE];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.to_words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Deserialize from bytes, little endian.
    pub fn from_bytes(b: &[u8; TRAP_FRAME_SIZE]) -> Self {
        let mut words = [0; TRAP_FRAME_WORDS];
        for (word, chunk) in words.iter_mut().zip(b.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self::from_words(&words)
    }
}

impl core::fmt::Debug for TrapFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "cause: {:#x} cr2: {:#010x} error_code: {:#x}\n\
             eax: {:#010x} ebx: {:#010x} ecx: {:#010x} edx: {:#010x}\n\
             esi: {:#010x} edi: {:#010x} ebp: {:#010x} esp: {:#010x}\n\
             eip: {:#010x} eflags: {:?}\n\
             cs: {:#x} ds: {:#x} es: {:#x} fs: {:#x} gs: {:#x} ss: {:#x}",
            self.cause,
            self.cr2,
            self.error_code,
            self.eax,
            self.ebx,
            self.ecx,
            self.edx,
            self.esi,
            self.edi,
            self.ebp,
            self.esp,
            self.eip,
            Eflags::from_bits_truncate(self.eflags),
            self.cs,
            self.ds,
            self.es,
            self.fs,
            self.gs,
            self.ss,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bytes_follow_ureg_layout() {
        let mut frame = TrapFrame::new_user(0x0100_0000, 0xffff_e000);
        frame.cause = 14;
        frame.eax = 0xdead_beef;
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[0..4], &14u32.to_le_bytes());
        assert_eq!(&bytes[13 * 4..14 * 4], &0xdead_beefu32.to_le_bytes());
        assert_eq!(TrapFrame::from_bytes(&bytes), frame);
    }

    #[test]
    fn user_int_on_kernel_gate_is_refused() {
        let gate = Gate::default_wrapper();
        assert!(gate.permits(PrivilegeLevel::Ring0));
        assert!(!gate.permits(PrivilegeLevel::Ring3));
    }

    #[test]
    fn exception_vectors_decode() {
        assert_eq!(
            ExceptionVector::try_from(14u8).ok(),
            Some(ExceptionVector::PageFault)
        );
        assert!(ExceptionVector::try_from(15u8).is_err());
        assert!(ExceptionVector::PageFault.has_error_code());
    }
}

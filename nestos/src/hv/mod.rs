//! Guest virtualization.
//!
//! A guest process runs a kernel of its own. The host intercepts every trap
//! the guest takes and re-delivers it through the guest's virtual IDT, the
//! way a processor would: a small frame is pushed on the guest stack, the
//! guest enters its handler in guest kernel mode, and delivery stays off
//! until the guest returns with the `IRET` hypercall.
//!
//! Guest-visible addresses are relative to the start of guest memory, which
//! the host places at the user boundary. Anything a guest does wrong
//! crashes the guest, never the host.
pub mod hypercall;

use crate::{
    thread::Tid,
    trap::{KEYBOARD_VECTOR, TIMER_VECTOR},
    Kernel,
};
use bedrock::{
    interrupt::InterruptGuard,
    memory::MemoryLayout,
    warning,
    x86::{
        interrupt::{ExceptionVector, TrapFrame},
        segmentation::Segment,
        Eflags,
    },
};
use core::fmt;
use hypercall::HvOp;

/// Vector of the hypercall gate.
pub const HV_INT: u8 = 0xDE;
/// What the `MAGIC` hypercall answers.
pub const HV_MAGIC: u32 = 0x15410DE0;
/// Frame tag of a delivery that interrupted guest user mode.
pub const GUEST_INTERRUPT_UMODE: u32 = 0x15410F00;
/// Frame tag of a delivery that interrupted guest kernel mode.
pub const GUEST_INTERRUPT_KMODE: u32 = 0x15410F0C;
/// Most bytes one print hypercall writes.
pub const HV_PRINT_MAX: usize = 256;
/// Entries of the virtual IDT: the exceptions, the timer and the keyboard.
pub const VIRTUAL_IDT_LEN: usize = 34;
/// Exit status of a crashed guest.
pub const GUEST_CRASH_STATUS: i32 = -3;

/// An address as the guest sees it.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct GuestAddr(u32);

impl GuestAddr {
    /// Wrap a guest-relative address.
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Cast into u32.
    #[inline]
    pub const fn into_u32(self) -> u32 {
        self.0
    }

    /// The host address of `[self, self + len)`, if the range lies in guest
    /// memory.
    pub fn into_host(self, len: u32, layout: &MemoryLayout) -> Option<u32> {
        if self.0 as u64 + len as u64 <= layout.guest_mem_size as u64 {
            Some(layout.user_mem_start + self.0)
        } else {
            None
        }
    }

    /// The guest address of host address `addr`, if it lies in guest memory.
    pub fn from_host(addr: u32, layout: &MemoryLayout) -> Option<Self> {
        addr.checked_sub(layout.user_mem_start)
            .filter(|&rel| rel < layout.guest_mem_size)
            .map(Self)
    }
}

/// The virtual processor state of a guest.
#[derive(Clone, Debug)]
pub struct GuestResource {
    /// Whether virtual interrupts are delivered.
    pub interrupt_enable: bool,
    /// Host address of the guest's kernel stack, used when an interrupt
    /// arrives in guest user mode.
    pub esp0: u32,
    /// The guest's handler for each virtual vector.
    pub virtual_idt: [Option<GuestAddr>; VIRTUAL_IDT_LEN],
    /// A timer interrupt arrived while the guest was switched out.
    pub pending_timer: bool,
}

impl Default for GuestResource {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestResource {
    /// A guest with delivery off and no handlers.
    pub const fn new() -> Self {
        Self {
            interrupt_enable: false,
            esp0: 0,
            virtual_idt: [None; VIRTUAL_IDT_LEN],
            pending_timer: false,
        }
    }
}

/// Why a guest is crashed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuestFault {
    /// `%eax` names no hypercall.
    UnknownHypercall(u32),
    /// The hypercall exists but is not supported.
    Unsupported(HvOp),
    /// A guest address is outside guest memory, or not accessible.
    BadAddress(u32),
    /// An argument is out of range.
    BadArgument(&'static str),
    /// `IRET` tried to install a kernel stack or privileged flags.
    BadIret,
    /// The frame could not be pushed on the guest stack.
    BadStack(u32),
    /// An interrupt arrived with delivery off or no handler for it.
    TripleFault(u8),
    /// The guest trapped outside its own code.
    HostTrap(u8),
}

impl fmt::Display for GuestFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownHypercall(op) => write!(f, "unknown hypercall {}", op),
            Self::Unsupported(op) => write!(f, "{:?} is not supported", op),
            Self::BadAddress(addr) => write!(f, "bad guest address {:#x}", addr),
            Self::BadArgument(what) => write!(f, "bad argument: {}", what),
            Self::BadIret => write!(f, "iret with a kernel stack or privileged flags"),
            Self::BadStack(esp) => write!(f, "cannot push a frame below {:#x}", esp),
            Self::TripleFault(vector) => write!(f, "interrupt {} caused a triple fault", vector),
            Self::HostTrap(vector) => write!(f, "trap {:#x} outside guest code", vector),
        }
    }
}

/// Install the hypercall gate.
///
/// Hypercalls never reach the trap table's handlers: the dispatcher hands
/// every trap of a guest to [`Kernel::handle_virtual_interrupt`].
pub fn install(table: &mut crate::trap::TrapTable) {
    table.register(HV_INT, crate::syscall::user_gate(), None);
}

impl Kernel {
    /// The guest state of the running process.
    ///
    /// # Panics
    /// When the running process is not a guest.
    pub(crate) fn guest_mut(&mut self) -> &mut GuestResource {
        let pid = self.blocks.current_tcb().pid;
        match self.blocks.current_pcb_mut().guest.as_mut() {
            Some(guest) => guest,
            None => panic!("process {} is not a guest", pid),
        }
    }

    fn guest_of(&mut self, tid: Tid) -> Option<&mut GuestResource> {
        let pid = self.blocks.tcb(tid)?.pid;
        self.blocks.pcb_mut(pid)?.guest.as_mut()
    }

    /// Handle a trap taken in guest code.
    pub(crate) fn handle_virtual_interrupt(&mut self, guard: &InterruptGuard, frame: &mut TrapFrame) {
        if let Err(fault) = self.virtual_interrupt(guard, frame) {
            self.crash_guest(guard, frame, fault);
        }
    }

    fn virtual_interrupt(
        &mut self,
        guard: &InterruptGuard,
        frame: &mut TrapFrame,
    ) -> Result<(), GuestFault> {
        let vector = frame.vector();
        match vector {
            HV_INT => self.run_hypercall(guard, frame),
            TIMER_VECTOR => {
                let tid = self.blocks.current();
                crate::timer::timer_interrupt(self, guard, frame);
                if self.blocks.current() != tid {
                    if let Some(guest) = self.guest_of(tid) {
                        guest.pending_timer = true;
                    }
                    return Ok(());
                }
                if !self.guest_mut().interrupt_enable {
                    return Ok(());
                }
                self.deliver(frame, vector, 0)
            }
            KEYBOARD_VECTOR => {
                if let Some(scancode) = self.ps2.read() {
                    self.keyboard.push(scancode);
                }
                let event = self.keyboard.next_event();
                if !self.guest_mut().interrupt_enable {
                    return Ok(());
                }
                self.deliver(frame, vector, event.map_or(0, |e| e.0))
            }
            _ => {
                let has_code = [
                    ExceptionVector::GeneralProtection,
                    ExceptionVector::PageFault,
                ]
                .iter()
                .any(|v| v.vector() == vector);
                let error_code = if has_code { frame.error_code } else { 0 };
                self.deliver(frame, vector, error_code)
            }
        }
    }

    // Push one word on the guest stack at host address `*esp`.
    fn push_guest(&mut self, esp: &mut u32, word: u32) -> Result<(), GuestFault> {
        let layout = self.mm.layout;
        let sp = esp
            .checked_sub(4)
            .and_then(|sp| GuestAddr::from_host(sp, &layout))
            .and_then(|sp| sp.into_host(4, &layout))
            .ok_or(GuestFault::BadStack(*esp))?;
        let pd = self.blocks.current_pcb().page_dir;
        self.mm
            .write_user_u32(pd, sp, word)
            .map_err(|_| GuestFault::BadStack(*esp))?;
        *esp = sp;
        Ok(())
    }

    /// Enter the guest's handler for `vector`.
    ///
    /// The guest's stack receives, from high to low: the old stack pointer,
    /// flags and [`GUEST_INTERRUPT_UMODE`] when the guest was in user mode
    /// (on `esp0`), or flags and [`GUEST_INTERRUPT_KMODE`] when it was in
    /// kernel mode (on its current stack); then the instruction pointer,
    /// `error_code` and the faulting address.
    pub(crate) fn deliver(
        &mut self,
        frame: &mut TrapFrame,
        vector: u8,
        error_code: u32,
    ) -> Result<(), GuestFault> {
        let layout = self.mm.layout;
        let ums = layout.user_mem_start;
        let guest = self.guest_mut();
        let handler = guest
            .virtual_idt
            .get(vector as usize)
            .copied()
            .flatten()
            .filter(|_| guest.interrupt_enable)
            .ok_or(GuestFault::TripleFault(vector))?;
        guest.interrupt_enable = false;
        let esp0 = guest.esp0;
        let eflags = frame.eflags | Eflags::IF.bits();

        let kernel_code = Segment::GuestKernelCode.into_selector();
        let mut esp = if frame.cs != kernel_code {
            let mut esp = esp0;
            self.push_guest(&mut esp, frame.esp)?;
            self.push_guest(&mut esp, eflags)?;
            self.push_guest(&mut esp, GUEST_INTERRUPT_UMODE)?;
            esp
        } else {
            let mut esp = frame.esp.wrapping_add(ums);
            self.push_guest(&mut esp, eflags)?;
            self.push_guest(&mut esp, GUEST_INTERRUPT_KMODE)?;
            esp
        };
        let fault_addr = if vector == ExceptionVector::PageFault.vector() {
            frame.cr2.wrapping_sub(ums)
        } else {
            0
        };
        self.push_guest(&mut esp, frame.eip)?;
        self.push_guest(&mut esp, error_code)?;
        self.push_guest(&mut esp, fault_addr)?;

        // The guest kernel region becomes accessible to guest kernel mode.
        let pd = self.blocks.current_pcb().page_dir;
        self.mm
            .set_user_range(pd, ums, ums, true)
            .map_err(|_| GuestFault::BadAddress(0))?;

        let ds = Segment::GuestKernelData.into_selector();
        frame.cs = kernel_code;
        frame.ds = ds;
        frame.es = ds;
        frame.fs = ds;
        frame.gs = ds;
        frame.ss = ds;
        frame.esp = esp - ums;
        frame.eip = handler.into_u32();
        Ok(())
    }

    /// Deliver a timer interrupt the running guest missed while switched
    /// out.
    ///
    /// Returns whether anything happened to `frame`.
    pub(crate) fn deliver_pending_timer(
        &mut self,
        guard: &InterruptGuard,
        frame: &mut TrapFrame,
    ) -> bool {
        let in_guest = Segment::from_selector(frame.cs).map_or(false, Segment::is_guest);
        let enabled = match self.blocks.current_pcb_mut().guest.as_mut() {
            Some(guest) if guest.pending_timer && in_guest => {
                guest.pending_timer = false;
                guest.interrupt_enable
            }
            _ => return false,
        };
        if !enabled {
            return false;
        }
        if let Err(fault) = self.deliver(frame, TIMER_VECTOR, 0) {
            self.crash_guest(guard, frame, fault);
        }
        true
    }

    /// Terminate the running guest as if it exited with
    /// [`GUEST_CRASH_STATUS`].
    pub(crate) fn crash_guest(&mut self, guard: &InterruptGuard, frame: &mut TrapFrame, fault: GuestFault) {
        warning!(
            "Crashing guest process {}: {}.",
            self.blocks.current_tcb().pid,
            fault
        );
        self.set_status(GUEST_CRASH_STATUS);
        self.vanish(guard, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_addresses_stay_in_guest_memory() {
        let layout = MemoryLayout::compact();
        let top = layout.guest_mem_size;
        assert_eq!(
            GuestAddr::new(0).into_host(4, &layout),
            Some(layout.user_mem_start)
        );
        assert_eq!(GuestAddr::new(top - 4).into_host(4, &layout), Some(layout.user_mem_start + top - 4));
        assert_eq!(GuestAddr::new(top - 3).into_host(4, &layout), None);
        assert_eq!(GuestAddr::from_host(layout.user_mem_start - 1, &layout), None);
        assert_eq!(
            GuestAddr::from_host(layout.user_mem_start + 8, &layout),
            Some(GuestAddr::new(8))
        );
    }

    #[test]
    fn fresh_guest_has_delivery_off() {
        let guest = GuestResource::new();
        assert!(!guest.interrupt_enable);
        assert!(guest.virtual_idt.iter().all(Option::is_none));
    }
}

//! Trap dispatch.
//!
//! Every vector has a gate; vectors the kernel cares about also have a
//! handler. Every trap goes through [`Kernel::dispatch`], which decides
//! whether the guest layer, a user exception handler, or the vector's own
//! handler gets it.
pub mod fault;

use crate::{hv::GuestFault, thread::ExceptionHandler, Kernel};
use bedrock::{
    info,
    interrupt::InterruptGuard,
    x86::{
        interrupt::{ExceptionVector, Gate, GateKind, TrapFrame, IDT_ENTS},
        segmentation::Segment,
        PrivilegeLevel,
    },
};

/// Vector of the timer interrupt.
pub const TIMER_VECTOR: u8 = 32;
/// Vector of the keyboard interrupt.
pub const KEYBOARD_VECTOR: u8 = 33;

/// A trap handler.
pub type TrapHandler = fn(&mut Kernel, &InterruptGuard, &mut TrapFrame);

/// The interrupt descriptor table, with the handler behind each gate.
pub struct TrapTable {
    gates: [Gate; IDT_ENTS],
    handlers: [Option<TrapHandler>; IDT_ENTS],
}

impl Default for TrapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TrapTable {
    /// Every vector behind the default wrapper, none handled.
    pub fn new() -> Self {
        Self {
            gates: [Gate::default_wrapper(); IDT_ENTS],
            handlers: [None; IDT_ENTS],
        }
    }

    /// Install `gate` for `vector`, handled by `handler`.
    pub fn register(&mut self, vector: u8, gate: Gate, handler: Option<TrapHandler>) {
        self.gates[vector as usize] = gate;
        self.handlers[vector as usize] = handler;
    }

    /// The gate of `vector`.
    pub fn gate(&self, vector: u8) -> Gate {
        self.gates[vector as usize]
    }

    /// The handler of `vector`, if one is installed.
    pub fn handler(&self, vector: u8) -> Option<TrapHandler> {
        self.handlers[vector as usize]
    }
}

/// A kernel-only interrupt gate.
pub(crate) const fn kernel_gate() -> Gate {
    Gate {
        kind: GateKind::Interrupt,
        dpl: PrivilegeLevel::Ring0,
    }
}

/// Install the fault and device handlers.
pub fn install(table: &mut TrapTable) {
    table.register(
        ExceptionVector::PageFault.vector(),
        kernel_gate(),
        Some(fault::page_fault),
    );
    table.register(
        ExceptionVector::StackSegmentFault.vector(),
        kernel_gate(),
        Some(fault::stack_fault),
    );
    table.register(
        ExceptionVector::DivideError.vector(),
        kernel_gate(),
        Some(fault::divide_error),
    );
    table.register(TIMER_VECTOR, kernel_gate(), Some(crate::timer::timer_interrupt));
    table.register(
        KEYBOARD_VECTOR,
        kernel_gate(),
        Some(crate::keyboard::keyboard_interrupt),
    );
}

// Faults a user exception handler may take over.
const SWEXN_VECTORS: [ExceptionVector; 4] = [
    ExceptionVector::DivideError,
    ExceptionVector::SegmentNotPresent,
    ExceptionVector::StackSegmentFault,
    ExceptionVector::PageFault,
];

fn in_guest_code(frame: &TrapFrame) -> bool {
    Segment::from_selector(frame.cs).map_or(false, Segment::is_guest)
}

impl Kernel {
    /// Route one trap.
    pub(crate) fn dispatch(&mut self, guard: &InterruptGuard, frame: &mut TrapFrame) {
        let vector = frame.vector();
        if self.blocks.current_pcb().guest.is_some() {
            if in_guest_code(frame) {
                return self.handle_virtual_interrupt(guard, frame);
            }
            if vector != TIMER_VECTOR && vector != KEYBOARD_VECTOR {
                return self.crash_guest(guard, frame, GuestFault::HostTrap(vector));
            }
        }

        if SWEXN_VECTORS.iter().any(|v| v.vector() == vector) {
            if let ExceptionHandler::Armed { esp3, eip, arg } =
                self.blocks.current_tcb_mut().handler.take()
            {
                return fault::hand_off(self, guard, frame, esp3, eip, arg);
            }
        }

        match self.traps.handler(vector) {
            Some(handler) => handler(self, guard, frame),
            None => {
                info!("Interrupt {} is not handled.", vector);
                self.fault_kill(guard, frame);
            }
        }
    }
}

//! System calls.
//!
//! A system call is an `int` on one of the vectors below. A single argument
//! travels in `%esi`; several travel as a packet of 32-bit words that
//! `%esi` points to. The result comes back in `%eax`: a value, or the
//! negative status of a [`KernelError`].
pub mod console;
pub mod lifecycle;
pub mod memory;
pub mod swexn;

use crate::{error::KernelError, trap::TrapTable, Kernel};
use bedrock::x86::{
    interrupt::{Gate, GateKind, TrapFrame},
    PrivilegeLevel,
};

pub const FORK_INT: u8 = 0x41;
pub const EXEC_INT: u8 = 0x42;
pub const WAIT_INT: u8 = 0x44;
pub const YIELD_INT: u8 = 0x45;
pub const DESCHEDULE_INT: u8 = 0x46;
pub const MAKE_RUNNABLE_INT: u8 = 0x47;
pub const GETTID_INT: u8 = 0x48;
pub const NEW_PAGES_INT: u8 = 0x49;
pub const REMOVE_PAGES_INT: u8 = 0x4A;
pub const SLEEP_INT: u8 = 0x4B;
pub const GETCHAR_INT: u8 = 0x4C;
pub const READLINE_INT: u8 = 0x4D;
pub const PRINT_INT: u8 = 0x4E;
pub const SET_TERM_COLOR_INT: u8 = 0x4F;
pub const SET_CURSOR_POS_INT: u8 = 0x50;
pub const GET_CURSOR_POS_INT: u8 = 0x51;
pub const THREAD_FORK_INT: u8 = 0x52;
pub const GET_TICKS_INT: u8 = 0x53;
pub const HALT_INT: u8 = 0x55;
pub const SET_STATUS_INT: u8 = 0x59;
pub const VANISH_INT: u8 = 0x60;
pub const SWEXN_INT: u8 = 0x74;

/// A gate user code may `int` through.
pub(crate) const fn user_gate() -> Gate {
    Gate {
        kind: GateKind::Trap,
        dpl: PrivilegeLevel::Ring3,
    }
}

/// Install every system call.
pub fn install(table: &mut TrapTable) {
    let calls: [(u8, crate::trap::TrapHandler); 22] = [
        (FORK_INT, lifecycle::fork),
        (EXEC_INT, lifecycle::exec),
        (WAIT_INT, lifecycle::wait),
        (YIELD_INT, lifecycle::yield_to),
        (DESCHEDULE_INT, lifecycle::deschedule),
        (MAKE_RUNNABLE_INT, lifecycle::make_runnable),
        (GETTID_INT, lifecycle::gettid),
        (NEW_PAGES_INT, memory::new_pages),
        (REMOVE_PAGES_INT, memory::remove_pages),
        (SLEEP_INT, lifecycle::sleep),
        (GETCHAR_INT, console::getchar),
        (READLINE_INT, console::readline),
        (PRINT_INT, console::print),
        (SET_TERM_COLOR_INT, console::set_term_color),
        (SET_CURSOR_POS_INT, console::set_cursor_pos),
        (GET_CURSOR_POS_INT, console::get_cursor_pos),
        (THREAD_FORK_INT, lifecycle::thread_fork),
        (GET_TICKS_INT, lifecycle::get_ticks),
        (HALT_INT, lifecycle::halt),
        (SET_STATUS_INT, lifecycle::set_status),
        (VANISH_INT, lifecycle::vanish),
        (SWEXN_INT, swexn::swexn),
    ];
    for (vector, handler) in calls {
        table.register(vector, user_gate(), Some(handler));
    }
}

/// Put the outcome of a system call in `%eax`.
pub(crate) fn complete(frame: &mut TrapFrame, result: Result<u32, KernelError>) {
    frame.eax = match result {
        Ok(v) => v,
        Err(e) => e.status() as u32,
    };
}

impl Kernel {
    /// Read the `N`-word argument packet `%esi` points to.
    pub(crate) fn packet<const N: usize>(
        &mut self,
        frame: &TrapFrame,
    ) -> Result<[u32; N], KernelError> {
        let pd = self.blocks.current_pcb().page_dir;
        let mut words = [0; N];
        for (i, word) in words.iter_mut().enumerate() {
            let va = frame
                .esi
                .checked_add(4 * i as u32)
                .ok_or(KernelError::BadAddress)?;
            *word = self.mm.read_user_u32(pd, va)?;
        }
        Ok(words)
    }
}

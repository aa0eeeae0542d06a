//! Fault handlers.
//!
//! A page fault on an available page is resolved by zero-fill-on-demand and
//! the thread resumes. Every other fault kills the thread, unless the
//! thread registered an exception handler to take it.
use crate::{mm::Mapping, Kernel};
use bedrock::{
    addressing::Va,
    info,
    interrupt::InterruptGuard,
    mmu::PageFaultErrorCode,
    x86::{
        interrupt::{TrapFrame, TRAP_FRAME_SIZE},
        segmentation::Segment,
    },
};

/// Handle a page fault.
pub fn page_fault(kernel: &mut Kernel, guard: &InterruptGuard, frame: &mut TrapFrame) {
    let code = PageFaultErrorCode::from_bits_truncate(frame.error_code);
    let write = code.contains(PageFaultErrorCode::W);
    let va = Va::new(frame.cr2);
    let pd = kernel.blocks.current_pcb().page_dir;

    let resolved = if code.contains(PageFaultErrorCode::P) {
        // Only the zero frame may be upgraded in place.
        match kernel.mm.check_user_page(pd, va) {
            Ok(Mapping::ZeroFrame) if write => kernel.mm.materialize(pd, va, true).is_ok(),
            _ => false,
        }
    } else {
        kernel.mm.materialize(pd, va, write).is_ok()
    };

    if !resolved {
        info!(
            "Failed due to page fault at {:#010x} (eip {:#010x}, {:?}).",
            frame.cr2, frame.eip, code
        );
        kernel.fault_kill(guard, frame);
    }
}

/// Handle a stack segment fault.
pub fn stack_fault(kernel: &mut Kernel, guard: &InterruptGuard, frame: &mut TrapFrame) {
    info!("Failed due to stack segment fault (eip {:#010x}).", frame.eip);
    kernel.fault_kill(guard, frame);
}

/// Handle a divide error.
pub fn divide_error(kernel: &mut Kernel, guard: &InterruptGuard, frame: &mut TrapFrame) {
    info!("Failed due to divide error (eip {:#010x}).", frame.eip);
    kernel.fault_kill(guard, frame);
}

/// Run the thread's exception handler on its exception stack.
///
/// The handler is entered as `handler(arg, ureg)` with a zero return
/// address, `ureg` being a copy of `frame` just below `esp3`.
pub(crate) fn hand_off(
    kernel: &mut Kernel,
    guard: &InterruptGuard,
    frame: &mut TrapFrame,
    esp3: u32,
    eip: u32,
    arg: u32,
) {
    let pd = kernel.blocks.current_pcb().page_dir;
    let ureg = esp3.wrapping_sub(TRAP_FRAME_SIZE as u32);
    let sp = ureg.wrapping_sub(12);
    let stack_ok = sp < ureg
        && ureg < esp3
        && kernel.mm.check_user_range(pd, sp, esp3 - sp, true);

    let mut args = [0; 12];
    args[4..8].copy_from_slice(&arg.to_le_bytes());
    args[8..12].copy_from_slice(&ureg.to_le_bytes());
    let pushed = stack_ok
        && kernel.mm.copy_to_user(pd, ureg, &frame.to_bytes()).is_ok()
        && kernel.mm.copy_to_user(pd, sp, &args).is_ok();
    if !pushed {
        info!(
            "Failed to push the exception frame below {:#010x}; killing thread {}.",
            esp3,
            kernel.blocks.current()
        );
        return kernel.fault_kill(guard, frame);
    }

    let ds = Segment::UserData.into_selector();
    frame.eip = eip;
    frame.esp = sp;
    frame.cs = Segment::UserCode.into_selector();
    frame.ds = ds;
    frame.es = ds;
    frame.fs = ds;
    frame.gs = ds;
    frame.ss = ds;
}

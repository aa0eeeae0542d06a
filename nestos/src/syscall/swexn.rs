//! Software exception handler registration.
use super::complete;
use crate::{error::KernelError, thread::ExceptionHandler, Kernel};
use bedrock::{
    interrupt::InterruptGuard,
    x86::{
        interrupt::{TrapFrame, TRAP_FRAME_SIZE},
        segmentation::Segment,
        Eflags,
    },
};

// Whether user code may resume with `new` from a call made with `old`.
fn ureg_is_safe(old: &TrapFrame, new: &TrapFrame) -> bool {
    let code = Segment::UserCode.into_selector();
    let data = Segment::UserData.into_selector();
    new.cs == code
        && [new.ds, new.es, new.fs, new.gs, new.ss]
            .iter()
            .all(|&sel| sel == data)
        && Eflags::from_bits_truncate(old.eflags).permits(new.eflags)
        && Eflags::from_bits_truncate(new.eflags).contains(Eflags::IF)
}

fn register(
    kernel: &mut Kernel,
    frame: &TrapFrame,
) -> Result<Option<TrapFrame>, KernelError> {
    let [esp3, eip, arg, newureg] = kernel.packet::<4>(frame)?;
    let adopted = if newureg == 0 {
        None
    } else {
        let pd = kernel.blocks.current_pcb().page_dir;
        let mut bytes = [0; TRAP_FRAME_SIZE];
        kernel.mm.copy_from_user(pd, newureg, &mut bytes)?;
        let ureg = TrapFrame::from_bytes(&bytes);
        if !ureg_is_safe(frame, &ureg) {
            return Err(KernelError::InvalidArgument);
        }
        Some(TrapFrame {
            cause: frame.cause,
            ..ureg
        })
    };

    kernel.blocks.current_tcb_mut().handler = if esp3 != 0 && eip != 0 {
        ExceptionHandler::Armed { esp3, eip, arg }
    } else {
        ExceptionHandler::NoHandler
    };
    Ok(adopted)
}

/// `int swexn(void *esp3, swexn_handler_t eip, void *arg, ureg_t *newureg)`
///
/// With a `newureg`, the call does not return: the thread resumes with
/// those registers.
pub fn swexn(kernel: &mut Kernel, _guard: &InterruptGuard, frame: &mut TrapFrame) {
    match register(kernel, frame) {
        Ok(Some(ureg)) => *frame = ureg,
        Ok(None) => complete(frame, Ok(0)),
        Err(e) => complete(frame, Err(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ureg_must_stay_in_user_mode() {
        let old = TrapFrame::new_user(0x100_0000, 0xffff_e000);
        let mut new = TrapFrame::new_user(0x100_0040, 0xffff_d000);
        assert!(ureg_is_safe(&old, &new));

        new.cs = Segment::KernelCode.into_selector();
        assert!(!ureg_is_safe(&old, &new));

        let mut new = TrapFrame::new_user(0x100_0040, 0xffff_d000);
        new.eflags &= !Eflags::IF.bits();
        assert!(!ureg_is_safe(&old, &new));

        let mut new = TrapFrame::new_user(0x100_0040, 0xffff_d000);
        new.eflags |= Eflags::IOPL0.bits();
        assert!(!ureg_is_safe(&old, &new));
    }
}

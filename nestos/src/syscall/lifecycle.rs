//! Thread and process system calls.
use super::complete;
use crate::{
    error::KernelError,
    thread::{BlockReason, ExceptionHandler, ThreadState},
    Kernel,
};
use alloc::{string::String, vec::Vec};
use bedrock::{info, interrupt::InterruptGuard, x86::interrupt::TrapFrame};

/// Longest executable name or argument exec reads.
pub const ARG_MAX_LEN: usize = 256;
/// Most arguments exec reads.
pub const ARGV_MAX: usize = 64;

/// `int fork(void)`
pub fn fork(kernel: &mut Kernel, guard: &InterruptGuard, frame: &mut TrapFrame) {
    let result = kernel.fork(guard, frame);
    complete(frame, result.map(|pid| pid as u32));
}

/// `int thread_fork(void)`
pub fn thread_fork(kernel: &mut Kernel, guard: &InterruptGuard, frame: &mut TrapFrame) {
    let result = kernel.thread_fork(guard, frame);
    complete(frame, result.map(|tid| tid as u32));
}

fn read_exec_args(kernel: &mut Kernel, frame: &TrapFrame) -> Result<(String, Vec<String>), KernelError> {
    let [name_ptr, argv_ptr] = kernel.packet::<2>(frame)?;
    let pd = kernel.blocks.current_pcb().page_dir;
    let name = kernel.mm.read_user_cstr(pd, name_ptr, ARG_MAX_LEN)?;
    let mut argv = Vec::new();
    loop {
        if argv.len() == ARGV_MAX {
            return Err(KernelError::InvalidArgument);
        }
        let slot = argv_ptr
            .checked_add(4 * argv.len() as u32)
            .ok_or(KernelError::BadAddress)?;
        match kernel.mm.read_user_u32(pd, slot)? {
            0 => break,
            arg => argv.push(kernel.mm.read_user_cstr(pd, arg, ARG_MAX_LEN)?),
        }
    }
    Ok((name, argv))
}

fn exec_image(
    kernel: &mut Kernel,
    guard: &InterruptGuard,
    frame: &TrapFrame,
) -> Result<TrapFrame, KernelError> {
    let pid = kernel.blocks.current_tcb().pid;
    if kernel.blocks.alive_count(pid) > 1 {
        return Err(KernelError::InvalidArgument);
    }
    let (name, argv) = read_exec_args(kernel, frame)?;
    let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
    kernel.replace_image(guard, pid, &name, &argv)
}

/// `int exec(char *execname, char *argvec[])`
///
/// Does not return on success: the frame becomes the new image's.
pub fn exec(kernel: &mut Kernel, guard: &InterruptGuard, frame: &mut TrapFrame) {
    match exec_image(kernel, guard, frame) {
        Ok(new) => {
            kernel.blocks.current_tcb_mut().handler = ExceptionHandler::NoHandler;
            *frame = new;
        }
        Err(e) => complete(frame, Err(e)),
    }
}

/// `void set_status(int status)`
pub fn set_status(kernel: &mut Kernel, _guard: &InterruptGuard, frame: &mut TrapFrame) {
    kernel.set_status(frame.esi as i32);
}

/// `void vanish(void)`
pub fn vanish(kernel: &mut Kernel, guard: &InterruptGuard, frame: &mut TrapFrame) {
    kernel.vanish(guard, frame);
}

/// `int wait(int *status_ptr)`
///
/// Blocks until a child exits, then collects it.
pub fn wait(kernel: &mut Kernel, guard: &InterruptGuard, frame: &mut TrapFrame) {
    let status_ptr = frame.esi;
    let pd = kernel.blocks.current_pcb().page_dir;
    if status_ptr != 0 && !kernel.mm.check_user_range(pd, status_ptr, 4, true) {
        return complete(frame, Err(KernelError::BadAddress));
    }
    let pid = kernel.blocks.current_tcb().pid;

    if let Some(child) = kernel.blocks.find_exited_child(pid) {
        let status = kernel
            .blocks
            .lock_process(child)
            .map_or(0, |inner| inner.status);
        if status_ptr != 0 {
            if let Err(e) = kernel.mm.write_user_u32(pd, status_ptr, status as u32) {
                return complete(frame, Err(e.into()));
            }
        }
        kernel.reap_process(guard, child);
        return complete(frame, Ok(child as u32));
    }

    let children = kernel
        .blocks
        .lock_process(pid)
        .map_or(0, |inner| inner.children.len());
    let result = if children == 0 {
        Err(KernelError::NoChildren)
    } else if kernel.blocks.waiting_count(pid) >= children {
        Err(KernelError::WouldBlockForever)
    } else {
        kernel.block(guard, frame, BlockReason::VanishWait, true)
    };
    if let Err(e) = result {
        complete(frame, Err(e));
    }
}

/// `int yield(int tid)`
pub fn yield_to(kernel: &mut Kernel, guard: &InterruptGuard, frame: &mut TrapFrame) {
    let tid = frame.esi as i32;
    let target = if tid == -1 {
        kernel.scheduler.round_robin(&mut kernel.blocks, guard)
    } else if tid == kernel.blocks.current() {
        None
    } else {
        match kernel.blocks.tcb(tid).map(|tcb| tcb.state()) {
            Some(ThreadState::Ready) => Some(tid),
            _ => return complete(frame, Err(KernelError::NoSuchThread)),
        }
    };
    complete(frame, Ok(0));
    if let Some(target) = target {
        kernel.switch_to(guard, frame, target, ThreadState::Ready);
    }
}

/// `int deschedule(int *reject)`
pub fn deschedule(kernel: &mut Kernel, guard: &InterruptGuard, frame: &mut TrapFrame) {
    let pd = kernel.blocks.current_pcb().page_dir;
    let result = match kernel.mm.read_user_u32(pd, frame.esi) {
        Err(e) => Err(e.into()),
        Ok(reject) => {
            complete(frame, Ok(0));
            if reject == 0 {
                kernel.block(guard, frame, BlockReason::Deschedule, false)
            } else {
                Ok(())
            }
        }
    };
    if let Err(e) = result {
        complete(frame, Err(e));
    }
}

/// `int make_runnable(int tid)`
pub fn make_runnable(kernel: &mut Kernel, guard: &InterruptGuard, frame: &mut TrapFrame) {
    let tid = frame.esi as i32;
    let result = match kernel.blocks.tcb(tid).map(|tcb| tcb.state()) {
        Some(ThreadState::Waiting(BlockReason::Deschedule)) => {
            kernel.blocks.alter_state(guard, tid, ThreadState::Ready);
            Ok(0)
        }
        _ => Err(KernelError::NoSuchThread),
    };
    complete(frame, result);
}

/// `int gettid(void)`
pub fn gettid(kernel: &mut Kernel, _guard: &InterruptGuard, frame: &mut TrapFrame) {
    complete(frame, Ok(kernel.blocks.current() as u32));
}

/// `unsigned int get_ticks(void)`
pub fn get_ticks(kernel: &mut Kernel, _guard: &InterruptGuard, frame: &mut TrapFrame) {
    complete(frame, Ok(kernel.ticks));
}

/// `int sleep(int ticks)`
pub fn sleep(kernel: &mut Kernel, guard: &InterruptGuard, frame: &mut TrapFrame) {
    let ticks = frame.esi as i32;
    if ticks < 0 {
        return complete(frame, Err(KernelError::InvalidArgument));
    }
    complete(frame, Ok(0));
    if ticks == 0 {
        return;
    }
    let result = match kernel.ticks.checked_add(ticks as u32) {
        Some(wake_tick) => kernel.block(guard, frame, BlockReason::Sleep { wake_tick }, false),
        None => Err(KernelError::InvalidArgument),
    };
    if let Err(e) = result {
        complete(frame, Err(e));
    }
}

/// `void halt(void)`
pub fn halt(kernel: &mut Kernel, _guard: &InterruptGuard, _frame: &mut TrapFrame) {
    info!("Halting at tick {}.", kernel.ticks);
    kernel.halted = true;
}

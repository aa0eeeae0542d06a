//! Context switch.
//!
//! A thread that is not running keeps the frame it resumes with at the top
//! of its own kernel stack, and its TCB records where. Switching saves the
//! outgoing frame there, moves both threads through the state machine, and
//! loads the incoming frame, kernel stack and page directory.
use crate::{
    error::KernelError,
    mm::KernelPages,
    thread::{ExceptionHandler, Pid, ThreadState, Tid},
    Kernel,
};
use bedrock::{
    addressing::Pa,
    interrupt::InterruptGuard,
    x86::interrupt::{TrapFrame, TRAP_FRAME_SIZE},
};

/// Pages of each kernel stack.
pub const KERNEL_STACK_PAGES: usize = 4;

fn stack_top(kstack: Pa) -> Pa {
    kstack + KernelPages::span(KERNEL_STACK_PAGES)
}

impl Kernel {
    /// Create thread `tid` of `pid`, to resume with `frame`.
    ///
    /// The thread is NEW: on no list until its first state change.
    pub(crate) fn create_thread(
        &mut self,
        tid: Tid,
        pid: Pid,
        frame: &TrapFrame,
        handler: ExceptionHandler,
    ) -> Result<(), KernelError> {
        let kstack = self
            .mm
            .arena
            .alloc(KERNEL_STACK_PAGES)
            .ok_or(KernelError::NoMemory)?;
        let esp = stack_top(kstack) - TRAP_FRAME_SIZE as u32;
        self.mm.mem.write(esp, &frame.to_bytes());
        self.blocks
            .spawn(tid, pid, kstack, esp.into_u32(), handler);
        Ok(())
    }

    /// Point esp0 and cr3 at `tid`.
    pub(crate) fn activate(&self, tid: Tid) {
        if let Some(tcb) = self.blocks.tcb(tid) {
            self.cpu.set_esp0(stack_top(tcb.kstack).into_u32());
            if let Some(pcb) = self.blocks.pcb(tcb.pid) {
                self.cpu.set_cr3(pcb.page_dir.pa());
            }
        }
    }

    /// The frame `tid` resumes with. Not meaningful for the running thread.
    pub fn saved_frame(&self, tid: Tid) -> Option<TrapFrame> {
        let tcb = self.blocks.tcb(tid)?;
        let mut bytes = [0; TRAP_FRAME_SIZE];
        self.mm.mem.read(Pa::new(tcb.esp), &mut bytes);
        Some(TrapFrame::from_bytes(&bytes))
    }

    /// Replace the frame `tid` resumes with.
    pub(crate) fn store_frame(&mut self, tid: Tid, frame: &TrapFrame) {
        let esp = match self.blocks.tcb_mut(tid) {
            Some(tcb) => {
                tcb.esp = (stack_top(tcb.kstack) - TRAP_FRAME_SIZE as u32).into_u32();
                tcb.esp
            }
            None => return,
        };
        self.mm.mem.write(Pa::new(esp), &frame.to_bytes());
    }

    /// Run `target`, leaving the current thread in state `outgoing`.
    ///
    /// `frame` is saved as the current thread's and replaced by the
    /// target's. Switching to the running thread does nothing. A terminated
    /// thread that is not the last of its process is reaped on the way out.
    pub(crate) fn switch_to(
        &mut self,
        guard: &InterruptGuard,
        frame: &mut TrapFrame,
        target: Tid,
        outgoing: ThreadState,
    ) {
        let current = self.blocks.current();
        if target == current {
            return;
        }
        self.store_frame(current, frame);
        self.blocks.alter_state(guard, current, outgoing);
        self.blocks.alter_state(guard, target, ThreadState::Running);
        match self.saved_frame(target) {
            Some(next) => *frame = next,
            None => panic!("thread {} vanished during a switch", target),
        }
        self.activate(target);
        #[cfg(feature = "trace_switch")]
        bedrock::debug!("switch {} -> {} ({:?})", current, target, outgoing);

        if outgoing == ThreadState::Terminated {
            let pid = self.blocks.tcb(current).map(|tcb| tcb.pid);
            if pid.map_or(false, |pid| self.blocks.alive_count(pid) > 0) {
                self.reap_thread(guard, current);
            }
        }
    }

    /// Free a terminated thread.
    pub(crate) fn reap_thread(&mut self, guard: &InterruptGuard, tid: Tid) {
        if let Some(tcb) = self.blocks.remove_thread(guard, tid) {
            self.mm.arena.dealloc(tcb.kstack, KERNEL_STACK_PAGES);
        }
    }
}

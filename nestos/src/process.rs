//! Process lifecycle: creation, duplication, image replacement, exit and
//! collection.
use crate::{
    error::KernelError,
    thread::{BlockReason, ExceptionHandler, ListId, Pcb, Pid, ThreadState, Tid, ROOT_PID},
    Kernel,
};
use bedrock::{interrupt::InterruptGuard, x86::interrupt::TrapFrame};

/// Exit status of a process whose last thread was killed by a fault.
pub const FAULT_STATUS: i32 = -2;

impl Kernel {
    /// Replace the image of process `pid` with executable `name`.
    ///
    /// Returns the frame to start the image with. On failure the process is
    /// left untouched.
    pub(crate) fn replace_image(
        &mut self,
        _guard: &InterruptGuard,
        pid: Pid,
        name: &str,
        argv: &[&str],
    ) -> Result<TrapFrame, KernelError> {
        let (page_dir, frame, guest) = self.load_executable(name, argv)?;
        let pcb = match self.blocks.pcb_mut(pid) {
            Some(pcb) => pcb,
            None => {
                self.mm.destruct_page_dir(page_dir);
                return Err(KernelError::NoSuchThread);
            }
        };
        let old = core::mem::replace(&mut pcb.page_dir, page_dir);
        pcb.allocations.clear();
        pcb.guest = guest;
        if self.cpu.cr3() == old.pa() {
            self.cpu.set_cr3(page_dir.pa());
        }
        self.mm.destruct_page_dir(old);
        Ok(frame)
    }

    /// Duplicate the running process. Its only live thread continues in the
    /// child from `frame`, with `%eax` = 0.
    ///
    /// Returns the child's pid, which is also the tid of its thread.
    pub(crate) fn fork(
        &mut self,
        guard: &InterruptGuard,
        frame: &TrapFrame,
    ) -> Result<Pid, KernelError> {
        let (pid, handler) = {
            let tcb = self.blocks.current_tcb();
            (tcb.pid, tcb.handler)
        };
        if self.blocks.alive_count(pid) > 1 {
            return Err(KernelError::InvalidArgument);
        }
        let parent = self.blocks.current_pcb();
        let (parent_pd, allocations, guest) =
            (parent.page_dir, parent.allocations.clone(), parent.guest.clone());

        let child_pd = self.mm.construct_page_dir()?;
        if let Err(e) = self.mm.copy_address_space(&self.cpu, parent_pd, child_pd) {
            self.mm.destruct_page_dir(child_pd);
            return Err(e.into());
        }

        let child = self.blocks.allocate_tid();
        let mut pcb = Pcb::new(child, Some(pid), child_pd);
        pcb.allocations = allocations;
        pcb.guest = guest;
        self.blocks.insert_process(pcb);

        let mut child_frame = *frame;
        child_frame.eax = 0;
        if let Err(e) = self.create_thread(child, child, &child_frame, handler) {
            self.blocks.remove_process(child);
            self.mm.destruct_page_dir(child_pd);
            return Err(e);
        }
        if let Some(mut parent) = self.blocks.lock_process(pid) {
            parent.children.push(child);
        }
        self.blocks.alter_state(guard, child, ThreadState::Ready);
        Ok(child)
    }

    /// Add a thread to the running process, resuming from `frame` with
    /// `%eax` = 0.
    pub(crate) fn thread_fork(
        &mut self,
        guard: &InterruptGuard,
        frame: &TrapFrame,
    ) -> Result<Tid, KernelError> {
        let pid = self.blocks.current_tcb().pid;
        let tid = self.blocks.allocate_tid();
        let mut new_frame = *frame;
        new_frame.eax = 0;
        self.create_thread(tid, pid, &new_frame, ExceptionHandler::NoHandler)?;
        self.blocks.alter_state(guard, tid, ThreadState::Ready);
        Ok(tid)
    }

    /// Record the exit status of the running process.
    pub(crate) fn set_status(&mut self, status: i32) {
        let pid = self.blocks.current_tcb().pid;
        if let Some(mut inner) = self.blocks.lock_process(pid) {
            inner.status = status;
        }
    }

    /// Block the running thread for `reason` and run someone else.
    ///
    /// With `restart`, the interrupted system call is issued again when the
    /// thread next runs. Fails when nothing else could run.
    pub(crate) fn block(
        &mut self,
        guard: &InterruptGuard,
        frame: &mut TrapFrame,
        reason: BlockReason,
        restart: bool,
    ) -> Result<(), KernelError> {
        let next = self
            .scheduler
            .find_next_thread(&mut self.blocks, guard)
            .ok_or(KernelError::WouldBlockForever)?;
        self.blocks.current_tcb_mut().restart = restart;
        self.switch_to(guard, frame, next, ThreadState::Waiting(reason));
        Ok(())
    }

    /// Make the first thread of `pid` waiting for a child runnable.
    pub(crate) fn wake_waiter(&mut self, guard: &InterruptGuard, pid: Pid) {
        let waiter = self
            .blocks
            .threads_in(ListId::VanishWait)
            .find(|&tid| self.blocks.tcb(tid).map_or(false, |tcb| tcb.pid == pid));
        if let Some(tid) = waiter {
            self.blocks.alter_state(guard, tid, ThreadState::Ready);
        }
    }

    // Hand the children of the exiting `pid` to init, or to root when init
    // itself exits.
    fn orphan_children(&mut self, guard: &InterruptGuard, pid: Pid) {
        let adopter = if pid == self.init_pid {
            ROOT_PID
        } else {
            self.init_pid
        };
        let children = match self.blocks.lock_process(pid) {
            Some(mut inner) => core::mem::take(&mut inner.children),
            None => return,
        };
        let mut exited = false;
        for child in children {
            if let Some(pcb) = self.blocks.pcb_mut(child) {
                pcb.parent = Some(adopter);
            }
            exited |= self.blocks.alive_count(child) == 0;
            if let Some(mut inner) = self.blocks.lock_process(adopter) {
                inner.children.push(child);
            }
        }
        if exited {
            self.wake_waiter(guard, adopter);
        }
    }

    /// Terminate the running thread.
    ///
    /// The last thread of a process hands its children to init and wakes a
    /// waiting parent; the process stays until collected.
    ///
    /// # Panics
    /// When no thread is left to run.
    pub(crate) fn vanish(&mut self, guard: &InterruptGuard, frame: &mut TrapFrame) {
        let tid = self.blocks.current();
        let pcb = self.blocks.current_pcb();
        let (pid, parent) = (pcb.pid, pcb.parent);
        if self.blocks.alive_count(pid) == 1 {
            self.orphan_children(guard, pid);
            if let Some(parent) = parent {
                self.wake_waiter(guard, parent);
            }
        }
        if self.readline.owner == Some(tid) {
            self.release_readline(guard);
        }
        match self.scheduler.find_next_thread(&mut self.blocks, guard) {
            Some(next) => self.switch_to(guard, frame, next, ThreadState::Terminated),
            None => panic!("thread {} vanished with nothing left to run", tid),
        }
    }

    /// Kill the running thread after a fatal fault.
    pub(crate) fn fault_kill(&mut self, guard: &InterruptGuard, frame: &mut TrapFrame) {
        let pid = self.blocks.current_tcb().pid;
        if self.blocks.alive_count(pid) <= 1 {
            self.set_status(FAULT_STATUS);
        }
        self.vanish(guard, frame);
    }

    /// Free the exited process `pid` and unlink it from its parent.
    ///
    /// Returns its exit status.
    pub(crate) fn reap_process(&mut self, guard: &InterruptGuard, pid: Pid) -> Option<i32> {
        let threads = self.blocks.lock_process(pid)?.threads.clone();
        for tid in threads {
            self.reap_thread(guard, tid);
        }
        let pcb = self.blocks.remove_process(pid)?;
        if let Some(mut parent) = pcb.parent.and_then(|p| self.blocks.lock_process(p)) {
            parent.children.retain(|&c| c != pid);
        }
        self.mm.destruct_page_dir(pcb.page_dir);
        Some(pcb.inner.into_inner().status)
    }
}

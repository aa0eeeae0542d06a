//! Thread scheduler

use super::{ControlBlocks, ListId, Tid};
use bedrock::interrupt::InterruptGuard;

/// Common features of thread scheduler.
///
/// A scheduler only picks threads off the READY list; moving them is the
/// context switcher's job.
pub trait Scheduler: Send {
    /// Pick the thread to run when the current one is preempted.
    ///
    /// Returns None when no thread is ready.
    fn round_robin(&mut self, blocks: &mut ControlBlocks, guard: &InterruptGuard) -> Option<Tid>;

    /// Pick the thread to run when the current one blocks or exits.
    fn find_next_thread(
        &mut self,
        blocks: &mut ControlBlocks,
        guard: &InterruptGuard,
    ) -> Option<Tid>;
}

/// A round robin scheduler that spreads time across processes.
#[derive(Default)]
pub struct RoundRobin;

impl RoundRobin {
    /// Create a new round robin scheduler.
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for RoundRobin {
    fn round_robin(&mut self, blocks: &mut ControlBlocks, guard: &InterruptGuard) -> Option<Tid> {
        let head = blocks.head_of(ListId::Ready)?;
        let pid = blocks.tcb(head)?.pid;
        let other = blocks
            .threads_in(ListId::Ready)
            .find(|&tid| blocks.tcb(tid).map_or(false, |tcb| tcb.pid != pid));
        if let Some(other) = other {
            blocks.rotate_to(guard, ListId::Ready, other);
        }
        Some(head)
    }

    fn find_next_thread(
        &mut self,
        blocks: &mut ControlBlocks,
        guard: &InterruptGuard,
    ) -> Option<Tid> {
        let pid = blocks.current_tcb().pid;
        let sibling = blocks
            .threads_in(ListId::Ready)
            .find(|&tid| blocks.tcb(tid).map_or(false, |tcb| tcb.pid == pid));
        match sibling {
            Some(tid) => Some(tid),
            None => self.round_robin(blocks, guard),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mm::PageDir,
        thread::{ExceptionHandler, Pcb, ThreadState},
    };
    use bedrock::{addressing::Pa, interrupt::Cpu};

    fn setup(guard: &InterruptGuard) -> ControlBlocks {
        // Process 1 runs thread 1 and has thread 2 ready; process 3 has
        // threads 3 and 4 ready; process 5 has thread 5 ready.
        let mut blocks = ControlBlocks::new();
        for (pid, tids) in [(1, &[1, 2][..]), (3, &[3, 4]), (5, &[5])] {
            blocks.insert_process(Pcb::new(pid, None, PageDir::dangling()));
            for &tid in tids {
                blocks.spawn(tid, pid, Pa::new(0), 0, ExceptionHandler::NoHandler);
            }
        }
        blocks.alter_state(guard, 1, ThreadState::Running);
        for tid in [3, 4, 5, 2] {
            blocks.alter_state(guard, tid, ThreadState::Ready);
        }
        blocks
    }

    #[test]
    fn round_robin_moves_to_another_process() {
        let cpu = Cpu::new();
        let guard = InterruptGuard::new(&cpu);
        let mut blocks = setup(&guard);
        let mut rr = RoundRobin::new();
        assert_eq!(blocks.threads_in(ListId::Ready).collect::<Vec<_>>(), [3, 4, 5, 2]);
        assert_eq!(rr.round_robin(&mut blocks, &guard), Some(3));
        assert_eq!(blocks.head_of(ListId::Ready), Some(5));
        assert_eq!(rr.round_robin(&mut blocks, &guard), Some(5));
        assert_eq!(blocks.head_of(ListId::Ready), Some(2));
    }

    #[test]
    fn find_next_prefers_own_process() {
        let cpu = Cpu::new();
        let guard = InterruptGuard::new(&cpu);
        let mut blocks = setup(&guard);
        let mut rr = RoundRobin::new();
        assert_eq!(rr.find_next_thread(&mut blocks, &guard), Some(2));
        blocks.alter_state(&guard, 2, ThreadState::Waiting(crate::thread::BlockReason::Deschedule));
        assert_eq!(rr.find_next_thread(&mut blocks, &guard), Some(3));
    }

    #[test]
    fn nothing_ready() {
        let cpu = Cpu::new();
        let guard = InterruptGuard::new(&cpu);
        let mut blocks = ControlBlocks::new();
        blocks.insert_process(Pcb::new(0, None, PageDir::dangling()));
        blocks.spawn(0, 0, Pa::new(0), 0, ExceptionHandler::NoHandler);
        blocks.alter_state(&guard, 0, ThreadState::Running);
        let mut rr = RoundRobin::new();
        assert_eq!(rr.round_robin(&mut blocks, &guard), None);
        assert_eq!(rr.find_next_thread(&mut blocks, &guard), None);
    }
}

//! Timer interrupt: the tick count, sleepers and preemption.
use crate::{
    thread::{BlockReason, ListId, ThreadState, Tid},
    Kernel,
};
use alloc::vec::Vec;
use bedrock::{interrupt::InterruptGuard, x86::interrupt::TrapFrame};

/// Timer interrupts per second.
pub const TIMER_INTERRUPT_HZ: u32 = 500;
/// Preemptions per second.
pub const ROUND_ROBIN_HZ: u32 = 500;

const QUANTUM_TICKS: u32 = TIMER_INTERRUPT_HZ / ROUND_ROBIN_HZ;

/// Handle a timer interrupt.
///
/// Sleepers whose wake tick has come leave SLEEP: the first runs at once
/// and the others become ready. Without sleepers to wake, the running
/// thread is preempted once per quantum.
pub fn timer_interrupt(kernel: &mut Kernel, guard: &InterruptGuard, frame: &mut TrapFrame) {
    kernel.ticks = kernel.ticks.wrapping_add(1);
    let now = kernel.ticks;
    if let Some(callback) = kernel.tick_callback.as_mut() {
        callback(now);
    }

    let due: Vec<Tid> = kernel
        .blocks
        .threads_in(ListId::Sleep)
        .take_while(|&tid| {
            matches!(
                kernel.blocks.tcb(tid).map(|tcb| tcb.state()),
                Some(ThreadState::Waiting(BlockReason::Sleep { wake_tick })) if wake_tick <= now
            )
        })
        .collect();
    if let Some((&first, rest)) = due.split_first() {
        for &tid in rest {
            kernel.blocks.alter_state(guard, tid, ThreadState::Ready);
        }
        return kernel.switch_to(guard, frame, first, ThreadState::Ready);
    }

    if now % QUANTUM_TICKS == 0 {
        if let Some(next) = kernel.scheduler.round_robin(&mut kernel.blocks, guard) {
            kernel.switch_to(guard, frame, next, ThreadState::Ready);
        }
    }
}

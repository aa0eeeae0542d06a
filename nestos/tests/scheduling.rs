mod common;

use bedrock::memory::MemoryLayout;
use common::{images, Machine};
use nestos::{
    error::KernelError,
    syscall::{
        DESCHEDULE_INT, GET_TICKS_INT, HALT_INT, MAKE_RUNNABLE_INT, SLEEP_INT, THREAD_FORK_INT,
        YIELD_INT,
    },
    thread::ThreadState,
    KernelBuilder,
};
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

fn status(e: KernelError) -> Option<u32> {
    Some(e.status() as u32)
}

fn state(m: &Machine, tid: i32) -> Option<ThreadState> {
    m.kernel.blocks.tcb(tid).map(|tcb| tcb.state())
}

#[test]
fn sleep_wakes_on_the_due_tick() {
    let mut m = Machine::boot();
    let init = m.current();
    let start = m.call(GET_TICKS_INT, 0).unwrap();
    assert_eq!(m.call(SLEEP_INT, 3), None);

    let mut ticks = 0;
    while m.current() != init {
        m.tick();
        ticks += 1;
        assert!(ticks <= 3, "slept past its wake tick");
    }
    assert_eq!(ticks, 3);
    assert_eq!(m.frame.eax, 0);
    assert_eq!(m.call(GET_TICKS_INT, 0), Some(start + 3));

    assert_eq!(m.call(SLEEP_INT, 0), Some(0));
    assert_eq!(m.call(SLEEP_INT, -1i32 as u32), status(KernelError::InvalidArgument));
}

#[test]
fn sleepers_due_together_all_wake() {
    let mut m = Machine::boot();
    let init = m.current();
    let sibling = m.call(THREAD_FORK_INT, 0).unwrap() as i32;

    assert_eq!(m.call(SLEEP_INT, 2), None);
    // The sibling is preferred over other processes.
    assert_eq!(m.current(), sibling);
    assert_eq!(m.call(SLEEP_INT, 2), None);

    m.tick();
    m.tick();
    let (running, other) = if m.current() == init {
        (init, sibling)
    } else {
        (sibling, init)
    };
    assert_eq!(state(&m, running), Some(ThreadState::Running));
    assert_eq!(state(&m, other), Some(ThreadState::Ready));
}

#[test]
fn deschedule_until_made_runnable() {
    let mut m = Machine::boot();
    let init = m.current();
    let reject = m.scratch() - 0x40;

    m.write_words(reject, &[1]);
    assert_eq!(m.call(DESCHEDULE_INT, reject), Some(0));

    let sibling = m.call(THREAD_FORK_INT, 0).unwrap() as i32;
    m.write_words(reject, &[0]);
    assert_eq!(m.call(DESCHEDULE_INT, reject), None);
    assert_eq!(m.current(), sibling);

    // Ticks do not bring a descheduled thread back.
    m.tick();
    m.tick_until(sibling);
    assert_ne!(state(&m, init), Some(ThreadState::Ready));

    assert_eq!(m.call(YIELD_INT, init as u32), status(KernelError::NoSuchThread));
    assert_eq!(m.call(MAKE_RUNNABLE_INT, init as u32), Some(0));
    assert_eq!(
        m.call(MAKE_RUNNABLE_INT, init as u32),
        status(KernelError::NoSuchThread)
    );
    assert_eq!(m.call(YIELD_INT, init as u32), None);
    assert_eq!(m.current(), init);
    assert_eq!(m.frame.eax, 0);
}

#[test]
fn yield_targets() {
    let mut m = Machine::boot();
    let me = m.current() as u32;
    assert_eq!(m.call(YIELD_INT, me), Some(0));
    assert_eq!(m.call(YIELD_INT, 999), status(KernelError::NoSuchThread));
    // Anyone: the idle thread is ready.
    assert_eq!(m.call(YIELD_INT, -1i32 as u32), None);
    assert_ne!(m.current(), me as i32);
}

#[test]
fn halt_stops_everything() {
    let mut m = Machine::boot();
    assert_eq!(m.call(HALT_INT, 0), None);
    assert!(m.kernel.is_halted());
    let ticks = m.kernel.ticks();
    m.tick();
    assert_eq!(m.kernel.ticks(), ticks);
}

#[test]
fn tick_callback_sees_every_tick() {
    let seen = Arc::new(AtomicU32::new(0));
    let counter = seen.clone();
    let (mut kernel, mut frame) = KernelBuilder::new(images())
        .layout(MemoryLayout::compact())
        .tick_callback(move |now| counter.store(now, Ordering::SeqCst))
        .boot()
        .expect("boot");
    for _ in 0..5 {
        kernel.tick(&mut frame);
    }
    assert_eq!(seen.load(Ordering::SeqCst), 5);
    assert_eq!(kernel.ticks(), 5);
}

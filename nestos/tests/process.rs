mod common;

use common::{Machine, TEXT};
use nestos::{
    error::KernelError,
    process::FAULT_STATUS,
    syscall::{
        FORK_INT, GETTID_INT, NEW_PAGES_INT, REMOVE_PAGES_INT, SET_STATUS_INT, THREAD_FORK_INT,
        VANISH_INT, WAIT_INT,
    },
    thread::{ListId, Pid},
};

const HEAP: u32 = 0x200_0000;

fn status(e: KernelError) -> Option<u32> {
    Some(e.status() as u32)
}

#[test]
fn fork_gives_the_child_a_private_copy() {
    let mut m = Machine::boot();
    let parent = m.current();
    assert_eq!(m.call_packet(NEW_PAGES_INT, &[HEAP, 0x2000]), Some(0));
    m.write_words(HEAP, &[0xAAAA]);

    let child = m.call(FORK_INT, 0).expect("fork returns to the parent") as i32;
    assert_ne!(child, parent);
    m.write_words(HEAP, &[0xBBBB]);

    m.tick_until(child);
    assert_eq!(m.frame.eax, 0);
    assert_eq!(m.read_u32(HEAP), 0xAAAA);
    // Never touched: still zero-fill-on-demand in both.
    assert_eq!(m.read_u32(HEAP + 0x1000), 0);
    assert_eq!(m.call(GETTID_INT, 0), Some(child as u32));

    m.write_words(HEAP + 0x1000, &[0xCCCC]);
    m.tick_until(parent);
    assert_eq!(m.read_u32(HEAP), 0xBBBB);
    assert_eq!(m.read_u32(HEAP + 0x1000), 0);
}

#[test]
fn fork_refuses_a_process_with_several_threads() {
    let mut m = Machine::boot();
    assert!(m.call(THREAD_FORK_INT, 0).is_some());
    assert_eq!(m.call(FORK_INT, 0), status(KernelError::InvalidArgument));
}

#[test]
fn wait_collects_the_status_of_an_exited_child() {
    let mut m = Machine::boot();
    let parent = m.current();
    let status_ptr = m.scratch() - 0x100;
    let child = m.call(FORK_INT, 0).unwrap() as i32;

    // Nothing has exited yet: the parent blocks.
    assert_eq!(m.call(WAIT_INT, status_ptr), None);
    m.tick_until(child);
    assert!(m.call(SET_STATUS_INT, 7).is_some());
    assert_eq!(m.call(VANISH_INT, 0), None);

    m.tick_until(parent);
    assert_eq!(m.frame.eax, child as u32);
    assert_eq!(m.read_u32(status_ptr), 7);
    assert!(m.kernel.blocks.pcb(child).is_none());
    assert_eq!(m.call(WAIT_INT, 0), status(KernelError::NoChildren));
}

#[test]
fn an_unusable_vector_kills_with_the_fault_status() {
    let mut m = Machine::boot();
    let parent = m.current();
    let child = m.call(FORK_INT, 0).unwrap() as i32;
    m.tick_until(child);

    // No gate user code may use; the #GP has no handler either.
    assert_eq!(m.call(0x99, 0), None);
    assert_eq!(m.status_of(child), Some(FAULT_STATUS));

    m.tick_until(parent);
    let status_ptr = m.scratch() - 0x100;
    assert_eq!(m.call(WAIT_INT, status_ptr), Some(child as u32));
    assert_eq!(m.read_u32(status_ptr), FAULT_STATUS as u32);
}

#[test]
fn writing_read_only_text_kills() {
    let mut m = Machine::boot();
    let parent = m.current();
    let child = m.call(FORK_INT, 0).unwrap() as i32;
    m.tick_until(child);

    assert!(m.kernel.user_write(&mut m.frame, TEXT, &[0xcc]).is_err());
    assert_ne!(m.current(), child);
    assert_eq!(m.status_of(child), Some(FAULT_STATUS));
    m.tick_until(parent);
}

#[test]
fn new_pages_and_remove_pages() {
    let mut m = Machine::boot();
    assert_eq!(m.call_packet(NEW_PAGES_INT, &[HEAP, 0x3000]), Some(0));
    // Overlapping, unaligned, empty and kernel-space requests fail.
    assert_eq!(
        m.call_packet(NEW_PAGES_INT, &[HEAP + 0x2000, 0x1000]),
        status(KernelError::InvalidArgument)
    );
    assert_eq!(
        m.call_packet(NEW_PAGES_INT, &[HEAP + 0x10, 0x1000]),
        status(KernelError::InvalidArgument)
    );
    assert_eq!(
        m.call_packet(NEW_PAGES_INT, &[HEAP + 0x10000, 0]),
        status(KernelError::InvalidArgument)
    );
    assert_eq!(
        m.call_packet(NEW_PAGES_INT, &[0x1000, 0x1000]),
        status(KernelError::InvalidArgument)
    );

    m.write_words(HEAP + 0x1000, &[42]);
    assert_eq!(m.call(REMOVE_PAGES_INT, HEAP + 0x1000), status(KernelError::InvalidArgument));
    assert_eq!(m.call(REMOVE_PAGES_INT, HEAP), Some(0));
    assert_eq!(m.call(REMOVE_PAGES_INT, HEAP), status(KernelError::InvalidArgument));

    // The range is free again, and comes back zeroed.
    assert_eq!(m.call_packet(NEW_PAGES_INT, &[HEAP, 0x2000]), Some(0));
    assert_eq!(m.read_u32(HEAP + 0x1000), 0);
}

#[test]
fn removed_pages_fault() {
    let mut m = Machine::boot();
    let parent = m.current();
    assert_eq!(m.call_packet(NEW_PAGES_INT, &[HEAP, 0x1000]), Some(0));
    let child = m.call(FORK_INT, 0).unwrap() as i32;
    m.tick_until(child);
    assert_eq!(m.call(REMOVE_PAGES_INT, HEAP), Some(0));
    assert!(m.kernel.user_read_u32(&mut m.frame, HEAP).is_err());
    assert_eq!(m.status_of(child), Some(FAULT_STATUS));
    m.tick_until(parent);
}

#[test]
fn exec_lays_out_argv() {
    let mut m = Machine::boot();
    assert!(m.exec("hello", &["hello", "world"]).is_some());
    assert_eq!(m.frame.eip, TEXT);

    let esp = m.frame.esp;
    assert_eq!(m.read_u32(esp), 0);
    assert_eq!(m.read_u32(esp + 4), 2);
    let argv = m.read_u32(esp + 8);
    let second = m.read_u32(argv + 4);
    assert_eq!(m.read(second, 6), b"world\0");
    assert_eq!(m.read_u32(argv + 8), 0);
    // Rodata made it, and bss reads as zero.
    assert_eq!(m.read(TEXT + 0x1000, 7), b"rodata\0");
    assert_eq!(m.read_u32(TEXT + 0x3000), 0);
}

#[test]
fn exec_of_a_missing_image_fails_in_place() {
    let mut m = Machine::boot();
    let eip = m.frame.eip;
    assert_eq!(
        m.exec("nonesuch", &["nonesuch"]),
        status(KernelError::ImageNotFound)
    );
    assert_eq!(m.frame.eip, eip);
}

fn snapshot(m: &Machine) -> (Vec<Pid>, usize, usize, usize) {
    (
        m.kernel.blocks.pids().collect(),
        m.kernel.blocks.count_in(ListId::Ready),
        m.kernel.mm.frames.free_count(),
        m.kernel.mm.arena.unused(),
    )
}

#[test]
fn fork_without_frames_leaves_nothing_behind() {
    let mut m = Machine::boot();
    let mut held = Vec::new();
    while let Some(frame) = m.kernel.mm.frames.allocate() {
        held.push(frame);
    }
    let before = snapshot(&m);
    assert_eq!(m.call(FORK_INT, 0), status(KernelError::NoMemory));
    assert_eq!(snapshot(&m), before);

    for frame in held {
        m.kernel.mm.frames.free(frame);
    }
    assert!(m.call(FORK_INT, 0).is_some());
}

#[test]
fn forks_without_kernel_pages_leave_nothing_behind() {
    let mut m = Machine::boot();
    let mut held = Vec::new();
    // One page: enough for a directory, not for its tables or a stack.
    while m.kernel.mm.arena.unused() > 1 {
        held.push(m.kernel.mm.arena.alloc(1).unwrap());
    }
    let before = snapshot(&m);
    assert_eq!(m.call(FORK_INT, 0), status(KernelError::NoMemory));
    assert_eq!(snapshot(&m), before);
    assert_eq!(m.call(THREAD_FORK_INT, 0), status(KernelError::NoMemory));
    assert_eq!(snapshot(&m), before);

    for page in held {
        m.kernel.mm.arena.dealloc(page, 1);
    }
    assert!(m.call(THREAD_FORK_INT, 0).is_some());
}

#[test]
fn new_pages_without_tables_changes_nothing() {
    let mut m = Machine::boot();
    // Straddle two directory slots the program has never used.
    let boundary = 0x3000_0000;
    let base = boundary - 0x1000;
    // The argument packet is written before the arena runs dry.
    let at = m.scratch();
    m.write_words(at, &[base, 0x2000]);
    let mut held = Vec::new();
    while m.kernel.mm.arena.unused() > 1 {
        held.push(m.kernel.mm.arena.alloc(1).unwrap());
    }
    assert_eq!(m.call(NEW_PAGES_INT, at), status(KernelError::NoMemory));
    assert_eq!(m.call(REMOVE_PAGES_INT, base), status(KernelError::InvalidArgument));

    for page in held {
        m.kernel.mm.arena.dealloc(page, 1);
    }
    // The first page is still free to allocate on its own.
    assert_eq!(m.call_packet(NEW_PAGES_INT, &[base, 0x1000]), Some(0));
    assert_eq!(m.call(REMOVE_PAGES_INT, base), Some(0));
}

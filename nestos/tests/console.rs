mod common;

use common::Machine;
use nestos::{
    error::KernelError,
    syscall::{
        console::PRINT_MAX, GETCHAR_INT, GET_CURSOR_POS_INT, PRINT_INT, READLINE_INT,
        SET_CURSOR_POS_INT, SET_TERM_COLOR_INT, THREAD_FORK_INT,
    },
    thread::{BlockReason, ThreadState},
};

const SC_H: u8 = 0x23;
const SC_I: u8 = 0x17;
const SC_X: u8 = 0x2d;
const SC_ENTER: u8 = 0x1c;
const SC_BACKSPACE: u8 = 0x0e;

fn status(e: KernelError) -> Option<u32> {
    Some(e.status() as u32)
}

#[test]
fn print_writes_at_the_cursor() {
    let mut m = Machine::boot();
    let buf = m.scratch() - 0x100;
    m.write(buf, b"hello, world");
    assert_eq!(m.call_packet(PRINT_INT, &[12, buf]), Some(0));
    assert!(m.row(0).starts_with("hello, world"));

    assert_eq!(
        m.call_packet(PRINT_INT, &[PRINT_MAX as u32 + 1, buf]),
        status(KernelError::InvalidArgument)
    );
    assert_eq!(
        m.call_packet(PRINT_INT, &[4, 0x10]),
        status(KernelError::BadAddress)
    );
}

#[test]
fn cursor_and_color() {
    let mut m = Machine::boot();
    assert_eq!(m.call_packet(SET_CURSOR_POS_INT, &[3, 7]), Some(0));
    assert_eq!(
        m.call_packet(SET_CURSOR_POS_INT, &[30, 7]),
        status(KernelError::InvalidArgument)
    );
    let out = m.scratch() - 0x100;
    assert_eq!(m.call_packet(GET_CURSOR_POS_INT, &[out, out + 4]), Some(0));
    assert_eq!(m.read_u32(out), 3);
    assert_eq!(m.read_u32(out + 4), 7);

    assert_eq!(m.call(SET_TERM_COLOR_INT, 0x1f), Some(0));
    assert_eq!(
        m.call(SET_TERM_COLOR_INT, 0x1000),
        status(KernelError::InvalidArgument)
    );
}

#[test]
fn readline_blocks_until_enter() {
    let mut m = Machine::boot();
    let init = m.current();
    let buf = m.scratch() - 0x100;
    assert_eq!(m.call_packet(READLINE_INT, &[16, buf]), None);

    for sc in [SC_H, SC_X, SC_BACKSPACE, SC_I] {
        m.press(sc);
        assert_ne!(m.current(), init);
    }
    m.press(SC_ENTER);
    assert_eq!(m.current(), init);
    assert_eq!(m.frame.eax, 3);
    assert_eq!(m.read(buf, 3), b"hi\n");
    assert!(m.row(0).starts_with("hi"));
}

#[test]
fn readline_stops_at_the_buffer_length() {
    let mut m = Machine::boot();
    let buf = m.scratch() - 0x100;
    for sc in [SC_H, SC_I, SC_H] {
        m.press(sc);
    }
    // Keys typed ahead are consumed at once.
    assert_eq!(m.call_packet(READLINE_INT, &[2, buf]), Some(2));
    assert_eq!(m.read(buf, 2), b"hi");
    assert_eq!(m.call(GETCHAR_INT, 0), Some(b'h' as u32));
    assert_eq!(m.call(GETCHAR_INT, 0), status(KernelError::InvalidArgument));

    assert_eq!(
        m.call_packet(READLINE_INT, &[0, buf]),
        status(KernelError::InvalidArgument)
    );
}

#[test]
fn second_reader_waits_its_turn() {
    let mut m = Machine::boot();
    let first = m.current();
    let second = m.call(THREAD_FORK_INT, 0).unwrap() as i32;
    let buf = m.scratch() - 0x100;

    assert_eq!(m.call_packet(READLINE_INT, &[8, buf]), None);
    assert_eq!(m.current(), second);
    // Input belongs to the first reader.
    assert_eq!(m.call(GETCHAR_INT, 0), status(KernelError::InvalidArgument));
    assert_eq!(m.call_packet(READLINE_INT, &[8, buf + 0x10]), None);

    m.press(SC_H);
    m.press(SC_ENTER);
    assert_eq!(m.current(), first);
    assert_eq!(m.frame.eax, 2);

    // The second reader claims input once it runs again.
    let claimed = Some(ThreadState::Waiting(BlockReason::Readline { first_reader: true }));
    for _ in 0..8 {
        if m.kernel.blocks.tcb(second).map(|tcb| tcb.state()) == claimed {
            break;
        }
        m.tick();
    }
    assert_eq!(m.kernel.blocks.tcb(second).map(|tcb| tcb.state()), claimed);
    m.press(SC_I);
    m.press(SC_ENTER);
    assert_eq!(m.current(), second);
    assert_eq!(m.frame.eax, 2);
    assert_eq!(m.read(buf + 0x10, 2), b"i\n");
}

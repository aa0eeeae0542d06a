//! Console and keyboard system calls.
//!
//! Output from user processes and guests goes through the one console
//! lock. Input is line-disciplined: a single reader owns the keyboard
//! until its line is complete, and later readers queue behind it.
use super::complete;
use crate::{
    error::KernelError,
    thread::{BlockReason, ListId, ThreadState, Tid},
    Kernel,
};
use alloc::{vec, vec::Vec};
use bedrock::{interrupt::InterruptGuard, x86::interrupt::TrapFrame};

/// Most bytes one `print` writes.
pub const PRINT_MAX: usize = 1024;
/// Longest line one `readline` returns.
pub const READLINE_MAX: usize = 1024;

const BACKSPACE: u8 = b'\x08';

/// Who owns keyboard input, and the line collected so far.
#[derive(Default)]
pub struct ReadlineState {
    pub(crate) owner: Option<Tid>,
    line: Vec<u8>,
}

impl Kernel {
    /// Give up keyboard input and let the next queued reader claim it.
    pub(crate) fn release_readline(&mut self, guard: &InterruptGuard) {
        self.readline.owner = None;
        self.readline.line.clear();
        if let Some(next) = self.blocks.head_of(ListId::Readline) {
            self.blocks.alter_state(guard, next, ThreadState::Ready);
        }
    }

    // Consume queued keys into the line, echoing them. Returns whether the
    // line is complete.
    fn collect_line(&mut self, len: usize) -> bool {
        while let Some(ch) = self.keyboard.extract_ch() {
            if ch == BACKSPACE {
                if self.readline.line.pop().is_some() {
                    self.lock_console().putbyte(BACKSPACE);
                }
                continue;
            }
            self.readline.line.push(ch);
            self.lock_console().putbyte(ch);
            if ch == b'\n' || self.readline.line.len() == len {
                return true;
            }
        }
        false
    }
}

/// `char getchar(void)`
pub fn getchar(kernel: &mut Kernel, _guard: &InterruptGuard, frame: &mut TrapFrame) {
    let result = if kernel.readline.owner.is_some() {
        Err(KernelError::InvalidArgument)
    } else {
        kernel
            .keyboard
            .extract_ch()
            .map(u32::from)
            .ok_or(KernelError::InvalidArgument)
    };
    complete(frame, result);
}

/// `int readline(int len, char *buf)`
///
/// Blocks until a line is typed, then returns the number of bytes copied.
pub fn readline(kernel: &mut Kernel, guard: &InterruptGuard, frame: &mut TrapFrame) {
    let (len, buf) = match kernel.packet::<2>(frame) {
        Ok([len, buf]) => (len as i32, buf),
        Err(e) => return complete(frame, Err(e)),
    };
    let pd = kernel.blocks.current_pcb().page_dir;
    if len <= 0 || len as usize > READLINE_MAX {
        return complete(frame, Err(KernelError::InvalidArgument));
    }
    if !kernel.mm.check_user_range(pd, buf, len as u32, true) {
        return complete(frame, Err(KernelError::BadAddress));
    }

    let tid = kernel.blocks.current();
    match kernel.readline.owner {
        Some(owner) if owner != tid => {
            let waiting = BlockReason::Readline {
                first_reader: false,
            };
            if let Err(e) = kernel.block(guard, frame, waiting, true) {
                complete(frame, Err(e));
            }
            return;
        }
        _ => kernel.readline.owner = Some(tid),
    }

    if kernel.collect_line(len as usize) {
        let line = core::mem::take(&mut kernel.readline.line);
        let result = kernel
            .mm
            .copy_to_user(pd, buf, &line)
            .map(|_| line.len() as u32)
            .map_err(KernelError::from);
        kernel.release_readline(guard);
        return complete(frame, result);
    }

    let waiting = BlockReason::Readline { first_reader: true };
    if let Err(e) = kernel.block(guard, frame, waiting, true) {
        kernel.release_readline(guard);
        complete(frame, Err(e));
    }
}

/// `int print(int len, char *buf)`
pub fn print(kernel: &mut Kernel, _guard: &InterruptGuard, frame: &mut TrapFrame) {
    let result = kernel.packet::<2>(frame).and_then(|[len, buf]| {
        let len = len as i32;
        if len < 0 || len as usize > PRINT_MAX {
            return Err(KernelError::InvalidArgument);
        }
        let pd = kernel.blocks.current_pcb().page_dir;
        if !kernel.mm.check_user_range(pd, buf, len as u32, false) {
            return Err(KernelError::BadAddress);
        }
        let mut bytes = vec![0; len as usize];
        kernel.mm.copy_from_user(pd, buf, &mut bytes)?;
        kernel.lock_console().putbytes(&bytes);
        Ok(0)
    });
    complete(frame, result);
}

/// `int set_term_color(int color)`
pub fn set_term_color(kernel: &mut Kernel, _guard: &InterruptGuard, frame: &mut TrapFrame) {
    let result = kernel
        .lock_console()
        .set_term_color(frame.esi as i32)
        .map(|_| 0)
        .map_err(|_| KernelError::InvalidArgument);
    complete(frame, result);
}

/// `int set_cursor_pos(int row, int col)`
pub fn set_cursor_pos(kernel: &mut Kernel, _guard: &InterruptGuard, frame: &mut TrapFrame) {
    let result = kernel.packet::<2>(frame).and_then(|[row, col]| {
        kernel
            .lock_console()
            .set_cursor(row as i32, col as i32)
            .map(|_| 0)
            .map_err(|_| KernelError::InvalidArgument)
    });
    complete(frame, result);
}

/// `int get_cursor_pos(int *row, int *col)`
pub fn get_cursor_pos(kernel: &mut Kernel, _guard: &InterruptGuard, frame: &mut TrapFrame) {
    let result = kernel.packet::<2>(frame).and_then(|[row_ptr, col_ptr]| {
        let pd = kernel.blocks.current_pcb().page_dir;
        if !kernel.mm.check_user_range(pd, row_ptr, 4, true)
            || !kernel.mm.check_user_range(pd, col_ptr, 4, true)
        {
            return Err(KernelError::BadAddress);
        }
        let (row, col) = kernel.lock_console().cursor();
        kernel.mm.write_user_u32(pd, row_ptr, row as u32)?;
        kernel.mm.write_user_u32(pd, col_ptr, col as u32)?;
        Ok(0)
    });
    complete(frame, result);
}

//! Keyboard input.
//!
//! The keyboard interrupt moves scancodes from the PS/2 port into a bounded
//! queue. Readers drain it through the one decoder, so modifier state is
//! shared by every consumer, the guest layer included.
use crate::{
    thread::{BlockReason, ListId, ThreadState},
    Kernel,
};
use alloc::boxed::Box;
use bedrock::{
    dev::keyboard::{KeyEvent, ScancodeDecoder},
    interrupt::InterruptGuard,
    warning,
    x86::interrupt::TrapFrame,
};
use crossbeam_queue::ArrayQueue;

/// Scancodes the queue holds.
pub const SCANCODE_BUF_LEN: usize = 1024;

/// The scancode queue and its decoder.
pub struct KeyboardService {
    queue: ArrayQueue<u8>,
    decoder: Box<dyn ScancodeDecoder>,
}

impl KeyboardService {
    /// An empty queue decoded by `decoder`.
    pub fn new(decoder: Box<dyn ScancodeDecoder>) -> Self {
        Self {
            queue: ArrayQueue::new(SCANCODE_BUF_LEN),
            decoder,
        }
    }

    /// Queue a scancode, dropping it when the queue is full.
    pub fn push(&self, scancode: u8) {
        if self.queue.push(scancode).is_err() {
            warning!("Scancode queue full; dropping {:#04x}.", scancode);
        }
    }

    /// Decode scancodes until one yields a character.
    pub fn extract_ch(&mut self) -> Option<u8> {
        while let Some(scancode) = self.queue.pop() {
            let event = self.decoder.process_scancode(scancode);
            if event.has_data() && event.is_make() {
                return Some(event.char());
            }
        }
        None
    }

    /// Decode the next scancode, whatever it yields.
    pub fn next_event(&mut self) -> Option<KeyEvent> {
        let scancode = self.queue.pop()?;
        Some(self.decoder.process_scancode(scancode))
    }

    /// Whether no scancode is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Handle a keyboard interrupt.
///
/// If a reader owns input and is waiting for more, it runs next.
pub fn keyboard_interrupt(kernel: &mut Kernel, guard: &InterruptGuard, frame: &mut TrapFrame) {
    if let Some(scancode) = kernel.ps2.read() {
        kernel.keyboard.push(scancode);
    }
    let reader = kernel.blocks.head_of(ListId::Readline).filter(|&tid| {
        kernel.blocks.tcb(tid).map(|tcb| tcb.state())
            == Some(ThreadState::Waiting(BlockReason::Readline { first_reader: true }))
    });
    if let Some(reader) = reader {
        kernel.switch_to(guard, frame, reader, ThreadState::Ready);
    }
}

//! A machine booted with a handful of synthetic executables, and helpers
//! for playing the part of the code running on it.
#![allow(dead_code)]

use bedrock::{
    dev::console::{Console, ConsoleError, TextConsole},
    memory::MemoryLayout,
    spin_lock::SpinLock,
    x86::interrupt::TrapFrame,
};
use nestos::{
    loader::{Executable, ImageTable},
    thread::{Pid, Tid},
    Kernel, KernelBuilder,
};
use std::sync::Arc;

/// Where every synthetic user program starts.
pub const TEXT: u32 = 0x100_0000;
/// Where the guest kernel starts, relative to guest memory.
pub const GUEST_TEXT: u32 = 0x1000;
/// Guest-relative address of the guest's greeting.
pub const GUEST_GREETING: u32 = 0x3000;
pub const GREETING: &[u8] = b"hello from guest";

/// A console the test keeps a handle to.
#[derive(Clone)]
pub struct SharedConsole(pub Arc<SpinLock<TextConsole>>);

impl SharedConsole {
    pub fn new() -> Self {
        Self(Arc::new(SpinLock::new(TextConsole::new())))
    }
}

impl Console for SharedConsole {
    fn putbyte(&mut self, ch: u8) {
        self.0.lock().putbyte(ch)
    }
    fn set_term_color(&mut self, color: i32) -> Result<(), ConsoleError> {
        self.0.lock().set_term_color(color)
    }
    fn term_color(&self) -> i32 {
        self.0.lock().term_color()
    }
    fn set_cursor(&mut self, row: i32, col: i32) -> Result<(), ConsoleError> {
        self.0.lock().set_cursor(row, col)
    }
    fn cursor(&self) -> (i32, i32) {
        self.0.lock().cursor()
    }
    fn clear(&mut self) {
        self.0.lock().clear()
    }
}

fn program() -> Executable {
    Executable::new(TEXT)
        .text(TEXT, &[0x90; 64])
        .rodata(TEXT + 0x1000, b"rodata\0")
        .data(TEXT + 0x2000, &[1, 2, 3, 4])
        .bss(TEXT + 0x3000, 0x2000)
}

fn guest() -> Executable {
    Executable::new(GUEST_TEXT)
        .text(GUEST_TEXT, &[0xf4; 0x100])
        .data(GUEST_GREETING, GREETING)
        .bss(0x4000, 0x1000)
}

pub fn images() -> ImageTable {
    let mut images = ImageTable::new();
    for name in ["init", "idle", "hello"] {
        images.insert(name, program());
    }
    images.insert("guest", guest());
    images
}

pub struct Machine {
    pub kernel: Kernel,
    pub frame: TrapFrame,
    pub console: SharedConsole,
}

impl Machine {
    /// Boot and run until `init` is on the cpu.
    pub fn boot() -> Self {
        let console = SharedConsole::new();
        let (kernel, frame) = KernelBuilder::new(images())
            .layout(MemoryLayout::compact())
            .console(console.clone())
            .boot()
            .expect("boot");
        let mut m = Self {
            kernel,
            frame,
            console,
        };
        let init = m.kernel.init_pid();
        m.tick_until(init);
        m
    }

    pub fn current(&self) -> Tid {
        self.kernel.current()
    }

    pub fn tick(&mut self) {
        self.kernel.tick(&mut self.frame);
    }

    /// Tick until `tid` runs.
    pub fn tick_until(&mut self, tid: Tid) {
        for _ in 0..16 {
            if self.current() == tid {
                return;
            }
            self.tick();
        }
        panic!("thread {} never ran (running: {})", tid, self.current());
    }

    pub fn press(&mut self, scancode: u8) {
        self.kernel.press(&mut self.frame, scancode);
    }

    /// Somewhere below the running program's stack pointer to put
    /// arguments.
    pub fn scratch(&self) -> u32 {
        (self.frame.esp - 0x400) & !0xf
    }

    pub fn write(&mut self, va: u32, bytes: &[u8]) {
        self.kernel
            .user_write(&mut self.frame, va, bytes)
            .expect("user write");
    }

    pub fn write_words(&mut self, va: u32, words: &[u32]) {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.write(va, &bytes);
    }

    pub fn read_u32(&mut self, va: u32) -> u32 {
        self.kernel
            .user_read_u32(&mut self.frame, va)
            .expect("user read")
    }

    pub fn read(&mut self, va: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.kernel
            .user_read(&mut self.frame, va, &mut buf)
            .expect("user read");
        buf
    }

    pub fn call(&mut self, vector: u8, esi: u32) -> Option<u32> {
        self.kernel.syscall(&mut self.frame, vector, esi)
    }

    /// Issue a system call whose arguments travel as a packet.
    pub fn call_packet(&mut self, vector: u8, words: &[u32]) -> Option<u32> {
        let at = self.scratch();
        self.write_words(at, words);
        self.call(vector, at)
    }

    // Store `s` NUL-terminated at `*at`, advancing `*at` past it.
    fn put_str(&mut self, at: &mut u32, s: &str) -> u32 {
        let va = *at;
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.write(va, &bytes);
        *at += (bytes.len() as u32 + 3) & !3;
        va
    }

    /// `exec(name, argv)` from the running program.
    pub fn exec(&mut self, name: &str, argv: &[&str]) -> Option<u32> {
        let mut at = self.scratch() + 0x40;
        let name_ptr = self.put_str(&mut at, name);
        let mut pointers = Vec::new();
        for arg in argv {
            pointers.push(self.put_str(&mut at, arg));
        }
        pointers.push(0);
        self.write_words(at, &pointers);
        self.call_packet(nestos::syscall::EXEC_INT, &[name_ptr, at])
    }

    /// Exit status recorded for `pid`.
    pub fn status_of(&self, pid: Pid) -> Option<i32> {
        self.kernel
            .blocks
            .pcb(pid)
            .map(|pcb| pcb.inner.lock().status)
    }

    /// Contents of console row `row`.
    pub fn row(&self, row: i32) -> String {
        self.console.0.lock().row_text(row)
    }
}

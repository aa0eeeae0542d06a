//! NestOS: a single-cpu teaching kernel that can host a nested guest kernel.
//!
//! The kernel runs on the simulated machine of [`bedrock`]. User code is
//! driven by the embedder: every trap reaches the kernel as a [`TrapFrame`]
//! passed to [`Kernel::handle`], and the frame holds the registers of the
//! running thread when the call returns. A context switch is therefore
//! observable as the frame changing under the caller.
//!
//! ```text
//!          +-----------+     +------------+
//! trap --> |  dispatch | --> | hv (guest) |
//!          +-----------+     +------------+
//!            |   |    \
//!        fault  device  syscall
//!            \   |    /
//!          +-----------+     +-----------+
//!          |  context  | --> | scheduler |
//!          +-----------+     +-----------+
//!                |
//!        control blocks, page directories, frames
//! ```
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod context;
pub mod error;
pub mod hv;
pub mod keyboard;
pub mod loader;
pub mod mm;
pub mod process;
pub mod syscall;
pub mod thread;
pub mod timer;
pub mod trap;
pub mod user;

use alloc::{boxed::Box, sync::Arc};
use bedrock::{
    dev::{
        console::{Console, TextConsole},
        keyboard::{Ps2Port, ScancodeDecoder, UsKeyboard},
        timer::Pit,
    },
    info,
    interrupt::{Cpu, InterruptGuard},
    memory::MemoryLayout,
    spin_lock::{SpinLock, SpinLockGuard, NO_HOLDER},
    x86::interrupt::TrapFrame,
};
use error::KernelError;
use hv::hypercall::HypercallTable;
use keyboard::KeyboardService;
use loader::ImageTable;
use mm::MemoryManager;
use thread::{
    scheduler::{RoundRobin, Scheduler},
    ControlBlocks, ExceptionHandler, Pcb, Pid, ThreadState, Tid, ROOT_PID,
};
use trap::TrapTable;

/// The kernel.
///
/// Everything the kernel knows lives here; there are no ambient statics
/// besides the log.
pub struct Kernel {
    cpu: Arc<Cpu>,
    /// Physical memory, frames and page directories.
    pub mm: MemoryManager,
    /// Threads and processes.
    pub blocks: ControlBlocks,
    traps: TrapTable,
    hypercalls: HypercallTable,
    scheduler: Box<dyn Scheduler>,
    ticks: u32,
    tick_callback: Option<Box<dyn FnMut(u32) + Send>>,
    keyboard: KeyboardService,
    ps2: Ps2Port,
    console: SpinLock<Box<dyn Console>>,
    readline: syscall::console::ReadlineState,
    images: ImageTable,
    init_pid: Pid,
    halted: bool,
}

impl Kernel {
    /// Take a trap.
    ///
    /// `frame` holds the registers of the running thread. Afterwards it holds
    /// the registers of whichever thread runs next.
    pub fn handle(&mut self, frame: &mut TrapFrame) {
        if self.halted {
            return;
        }
        let guard = InterruptGuard::new(&self.cpu);
        self.dispatch(&guard, frame);
        while !self.halted {
            let tcb = self.blocks.current_tcb_mut();
            if tcb.restart {
                tcb.restart = false;
                self.dispatch(&guard, frame);
            } else if !self.deliver_pending_timer(&guard, frame) {
                break;
            }
        }
    }

    /// The processor.
    pub fn cpu(&self) -> &Arc<Cpu> {
        &self.cpu
    }

    /// Timer interrupts since boot.
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    /// Whether `halt` was called.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// The running thread.
    pub fn current(&self) -> Tid {
        self.blocks.current()
    }

    /// Pid of `init`.
    pub fn init_pid(&self) -> Pid {
        self.init_pid
    }

    /// Run `f` on the console, holding the output lock.
    pub fn with_console<R>(&self, f: impl FnOnce(&mut dyn Console) -> R) -> R {
        let mut console = self.lock_console();
        f(console.as_mut())
    }

    /// The console, locked on behalf of the running thread.
    pub(crate) fn lock_console(&self) -> SpinLockGuard<'_, Box<dyn Console>> {
        self.console
            .lock_as(self.blocks.running().unwrap_or(NO_HOLDER))
    }
}

/// A kernel configuration, booted by [`KernelBuilder::boot`].
pub struct KernelBuilder {
    layout: MemoryLayout,
    console: Box<dyn Console>,
    decoder: Box<dyn ScancodeDecoder>,
    images: ImageTable,
    tick_callback: Option<Box<dyn FnMut(u32) + Send>>,
    scheduler: Box<dyn Scheduler>,
}

impl KernelBuilder {
    /// A default machine running the executables of `images`.
    ///
    /// `images` must hold `init` and `idle`.
    pub fn new(images: ImageTable) -> Self {
        Self {
            layout: MemoryLayout::default(),
            console: Box::new(TextConsole::new()),
            decoder: Box::new(UsKeyboard::new()),
            images,
            tick_callback: None,
            scheduler: Box::new(RoundRobin::new()),
        }
    }

    /// Use the memory map `layout`.
    pub fn layout(mut self, layout: MemoryLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Print to `console`.
    pub fn console(mut self, console: impl Console + 'static) -> Self {
        self.console = Box::new(console);
        self
    }

    /// Decode scancodes with `decoder`.
    pub fn decoder(mut self, decoder: impl ScancodeDecoder + 'static) -> Self {
        self.decoder = Box::new(decoder);
        self
    }

    /// Call `f` with the tick count on every timer interrupt.
    pub fn tick_callback(mut self, f: impl FnMut(u32) + Send + 'static) -> Self {
        self.tick_callback = Some(Box::new(f));
        self
    }

    /// Schedule with `scheduler`.
    pub fn scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Box::new(scheduler);
        self
    }

    /// Boot.
    ///
    /// Returns the kernel and the frame of the first thread to run: the idle
    /// thread of the root process. `init` is ready as its child.
    pub fn boot(self) -> Result<(Kernel, TrapFrame), KernelError> {
        let cpu = Cpu::new();
        info!("Memory layout: {:x?}", self.layout);
        let mm = MemoryManager::new(self.layout)?;

        let mut traps = TrapTable::new();
        trap::install(&mut traps);
        syscall::install(&mut traps);
        hv::install(&mut traps);
        let hypercalls = HypercallTable::new();
        let pit = Pit::program(timer::TIMER_INTERRUPT_HZ);
        info!(
            "Traps installed; timer at {} Hz (divisor {}).",
            pit.frequency(),
            pit.divisor()
        );

        let mut kernel = Kernel {
            cpu,
            mm,
            blocks: ControlBlocks::new(),
            traps,
            hypercalls,
            scheduler: self.scheduler,
            ticks: 0,
            tick_callback: self.tick_callback,
            keyboard: KeyboardService::new(self.decoder),
            ps2: Ps2Port::new(),
            console: SpinLock::new(self.console),
            readline: Default::default(),
            images: self.images,
            init_pid: ROOT_PID,
            halted: false,
        };

        let frame = {
            let guard = InterruptGuard::new(&kernel.cpu);
            let pd = kernel.mm.construct_page_dir()?;
            kernel
                .blocks
                .insert_process(Pcb::new(ROOT_PID, None, pd));
            let root = kernel.blocks.allocate_tid();
            kernel.create_thread(root, ROOT_PID, &TrapFrame::default(), ExceptionHandler::NoHandler)?;
            kernel.blocks.alter_state(&guard, root, ThreadState::Running);
            kernel.activate(root);
            info!("Root process created.");

            let init = kernel.replace_image(&guard, ROOT_PID, "init", &["init"])?;
            kernel.init_pid = kernel.fork(&guard, &init)?;
            info!("init is process {}.", kernel.init_pid);

            kernel.replace_image(&guard, ROOT_PID, "idle", &["idle"])?
        };
        kernel.cpu.enable_interrupts();
        info!("Boot complete.");
        Ok((kernel, frame))
    }
}

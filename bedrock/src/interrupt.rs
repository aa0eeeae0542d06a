//! Interrupt state and per-CPU control registers.
//!
//! There is one CPU. Its interrupt flag and the control registers the kernel
//! programs (CR2, CR3 and the TSS `esp0`) live in a shared [`Cpu`] so that
//! an [`InterruptGuard`] can be held while the rest of the kernel is
//! borrowed mutably.
use crate::addressing::Pa;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Enumeration for representing interrupt state
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum InterruptState {
    /// Interrupt is on.
    On,
    /// Interrupt is off.
    Off,
}

/// The processor.
#[derive(Debug)]
pub struct Cpu {
    interrupt_flag: AtomicBool,
    cr2: AtomicU32,
    cr3: AtomicU32,
    esp0: AtomicU32,
}

impl Cpu {
    /// A processor fresh out of reset: interrupts off, registers zero.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            interrupt_flag: AtomicBool::new(false),
            cr2: AtomicU32::new(0),
            cr3: AtomicU32::new(0),
            esp0: AtomicU32::new(0),
        })
    }

    /// Read the current interrupt state.
    pub fn interrupt_state(&self) -> InterruptState {
        if self.interrupt_flag.load(Ordering::SeqCst) {
            InterruptState::On
        } else {
            InterruptState::Off
        }
    }

    /// `sti`
    pub fn enable_interrupts(&self) {
        self.interrupt_flag.store(true, Ordering::SeqCst);
    }

    /// `cli`
    pub fn disable_interrupts(&self) {
        self.interrupt_flag.store(false, Ordering::SeqCst);
    }

    /// Faulting address of the last page fault.
    pub fn cr2(&self) -> u32 {
        self.cr2.load(Ordering::SeqCst)
    }

    /// Latch the faulting address of a page fault.
    pub fn set_cr2(&self, addr: u32) {
        self.cr2.store(addr, Ordering::SeqCst);
    }

    /// Physical address of the active page directory.
    pub fn cr3(&self) -> Pa {
        Pa::new(self.cr3.load(Ordering::SeqCst))
    }

    /// Load a page directory. This also flushes the TLB.
    pub fn set_cr3(&self, pd: Pa) {
        self.cr3.store(pd.into_u32(), Ordering::SeqCst);
    }

    /// Stack pointer loaded on a ring 3 to ring 0 transition.
    pub fn esp0(&self) -> u32 {
        self.esp0.load(Ordering::SeqCst)
    }

    /// Program the TSS's `esp0`.
    pub fn set_esp0(&self, esp0: u32) {
        self.esp0.store(esp0, Ordering::SeqCst);
    }
}

/// An RAII implementation of an interrupt disable. When this structure is
/// dropped (falls out of scope), the interrupt will be recovered into state on creation of this struct.
/// Therefore, you must dropped the this struct in reverse of creation order.
///
/// Holding a guard is the capability kernel code needs to mutate scheduling
/// state.
///
/// This structure is created by the [`new`].
///
/// [`new`]: InterruptGuard::new
pub struct InterruptGuard {
    cpu: Arc<Cpu>,
    state: InterruptState,
}

impl InterruptGuard {
    /// Create a new InterruptGuard.
    pub fn new(cpu: &Arc<Cpu>) -> Self {
        let state = cpu.interrupt_state();
        cpu.disable_interrupts();
        Self {
            cpu: Arc::clone(cpu),
            state,
        }
    }

    /// The processor whose interrupts are held off.
    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.state == InterruptState::On {
            self.cpu.enable_interrupts();
        }
    }
}

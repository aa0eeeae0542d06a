//! Driving user code from the embedder.
//!
//! There is no instruction stream: the embedder plays the part of user code
//! and of the hardware around it. Each method here raises the trap the real
//! machine would raise for one user action, then lets [`Kernel::handle`]
//! take it. `frame` always holds the registers of the running thread.
//!
//! Memory accesses go through the MMU with the privilege of the running
//! code. A fault is taken like any other trap; if the kernel resolves it the
//! access is retried, otherwise the access reports [`Interrupted`].
use crate::{
    hv::HV_INT,
    trap::{KEYBOARD_VECTOR, TIMER_VECTOR},
    Kernel,
};
use bedrock::{
    addressing::{Pa, Va, PAGE_SIZE},
    mmu::{self, AccessKind},
    x86::interrupt::{ExceptionVector, TrapFrame},
};
use core::fmt;

/// A user action did not complete: the thread that attempted it was
/// descheduled, killed, or redirected to an exception handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("user access interrupted")
    }
}

// Error code of a #GP raised by `int` through a gate of too high a DPL.
fn idt_error_code(vector: u8) -> u32 {
    (vector as u32) << 3 | 0b10
}

impl Kernel {
    /// The timer fired.
    pub fn tick(&mut self, frame: &mut TrapFrame) {
        frame.cause = TIMER_VECTOR as u32;
        self.handle(frame);
    }

    /// A key was struck.
    pub fn press(&mut self, frame: &mut TrapFrame, scancode: u8) {
        self.ps2.feed(scancode);
        frame.cause = KEYBOARD_VECTOR as u32;
        self.handle(frame);
    }

    /// Raise `int vector` with `esi` in `%esi`.
    ///
    /// Returns `%eax` if the caller is still the running thread afterwards,
    /// that is, the call returned without blocking. A gate the caller may
    /// not use raises a general protection fault instead.
    pub fn syscall(&mut self, frame: &mut TrapFrame, vector: u8, esi: u32) -> Option<u32> {
        let tid = self.blocks.current();
        if self.traps.gate(vector).permits(frame.privilege_level()) {
            frame.cause = vector as u32;
            frame.esi = esi;
            frame.error_code = 0;
        } else {
            frame.cause = ExceptionVector::GeneralProtection.vector() as u32;
            frame.error_code = idt_error_code(vector);
        }
        self.handle(frame);
        (self.blocks.current() == tid && !self.halted).then_some(frame.eax)
    }

    /// Issue hypercall `op` from guest code.
    ///
    /// `args` are pushed on the guest stack, first argument lowest, and
    /// popped again if the call returns to the instruction after it.
    pub fn hypercall(
        &mut self,
        frame: &mut TrapFrame,
        op: u32,
        args: &[u32],
    ) -> Result<Option<u32>, Interrupted> {
        let tid = self.blocks.current();
        let ums = self.mm.layout.user_mem_start;
        let esp = frame.esp.wrapping_sub(4 * args.len() as u32);
        for (i, arg) in args.iter().enumerate() {
            let at = ums.wrapping_add(esp).wrapping_add(4 * i as u32);
            self.user_write(frame, at, &arg.to_le_bytes())?;
        }
        let (eip, saved_esp) = (frame.eip, frame.esp);
        frame.esp = esp;
        frame.eax = op;
        frame.cause = HV_INT as u32;
        frame.error_code = 0;
        self.handle(frame);

        if self.blocks.current() != tid || self.halted {
            return Ok(None);
        }
        if frame.eip == eip && frame.esp == esp {
            frame.esp = saved_esp;
        }
        Ok(Some(frame.eax))
    }

    /// Read `buf.len()` bytes at linear address `va` as the running code.
    pub fn user_read(
        &mut self,
        frame: &mut TrapFrame,
        va: u32,
        buf: &mut [u8],
    ) -> Result<(), Interrupted> {
        let mut done = 0;
        while done < buf.len() {
            let at = va.checked_add(done as u32).ok_or(Interrupted)?;
            let n = (PAGE_SIZE - Va::new(at).page_offset()).min(buf.len() - done);
            let pa = self.access(frame, at, AccessKind::Read)?;
            self.mm.mem.read(pa, &mut buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Write `data` at linear address `va` as the running code.
    pub fn user_write(
        &mut self,
        frame: &mut TrapFrame,
        va: u32,
        data: &[u8],
    ) -> Result<(), Interrupted> {
        let mut done = 0;
        while done < data.len() {
            let at = va.checked_add(done as u32).ok_or(Interrupted)?;
            let n = (PAGE_SIZE - Va::new(at).page_offset()).min(data.len() - done);
            let pa = self.access(frame, at, AccessKind::Write)?;
            self.mm.mem.write(pa, &data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Read a word as the running code.
    pub fn user_read_u32(&mut self, frame: &mut TrapFrame, va: u32) -> Result<u32, Interrupted> {
        let mut b = [0; 4];
        self.user_read(frame, va, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Write a word as the running code.
    pub fn user_write_u32(
        &mut self,
        frame: &mut TrapFrame,
        va: u32,
        v: u32,
    ) -> Result<(), Interrupted> {
        self.user_write(frame, va, &v.to_le_bytes())
    }

    // Translate `va`, taking page faults until it resolves or the faulting
    // thread stops being the one that resumes at the same instruction.
    fn access(
        &mut self,
        frame: &mut TrapFrame,
        va: u32,
        kind: AccessKind,
    ) -> Result<Pa, Interrupted> {
        let tid = self.blocks.current();
        let eip = frame.eip;
        loop {
            let fault = match mmu::translate(
                &self.mm.mem,
                self.cpu.cr3(),
                Va::new(va),
                kind,
                frame.privilege_level(),
            ) {
                Ok(pa) => return Ok(pa),
                Err(fault) => fault,
            };
            if self.halted {
                return Err(Interrupted);
            }
            self.cpu.set_cr2(fault.addr.into_u32());
            frame.cause = ExceptionVector::PageFault.vector() as u32;
            frame.cr2 = fault.addr.into_u32();
            frame.error_code = fault.code.bits();
            self.handle(frame);
            if self.blocks.current() != tid || frame.eip != eip {
                return Err(Interrupted);
            }
        }
    }
}

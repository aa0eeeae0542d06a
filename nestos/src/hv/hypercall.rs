//! Hypercalls.
//!
//! A guest requests a hypercall with `int $0xDE`. `%eax` holds the
//! operation; the arguments are consecutive words at the guest's `%esp`.
//! Handlers validate every argument against guest memory and report a bad
//! one as a [`GuestFault`], which crashes the guest.
use super::{GuestAddr, GuestFault, HV_MAGIC, HV_PRINT_MAX, VIRTUAL_IDT_LEN};
use crate::Kernel;
use alloc::vec;
use bedrock::{
    interrupt::InterruptGuard,
    x86::{interrupt::TrapFrame, Eflags},
};
use num_enum::TryFromPrimitive;

/// Supported hypercalls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum HvOp {
    /// Answer [`HV_MAGIC`].
    Magic = 0,
    /// Exit with a status.
    Exit = 1,
    /// Return from a virtual interrupt.
    Iret = 2,
    /// Set or clear a virtual IDT entry.
    SetIdt = 3,
    DisableInterrupts = 4,
    EnableInterrupts = 5,
    /// Switch guest page directories. Not supported.
    SetPd = 6,
    /// Invalidate a guest mapping. Not supported.
    AdjustPg = 7,
    Print = 8,
    SetColor = 9,
    SetCursor = 10,
    GetCursor = 11,
    /// Print at a position in a color, leaving cursor and color as they
    /// were.
    PrintAt = 12,
}

/// Number of hypercall operations.
pub const HV_OP_COUNT: usize = 13;

/// A hypercall handler.
pub type HypercallHandler =
    fn(&mut Kernel, &InterruptGuard, &mut TrapFrame) -> Result<(), GuestFault>;

/// Handlers by operation.
pub struct HypercallTable {
    handlers: [Option<HypercallHandler>; HV_OP_COUNT],
}

impl Default for HypercallTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HypercallTable {
    /// A table with every operation installed.
    pub fn new() -> Self {
        let mut table = Self {
            handlers: [None; HV_OP_COUNT],
        };
        let calls: [(HvOp, HypercallHandler); HV_OP_COUNT] = [
            (HvOp::Magic, magic),
            (HvOp::Exit, exit),
            (HvOp::Iret, iret),
            (HvOp::SetIdt, set_idt),
            (HvOp::DisableInterrupts, disable_interrupts),
            (HvOp::EnableInterrupts, enable_interrupts),
            (HvOp::SetPd, set_pd),
            (HvOp::AdjustPg, adjust_pg),
            (HvOp::Print, print),
            (HvOp::SetColor, set_color),
            (HvOp::SetCursor, set_cursor),
            (HvOp::GetCursor, get_cursor),
            (HvOp::PrintAt, print_at),
        ];
        for (op, handler) in calls {
            table.register(op, handler);
        }
        table
    }

    /// Install `handler` for `op`.
    pub fn register(&mut self, op: HvOp, handler: HypercallHandler) {
        self.handlers[op as usize] = Some(handler);
    }

    /// The handler of `op`.
    pub fn get(&self, op: HvOp) -> Option<HypercallHandler> {
        self.handlers[op as usize]
    }
}

impl Kernel {
    /// Run the hypercall named by `%eax`.
    pub(crate) fn run_hypercall(
        &mut self,
        guard: &InterruptGuard,
        frame: &mut TrapFrame,
    ) -> Result<(), GuestFault> {
        let op = HvOp::try_from_primitive(frame.eax)
            .map_err(|_| GuestFault::UnknownHypercall(frame.eax))?;
        let handler = self
            .hypercalls
            .get(op)
            .ok_or(GuestFault::UnknownHypercall(frame.eax))?;
        handler(self, guard, frame)
    }

    /// The `N` argument words at the guest's stack pointer.
    fn hv_args<const N: usize>(&mut self, frame: &TrapFrame) -> Result<[u32; N], GuestFault> {
        let at = GuestAddr::new(frame.esp)
            .into_host(4 * N as u32, &self.mm.layout)
            .ok_or(GuestFault::BadAddress(frame.esp))?;
        let pd = self.blocks.current_pcb().page_dir;
        let mut words = [0; N];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self
                .mm
                .read_user_u32(pd, at + 4 * i as u32)
                .map_err(|_| GuestFault::BadAddress(frame.esp))?;
        }
        Ok(words)
    }

    // Read `len` bytes of guest memory at guest address `buf`.
    fn guest_bytes(&mut self, buf: u32, len: u32) -> Result<alloc::vec::Vec<u8>, GuestFault> {
        let at = GuestAddr::new(buf)
            .into_host(len, &self.mm.layout)
            .ok_or(GuestFault::BadAddress(buf))?;
        let pd = self.blocks.current_pcb().page_dir;
        let mut bytes = vec![0; len as usize];
        self.mm
            .copy_from_user(pd, at, &mut bytes)
            .map_err(|_| GuestFault::BadAddress(buf))?;
        Ok(bytes)
    }

    // The host address of a guest word the host may write.
    fn guest_out_word(&self, addr: u32) -> Result<u32, GuestFault> {
        let pd = self.blocks.current_pcb().page_dir;
        GuestAddr::new(addr)
            .into_host(4, &self.mm.layout)
            .filter(|&at| self.mm.check_user_range(pd, at, 4, true))
            .ok_or(GuestFault::BadAddress(addr))
    }
}

fn print_len(len: u32) -> Result<u32, GuestFault> {
    if (len as i32) < 0 || len as usize > HV_PRINT_MAX {
        Err(GuestFault::BadArgument("print length"))
    } else {
        Ok(len)
    }
}

fn magic(_: &mut Kernel, _: &InterruptGuard, frame: &mut TrapFrame) -> Result<(), GuestFault> {
    frame.eax = HV_MAGIC;
    Ok(())
}

/// `void hv_exit(int status)`
fn exit(kernel: &mut Kernel, guard: &InterruptGuard, frame: &mut TrapFrame) -> Result<(), GuestFault> {
    let [status] = kernel.hv_args::<1>(frame)?;
    kernel.set_status(status as i32);
    kernel.vanish(guard, frame);
    Ok(())
}

/// `void hv_iret(void *eip, unsigned int eflags, void *esp, void *esp0, unsigned int eax)`
fn iret(kernel: &mut Kernel, _: &InterruptGuard, frame: &mut TrapFrame) -> Result<(), GuestFault> {
    let [eip, eflags, esp, esp0, eax] = kernel.hv_args::<5>(frame)?;
    if esp0 != 0 || !Eflags::from_bits_truncate(frame.eflags).permits(eflags) {
        return Err(GuestFault::BadIret);
    }
    // The guest runs with IF on; its own IF becomes the virtual one.
    let virtual_if = eflags & Eflags::IF.bits() != 0;
    frame.eip = eip;
    frame.eflags = eflags | Eflags::IF.bits();
    frame.esp = esp;
    frame.eax = eax;
    kernel.guest_mut().interrupt_enable = virtual_if;
    Ok(())
}

/// `void hv_setidt(int irqno, void *eip, int privileged)`
fn set_idt(kernel: &mut Kernel, _: &InterruptGuard, frame: &mut TrapFrame) -> Result<(), GuestFault> {
    let [irq, eip] = kernel.hv_args::<2>(frame)?;
    if irq as usize >= VIRTUAL_IDT_LEN {
        return Err(GuestFault::BadArgument("virtual interrupt number"));
    }
    let entry = match eip {
        0 => None,
        eip => {
            GuestAddr::new(eip)
                .into_host(1, &kernel.mm.layout)
                .ok_or(GuestFault::BadAddress(eip))?;
            Some(GuestAddr::new(eip))
        }
    };
    kernel.guest_mut().virtual_idt[irq as usize] = entry;
    Ok(())
}

fn disable_interrupts(
    kernel: &mut Kernel,
    _: &InterruptGuard,
    _: &mut TrapFrame,
) -> Result<(), GuestFault> {
    kernel.guest_mut().interrupt_enable = false;
    Ok(())
}

fn enable_interrupts(
    kernel: &mut Kernel,
    _: &InterruptGuard,
    _: &mut TrapFrame,
) -> Result<(), GuestFault> {
    kernel.guest_mut().interrupt_enable = true;
    Ok(())
}

fn set_pd(_: &mut Kernel, _: &InterruptGuard, _: &mut TrapFrame) -> Result<(), GuestFault> {
    Err(GuestFault::Unsupported(HvOp::SetPd))
}

fn adjust_pg(_: &mut Kernel, _: &InterruptGuard, _: &mut TrapFrame) -> Result<(), GuestFault> {
    Err(GuestFault::Unsupported(HvOp::AdjustPg))
}

/// `void hv_print(int len, unsigned char *buf)`
fn print(kernel: &mut Kernel, _: &InterruptGuard, frame: &mut TrapFrame) -> Result<(), GuestFault> {
    let [len, buf] = kernel.hv_args::<2>(frame)?;
    let bytes = kernel.guest_bytes(buf, print_len(len)?)?;
    kernel.lock_console().putbytes(&bytes);
    Ok(())
}

/// `void hv_cons_set_term_color(int color)`
fn set_color(kernel: &mut Kernel, _: &InterruptGuard, frame: &mut TrapFrame) -> Result<(), GuestFault> {
    let [color] = kernel.hv_args::<1>(frame)?;
    kernel
        .lock_console()
        .set_term_color(color as i32)
        .map_err(|_| GuestFault::BadArgument("color"))
}

/// `void hv_cons_set_cursor_pos(int row, int col)`
fn set_cursor(kernel: &mut Kernel, _: &InterruptGuard, frame: &mut TrapFrame) -> Result<(), GuestFault> {
    let [row, col] = kernel.hv_args::<2>(frame)?;
    kernel
        .lock_console()
        .set_cursor(row as i32, col as i32)
        .map_err(|_| GuestFault::BadArgument("cursor position"))
}

/// `void hv_cons_get_cursor_pos(int *row, int *col)`
fn get_cursor(kernel: &mut Kernel, _: &InterruptGuard, frame: &mut TrapFrame) -> Result<(), GuestFault> {
    let [row_ptr, col_ptr] = kernel.hv_args::<2>(frame)?;
    let row_at = kernel.guest_out_word(row_ptr)?;
    let col_at = kernel.guest_out_word(col_ptr)?;
    let (row, col) = kernel.lock_console().cursor();
    let pd = kernel.blocks.current_pcb().page_dir;
    kernel
        .mm
        .write_user_u32(pd, row_at, row as u32)
        .and_then(|_| kernel.mm.write_user_u32(pd, col_at, col as u32))
        .map_err(|_| GuestFault::BadAddress(row_ptr))
}

/// `void hv_print_at(int len, unsigned char *buf, int row, int col, int color)`
fn print_at(kernel: &mut Kernel, _: &InterruptGuard, frame: &mut TrapFrame) -> Result<(), GuestFault> {
    let [len, buf, row, col, color] = kernel.hv_args::<5>(frame)?;
    let bytes = kernel.guest_bytes(buf, print_len(len)?)?;

    let mut console = kernel.lock_console();
    let (old_row, old_col) = console.cursor();
    let old_color = console.term_color();
    let placed = console
        .set_cursor(row as i32, col as i32)
        .and_then(|_| console.set_term_color(color as i32));
    if placed.is_ok() {
        console.putbytes(&bytes);
    }
    // Both were valid a moment ago.
    let _ = console.set_cursor(old_row, old_col);
    let _ = console.set_term_color(old_color);
    placed.map_err(|_| GuestFault::BadArgument("print position or color"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_operation_has_a_handler() {
        let table = HypercallTable::new();
        for op in 0..HV_OP_COUNT as u32 {
            let op = HvOp::try_from_primitive(op).unwrap();
            assert!(table.get(op).is_some(), "{:?}", op);
        }
        assert!(HvOp::try_from_primitive(HV_OP_COUNT as u32).is_err());
    }

    #[test]
    fn print_length_is_bounded() {
        assert_eq!(print_len(0), Ok(0));
        assert_eq!(print_len(HV_PRINT_MAX as u32), Ok(HV_PRINT_MAX as u32));
        assert!(print_len(HV_PRINT_MAX as u32 + 1).is_err());
        assert!(print_len(-1i32 as u32).is_err());
    }
}

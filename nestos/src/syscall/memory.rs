//! Page allocation system calls.
use super::complete;
use crate::{
    error::KernelError,
    mm::Mapping,
    thread::Allocation,
    Kernel,
};
use bedrock::{
    addressing::{Va, PAGE_SIZE, VIRTUAL_ADDR_END},
    interrupt::InterruptGuard,
    x86::{interrupt::TrapFrame, paging::Availability},
};

fn pages(base: u32, len: u32) -> impl Iterator<Item = Va> {
    (0..len / PAGE_SIZE as u32).map(move |i| Va::new(base + i * PAGE_SIZE as u32))
}

fn allocate(kernel: &mut Kernel, base: u32, len: u32) -> Result<u32, KernelError> {
    let va = Va::new(base);
    if !va.is_page_aligned() || len == 0 || len % PAGE_SIZE as u32 != 0 {
        return Err(KernelError::InvalidArgument);
    }
    if va < kernel.mm.user_start() || base as u64 + len as u64 > VIRTUAL_ADDR_END {
        return Err(KernelError::InvalidArgument);
    }
    let pd = kernel.blocks.current_pcb().page_dir;
    for page in pages(base, len) {
        match kernel.mm.check_user_page(pd, page)? {
            Mapping::PdeAbsent(Availability::Unavailable)
            | Mapping::PteAbsent(Availability::Unavailable) => (),
            _ => return Err(KernelError::InvalidArgument),
        }
    }
    kernel
        .mm
        .change_availability(pd, base, len, Availability::Available)?;
    kernel
        .blocks
        .current_pcb_mut()
        .allocations
        .push(Allocation { base, len });
    Ok(0)
}

/// `int new_pages(void *base, int len)`
///
/// The pages are zero-fill-on-demand: nothing is mapped until touched.
pub fn new_pages(kernel: &mut Kernel, _guard: &InterruptGuard, frame: &mut TrapFrame) {
    let result = kernel
        .packet::<2>(frame)
        .and_then(|[base, len]| allocate(kernel, base, len));
    complete(frame, result);
}

/// `int remove_pages(void *base)`
pub fn remove_pages(kernel: &mut Kernel, _guard: &InterruptGuard, frame: &mut TrapFrame) {
    let base = frame.esi;
    let pcb = kernel.blocks.current_pcb_mut();
    let at = match pcb.allocations.iter().position(|a| a.base == base) {
        Some(at) => at,
        None => return complete(frame, Err(KernelError::InvalidArgument)),
    };
    let Allocation { len, .. } = pcb.allocations.remove(at);
    let pd = pcb.page_dir;

    let result = pages(base, len).try_for_each(|page| {
        if let Mapping::ZeroFrame | Mapping::Private(_) = kernel.mm.check_user_page(pd, page)? {
            kernel.mm.unmap_frame(pd, page)?;
        }
        kernel
            .mm
            .set_availability(pd, page, Availability::Unavailable)
    });
    complete(frame, result.map(|_| 0).map_err(KernelError::from));
}

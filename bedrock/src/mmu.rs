//! Linear-address translation.
//!
//! The MMU walks the directory named by CR3 the way the hardware does. Both
//! levels must be present, both must grant U/S for a ring 3 access, and both
//! must grant R/W for any write: the machine runs with CR0.WP set, so the
//! kernel cannot scribble over a read-only page either.
use crate::{
    addressing::{Pa, Va},
    memory::PhysicalMemory,
    x86::{
        paging::{Pde, PdeFlags, Pte, PteFlags},
        PrivilegeLevel,
    },
};

bitflags::bitflags! {
    /// Error code pushed for a page fault.
    pub struct PageFaultErrorCode: u32 {
        /// The fault was a protection violation on a present page.
        const P = 1 << 0;
        /// The access was a write.
        const W = 1 << 1;
        /// The access came from ring 3.
        const U = 1 << 2;
    }
}

/// Kind of a memory access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// A page fault raised by a translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting linear address; latched into CR2.
    pub addr: Va,
    /// Error code pushed on the stack.
    pub code: PageFaultErrorCode,
}

/// Read the directory and table entries covering `va`, if the table exists.
pub fn walk(mem: &PhysicalMemory, cr3: Pa, va: Va) -> (Pde, Option<Pte>) {
    let pde = Pde(mem.read_u32(cr3 + (va.pde_index() * 4) as u32));
    let pte = pde
        .pa()
        .map(|table| Pte(mem.read_u32(table + (va.pte_index() * 4) as u32)));
    (pde, pte)
}

/// Translate `va` for an access of `kind` from privilege level `pl`.
pub fn translate(
    mem: &PhysicalMemory,
    cr3: Pa,
    va: Va,
    kind: AccessKind,
    pl: PrivilegeLevel,
) -> Result<Pa, PageFault> {
    let user = pl == PrivilegeLevel::Ring3;
    let write = kind == AccessKind::Write;
    let mut code = PageFaultErrorCode::empty();
    code.set(PageFaultErrorCode::W, write);
    code.set(PageFaultErrorCode::U, user);
    let fault = |code| Err(PageFault { addr: va, code });

    let (pde, pte) = walk(mem, cr3, va);
    let pte = match pte {
        Some(pte) if pte.is_present() => pte,
        _ => return fault(code),
    };
    code |= PageFaultErrorCode::P;

    let (dflags, tflags) = (pde.flags(), pte.flags());
    if user && !(dflags.contains(PdeFlags::US) && tflags.contains(PteFlags::US)) {
        return fault(code);
    }
    if write && !(dflags.contains(PdeFlags::RW) && tflags.contains(PteFlags::RW)) {
        return fault(code);
    }
    match pte.pa() {
        Some(frame) => Ok(frame + va.page_offset() as u32),
        None => fault(code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86::paging::Availability;

    // Directory at 0x1000, one table at 0x2000 covering [0, 4 MiB).
    fn machine(pte: Pte) -> PhysicalMemory {
        let mut mem = PhysicalMemory::new(0x10000);
        let pde = Pde::present(Pa::new(0x2000), PdeFlags::RW | PdeFlags::US).unwrap();
        mem.write_u32(Pa::new(0x1000), pde.0);
        mem.write_u32(Pa::new(0x2000 + 5 * 4), pte.0);
        mem
    }

    #[test]
    fn user_read_of_present_page() {
        let pte = Pte::present(Pa::new(0x8000), PteFlags::US).unwrap();
        let mem = machine(pte);
        let pa = translate(
            &mem,
            Pa::new(0x1000),
            Va::new(0x5010),
            AccessKind::Read,
            PrivilegeLevel::Ring3,
        );
        assert_eq!(pa, Ok(Pa::new(0x8010)));
    }

    #[test]
    fn write_to_read_only_faults_for_everyone() {
        let pte = Pte::present(Pa::new(0x8000), PteFlags::US).unwrap();
        let mem = machine(pte);
        for pl in [PrivilegeLevel::Ring0, PrivilegeLevel::Ring3] {
            let err = translate(&mem, Pa::new(0x1000), Va::new(0x5000), AccessKind::Write, pl)
                .unwrap_err();
            assert!(err.code.contains(PageFaultErrorCode::P | PageFaultErrorCode::W));
        }
    }

    #[test]
    fn absent_page_faults_without_p() {
        let mem = machine(Pte::absent(Availability::Available));
        let err = translate(
            &mem,
            Pa::new(0x1000),
            Va::new(0x5000),
            AccessKind::Read,
            PrivilegeLevel::Ring3,
        )
        .unwrap_err();
        assert_eq!(err.code, PageFaultErrorCode::U);
        assert_eq!(err.addr, Va::new(0x5000));
    }

    #[test]
    fn supervisor_page_refuses_user() {
        let pte = Pte::present(Pa::new(0x8000), PteFlags::RW).unwrap();
        let mem = machine(pte);
        assert!(translate(
            &mem,
            Pa::new(0x1000),
            Va::new(0x5000),
            AccessKind::Read,
            PrivilegeLevel::Ring3
        )
        .is_err());
        assert!(translate(
            &mem,
            Pa::new(0x1000),
            Va::new(0x5000),
            AccessKind::Write,
            PrivilegeLevel::Ring0
        )
        .is_ok());
    }
}

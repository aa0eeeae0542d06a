//! Page directory manager.
//!
//! Every user page is in exactly one of four states:
//!
//! | state        | meaning                                               |
//! |--------------|-------------------------------------------------------|
//! | `PdeAbsent`  | no page table covers the page                         |
//! | `PteAbsent`  | a table exists but the entry is not present           |
//! | `ZeroFrame`  | mapped read-only to the shared zero frame             |
//! | `Private`    | mapped to a frame owned by this address space         |
//!
//! While absent, the entry's software bits say whether a fault may bring the
//! page in (zero-fill-on-demand). A read materializes an available page as
//! the zero frame, a write as a fresh private frame. A write to a zero-frame
//! page upgrades it to a private frame once; the upgrade is kept until the
//! page is unmapped.
//!
//! Nothing below the user boundary can be touched through this module.
use super::MemoryManager;
use crate::error::MappingError;
use alloc::{string::String, vec::Vec};
use bedrock::{
    addressing::{Pa, Va, PAGE_SIZE, VIRTUAL_ADDR_END},
    interrupt::Cpu,
    mmu::{self, AccessKind},
    x86::{
        paging::{Availability, Pde, PdeFlags, Pte, PteFlags, PAGE_TABLE_SPAN, PDE_COUNT, PTE_COUNT},
        PrivilegeLevel,
    },
};

/// A page directory, named by its physical address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageDir(Pa);

impl PageDir {
    /// Physical address of the directory; the value loaded into CR3.
    #[inline]
    pub fn pa(self) -> Pa {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn dangling() -> Self {
        Self(Pa::ZERO)
    }
}

/// Access rights of a mapped page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

impl Access {
    fn flags(self) -> PteFlags {
        match self {
            Self::ReadOnly => PteFlags::US,
            Self::ReadWrite => PteFlags::US | PteFlags::RW,
        }
    }
}

/// How a user page is currently backed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mapping {
    /// The directory entry is absent.
    PdeAbsent(Availability),
    /// The table entry is absent.
    PteAbsent(Availability),
    /// Mapped to the shared zero frame.
    ZeroFrame,
    /// Mapped to a private frame.
    Private(Pa),
}

impl Mapping {
    /// Whether an absent page may be brought in. Mapped pages are available.
    pub fn availability(self) -> Availability {
        match self {
            Self::PdeAbsent(a) | Self::PteAbsent(a) => a,
            _ => Availability::Available,
        }
    }
}

#[inline]
fn slot(base: Pa, index: usize) -> Pa {
    base + (index * 4) as u32
}

impl MemoryManager {
    fn user_page(&self, va: Va) -> Result<Va, MappingError> {
        if va < self.user_start() {
            Err(MappingError::NotUserPage)
        } else {
            Ok(va.page_down())
        }
    }

    fn read_pde(&self, pd: PageDir, va: Va) -> Pde {
        Pde(self.mem.read_u32(slot(pd.0, va.pde_index())))
    }

    fn write_pde(&mut self, pd: PageDir, va: Va, pde: Pde) {
        self.mem.write_u32(slot(pd.0, va.pde_index()), pde.0);
    }

    fn read_pte(&self, table: Pa, va: Va) -> Pte {
        Pte(self.mem.read_u32(slot(table, va.pte_index())))
    }

    fn write_pte(&mut self, table: Pa, va: Va, pte: Pte) {
        self.mem.write_u32(slot(table, va.pte_index()), pte.0);
    }

    fn kernel_pdes(&self) -> usize {
        (self.layout.user_mem_start as u64 / PAGE_TABLE_SPAN) as usize
    }

    /// Pages covering `[addr, addr + len)`, rounded outward.
    fn pages(addr: u32, len: u32) -> Result<impl Iterator<Item = Va>, MappingError> {
        let start = Va::new(addr).page_down().into_u32() as u64;
        let end = (addr as u64 + len as u64 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        if end > VIRTUAL_ADDR_END {
            return Err(MappingError::NotUserPage);
        }
        let end = if len == 0 { start } else { end };
        Ok((start..end)
            .step_by(PAGE_SIZE)
            .map(|va| Va::new(va as u32)))
    }

    /// Build a directory that maps the kernel region and nothing else.
    pub fn construct_page_dir(&mut self) -> Result<PageDir, MappingError> {
        let pd = self.arena.alloc(1).ok_or(MappingError::NoMemory)?;
        // All-zero entries are absent and unavailable.
        self.mem.zero_page(pd);
        for (i, &table) in self.kernel_tables.iter().enumerate() {
            let pde = Pde::present(table, PdeFlags::RW).ok_or(MappingError::Unaligned)?;
            self.mem.write_u32(slot(pd, i), pde.0);
        }
        Ok(PageDir(pd))
    }

    /// Free every private frame and table of `pd`, then `pd` itself.
    pub fn destruct_page_dir(&mut self, pd: PageDir) {
        let zero = self.zero_frame();
        for i in self.kernel_pdes()..PDE_COUNT {
            let table = match Pde(self.mem.read_u32(slot(pd.0, i))).pa() {
                Some(table) => table,
                None => continue,
            };
            for j in 0..PTE_COUNT {
                match Pte(self.mem.read_u32(slot(table, j))).pa() {
                    Some(frame) if frame != zero => self.frames.free(frame),
                    _ => (),
                }
            }
            self.arena.dealloc(table, 1);
        }
        self.arena.dealloc(pd.0, 1);
    }

    /// The table covering `va`, allocated if absent.
    ///
    /// A new table's entries inherit the directory entry's availability.
    pub fn ensure_table(&mut self, pd: PageDir, va: Va) -> Result<Pa, MappingError> {
        let va = self.user_page(va)?;
        let pde = self.read_pde(pd, va);
        if let Some(table) = pde.pa() {
            return Ok(table);
        }
        let table = self.arena.alloc(1).ok_or(MappingError::NoMemory)?;
        let entry = Pte::absent(pde.availability());
        for i in 0..PTE_COUNT {
            self.mem.write_u32(slot(table, i), entry.0);
        }
        let pde = Pde::present(table, PdeFlags::RW | PdeFlags::US).ok_or(MappingError::Unaligned)?;
        self.write_pde(pd, va, pde);
        Ok(table)
    }

    /// Classify the page containing `va`.
    pub fn check_user_page(&self, pd: PageDir, va: Va) -> Result<Mapping, MappingError> {
        let va = self.user_page(va)?;
        let (pde, pte) = mmu::walk(&self.mem, pd.0, va);
        Ok(match pte {
            None => Mapping::PdeAbsent(pde.availability()),
            Some(pte) => match pte.pa() {
                None => Mapping::PteAbsent(pte.availability()),
                Some(frame) if frame == self.zero_frame() => Mapping::ZeroFrame,
                Some(frame) => Mapping::Private(frame),
            },
        })
    }

    /// Back the page containing `va` with a fresh zeroed frame.
    pub fn map_new_frame(
        &mut self,
        pd: PageDir,
        va: Va,
        access: Access,
    ) -> Result<Pa, MappingError> {
        let va = self.user_page(va)?;
        let table = self.ensure_table(pd, va)?;
        if self.read_pte(table, va).is_present() {
            return Err(MappingError::AlreadyMapped);
        }
        let frame = self.frames.allocate().ok_or(MappingError::NoMemory)?;
        self.mem.zero_page(frame);
        let pte = Pte::present(frame, access.flags()).ok_or(MappingError::Unaligned)?;
        self.write_pte(table, va, pte);
        Ok(frame)
    }

    /// Map the page containing `va` read-only to the zero frame.
    pub fn map_zero_frame(&mut self, pd: PageDir, va: Va) -> Result<(), MappingError> {
        let va = self.user_page(va)?;
        let table = self.ensure_table(pd, va)?;
        if self.read_pte(table, va).is_present() {
            return Err(MappingError::AlreadyMapped);
        }
        let pte = Pte::present(self.zero_frame(), Access::ReadOnly.flags())
            .ok_or(MappingError::Unaligned)?;
        self.write_pte(table, va, pte);
        Ok(())
    }

    /// Unmap the page containing `va`, freeing a private frame.
    ///
    /// The page is left available.
    pub fn unmap_frame(&mut self, pd: PageDir, va: Va) -> Result<(), MappingError> {
        let va = self.user_page(va)?;
        let table = self.read_pde(pd, va).pa().ok_or(MappingError::NotMapped)?;
        let frame = self.read_pte(table, va).pa().ok_or(MappingError::NotMapped)?;
        if frame != self.zero_frame() {
            self.frames.free(frame);
        }
        self.write_pte(table, va, Pte::absent(Availability::Available));
        Ok(())
    }

    /// Change the access rights of a mapped page.
    ///
    /// Zero-frame pages stay read-only: their first write upgrades them
    /// anyway.
    pub fn set_access(&mut self, pd: PageDir, va: Va, access: Access) -> Result<(), MappingError> {
        let va = self.user_page(va)?;
        let table = self.read_pde(pd, va).pa().ok_or(MappingError::NotMapped)?;
        let mut pte = self.read_pte(table, va);
        match pte.pa() {
            None => Err(MappingError::NotMapped),
            Some(frame) if frame == self.zero_frame() => Ok(()),
            Some(_) => {
                pte.set_flag(PteFlags::RW, access == Access::ReadWrite);
                self.write_pte(table, va, pte);
                Ok(())
            }
        }
    }

    /// Access rights of a mapped page.
    pub fn get_access(&self, pd: PageDir, va: Va) -> Result<Access, MappingError> {
        let va = self.user_page(va)?;
        match mmu::walk(&self.mem, pd.0, va).1 {
            Some(pte) if pte.is_present() => {
                if pte.flags().contains(PteFlags::RW) {
                    Ok(Access::ReadWrite)
                } else {
                    Ok(Access::ReadOnly)
                }
            }
            _ => Err(MappingError::NotMapped),
        }
    }

    /// Record whether the unmapped page containing `va` may be faulted in.
    pub fn set_availability(
        &mut self,
        pd: PageDir,
        va: Va,
        availability: Availability,
    ) -> Result<(), MappingError> {
        let va = self.user_page(va)?;
        let pde = self.read_pde(pd, va);
        if !pde.is_present() && pde.availability() == availability {
            return Ok(());
        }
        let table = self.ensure_table(pd, va)?;
        let mut pte = self.read_pte(table, va);
        if pte.is_present() {
            return Err(MappingError::AlreadyMapped);
        }
        pte.set_availability(availability);
        self.write_pte(table, va, pte);
        Ok(())
    }

    /// Whether the page containing `va` may be faulted in.
    pub fn get_availability(&self, pd: PageDir, va: Va) -> Result<Availability, MappingError> {
        self.check_user_page(pd, va).map(Mapping::availability)
    }

    /// [`set_access`] over a range.
    ///
    /// [`set_access`]: Self::set_access
    pub fn change_access(
        &mut self,
        pd: PageDir,
        addr: u32,
        len: u32,
        access: Access,
    ) -> Result<(), MappingError> {
        Self::pages(addr, len)?.try_for_each(|va| self.set_access(pd, va, access))
    }

    /// [`set_availability`] over a range.
    ///
    /// [`set_availability`]: Self::set_availability
    pub fn change_availability(
        &mut self,
        pd: PageDir,
        addr: u32,
        len: u32,
        availability: Availability,
    ) -> Result<(), MappingError> {
        // Tables first: running out of them must leave every page as it was.
        for va in Self::pages(addr, len)? {
            let pde = self.read_pde(pd, self.user_page(va)?);
            if !pde.is_present() && pde.availability() != availability {
                self.ensure_table(pd, va)?;
            }
        }
        Self::pages(addr, len)?.try_for_each(|va| self.set_availability(pd, va, availability))
    }

    /// Map every still-unmapped page of a range, to the zero frame if `zero`
    /// and to fresh read-write frames otherwise.
    pub fn map_and_clear(
        &mut self,
        pd: PageDir,
        addr: u32,
        len: u32,
        zero: bool,
    ) -> Result<(), MappingError> {
        Self::pages(addr, len)?.try_for_each(|va| match self.check_user_page(pd, va)? {
            Mapping::PdeAbsent(_) | Mapping::PteAbsent(_) if zero => self.map_zero_frame(pd, va),
            Mapping::PdeAbsent(_) | Mapping::PteAbsent(_) => {
                self.map_new_frame(pd, va, Access::ReadWrite).map(|_| ())
            }
            _ => Ok(()),
        })
    }

    /// Grant (or revoke) ring 3 access to the present tables and pages of a
    /// range.
    pub fn set_user_range(
        &mut self,
        pd: PageDir,
        addr: u32,
        len: u32,
        user: bool,
    ) -> Result<(), MappingError> {
        for va in Self::pages(addr, len)? {
            let va = self.user_page(va)?;
            let mut pde = self.read_pde(pd, va);
            let table = match pde.pa() {
                Some(table) => table,
                None => continue,
            };
            pde.set_flag(PdeFlags::US, user);
            self.write_pde(pd, va, pde);
            let mut pte = self.read_pte(table, va);
            if pte.is_present() {
                pte.set_flag(PteFlags::US, user);
                self.write_pte(table, va, pte);
            }
        }
        Ok(())
    }

    /// Bring in the page containing `va` for an access, following the
    /// zero-fill-on-demand rules.
    ///
    /// Fails with [`MappingError::NotMapped`] for an unavailable page and
    /// [`MappingError::ReadOnly`] for a write to a read-only private page.
    pub fn materialize(&mut self, pd: PageDir, va: Va, write: bool) -> Result<(), MappingError> {
        match self.check_user_page(pd, va)? {
            Mapping::PdeAbsent(Availability::Unavailable)
            | Mapping::PteAbsent(Availability::Unavailable) => Err(MappingError::NotMapped),
            Mapping::PdeAbsent(Availability::Available)
            | Mapping::PteAbsent(Availability::Available) => {
                if write {
                    self.map_new_frame(pd, va, Access::ReadWrite).map(|_| ())
                } else {
                    self.map_zero_frame(pd, va)
                }
            }
            Mapping::ZeroFrame if write => {
                self.unmap_frame(pd, va)?;
                self.map_new_frame(pd, va, Access::ReadWrite).map(|_| ())
            }
            Mapping::ZeroFrame => Ok(()),
            Mapping::Private(_) => {
                if write && self.get_access(pd, va)? == Access::ReadOnly {
                    Err(MappingError::ReadOnly)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Translate for a supervisor access, materializing the page on a miss.
    fn resolve(&mut self, pd: PageDir, va: Va, kind: AccessKind) -> Result<Pa, MappingError> {
        self.user_page(va)?;
        let translate = |mm: &Self| mmu::translate(&mm.mem, pd.0, va, kind, PrivilegeLevel::Ring0);
        match translate(self) {
            Ok(pa) => Ok(pa),
            Err(_) => {
                self.materialize(pd, va, kind == AccessKind::Write)?;
                translate(self).map_err(|_| MappingError::NotMapped)
            }
        }
    }

    fn chunks(va: u32, len: usize) -> Result<impl Iterator<Item = (Va, usize, usize)>, MappingError> {
        if va as u64 + len as u64 > VIRTUAL_ADDR_END {
            return Err(MappingError::NotUserPage);
        }
        let mut done = 0;
        Ok(core::iter::from_fn(move || {
            if done == len {
                return None;
            }
            let at = Va::new(va + done as u32);
            let n = (PAGE_SIZE - at.page_offset()).min(len - done);
            let item = (at, done, n);
            done += n;
            Some(item)
        }))
    }

    /// Copy `buf.len()` bytes at user address `va` of `pd` into `buf`.
    pub fn copy_from_user(&mut self, pd: PageDir, va: u32, buf: &mut [u8]) -> Result<(), MappingError> {
        for (at, ofs, n) in Self::chunks(va, buf.len())? {
            let pa = self.resolve(pd, at, AccessKind::Read)?;
            self.mem.read(pa, &mut buf[ofs..ofs + n]);
        }
        Ok(())
    }

    /// Copy `data` to user address `va` of `pd`.
    pub fn copy_to_user(&mut self, pd: PageDir, va: u32, data: &[u8]) -> Result<(), MappingError> {
        for (at, ofs, n) in Self::chunks(va, data.len())? {
            let pa = self.resolve(pd, at, AccessKind::Write)?;
            self.mem.write(pa, &data[ofs..ofs + n]);
        }
        Ok(())
    }

    /// Read a word of user memory.
    pub fn read_user_u32(&mut self, pd: PageDir, va: u32) -> Result<u32, MappingError> {
        let mut b = [0; 4];
        self.copy_from_user(pd, va, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Write a word of user memory.
    pub fn write_user_u32(&mut self, pd: PageDir, va: u32, v: u32) -> Result<(), MappingError> {
        self.copy_to_user(pd, va, &v.to_le_bytes())
    }

    /// Read a NUL-terminated string of at most `max` bytes.
    pub fn read_user_cstr(&mut self, pd: PageDir, va: u32, max: usize) -> Result<String, MappingError> {
        let mut out = Vec::new();
        for i in 0..max as u32 {
            let mut b = [0];
            self.copy_from_user(pd, va.checked_add(i).ok_or(MappingError::NotUserPage)?, &mut b)?;
            if b[0] == 0 {
                return String::from_utf8(out).map_err(|_| MappingError::NotMapped);
            }
            out.push(b[0]);
        }
        Err(MappingError::NotMapped)
    }

    /// Whether a user range could be accessed without failing, without
    /// materializing anything.
    pub fn check_user_range(&self, pd: PageDir, va: u32, len: u32, write: bool) -> bool {
        let pages = match Self::pages(va, len) {
            Ok(pages) => pages,
            Err(_) => return false,
        };
        for page in pages {
            let ok = match self.check_user_page(pd, page) {
                Ok(Mapping::Private(_)) => {
                    !write || self.get_access(pd, page) == Ok(Access::ReadWrite)
                }
                Ok(m) => m.availability() == Availability::Available,
                Err(_) => false,
            };
            if !ok {
                return false;
            }
        }
        true
    }

    /// Reproduce the user half of `parent` in `child`, page by page.
    ///
    /// Unmapped pages keep their availability and zero-frame pages stay on
    /// the zero frame. Private pages are copied through a kernel buffer while
    /// the child's directory is loaded. On failure `child` is left partially
    /// built; the caller destroys it.
    pub fn copy_address_space(
        &mut self,
        cpu: &Cpu,
        parent: PageDir,
        child: PageDir,
    ) -> Result<(), MappingError> {
        let buffer = self.arena.alloc(1).ok_or(MappingError::NoMemory)?;
        let result = self.copy_user_pdes(cpu, parent, child, buffer);
        self.arena.dealloc(buffer, 1);
        result
    }

    fn copy_user_pdes(
        &mut self,
        cpu: &Cpu,
        parent: PageDir,
        child: PageDir,
        buffer: Pa,
    ) -> Result<(), MappingError> {
        for i in self.kernel_pdes()..PDE_COUNT {
            let base = Va::new((i as u64 * PAGE_TABLE_SPAN) as u32);
            let pde = self.read_pde(parent, base);
            if !pde.is_present() {
                self.write_pde(child, base, Pde::absent(pde.availability()));
                continue;
            }
            self.ensure_table(child, base)?;
            for j in 0..PTE_COUNT {
                let va = base + (j * PAGE_SIZE) as u32;
                match self.check_user_page(parent, va)? {
                    Mapping::PdeAbsent(a) | Mapping::PteAbsent(a) => {
                        self.set_availability(child, va, a)?
                    }
                    Mapping::ZeroFrame => self.map_zero_frame(child, va)?,
                    Mapping::Private(frame) => {
                        let access = self.get_access(parent, va)?;
                        self.mem.copy_page(buffer, frame);
                        let saved = cpu.cr3();
                        cpu.set_cr3(child.pa());
                        let copied = self
                            .map_new_frame(child, va, access)
                            .map(|copy| self.mem.copy_page(copy, buffer));
                        cpu.set_cr3(saved);
                        copied?;
                    }
                }
            }
        }
        Ok(())
    }
}

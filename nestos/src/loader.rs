//! Executable images and the program loader.
//!
//! Executables live in an in-memory table of contents. Each entry carries
//! a pre-parsed header naming where the text, rodata, data and bss sections
//! go, and the image bytes the sections are copied from.
//!
//! An image whose text starts below the user boundary is a guest kernel: it
//! gets all of guest memory, eagerly backed, and starts in guest kernel
//! mode. Everything else is an ordinary program with zero-fill-on-demand
//! sections and a stack holding its arguments.
use crate::{
    error::KernelError,
    hv::GuestResource,
    mm::{Access, MemoryManager, PageDir},
    Kernel,
};
use alloc::{collections::BTreeMap, string::String, vec, vec::Vec};
use bedrock::{
    info, warning,
    x86::{interrupt::TrapFrame, paging::Availability, segmentation::Segment},
};

/// Top of an ordinary program's stack.
pub const USER_STACK_HIGH: u32 = 0xFFFF_F000;
/// Bytes of stack an ordinary program may touch.
pub const USER_STACK_LEN: u32 = 0x4_0000;
/// `%eax` a guest kernel starts with.
pub const GUEST_LAUNCH_EAX: u32 = crate::hv::HV_MAGIC;

/// Byte peekable object.
pub trait Peeker {
    type Error;
    /// Fill `slice` with the bytes at `pos`.
    fn peek_bytes(&self, pos: usize, slice: &mut [u8]) -> Result<(), Self::Error>;
}

/// Where a section lives in the image and in memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Section {
    /// Offset in the image bytes.
    pub offset: u32,
    /// Virtual address of the first byte.
    pub start: u32,
    /// Length in bytes.
    pub len: u32,
}

impl Section {
    fn end(&self) -> Option<u32> {
        self.start.checked_add(self.len)
    }
}

/// The parsed header of an executable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimpleElf {
    pub entry: u32,
    pub text: Section,
    pub rodata: Section,
    pub data: Section,
    /// Bss has no bytes in the image; only `start` and `len` matter.
    pub bss: Section,
}

/// An executable: header plus image bytes.
#[derive(Clone, Debug, Default)]
pub struct Executable {
    header: SimpleElf,
    bytes: Vec<u8>,
}

impl Executable {
    /// An empty executable entered at `entry`.
    pub fn new(entry: u32) -> Self {
        Self {
            header: SimpleElf {
                entry,
                ..Default::default()
            },
            bytes: Vec::new(),
        }
    }

    fn append(&mut self, start: u32, bytes: &[u8]) -> Section {
        let section = Section {
            offset: self.bytes.len() as u32,
            start,
            len: bytes.len() as u32,
        };
        self.bytes.extend_from_slice(bytes);
        section
    }

    /// Set the text section.
    pub fn text(mut self, start: u32, bytes: &[u8]) -> Self {
        self.header.text = self.append(start, bytes);
        self
    }

    /// Set the read-only data section.
    pub fn rodata(mut self, start: u32, bytes: &[u8]) -> Self {
        self.header.rodata = self.append(start, bytes);
        self
    }

    /// Set the data section.
    pub fn data(mut self, start: u32, bytes: &[u8]) -> Self {
        self.header.data = self.append(start, bytes);
        self
    }

    /// Set the bss section.
    pub fn bss(mut self, start: u32, len: u32) -> Self {
        self.header.bss = Section {
            offset: 0,
            start,
            len,
        };
        self
    }

    /// The header.
    pub fn header(&self) -> &SimpleElf {
        &self.header
    }

    /// Length of the image in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the image has no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    // The header must describe sections inside the image, and the entry
    // point must be in the text.
    fn check_header(&self) -> Result<(), KernelError> {
        let h = &self.header;
        let in_image = |s: &Section| {
            s.end().is_some() && s.offset as usize + s.len as usize <= self.bytes.len()
        };
        let entry_in_text = (h.text.start..h.text.end().unwrap_or(0)).contains(&h.entry);
        if h.text.len == 0
            || !entry_in_text
            || ![h.text, h.rodata, h.data].iter().all(in_image)
            || h.bss.end().is_none()
        {
            return Err(KernelError::BadImage);
        }
        Ok(())
    }
}

impl Peeker for Executable {
    type Error = KernelError;

    fn peek_bytes(&self, pos: usize, slice: &mut [u8]) -> Result<(), KernelError> {
        let src = pos
            .checked_add(slice.len())
            .and_then(|end| self.bytes.get(pos..end))
            .ok_or(KernelError::BadImage)?;
        slice.copy_from_slice(src);
        Ok(())
    }
}

/// The executables the kernel can run, by name.
#[derive(Default)]
pub struct ImageTable {
    images: BTreeMap<String, Executable>,
}

impl ImageTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace `name`.
    pub fn insert(&mut self, name: &str, exe: Executable) {
        self.images.insert(String::from(name), exe);
    }

    /// Look up `name`.
    pub fn get(&self, name: &str) -> Option<&Executable> {
        self.images.get(name)
    }

    /// Copy up to `buf.len()` bytes of `name` starting at `offset`.
    ///
    /// Returns how many bytes were copied: fewer than asked near the end of
    /// the image.
    pub fn getbytes(&self, name: &str, offset: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        let exe = self.get(name).ok_or(KernelError::ImageNotFound)?;
        if offset >= exe.len() {
            return Err(KernelError::InvalidArgument);
        }
        let n = buf.len().min(exe.len() - offset);
        exe.peek_bytes(offset, &mut buf[..n])?;
        Ok(n)
    }
}

impl Kernel {
    /// Build a fresh address space running executable `name` with `argv`.
    ///
    /// Returns the directory, the frame to start with and, for a guest
    /// kernel, its guest resources. Nothing is left behind on failure.
    pub(crate) fn load_executable(
        &mut self,
        name: &str,
        argv: &[&str],
    ) -> Result<(PageDir, TrapFrame, Option<GuestResource>), KernelError> {
        let header = match self.images.get(name) {
            Some(exe) => exe.check_header().map(|_| exe.header),
            None => Err(KernelError::ImageNotFound),
        };
        let header = header.map_err(|e| {
            warning!("Cannot load {}: {:?}.", name, e);
            e
        })?;

        let pd = self.mm.construct_page_dir()?;
        let guest = header.text.start < self.mm.layout.user_mem_start;
        let loaded = if guest {
            self.load_guest(pd, name, &header)
                .map(|frame| (frame, Some(GuestResource::new())))
        } else {
            self.load_program(pd, name, &header, argv)
                .map(|frame| (frame, None))
        };
        match loaded {
            Ok((frame, resource)) => {
                info!("{} is loaded.", name);
                Ok((pd, frame, resource))
            }
            Err(e) => {
                warning!("Failed to load {}: {:?}.", name, e);
                self.mm.destruct_page_dir(pd);
                Err(e)
            }
        }
    }

    // Copy the bytes of `section` to `base + section.start`.
    fn copy_section(
        &mut self,
        pd: PageDir,
        name: &str,
        section: &Section,
        base: u32,
    ) -> Result<(), KernelError> {
        if section.len == 0 {
            return Ok(());
        }
        let mut bytes = vec![0; section.len as usize];
        let n = self.images.getbytes(name, section.offset as usize, &mut bytes)?;
        if n != bytes.len() {
            return Err(KernelError::BadImage);
        }
        let va = base
            .checked_add(section.start)
            .ok_or(KernelError::BadImage)?;
        self.mm.copy_to_user(pd, va, &bytes)?;
        Ok(())
    }

    fn load_guest(
        &mut self,
        pd: PageDir,
        name: &str,
        header: &SimpleElf,
    ) -> Result<TrapFrame, KernelError> {
        let layout = self.mm.layout;
        let (base, size) = (layout.user_mem_start, layout.guest_mem_size);
        let fits = |s: &Section| s.end().map_or(false, |end| end <= size);
        if ![header.text, header.rodata, header.data, header.bss]
            .iter()
            .all(fits)
        {
            return Err(KernelError::BadImage);
        }

        // The guest kernel owns all of its memory from the start; bss is
        // already zero.
        self.mm
            .change_availability(pd, base, size, Availability::Available)?;
        self.mm.map_and_clear(pd, base, size, false)?;
        for section in [header.text, header.rodata, header.data] {
            self.copy_section(pd, name, &section, base)?;
        }

        let mut frame = TrapFrame::with_segments(
            Segment::GuestKernelCode,
            Segment::GuestKernelData,
            header.entry,
            0,
        );
        frame.ebx = (layout.guest_pages() as u32).saturating_sub(1);
        frame.ecx = size - 1;
        frame.eax = GUEST_LAUNCH_EAX;
        Ok(frame)
    }

    fn load_program(
        &mut self,
        pd: PageDir,
        name: &str,
        header: &SimpleElf,
        argv: &[&str],
    ) -> Result<TrapFrame, KernelError> {
        let loaded = [header.text, header.rodata, header.data];
        for s in loaded.iter().chain(core::iter::once(&header.bss)) {
            self.mm
                .change_availability(pd, s.start, s.len, Availability::Available)?;
        }
        for s in &loaded {
            if s.len > 0 {
                self.mm.map_and_clear(pd, s.start, s.len, false)?;
                self.copy_section(pd, name, s, 0)?;
            }
        }
        self.mm
            .change_access(pd, header.text.start, header.text.len, Access::ReadOnly)?;
        self.mm
            .change_access(pd, header.rodata.start, header.rodata.len, Access::ReadOnly)?;
        self.mm
            .change_access(pd, header.data.start, header.data.len, Access::ReadWrite)?;
        self.mm
            .map_and_clear(pd, header.bss.start, header.bss.len, true)?;

        let esp = self.build_stack(pd, argv)?;
        Ok(TrapFrame::new_user(header.entry, esp))
    }

    // Lay out `argv` and the arguments of `_main` on a new user stack:
    //
    //   stack_high -> argument strings
    //                 argv[], NULL-terminated
    //                 stack_low, stack_high, argv, argc
    //   esp        -> return address (0)
    fn build_stack(&mut self, pd: PageDir, argv: &[&str]) -> Result<u32, KernelError> {
        let stack_high = USER_STACK_HIGH;
        let stack_low = stack_high - USER_STACK_LEN;
        self.mm
            .change_availability(pd, stack_low, USER_STACK_LEN, Availability::Available)?;

        let mut stack = UserStack {
            pd,
            esp: stack_high,
            low: stack_low,
        };
        let mut pointers = Vec::with_capacity(argv.len());
        for arg in argv.iter().rev() {
            let mut bytes = Vec::from(arg.as_bytes());
            bytes.push(0);
            pointers.push(stack.push(&mut self.mm, &bytes)?);
        }
        pointers.reverse();
        // Keep the words below the strings aligned.
        let pad = (stack.esp % 4) as usize;
        stack.push(&mut self.mm, &[0; 4][..pad])?;

        let argv_ptr = if pointers.is_empty() {
            0
        } else {
            let array: Vec<u8> = pointers
                .iter()
                .chain(core::iter::once(&0))
                .flat_map(|p| p.to_le_bytes())
                .collect();
            stack.push(&mut self.mm, &array)?
        };
        for word in [stack_low, stack_high, argv_ptr, argv.len() as u32, 0] {
            stack.push(&mut self.mm, &word.to_le_bytes())?;
        }

        // The untouched rest of the stack reads as zeros.
        self.mm
            .map_and_clear(pd, stack_low, stack.esp - stack_low, true)?;
        Ok(stack.esp)
    }
}

struct UserStack {
    pd: PageDir,
    esp: u32,
    low: u32,
}

impl UserStack {
    // Push `bytes`, returning where they landed.
    fn push(&mut self, mm: &mut MemoryManager, bytes: &[u8]) -> Result<u32, KernelError> {
        let esp = self
            .esp
            .checked_sub(bytes.len() as u32)
            .filter(|&sp| sp >= self.low)
            .ok_or(KernelError::InvalidArgument)?;
        mm.copy_to_user(self.pd, esp, bytes)?;
        self.esp = esp;
        Ok(esp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello() -> Executable {
        Executable::new(0x100_0000)
            .text(0x100_0000, &[0x90; 64])
            .rodata(0x100_1000, b"hello\0")
            .data(0x100_2000, &[1, 2, 3, 4])
            .bss(0x100_3000, 0x2000)
    }

    #[test]
    fn builder_lays_out_sections() {
        let exe = hello();
        let h = exe.header();
        assert_eq!(h.text.offset, 0);
        assert_eq!(h.rodata.offset, 64);
        assert_eq!(h.data.offset, 70);
        assert_eq!(exe.len(), 74);
        assert!(exe.check_header().is_ok());
    }

    #[test]
    fn getbytes_truncates_at_end() {
        let mut table = ImageTable::new();
        table.insert("hello", hello());
        let mut buf = [0; 16];
        assert_eq!(table.getbytes("hello", 64, &mut buf), Ok(10));
        assert_eq!(&buf[..6], b"hello\0");
        assert_eq!(
            table.getbytes("hello", 74, &mut buf),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            table.getbytes("nope", 0, &mut buf),
            Err(KernelError::ImageNotFound)
        );
    }

    #[test]
    fn entry_outside_text_is_rejected() {
        let exe = Executable::new(0x200_0000).text(0x100_0000, &[0x90; 16]);
        assert_eq!(exe.check_header(), Err(KernelError::BadImage));
        assert_eq!(
            Executable::new(0).check_header(),
            Err(KernelError::BadImage)
        );
    }
}

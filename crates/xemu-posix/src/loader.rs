//! Static ELF64 loader.
//!
//! Maps the PT_LOAD segments of an x86-64 executable into an empty address
//! space and builds the System V initial stack (argc, argv, envp, auxv) the
//! way the Linux kernel lays it out for a static binary.

use goblin::elf::header::{EM_X86_64, ET_DYN, ET_EXEC};
use goblin::elf::program_header::{ProgramHeader, PT_INTERP, PT_LOAD, PT_PHDR};
use goblin::elf::Elf;
use std::sync::Arc;
use thiserror::Error;
use xemu_cpu_core::{gpr, RegisterFile};
use xemu_mem::{
    page_ceil, page_floor, AddressSpace, Backing, MemoryFault, Permissions, VmmError, PAGE_SIZE,
};

/// Where a position-independent static executable is placed.
pub const PIE_LOAD_BIAS: u64 = 0x5555_5555_4000;
pub const DEFAULT_STACK_TOP: u64 = 0x7fff_ffff_f000;
pub const DEFAULT_STACK_SIZE: u64 = 8 << 20;
/// AT_RANDOM bytes unless the caller supplies its own; fixed so runs replay.
pub const DEFAULT_AT_RANDOM: [u8; 16] = *b"xemu:at_random\0\0";

const AT_NULL: u64 = 0;
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_PAGESZ: u64 = 6;
const AT_BASE: u64 = 7;
const AT_FLAGS: u64 = 8;
const AT_ENTRY: u64 = 9;
const AT_UID: u64 = 11;
const AT_EUID: u64 = 12;
const AT_GID: u64 = 13;
const AT_EGID: u64 = 14;
const AT_PLATFORM: u64 = 15;
const AT_HWCAP: u64 = 16;
const AT_CLKTCK: u64 = 17;
const AT_SECURE: u64 = 23;
const AT_RANDOM: u64 = 25;
const AT_EXECFN: u64 = 31;

/// CPUID.1:EDX as reported by the execution core (TSC, CX8, CMOV).
const HWCAP: u64 = (1 << 4) | (1 << 8) | (1 << 15);

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("elf parse error: {0}")]
    Parse(#[from] goblin::error::Error),
    #[error("not a 64-bit little-endian ELF image")]
    NotElf64,
    #[error("unsupported machine {0:#x}; only x86-64 images can run")]
    UnsupportedMachine(u16),
    #[error("unsupported ELF type {0}")]
    UnsupportedType(u16),
    #[error("dynamically linked executable (interpreter {interpreter})")]
    DynamicExecutable { interpreter: String },
    #[error("image has no loadable segments")]
    NoLoadableSegments,
    #[error("malformed segment at {vaddr:#x}: {reason}")]
    MalformedSegment { vaddr: u64, reason: &'static str },
    #[error("initial stack does not fit in {size:#x} bytes")]
    StackTooSmall { size: u64 },
    #[error(transparent)]
    Map(#[from] VmmError),
    #[error(transparent)]
    Memory(#[from] MemoryFault),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    pub argv: Vec<String>,
    pub envp: Vec<String>,
    /// Value of AT_EXECFN; `argv[0]` when unset.
    pub execfn: Option<String>,
    pub stack_top: u64,
    pub stack_size: u64,
    pub random: [u8; 16],
    pub uid: u32,
    pub gid: u32,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            argv: vec!["a.out".to_owned()],
            envp: Vec::new(),
            execfn: None,
            stack_top: DEFAULT_STACK_TOP,
            stack_size: DEFAULT_STACK_SIZE,
            random: DEFAULT_AT_RANDOM,
            uid: 1000,
            gid: 1000,
        }
    }
}

/// Result of loading an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: u64,
    /// Initial RSP, pointing at argc.
    pub stack_pointer: u64,
    /// Initial program break (page aligned, just past the highest segment).
    pub brk: u64,
    /// Guest address of the program headers (AT_PHDR).
    pub phdr: u64,
    pub load_bias: u64,
}

impl LoadedImage {
    /// Register file for the main thread: RIP at the entry point, RSP at argc,
    /// RDX zero (no `atexit` handler from a dynamic loader).
    pub fn initial_registers(&self) -> RegisterFile {
        let mut regs = RegisterFile::new(self.entry, self.stack_pointer);
        regs.gpr[gpr::RDX] = 0;
        regs
    }
}

/// Load `image` into `space`, which should not have anything mapped where the
/// image or stack go.
pub fn load_elf(space: &AddressSpace, image: &[u8], opts: &LoadOptions) -> Result<LoadedImage, LoadError> {
    let elf = Elf::parse(image)?;
    if !elf.is_64 || !elf.little_endian {
        return Err(LoadError::NotElf64);
    }
    if elf.header.e_machine != EM_X86_64 {
        return Err(LoadError::UnsupportedMachine(elf.header.e_machine));
    }
    if let Some(ph) = elf.program_headers.iter().find(|ph| ph.p_type == PT_INTERP) {
        let interpreter = elf
            .interpreter
            .map(str::to_owned)
            .unwrap_or_else(|| format!("at file offset {:#x}", ph.p_offset));
        return Err(LoadError::DynamicExecutable { interpreter });
    }
    let load_bias = match elf.header.e_type {
        ET_EXEC => 0,
        ET_DYN => PIE_LOAD_BIAS,
        other => return Err(LoadError::UnsupportedType(other)),
    };

    let loads: Vec<&ProgramHeader> = elf
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD && ph.p_memsz > 0)
        .collect();
    if loads.is_empty() {
        return Err(LoadError::NoLoadableSegments);
    }

    let execfn = opts
        .execfn
        .clone()
        .or_else(|| opts.argv.first().cloned())
        .unwrap_or_default();
    let name: Arc<str> = Arc::from(execfn.as_str());

    let mut image_end = 0u64;
    for ph in &loads {
        let end = map_segment(space, &name, image, ph, load_bias)?;
        image_end = image_end.max(end);
    }
    let brk = page_ceil(image_end).ok_or(LoadError::MalformedSegment {
        vaddr: image_end,
        reason: "image ends past the address space",
    })?;

    let phdr = phdr_address(&elf, &loads).map_or(0, |addr| addr.wrapping_add(load_bias));
    let entry = elf.entry.wrapping_add(load_bias);

    let auxv = [
        (AT_PHDR, phdr),
        (AT_PHENT, elf.header.e_phentsize as u64),
        (AT_PHNUM, elf.header.e_phnum as u64),
        (AT_PAGESZ, PAGE_SIZE),
        (AT_BASE, 0),
        (AT_FLAGS, 0),
        (AT_ENTRY, entry),
        (AT_UID, opts.uid as u64),
        (AT_EUID, opts.uid as u64),
        (AT_GID, opts.gid as u64),
        (AT_EGID, opts.gid as u64),
        (AT_HWCAP, HWCAP),
        (AT_CLKTCK, 100),
        (AT_SECURE, 0),
    ];
    let stack_pointer = build_stack(space, opts, &execfn, &auxv)?;

    tracing::debug!(
        entry = format_args!("{entry:#x}"),
        brk = format_args!("{brk:#x}"),
        sp = format_args!("{stack_pointer:#x}"),
        segments = loads.len(),
        "loaded ELF image"
    );

    Ok(LoadedImage {
        entry,
        stack_pointer,
        brk,
        phdr,
        load_bias,
    })
}

/// Map one PT_LOAD segment; returns its end address.
fn map_segment(
    space: &AddressSpace,
    name: &Arc<str>,
    image: &[u8],
    ph: &ProgramHeader,
    bias: u64,
) -> Result<u64, LoadError> {
    let malformed = |reason| LoadError::MalformedSegment {
        vaddr: ph.p_vaddr,
        reason,
    };
    if ph.p_filesz > ph.p_memsz {
        return Err(malformed("file size exceeds memory size"));
    }
    let vaddr = ph
        .p_vaddr
        .checked_add(bias)
        .ok_or_else(|| malformed("address overflows"))?;
    let end = vaddr
        .checked_add(ph.p_memsz)
        .ok_or_else(|| malformed("size overflows"))?;
    let file_start = usize::try_from(ph.p_offset).map_err(|_| malformed("offset out of range"))?;
    let file_end = ph
        .p_offset
        .checked_add(ph.p_filesz)
        .and_then(|e| usize::try_from(e).ok())
        .filter(|&e| e <= image.len())
        .ok_or_else(|| malformed("file data past end of image"))?;

    let start = page_floor(vaddr);
    let map_end = page_ceil(end).ok_or_else(|| malformed("segment ends past the address space"))?;
    let perms = Permissions::from_elf_flags(ph.p_flags);

    // The page holding `vaddr` also carries the file bytes that precede it,
    // the way a file mapping would (this is what puts the ELF header and
    // program headers in memory for AT_PHDR).
    let lead = (vaddr - start) as usize;
    let mut bytes = Vec::with_capacity(lead + (file_end - file_start));
    match file_start.checked_sub(lead) {
        Some(from) => bytes.extend_from_slice(&image[from..file_start]),
        None => bytes.resize(lead, 0),
    }
    bytes.extend_from_slice(&image[file_start..file_end]);

    let backing = Backing::File {
        name: name.clone(),
        data: bytes.into(),
        offset: 0,
    };
    match space.map(start, map_end - start, perms, backing) {
        Ok(_) => {}
        Err(VmmError::Overlap { .. }) => {
            // Shares a page with an earlier segment: fill the holes, let this
            // segment's permissions win on the shared pages as the kernel's
            // later mmap would, then copy just this segment.
            overlay_pages(space, start, map_end, perms)?;
            space.write_unchecked(vaddr, &image[file_start..file_end])?;
        }
        Err(err) => return Err(err.into()),
    }
    tracing::debug!(
        start = format_args!("{start:#x}"),
        end = format_args!("{map_end:#x}"),
        %perms,
        "mapped segment"
    );
    Ok(end)
}

fn overlay_pages(space: &AddressSpace, start: u64, end: u64, perms: Permissions) -> Result<(), LoadError> {
    let mut page = start;
    while page < end {
        if space.page(page).is_some() {
            space.protect(page, PAGE_SIZE, perms)?;
            page += PAGE_SIZE;
            continue;
        }
        let mut run_end = page + PAGE_SIZE;
        while run_end < end && space.page(run_end).is_none() {
            run_end += PAGE_SIZE;
        }
        space.map(page, run_end - page, perms, Backing::Anonymous)?;
        page = run_end;
    }
    Ok(())
}

/// Unbiased address of the program header table.
fn phdr_address(elf: &Elf<'_>, loads: &[&ProgramHeader]) -> Option<u64> {
    if let Some(ph) = elf.program_headers.iter().find(|ph| ph.p_type == PT_PHDR) {
        return Some(ph.p_vaddr);
    }
    let phoff = elf.header.e_phoff;
    loads
        .iter()
        .find(|ph| ph.p_offset <= phoff && phoff < ph.p_offset + ph.p_filesz)
        .map(|ph| ph.p_vaddr + (phoff - ph.p_offset))
}

struct StackWriter<'a> {
    space: &'a AddressSpace,
    sp: u64,
    floor: u64,
    size: u64,
}

impl StackWriter<'_> {
    fn reserve(&mut self, len: u64) -> Result<u64, LoadError> {
        match self.sp.checked_sub(len) {
            Some(sp) if sp >= self.floor => {
                self.sp = sp;
                Ok(sp)
            }
            _ => Err(LoadError::StackTooSmall { size: self.size }),
        }
    }

    fn push_bytes(&mut self, bytes: &[u8]) -> Result<u64, LoadError> {
        let addr = self.reserve(bytes.len() as u64)?;
        self.space.write_unchecked(addr, bytes)?;
        Ok(addr)
    }

    fn push_cstr(&mut self, s: &str) -> Result<u64, LoadError> {
        let addr = self.reserve(s.len() as u64 + 1)?;
        self.space.write_unchecked(addr, s.as_bytes())?;
        self.space.write_unchecked(addr + s.len() as u64, &[0])?;
        Ok(addr)
    }
}

/// Map the stack and lay out, from the top down: strings, AT_RANDOM bytes,
/// then the 16-byte aligned argc/argv/envp/auxv block. Returns the new RSP.
fn build_stack(
    space: &AddressSpace,
    opts: &LoadOptions,
    execfn: &str,
    auxv: &[(u64, u64)],
) -> Result<u64, LoadError> {
    let top = page_floor(opts.stack_top);
    let size = page_ceil(opts.stack_size)
        .filter(|&s| s != 0 && s <= top)
        .ok_or(LoadError::StackTooSmall {
            size: opts.stack_size,
        })?;
    space.map(
        top - size,
        size,
        Permissions::RW,
        Backing::Anonymous,
    )?;

    let mut w = StackWriter {
        space,
        sp: top,
        floor: top - size,
        size,
    };
    let execfn_ptr = w.push_cstr(execfn)?;
    let mut envp = Vec::with_capacity(opts.envp.len());
    for var in opts.envp.iter().rev() {
        envp.push(w.push_cstr(var)?);
    }
    envp.reverse();
    let mut argv = Vec::with_capacity(opts.argv.len());
    for arg in opts.argv.iter().rev() {
        argv.push(w.push_cstr(arg)?);
    }
    argv.reverse();
    let platform = w.push_cstr("x86_64")?;
    let random = w.push_bytes(&opts.random)?;

    let mut words: Vec<u64> = Vec::with_capacity(3 + argv.len() + envp.len() + 2 * (auxv.len() + 4));
    words.push(argv.len() as u64);
    words.extend_from_slice(&argv);
    words.push(0);
    words.extend_from_slice(&envp);
    words.push(0);
    for &(key, value) in auxv {
        words.extend_from_slice(&[key, value]);
    }
    words.extend_from_slice(&[AT_PLATFORM, platform, AT_RANDOM, random, AT_EXECFN, execfn_ptr]);
    words.extend_from_slice(&[AT_NULL, 0]);

    let block = words.len() as u64 * 8;
    w.reserve(block)?;
    w.sp &= !15;
    if w.sp < w.floor {
        return Err(LoadError::StackTooSmall { size });
    }
    let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    space.write_unchecked(w.sp, &bytes)?;
    Ok(w.sp)
}

use crate::error::{MemoryFault, VmmError};
use crate::frame::{zero_page, PageFrame, SharedMemory, PAGE_BYTES};
use crate::perm::{Access, Permissions};
use crate::scalar::LeScalar;
use crate::{page_ceil, page_floor, PAGE_SIZE};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Layout knobs for an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmmConfig {
    /// Lowest address handed out by [`AddressSpace::map_anywhere`].
    pub mmap_base: u64,
    /// Exclusive upper bound for [`AddressSpace::map_anywhere`].
    pub mmap_end: u64,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            mmap_base: 0x0000_7000_0000_0000,
            mmap_end: 0x0000_7ff0_0000_0000,
        }
    }
}

/// How a new mapping is populated.
#[derive(Debug, Clone)]
pub enum Backing {
    /// Zero-filled private memory.
    Anonymous,
    /// Private copy of `data[offset..]`; bytes past the end of `data` read as zero.
    File {
        name: Arc<str>,
        data: Arc<[u8]>,
        offset: u64,
    },
    /// Frames shared with every other mapping of the same [`SharedMemory`].
    Shared(SharedMemory),
}

impl Backing {
    pub fn kind(&self) -> BackingKind {
        match self {
            Backing::Anonymous => BackingKind::Anonymous,
            Backing::File { .. } => BackingKind::File,
            Backing::Shared(_) => BackingKind::Shared,
        }
    }

    fn name(&self) -> Option<Arc<str>> {
        match self {
            Backing::File { name, .. } => Some(name.clone()),
            _ => None,
        }
    }

    fn frames(&self, start: u64, len: u64) -> Result<Vec<Arc<PageFrame>>, VmmError> {
        let pages = (len / PAGE_SIZE) as usize;
        match self {
            Backing::Anonymous => Ok((0..pages).map(|_| PageFrame::zeroed()).collect()),
            Backing::File { data, offset, .. } => Ok((0..pages)
                .map(|i| {
                    let lo = offset
                        .saturating_add(i as u64 * PAGE_SIZE)
                        .min(data.len() as u64) as usize;
                    let hi = (lo + PAGE_BYTES).min(data.len());
                    PageFrame::with_contents(&data[lo..hi])
                })
                .collect()),
            Backing::Shared(shm) => {
                if len > shm.len() {
                    return Err(VmmError::InvalidLength { start, len });
                }
                (0..pages)
                    .map(|i| {
                        shm.frame(i)
                            .cloned()
                            .ok_or(VmmError::InvalidLength { start, len })
                    })
                    .collect()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackingKind {
    Anonymous,
    File,
    Shared,
}

/// Contiguous run of pages with identical attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub start: u64,
    pub end: u64,
    pub perms: Permissions,
    pub kind: BackingKind,
    pub name: Option<Arc<str>>,
}

impl Region {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, addr: u64) -> bool {
        (self.start..self.end).contains(&addr)
    }
}

/// Snapshot of one page's attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub base: u64,
    pub perms: Permissions,
    pub kind: BackingKind,
    pub version: u64,
}

/// Identity of the code bytes an instruction was decoded from.
///
/// Two stamps compare equal only if the same frames back the range, neither
/// frame has been written in between, and the range is still executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeStamp {
    first: FrameStamp,
    second: Option<FrameStamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FrameStamp {
    frame: u64,
    version: u64,
}

impl CodeStamp {
    /// Narrow a fetch-window stamp to the pages `[addr, addr + len)` touches.
    pub fn restrict(self, addr: u64, len: usize) -> Self {
        let crosses = (addr - page_floor(addr)) + len as u64 > PAGE_SIZE;
        Self {
            first: self.first,
            second: if crosses { self.second } else { None },
        }
    }
}

/// Result of [`AddressSpace::fetch_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchedCode {
    /// Number of executable bytes copied into the window.
    pub len: usize,
    pub stamp: CodeStamp,
}

#[derive(Debug, Clone)]
struct PageEntry {
    perms: Permissions,
    kind: BackingKind,
    name: Option<Arc<str>>,
    frame: Arc<PageFrame>,
}

type PageTable = BTreeMap<u64, PageEntry>;

/// A guest process's virtual address space.
///
/// Shared between guest threads behind an `Arc`; all methods take `&self`.
#[derive(Debug, Default)]
pub struct AddressSpace {
    cfg: VmmConfig,
    table: RwLock<PageTable>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(cfg: VmmConfig) -> Self {
        Self {
            cfg,
            table: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &VmmConfig {
        &self.cfg
    }

    fn table(&self) -> RwLockReadGuard<'_, PageTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn table_mut(&self) -> RwLockWriteGuard<'_, PageTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- structure ---------------------------------------------------------

    /// Map `[start, start + len)` (length rounded up to whole pages).
    ///
    /// Fails with [`VmmError::Overlap`] if any page in the range is already
    /// mapped; the existing mapping is left untouched.
    pub fn map(
        &self,
        start: u64,
        len: u64,
        perms: Permissions,
        backing: Backing,
    ) -> Result<Region, VmmError> {
        let end = page_range(start, len)?;
        let mut table = self.table_mut();
        if let Some((&existing, _)) = table.range(start..end).next() {
            return Err(VmmError::Overlap {
                start,
                end,
                existing,
            });
        }
        self.insert_pages(&mut table, start, end, perms, &backing)
    }

    /// Map `len` bytes at the lowest free address inside the mmap window.
    pub fn map_anywhere(
        &self,
        len: u64,
        perms: Permissions,
        backing: Backing,
    ) -> Result<Region, VmmError> {
        let rounded = page_ceil(len)
            .filter(|&l| l != 0)
            .ok_or(VmmError::InvalidLength { start: 0, len })?;
        let mut table = self.table_mut();
        let start = first_fit(&table, self.cfg.mmap_base, self.cfg.mmap_end, rounded)
            .ok_or(VmmError::OutOfAddressSpace { len: rounded })?;
        self.insert_pages(&mut table, start, start + rounded, perms, &backing)
    }

    fn insert_pages(
        &self,
        table: &mut PageTable,
        start: u64,
        end: u64,
        perms: Permissions,
        backing: &Backing,
    ) -> Result<Region, VmmError> {
        let frames = backing.frames(start, end - start)?;
        let kind = backing.kind();
        let name = backing.name();
        for (i, frame) in frames.into_iter().enumerate() {
            let base = start + i as u64 * PAGE_SIZE;
            let prev = table.insert(
                base,
                PageEntry {
                    perms,
                    kind,
                    name: name.clone(),
                    frame,
                },
            );
            if prev.is_some() {
                tracing::error!(base, "page table invariant broken: page mapped twice");
                debug_assert!(prev.is_none(), "page {base:#x} mapped twice");
            }
        }
        tracing::debug!(start, end, %perms, ?kind, "map");
        Ok(Region {
            start,
            end,
            perms,
            kind,
            name,
        })
    }

    /// Remove every page of `[start, start + len)`.
    ///
    /// The whole range must be mapped, otherwise nothing is removed and
    /// [`VmmError::NotMapped`] names the first hole.
    pub fn unmap(&self, start: u64, len: u64) -> Result<(), VmmError> {
        let end = page_range(start, len)?;
        let mut table = self.table_mut();
        if let Some(hole) = first_hole(&table, start, end) {
            return Err(VmmError::NotMapped { start, end, hole });
        }
        remove_pages(&mut table, start, end);
        tracing::debug!(start, end, "unmap");
        Ok(())
    }

    /// Remove whatever pages exist in `[start, start + len)`; holes are fine.
    /// Returns the number of pages removed.
    pub fn discard(&self, start: u64, len: u64) -> Result<usize, VmmError> {
        let end = page_range(start, len)?;
        let mut table = self.table_mut();
        let removed = remove_pages(&mut table, start, end);
        tracing::debug!(start, end, removed, "discard");
        Ok(removed)
    }

    /// Change the permissions of every page in `[start, start + len)`.
    pub fn protect(&self, start: u64, len: u64, perms: Permissions) -> Result<(), VmmError> {
        let end = page_range(start, len)?;
        let mut table = self.table_mut();
        if let Some(hole) = first_hole(&table, start, end) {
            return Err(VmmError::NotMapped { start, end, hole });
        }
        for (_, entry) in table.range_mut(start..end) {
            entry.perms = perms;
        }
        tracing::debug!(start, end, %perms, "protect");
        Ok(())
    }

    /// Whether `[start, start + len)` contains no mapped page.
    pub fn is_free(&self, start: u64, len: u64) -> bool {
        match page_range(start, len) {
            Ok(end) => self.table().range(start..end).next().is_none(),
            Err(_) => false,
        }
    }

    pub fn page(&self, addr: u64) -> Option<PageInfo> {
        let base = page_floor(addr);
        self.table().get(&base).map(|entry| PageInfo {
            base,
            perms: entry.perms,
            kind: entry.kind,
            version: entry.frame.version(),
        })
    }

    /// Mapped regions in address order, adjacent pages with equal attributes merged.
    pub fn regions(&self) -> Vec<Region> {
        let table = self.table();
        let mut out: Vec<Region> = Vec::new();
        for (&base, entry) in table.iter() {
            if let Some(last) = out.last_mut() {
                if last.end == base
                    && last.perms == entry.perms
                    && last.kind == entry.kind
                    && last.name == entry.name
                {
                    last.end = base + PAGE_SIZE;
                    continue;
                }
            }
            out.push(Region {
                start: base,
                end: base + PAGE_SIZE,
                perms: entry.perms,
                kind: entry.kind,
                name: entry.name.clone(),
            });
        }
        out
    }

    // ---- data --------------------------------------------------------------

    /// Fail unless every byte of `[addr, addr + len)` permits `access`.
    pub fn check_range(&self, addr: u64, len: u64, access: Access) -> Result<(), MemoryFault> {
        check_access(&self.table(), addr, len, access)
    }

    pub fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryFault> {
        if dst.is_empty() {
            return Ok(());
        }
        let table = self.table();
        check_access(&table, addr, dst.len() as u64, Access::Read)?;
        for (page, offset, lo, hi) in chunks(addr, dst.len()) {
            let entry = lookup(&table, page, Access::Read)?;
            entry.frame.read_into(offset, &mut dst[lo..hi]);
        }
        Ok(())
    }

    /// Store `src` at `addr`.
    ///
    /// Permissions for the whole range are checked before any byte changes, so
    /// a faulting store has no effect. Each touched frame's version is bumped
    /// before its lock is released, which is what invalidates memoized decodes
    /// of the overwritten bytes on every thread.
    pub fn write(&self, addr: u64, src: &[u8]) -> Result<(), MemoryFault> {
        if src.is_empty() {
            return Ok(());
        }
        let table = self.table();
        check_access(&table, addr, src.len() as u64, Access::Write)?;
        for (page, offset, lo, hi) in chunks(addr, src.len()) {
            let entry = lookup(&table, page, Access::Write)?;
            entry.frame.write_from(offset, &src[lo..hi]);
        }
        Ok(())
    }

    /// Store bytes regardless of page permissions (image loading, `/proc`-style
    /// pokes). Still requires the range to be mapped.
    pub fn write_unchecked(&self, addr: u64, src: &[u8]) -> Result<(), MemoryFault> {
        if src.is_empty() {
            return Ok(());
        }
        let table = self.table();
        check_mapped(&table, addr, src.len() as u64, Access::Write)?;
        for (page, offset, lo, hi) in chunks(addr, src.len()) {
            let entry = table
                .get(&page)
                .ok_or(MemoryFault::Unmapped {
                    addr: page,
                    access: Access::Write,
                })?;
            entry.frame.write_from(offset, &src[lo..hi]);
        }
        Ok(())
    }

    pub fn read_scalar<T: LeScalar>(&self, addr: u64) -> Result<T, MemoryFault> {
        let mut buf = [0u8; 16];
        self.read(addr, &mut buf[..T::SIZE])?;
        Ok(T::from_le_slice(&buf))
    }

    pub fn write_scalar<T: LeScalar>(&self, addr: u64, value: T) -> Result<(), MemoryFault> {
        let mut buf = [0u8; 16];
        value.write_le(&mut buf);
        self.write(addr, &buf[..T::SIZE])
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8, MemoryFault> {
        self.read_scalar(addr)
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16, MemoryFault> {
        self.read_scalar(addr)
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryFault> {
        self.read_scalar(addr)
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, MemoryFault> {
        self.read_scalar(addr)
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<(), MemoryFault> {
        self.write_scalar(addr, value)
    }

    pub fn write_u16(&self, addr: u64, value: u16) -> Result<(), MemoryFault> {
        self.write_scalar(addr, value)
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), MemoryFault> {
        self.write_scalar(addr, value)
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryFault> {
        self.write_scalar(addr, value)
    }

    /// Read a NUL-terminated string of at most `max` bytes.
    pub fn read_cstr(&self, addr: u64, max: usize) -> Result<Vec<u8>, MemoryFault> {
        let mut out = Vec::new();
        let mut cur = addr;
        while out.len() < max {
            let b = self.read_u8(cur)?;
            if b == 0 {
                break;
            }
            out.push(b);
            cur = cur.wrapping_add(1);
        }
        Ok(out)
    }

    /// Atomically replace the `T` at `addr` with `f(old).0`, returning `f(old).1`.
    ///
    /// Requires read and write permission. Every frame the operand touches is
    /// write-locked (in frame-id order) for the duration of `f`, so no other
    /// access to those bytes can interleave. The frame version only moves when
    /// the stored value actually changes.
    pub fn atomic_rmw<T: LeScalar, R>(
        &self,
        addr: u64,
        f: impl FnOnce(T) -> (T, R),
    ) -> Result<R, MemoryFault> {
        let table = self.table();
        check_access(&table, addr, T::SIZE as u64, Access::Read)?;
        check_access(&table, addr, T::SIZE as u64, Access::Write)?;

        let page = page_floor(addr);
        let offset = (addr - page) as usize;
        let first = &lookup(&table, page, Access::Write)?.frame;
        let head = (PAGE_BYTES - offset).min(T::SIZE);
        let mut buf = [0u8; 16];

        if head == T::SIZE {
            let mut guard = first.lock_write();
            let bytes = guard.get_or_insert_with(zero_page);
            let cell = &mut bytes[offset..offset + T::SIZE];
            let old = T::from_le_slice(cell);
            let (new, ret) = f(old);
            if new != old {
                new.write_le(cell);
                first.bump_version();
            }
            return Ok(ret);
        }

        // Split across two pages.
        let second = &lookup(&table, page.wrapping_add(PAGE_SIZE), Access::Write)?.frame;
        let tail = T::SIZE - head;

        if Arc::ptr_eq(first, second) {
            let mut guard = first.lock_write();
            let bytes = guard.get_or_insert_with(zero_page);
            buf[..head].copy_from_slice(&bytes[offset..]);
            buf[head..T::SIZE].copy_from_slice(&bytes[..tail]);
            let old = T::from_le_slice(&buf);
            let (new, ret) = f(old);
            if new != old {
                new.write_le(&mut buf);
                bytes[offset..].copy_from_slice(&buf[..head]);
                bytes[..tail].copy_from_slice(&buf[head..T::SIZE]);
                first.bump_version();
            }
            return Ok(ret);
        }

        let mut lo_guard;
        let mut hi_guard;
        if first.id() < second.id() {
            lo_guard = first.lock_write();
            hi_guard = second.lock_write();
        } else {
            hi_guard = second.lock_write();
            lo_guard = first.lock_write();
        }
        let lo_bytes = lo_guard.get_or_insert_with(zero_page);
        let hi_bytes = hi_guard.get_or_insert_with(zero_page);
        buf[..head].copy_from_slice(&lo_bytes[offset..]);
        buf[head..T::SIZE].copy_from_slice(&hi_bytes[..tail]);
        let old = T::from_le_slice(&buf);
        let (new, ret) = f(old);
        if new != old {
            new.write_le(&mut buf);
            lo_bytes[offset..].copy_from_slice(&buf[..head]);
            hi_bytes[..tail].copy_from_slice(&buf[head..T::SIZE]);
            first.bump_version();
            second.bump_version();
        }
        Ok(ret)
    }

    /// [`Self::atomic_rmw`] that additionally requires `addr` to be a multiple
    /// of `align`.
    pub fn atomic_rmw_aligned<T: LeScalar, R>(
        &self,
        addr: u64,
        align: u64,
        f: impl FnOnce(T) -> (T, R),
    ) -> Result<R, MemoryFault> {
        if align > 1 && addr % align != 0 {
            return Err(MemoryFault::Misaligned { addr, align });
        }
        self.atomic_rmw(addr, f)
    }

    // ---- code --------------------------------------------------------------

    /// Copy up to `window.len()` executable bytes starting at `addr`.
    ///
    /// Stops early at the first byte that is unmapped or not executable; fails
    /// only if `addr` itself cannot be fetched. The returned stamp is sampled
    /// under the same frame locks as the bytes.
    pub fn fetch_code(&self, addr: u64, window: &mut [u8]) -> Result<FetchedCode, MemoryFault> {
        let table = self.table();
        let page = page_floor(addr);
        let offset = (addr - page) as usize;
        let entry = lookup_at(&table, page, addr, Access::Execute)?;

        let head = (PAGE_BYTES - offset).min(window.len());
        let version = entry.frame.read_into(offset, &mut window[..head]);
        let first = FrameStamp {
            frame: entry.frame.id(),
            version,
        };
        if head == window.len() {
            return Ok(FetchedCode {
                len: head,
                stamp: CodeStamp {
                    first,
                    second: None,
                },
            });
        }

        let next = match page.checked_add(PAGE_SIZE) {
            Some(next) => next,
            None => {
                return Ok(FetchedCode {
                    len: head,
                    stamp: CodeStamp {
                        first,
                        second: None,
                    },
                })
            }
        };
        match table.get(&next) {
            Some(entry) if entry.perms.contains(Permissions::EXEC) => {
                let version = entry.frame.read_into(0, &mut window[head..]);
                Ok(FetchedCode {
                    len: window.len(),
                    stamp: CodeStamp {
                        first,
                        second: Some(FrameStamp {
                            frame: entry.frame.id(),
                            version,
                        }),
                    },
                })
            }
            _ => Ok(FetchedCode {
                len: head,
                stamp: CodeStamp {
                    first,
                    second: None,
                },
            }),
        }
    }

    /// Current stamp for the executable bytes `[addr, addr + len)`.
    ///
    /// `len` must not exceed one page.
    pub fn code_stamp(&self, addr: u64, len: usize) -> Result<CodeStamp, MemoryFault> {
        let table = self.table();
        let page = page_floor(addr);
        let entry = lookup_at(&table, page, addr, Access::Execute)?;
        let first = FrameStamp {
            frame: entry.frame.id(),
            version: entry.frame.version(),
        };
        let crosses = (addr - page) + len as u64 > PAGE_SIZE;
        let second = if crosses {
            let next = page.wrapping_add(PAGE_SIZE);
            let entry = lookup(&table, next, Access::Execute)?;
            Some(FrameStamp {
                frame: entry.frame.id(),
                version: entry.frame.version(),
            })
        } else {
            None
        };
        Ok(CodeStamp { first, second })
    }
}

/// Validate a page-aligned range and return its (rounded) end.
fn page_range(start: u64, len: u64) -> Result<u64, VmmError> {
    if start % PAGE_SIZE != 0 {
        return Err(VmmError::Unaligned { addr: start });
    }
    let rounded = page_ceil(len)
        .filter(|&l| l != 0)
        .ok_or(VmmError::InvalidLength { start, len })?;
    start
        .checked_add(rounded)
        .ok_or(VmmError::InvalidLength { start, len })
}

fn first_hole(table: &PageTable, start: u64, end: u64) -> Option<u64> {
    let mut expect = start;
    for (&base, _) in table.range(start..end) {
        if base != expect {
            return Some(expect);
        }
        expect += PAGE_SIZE;
    }
    (expect < end).then_some(expect)
}

fn remove_pages(table: &mut PageTable, start: u64, end: u64) -> usize {
    let doomed: Vec<u64> = table.range(start..end).map(|(&base, _)| base).collect();
    for base in &doomed {
        table.remove(base);
    }
    doomed.len()
}

/// Lowest page-aligned `addr` in `[lo, hi)` with `[addr, addr + len)` free.
fn first_fit(table: &PageTable, lo: u64, hi: u64, len: u64) -> Option<u64> {
    let mut cursor = page_ceil(lo)?;
    if cursor >= hi {
        return None;
    }
    for (&base, _) in table.range(cursor..hi) {
        if base >= cursor.checked_add(len)? {
            break;
        }
        cursor = cursor.max(base + PAGE_SIZE);
    }
    let end = cursor.checked_add(len)?;
    (end <= hi).then_some(cursor)
}

fn lookup(table: &PageTable, page: u64, access: Access) -> Result<&PageEntry, MemoryFault> {
    lookup_at(table, page, page, access)
}

/// Like [`lookup`], reporting `fault_addr` (somewhere inside `page`) on failure.
fn lookup_at(
    table: &PageTable,
    page: u64,
    fault_addr: u64,
    access: Access,
) -> Result<&PageEntry, MemoryFault> {
    let entry = table.get(&page).ok_or(MemoryFault::Unmapped {
        addr: fault_addr,
        access,
    })?;
    if !entry.perms.contains(access.required()) {
        return Err(MemoryFault::PermissionDenied {
            addr: fault_addr,
            access,
        });
    }
    Ok(entry)
}

fn check_access(table: &PageTable, addr: u64, len: u64, access: Access) -> Result<(), MemoryFault> {
    walk_range(table, addr, len, access, true)
}

fn check_mapped(table: &PageTable, addr: u64, len: u64, access: Access) -> Result<(), MemoryFault> {
    walk_range(table, addr, len, access, false)
}

fn walk_range(
    table: &PageTable,
    addr: u64,
    len: u64,
    access: Access,
    enforce_perms: bool,
) -> Result<(), MemoryFault> {
    if len == 0 {
        return Ok(());
    }
    let last = addr
        .checked_add(len - 1)
        .ok_or(MemoryFault::Unmapped { addr, access })?;
    let last_page = page_floor(last);
    let mut page = page_floor(addr);
    loop {
        let fault_addr = page.max(addr);
        let entry = table.get(&page).ok_or(MemoryFault::Unmapped {
            addr: fault_addr,
            access,
        })?;
        if enforce_perms && !entry.perms.contains(access.required()) {
            return Err(MemoryFault::PermissionDenied {
                addr: fault_addr,
                access,
            });
        }
        if page == last_page {
            return Ok(());
        }
        page += PAGE_SIZE;
    }
}

/// Split `[addr, addr + len)` into per-page pieces:
/// `(page base, offset in page, buffer lo, buffer hi)`.
fn chunks(addr: u64, len: usize) -> impl Iterator<Item = (u64, usize, usize, usize)> {
    let mut done = 0usize;
    core::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let cur = addr.wrapping_add(done as u64);
        let page = page_floor(cur);
        let offset = (cur - page) as usize;
        let n = (PAGE_BYTES - offset).min(len - done);
        let item = (page, offset, done, done + n);
        done += n;
        Some(item)
    })
}

//! Linux x86-64 syscall emulation for statically linked guests.
//!
//! Only what a static binary needs to start, do file I/O, print and exit is
//! handled; any other number fails with `ENOSYS` and a warning so missing
//! calls show up in the log instead of as silent misbehaviour.

use crate::bridge::{Bridge, SyscallDisposition};
use crate::errno::{
    EACCES, EBADF, EEXIST, EFAULT, EINVAL, EIO, EMFILE, ENAMETOOLONG, ENODEV, ENOENT, ENOMEM,
    ENOSYS, ENOTDIR, EPERM, ESPIPE, ESRCH,
};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use xemu_cpu_core::{ExecutionContext, SyscallArgs};
use xemu_mem::{page_ceil, AddressSpace, Backing, Permissions, SharedMemory, VmmError, PAGE_SIZE};

/// Syscall numbers understood by [`LinuxBridge`].
pub mod nr {
    pub const READ: u64 = 0;
    pub const WRITE: u64 = 1;
    pub const OPEN: u64 = 2;
    pub const CLOSE: u64 = 3;
    pub const LSEEK: u64 = 8;
    pub const MMAP: u64 = 9;
    pub const MPROTECT: u64 = 10;
    pub const MUNMAP: u64 = 11;
    pub const BRK: u64 = 12;
    pub const WRITEV: u64 = 20;
    pub const GETPID: u64 = 39;
    pub const EXIT: u64 = 60;
    pub const KILL: u64 = 62;
    pub const UNAME: u64 = 63;
    pub const GETUID: u64 = 102;
    pub const GETGID: u64 = 104;
    pub const GETEUID: u64 = 107;
    pub const GETEGID: u64 = 108;
    pub const ARCH_PRCTL: u64 = 158;
    pub const GETTID: u64 = 186;
    pub const TKILL: u64 = 200;
    pub const SET_TID_ADDRESS: u64 = 218;
    pub const EXIT_GROUP: u64 = 231;
    pub const TGKILL: u64 = 234;
    pub const OPENAT: u64 = 257;
}

const MAP_SHARED: u64 = 0x01;
const MAP_PRIVATE: u64 = 0x02;
const MAP_FIXED: u64 = 0x10;
const MAP_ANONYMOUS: u64 = 0x20;
const MAP_FIXED_NOREPLACE: u64 = 0x10_0000;

const ARCH_SET_GS: u64 = 0x1001;
const ARCH_SET_FS: u64 = 0x1002;
const ARCH_GET_FS: u64 = 0x1003;
const ARCH_GET_GS: u64 = 0x1004;

const O_ACCMODE: u64 = 0o3;
const O_WRONLY: u64 = 0o1;
const O_RDWR: u64 = 0o2;
const O_CREAT: u64 = 0o100;
const O_EXCL: u64 = 0o200;
const O_TRUNC: u64 = 0o1000;
const O_APPEND: u64 = 0o2000;
const AT_FDCWD: i64 = -100;

const SEEK_SET: u64 = 0;
const SEEK_CUR: u64 = 1;
const SEEK_END: u64 = 2;

/// Includes the terminating NUL, as `PATH_MAX` does.
const PATH_MAX: usize = 4096;
/// Descriptors per process, the default `RLIMIT_NOFILE`.
const MAX_FDS: u64 = 1024;
const NSIG: u64 = 64;

/// Segment bases must be canonical user addresses.
const USER_ADDR_LIMIT: u64 = 0x0000_8000_0000_0000;

const IOV_MAX: u64 = 1024;
/// A single read or write moves at most this many bytes.
const MAX_IO: u64 = 1 << 20;
const UTS_FIELD_LEN: usize = 65;

/// How far the heap may grow above the initial break by default.
pub const DEFAULT_BRK_LIMIT: u64 = 1 << 30;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared buffer collecting a guest output stream.
#[derive(Debug, Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        lock(&self.0).clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&lock(&self.0)).into_owned()
    }
}

/// Where guest writes to fd 1 or 2 end up.
#[derive(Debug, Clone, Default)]
pub enum OutputStream {
    /// The host process's own stdout/stderr.
    #[default]
    Inherit,
    Capture(Captured),
    Null,
}

impl OutputStream {
    fn write_all(&self, fd: u64, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            OutputStream::Inherit if fd == 2 => {
                let mut err = std::io::stderr().lock();
                err.write_all(bytes)?;
                err.flush()
            }
            OutputStream::Inherit => {
                let mut out = std::io::stdout().lock();
                out.write_all(bytes)?;
                out.flush()
            }
            OutputStream::Capture(buf) => {
                lock(&buf.0).extend_from_slice(bytes);
                Ok(())
            }
            OutputStream::Null => Ok(()),
        }
    }
}

/// What guest reads from fd 0 see.
#[derive(Debug, Clone, Default)]
pub enum InputStream {
    /// Always at end of file.
    #[default]
    Null,
    Bytes(Vec<u8>),
    /// The host process's stdin (blocks the calling guest thread).
    Inherit,
}

#[derive(Debug, Default)]
struct Stdin {
    source: InputStream,
    offset: usize,
}

impl Stdin {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &self.source {
            InputStream::Null => Ok(0),
            InputStream::Bytes(data) => {
                let rest = data.get(self.offset..).unwrap_or_default();
                let n = rest.len().min(buf.len());
                buf[..n].copy_from_slice(&rest[..n]);
                self.offset += n;
                Ok(n)
            }
            InputStream::Inherit => std::io::stdin().lock().read(buf),
        }
    }
}

/// A host file opened by the guest.
#[derive(Debug)]
struct HostFile {
    file: File,
    readable: bool,
    writable: bool,
}

#[derive(Debug, Clone)]
enum OpenFile {
    Stdin,
    Stdout,
    Stderr,
    Host(Arc<HostFile>),
}

/// Guest descriptor numbers, allocated lowest free first.
#[derive(Debug)]
struct FdTable {
    files: BTreeMap<u64, OpenFile>,
}

impl FdTable {
    fn with_stdio() -> Self {
        let files = BTreeMap::from([
            (0, OpenFile::Stdin),
            (1, OpenFile::Stdout),
            (2, OpenFile::Stderr),
        ]);
        Self { files }
    }

    fn insert(&mut self, file: OpenFile) -> Option<u64> {
        let fd = (0..MAX_FDS).find(|fd| !self.files.contains_key(fd))?;
        self.files.insert(fd, file);
        Some(fd)
    }
}

fn io_errno(err: &std::io::Error) -> i32 {
    match err.kind() {
        ErrorKind::NotFound => ENOENT,
        ErrorKind::PermissionDenied => EACCES,
        ErrorKind::AlreadyExists => EEXIST,
        ErrorKind::InvalidInput => EINVAL,
        _ => EIO,
    }
}

/// `O_CREAT` on a read-only open: std only creates through a writable handle,
/// so make the file first and let the caller reopen it.
fn create_for_reading(path: &str, exclusive: bool) -> std::io::Result<()> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists && !exclusive => Ok(()),
        Err(err) => Err(err),
    }
}

/// Signals whose default action leaves the process running.
fn ignored_by_default(sig: u64) -> bool {
    // SIGCHLD, SIGCONT, SIGURG, SIGWINCH
    matches!(sig, 17 | 18 | 23 | 28)
}

#[derive(Debug, Clone, Copy)]
struct Heap {
    start: u64,
    current: u64,
    limit: u64,
}

/// Process-wide Linux personality: one instance per guest process.
#[derive(Debug)]
pub struct LinuxBridge {
    pid: u32,
    uid: u32,
    gid: u32,
    stdin: Mutex<Stdin>,
    stdout: OutputStream,
    stderr: OutputStream,
    fds: Mutex<FdTable>,
    heap: Mutex<Heap>,
}

impl LinuxBridge {
    /// `brk` is the initial program break (page aligned, just past the image).
    pub fn new(brk: u64) -> Self {
        Self {
            pid: 1000,
            uid: 1000,
            gid: 1000,
            stdin: Mutex::new(Stdin::default()),
            stdout: OutputStream::Inherit,
            stderr: OutputStream::Inherit,
            fds: Mutex::new(FdTable::with_stdio()),
            heap: Mutex::new(Heap {
                start: brk,
                current: brk,
                limit: brk.saturating_add(DEFAULT_BRK_LIMIT),
            }),
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_ids(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn with_stdin(self, source: InputStream) -> Self {
        *lock(&self.stdin) = Stdin { source, offset: 0 };
        self
    }

    pub fn with_stdout(mut self, stream: OutputStream) -> Self {
        self.stdout = stream;
        self
    }

    pub fn with_stderr(mut self, stream: OutputStream) -> Self {
        self.stderr = stream;
        self
    }

    /// Maximum heap size above the initial break.
    pub fn with_brk_limit(self, bytes: u64) -> Self {
        {
            let mut heap = lock(&self.heap);
            heap.limit = heap.start.saturating_add(bytes);
        }
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Current program break.
    pub fn brk(&self) -> u64 {
        lock(&self.heap).current
    }

    /// The table lock is not held while the returned file does I/O, so a
    /// blocking stdin read does not stall other threads' writes.
    fn file(&self, fd: u64) -> Option<OpenFile> {
        lock(&self.fds).files.get(&fd).cloned()
    }

    fn readable(&self, fd: u64) -> bool {
        match self.file(fd) {
            Some(OpenFile::Stdin) => true,
            Some(OpenFile::Host(host)) => host.readable,
            _ => false,
        }
    }

    fn writable(&self, fd: u64) -> bool {
        match self.file(fd) {
            Some(OpenFile::Stdout | OpenFile::Stderr) => true,
            Some(OpenFile::Host(host)) => host.writable,
            _ => false,
        }
    }

    fn sys_read(&self, space: &AddressSpace, fd: u64, buf: u64, count: u64) -> SyscallDisposition {
        if !self.readable(fd) {
            return SyscallDisposition::err(EBADF);
        }
        let count = count.min(MAX_IO);
        if space.check_range(buf, count, xemu_mem::Access::Write).is_err() {
            return SyscallDisposition::err(EFAULT);
        }
        let mut data = vec![0u8; count as usize];
        let read = match self.file(fd) {
            Some(OpenFile::Stdin) => lock(&self.stdin).read(&mut data),
            Some(OpenFile::Host(host)) => (&host.file).read(&mut data),
            _ => return SyscallDisposition::err(EBADF),
        };
        let n = match read {
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(fd, %err, "host read failed");
                return SyscallDisposition::err(io_errno(&err));
            }
        };
        match space.write(buf, &data[..n]) {
            Ok(()) => SyscallDisposition::ok(n as u64),
            Err(_) => SyscallDisposition::err(EFAULT),
        }
    }

    fn emit(&self, fd: u64, bytes: &[u8]) -> SyscallDisposition {
        let written = match self.file(fd) {
            Some(OpenFile::Stdout) => self.stdout.write_all(1, bytes),
            Some(OpenFile::Stderr) => self.stderr.write_all(2, bytes),
            Some(OpenFile::Host(host)) if host.writable => (&host.file).write_all(bytes),
            _ => return SyscallDisposition::err(EBADF),
        };
        match written {
            Ok(()) => SyscallDisposition::ok(bytes.len() as u64),
            Err(err) => {
                tracing::debug!(fd, %err, "host write failed");
                SyscallDisposition::err(EIO)
            }
        }
    }

    fn sys_write(&self, space: &AddressSpace, fd: u64, buf: u64, count: u64) -> SyscallDisposition {
        if !self.writable(fd) {
            return SyscallDisposition::err(EBADF);
        }
        let mut data = vec![0u8; count.min(MAX_IO) as usize];
        if space.read(buf, &mut data).is_err() {
            return SyscallDisposition::err(EFAULT);
        }
        self.emit(fd, &data)
    }

    fn sys_writev(&self, space: &AddressSpace, fd: u64, iov: u64, iovcnt: u64) -> SyscallDisposition {
        if iovcnt > IOV_MAX {
            return SyscallDisposition::err(EINVAL);
        }
        if !self.writable(fd) {
            return SyscallDisposition::err(EBADF);
        }
        let mut data = Vec::new();
        for i in 0..iovcnt {
            let entry = iov.wrapping_add(i * 16);
            let (Ok(base), Ok(len)) = (space.read_u64(entry), space.read_u64(entry.wrapping_add(8)))
            else {
                return SyscallDisposition::err(EFAULT);
            };
            let room = MAX_IO.saturating_sub(data.len() as u64);
            let len = len.min(room);
            let start = data.len();
            data.resize(start + len as usize, 0);
            if space.read(base, &mut data[start..]).is_err() {
                return SyscallDisposition::err(EFAULT);
            }
        }
        self.emit(fd, &data)
    }

    /// Paths resolve against the host's working directory; `dirfd` other
    /// than `AT_FDCWD` is only accepted alongside an absolute path.
    fn sys_openat(
        &self,
        space: &AddressSpace,
        dirfd: u64,
        path: u64,
        flags: u64,
    ) -> SyscallDisposition {
        let path = match space.read_cstr(path, PATH_MAX) {
            Ok(bytes) if bytes.len() >= PATH_MAX => return SyscallDisposition::err(ENAMETOOLONG),
            Ok(bytes) if bytes.is_empty() => return SyscallDisposition::err(ENOENT),
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => return SyscallDisposition::err(EFAULT),
        };
        if dirfd as i64 != AT_FDCWD && !path.starts_with('/') {
            let open = lock(&self.fds).files.contains_key(&dirfd);
            return SyscallDisposition::err(if open { ENOTDIR } else { EBADF });
        }

        let (readable, writable) = match flags & O_ACCMODE {
            O_WRONLY => (false, true),
            O_RDWR => (true, true),
            0 => (true, false),
            _ => return SyscallDisposition::err(EINVAL),
        };
        let mut options = OpenOptions::new();
        options
            .read(readable)
            .write(writable)
            .append(flags & O_APPEND != 0)
            .truncate(writable && flags & O_TRUNC != 0);
        if flags & O_CREAT != 0 {
            if writable {
                if flags & O_EXCL != 0 {
                    options.create_new(true);
                } else {
                    options.create(true);
                }
            } else if let Err(err) = create_for_reading(&path, flags & O_EXCL != 0) {
                return SyscallDisposition::err(io_errno(&err));
            }
        }
        let file = match options.open(&path) {
            Ok(file) => file,
            Err(err) => {
                tracing::debug!(%path, %err, "open failed");
                return SyscallDisposition::err(io_errno(&err));
            }
        };
        let host = Arc::new(HostFile {
            file,
            readable,
            writable,
        });
        match lock(&self.fds).insert(OpenFile::Host(host)) {
            Some(fd) => {
                tracing::debug!(%path, fd, "opened host file");
                SyscallDisposition::ok(fd)
            }
            None => SyscallDisposition::err(EMFILE),
        }
    }

    fn sys_lseek(&self, fd: u64, offset: u64, whence: u64) -> SyscallDisposition {
        let host = match self.file(fd) {
            Some(OpenFile::Host(host)) => host,
            // Stdio is a pipe or terminal as far as the guest knows.
            Some(_) => return SyscallDisposition::err(ESPIPE),
            None => return SyscallDisposition::err(EBADF),
        };
        let offset = offset as i64;
        let pos = match whence {
            SEEK_SET if offset >= 0 => SeekFrom::Start(offset as u64),
            SEEK_CUR => SeekFrom::Current(offset),
            SEEK_END => SeekFrom::End(offset),
            _ => return SyscallDisposition::err(EINVAL),
        };
        match (&host.file).seek(pos) {
            Ok(pos) => SyscallDisposition::ok(pos),
            Err(err) => SyscallDisposition::err(io_errno(&err)),
        }
    }

    fn sys_close(&self, fd: u64) -> SyscallDisposition {
        match lock(&self.fds).files.remove(&fd) {
            Some(_) => SyscallDisposition::ok(0),
            None => SyscallDisposition::err(EBADF),
        }
    }

    /// No guest handlers exist, so a signal to this process takes its default
    /// action: ignored for the few signals that default to that, otherwise the
    /// whole process ends with status `128 + sig`.
    fn send_signal(&self, ctx: &ExecutionContext, pid: u64, sig: u64) -> SyscallDisposition {
        if sig > NSIG {
            return SyscallDisposition::err(EINVAL);
        }
        if pid != 0 && pid != self.pid as u64 {
            return SyscallDisposition::err(ESRCH);
        }
        if sig == 0 || ignored_by_default(sig) {
            return SyscallDisposition::ok(0);
        }
        tracing::debug!(tid = ctx.tid(), sig, "fatal signal sent to self");
        SyscallDisposition::ExitGroup(128 + sig as i32)
    }

    fn sys_brk(&self, space: &AddressSpace, addr: u64) -> SyscallDisposition {
        let mut heap = lock(&self.heap);
        if addr < heap.start || addr > heap.limit {
            return SyscallDisposition::ok(heap.current);
        }
        let (Some(old_end), Some(new_end)) = (page_ceil(heap.current), page_ceil(addr)) else {
            return SyscallDisposition::ok(heap.current);
        };
        if new_end > old_end {
            if let Err(err) = space.map(old_end, new_end - old_end, Permissions::RW, Backing::Anonymous) {
                tracing::debug!(%err, addr, "brk cannot grow");
                return SyscallDisposition::ok(heap.current);
            }
        } else if new_end < old_end {
            if let Err(err) = space.discard(new_end, old_end - new_end) {
                tracing::error!(%err, addr, "brk shrink failed");
            }
        }
        heap.current = addr;
        SyscallDisposition::ok(addr)
    }

    fn sys_mmap(&self, space: &AddressSpace, args: &[u64; 6]) -> SyscallDisposition {
        let [addr, len, prot, flags, fd, _offset] = *args;
        if len == 0 {
            return SyscallDisposition::err(EINVAL);
        }
        let Some(len) = page_ceil(len) else {
            return SyscallDisposition::err(ENOMEM);
        };
        if flags & MAP_ANONYMOUS == 0 {
            // File-backed mappings are not supported.
            return SyscallDisposition::err(if (fd as i64) < 0 { EBADF } else { ENODEV });
        }
        let sharing = flags & (MAP_SHARED | MAP_PRIVATE);
        if sharing == 0 || sharing == (MAP_SHARED | MAP_PRIVATE) {
            return SyscallDisposition::err(EINVAL);
        }
        let perms = Permissions::from_prot(prot);
        let backing = if flags & MAP_SHARED != 0 {
            match SharedMemory::new(len) {
                Ok(shared) => Backing::Shared(shared),
                Err(_) => return SyscallDisposition::err(ENOMEM),
            }
        } else {
            Backing::Anonymous
        };

        if flags & (MAP_FIXED | MAP_FIXED_NOREPLACE) != 0 {
            if addr % PAGE_SIZE != 0 {
                return SyscallDisposition::err(EINVAL);
            }
            if flags & MAP_FIXED_NOREPLACE != 0 {
                if !space.is_free(addr, len) {
                    return SyscallDisposition::err(EEXIST);
                }
            } else if let Err(err) = space.discard(addr, len) {
                return SyscallDisposition::err(vmm_errno(&err));
            }
            return match space.map(addr, len, perms, backing) {
                Ok(region) => SyscallDisposition::ok(region.start),
                Err(err) => SyscallDisposition::err(vmm_errno(&err)),
            };
        }

        if addr != 0 && addr % PAGE_SIZE == 0 && space.is_free(addr, len) {
            if let Ok(region) = space.map(addr, len, perms, backing.clone()) {
                return SyscallDisposition::ok(region.start);
            }
        }
        match space.map_anywhere(len, perms, backing) {
            Ok(region) => SyscallDisposition::ok(region.start),
            Err(err) => SyscallDisposition::err(vmm_errno(&err)),
        }
    }

    fn sys_munmap(&self, space: &AddressSpace, addr: u64, len: u64) -> SyscallDisposition {
        if addr % PAGE_SIZE != 0 || len == 0 {
            return SyscallDisposition::err(EINVAL);
        }
        match space.discard(addr, len) {
            Ok(_) => SyscallDisposition::ok(0),
            Err(err) => SyscallDisposition::err(vmm_errno(&err)),
        }
    }

    fn sys_mprotect(&self, space: &AddressSpace, addr: u64, len: u64, prot: u64) -> SyscallDisposition {
        if addr % PAGE_SIZE != 0 {
            return SyscallDisposition::err(EINVAL);
        }
        if len == 0 {
            return SyscallDisposition::ok(0);
        }
        match space.protect(addr, len, Permissions::from_prot(prot)) {
            Ok(()) => SyscallDisposition::ok(0),
            Err(err) => SyscallDisposition::err(vmm_errno(&err)),
        }
    }

    fn sys_uname(&self, space: &AddressSpace, buf: u64) -> SyscallDisposition {
        let fields: [&str; 6] = ["Linux", "xemu", "6.1.0", "#1 SMP", "x86_64", "(none)"];
        let mut out = vec![0u8; UTS_FIELD_LEN * fields.len()];
        for (i, field) in fields.iter().enumerate() {
            let start = i * UTS_FIELD_LEN;
            out[start..start + field.len()].copy_from_slice(field.as_bytes());
        }
        match space.write(buf, &out) {
            Ok(()) => SyscallDisposition::ok(0),
            Err(_) => SyscallDisposition::err(EFAULT),
        }
    }

    fn sys_arch_prctl(
        &self,
        space: &AddressSpace,
        ctx: &mut ExecutionContext,
        code: u64,
        addr: u64,
    ) -> SyscallDisposition {
        match code {
            ARCH_SET_FS | ARCH_SET_GS if addr >= USER_ADDR_LIMIT => SyscallDisposition::err(EPERM),
            ARCH_SET_FS => {
                ctx.regs.fs_base = addr;
                SyscallDisposition::ok(0)
            }
            ARCH_SET_GS => {
                ctx.regs.gs_base = addr;
                SyscallDisposition::ok(0)
            }
            ARCH_GET_FS | ARCH_GET_GS => {
                let base = if code == ARCH_GET_FS {
                    ctx.regs.fs_base
                } else {
                    ctx.regs.gs_base
                };
                match space.write_u64(addr, base) {
                    Ok(()) => SyscallDisposition::ok(0),
                    Err(_) => SyscallDisposition::err(EFAULT),
                }
            }
            _ => SyscallDisposition::err(EINVAL),
        }
    }
}

fn vmm_errno(err: &VmmError) -> i32 {
    match err {
        VmmError::Overlap { .. } => EEXIST,
        VmmError::Unaligned { .. } | VmmError::InvalidLength { .. } => EINVAL,
        VmmError::NotMapped { .. } | VmmError::OutOfAddressSpace { .. } => ENOMEM,
        VmmError::Fault(_) => EFAULT,
    }
}

impl Bridge for LinuxBridge {
    fn syscall(
        &self,
        space: &AddressSpace,
        ctx: &mut ExecutionContext,
        args: &SyscallArgs,
    ) -> SyscallDisposition {
        let a = args.args;
        tracing::trace!(tid = ctx.tid(), nr = args.number, ?a, "syscall");
        match args.number {
            nr::READ => self.sys_read(space, a[0], a[1], a[2]),
            nr::WRITE => self.sys_write(space, a[0], a[1], a[2]),
            nr::OPEN => self.sys_openat(space, AT_FDCWD as u64, a[0], a[1]),
            nr::OPENAT => self.sys_openat(space, a[0], a[1], a[2]),
            nr::LSEEK => self.sys_lseek(a[0], a[1], a[2]),
            nr::CLOSE => self.sys_close(a[0]),
            nr::MMAP => self.sys_mmap(space, &a),
            nr::MPROTECT => self.sys_mprotect(space, a[0], a[1], a[2]),
            nr::MUNMAP => self.sys_munmap(space, a[0], a[1]),
            nr::BRK => self.sys_brk(space, a[0]),
            nr::WRITEV => self.sys_writev(space, a[0], a[1], a[2]),
            nr::GETPID => SyscallDisposition::ok(self.pid as u64),
            nr::GETTID => SyscallDisposition::ok(ctx.tid() as u64),
            nr::GETUID | nr::GETEUID => SyscallDisposition::ok(self.uid as u64),
            nr::GETGID | nr::GETEGID => SyscallDisposition::ok(self.gid as u64),
            nr::UNAME => self.sys_uname(space, a[0]),
            nr::ARCH_PRCTL => self.sys_arch_prctl(space, ctx, a[0], a[1]),
            nr::SET_TID_ADDRESS => SyscallDisposition::ok(ctx.tid() as u64),
            nr::EXIT => SyscallDisposition::Exit(a[0] as i32),
            nr::EXIT_GROUP => SyscallDisposition::ExitGroup(a[0] as i32),
            nr::KILL => self.send_signal(ctx, a[0], a[1]),
            nr::TKILL => match a[0] as i64 {
                tid if tid <= 0 => SyscallDisposition::err(EINVAL),
                _ => self.send_signal(ctx, self.pid as u64, a[1]),
            },
            nr::TGKILL => match (a[0] as i64, a[1] as i64) {
                (tgid, tid) if tgid <= 0 || tid <= 0 => SyscallDisposition::err(EINVAL),
                _ => self.send_signal(ctx, a[0], a[2]),
            },
            number => {
                tracing::warn!(tid = ctx.tid(), number, "unimplemented syscall");
                SyscallDisposition::err(ENOSYS)
            }
        }
    }
}

use std::sync::Arc;
use xemu_cpu_core::{ExecutionContext, RegisterFile, SyscallArgs};
use xemu_mem::{AddressSpace, Backing, Permissions};
use xemu_posix::{
    errno, nr, Bridge, Captured, InputStream, LinuxBridge, OutputStream, SyscallDisposition,
};

const BUF: u64 = 0x60_0000;
const BRK: u64 = 0x80_0000;

const PROT_RW: u64 = 0x3;
const MAP_PRIVATE_ANON: u64 = 0x22;
const MAP_FIXED: u64 = 0x10;
const MAP_FIXED_NOREPLACE: u64 = 0x10_0000;

struct Fixture {
    space: Arc<AddressSpace>,
    ctx: ExecutionContext,
    bridge: LinuxBridge,
    stdout: Captured,
}

impl Fixture {
    fn new() -> Self {
        Self::with(|b| b)
    }

    fn with(configure: impl FnOnce(LinuxBridge) -> LinuxBridge) -> Self {
        let space = Arc::new(AddressSpace::new());
        space
            .map(BUF, 0x4000, Permissions::RW, Backing::Anonymous)
            .expect("map buffer");
        let stdout = Captured::new();
        let bridge = configure(
            LinuxBridge::new(BRK)
                .with_stdout(OutputStream::Capture(stdout.clone()))
                .with_stderr(OutputStream::Null),
        );
        let ctx = ExecutionContext::new(7, &space, RegisterFile::new(0x40_0000, 0));
        Self {
            space,
            ctx,
            bridge,
            stdout,
        }
    }

    fn call(&mut self, number: u64, args: &[u64]) -> SyscallDisposition {
        let mut padded = [0u64; 6];
        padded[..args.len()].copy_from_slice(args);
        let args = SyscallArgs {
            number,
            args: padded,
        };
        self.bridge.syscall(&self.space, &mut self.ctx, &args)
    }

    fn rax(&mut self, number: u64, args: &[u64]) -> u64 {
        match self.call(number, args) {
            SyscallDisposition::Return(ret) => ret.rax(),
            other => panic!("syscall {number} did not return: {other:?}"),
        }
    }
}

fn neg(errno: i32) -> u64 {
    (-(errno as i64)) as u64
}

#[test]
fn write_to_stdout_is_captured() {
    let mut f = Fixture::new();
    f.space.write(BUF, b"hello\n").unwrap();
    assert_eq!(f.rax(nr::WRITE, &[1, BUF, 6]), 6);
    assert_eq!(f.stdout.to_string_lossy(), "hello\n");
}

#[test]
fn write_from_unmapped_buffer_is_efault() {
    let mut f = Fixture::new();
    assert_eq!(f.rax(nr::WRITE, &[1, 0x1000, 4]), neg(errno::EFAULT));
    assert!(f.stdout.contents().is_empty());
}

#[test]
fn writev_concatenates_buffers() {
    let mut f = Fixture::new();
    f.space.write(BUF + 0x100, b"foo").unwrap();
    f.space.write(BUF + 0x200, b"barbaz").unwrap();
    let iov = BUF;
    f.space.write_u64(iov, BUF + 0x100).unwrap();
    f.space.write_u64(iov + 8, 3).unwrap();
    f.space.write_u64(iov + 16, BUF + 0x200).unwrap();
    f.space.write_u64(iov + 24, 6).unwrap();

    assert_eq!(f.rax(nr::WRITEV, &[1, iov, 2]), 9);
    assert_eq!(f.stdout.to_string_lossy(), "foobarbaz");
    assert_eq!(f.rax(nr::WRITEV, &[1, iov, 4096]), neg(errno::EINVAL));
}

#[test]
fn closed_descriptors_reject_io() {
    let mut f = Fixture::new();
    assert_eq!(f.rax(nr::WRITE, &[5, BUF, 1]), neg(errno::EBADF));
    assert_eq!(f.rax(nr::CLOSE, &[1]), 0);
    assert_eq!(f.rax(nr::WRITE, &[1, BUF, 1]), neg(errno::EBADF));
    assert_eq!(f.rax(nr::CLOSE, &[1]), neg(errno::EBADF));
    assert_eq!(f.rax(nr::CLOSE, &[17]), neg(errno::EBADF));
}

#[test]
fn read_drains_stdin_bytes() {
    let mut f = Fixture::with(|b| b.with_stdin(InputStream::Bytes(b"abc".to_vec())));
    assert_eq!(f.rax(nr::READ, &[0, BUF, 2]), 2);
    assert_eq!(f.rax(nr::READ, &[0, BUF + 2, 10]), 1);
    assert_eq!(f.rax(nr::READ, &[0, BUF, 10]), 0);
    let mut got = [0u8; 3];
    f.space.read(BUF, &mut got).unwrap();
    assert_eq!(&got, b"abc");

    assert_eq!(f.rax(nr::READ, &[0, 0x1000, 10]), neg(errno::EFAULT));
    assert_eq!(f.rax(nr::READ, &[1, BUF, 10]), neg(errno::EBADF));
}

#[test]
fn brk_grows_and_shrinks_the_heap() {
    let mut f = Fixture::new();
    assert_eq!(f.rax(nr::BRK, &[0]), BRK);
    assert!(f.space.page(BRK).is_none());

    assert_eq!(f.rax(nr::BRK, &[BRK + 0x2500]), BRK + 0x2500);
    assert_eq!(f.bridge.brk(), BRK + 0x2500);
    let page = f.space.page(BRK + 0x2000).expect("heap page mapped");
    assert_eq!(page.perms, Permissions::RW);
    f.space.write_u64(BRK + 0x2ff8, 0xdead_beef).unwrap();

    assert_eq!(f.rax(nr::BRK, &[BRK + 0x100]), BRK + 0x100);
    assert!(f.space.page(BRK).is_some());
    assert!(f.space.page(BRK + 0x1000).is_none());
    assert!(f.space.page(BRK + 0x2000).is_none());
}

#[test]
fn brk_outside_limits_reports_current_break() {
    let mut f = Fixture::with(|b| b.with_brk_limit(0x1_0000));
    assert_eq!(f.rax(nr::BRK, &[BRK + 0x1000]), BRK + 0x1000);
    assert_eq!(f.rax(nr::BRK, &[BRK + 0x2_0000]), BRK + 0x1000);
    assert_eq!(f.rax(nr::BRK, &[BRK - 0x1000]), BRK + 0x1000);
}

#[test]
fn anonymous_mmap_lands_in_the_mmap_window() {
    let mut f = Fixture::new();
    let addr = f.rax(nr::MMAP, &[0, 0x2000, PROT_RW, MAP_PRIVATE_ANON, u64::MAX, 0]);
    let window = f.space.config().mmap_base;
    assert!(addr >= window, "{addr:#x}");
    assert_eq!(addr % 0x1000, 0);
    assert_eq!(f.space.page(addr + 0x1000).unwrap().perms, Permissions::RW);
    assert_eq!(f.space.read_u64(addr).unwrap(), 0);

    let hinted = f.rax(nr::MMAP, &[0x1000_0000, 0x1000, PROT_RW, MAP_PRIVATE_ANON, u64::MAX, 0]);
    assert_eq!(hinted, 0x1000_0000);
}

#[test]
fn fixed_mmap_replaces_and_noreplace_refuses() {
    let mut f = Fixture::new();
    f.space.write_u8(BUF, 0xAA).unwrap();

    let flags = MAP_PRIVATE_ANON | MAP_FIXED_NOREPLACE;
    assert_eq!(f.rax(nr::MMAP, &[BUF, 0x1000, PROT_RW, flags, u64::MAX, 0]), neg(errno::EEXIST));
    assert_eq!(f.space.read_u8(BUF).unwrap(), 0xAA);

    let flags = MAP_PRIVATE_ANON | MAP_FIXED;
    assert_eq!(f.rax(nr::MMAP, &[BUF, 0x1000, 0x1, flags, u64::MAX, 0]), BUF);
    assert_eq!(f.space.read_u8(BUF).unwrap(), 0);
    assert_eq!(f.space.page(BUF).unwrap().perms, Permissions::READ);

    assert_eq!(f.rax(nr::MMAP, &[BUF + 1, 0x1000, PROT_RW, flags, u64::MAX, 0]), neg(errno::EINVAL));
}

#[test]
fn mmap_rejects_files_and_empty_lengths() {
    let mut f = Fixture::new();
    assert_eq!(f.rax(nr::MMAP, &[0, 0x1000, PROT_RW, 0x02, 3, 0]), neg(errno::ENODEV));
    assert_eq!(f.rax(nr::MMAP, &[0, 0x1000, PROT_RW, 0x02, u64::MAX, 0]), neg(errno::EBADF));
    assert_eq!(f.rax(nr::MMAP, &[0, 0, PROT_RW, MAP_PRIVATE_ANON, u64::MAX, 0]), neg(errno::EINVAL));
    assert_eq!(f.rax(nr::MMAP, &[0, 0x1000, PROT_RW, 0x20, u64::MAX, 0]), neg(errno::EINVAL));
}

#[test]
fn shared_mmap_is_backed_by_shared_frames() {
    let mut f = Fixture::new();
    let addr = f.rax(nr::MMAP, &[0, 0x1000, PROT_RW, 0x21, u64::MAX, 0]);
    f.space.write_u32(addr, 0x1234_5678).unwrap();
    assert_eq!(f.space.read_u32(addr).unwrap(), 0x1234_5678);
    assert_eq!(f.space.page(addr).unwrap().kind, xemu_mem::BackingKind::Shared);
}

#[test]
fn munmap_and_mprotect() {
    let mut f = Fixture::new();
    assert_eq!(f.rax(nr::MPROTECT, &[BUF, 0x1000, 0x1]), 0);
    assert!(f.space.write_u8(BUF, 1).is_err());
    assert!(f.space.write_u8(BUF + 0x1000, 1).is_ok());

    assert_eq!(f.rax(nr::MPROTECT, &[0x1000, 0x1000, 0x1]), neg(errno::ENOMEM));
    assert_eq!(f.rax(nr::MPROTECT, &[BUF + 4, 0x1000, 0x1]), neg(errno::EINVAL));

    assert_eq!(f.rax(nr::MUNMAP, &[BUF, 0x2000]), 0);
    assert!(f.space.page(BUF).is_none());
    assert!(f.space.page(BUF + 0x2000).is_some());
    // Unmapping a hole is not an error.
    assert_eq!(f.rax(nr::MUNMAP, &[BUF, 0x2000]), 0);
    assert_eq!(f.rax(nr::MUNMAP, &[BUF + 1, 0x1000]), neg(errno::EINVAL));
}

#[test]
fn arch_prctl_sets_and_reads_segment_bases() {
    const ARCH_SET_FS: u64 = 0x1002;
    const ARCH_GET_FS: u64 = 0x1003;
    const ARCH_SET_GS: u64 = 0x1001;

    let mut f = Fixture::new();
    assert_eq!(f.rax(nr::ARCH_PRCTL, &[ARCH_SET_FS, 0x7000_1000]), 0);
    assert_eq!(f.ctx.regs.fs_base, 0x7000_1000);
    assert_eq!(f.rax(nr::ARCH_PRCTL, &[ARCH_GET_FS, BUF + 8]), 0);
    assert_eq!(f.space.read_u64(BUF + 8).unwrap(), 0x7000_1000);

    assert_eq!(f.rax(nr::ARCH_PRCTL, &[ARCH_SET_GS, 0x8000_0000_0000]), neg(errno::EPERM));
    assert_eq!(f.ctx.regs.gs_base, 0);
    assert_eq!(f.rax(nr::ARCH_PRCTL, &[0x9999, 0]), neg(errno::EINVAL));
}

#[test]
fn uname_reports_linux_x86_64() {
    let mut f = Fixture::new();
    assert_eq!(f.rax(nr::UNAME, &[BUF]), 0);
    assert_eq!(f.space.read_cstr(BUF, 65).unwrap(), b"Linux");
    assert_eq!(f.space.read_cstr(BUF + 4 * 65, 65).unwrap(), b"x86_64");
    assert_eq!(f.rax(nr::UNAME, &[0x1000]), neg(errno::EFAULT));
}

#[test]
fn identity_calls() {
    let mut f = Fixture::with(|b| b.with_pid(42).with_ids(500, 600));
    assert_eq!(f.rax(nr::GETPID, &[]), 42);
    assert_eq!(f.rax(nr::GETTID, &[]), 7);
    assert_eq!(f.rax(nr::GETUID, &[]), 500);
    assert_eq!(f.rax(nr::GETEGID, &[]), 600);
    assert_eq!(f.rax(nr::SET_TID_ADDRESS, &[BUF]), 7);
}

#[test]
fn exits_and_unknown_calls() {
    let mut f = Fixture::new();
    assert_eq!(f.call(nr::EXIT, &[3]), SyscallDisposition::Exit(3));
    assert_eq!(f.call(nr::EXIT_GROUP, &[(-1i64) as u64]), SyscallDisposition::ExitGroup(-1));
    assert_eq!(f.rax(999, &[]), neg(errno::ENOSYS));
}

const PATH: u64 = BUF + 0x3000;
const AT_FDCWD: u64 = (-100i64) as u64;

fn scratch_file(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("xemu-bridge-{}-{name}", std::process::id()))
}

fn put_cstr(f: &Fixture, addr: u64, s: &str) {
    f.space.write(addr, s.as_bytes()).unwrap();
    f.space.write(addr + s.len() as u64, &[0]).unwrap();
}

#[test]
fn host_files_open_read_seek_and_close() {
    let path = scratch_file("read");
    std::fs::write(&path, b"line one\nline two\n").unwrap();
    let mut f = Fixture::new();
    put_cstr(&f, PATH, path.to_str().unwrap());

    let fd = f.rax(nr::OPEN, &[PATH, 0]);
    assert_eq!(fd, 3);
    assert_eq!(f.rax(nr::READ, &[fd, BUF, 9]), 9);
    let mut got = [0u8; 9];
    f.space.read(BUF, &mut got).unwrap();
    assert_eq!(&got, b"line one\n");
    assert_eq!(f.rax(nr::READ, &[fd, BUF, 100]), 9);
    assert_eq!(f.rax(nr::READ, &[fd, BUF, 100]), 0);

    assert_eq!(f.rax(nr::LSEEK, &[fd, 5, 0]), 5);
    assert_eq!(f.rax(nr::READ, &[fd, BUF, 3]), 3);
    let mut word = [0u8; 3];
    f.space.read(BUF, &mut word).unwrap();
    assert_eq!(&word, b"one");
    assert_eq!(f.rax(nr::LSEEK, &[1, 0, 0]), neg(errno::ESPIPE));

    assert_eq!(f.rax(nr::WRITE, &[fd, BUF, 1]), neg(errno::EBADF));
    assert_eq!(f.rax(nr::CLOSE, &[fd]), 0);
    assert_eq!(f.rax(nr::READ, &[fd, BUF, 1]), neg(errno::EBADF));
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn openat_creates_files_in_the_lowest_free_descriptor() {
    let path = scratch_file("write");
    let _ = std::fs::remove_file(&path);
    let mut f = Fixture::new();
    put_cstr(&f, PATH, path.to_str().unwrap());
    f.space.write(BUF, b"hello").unwrap();

    // O_WRONLY | O_CREAT | O_TRUNC
    assert_eq!(f.rax(nr::CLOSE, &[0]), 0);
    let fd = f.rax(nr::OPENAT, &[AT_FDCWD, PATH, 0o1101, 0o644]);
    assert_eq!(fd, 0);
    assert_eq!(f.rax(nr::WRITE, &[fd, BUF, 5]), 5);
    assert_eq!(f.rax(nr::READ, &[fd, BUF, 5]), neg(errno::EBADF));
    assert_eq!(f.rax(nr::CLOSE, &[fd]), 0);
    assert_eq!(std::fs::read(&path).unwrap(), b"hello");

    // O_WRONLY | O_CREAT | O_EXCL
    assert_eq!(f.rax(nr::OPENAT, &[AT_FDCWD, PATH, 0o301, 0o644]), neg(errno::EEXIST));
    std::fs::remove_file(&path).unwrap();

    assert_eq!(f.rax(nr::OPEN, &[PATH, 0]), neg(errno::ENOENT));
    assert_eq!(f.rax(nr::OPEN, &[0x1000, 0]), neg(errno::EFAULT));
    put_cstr(&f, PATH, "relative.txt");
    assert_eq!(f.rax(nr::OPENAT, &[1, PATH, 0]), neg(errno::ENOTDIR));
    assert_eq!(f.rax(nr::OPENAT, &[40, PATH, 0]), neg(errno::EBADF));
}

#[test]
fn fatal_signals_to_self_end_the_process() {
    let mut f = Fixture::with(|b| b.with_pid(42));
    assert_eq!(f.call(nr::TGKILL, &[42, 7, 6]), SyscallDisposition::ExitGroup(134));
    assert_eq!(f.call(nr::KILL, &[42, 9]), SyscallDisposition::ExitGroup(137));
    assert_eq!(f.call(nr::TKILL, &[7, 15]), SyscallDisposition::ExitGroup(143));

    assert_eq!(f.rax(nr::TGKILL, &[42, 7, 0]), 0);
    // SIGCHLD is ignored by default.
    assert_eq!(f.rax(nr::TGKILL, &[42, 7, 17]), 0);
    assert_eq!(f.rax(nr::TGKILL, &[43, 7, 6]), neg(errno::ESRCH));
    assert_eq!(f.rax(nr::TGKILL, &[42, 7, 65]), neg(errno::EINVAL));
    assert_eq!(f.rax(nr::TGKILL, &[42, 0, 6]), neg(errno::EINVAL));
}

#![allow(dead_code)]

use std::sync::{Arc, Once};
use tracing_subscriber::EnvFilter;
use xemu::cpu::RegisterFile;
use xemu::mem::{AddressSpace, Backing, Permissions};
use xemu::posix::{Bridge, Captured, LinuxBridge, OutputStream};

pub const BASE: u64 = 0x40_0000;
/// Entry point of images built by [`static_elf`]: right after the headers.
pub const ENTRY: u64 = BASE + 120;

pub const CODE: u64 = 0x40_0000;
pub const DATA: u64 = 0x60_0000;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Minimal static ELF64 executable: one RWX PT_LOAD covering the whole file,
/// `code` placed straight after the ELF and program headers.
pub fn static_elf(code: &[u8]) -> Vec<u8> {
    let file_len = (120 + code.len()) as u64;
    let mut out = Vec::with_capacity(file_len as usize);
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out.extend_from_slice(&0x3eu16.to_le_bytes()); // EM_X86_64
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&ENTRY.to_le_bytes());
    out.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes());
    for half in [64u16, 56, 1, 64, 0, 0] {
        out.extend_from_slice(&half.to_le_bytes());
    }

    out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    out.extend_from_slice(&7u32.to_le_bytes()); // RWX
    out.extend_from_slice(&0u64.to_le_bytes());
    out.extend_from_slice(&BASE.to_le_bytes());
    out.extend_from_slice(&BASE.to_le_bytes());
    out.extend_from_slice(&file_len.to_le_bytes());
    out.extend_from_slice(&file_len.to_le_bytes());
    out.extend_from_slice(&0x1000u64.to_le_bytes());

    out.extend_from_slice(code);
    out
}

/// Bridge factory for [`xemu::GuestProcess::spawn_elf`] that captures stdout.
pub fn capturing_bridge(stdout: &Captured) -> impl FnOnce(&xemu::posix::LoadedImage) -> Arc<dyn Bridge> {
    let stdout = stdout.clone();
    move |img: &xemu::posix::LoadedImage| {
        let bridge: Arc<dyn Bridge> = Arc::new(
            LinuxBridge::new(img.brk)
                .with_stdout(OutputStream::Capture(stdout))
                .with_stderr(OutputStream::Null),
        );
        bridge
    }
}

/// Address space with `code` at [`CODE`] (read/execute) and one RW page at
/// [`DATA`].
pub fn flat_space(code: &[u8]) -> Arc<AddressSpace> {
    let space = Arc::new(AddressSpace::new());
    space
        .map(CODE, 0x1000, Permissions::RX, Backing::Anonymous)
        .expect("map code");
    space.write_unchecked(CODE, code).expect("load code");
    space
        .map(DATA, 0x1000, Permissions::RW, Backing::Anonymous)
        .expect("map data");
    space
}

pub fn regs_at(rip: u64) -> RegisterFile {
    RegisterFile::new(rip, 0)
}

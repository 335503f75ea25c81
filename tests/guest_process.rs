mod common;

use anyhow::Result;
use common::*;
use std::sync::Arc;
use xemu::cpu::{gpr, ArithmeticTrap, CoreConfig, FaultKind, HaltReason};
use xemu::posix::{Captured, LinuxBridge, LoadOptions, OutputStream};
use xemu::{EmulatorConfig, FaultPolicy, GuestProcess};

// mov eax, 60; mov edi, 7; syscall
const EXIT_7: [u8; 12] = [0xB8, 0x3C, 0, 0, 0, 0xBF, 0x07, 0, 0, 0, 0x0F, 0x05];

// lea rsi, [rip+26]; mov edi, 1; mov edx, 6; mov eax, 1; syscall
// mov edi, eax; mov eax, 231; syscall; "hello\n"
const HELLO: [u8; 39] = [
    0x48, 0x8D, 0x35, 0x1A, 0, 0, 0, //
    0xBF, 0x01, 0, 0, 0, //
    0xBA, 0x06, 0, 0, 0, //
    0xB8, 0x01, 0, 0, 0, //
    0x0F, 0x05, //
    0x89, 0xC7, //
    0xB8, 0xE7, 0, 0, 0, //
    0x0F, 0x05, //
    b'h', b'e', b'l', b'l', b'o', b'\n',
];

// Patches the immediate of `mov eax, 0` at +5 into 60 and loops back; exits
// with 42 only if the patched instruction is what runs the second time.
const SELF_PATCH: [u8; 30] = [
    0xBF, 0x01, 0, 0, 0, // +0  mov edi, 1
    0xB8, 0x00, 0, 0, 0, // +5  mov eax, 0
    0x85, 0xC0, // +10 test eax, eax
    0x75, 0x0E, // +12 jnz +28
    0xC6, 0x05, 0xF1, 0xFF, 0xFF, 0xFF, 0x3C, // +14 mov byte [rip-15], 60
    0xBF, 0x2A, 0, 0, 0, // +21 mov edi, 42
    0xEB, 0xE9, // +26 jmp +5
    0x0F, 0x05, // +28 syscall
];

// mov ecx, N; 1: lock inc qword [rbx]; dec ecx; jnz 1b; mov eax, 60; xor edi, edi; syscall
fn lock_inc_loop(n: u32) -> Vec<u8> {
    let mut code = vec![0xB9];
    code.extend_from_slice(&n.to_le_bytes());
    code.extend_from_slice(&[
        0xF0, 0x48, 0xFF, 0x03, //
        0xFF, 0xC9, //
        0x75, 0xF8, //
        0xB8, 0x3C, 0, 0, 0, //
        0x31, 0xFF, //
        0x0F, 0x05,
    ]);
    code
}

// jmp $
const SPIN: [u8; 2] = [0xEB, 0xFE];

// xor ecx, ecx; div ecx
const DIV_ZERO: [u8; 4] = [0x31, 0xC9, 0xF7, 0xF1];

fn configs() -> [(&'static str, EmulatorConfig); 3] {
    let base = EmulatorConfig::default();
    [
        (
            "interpreter",
            EmulatorConfig {
                core: CoreConfig::interpreter_only(),
                ..base
            },
        ),
        ("decode_cache", base),
        (
            "translator",
            EmulatorConfig {
                core: CoreConfig::default().with_translator(1),
                ..base
            },
        ),
    ]
}

#[test]
fn static_binary_exits_with_its_status() -> Result<()> {
    init_tracing();
    let out = Captured::new();
    let (process, loaded) = GuestProcess::spawn_elf(
        &static_elf(&EXIT_7),
        &LoadOptions::default(),
        EmulatorConfig::default(),
        capturing_bridge(&out),
    )?;
    assert_eq!(loaded.entry, ENTRY);

    let exit = process.wait()?;
    assert_eq!(exit.status, 7);
    assert_eq!(exit.threads.len(), 1);
    assert_eq!(exit.threads[0].reason, HaltReason::Exited(7));
    assert_eq!(exit.threads[0].retired, 3);
    assert_eq!(exit.threads[0].regs.rip, ENTRY + EXIT_7.len() as u64);
    Ok(())
}

#[test]
fn hello_world_is_written_to_stdout() -> Result<()> {
    init_tracing();
    let out = Captured::new();
    let (process, _) = GuestProcess::spawn_elf(
        &static_elf(&HELLO),
        &LoadOptions::default(),
        EmulatorConfig::default(),
        capturing_bridge(&out),
    )?;
    let exit = process.wait()?;
    assert_eq!(out.to_string_lossy(), "hello\n");
    // The program exits with write's return value.
    assert_eq!(exit.status, 6);
    Ok(())
}

#[test]
fn self_modifying_code_is_observed_in_every_mode() -> Result<()> {
    init_tracing();
    for (name, cfg) in configs() {
        let out = Captured::new();
        let (process, _) = GuestProcess::spawn_elf(
            &static_elf(&SELF_PATCH),
            &LoadOptions::default(),
            cfg,
            capturing_bridge(&out),
        )?;
        let exit = process.wait()?;
        assert_eq!(exit.status, 42, "{name}");
    }
    Ok(())
}

#[test]
fn concurrent_lock_inc_loses_no_updates() -> Result<()> {
    init_tracing();
    const N: u32 = 10_000;
    for (name, cfg) in configs() {
        let space = flat_space(&lock_inc_loop(N));
        let bridge = Arc::new(LinuxBridge::new(0x1000_0000).with_stdout(OutputStream::Null));
        let mut process = GuestProcess::new(space.clone(), bridge, cfg);
        for _ in 0..2 {
            let mut regs = regs_at(CODE);
            regs.gpr[gpr::RBX] = DATA;
            process.spawn_thread(regs)?;
        }
        let exit = process.wait()?;
        assert_eq!(exit.status, 0, "{name}");
        assert!(exit
            .threads
            .iter()
            .all(|t| t.reason == HaltReason::Exited(0)));
        assert_eq!(space.read_u64(DATA)?, 2 * N as u64, "{name}");
    }
    Ok(())
}

#[test]
fn exit_group_stops_every_thread() -> Result<()> {
    init_tracing();
    // exit_group(3) lives after the spinner.
    let mut code = SPIN.to_vec();
    code.extend_from_slice(&[0xB8, 0xE7, 0, 0, 0, 0xBF, 0x03, 0, 0, 0, 0x0F, 0x05]);
    let space = flat_space(&code);
    let cfg = EmulatorConfig {
        batch_size: 1_000,
        ..EmulatorConfig::default()
    };
    let mut process = GuestProcess::new(space, Arc::new(LinuxBridge::new(0x1000_0000)), cfg);
    let spinner = process.spawn_thread(regs_at(CODE))?;
    let exiter = process.spawn_thread(regs_at(CODE + 2))?;

    let exit = process.wait()?;
    assert_eq!(exit.status, 3);
    assert_eq!(exit.threads[0].tid, spinner);
    assert_eq!(exit.threads[0].reason, HaltReason::Killed);
    assert_eq!(exit.threads[1].tid, exiter);
    assert_eq!(exit.threads[1].reason, HaltReason::Exited(3));
    Ok(())
}

#[test]
fn host_can_end_the_process() -> Result<()> {
    init_tracing();
    let space = flat_space(&SPIN);
    let cfg = EmulatorConfig {
        batch_size: 1_000,
        ..EmulatorConfig::default()
    };
    let mut process = GuestProcess::new(space, Arc::new(LinuxBridge::new(0x1000_0000)), cfg);
    process.spawn_thread(regs_at(CODE))?;
    process.exit_group(9);
    let exit = process.wait()?;
    assert_eq!(exit.status, 9);
    assert_eq!(exit.threads[0].reason, HaltReason::Killed);
    Ok(())
}

#[test]
fn unhandled_fault_halts_only_the_faulting_thread() -> Result<()> {
    init_tracing();
    // +0: div by zero. +4: count down from 50000, then exit_group(5).
    let mut code = DIV_ZERO.to_vec();
    code.extend_from_slice(&[
        0xB9, 0x50, 0xC3, 0, 0, // mov ecx, 50000
        0xFF, 0xC9, // dec ecx
        0x75, 0xFC, // jnz -4
        0xB8, 0xE7, 0, 0, 0, // mov eax, 231
        0xBF, 0x05, 0, 0, 0, // mov edi, 5
        0x0F, 0x05,
    ]);
    let space = flat_space(&code);
    let mut process = GuestProcess::new(
        space,
        Arc::new(LinuxBridge::new(0x1000_0000)),
        EmulatorConfig::default(),
    );
    process.spawn_thread(regs_at(CODE))?;
    process.spawn_thread(regs_at(CODE + 4))?;

    let exit = process.wait()?;
    assert_eq!(exit.status, 5);
    assert_eq!(
        exit.threads[0].reason,
        HaltReason::Fault {
            kind: FaultKind::Arithmetic(ArithmeticTrap::DivideByZero),
            addr: CODE + 2,
        }
    );
    assert_eq!(exit.threads[0].status(), Some(128 + 8));
    assert_eq!(exit.threads[1].reason, HaltReason::Exited(5));
    Ok(())
}

#[test]
fn kill_policy_takes_the_process_down() -> Result<()> {
    init_tracing();
    let mut code = DIV_ZERO.to_vec();
    code.extend_from_slice(&SPIN);
    let space = flat_space(&code);
    let cfg = EmulatorConfig {
        batch_size: 1_000,
        fault_policy: FaultPolicy::KillProcess,
        ..EmulatorConfig::default()
    };
    let mut process = GuestProcess::new(space, Arc::new(LinuxBridge::new(0x1000_0000)), cfg);
    process.spawn_thread(regs_at(CODE + 4))?;
    process.spawn_thread(regs_at(CODE))?;

    let exit = process.wait()?;
    assert_eq!(exit.status, 128 + 8);
    assert_eq!(exit.threads[0].reason, HaltReason::Killed);
    assert!(matches!(exit.threads[1].reason, HaltReason::Fault { .. }));
    Ok(())
}

#[test]
fn undecodable_instruction_ends_the_thread_with_sigill_status() -> Result<()> {
    init_tracing();
    // 0x06 (push es) does not exist in 64-bit mode.
    let space = flat_space(&[0x90, 0x06]);
    let mut process = GuestProcess::new(
        space,
        Arc::new(LinuxBridge::new(0x1000_0000)),
        EmulatorConfig::default(),
    );
    process.spawn_thread(regs_at(CODE))?;
    let exit = process.wait()?;
    assert_eq!(exit.status, 128 + 4);
    match &exit.threads[0].reason {
        HaltReason::Decode { addr, bytes, .. } => {
            assert_eq!(*addr, CODE + 1);
            assert_eq!(bytes.first(), Some(&0x06));
        }
        other => panic!("unexpected halt {other:?}"),
    }
    Ok(())
}

/// `tgkill(getpid(), gettid(), SIGABRT)`, then `exit(0)` should it return.
const ABORT: [u8; 42] = [
    0xB8, 0x27, 0, 0, 0, 0x0F, 0x05, // mov eax, 39; syscall
    0x89, 0xC7, // mov edi, eax
    0xB8, 0xBA, 0, 0, 0, 0x0F, 0x05, // mov eax, 186; syscall
    0x89, 0xC6, // mov esi, eax
    0xBA, 0x06, 0, 0, 0, // mov edx, 6
    0xB8, 0xEA, 0, 0, 0, 0x0F, 0x05, // mov eax, 234; syscall
    0xB8, 0x3C, 0, 0, 0, 0x31, 0xFF, 0x0F, 0x05, // exit(0)
    0x90, 0x90, 0x90,
];

#[test]
fn abort_through_tgkill_reports_the_signal_status() -> Result<()> {
    init_tracing();
    let out = Captured::new();
    let (process, _) = GuestProcess::spawn_elf(
        &static_elf(&ABORT),
        &LoadOptions::default(),
        EmulatorConfig::default(),
        capturing_bridge(&out),
    )?;
    let exit = process.wait()?;
    assert_eq!(exit.status, 128 + 6);
    assert_eq!(exit.threads[0].reason, HaltReason::Exited(128 + 6));
    Ok(())
}

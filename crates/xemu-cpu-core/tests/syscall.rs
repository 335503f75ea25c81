mod common;

use common::*;
use xemu_cpu_core::{gpr, HaltReason, SchedulingError, StepResult, SyscallArgs, SyscallReturn};

// mov eax, 60; mov edi, 7; syscall
const EXIT_7: [u8; 12] = [
    0xB8, 0x3C, 0x00, 0x00, 0x00, //
    0xBF, 0x07, 0x00, 0x00, 0x00, //
    0x0F, 0x05,
];

#[test]
fn syscall_stops_the_run_with_its_arguments() {
    let mut g = guest(&EXIT_7);
    g.ctx.regs.gpr[gpr::R10] = 4;
    let exit = g.run(100);
    assert_eq!(exit.executed, 3);
    let StepResult::SyscallRequested(SyscallArgs { number, args }) = exit.result else {
        panic!("expected a syscall, got {:?}", exit.result);
    };
    assert_eq!(number, 60);
    assert_eq!(args[0], 7);
    assert_eq!(args[3], 4);

    assert_eq!(g.ctx.regs.rip, CODE + 12);
    assert_eq!(g.ctx.regs.gpr[gpr::RCX], CODE + 12);
    assert_eq!(g.ctx.regs.gpr[gpr::R11], g.ctx.regs.flags());
}

#[test]
fn completing_a_syscall_sets_rax() {
    let mut g = guest(&EXIT_7);
    g.run(100);
    g.ctx.complete_syscall(SyscallReturn::err(38)).unwrap();
    assert_eq!(g.ctx.regs.gpr[gpr::RAX] as i64, -38);
    g.ctx.complete_syscall(SyscallReturn::ok(5)).unwrap();
    assert_eq!(g.ctx.regs.gpr[gpr::RAX], 5);
}

#[test]
fn halted_threads_reject_syscall_completion() {
    let mut g = guest(&EXIT_7);
    g.run(100);
    g.ctx.halt(HaltReason::Exited(7)).unwrap();
    assert_eq!(
        g.ctx.complete_syscall(SyscallReturn::ok(0)),
        Err(SchedulingError::ThreadAlreadyHalted)
    );
    assert_eq!(g.ctx.halt_reason(), Some(&HaltReason::Exited(7)));
}

#[test]
fn run_budget_is_respected() {
    // jmp $
    let mut g = guest(&[0xEB, 0xFE]);
    let exit = g.run(1000);
    assert_eq!(exit.executed, 1000);
    assert_eq!(exit.result, StepResult::Completed);
    assert_eq!(g.ctx.retired(), 1000);
    assert_eq!(g.ctx.regs.rip, CODE);
}

use super::alu::cond_holds;
use super::{operand, DispatchTable, ExecOutcome, Machine};
use crate::fault::FaultKind;
use crate::state::{gpr, RFlags};
use xemu_decoder::{InstructionDescriptor, Mnemonic, Operand};

pub(super) fn register(table: &mut DispatchTable) {
    use Mnemonic::*;
    table.set(Jmp, exec_jmp);
    for m in [
        Jo, Jno, Jb, Jae, Je, Jne, Jbe, Ja, Js, Jns, Jp, Jnp, Jl, Jge, Jle, Jg,
    ] {
        table.set(m, exec_jcc);
    }
    table.set(Call, exec_call);
    table.set(Ret, exec_ret);
    table.set(Loop, exec_loop);
    table.set(Loope, exec_loop);
    table.set(Loopne, exec_loop);
    table.set(Jrcxz, exec_jrcxz);
    table.set(Jecxz, exec_jrcxz);
    table.set(Syscall, exec_syscall);
    table.set(Int3, exec_int3);
    table.set(Ud0, exec_ud);
    table.set(Ud1, exec_ud);
    table.set(Ud2, exec_ud);
    for m in [
        Hlt, Cli, Sti, In, Out, Insb, Insw, Insd, Outsb, Outsw, Outsd, Lgdt, Lidt, Lldt, Ltr,
        Invlpg, Rdmsr, Wrmsr, Wbinvd, Invd, Clts,
    ] {
        table.set(m, exec_privileged);
    }
}

/// Branch target: relative forms are pre-resolved, indirect forms read a
/// register or memory operand.
fn target(m: &Machine<'_>, inst: &InstructionDescriptor) -> Result<u64, FaultKind> {
    match operand(inst, 0)? {
        Operand::NearBranch(target) => Ok(target),
        op @ (Operand::Reg(_) | Operand::Mem(_)) => m.read(&op, 8),
        _ => Err(FaultKind::unsupported()),
    }
}

fn exec_jmp(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    Ok(ExecOutcome::Branch(target(m, inst)?))
}

fn exec_jcc(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    if cond_holds(inst.condition(), m.regs.rflags) {
        Ok(ExecOutcome::Branch(target(m, inst)?))
    } else {
        Ok(ExecOutcome::Continue)
    }
}

fn exec_call(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    // Resolve the target first: a faulting indirect load must not push.
    let dest = target(m, inst)?;
    m.push(inst.next_ip(), 8)?;
    Ok(ExecOutcome::Branch(dest))
}

fn exec_ret(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let dest = m.pop(8)?;
    if let Some(Operand::Imm { value, .. }) = inst.operand(0) {
        let rsp = m.gpr(gpr::RSP).wrapping_add(value & 0xffff);
        m.set_gpr(gpr::RSP, rsp);
    }
    Ok(ExecOutcome::Branch(dest))
}

fn exec_loop(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let rcx = m.gpr(gpr::RCX).wrapping_sub(1);
    m.set_gpr(gpr::RCX, rcx);
    let zf = m.regs.rflags.contains(RFlags::ZF);
    let taken = rcx != 0
        && match inst.mnemonic() {
            Mnemonic::Loope => zf,
            Mnemonic::Loopne => !zf,
            _ => true,
        };
    if taken {
        Ok(ExecOutcome::Branch(target(m, inst)?))
    } else {
        Ok(ExecOutcome::Continue)
    }
}

fn exec_jrcxz(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let count = match inst.mnemonic() {
        Mnemonic::Jecxz => m.gpr(gpr::RCX) & 0xffff_ffff,
        _ => m.gpr(gpr::RCX),
    };
    if count == 0 {
        Ok(ExecOutcome::Branch(target(m, inst)?))
    } else {
        Ok(ExecOutcome::Continue)
    }
}

/// SYSCALL saves the return address in RCX and the flags in R11; the host
/// does the rest.
fn exec_syscall(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    m.set_gpr(gpr::RCX, inst.next_ip());
    m.set_gpr(gpr::R11, m.regs.flags());
    Ok(ExecOutcome::Syscall)
}

fn exec_int3(_m: &mut Machine<'_>, _inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    Err(FaultKind::Breakpoint)
}

fn exec_ud(_m: &mut Machine<'_>, _inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    Err(FaultKind::UndefinedInstruction)
}

fn exec_privileged(_m: &mut Machine<'_>, _inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    Err(FaultKind::Privileged)
}

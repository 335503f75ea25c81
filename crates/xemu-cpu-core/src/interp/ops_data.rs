use super::alu::{cond_holds, mask_for_size, sign_extend};
use super::{operand, width, DispatchTable, ExecOutcome, Machine};
use crate::fault::FaultKind;
use crate::state::{gpr, RFlags};
use std::sync::atomic::{fence, Ordering};
use xemu_decoder::{InstructionDescriptor, Mnemonic, Operand};

pub(super) fn register(table: &mut DispatchTable) {
    use Mnemonic::*;
    table.set(Mov, exec_mov);
    table.set(Movzx, exec_movzx);
    table.set(Movsx, exec_movsx);
    table.set(Movsxd, exec_movsx);
    table.set(Lea, exec_lea);
    table.set(Push, exec_push);
    table.set(Pop, exec_pop);
    table.set(Leave, exec_leave);
    for m in [
        Cmovo, Cmovno, Cmovb, Cmovae, Cmove, Cmovne, Cmovbe, Cmova, Cmovs, Cmovns, Cmovp, Cmovnp,
        Cmovl, Cmovge, Cmovle, Cmovg,
    ] {
        table.set(m, exec_cmovcc);
    }
    for m in [
        Seto, Setno, Setb, Setae, Sete, Setne, Setbe, Seta, Sets, Setns, Setp, Setnp, Setl, Setge,
        Setle, Setg,
    ] {
        table.set(m, exec_setcc);
    }
    table.set(Cbw, exec_widen_acc);
    table.set(Cwde, exec_widen_acc);
    table.set(Cdqe, exec_widen_acc);
    table.set(Cwd, exec_widen_into_rdx);
    table.set(Cdq, exec_widen_into_rdx);
    table.set(Cqo, exec_widen_into_rdx);
    table.set(Lahf, exec_lahf);
    table.set(Sahf, exec_sahf);
    table.set(Pushf, exec_pushf);
    table.set(Pushfq, exec_pushf);
    table.set(Popf, exec_popf);
    table.set(Popfq, exec_popf);
    table.set(Clc, exec_flag_op);
    table.set(Stc, exec_flag_op);
    table.set(Cmc, exec_flag_op);
    table.set(Cld, exec_flag_op);
    table.set(Std, exec_flag_op);
    for m in [
        Nop,
        Endbr64,
        Endbr32,
        Pause,
        Prefetchnta,
        Prefetcht0,
        Prefetcht1,
        Prefetcht2,
        Prefetchw,
    ] {
        table.set(m, exec_nop);
    }
    table.set(Lfence, exec_fence);
    table.set(Mfence, exec_fence);
    table.set(Sfence, exec_fence);
    table.set(Cpuid, exec_cpuid);
    table.set(Rdtsc, exec_rdtsc);
}

fn exec_mov(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let size = width(&dst)?;
    let value = m.read(&operand(inst, 1)?, size)?;
    m.write(&dst, size, value)?;
    Ok(ExecOutcome::Continue)
}

fn exec_movzx(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let src = operand(inst, 1)?;
    let src_size = width(&src)?;
    let value = m.read(&src, src_size)? & mask_for_size(src_size);
    m.write(&dst, width(&dst)?, value)?;
    Ok(ExecOutcome::Continue)
}

fn exec_movsx(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let src = operand(inst, 1)?;
    let src_size = width(&src)?;
    let size = width(&dst)?;
    let value = sign_extend(m.read(&src, src_size)?, src_size) & mask_for_size(size);
    m.write(&dst, size, value)?;
    Ok(ExecOutcome::Continue)
}

fn exec_lea(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let Operand::Mem(mem) = operand(inst, 1)? else {
        return Err(FaultKind::invalid());
    };
    let addr = m.offset(&mem)?;
    m.write(&dst, width(&dst)?, addr)?;
    Ok(ExecOutcome::Continue)
}

fn stack_size(inst: &InstructionDescriptor) -> Result<usize, FaultKind> {
    match inst.stack_pointer_increment().unsigned_abs() {
        size @ (2 | 8) => Ok(size as usize),
        _ => Err(FaultKind::unsupported()),
    }
}

fn exec_push(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let size = stack_size(inst)?;
    let value = m.read(&operand(inst, 0)?, size)?;
    m.push(value, size)?;
    Ok(ExecOutcome::Continue)
}

fn exec_pop(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let size = stack_size(inst)?;
    let dst = operand(inst, 0)?;
    // A memory destination is addressed with the already-incremented RSP.
    let value = m.pop(size)?;
    m.write(&dst, size, value)?;
    Ok(ExecOutcome::Continue)
}

fn exec_leave(m: &mut Machine<'_>, _inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    m.set_gpr(gpr::RSP, m.gpr(gpr::RBP));
    let rbp = m.pop(8)?;
    m.set_gpr(gpr::RBP, rbp);
    Ok(ExecOutcome::Continue)
}

fn exec_cmovcc(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let size = width(&dst)?;
    // The source is read (and may fault) whether or not the move happens.
    let value = m.read(&operand(inst, 1)?, size)?;
    if cond_holds(inst.condition(), m.regs.rflags) {
        m.write(&dst, size, value)?;
    } else if size == 4 {
        // A 32-bit destination is zero-extended even when nothing moves.
        let current = m.read(&dst, size)?;
        m.write(&dst, size, current)?;
    }
    Ok(ExecOutcome::Continue)
}

fn exec_setcc(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let value = cond_holds(inst.condition(), m.regs.rflags) as u64;
    m.write(&operand(inst, 0)?, 1, value)?;
    Ok(ExecOutcome::Continue)
}

/// CBW/CWDE/CDQE: sign-extend the lower half of the accumulator in place.
fn exec_widen_acc(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let size = match inst.mnemonic() {
        Mnemonic::Cbw => 2,
        Mnemonic::Cwde => 4,
        _ => 8,
    };
    let value = sign_extend(m.gpr(gpr::RAX), size / 2);
    m.set_gpr_sized(gpr::RAX, size, value);
    Ok(ExecOutcome::Continue)
}

/// CWD/CDQ/CQO: fill rDX with the accumulator's sign.
fn exec_widen_into_rdx(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let size = match inst.mnemonic() {
        Mnemonic::Cwd => 2,
        Mnemonic::Cdq => 4,
        _ => 8,
    };
    let negative = sign_extend(m.gpr(gpr::RAX), size) >> 63 != 0;
    m.set_gpr_sized(gpr::RDX, size, if negative { u64::MAX } else { 0 });
    Ok(ExecOutcome::Continue)
}

const LAHF_MASK: u64 = 0xd5;

fn exec_lahf(m: &mut Machine<'_>, _inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let ah = (m.regs.flags() & LAHF_MASK) | RFlags::FIXED.bits();
    let rax = m.gpr(gpr::RAX);
    m.set_gpr(gpr::RAX, (rax & !0xff00) | (ah << 8));
    Ok(ExecOutcome::Continue)
}

fn exec_sahf(m: &mut Machine<'_>, _inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let ah = (m.gpr(gpr::RAX) >> 8) & LAHF_MASK;
    let bits = (m.regs.rflags.bits() & !LAHF_MASK) | ah;
    m.regs.rflags = RFlags::from_bits_retain(bits);
    Ok(ExecOutcome::Continue)
}

fn exec_pushf(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let size = stack_size(inst)?;
    let flags = m.regs.flags();
    m.push(flags, size)?;
    Ok(ExecOutcome::Continue)
}

/// POPF at CPL 3: IF, IOPL and the system bits silently keep their value.
fn exec_popf(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let size = stack_size(inst)?;
    let popped = m.pop(size)?;
    let mut writable = RFlags::USER_WRITABLE.bits();
    if size == 2 {
        writable &= 0xffff;
    }
    let bits = (m.regs.rflags.bits() & !writable) | (popped & writable) | RFlags::FIXED.bits();
    m.regs.rflags = RFlags::from_bits_retain(bits);
    Ok(ExecOutcome::Continue)
}

fn exec_flag_op(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let flags = m.flags();
    match inst.mnemonic() {
        Mnemonic::Clc => flags.remove(RFlags::CF),
        Mnemonic::Stc => flags.insert(RFlags::CF),
        Mnemonic::Cmc => flags.toggle(RFlags::CF),
        Mnemonic::Cld => flags.remove(RFlags::DF),
        Mnemonic::Std => flags.insert(RFlags::DF),
        _ => return Err(FaultKind::unsupported()),
    }
    Ok(ExecOutcome::Continue)
}

fn exec_nop(_m: &mut Machine<'_>, _inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    Ok(ExecOutcome::Continue)
}

fn exec_fence(_m: &mut Machine<'_>, _inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    fence(Ordering::SeqCst);
    Ok(ExecOutcome::Continue)
}

/// Vendor string reported by leaf 0.
const CPUID_VENDOR: &[u8; 12] = b"XemuXemuXemu";

/// Fixed CPUID table. Only features the interpreter actually implements are
/// advertised, so feature-detecting guests stay on the generic code paths.
fn cpuid(leaf: u32, _subleaf: u32) -> [u32; 4] {
    let word = |i: usize| {
        u32::from_le_bytes([
            CPUID_VENDOR[i],
            CPUID_VENDOR[i + 1],
            CPUID_VENDOR[i + 2],
            CPUID_VENDOR[i + 3],
        ])
    };
    match leaf {
        // Max basic leaf; vendor in EBX, EDX, ECX order.
        0 => [1, word(0), word(8), word(4)],
        1 => {
            let eax = 0x0006_0f00; // family 6
            let ecx = (1 << 13) | (1 << 23); // CMPXCHG16B, POPCNT
            let edx = (1 << 4) | (1 << 8) | (1 << 15) | (1 << 25) | (1 << 26); // TSC, CX8, CMOV, SSE, SSE2
            [eax, 0, ecx, edx]
        }
        0x8000_0000 => [0x8000_0001, 0, 0, 0],
        0x8000_0001 => {
            let ecx = (1 << 0) | (1 << 5); // LAHF/SAHF in long mode, LZCNT
            let edx = (1 << 11) | (1 << 29); // SYSCALL, long mode
            [0, 0, ecx, edx]
        }
        _ => [0; 4],
    }
}

fn exec_cpuid(m: &mut Machine<'_>, _inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let [a, b, c, d] = cpuid(m.gpr(gpr::RAX) as u32, m.gpr(gpr::RCX) as u32);
    m.set_gpr(gpr::RAX, a as u64);
    m.set_gpr(gpr::RBX, b as u64);
    m.set_gpr(gpr::RCX, c as u64);
    m.set_gpr(gpr::RDX, d as u64);
    Ok(ExecOutcome::Continue)
}

/// The time-stamp counter is the thread's retired-instruction count, which
/// keeps runs reproducible.
fn exec_rdtsc(m: &mut Machine<'_>, _inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let tsc = m.retired;
    m.set_gpr(gpr::RAX, tsc & 0xffff_ffff);
    m.set_gpr(gpr::RDX, tsc >> 32);
    Ok(ExecOutcome::Continue)
}

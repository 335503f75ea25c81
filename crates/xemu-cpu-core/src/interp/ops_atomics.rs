//! `lock`-prefixed read-modify-write and the implicitly atomic exchanges.
//!
//! Every memory RMW here goes through [`AddressSpace::atomic_rmw`], which
//! holds the frame write locks for the whole read-compute-write sequence, so
//! concurrent guest threads observe each operation as indivisible even when it
//! straddles a page boundary.
//!
//! [`AddressSpace::atomic_rmw`]: xemu_mem::AddressSpace::atomic_rmw

use super::alu::{add_with_flags, inc_dec_with_flags, mask_for_size, neg_with_flags, sub_with_flags, AluOp};
use super::ops_bit::{locate_bit, BitOp};
use super::{operand, width, DispatchTable, ExecOutcome, Machine};
use crate::fault::FaultKind;
use crate::state::{gpr, RFlags};
use xemu_decoder::{InstructionDescriptor, Mnemonic, Operand};

pub(super) fn register(table: &mut DispatchTable) {
    table.set(Mnemonic::Xchg, exec_xchg);
    table.set(Mnemonic::Xadd, exec_xadd);
    table.set(Mnemonic::Cmpxchg, exec_cmpxchg);
    table.set(Mnemonic::Cmpxchg8b, exec_cmpxchg8b);
    table.set(Mnemonic::Cmpxchg16b, exec_cmpxchg16b);
}

pub(super) fn mnemonic_allows_lock_prefix(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Add
            | Mnemonic::Adc
            | Mnemonic::And
            | Mnemonic::Btc
            | Mnemonic::Btr
            | Mnemonic::Bts
            | Mnemonic::Cmpxchg
            | Mnemonic::Cmpxchg8b
            | Mnemonic::Cmpxchg16b
            | Mnemonic::Dec
            | Mnemonic::Inc
            | Mnemonic::Neg
            | Mnemonic::Not
            | Mnemonic::Or
            | Mnemonic::Sbb
            | Mnemonic::Sub
            | Mnemonic::Xadd
            | Mnemonic::Xchg
            | Mnemonic::Xor
    )
}

/// Atomic RMW of a 1/2/4/8-byte cell. `f` maps the old value to the new one.
fn atomic_rmw_sized<R>(
    m: &mut Machine<'_>,
    addr: u64,
    size: usize,
    f: impl FnOnce(u64) -> (u64, R),
) -> Result<R, FaultKind> {
    let mut written = None;
    let ret = match size {
        1 => m.mem.atomic_rmw::<u8, R>(addr, |old| {
            let (new, ret) = f(old as u64);
            let new = new as u8;
            if new != old {
                written = Some(new as u64);
            }
            (new, ret)
        })?,
        2 => m.mem.atomic_rmw::<u16, R>(addr, |old| {
            let (new, ret) = f(old as u64);
            let new = new as u16;
            if new != old {
                written = Some(new as u64);
            }
            (new, ret)
        })?,
        4 => m.mem.atomic_rmw::<u32, R>(addr, |old| {
            let (new, ret) = f(old as u64);
            let new = new as u32;
            if new != old {
                written = Some(new as u64);
            }
            (new, ret)
        })?,
        8 => m.mem.atomic_rmw::<u64, R>(addr, |old| {
            let (new, ret) = f(old);
            if new != old {
                written = Some(new);
            }
            (new, ret)
        })?,
        _ => return Err(FaultKind::unsupported()),
    };
    if let Some(value) = written {
        m.record_store(addr, &value.to_le_bytes()[..size]);
    }
    Ok(ret)
}

/// Handler used for every instruction that carries a valid `lock` prefix.
pub(super) fn exec_locked(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let Operand::Mem(mem) = dst else {
        return Err(FaultKind::invalid());
    };
    let mnemonic = inst.mnemonic();
    let flags = m.regs.rflags;

    let alu = match mnemonic {
        Mnemonic::Add => Some(AluOp::Add),
        Mnemonic::Adc => Some(AluOp::Adc),
        Mnemonic::Sub => Some(AluOp::Sub),
        Mnemonic::Sbb => Some(AluOp::Sbb),
        Mnemonic::And => Some(AluOp::And),
        Mnemonic::Or => Some(AluOp::Or),
        Mnemonic::Xor => Some(AluOp::Xor),
        _ => None,
    };
    if let Some(op) = alu {
        let size = width(&dst)?;
        let rhs = m.read(&operand(inst, 1)?, size)?;
        let addr = m.linear(&mem)?;
        let updated = atomic_rmw_sized(m, addr, size, |old| {
            let mut f = flags;
            (op.apply(&mut f, old, rhs, size), f)
        })?;
        m.regs.rflags = updated;
        return Ok(ExecOutcome::Continue);
    }

    match mnemonic {
        Mnemonic::Inc | Mnemonic::Dec | Mnemonic::Neg | Mnemonic::Not => {
            let size = width(&dst)?;
            let addr = m.linear(&mem)?;
            let updated = atomic_rmw_sized(m, addr, size, |old| {
                let mut f = flags;
                let new = match mnemonic {
                    Mnemonic::Inc => inc_dec_with_flags(&mut f, old, false, size),
                    Mnemonic::Dec => inc_dec_with_flags(&mut f, old, true, size),
                    Mnemonic::Neg => neg_with_flags(&mut f, old, size),
                    _ => !old & mask_for_size(size),
                };
                (new, f)
            })?;
            m.regs.rflags = updated;
            Ok(ExecOutcome::Continue)
        }
        Mnemonic::Bts | Mnemonic::Btr | Mnemonic::Btc => {
            let op = BitOp::from_mnemonic(mnemonic).ok_or_else(FaultKind::invalid)?;
            let size = width(&dst)?;
            let (addr, bit) = locate_bit(m, &dst, &operand(inst, 1)?, size)?;
            let addr = addr.ok_or_else(FaultKind::invalid)?;
            let updated = atomic_rmw_sized(m, addr, size, |old| {
                let mut f = flags;
                (op.apply(&mut f, old, bit), f)
            })?;
            m.regs.rflags = updated;
            Ok(ExecOutcome::Continue)
        }
        Mnemonic::Xchg => exec_xchg(m, inst),
        Mnemonic::Xadd => exec_xadd(m, inst),
        Mnemonic::Cmpxchg => exec_cmpxchg(m, inst),
        Mnemonic::Cmpxchg8b => exec_cmpxchg8b(m, inst),
        Mnemonic::Cmpxchg16b => exec_cmpxchg16b(m, inst),
        _ => Err(FaultKind::invalid()),
    }
}

/// XCHG with a memory operand is atomic with or without `lock`.
fn exec_xchg(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let a = operand(inst, 0)?;
    let b = operand(inst, 1)?;
    let size = width(&a)?;
    match (a, b) {
        (Operand::Reg(ra), Operand::Reg(rb)) => {
            let va = m.regs.read_reg(ra)?;
            let vb = m.regs.read_reg(rb)?;
            m.regs.write_reg(ra, vb)?;
            m.regs.write_reg(rb, va)?;
        }
        (Operand::Mem(mem), Operand::Reg(reg)) | (Operand::Reg(reg), Operand::Mem(mem)) => {
            let value = m.regs.read_reg(reg)?;
            let addr = m.linear(&mem)?;
            let old = atomic_rmw_sized(m, addr, size, |old| (value, old))?;
            m.regs.write_reg(reg, old)?;
        }
        _ => return Err(FaultKind::invalid()),
    }
    Ok(ExecOutcome::Continue)
}

fn exec_xadd(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let Operand::Reg(src) = operand(inst, 1)? else {
        return Err(FaultKind::invalid());
    };
    let size = width(&dst)?;
    let addend = m.regs.read_reg(src)?;
    let mut flags = m.regs.rflags;
    let old = match dst {
        Operand::Reg(reg) => {
            let old = m.regs.read_reg(reg)?;
            let sum = add_with_flags(&mut flags, old, addend, false, size);
            m.regs.write_reg(src, old)?;
            m.regs.write_reg(reg, sum)?;
            m.regs.rflags = flags;
            return Ok(ExecOutcome::Continue);
        }
        Operand::Mem(mem) => {
            let addr = m.linear(&mem)?;
            atomic_rmw_sized(m, addr, size, |old| {
                (add_with_flags(&mut flags, old, addend, false, size), old)
            })?
        }
        _ => return Err(FaultKind::invalid()),
    };
    m.regs.write_reg(src, old)?;
    m.regs.rflags = flags;
    Ok(ExecOutcome::Continue)
}

fn exec_cmpxchg(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let Operand::Reg(src) = operand(inst, 1)? else {
        return Err(FaultKind::invalid());
    };
    let size = width(&dst)?;
    let mask = mask_for_size(size);
    let expected = m.gpr(gpr::RAX) & mask;
    let replacement = m.regs.read_reg(src)?;

    let old = match dst {
        Operand::Reg(reg) => {
            let old = m.regs.read_reg(reg)?;
            if old == expected {
                m.regs.write_reg(reg, replacement)?;
            }
            old
        }
        Operand::Mem(mem) => {
            let addr = m.linear(&mem)?;
            atomic_rmw_sized(m, addr, size, |old| {
                let new = if old & mask == expected { replacement } else { old };
                (new, old)
            })?
        }
        _ => return Err(FaultKind::invalid()),
    };

    sub_with_flags(m.flags(), expected, old, false, size);
    if old & mask != expected {
        m.set_gpr_sized(gpr::RAX, size, old);
    }
    Ok(ExecOutcome::Continue)
}

fn exec_cmpxchg8b(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let Operand::Mem(mem) = operand(inst, 0)? else {
        return Err(FaultKind::invalid());
    };
    let lo32 = |v: u64| v & 0xffff_ffff;
    let expected = (lo32(m.gpr(gpr::RDX)) << 32) | lo32(m.gpr(gpr::RAX));
    let replacement = (lo32(m.gpr(gpr::RCX)) << 32) | lo32(m.gpr(gpr::RBX));
    let addr = m.linear(&mem)?;
    let old = atomic_rmw_sized(m, addr, 8, |old| {
        (if old == expected { replacement } else { old }, old)
    })?;
    let equal = old == expected;
    m.flags().set(RFlags::ZF, equal);
    if !equal {
        m.set_gpr(gpr::RAX, lo32(old));
        m.set_gpr(gpr::RDX, old >> 32);
    }
    Ok(ExecOutcome::Continue)
}

/// CMPXCHG16B requires a 16-byte aligned operand.
fn exec_cmpxchg16b(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let Operand::Mem(mem) = operand(inst, 0)? else {
        return Err(FaultKind::invalid());
    };
    let expected = ((m.gpr(gpr::RDX) as u128) << 64) | m.gpr(gpr::RAX) as u128;
    let replacement = ((m.gpr(gpr::RCX) as u128) << 64) | m.gpr(gpr::RBX) as u128;
    let addr = m.linear(&mem)?;
    let old = m.mem.atomic_rmw_aligned::<u128, u128>(addr, 16, |old| {
        (if old == expected { replacement } else { old }, old)
    })?;
    let equal = old == expected;
    if equal {
        m.record_store(addr, &replacement.to_le_bytes());
    }
    m.flags().set(RFlags::ZF, equal);
    if !equal {
        m.set_gpr(gpr::RAX, old as u64);
        m.set_gpr(gpr::RDX, (old >> 64) as u64);
    }
    Ok(ExecOutcome::Continue)
}

use super::alu::{mask_for_size, sign_extend};
use super::{operand, width, DispatchTable, ExecOutcome, Machine};
use crate::fault::FaultKind;
use crate::state::RFlags;
use xemu_decoder::{InstructionDescriptor, Mnemonic, Operand};

pub(super) fn register(table: &mut DispatchTable) {
    table.set(Mnemonic::Bt, exec_bt);
    table.set(Mnemonic::Bts, exec_bts);
    table.set(Mnemonic::Btr, exec_btr);
    table.set(Mnemonic::Btc, exec_btc);
    table.set(Mnemonic::Bsf, exec_bsf);
    table.set(Mnemonic::Bsr, exec_bsr);
    table.set(Mnemonic::Tzcnt, exec_tzcnt);
    table.set(Mnemonic::Lzcnt, exec_lzcnt);
    table.set(Mnemonic::Popcnt, exec_popcnt);
    table.set(Mnemonic::Bswap, exec_bswap);
}

/// Status flags the BT family, TZCNT and LZCNT leave undefined.
const UNDEFINED_AFTER_BIT_OPS: RFlags = RFlags::OF
    .union(RFlags::SF)
    .union(RFlags::AF)
    .union(RFlags::PF);

/// What BTS/BTR/BTC do to the selected bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BitOp {
    Test,
    Set,
    Reset,
    Complement,
}

impl BitOp {
    pub(super) fn from_mnemonic(mnemonic: Mnemonic) -> Option<Self> {
        Some(match mnemonic {
            Mnemonic::Bt => BitOp::Test,
            Mnemonic::Bts => BitOp::Set,
            Mnemonic::Btr => BitOp::Reset,
            Mnemonic::Btc => BitOp::Complement,
            _ => return None,
        })
    }

    /// New operand value; CF receives the old bit, ZF is preserved and the
    /// undefined OF, SF, AF and PF are cleared.
    pub(super) fn apply(self, flags: &mut RFlags, value: u64, bit: u32) -> u64 {
        let mask = 1u64 << bit;
        flags.remove(UNDEFINED_AFTER_BIT_OPS);
        flags.set(RFlags::CF, value & mask != 0);
        match self {
            BitOp::Test => value,
            BitOp::Set => value | mask,
            BitOp::Reset => value & !mask,
            BitOp::Complement => value ^ mask,
        }
    }
}

/// Resolve a BT-family destination to `(memory address, bit index)`.
///
/// With a register bit offset and a memory destination the offset is signed
/// and may select a bit outside the addressed operand (bit-string addressing).
/// Immediate offsets and register destinations wrap modulo the operand width.
pub(super) fn locate_bit(
    m: &Machine<'_>,
    dst: &Operand,
    src: &Operand,
    size: usize,
) -> Result<(Option<u64>, u32), FaultKind> {
    let bits = size as u64 * 8;
    let raw = m.read(src, size)?;
    match (dst, src) {
        (Operand::Mem(mem), Operand::Reg(_)) => {
            let offset = sign_extend(raw, size) as i64;
            let element = offset >> bits.trailing_zeros();
            let addr = m
                .linear(mem)?
                .wrapping_add(element.wrapping_mul(size as i64) as u64);
            Ok((Some(addr), (offset as u64 & (bits - 1)) as u32))
        }
        (Operand::Mem(mem), _) => Ok((Some(m.linear(mem)?), (raw % bits) as u32)),
        _ => Ok((None, (raw % bits) as u32)),
    }
}

fn bit_op(m: &mut Machine<'_>, inst: &InstructionDescriptor, op: BitOp) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let src = operand(inst, 1)?;
    let size = width(&dst)?;
    let (addr, bit) = locate_bit(m, &dst, &src, size)?;
    match (addr, dst) {
        (Some(addr), _) => {
            let old = m.load(addr, size)?;
            let new = op.apply(m.flags(), old, bit);
            if op != BitOp::Test {
                m.store(addr, size, new)?;
            }
        }
        (None, Operand::Reg(reg)) => {
            let old = m.regs.read_reg(reg)?;
            let new = op.apply(m.flags(), old, bit);
            if op != BitOp::Test {
                m.regs.write_reg(reg, new)?;
            }
        }
        _ => return Err(FaultKind::invalid()),
    }
    Ok(ExecOutcome::Continue)
}

fn exec_bt(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    bit_op(m, inst, BitOp::Test)
}

fn exec_bts(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    bit_op(m, inst, BitOp::Set)
}

fn exec_btr(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    bit_op(m, inst, BitOp::Reset)
}

fn exec_btc(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    bit_op(m, inst, BitOp::Complement)
}

/// BSF/BSR: a zero source sets ZF and leaves the destination alone. The
/// other status flags are undefined and come out cleared.
fn bit_scan(m: &mut Machine<'_>, inst: &InstructionDescriptor, forward: bool) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let size = width(&dst)?;
    let src = m.read(&operand(inst, 1)?, size)? & mask_for_size(size);
    m.flags().remove(RFlags::STATUS);
    if src == 0 {
        m.flags().insert(RFlags::ZF);
        return Ok(ExecOutcome::Continue);
    }
    let index = if forward {
        src.trailing_zeros()
    } else {
        63 - src.leading_zeros()
    };
    m.write(&dst, size, index as u64)?;
    Ok(ExecOutcome::Continue)
}

fn exec_bsf(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    bit_scan(m, inst, true)
}

fn exec_bsr(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    bit_scan(m, inst, false)
}

fn count_op(
    m: &mut Machine<'_>,
    inst: &InstructionDescriptor,
    count: impl FnOnce(u64, u32) -> u32,
    flags: impl FnOnce(&mut RFlags, u64, u32),
) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let size = width(&dst)?;
    let src = m.read(&operand(inst, 1)?, size)? & mask_for_size(size);
    let result = count(src, size as u32 * 8);
    m.write(&dst, size, result as u64)?;
    flags(m.flags(), src, result);
    Ok(ExecOutcome::Continue)
}

fn exec_tzcnt(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    count_op(
        m,
        inst,
        |src, bits| if src == 0 { bits } else { src.trailing_zeros() },
        |f, src, result| {
            f.remove(UNDEFINED_AFTER_BIT_OPS);
            f.set(RFlags::CF, src == 0);
            f.set(RFlags::ZF, result == 0);
        },
    )
}

fn exec_lzcnt(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    count_op(
        m,
        inst,
        |src, bits| src.leading_zeros() - (64 - bits),
        |f, src, result| {
            f.remove(UNDEFINED_AFTER_BIT_OPS);
            f.set(RFlags::CF, src == 0);
            f.set(RFlags::ZF, result == 0);
        },
    )
}

fn exec_popcnt(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    count_op(
        m,
        inst,
        |src, _| src.count_ones(),
        |f, src, _| {
            f.remove(RFlags::STATUS);
            f.set(RFlags::ZF, src == 0);
        },
    )
}

fn exec_bswap(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let value = m.read(&dst, 8)?;
    let swapped = match width(&dst)? {
        4 => (value as u32).swap_bytes() as u64,
        8 => value.swap_bytes(),
        _ => return Err(FaultKind::unsupported()),
    };
    m.write(&dst, 8, swapped)?;
    Ok(ExecOutcome::Continue)
}

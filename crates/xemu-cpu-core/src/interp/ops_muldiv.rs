use super::alu::{mask_for_size, set_result_flags, sign_extend};
use super::{operand, width, DispatchTable, ExecOutcome, Machine};
use crate::fault::{ArithmeticTrap, FaultKind};
use crate::state::{gpr, RFlags};
use xemu_decoder::{InstructionDescriptor, Mnemonic};

pub(super) fn register(table: &mut DispatchTable) {
    table.set(Mnemonic::Mul, exec_mul);
    table.set(Mnemonic::Imul, exec_imul);
    table.set(Mnemonic::Div, exec_div);
    table.set(Mnemonic::Idiv, exec_idiv);
}

/// MUL/IMUL define only CF and OF. The rest are set from the low half of the
/// product (AF cleared) so no stale flag survives.
fn set_mul_flags(flags: &mut RFlags, low: u64, size: usize, overflow: bool) {
    flags.set(RFlags::CF, overflow);
    flags.set(RFlags::OF, overflow);
    flags.remove(RFlags::AF);
    set_result_flags(flags, low & mask_for_size(size), size);
}

/// Low half of the implicit accumulator pair for `size`.
fn acc(m: &Machine<'_>, size: usize) -> u64 {
    m.gpr(gpr::RAX) & mask_for_size(size)
}

/// Store a double-width result into AX (8-bit) or rDX:rAX.
fn write_pair(m: &mut Machine<'_>, size: usize, low: u64, high: u64) {
    if size == 1 {
        let ax = (low & 0xff) | ((high & 0xff) << 8);
        m.set_gpr_sized(gpr::RAX, 2, ax);
    } else {
        m.set_gpr_sized(gpr::RAX, size, low);
        m.set_gpr_sized(gpr::RDX, size, high);
    }
}

fn exec_mul(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let src = operand(inst, 0)?;
    let size = width(&src)?;
    let bits = size as u32 * 8;
    let rhs = m.read(&src, size)? & mask_for_size(size);
    let product = (acc(m, size) as u128) * (rhs as u128);
    let low = (product as u64) & mask_for_size(size);
    let high = ((product >> bits) as u64) & mask_for_size(size);
    write_pair(m, size, low, high);
    set_mul_flags(m.flags(), low, size, high != 0);
    Ok(ExecOutcome::Continue)
}

fn signed(value: u64, size: usize) -> i128 {
    sign_extend(value, size) as i64 as i128
}

fn exec_imul(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    match inst.op_count() {
        1 => {
            let src = operand(inst, 0)?;
            let size = width(&src)?;
            let bits = size as u32 * 8;
            let rhs = m.read(&src, size)?;
            let product = signed(acc(m, size), size) * signed(rhs, size);
            let low = (product as u64) & mask_for_size(size);
            let high = ((product >> bits) as u64) & mask_for_size(size);
            write_pair(m, size, low, high);
            let overflow = signed(low, size) != product;
            set_mul_flags(m.flags(), low, size, overflow);
        }
        2 | 3 => {
            let dst = operand(inst, 0)?;
            let size = width(&dst)?;
            let (a, b) = if inst.op_count() == 2 {
                (m.read(&dst, size)?, m.read(&operand(inst, 1)?, size)?)
            } else {
                (
                    m.read(&operand(inst, 1)?, size)?,
                    m.read(&operand(inst, 2)?, size)?,
                )
            };
            let product = signed(a, size) * signed(b, size);
            let low = (product as u64) & mask_for_size(size);
            let overflow = signed(low, size) != product;
            m.write(&dst, size, low)?;
            set_mul_flags(m.flags(), low, size, overflow);
        }
        _ => return Err(FaultKind::unsupported()),
    }
    Ok(ExecOutcome::Continue)
}

/// Dividend for `size`: AX for byte division, rDX:rAX otherwise.
fn dividend(m: &Machine<'_>, size: usize) -> u128 {
    if size == 1 {
        (m.gpr(gpr::RAX) & 0xffff) as u128
    } else {
        let bits = size as u32 * 8;
        let mask = mask_for_size(size) as u128;
        ((m.gpr(gpr::RDX) as u128 & mask) << bits) | (m.gpr(gpr::RAX) as u128 & mask)
    }
}

/// Flags are architecturally undefined after DIV/IDIV; all six status flags
/// are cleared.
fn exec_div(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let src = operand(inst, 0)?;
    let size = width(&src)?;
    let divisor = (m.read(&src, size)? & mask_for_size(size)) as u128;
    if divisor == 0 {
        return Err(ArithmeticTrap::DivideByZero.into());
    }
    let n = dividend(m, size);
    let quotient = n / divisor;
    let remainder = n % divisor;
    if quotient > mask_for_size(size) as u128 {
        return Err(ArithmeticTrap::Overflow.into());
    }
    write_pair(m, size, quotient as u64, remainder as u64);
    m.flags().remove(RFlags::STATUS);
    Ok(ExecOutcome::Continue)
}

fn exec_idiv(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let src = operand(inst, 0)?;
    let size = width(&src)?;
    let divisor = signed(m.read(&src, size)?, size);
    if divisor == 0 {
        return Err(ArithmeticTrap::DivideByZero.into());
    }
    let shift = 128 - 2 * (size as u32 * 8);
    let n = ((dividend(m, size) << shift) as i128) >> shift;
    // i128::MIN / -1 is the only quotient i128 itself cannot hold.
    let (quotient, remainder) = match (n.checked_div(divisor), n.checked_rem(divisor)) {
        (Some(q), Some(r)) => (q, r),
        _ => return Err(ArithmeticTrap::Overflow.into()),
    };
    let max = (mask_for_size(size) >> 1) as i128;
    if quotient > max || quotient < -max - 1 {
        return Err(ArithmeticTrap::Overflow.into());
    }
    write_pair(m, size, quotient as u64, remainder as u64);
    m.flags().remove(RFlags::STATUS);
    Ok(ExecOutcome::Continue)
}

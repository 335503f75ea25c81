use super::alu::{double_shift_with_flags, shift_count, shift_with_flags, ShiftOp};
use super::{operand, width, DispatchTable, ExecOutcome, Machine};
use crate::fault::FaultKind;
use xemu_decoder::{InstructionDescriptor, Mnemonic};

pub(super) fn register(table: &mut DispatchTable) {
    table.set(Mnemonic::Shl, exec_shl);
    table.set(Mnemonic::Sal, exec_shl);
    table.set(Mnemonic::Shr, exec_shr);
    table.set(Mnemonic::Sar, exec_sar);
    table.set(Mnemonic::Rol, exec_rol);
    table.set(Mnemonic::Ror, exec_ror);
    table.set(Mnemonic::Shld, exec_shld);
    table.set(Mnemonic::Shrd, exec_shrd);
}

fn shift(m: &mut Machine<'_>, inst: &InstructionDescriptor, op: ShiftOp) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let size = width(&dst)?;
    let count = shift_count(m.read(&operand(inst, 1)?, 1)?, size);
    if count == 0 {
        // Nothing changes, not even a 32-bit destination's upper half.
        return Ok(ExecOutcome::Continue);
    }
    m.modify(&dst, size, true, |f, v| shift_with_flags(f, op, v, count, size))?;
    Ok(ExecOutcome::Continue)
}

fn exec_shl(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    shift(m, inst, ShiftOp::Shl)
}

fn exec_shr(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    shift(m, inst, ShiftOp::Shr)
}

fn exec_sar(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    shift(m, inst, ShiftOp::Sar)
}

fn exec_rol(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    shift(m, inst, ShiftOp::Rol)
}

fn exec_ror(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    shift(m, inst, ShiftOp::Ror)
}

fn double_shift(m: &mut Machine<'_>, inst: &InstructionDescriptor, left: bool) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let size = width(&dst)?;
    let src = m.read(&operand(inst, 1)?, size)?;
    let count = shift_count(m.read(&operand(inst, 2)?, 1)?, size);
    if count == 0 {
        return Ok(ExecOutcome::Continue);
    }
    m.modify(&dst, size, true, |f, v| {
        double_shift_with_flags(f, left, v, src, count, size)
    })?;
    Ok(ExecOutcome::Continue)
}

fn exec_shld(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    double_shift(m, inst, true)
}

fn exec_shrd(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    double_shift(m, inst, false)
}

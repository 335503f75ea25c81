use super::alu::{inc_dec_with_flags, neg_with_flags, AluOp};
use super::{operand, width, DispatchTable, ExecOutcome, Machine};
use crate::fault::FaultKind;
use xemu_decoder::{InstructionDescriptor, Mnemonic};

pub(super) fn register(table: &mut DispatchTable) {
    table.set(Mnemonic::Add, exec_add);
    table.set(Mnemonic::Adc, exec_adc);
    table.set(Mnemonic::Sub, exec_sub);
    table.set(Mnemonic::Sbb, exec_sbb);
    table.set(Mnemonic::And, exec_and);
    table.set(Mnemonic::Or, exec_or);
    table.set(Mnemonic::Xor, exec_xor);
    table.set(Mnemonic::Cmp, exec_cmp);
    table.set(Mnemonic::Test, exec_test);
    table.set(Mnemonic::Inc, exec_inc);
    table.set(Mnemonic::Dec, exec_dec);
    table.set(Mnemonic::Neg, exec_neg);
    table.set(Mnemonic::Not, exec_not);
}

fn binary(
    m: &mut Machine<'_>,
    inst: &InstructionDescriptor,
    op: AluOp,
    writeback: bool,
) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let src = operand(inst, 1)?;
    let size = width(&dst)?;
    let rhs = m.read(&src, size)?;
    m.modify(&dst, size, writeback, |f, lhs| op.apply(f, lhs, rhs, size))?;
    Ok(ExecOutcome::Continue)
}

fn exec_add(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    binary(m, inst, AluOp::Add, true)
}

fn exec_adc(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    binary(m, inst, AluOp::Adc, true)
}

fn exec_sub(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    binary(m, inst, AluOp::Sub, true)
}

fn exec_sbb(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    binary(m, inst, AluOp::Sbb, true)
}

fn exec_and(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    binary(m, inst, AluOp::And, true)
}

fn exec_or(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    binary(m, inst, AluOp::Or, true)
}

fn exec_xor(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    binary(m, inst, AluOp::Xor, true)
}

fn exec_cmp(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    binary(m, inst, AluOp::Sub, false)
}

fn exec_test(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    binary(m, inst, AluOp::And, false)
}

fn unary(
    m: &mut Machine<'_>,
    inst: &InstructionDescriptor,
    f: impl FnOnce(&mut crate::state::RFlags, u64, usize) -> u64,
) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let size = width(&dst)?;
    m.modify(&dst, size, true, |flags, v| f(flags, v, size))?;
    Ok(ExecOutcome::Continue)
}

fn exec_inc(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    unary(m, inst, |f, v, size| inc_dec_with_flags(f, v, false, size))
}

fn exec_dec(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    unary(m, inst, |f, v, size| inc_dec_with_flags(f, v, true, size))
}

fn exec_neg(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    unary(m, inst, neg_with_flags)
}

fn exec_not(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    unary(m, inst, |_, v, _| !v)
}

//! String instructions.
//!
//! A `rep` prefix turns one instruction into up to RCX element operations. For
//! the storing forms (MOVS, STOS) the whole source and destination ranges are
//! validated before the first element is copied, so a REP either completes or
//! faults with memory untouched; the register copy is only committed on
//! success, which makes the retry after a fault start from the beginning.

use super::alu::{mask_for_size, sub_with_flags};
use super::{DispatchTable, ExecOutcome, Machine};
use crate::fault::FaultKind;
use crate::state::{gpr, RFlags};
use xemu_decoder::{InstructionDescriptor, Mnemonic, Operand, Register};
use xemu_mem::{Access, MemoryFault};

/// Bulk copies move at most this many bytes per host buffer.
const CHUNK: u64 = 64 * 1024;

pub(super) fn register(table: &mut DispatchTable) {
    use Mnemonic::*;
    for m in [Movsb, Movsw, Movsd, Movsq] {
        table.set(m, exec_movs);
    }
    for m in [Stosb, Stosw, Stosd, Stosq] {
        table.set(m, exec_stos);
    }
    for m in [Lodsb, Lodsw, Lodsd, Lodsq] {
        table.set(m, exec_lods);
    }
    for m in [Cmpsb, Cmpsw, Cmpsd, Cmpsq] {
        table.set(m, exec_cmps);
    }
    for m in [Scasb, Scasw, Scasd, Scasq] {
        table.set(m, exec_scas);
    }
}

/// Element size, rejecting the SSE forms that share a mnemonic (MOVSD/CMPSD)
/// and 32-bit address-size strings.
fn element_size(inst: &InstructionDescriptor) -> Result<usize, FaultKind> {
    let string_form = inst.operands().any(|op| op == Operand::Implicit);
    if !string_form || inst.has_address_size_override() {
        return Err(FaultKind::unsupported());
    }
    use Mnemonic::*;
    Ok(match inst.mnemonic() {
        Movsb | Stosb | Lodsb | Cmpsb | Scasb => 1,
        Movsw | Stosw | Lodsw | Cmpsw | Scasw => 2,
        Movsd | Stosd | Lodsd | Cmpsd | Scasd => 4,
        _ => 8,
    })
}

fn repeated(inst: &InstructionDescriptor) -> bool {
    let p = inst.prefixes();
    p.rep || p.repne
}

/// Base added to RSI: only FS/GS overrides change the flat source segment.
fn source_base(m: &Machine<'_>, inst: &InstructionDescriptor) -> u64 {
    match inst.prefixes().segment {
        Some(Register::FS) => m.regs.fs_base,
        Some(Register::GS) => m.regs.gs_base,
        _ => 0,
    }
}

fn backwards(m: &Machine<'_>) -> bool {
    m.regs.rflags.contains(RFlags::DF)
}

/// Advance a string pointer register by `count` elements in the DF direction.
fn advance(m: &mut Machine<'_>, reg: usize, count: u64, size: usize) {
    let delta = count.wrapping_mul(size as u64);
    let value = if backwards(m) {
        m.gpr(reg).wrapping_sub(delta)
    } else {
        m.gpr(reg).wrapping_add(delta)
    };
    m.set_gpr(reg, value);
}

/// Lowest address and byte length covered by `count` elements starting at
/// `first` in the DF direction.
fn span(m: &Machine<'_>, first: u64, count: u64, size: usize) -> Result<(u64, u64), FaultKind> {
    let total = count.checked_mul(size as u64).ok_or(MemoryFault::Unmapped {
        addr: first,
        access: Access::Read,
    })?;
    let lo = if backwards(m) {
        first.wrapping_sub(total - size as u64)
    } else {
        first
    };
    Ok((lo, total))
}

pub(super) fn exec_movs(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let size = element_size(inst)?;
    let src = source_base(m, inst).wrapping_add(m.gpr(gpr::RSI));
    let dst = m.gpr(gpr::RDI);

    if !repeated(inst) {
        let value = m.load(src, size)?;
        m.store(dst, size, value)?;
        advance(m, gpr::RSI, 1, size);
        advance(m, gpr::RDI, 1, size);
        return Ok(ExecOutcome::Continue);
    }

    let count = m.gpr(gpr::RCX);
    if count == 0 {
        return Ok(ExecOutcome::Continue);
    }
    let (src_lo, total) = span(m, src, count, size)?;
    let (dst_lo, _) = span(m, dst, count, size)?;
    m.mem.check_range(src_lo, total, Access::Read)?;
    m.mem.check_range(dst_lo, total, Access::Write)?;

    let overlap = src_lo < dst_lo.wrapping_add(total) && dst_lo < src_lo.wrapping_add(total);
    if overlap {
        // Element order matters (e.g. `rep movsb` with rdi = rsi + 1 replicates
        // the first byte), so copy one element at a time in the DF direction.
        let step = if backwards(m) { (size as u64).wrapping_neg() } else { size as u64 };
        let (mut s, mut d) = (src, dst);
        for _ in 0..count {
            let value = m.load(s, size)?;
            m.store(d, size, value)?;
            s = s.wrapping_add(step);
            d = d.wrapping_add(step);
        }
    } else {
        let mut buf = vec![0u8; total.min(CHUNK) as usize];
        let mut done = 0;
        while done < total {
            let n = (total - done).min(CHUNK) as usize;
            m.mem.read(src_lo + done, &mut buf[..n])?;
            m.mem.write(dst_lo + done, &buf[..n])?;
            m.record_store(dst_lo + done, &buf[..n]);
            done += n as u64;
        }
    }

    advance(m, gpr::RSI, count, size);
    advance(m, gpr::RDI, count, size);
    m.set_gpr(gpr::RCX, 0);
    Ok(ExecOutcome::Continue)
}

fn exec_stos(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let size = element_size(inst)?;
    let value = m.gpr(gpr::RAX) & mask_for_size(size);
    let dst = m.gpr(gpr::RDI);

    if !repeated(inst) {
        m.store(dst, size, value)?;
        advance(m, gpr::RDI, 1, size);
        return Ok(ExecOutcome::Continue);
    }

    let count = m.gpr(gpr::RCX);
    if count == 0 {
        return Ok(ExecOutcome::Continue);
    }
    let (dst_lo, total) = span(m, dst, count, size)?;
    m.mem.check_range(dst_lo, total, Access::Write)?;

    // Every element is the same, so the fill order does not matter.
    let pattern = value.to_le_bytes();
    let chunk: Vec<u8> = pattern[..size]
        .iter()
        .copied()
        .cycle()
        .take(total.min(CHUNK) as usize)
        .collect();
    let mut done = 0;
    while done < total {
        let n = (total - done).min(CHUNK) as usize;
        m.mem.write(dst_lo + done, &chunk[..n])?;
        m.record_store(dst_lo + done, &chunk[..n]);
        done += n as u64;
    }

    advance(m, gpr::RDI, count, size);
    m.set_gpr(gpr::RCX, 0);
    Ok(ExecOutcome::Continue)
}

/// LODS only keeps the last element, so a REP form reads just that one after
/// checking the whole range.
fn exec_lods(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let size = element_size(inst)?;
    let src = source_base(m, inst).wrapping_add(m.gpr(gpr::RSI));
    let count = if repeated(inst) { m.gpr(gpr::RCX) } else { 1 };
    if count == 0 {
        return Ok(ExecOutcome::Continue);
    }
    let (lo, total) = span(m, src, count, size)?;
    m.mem.check_range(lo, total, Access::Read)?;
    let last = if backwards(m) { lo } else { lo + total - size as u64 };
    let value = m.load(last, size)?;
    m.set_gpr_sized(gpr::RAX, size, value);
    advance(m, gpr::RSI, count, size);
    if repeated(inst) {
        m.set_gpr(gpr::RCX, 0);
    }
    Ok(ExecOutcome::Continue)
}

/// Shared loop for CMPS/SCAS: `F3` repeats while equal, `F2` while not equal.
fn compare_loop(
    m: &mut Machine<'_>,
    inst: &InstructionDescriptor,
    mut compare: impl FnMut(&mut Machine<'_>) -> Result<(), FaultKind>,
) -> Result<ExecOutcome, FaultKind> {
    let prefixes = inst.prefixes();
    if !prefixes.rep && !prefixes.repne {
        compare(m)?;
        return Ok(ExecOutcome::Continue);
    }
    loop {
        if m.gpr(gpr::RCX) == 0 {
            break;
        }
        compare(m)?;
        let rcx = m.gpr(gpr::RCX) - 1;
        m.set_gpr(gpr::RCX, rcx);
        let zf = m.regs.rflags.contains(RFlags::ZF);
        if rcx == 0 || (prefixes.rep && !zf) || (prefixes.repne && zf) {
            break;
        }
    }
    Ok(ExecOutcome::Continue)
}

pub(super) fn exec_cmps(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let size = element_size(inst)?;
    let base = source_base(m, inst);
    compare_loop(m, inst, |m| {
        let a = m.load(base.wrapping_add(m.gpr(gpr::RSI)), size)?;
        let b = m.load(m.gpr(gpr::RDI), size)?;
        sub_with_flags(m.flags(), a, b, false, size);
        advance(m, gpr::RSI, 1, size);
        advance(m, gpr::RDI, 1, size);
        Ok(())
    })
}

fn exec_scas(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let size = element_size(inst)?;
    let acc = m.gpr(gpr::RAX) & mask_for_size(size);
    compare_loop(m, inst, |m| {
        let b = m.load(m.gpr(gpr::RDI), size)?;
        sub_with_flags(m.flags(), acc, b, false, size);
        advance(m, gpr::RDI, 1, size);
        Ok(())
    })
}

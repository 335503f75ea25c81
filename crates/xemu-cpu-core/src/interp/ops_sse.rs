//! SSE and SSE2 in their legacy encodings: 128-bit moves, packed integer
//! logic, compares and shuffles, and scalar and packed floating point.
//!
//! MMX forms of the shared mnemonics (`movd mm0, eax`, `pxor mm0, mm1`) are
//! not modelled and report an unsupported instruction. Floating point honours
//! MXCSR.RC only for float-to-integer conversions; everything else rounds to
//! nearest. Exceptions are always treated as masked: the sticky IE and PE bits
//! are set and the masked response is produced.

use super::alu::{mask_for_size, sign_bit, sign_extend};
use super::{operand, ops_string, width, DispatchTable, ExecOutcome, Machine};
use crate::fault::FaultKind;
use crate::state::{xmm_index, RFlags};
use xemu_decoder::{InstructionDescriptor, Mnemonic, Operand};

const MXCSR_IE: u32 = 1 << 0;
const MXCSR_PE: u32 = 1 << 5;
/// Bits LDMXCSR accepts; anything above raises #GP.
const MXCSR_WRITABLE: u32 = 0xffff;

pub(super) fn register(table: &mut DispatchTable) {
    use Mnemonic::*;
    for m in [Movdqa, Movaps, Movapd, Movntdq, Movntps, Movntpd] {
        table.set(m, exec_move_aligned);
    }
    for m in [Movdqu, Movups, Movupd] {
        table.set(m, exec_move_unaligned);
    }
    table.set(Movd, exec_movd_movq);
    table.set(Movq, exec_movd_movq);
    table.set(Movss, exec_movss);
    table.set(Movsd, exec_movsd);
    for m in [Movlps, Movlpd, Movhps, Movhpd] {
        table.set(m, exec_move_half);
    }
    table.set(Movhlps, exec_movhlps);
    table.set(Movlhps, exec_movlhps);
    table.set(Movnti, exec_movnti);

    for m in [
        Pxor, Xorps, Xorpd, Pand, Andps, Andpd, Por, Orps, Orpd, Pandn, Andnps, Andnpd, Paddb,
        Paddw, Paddd, Paddq, Psubb, Psubw, Psubd, Psubq, Pcmpeqb, Pcmpeqw, Pcmpeqd, Pcmpgtb,
        Pcmpgtw, Pcmpgtd, Pminub, Pmaxub, Pminsw, Pmaxsw, Punpcklbw, Punpcklwd, Punpckldq,
        Punpcklqdq, Punpckhbw, Punpckhwd, Punpckhdq, Punpckhqdq, Unpcklps, Unpckhps, Unpcklpd,
        Unpckhpd,
    ] {
        table.set(m, exec_packed_integer);
    }
    for m in [Psrlw, Psrld, Psrlq, Psllw, Pslld, Psllq, Psraw, Psrad] {
        table.set(m, exec_packed_shift);
    }
    table.set(Psrldq, exec_byte_shift);
    table.set(Pslldq, exec_byte_shift);
    for m in [Pshufd, Pshuflw, Pshufhw] {
        table.set(m, exec_pshuf);
    }
    table.set(Shufps, exec_shufps);
    table.set(Shufpd, exec_shufpd);
    for m in [Pmovmskb, Movmskps, Movmskpd] {
        table.set(m, exec_movmsk);
    }
    table.set(Pextrw, exec_pextrw);
    table.set(Pinsrw, exec_pinsrw);

    for m in [
        Addss, Addsd, Subss, Subsd, Mulss, Mulsd, Divss, Divsd, Minss, Minsd, Maxss, Maxsd,
        Sqrtss, Sqrtsd,
    ] {
        table.set(m, exec_scalar_fp);
    }
    for m in [
        Addps, Addpd, Subps, Subpd, Mulps, Mulpd, Divps, Divpd, Minps, Minpd, Maxps, Maxpd,
        Sqrtps, Sqrtpd,
    ] {
        table.set(m, exec_packed_fp);
    }
    for m in [Comiss, Comisd, Ucomiss, Ucomisd] {
        table.set(m, exec_comis);
    }
    table.set(Cmpss, exec_fp_compare);
    table.set(Cmpsd, exec_cmpsd);
    table.set(Cmpps, exec_fp_compare);
    table.set(Cmppd, exec_fp_compare);

    table.set(Cvtsi2ss, exec_cvtsi2f);
    table.set(Cvtsi2sd, exec_cvtsi2f);
    for m in [Cvtss2si, Cvtsd2si, Cvttss2si, Cvttsd2si] {
        table.set(m, exec_cvtf2si);
    }
    table.set(Cvtss2sd, exec_cvt_precision);
    table.set(Cvtsd2ss, exec_cvt_precision);
    table.set(Ldmxcsr, exec_ldmxcsr);
    table.set(Stmxcsr, exec_stmxcsr);
}

// ---- lanes ----

/// Lane `i` of `v`, lanes being `width` bytes wide.
#[inline]
fn lane(v: u128, width: u32, i: u32) -> u64 {
    ((v >> (i * width * 8)) as u64) & mask_for_size(width as usize)
}

fn from_lanes(width: u32, f: impl Fn(u32) -> u64) -> u128 {
    let mask = mask_for_size(width as usize);
    (0..16 / width).fold(0u128, |acc, i| acc | (((f(i) & mask) as u128) << (i * width * 8)))
}

fn zip_lanes(a: u128, b: u128, width: u32, f: impl Fn(u64, u64) -> u64) -> u128 {
    from_lanes(width, |i| f(lane(a, width, i), lane(b, width, i)))
}

/// PUNPCKL*/PUNPCKH*: alternate lanes of `a` and `b`, taken from the low or
/// high half.
fn interleave(a: u128, b: u128, width: u32, high: bool) -> u128 {
    let base = if high { 8 / width } else { 0 };
    from_lanes(width, |i| {
        let src = if i % 2 == 0 { a } else { b };
        lane(src, width, base + i / 2)
    })
}

fn with_low_lane(v: u128, width: u32, value: u64) -> u128 {
    let mask = mask_for_size(width as usize) as u128;
    (v & !mask) | (value as u128 & mask)
}

fn all_ones_if(hit: bool) -> u64 {
    if hit {
        u64::MAX
    } else {
        0
    }
}

// ---- operands ----

fn xmm_of(op: &Operand) -> Result<usize, FaultKind> {
    match *op {
        Operand::Reg(reg) => xmm_index(reg).ok_or_else(FaultKind::unsupported),
        _ => Err(FaultKind::invalid()),
    }
}

fn linear_checked(m: &Machine<'_>, op: &Operand, aligned: bool) -> Result<u64, FaultKind> {
    let Operand::Mem(ref mem) = *op else {
        return Err(FaultKind::invalid());
    };
    let addr = m.linear(mem)?;
    if aligned && addr % 16 != 0 {
        return Err(FaultKind::GeneralProtection);
    }
    Ok(addr)
}

/// An `xmm/m128` source. Legacy SSE requires 16-byte alignment unless the
/// instruction is one of the explicitly unaligned moves.
fn read_m128(m: &Machine<'_>, op: &Operand, aligned: bool) -> Result<u128, FaultKind> {
    match *op {
        Operand::Reg(_) => Ok(m.regs.xmm[xmm_of(op)?]),
        Operand::Mem(_) => m.load_wide(linear_checked(m, op, aligned)?, 16),
        _ => Err(FaultKind::invalid()),
    }
}

/// The low `size` bytes of an XMM register, a GPR or memory.
fn read_scalar(m: &Machine<'_>, op: &Operand, size: usize) -> Result<u128, FaultKind> {
    let mask = u128::MAX >> (128 - size * 8);
    let value = match *op {
        Operand::Reg(reg) => match xmm_index(reg) {
            Some(i) => m.regs.xmm[i],
            None => m.regs.read_reg(reg)? as u128,
        },
        Operand::Mem(ref mem) => m.load_wide(m.linear(mem)?, size)?,
        _ => return Err(FaultKind::invalid()),
    };
    Ok(value & mask)
}

fn imm8(inst: &InstructionDescriptor, index: usize) -> Result<u32, FaultKind> {
    match operand(inst, index)? {
        Operand::Imm { value, .. } => Ok(value as u32 & 0xff),
        _ => Err(FaultKind::invalid()),
    }
}

// ---- moves ----

fn move_128(m: &mut Machine<'_>, inst: &InstructionDescriptor, aligned: bool) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let src = operand(inst, 1)?;
    match dst {
        Operand::Reg(_) => {
            let d = xmm_of(&dst)?;
            m.regs.xmm[d] = read_m128(m, &src, aligned)?;
        }
        Operand::Mem(_) => {
            let value = m.regs.xmm[xmm_of(&src)?];
            let addr = linear_checked(m, &dst, aligned)?;
            m.store_wide(addr, 16, value)?;
        }
        _ => return Err(FaultKind::invalid()),
    }
    Ok(ExecOutcome::Continue)
}

fn exec_move_aligned(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    move_128(m, inst, true)
}

fn exec_move_unaligned(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    move_128(m, inst, false)
}

/// MOVD/MOVQ between XMM, GPRs and memory. An XMM destination is
/// zero-extended to 128 bits.
fn exec_movd_movq(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let size = if inst.mnemonic() == Mnemonic::Movd { 4 } else { 8 };
    let dst = operand(inst, 0)?;
    let value = read_scalar(m, &operand(inst, 1)?, size)? as u64;
    match dst {
        Operand::Reg(reg) => match xmm_index(reg) {
            Some(d) => m.regs.xmm[d] = value as u128,
            None => m.write(&dst, size, value)?,
        },
        Operand::Mem(ref mem) => {
            let addr = m.linear(mem)?;
            m.store(addr, size, value)?;
        }
        _ => return Err(FaultKind::invalid()),
    }
    Ok(ExecOutcome::Continue)
}

/// MOVSS/MOVSD: register to register merges the low lane, a load clears the
/// rest of the register.
fn move_scalar(m: &mut Machine<'_>, inst: &InstructionDescriptor, size: usize) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let src = operand(inst, 1)?;
    match (dst, src) {
        (Operand::Reg(_), Operand::Reg(_)) => {
            let d = xmm_of(&dst)?;
            let low = m.regs.xmm[xmm_of(&src)?];
            m.regs.xmm[d] = with_low_lane(m.regs.xmm[d], size as u32, lane(low, size as u32, 0));
        }
        (Operand::Reg(_), Operand::Mem(_)) => {
            let d = xmm_of(&dst)?;
            m.regs.xmm[d] = read_scalar(m, &src, size)?;
        }
        (Operand::Mem(ref mem), Operand::Reg(_)) => {
            let value = m.regs.xmm[xmm_of(&src)?];
            let addr = m.linear(mem)?;
            m.store_wide(addr, size, value)?;
        }
        _ => return Err(FaultKind::invalid()),
    }
    Ok(ExecOutcome::Continue)
}

fn exec_movss(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    move_scalar(m, inst, 4)
}

/// The mnemonic is shared with the string move, whose operands are implicit.
fn exec_movsd(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    if matches!(inst.operand(0), Some(Operand::Implicit)) {
        return ops_string::exec_movs(m, inst);
    }
    move_scalar(m, inst, 8)
}

/// MOVLPS/MOVLPD/MOVHPS/MOVHPD: one quadword between memory and the low or
/// high half of a register.
fn exec_move_half(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let shift = match inst.mnemonic() {
        Mnemonic::Movhps | Mnemonic::Movhpd => 64,
        _ => 0,
    };
    let dst = operand(inst, 0)?;
    let src = operand(inst, 1)?;
    match (dst, src) {
        (Operand::Reg(_), Operand::Mem(ref mem)) => {
            let d = xmm_of(&dst)?;
            let value = m.load_wide(m.linear(mem)?, 8)?;
            let keep = !((u64::MAX as u128) << shift);
            m.regs.xmm[d] = (m.regs.xmm[d] & keep) | (value << shift);
        }
        (Operand::Mem(ref mem), Operand::Reg(_)) => {
            let value = m.regs.xmm[xmm_of(&src)?] >> shift;
            let addr = m.linear(mem)?;
            m.store_wide(addr, 8, value)?;
        }
        _ => return Err(FaultKind::invalid()),
    }
    Ok(ExecOutcome::Continue)
}

fn exec_movhlps(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let d = xmm_of(&operand(inst, 0)?)?;
    let src = m.regs.xmm[xmm_of(&operand(inst, 1)?)?];
    m.regs.xmm[d] = with_low_lane(m.regs.xmm[d], 8, lane(src, 8, 1));
    Ok(ExecOutcome::Continue)
}

fn exec_movlhps(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let d = xmm_of(&operand(inst, 0)?)?;
    let src = m.regs.xmm[xmm_of(&operand(inst, 1)?)?];
    m.regs.xmm[d] = (m.regs.xmm[d] & u64::MAX as u128) | ((src & u64::MAX as u128) << 64);
    Ok(ExecOutcome::Continue)
}

fn exec_movnti(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let size = width(&dst)?;
    let value = m.read(&operand(inst, 1)?, size)?;
    m.write(&dst, size, value)?;
    Ok(ExecOutcome::Continue)
}

// ---- packed integer ----

fn packed_integer(mnemonic: Mnemonic, a: u128, b: u128) -> Option<u128> {
    use Mnemonic::*;
    let signed = |x: u64, width: u32| sign_extend(x, width as usize) as i64;
    Some(match mnemonic {
        Pxor | Xorps | Xorpd => a ^ b,
        Pand | Andps | Andpd => a & b,
        Por | Orps | Orpd => a | b,
        Pandn | Andnps | Andnpd => !a & b,
        Paddb => zip_lanes(a, b, 1, u64::wrapping_add),
        Paddw => zip_lanes(a, b, 2, u64::wrapping_add),
        Paddd => zip_lanes(a, b, 4, u64::wrapping_add),
        Paddq => zip_lanes(a, b, 8, u64::wrapping_add),
        Psubb => zip_lanes(a, b, 1, u64::wrapping_sub),
        Psubw => zip_lanes(a, b, 2, u64::wrapping_sub),
        Psubd => zip_lanes(a, b, 4, u64::wrapping_sub),
        Psubq => zip_lanes(a, b, 8, u64::wrapping_sub),
        Pcmpeqb => zip_lanes(a, b, 1, |x, y| all_ones_if(x == y)),
        Pcmpeqw => zip_lanes(a, b, 2, |x, y| all_ones_if(x == y)),
        Pcmpeqd => zip_lanes(a, b, 4, |x, y| all_ones_if(x == y)),
        Pcmpgtb => zip_lanes(a, b, 1, |x, y| all_ones_if(signed(x, 1) > signed(y, 1))),
        Pcmpgtw => zip_lanes(a, b, 2, |x, y| all_ones_if(signed(x, 2) > signed(y, 2))),
        Pcmpgtd => zip_lanes(a, b, 4, |x, y| all_ones_if(signed(x, 4) > signed(y, 4))),
        Pminub => zip_lanes(a, b, 1, u64::min),
        Pmaxub => zip_lanes(a, b, 1, u64::max),
        Pminsw => zip_lanes(a, b, 2, |x, y| if signed(x, 2) <= signed(y, 2) { x } else { y }),
        Pmaxsw => zip_lanes(a, b, 2, |x, y| if signed(x, 2) >= signed(y, 2) { x } else { y }),
        Punpcklbw => interleave(a, b, 1, false),
        Punpcklwd => interleave(a, b, 2, false),
        Punpckldq | Unpcklps => interleave(a, b, 4, false),
        Punpcklqdq | Unpcklpd => interleave(a, b, 8, false),
        Punpckhbw => interleave(a, b, 1, true),
        Punpckhwd => interleave(a, b, 2, true),
        Punpckhdq | Unpckhps => interleave(a, b, 4, true),
        Punpckhqdq | Unpckhpd => interleave(a, b, 8, true),
        _ => return None,
    })
}

fn exec_packed_integer(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let d = xmm_of(&operand(inst, 0)?)?;
    let src = read_m128(m, &operand(inst, 1)?, true)?;
    m.regs.xmm[d] =
        packed_integer(inst.mnemonic(), m.regs.xmm[d], src).ok_or_else(FaultKind::unsupported)?;
    Ok(ExecOutcome::Continue)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaneShift {
    Left,
    Right,
    Arithmetic,
}

fn shift_lanes(v: u128, width: u32, kind: LaneShift, count: u64) -> u128 {
    let bits = (width * 8) as u64;
    from_lanes(width, |i| {
        let x = lane(v, width, i);
        match kind {
            LaneShift::Left if count < bits => x << count,
            LaneShift::Right if count < bits => x >> count,
            LaneShift::Left | LaneShift::Right => 0,
            LaneShift::Arithmetic => {
                (sign_extend(x, width as usize) as i64 >> count.min(bits - 1)) as u64
            }
        }
    })
}

/// PSLL*/PSRL*/PSRA* by an immediate or by the low quadword of `xmm/m128`.
fn exec_packed_shift(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    use Mnemonic::*;
    let (width, kind) = match inst.mnemonic() {
        Psllw => (2, LaneShift::Left),
        Pslld => (4, LaneShift::Left),
        Psllq => (8, LaneShift::Left),
        Psrlw => (2, LaneShift::Right),
        Psrld => (4, LaneShift::Right),
        Psrlq => (8, LaneShift::Right),
        Psraw => (2, LaneShift::Arithmetic),
        Psrad => (4, LaneShift::Arithmetic),
        _ => return Err(FaultKind::unsupported()),
    };
    let d = xmm_of(&operand(inst, 0)?)?;
    let count = match operand(inst, 1)? {
        Operand::Imm { value, .. } => value & 0xff,
        src => read_m128(m, &src, true)? as u64,
    };
    m.regs.xmm[d] = shift_lanes(m.regs.xmm[d], width, kind, count);
    Ok(ExecOutcome::Continue)
}

fn exec_byte_shift(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let d = xmm_of(&operand(inst, 0)?)?;
    let count = imm8(inst, 1)?;
    let v = m.regs.xmm[d];
    m.regs.xmm[d] = match (count, inst.mnemonic()) {
        (16.., _) => 0,
        (n, Mnemonic::Pslldq) => v << (n * 8),
        (n, _) => v >> (n * 8),
    };
    Ok(ExecOutcome::Continue)
}

fn exec_pshuf(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let d = xmm_of(&operand(inst, 0)?)?;
    let src = read_m128(m, &operand(inst, 1)?, true)?;
    let imm = imm8(inst, 2)?;
    let sel = |i: u32| (imm >> (2 * i)) & 3;
    m.regs.xmm[d] = match inst.mnemonic() {
        Mnemonic::Pshufd => from_lanes(4, |i| lane(src, 4, sel(i))),
        Mnemonic::Pshuflw => from_lanes(2, |i| {
            if i < 4 {
                lane(src, 2, sel(i))
            } else {
                lane(src, 2, i)
            }
        }),
        _ => from_lanes(2, |i| {
            if i < 4 {
                lane(src, 2, i)
            } else {
                lane(src, 2, 4 + sel(i - 4))
            }
        }),
    };
    Ok(ExecOutcome::Continue)
}

fn exec_shufps(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let d = xmm_of(&operand(inst, 0)?)?;
    let src = read_m128(m, &operand(inst, 1)?, true)?;
    let imm = imm8(inst, 2)?;
    let dst = m.regs.xmm[d];
    m.regs.xmm[d] = from_lanes(4, |i| {
        let from = if i < 2 { dst } else { src };
        lane(from, 4, (imm >> (2 * i)) & 3)
    });
    Ok(ExecOutcome::Continue)
}

fn exec_shufpd(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let d = xmm_of(&operand(inst, 0)?)?;
    let src = read_m128(m, &operand(inst, 1)?, true)?;
    let imm = imm8(inst, 2)?;
    let dst = m.regs.xmm[d];
    m.regs.xmm[d] = from_lanes(8, |i| {
        let from = if i == 0 { dst } else { src };
        lane(from, 8, (imm >> i) & 1)
    });
    Ok(ExecOutcome::Continue)
}

/// PMOVMSKB/MOVMSKPS/MOVMSKPD: gather the sign bit of every lane.
fn exec_movmsk(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let lane_width = match inst.mnemonic() {
        Mnemonic::Pmovmskb => 1,
        Mnemonic::Movmskps => 4,
        _ => 8,
    };
    let dst = operand(inst, 0)?;
    let v = m.regs.xmm[xmm_of(&operand(inst, 1)?)?];
    let top = lane_width as usize;
    let mask = (0..16 / lane_width).fold(0u64, |acc, i| {
        acc | (((lane(v, lane_width, i) & sign_bit(top)) != 0) as u64) << i
    });
    m.write(&dst, width(&dst)?, mask)?;
    Ok(ExecOutcome::Continue)
}

fn exec_pextrw(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let dst = operand(inst, 0)?;
    let src = m.regs.xmm[xmm_of(&operand(inst, 1)?)?];
    let word = lane(src, 2, imm8(inst, 2)? & 7);
    match dst {
        Operand::Reg(_) => m.write(&dst, width(&dst)?, word)?,
        _ => m.write(&dst, 2, word)?,
    }
    Ok(ExecOutcome::Continue)
}

fn exec_pinsrw(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let d = xmm_of(&operand(inst, 0)?)?;
    let word = read_scalar(m, &operand(inst, 1)?, 2)? as u64;
    let slot = imm8(inst, 2)? & 7;
    let v = m.regs.xmm[d];
    m.regs.xmm[d] = from_lanes(2, |i| if i == slot { word } else { lane(v, 2, i) });
    Ok(ExecOutcome::Continue)
}

// ---- floating point ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precision {
    Single,
    Double,
}

impl Precision {
    fn width(self) -> u32 {
        match self {
            Precision::Single => 4,
            Precision::Double => 8,
        }
    }

    fn to_f64(self, bits: u64) -> f64 {
        match self {
            Precision::Single => f32::from_bits(bits as u32) as f64,
            Precision::Double => f64::from_bits(bits),
        }
    }

    /// Round `value` to this precision. Single results computed in double are
    /// still correctly rounded for the basic operations.
    fn from_f64(self, value: f64) -> u64 {
        match self {
            Precision::Single => (value as f32).to_bits() as u64,
            Precision::Double => value.to_bits(),
        }
    }

    fn is_signaling_nan(self, bits: u64) -> bool {
        let (quiet, exp_mask, frac_mask) = match self {
            Precision::Single => (1u64 << 22, 0xffu64 << 23, (1u64 << 23) - 1),
            Precision::Double => (1u64 << 51, 0x7ffu64 << 52, (1u64 << 52) - 1),
        };
        bits & exp_mask == exp_mask && bits & frac_mask != 0 && bits & quiet == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FpOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Sqrt,
}

fn fp_kind(mnemonic: Mnemonic) -> Option<(Precision, FpOp)> {
    use Mnemonic::*;
    use Precision::{Double, Single};
    Some(match mnemonic {
        Addss | Addps => (Single, FpOp::Add),
        Addsd | Addpd => (Double, FpOp::Add),
        Subss | Subps => (Single, FpOp::Sub),
        Subsd | Subpd => (Double, FpOp::Sub),
        Mulss | Mulps => (Single, FpOp::Mul),
        Mulsd | Mulpd => (Double, FpOp::Mul),
        Divss | Divps => (Single, FpOp::Div),
        Divsd | Divpd => (Double, FpOp::Div),
        Minss | Minps => (Single, FpOp::Min),
        Minsd | Minpd => (Double, FpOp::Min),
        Maxss | Maxps => (Single, FpOp::Max),
        Maxsd | Maxpd => (Double, FpOp::Max),
        Sqrtss | Sqrtps => (Single, FpOp::Sqrt),
        Sqrtsd | Sqrtpd => (Double, FpOp::Sqrt),
        _ => return None,
    })
}

/// One lane of an arithmetic op. MIN and MAX return the second operand when
/// the comparison is false, which covers NaNs and signed zeros.
fn fp_lane(precision: Precision, op: FpOp, a: u64, b: u64) -> u64 {
    let (x, y) = (precision.to_f64(a), precision.to_f64(b));
    match op {
        FpOp::Min => {
            if x < y {
                a
            } else {
                b
            }
        }
        FpOp::Max => {
            if x > y {
                a
            } else {
                b
            }
        }
        FpOp::Add => precision.from_f64(x + y),
        FpOp::Sub => precision.from_f64(x - y),
        FpOp::Mul => precision.from_f64(x * y),
        FpOp::Div => precision.from_f64(x / y),
        FpOp::Sqrt => precision.from_f64(y.sqrt()),
    }
}

fn exec_scalar_fp(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let (precision, op) = fp_kind(inst.mnemonic()).ok_or_else(FaultKind::unsupported)?;
    let lane_width = precision.width();
    let d = xmm_of(&operand(inst, 0)?)?;
    let b = read_scalar(m, &operand(inst, 1)?, lane_width as usize)? as u64;
    let old = m.regs.xmm[d];
    let result = fp_lane(precision, op, lane(old, lane_width, 0), b);
    m.regs.xmm[d] = with_low_lane(old, lane_width, result);
    Ok(ExecOutcome::Continue)
}

fn exec_packed_fp(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let (precision, op) = fp_kind(inst.mnemonic()).ok_or_else(FaultKind::unsupported)?;
    let d = xmm_of(&operand(inst, 0)?)?;
    let src = read_m128(m, &operand(inst, 1)?, true)?;
    m.regs.xmm[d] = zip_lanes(m.regs.xmm[d], src, precision.width(), |a, b| {
        fp_lane(precision, op, a, b)
    });
    Ok(ExecOutcome::Continue)
}

/// COMISS/COMISD/UCOMISS/UCOMISD: ZF, PF and CF encode the relation, the other
/// status flags are cleared. The ordered forms flag every NaN as invalid, the
/// unordered forms only signalling ones.
fn exec_comis(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let (precision, ordered) = match inst.mnemonic() {
        Mnemonic::Comiss => (Precision::Single, true),
        Mnemonic::Ucomiss => (Precision::Single, false),
        Mnemonic::Comisd => (Precision::Double, true),
        _ => (Precision::Double, false),
    };
    let lane_width = precision.width();
    let a_bits = lane(m.regs.xmm[xmm_of(&operand(inst, 0)?)?], lane_width, 0);
    let b_bits = read_scalar(m, &operand(inst, 1)?, lane_width as usize)? as u64;
    let (a, b) = (precision.to_f64(a_bits), precision.to_f64(b_bits));

    let unordered = a.is_nan() || b.is_nan();
    let (zf, pf, cf) = if unordered {
        (true, true, true)
    } else if a < b {
        (false, false, true)
    } else if a == b {
        (true, false, false)
    } else {
        (false, false, false)
    };
    let signalling =
        precision.is_signaling_nan(a_bits) || precision.is_signaling_nan(b_bits);
    if (ordered && unordered) || signalling {
        m.regs.mxcsr |= MXCSR_IE;
    }

    let flags = m.flags();
    flags.remove(RFlags::STATUS);
    flags.set(RFlags::ZF, zf);
    flags.set(RFlags::PF, pf);
    flags.set(RFlags::CF, cf);
    Ok(ExecOutcome::Continue)
}

/// CMPxx predicate `imm & 7`: EQ, LT, LE, UNORD, NEQ, NLT, NLE, ORD.
fn compare_lane(precision: Precision, predicate: u32, a: u64, b: u64) -> u64 {
    let (x, y) = (precision.to_f64(a), precision.to_f64(b));
    let unordered = x.is_nan() || y.is_nan();
    let hit = match predicate & 7 {
        0 => x == y,
        1 => x < y,
        2 => x <= y,
        3 => unordered,
        4 => x != y,
        5 => !(x < y),
        6 => !(x <= y),
        _ => !unordered,
    };
    all_ones_if(hit)
}

fn exec_fp_compare(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let (precision, scalar) = match inst.mnemonic() {
        Mnemonic::Cmpss => (Precision::Single, true),
        Mnemonic::Cmpsd => (Precision::Double, true),
        Mnemonic::Cmpps => (Precision::Single, false),
        _ => (Precision::Double, false),
    };
    let lane_width = precision.width();
    let d = xmm_of(&operand(inst, 0)?)?;
    let src = operand(inst, 1)?;
    let predicate = imm8(inst, 2)?;
    let old = m.regs.xmm[d];
    m.regs.xmm[d] = if scalar {
        let b = read_scalar(m, &src, lane_width as usize)? as u64;
        let hit = compare_lane(precision, predicate, lane(old, lane_width, 0), b);
        with_low_lane(old, lane_width, hit)
    } else {
        let b = read_m128(m, &src, true)?;
        zip_lanes(old, b, lane_width, |x, y| compare_lane(precision, predicate, x, y))
    };
    Ok(ExecOutcome::Continue)
}

/// The mnemonic is shared with the string compare, whose operands are implicit.
fn exec_cmpsd(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    if matches!(inst.operand(0), Some(Operand::Implicit)) {
        return ops_string::exec_cmps(m, inst);
    }
    exec_fp_compare(m, inst)
}

fn exec_cvtsi2f(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let d = xmm_of(&operand(inst, 0)?)?;
    let src = operand(inst, 1)?;
    let size = width(&src)?;
    let value = sign_extend(m.read(&src, size)?, size) as i64;
    let (lane_width, bits) = if inst.mnemonic() == Mnemonic::Cvtsi2ss {
        (4, (value as f32).to_bits() as u64)
    } else {
        (8, (value as f64).to_bits())
    };
    if bits_back(lane_width, bits) != value as i128 {
        m.regs.mxcsr |= MXCSR_PE;
    }
    m.regs.xmm[d] = with_low_lane(m.regs.xmm[d], lane_width, bits);
    Ok(ExecOutcome::Continue)
}

/// Integer value of a converted lane, for the inexact check.
fn bits_back(lane_width: u32, bits: u64) -> i128 {
    if lane_width == 4 {
        f32::from_bits(bits as u32) as i128
    } else {
        f64::from_bits(bits) as i128
    }
}

fn round_per_mxcsr(x: f64, mxcsr: u32) -> f64 {
    match (mxcsr >> 13) & 3 {
        0 => x.round_ties_even(),
        1 => x.floor(),
        2 => x.ceil(),
        _ => x.trunc(),
    }
}

/// CVTSS2SI/CVTSD2SI and their truncating forms. NaN and out-of-range
/// values produce the integer indefinite (only the sign bit set) and IE.
fn exec_cvtf2si(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let (precision, truncate) = match inst.mnemonic() {
        Mnemonic::Cvtss2si => (Precision::Single, false),
        Mnemonic::Cvttss2si => (Precision::Single, true),
        Mnemonic::Cvtsd2si => (Precision::Double, false),
        _ => (Precision::Double, true),
    };
    let dst = operand(inst, 0)?;
    let size = width(&dst)?;
    let bits = read_scalar(m, &operand(inst, 1)?, precision.width() as usize)? as u64;
    let x = precision.to_f64(bits);
    let rounded = if truncate {
        x.trunc()
    } else {
        round_per_mxcsr(x, m.regs.mxcsr)
    };
    let limit = if size == 4 { 2_147_483_648.0 } else { 9_223_372_036_854_775_808.0 };
    let value = if rounded >= -limit && rounded < limit {
        if rounded != x {
            m.regs.mxcsr |= MXCSR_PE;
        }
        (rounded as i64) as u64 & mask_for_size(size)
    } else {
        m.regs.mxcsr |= MXCSR_IE;
        sign_bit(size)
    };
    m.write(&dst, size, value)?;
    Ok(ExecOutcome::Continue)
}

fn exec_cvt_precision(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let (from, to) = if inst.mnemonic() == Mnemonic::Cvtss2sd {
        (Precision::Single, Precision::Double)
    } else {
        (Precision::Double, Precision::Single)
    };
    let d = xmm_of(&operand(inst, 0)?)?;
    let bits = read_scalar(m, &operand(inst, 1)?, from.width() as usize)? as u64;
    let converted = to.from_f64(from.to_f64(bits));
    m.regs.xmm[d] = with_low_lane(m.regs.xmm[d], to.width(), converted);
    Ok(ExecOutcome::Continue)
}

fn exec_ldmxcsr(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let value = m.read(&operand(inst, 0)?, 4)? as u32;
    if value & !MXCSR_WRITABLE != 0 {
        return Err(FaultKind::GeneralProtection);
    }
    m.regs.mxcsr = value;
    Ok(ExecOutcome::Continue)
}

fn exec_stmxcsr(m: &mut Machine<'_>, inst: &InstructionDescriptor) -> Result<ExecOutcome, FaultKind> {
    let mxcsr = m.regs.mxcsr as u64;
    m.write(&operand(inst, 0)?, 4, mxcsr)?;
    Ok(ExecOutcome::Continue)
}

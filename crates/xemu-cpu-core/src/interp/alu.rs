use crate::state::RFlags;
use xemu_decoder::ConditionCode;

#[inline]
pub(crate) fn mask_for_size(size: usize) -> u64 {
    let bits = (size * 8) as u32;
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

#[inline]
pub(crate) fn sign_bit(size: usize) -> u64 {
    1u64 << ((size * 8) as u32 - 1)
}

#[inline]
fn parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

/// Sign-extend the low `size` bytes of `value` to 64 bits.
#[inline]
pub(crate) fn sign_extend(value: u64, size: usize) -> u64 {
    let shift = 64 - (size as u32 * 8);
    if shift == 0 {
        return value;
    }
    (((value << shift) as i64) >> shift) as u64
}

/// ZF, SF and PF from a result already masked to `size`.
#[inline]
pub(crate) fn set_result_flags(rflags: &mut RFlags, result: u64, size: usize) {
    rflags.set(RFlags::ZF, result == 0);
    rflags.set(RFlags::SF, (result & sign_bit(size)) != 0);
    rflags.set(RFlags::PF, parity(result as u8));
}

pub(crate) fn add_with_flags(
    rflags: &mut RFlags,
    dest: u64,
    src: u64,
    carry_in: bool,
    size: usize,
) -> u64 {
    let mask = mask_for_size(size);
    let dest = dest & mask;
    let src = src & mask;
    let full = (dest as u128) + (src as u128) + (carry_in as u128);
    let result = (full as u64) & mask;

    let sb = sign_bit(size);
    rflags.set(RFlags::CF, full > mask as u128);
    rflags.set(RFlags::OF, ((dest ^ result) & (src ^ result) & sb) != 0);
    rflags.set(RFlags::AF, ((dest ^ src ^ result) & 0x10) != 0);
    set_result_flags(rflags, result, size);
    result
}

pub(crate) fn sub_with_flags(
    rflags: &mut RFlags,
    dest: u64,
    src: u64,
    borrow_in: bool,
    size: usize,
) -> u64 {
    let mask = mask_for_size(size);
    let dest = dest & mask;
    let src = src & mask;
    let subtrahend = (src as u128) + (borrow_in as u128);
    let result = ((dest as u128).wrapping_sub(subtrahend) as u64) & mask;

    let sb = sign_bit(size);
    rflags.set(RFlags::CF, (dest as u128) < subtrahend);
    rflags.set(RFlags::OF, ((dest ^ src) & (dest ^ result) & sb) != 0);
    rflags.set(RFlags::AF, ((dest ^ src ^ result) & 0x10) != 0);
    set_result_flags(rflags, result, size);
    result
}

/// AND/OR/XOR/TEST: CF, OF and AF cleared.
pub(crate) fn logic_with_flags(rflags: &mut RFlags, result: u64, size: usize) -> u64 {
    let result = result & mask_for_size(size);
    rflags.remove(RFlags::CF | RFlags::OF | RFlags::AF);
    set_result_flags(rflags, result, size);
    result
}

/// INC/DEC leave CF alone.
pub(crate) fn inc_dec_with_flags(rflags: &mut RFlags, dest: u64, dec: bool, size: usize) -> u64 {
    let cf = rflags.contains(RFlags::CF);
    let result = if dec {
        sub_with_flags(rflags, dest, 1, false, size)
    } else {
        add_with_flags(rflags, dest, 1, false, size)
    };
    rflags.set(RFlags::CF, cf);
    result
}

/// NEG: `0 - dest`, with CF set unless the operand was zero.
pub(crate) fn neg_with_flags(rflags: &mut RFlags, dest: u64, size: usize) -> u64 {
    let result = sub_with_flags(rflags, 0, dest, false, size);
    rflags.set(RFlags::CF, dest & mask_for_size(size) != 0);
    result
}

/// The ALU operations shared by the plain and `lock`-prefixed paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AluOp {
    Add,
    Adc,
    Sub,
    Sbb,
    And,
    Or,
    Xor,
}

impl AluOp {
    pub(crate) fn apply(self, rflags: &mut RFlags, dest: u64, src: u64, size: usize) -> u64 {
        let cf = rflags.contains(RFlags::CF);
        match self {
            AluOp::Add => add_with_flags(rflags, dest, src, false, size),
            AluOp::Adc => add_with_flags(rflags, dest, src, cf, size),
            AluOp::Sub => sub_with_flags(rflags, dest, src, false, size),
            AluOp::Sbb => sub_with_flags(rflags, dest, src, cf, size),
            AluOp::And => logic_with_flags(rflags, dest & src, size),
            AluOp::Or => logic_with_flags(rflags, dest | src, size),
            AluOp::Xor => logic_with_flags(rflags, dest ^ src, size),
        }
    }
}

pub(crate) fn cond_holds(cc: ConditionCode, f: RFlags) -> bool {
    let cf = f.contains(RFlags::CF);
    let zf = f.contains(RFlags::ZF);
    let sf = f.contains(RFlags::SF);
    let of = f.contains(RFlags::OF);
    let pf = f.contains(RFlags::PF);
    match cc {
        ConditionCode::None => true,
        ConditionCode::o => of,
        ConditionCode::no => !of,
        ConditionCode::b => cf,
        ConditionCode::ae => !cf,
        ConditionCode::e => zf,
        ConditionCode::ne => !zf,
        ConditionCode::be => cf || zf,
        ConditionCode::a => !cf && !zf,
        ConditionCode::s => sf,
        ConditionCode::ns => !sf,
        ConditionCode::p => pf,
        ConditionCode::np => !pf,
        ConditionCode::l => sf != of,
        ConditionCode::ge => sf == of,
        ConditionCode::le => zf || sf != of,
        ConditionCode::g => !zf && sf == of,
    }
}

// ---- shifts and rotates ----

/// Shift counts are masked to 5 bits, or 6 for 64-bit operands.
#[inline]
pub(crate) fn shift_count(count: u64, size: usize) -> u32 {
    let mask = if size == 8 { 0x3f } else { 0x1f };
    (count & mask) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShiftOp {
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
}

/// Apply a shift or rotate. `count` must already be masked. A zero count
/// leaves both the operand and the flags unchanged.
///
/// Shifts set CF to the last bit shifted out, SF/ZF/PF from the result and
/// clear AF. OF is `msb(result) ^ msb(dest)` for SHL/SHR (which matches the
/// single-bit definition) and always clear for SAR. Rotates only touch CF and OF.
pub(crate) fn shift_with_flags(
    rflags: &mut RFlags,
    op: ShiftOp,
    dest: u64,
    count: u32,
    size: usize,
) -> u64 {
    let mask = mask_for_size(size);
    let bits = (size * 8) as u32;
    let dest = dest & mask;
    if count == 0 {
        return dest;
    }
    let sb = sign_bit(size);

    let result = match op {
        ShiftOp::Shl => {
            let wide = (dest as u128) << count;
            let result = (wide as u64) & mask;
            rflags.set(RFlags::CF, (wide >> bits) & 1 != 0);
            rflags.set(RFlags::OF, ((result ^ dest) & sb) != 0);
            result
        }
        ShiftOp::Shr => {
            let result = if count >= 64 { 0 } else { dest >> count };
            let last = if count > 64 { 0 } else { (dest as u128 >> (count - 1)) & 1 };
            rflags.set(RFlags::CF, last != 0);
            rflags.set(RFlags::OF, ((result ^ dest) & sb) != 0);
            result
        }
        ShiftOp::Sar => {
            let value = sign_extend(dest, size) as i64;
            let result = (value >> count.min(63)) as u64 & mask;
            let last = (value >> (count - 1).min(63)) & 1;
            rflags.set(RFlags::CF, last != 0);
            rflags.remove(RFlags::OF);
            result
        }
        ShiftOp::Rol | ShiftOp::Ror => {
            let rot = count % bits;
            let result = match op {
                ShiftOp::Rol => rotate_left(dest, rot, bits) & mask,
                _ => rotate_left(dest, (bits - rot) % bits, bits) & mask,
            };
            let msb = (result & sb) != 0;
            if op == ShiftOp::Rol {
                let cf = result & 1 != 0;
                rflags.set(RFlags::CF, cf);
                rflags.set(RFlags::OF, msb ^ cf);
            } else {
                let next = (result & (sb >> 1)) != 0;
                rflags.set(RFlags::CF, msb);
                rflags.set(RFlags::OF, msb ^ next);
            }
            return result;
        }
    };

    rflags.remove(RFlags::AF);
    set_result_flags(rflags, result, size);
    result
}

fn rotate_left(value: u64, rot: u32, bits: u32) -> u64 {
    if rot == 0 {
        return value;
    }
    (value << rot) | (value >> (bits - rot))
}

/// SHLD/SHRD. `count` must already be masked; zero leaves everything unchanged.
pub(crate) fn double_shift_with_flags(
    rflags: &mut RFlags,
    left: bool,
    dest: u64,
    src: u64,
    count: u32,
    size: usize,
) -> u64 {
    let mask = mask_for_size(size);
    let bits = (size * 8) as u32;
    let dest = dest & mask;
    let src = src & mask;
    if count == 0 {
        return dest;
    }

    let (result, cf) = if left {
        let combined = ((dest as u128) << bits) | src as u128;
        let shifted = combined << count;
        (
            ((shifted >> bits) as u64) & mask,
            (shifted >> (2 * bits)) & 1 != 0,
        )
    } else {
        let combined = ((src as u128) << bits) | dest as u128;
        (
            ((combined >> count) as u64) & mask,
            (combined >> (count - 1)) & 1 != 0,
        )
    };

    rflags.set(RFlags::CF, cf);
    rflags.set(RFlags::OF, ((result ^ dest) & sign_bit(size)) != 0);
    rflags.remove(RFlags::AF);
    set_result_flags(rflags, result, size);
    result
}

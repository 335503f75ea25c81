//! x86 decoding front-end for the emulator.
//!
//! `iced-x86` does the actual table-driven decoding. This crate turns its
//! output into an [`InstructionDescriptor`]: mnemonic, structured operands,
//! length and prefix flags. The descriptor is immutable and cheap to clone, so
//! the execution core can memoize it per guest address.

mod operand;

use iced_x86::{Decoder, DecoderError, DecoderOptions, EncodingKind};
use thiserror::Error;

pub use iced_x86::{
    Code, ConditionCode, FlowControl, Instruction, MemorySize, Mnemonic, OpKind, Register,
};
pub use operand::{MemOperand, Operand};

/// Architectural upper bound on the length of one x86 instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeMode {
    Bits16,
    Bits32,
    Bits64,
}

impl DecodeMode {
    pub const fn bitness(self) -> u32 {
        match self {
            DecodeMode::Bits16 => 16,
            DecodeMode::Bits32 => 32,
            DecodeMode::Bits64 => 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum DecodeError {
    /// The bytes do not form an instruction that is valid in the requested mode.
    #[error("invalid opcode")]
    InvalidOpcode,
    /// The window ended before the instruction did (including an empty window).
    #[error("instruction bytes truncated")]
    InsufficientBytes,
    /// The instruction decodes, but uses an encoding the emulator declines to run
    /// (VEX, EVEX, XOP, 3DNow!, MVEX).
    #[error("unsupported instruction encoding")]
    UnsupportedFeature,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Prefixes {
    pub lock: bool,
    pub rep: bool,
    pub repne: bool,
    /// Explicit segment override, if any (`Register::FS`, `Register::GS`, ...).
    pub segment: Option<Register>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionDescriptor {
    instr: Instruction,
    len: u8,
    prefixes: Prefixes,
}

impl InstructionDescriptor {
    #[inline]
    pub fn mnemonic(&self) -> Mnemonic {
        self.instr.mnemonic()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address the instruction was decoded at.
    #[inline]
    pub fn ip(&self) -> u64 {
        self.instr.ip()
    }

    /// Address of the following instruction (fallthrough target).
    #[inline]
    pub fn next_ip(&self) -> u64 {
        self.instr.next_ip()
    }

    #[inline]
    pub fn prefixes(&self) -> Prefixes {
        self.prefixes
    }

    #[inline]
    pub fn op_count(&self) -> usize {
        self.instr.op_count() as usize
    }

    /// Structured view of operand `index`; `None` past the last operand.
    pub fn operand(&self, index: usize) -> Option<Operand> {
        if index >= self.op_count() {
            return None;
        }
        Some(Operand::from_instruction(&self.instr, index as u32))
    }

    pub fn operands(&self) -> impl Iterator<Item = Operand> + '_ {
        (0..self.op_count()).filter_map(move |i| self.operand(i))
    }

    /// Width in bytes of the instruction's primary (first) operand.
    ///
    /// String instructions report their element size. Returns 0 for
    /// instructions without a sized operand.
    pub fn operand_size(&self) -> usize {
        match self.operand(0) {
            Some(Operand::Reg(reg)) => reg.size(),
            Some(Operand::Mem(mem)) => mem.size as usize,
            Some(Operand::Implicit) => self.instr.memory_size().size(),
            Some(Operand::Imm { size, .. }) => size as usize,
            Some(Operand::NearBranch(_)) | None => 0,
        }
    }

    /// Condition tested by Jcc/SETcc/CMOVcc/LOOPcc; `ConditionCode::None` otherwise.
    #[inline]
    pub fn condition(&self) -> ConditionCode {
        self.instr.condition_code()
    }

    /// Whether the instruction can redirect control flow.
    #[inline]
    pub fn flow_control(&self) -> FlowControl {
        self.instr.flow_control()
    }

    /// Signed RSP adjustment made by PUSH/POP/CALL/RET style instructions.
    #[inline]
    pub fn stack_pointer_increment(&self) -> i32 {
        self.instr.stack_pointer_increment()
    }

    /// Whether any operand uses 32-bit (or narrower) address-size arithmetic.
    pub fn has_address_size_override(&self) -> bool {
        (0..self.instr.op_count()).any(|i| {
            matches!(
                self.instr.op_kind(i),
                OpKind::MemorySegSI
                    | OpKind::MemorySegESI
                    | OpKind::MemorySegDI
                    | OpKind::MemorySegEDI
                    | OpKind::MemoryESDI
                    | OpKind::MemoryESEDI
            )
        }) || matches!(self.instr.memory_base().size(), 2 | 4)
            || matches!(self.instr.memory_index().size(), 2 | 4)
    }

    /// Escape hatch to the backend instruction for rarely-used details.
    #[inline]
    pub fn raw(&self) -> &Instruction {
        &self.instr
    }
}

/// Decode one instruction from `bytes` located at guest address `address`.
///
/// Only the first [`MAX_INSTRUCTION_LEN`] bytes are looked at. This function
/// has no side effects.
pub fn decode(
    bytes: &[u8],
    address: u64,
    mode: DecodeMode,
) -> Result<InstructionDescriptor, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::InsufficientBytes);
    }
    let window = &bytes[..bytes.len().min(MAX_INSTRUCTION_LEN)];

    let instr = match decode_one(window, address, mode) {
        Ok(instr) => instr,
        Err(DecoderError::NoMoreBytes) => return Err(classify_truncated(window, address, mode)),
        Err(_) => return Err(DecodeError::InvalidOpcode),
    };
    if instr.encoding() != EncodingKind::Legacy {
        return Err(DecodeError::UnsupportedFeature);
    }

    let segment = match instr.segment_prefix() {
        Register::None => None,
        seg => Some(seg),
    };
    let prefixes = Prefixes {
        lock: instr.has_lock_prefix(),
        rep: instr.has_rep_prefix(),
        repne: instr.has_repne_prefix(),
        segment,
    };

    Ok(InstructionDescriptor {
        len: instr.len() as u8,
        instr,
        prefixes,
    })
}

fn decode_one(window: &[u8], address: u64, mode: DecodeMode) -> Result<Instruction, DecoderError> {
    let mut decoder = Decoder::with_ip(mode.bitness(), window, address, DecoderOptions::NONE);
    let instr = decoder.decode();
    if instr.is_invalid() {
        Err(decoder.last_error())
    } else {
        Ok(instr)
    }
}

/// The backend ran out of bytes, which it also reports for opcodes that are
/// invalid no matter what follows. Decode again with the window padded to the
/// architectural maximum: only an instruction that would really extend past
/// the window counts as truncated.
fn classify_truncated(window: &[u8], address: u64, mode: DecodeMode) -> DecodeError {
    let mut padded = [0u8; MAX_INSTRUCTION_LEN];
    padded[..window.len()].copy_from_slice(window);
    match decode_one(&padded, address, mode) {
        Ok(_) | Err(DecoderError::NoMoreBytes) => DecodeError::InsufficientBytes,
        Err(_) => DecodeError::InvalidOpcode,
    }
}

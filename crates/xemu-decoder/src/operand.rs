use iced_x86::{Instruction, OpKind, Register};

/// A decoded memory operand.
///
/// For RIP-relative operands the backend has already folded the next-IP into
/// `displacement`, so `base` is reported as [`Register::None`] and the
/// displacement is the absolute address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Register,
    pub index: Register,
    pub scale: u8,
    pub displacement: u64,
    /// Effective segment (override or default).
    pub segment: Register,
    /// Access width in bytes. Zero for operands that do not access memory (LEA
    /// still reports the nominal width; callers that only need the address ignore it).
    pub size: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Register),
    /// Immediate, already sign-extended by the backend where the encoding says so.
    Imm { value: u64, size: u8 },
    Mem(MemOperand),
    /// Absolute target of a relative branch.
    NearBranch(u64),
    /// Implicit string/segment operands (`[rsi]`, `es:[rdi]`) and far pointers;
    /// handlers for those instructions address memory themselves.
    Implicit,
}

impl Operand {
    pub(crate) fn from_instruction(instr: &Instruction, index: u32) -> Operand {
        match instr.op_kind(index) {
            OpKind::Register => Operand::Reg(instr.op_register(index)),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Operand::NearBranch(instr.near_branch_target())
            }
            kind @ (OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64) => Operand::Imm {
                value: instr.immediate(index),
                size: immediate_size(kind),
            },
            OpKind::Memory => {
                let rip_relative = instr.is_ip_rel_memory_operand();
                Operand::Mem(MemOperand {
                    base: if rip_relative {
                        Register::None
                    } else {
                        instr.memory_base()
                    },
                    index: instr.memory_index(),
                    scale: instr.memory_index_scale() as u8,
                    displacement: if rip_relative {
                        instr.ip_rel_memory_address()
                    } else {
                        instr.memory_displacement64()
                    },
                    segment: instr.memory_segment(),
                    size: instr.memory_size().size() as u8,
                })
            }
            _ => Operand::Implicit,
        }
    }

    /// Width in bytes, where the operand has one.
    pub fn size(&self) -> Option<usize> {
        match *self {
            Operand::Reg(reg) => Some(reg.size()),
            Operand::Imm { size, .. } => Some(size as usize),
            Operand::Mem(mem) => Some(mem.size as usize),
            Operand::NearBranch(_) | Operand::Implicit => None,
        }
    }
}

fn immediate_size(kind: OpKind) -> u8 {
    match kind {
        OpKind::Immediate8 | OpKind::Immediate8_2nd => 1,
        OpKind::Immediate16 | OpKind::Immediate8to16 => 2,
        OpKind::Immediate32 | OpKind::Immediate8to32 => 4,
        _ => 8,
    }
}

use bitflags::bitflags;
use thiserror::Error;
use xemu_decoder::Register;

/// Architectural GPR indices (matches the ModRM/REX register numbering).
pub mod gpr {
    pub const RAX: usize = 0;
    pub const RCX: usize = 1;
    pub const RDX: usize = 2;
    pub const RBX: usize = 3;
    pub const RSP: usize = 4;
    pub const RBP: usize = 5;
    pub const RSI: usize = 6;
    pub const RDI: usize = 7;
    pub const R8: usize = 8;
    pub const R9: usize = 9;
    pub const R10: usize = 10;
    pub const R11: usize = 11;
    pub const R12: usize = 12;
    pub const R13: usize = 13;
    pub const R14: usize = 14;
    pub const R15: usize = 15;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RFlags: u64 {
        const CF = 1 << 0;
        /// Reserved, always reads as 1.
        const FIXED = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
        const AC = 1 << 18;
        const ID = 1 << 21;

        /// The six arithmetic status flags.
        const STATUS = Self::CF.bits()
            | Self::PF.bits()
            | Self::AF.bits()
            | Self::ZF.bits()
            | Self::SF.bits()
            | Self::OF.bits();
        /// Bits POPF may change at CPL 3.
        const USER_WRITABLE = Self::STATUS.bits()
            | Self::TF.bits()
            | Self::DF.bits()
            | Self::AC.bits()
            | Self::ID.bits();
    }
}

impl Default for RFlags {
    /// Value the Linux kernel hands a new user thread (`IF` plus the fixed bit).
    fn default() -> Self {
        RFlags::FIXED | RFlags::IF
    }
}

/// Segment selector slots, in `mov Sreg` encoding order.
pub mod seg {
    pub const ES: usize = 0;
    pub const CS: usize = 1;
    pub const SS: usize = 2;
    pub const DS: usize = 3;
    pub const FS: usize = 4;
    pub const GS: usize = 5;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("register {0:?} is not modelled")]
pub struct UnsupportedRegister(pub Register);

/// Architectural state of one guest thread.
///
/// The struct is `Copy` on purpose: instruction handlers run against a copy
/// and the execution core commits it only when the instruction retires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFile {
    pub gpr: [u64; 16],
    pub rip: u64,
    pub rflags: RFlags,
    pub segments: [u16; 6],
    pub fs_base: u64,
    pub gs_base: u64,
    /// XMM0-XMM15, lane 0 in the low bits.
    pub xmm: [u128; 16],
    pub mxcsr: u32,
}

/// MXCSR after reset: every exception masked, round to nearest.
pub const MXCSR_DEFAULT: u32 = 0x1f80;

impl Default for RegisterFile {
    fn default() -> Self {
        let mut segments = [0u16; 6];
        // Linux x86-64 user selectors.
        segments[seg::CS] = 0x33;
        segments[seg::SS] = 0x2b;
        Self {
            gpr: [0; 16],
            rip: 0,
            rflags: RFlags::default(),
            segments,
            fs_base: 0,
            gs_base: 0,
            xmm: [0; 16],
            mxcsr: MXCSR_DEFAULT,
        }
    }
}

impl RegisterFile {
    pub fn new(rip: u64, rsp: u64) -> Self {
        let mut regs = Self {
            rip,
            ..Self::default()
        };
        regs.gpr[gpr::RSP] = rsp;
        regs
    }

    /// Read any modelled register at its natural width, zero-extended.
    pub fn read_reg(&self, reg: Register) -> Result<u64, UnsupportedRegister> {
        if let Some((idx, shift, bits)) = gpr_access(reg) {
            let value = self.gpr[idx] >> shift;
            return Ok(match bits {
                8 => value & 0xff,
                16 => value & 0xffff,
                32 => value & 0xffff_ffff,
                _ => value,
            });
        }
        match reg {
            Register::RIP => Ok(self.rip),
            Register::EIP => Ok(self.rip & 0xffff_ffff),
            _ => segment_slot(reg)
                .map(|slot| self.segments[slot] as u64)
                .ok_or(UnsupportedRegister(reg)),
        }
    }

    /// Write a GPR with x86-64 partial-register rules: 32-bit writes clear the
    /// upper half, 8/16-bit writes preserve the rest.
    pub fn write_reg(&mut self, reg: Register, value: u64) -> Result<(), UnsupportedRegister> {
        let (idx, shift, bits) = gpr_access(reg).ok_or(UnsupportedRegister(reg))?;
        let slot = &mut self.gpr[idx];
        *slot = match bits {
            64 => value,
            32 => value & 0xffff_ffff,
            _ => {
                let mask = ((1u64 << bits) - 1) << shift;
                (*slot & !mask) | ((value << shift) & mask)
            }
        };
        Ok(())
    }

    /// Flags as the guest observes them: the fixed bit is always set.
    #[inline]
    pub fn flags(&self) -> u64 {
        (self.rflags | RFlags::FIXED).bits()
    }
}

/// Map an iced register to `(gpr index, bit shift, width in bits)`.
pub(crate) fn gpr_access(reg: Register) -> Option<(usize, u32, u32)> {
    use Register::*;
    Some(match reg {
        AL => (gpr::RAX, 0, 8),
        CL => (gpr::RCX, 0, 8),
        DL => (gpr::RDX, 0, 8),
        BL => (gpr::RBX, 0, 8),
        AH => (gpr::RAX, 8, 8),
        CH => (gpr::RCX, 8, 8),
        DH => (gpr::RDX, 8, 8),
        BH => (gpr::RBX, 8, 8),
        SPL => (gpr::RSP, 0, 8),
        BPL => (gpr::RBP, 0, 8),
        SIL => (gpr::RSI, 0, 8),
        DIL => (gpr::RDI, 0, 8),
        R8L => (gpr::R8, 0, 8),
        R9L => (gpr::R9, 0, 8),
        R10L => (gpr::R10, 0, 8),
        R11L => (gpr::R11, 0, 8),
        R12L => (gpr::R12, 0, 8),
        R13L => (gpr::R13, 0, 8),
        R14L => (gpr::R14, 0, 8),
        R15L => (gpr::R15, 0, 8),

        AX => (gpr::RAX, 0, 16),
        CX => (gpr::RCX, 0, 16),
        DX => (gpr::RDX, 0, 16),
        BX => (gpr::RBX, 0, 16),
        SP => (gpr::RSP, 0, 16),
        BP => (gpr::RBP, 0, 16),
        SI => (gpr::RSI, 0, 16),
        DI => (gpr::RDI, 0, 16),
        R8W => (gpr::R8, 0, 16),
        R9W => (gpr::R9, 0, 16),
        R10W => (gpr::R10, 0, 16),
        R11W => (gpr::R11, 0, 16),
        R12W => (gpr::R12, 0, 16),
        R13W => (gpr::R13, 0, 16),
        R14W => (gpr::R14, 0, 16),
        R15W => (gpr::R15, 0, 16),

        EAX => (gpr::RAX, 0, 32),
        ECX => (gpr::RCX, 0, 32),
        EDX => (gpr::RDX, 0, 32),
        EBX => (gpr::RBX, 0, 32),
        ESP => (gpr::RSP, 0, 32),
        EBP => (gpr::RBP, 0, 32),
        ESI => (gpr::RSI, 0, 32),
        EDI => (gpr::RDI, 0, 32),
        R8D => (gpr::R8, 0, 32),
        R9D => (gpr::R9, 0, 32),
        R10D => (gpr::R10, 0, 32),
        R11D => (gpr::R11, 0, 32),
        R12D => (gpr::R12, 0, 32),
        R13D => (gpr::R13, 0, 32),
        R14D => (gpr::R14, 0, 32),
        R15D => (gpr::R15, 0, 32),

        RAX => (gpr::RAX, 0, 64),
        RCX => (gpr::RCX, 0, 64),
        RDX => (gpr::RDX, 0, 64),
        RBX => (gpr::RBX, 0, 64),
        RSP => (gpr::RSP, 0, 64),
        RBP => (gpr::RBP, 0, 64),
        RSI => (gpr::RSI, 0, 64),
        RDI => (gpr::RDI, 0, 64),
        R8 => (gpr::R8, 0, 64),
        R9 => (gpr::R9, 0, 64),
        R10 => (gpr::R10, 0, 64),
        R11 => (gpr::R11, 0, 64),
        R12 => (gpr::R12, 0, 64),
        R13 => (gpr::R13, 0, 64),
        R14 => (gpr::R14, 0, 64),
        R15 => (gpr::R15, 0, 64),
        _ => return Option::None,
    })
}

/// Index into [`RegisterFile::xmm`] for XMM0-XMM15.
pub(crate) fn xmm_index(reg: Register) -> Option<usize> {
    if reg.is_xmm() && reg.number() < 16 {
        Some(reg.number())
    } else {
        None
    }
}

fn segment_slot(reg: Register) -> Option<usize> {
    Some(match reg {
        Register::ES => seg::ES,
        Register::CS => seg::CS,
        Register::SS => seg::SS,
        Register::DS => seg::DS,
        Register::FS => seg::FS,
        Register::GS => seg::GS,
        _ => return None,
    })
}

//! Instruction semantics.
//!
//! Every supported mnemonic has one handler in a flat table indexed by
//! `Mnemonic as usize`, so dispatch is a single bounds-checked load. Handlers
//! run against a scratch copy of the register file and must perform every
//! check that can fail before the (single) memory store that commits their
//! effect; the core only commits the register copy if the handler returns `Ok`.

pub(crate) mod alu;
mod ops_alu;
mod ops_atomics;
mod ops_bit;
mod ops_cf;
mod ops_data;
mod ops_muldiv;
mod ops_shift;
mod ops_sse;
mod ops_string;

use crate::fault::FaultKind;
use crate::state::{gpr, RFlags, RegisterFile};
use crate::trace::MemWrite;
use alu::mask_for_size;
use std::sync::OnceLock;
use xemu_decoder::{InstructionDescriptor, MemOperand, Mnemonic, Operand, Register};
use xemu_mem::AddressSpace;

/// How a retired instruction moves RIP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecOutcome {
    Continue,
    Branch(u64),
    /// `syscall`: RIP moves past the instruction and control goes to the host.
    Syscall,
}

pub(crate) type Handler = fn(&mut Machine<'_>, &InstructionDescriptor) -> Result<ExecOutcome, FaultKind>;

/// Everything a handler may touch.
pub(crate) struct Machine<'a> {
    pub(crate) regs: &'a mut RegisterFile,
    pub(crate) mem: &'a AddressSpace,
    /// Instructions retired so far by this thread (feeds `rdtsc`).
    pub(crate) retired: u64,
    /// Stores performed, when tracing is on.
    pub(crate) writes: Option<&'a mut Vec<MemWrite>>,
    pub(crate) stored: bool,
}

impl<'a> Machine<'a> {
    pub(crate) fn new(
        regs: &'a mut RegisterFile,
        mem: &'a AddressSpace,
        retired: u64,
        writes: Option<&'a mut Vec<MemWrite>>,
    ) -> Self {
        Self {
            regs,
            mem,
            retired,
            writes,
            stored: false,
        }
    }

    #[inline]
    pub(crate) fn flags(&mut self) -> &mut RFlags {
        &mut self.regs.rflags
    }

    #[inline]
    pub(crate) fn gpr(&self, idx: usize) -> u64 {
        self.regs.gpr[idx]
    }

    #[inline]
    pub(crate) fn set_gpr(&mut self, idx: usize, value: u64) {
        self.regs.gpr[idx] = value;
    }

    /// Write the low `size` bytes of GPR `idx` with partial-register rules.
    pub(crate) fn set_gpr_sized(&mut self, idx: usize, size: usize, value: u64) {
        let slot = &mut self.regs.gpr[idx];
        *slot = match size {
            8 => value,
            4 => value & 0xffff_ffff,
            _ => {
                let mask = mask_for_size(size);
                (*slot & !mask) | (value & mask)
            }
        };
    }

    // ---- addressing ----

    /// Effective address without the segment base (what LEA computes).
    pub(crate) fn offset(&self, mem: &MemOperand) -> Result<u64, FaultKind> {
        let mut addr = mem.displacement;
        let mut narrow = false;
        if mem.base != Register::None {
            narrow |= mem.base.size() == 4;
            addr = addr.wrapping_add(self.regs.read_reg(mem.base)?);
        }
        if mem.index != Register::None {
            narrow |= mem.index.size() == 4;
            let index = self.regs.read_reg(mem.index)?;
            addr = addr.wrapping_add(index.wrapping_mul(mem.scale as u64));
        }
        Ok(if narrow { addr & 0xffff_ffff } else { addr })
    }

    /// Linear address: FS and GS add their base, other segments are flat.
    pub(crate) fn linear(&self, mem: &MemOperand) -> Result<u64, FaultKind> {
        let offset = self.offset(mem)?;
        Ok(match mem.segment {
            Register::FS => offset.wrapping_add(self.regs.fs_base),
            Register::GS => offset.wrapping_add(self.regs.gs_base),
            _ => offset,
        })
    }

    // ---- memory ----

    pub(crate) fn load(&self, addr: u64, size: usize) -> Result<u64, FaultKind> {
        let mut buf = [0u8; 8];
        self.mem.read(addr, &mut buf[..size])?;
        Ok(u64::from_le_bytes(buf))
    }

    pub(crate) fn store(&mut self, addr: u64, size: usize, value: u64) -> Result<(), FaultKind> {
        let bytes = value.to_le_bytes();
        self.mem.write(addr, &bytes[..size])?;
        self.record_store(addr, &bytes[..size]);
        Ok(())
    }

    /// Up to 16 bytes, zero-extended.
    pub(crate) fn load_wide(&self, addr: u64, size: usize) -> Result<u128, FaultKind> {
        let mut buf = [0u8; 16];
        self.mem.read(addr, &mut buf[..size])?;
        Ok(u128::from_le_bytes(buf))
    }

    pub(crate) fn store_wide(&mut self, addr: u64, size: usize, value: u128) -> Result<(), FaultKind> {
        let bytes = value.to_le_bytes();
        self.mem.write(addr, &bytes[..size])?;
        self.record_store(addr, &bytes[..size]);
        Ok(())
    }

    pub(crate) fn record_store(&mut self, addr: u64, bytes: &[u8]) {
        self.stored = true;
        if let Some(log) = self.writes.as_deref_mut() {
            log.push(MemWrite {
                addr,
                bytes: bytes.to_vec(),
            });
        }
    }

    // ---- operands ----

    pub(crate) fn read(&self, op: &Operand, size: usize) -> Result<u64, FaultKind> {
        match *op {
            Operand::Reg(reg) => Ok(self.regs.read_reg(reg)?),
            Operand::Imm { value, .. } => Ok(value & mask_for_size(size)),
            Operand::Mem(ref mem) => self.load(self.linear(mem)?, size),
            Operand::NearBranch(target) => Ok(target),
            Operand::Implicit => Err(FaultKind::unsupported()),
        }
    }

    pub(crate) fn write(&mut self, op: &Operand, size: usize, value: u64) -> Result<(), FaultKind> {
        match *op {
            Operand::Reg(reg) => Ok(self.regs.write_reg(reg, value)?),
            Operand::Mem(ref mem) => {
                let addr = self.linear(mem)?;
                self.store(addr, size, value)
            }
            _ => Err(FaultKind::invalid()),
        }
    }

    /// Check that `op` could be stored to, so a handler can fail before it
    /// changes anything else.
    pub(crate) fn probe_write(&self, op: &Operand, size: usize) -> Result<(), FaultKind> {
        if let Operand::Mem(ref mem) = *op {
            let addr = self.linear(mem)?;
            self.mem
                .check_range(addr, size as u64, xemu_mem::Access::Write)?;
        }
        Ok(())
    }

    /// Read-modify-write of a register or memory destination. The address is
    /// computed once; the store (if any) is the last thing that happens.
    pub(crate) fn modify(
        &mut self,
        dst: &Operand,
        size: usize,
        writeback: bool,
        f: impl FnOnce(&mut RFlags, u64) -> u64,
    ) -> Result<(), FaultKind> {
        match *dst {
            Operand::Reg(reg) => {
                let old = self.regs.read_reg(reg)?;
                let new = f(&mut self.regs.rflags, old);
                if writeback {
                    self.regs.write_reg(reg, new)?;
                }
                Ok(())
            }
            Operand::Mem(ref mem) => {
                let addr = self.linear(mem)?;
                let old = self.load(addr, size)?;
                let new = f(&mut self.regs.rflags, old);
                if writeback && new != old {
                    self.store(addr, size, new)?;
                } else if writeback {
                    // Unchanged values still need a writable page.
                    self.mem
                        .check_range(addr, size as u64, xemu_mem::Access::Write)?;
                }
                Ok(())
            }
            _ => Err(FaultKind::invalid()),
        }
    }

    // ---- stack ----

    /// Push: the store happens before RSP moves, so a faulting push leaves
    /// RSP untouched.
    pub(crate) fn push(&mut self, value: u64, size: usize) -> Result<(), FaultKind> {
        let rsp = self.gpr(gpr::RSP).wrapping_sub(size as u64);
        self.store(rsp, size, value)?;
        self.set_gpr(gpr::RSP, rsp);
        Ok(())
    }

    pub(crate) fn pop(&mut self, size: usize) -> Result<u64, FaultKind> {
        let rsp = self.gpr(gpr::RSP);
        let value = self.load(rsp, size)?;
        self.set_gpr(gpr::RSP, rsp.wrapping_add(size as u64));
        Ok(value)
    }
}

/// Operand `index`, or a decode failure if the form has fewer operands than
/// the handler expects.
#[inline]
pub(crate) fn operand(inst: &InstructionDescriptor, index: usize) -> Result<Operand, FaultKind> {
    inst.operand(index).ok_or_else(FaultKind::unsupported)
}

/// Width of a sized operand (1, 2, 4 or 8 bytes).
#[inline]
pub(crate) fn width(op: &Operand) -> Result<usize, FaultKind> {
    match op.size() {
        Some(size @ (1 | 2 | 4 | 8)) => Ok(size),
        _ => Err(FaultKind::unsupported()),
    }
}

// ---- dispatch ----

pub(crate) struct DispatchTable {
    handlers: Box<[Option<Handler>]>,
}

impl DispatchTable {
    fn build() -> Self {
        let mut table = Self {
            handlers: vec![None; Mnemonic::values().len()].into_boxed_slice(),
        };
        ops_alu::register(&mut table);
        ops_atomics::register(&mut table);
        ops_bit::register(&mut table);
        ops_cf::register(&mut table);
        ops_data::register(&mut table);
        ops_muldiv::register(&mut table);
        ops_shift::register(&mut table);
        ops_string::register(&mut table);
        // MOVSD is shared by the string move and the scalar double move.
        ops_sse::register(&mut table);
        table
    }

    pub(crate) fn set(&mut self, mnemonic: Mnemonic, handler: Handler) {
        if let Some(slot) = self.handlers.get_mut(mnemonic as usize) {
            *slot = Some(handler);
        }
    }

    #[inline]
    fn get(&self, mnemonic: Mnemonic) -> Option<Handler> {
        self.handlers.get(mnemonic as usize).copied().flatten()
    }
}

fn table() -> &'static DispatchTable {
    static TABLE: OnceLock<DispatchTable> = OnceLock::new();
    TABLE.get_or_init(DispatchTable::build)
}

/// Pick the handler for `inst`, rejecting `lock` where x86 raises #UD.
pub(crate) fn resolve(inst: &InstructionDescriptor) -> Result<Handler, FaultKind> {
    if inst.prefixes().lock {
        if !ops_atomics::mnemonic_allows_lock_prefix(inst.mnemonic())
            || !matches!(inst.operand(0), Some(Operand::Mem(_)))
        {
            return Err(FaultKind::invalid());
        }
        return Ok(ops_atomics::exec_locked);
    }
    table()
        .get(inst.mnemonic())
        .ok_or_else(FaultKind::unsupported)
}

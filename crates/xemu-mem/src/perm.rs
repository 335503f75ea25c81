use bitflags::bitflags;
use core::fmt;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;

        const RW = Self::READ.bits() | Self::WRITE.bits();
        const RX = Self::READ.bits() | Self::EXEC.bits();
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

impl Permissions {
    /// Decode ELF `p_flags` / `PROT_*` style bits (R=4 W=2 X=1 for ELF).
    pub fn from_elf_flags(flags: u32) -> Self {
        let mut perms = Permissions::empty();
        perms.set(Permissions::READ, flags & 0x4 != 0);
        perms.set(Permissions::WRITE, flags & 0x2 != 0);
        perms.set(Permissions::EXEC, flags & 0x1 != 0);
        perms
    }

    /// Decode Linux `PROT_READ`/`PROT_WRITE`/`PROT_EXEC` (1/2/4).
    pub fn from_prot(prot: u64) -> Self {
        let mut perms = Permissions::empty();
        perms.set(Permissions::READ, prot & 0x1 != 0);
        perms.set(Permissions::WRITE, prot & 0x2 != 0);
        perms.set(Permissions::EXEC, prot & 0x4 != 0);
        perms
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.contains(Permissions::READ) { 'r' } else { '-' };
        let w = if self.contains(Permissions::WRITE) { 'w' } else { '-' };
        let x = if self.contains(Permissions::EXEC) { 'x' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}

/// Kind of guest access being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    pub const fn required(self) -> Permissions {
        match self {
            Access::Read => Permissions::READ,
            Access::Write => Permissions::WRITE,
            Access::Execute => Permissions::EXEC,
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::Execute => "execute",
        })
    }
}

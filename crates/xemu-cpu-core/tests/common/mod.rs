#![allow(dead_code)]

use std::sync::Arc;
use xemu_cpu_core::{CoreConfig, ExecutionContext, ExecutionCore, RegisterFile, RunExit, StepResult};
use xemu_mem::{AddressSpace, Backing, Permissions, PAGE_SIZE};

pub const CODE: u64 = 0x40_0000;
pub const DATA: u64 = 0x60_0000;
pub const DATA_LEN: u64 = 0x1_0000;
pub const STACK_TOP: u64 = 0x7fff_0000;
pub const STACK_LEN: u64 = 0x1_0000;

pub struct Guest {
    pub space: Arc<AddressSpace>,
    pub ctx: ExecutionContext,
    pub core: ExecutionCore,
}

impl Guest {
    pub fn step(&mut self) -> StepResult {
        self.core.step(&mut self.ctx).expect("step")
    }

    pub fn run(&mut self, max: u64) -> RunExit {
        self.core.run(&mut self.ctx, max).expect("run")
    }

    /// Step until something other than plain retirement happens.
    pub fn run_to_stop(&mut self) -> StepResult {
        loop {
            let exit = self.run(1 << 20);
            if exit.result != StepResult::Completed {
                return exit.result;
            }
        }
    }
}

pub fn guest(code: &[u8]) -> Guest {
    guest_with(code, CoreConfig::interpreter_only(), Permissions::RX)
}

pub fn guest_with(code: &[u8], cfg: CoreConfig, code_perms: Permissions) -> Guest {
    let space = Arc::new(AddressSpace::new());
    let code_len = (code.len() as u64).div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
    space
        .map(CODE, code_len, code_perms, Backing::Anonymous)
        .expect("map code");
    space.write_unchecked(CODE, code).expect("load code");
    space
        .map(DATA, DATA_LEN, Permissions::RW, Backing::Anonymous)
        .expect("map data");
    space
        .map(STACK_TOP - STACK_LEN, STACK_LEN, Permissions::RW, Backing::Anonymous)
        .expect("map stack");
    let ctx = ExecutionContext::new(1, &space, RegisterFile::new(CODE, STACK_TOP));
    Guest {
        space,
        ctx,
        core: ExecutionCore::new(cfg),
    }
}

mod common;

use anyhow::Result;
use common::*;
use std::sync::Arc;
use xemu::cpu::{
    gpr, ArithmeticTrap, CoreConfig, ExecutionContext, ExecutionCore, FaultKind, PendingFault,
    StepResult,
};
use xemu::decoder::{decode, DecodeError, DecodeMode};
use xemu::mem::{Access, AddressSpace, Backing, MemoryFault, Permissions, VmmError};

#[test]
fn store_then_load_round_trips() -> Result<()> {
    let space = AddressSpace::new();
    space.map(0x1000, 4096, Permissions::RW, Backing::Anonymous)?;
    space.write_u32(0x1000, 0x1234)?;
    assert_eq!(space.read_u32(0x1000)?, 0x1234);
    Ok(())
}

#[test]
fn overlapping_map_leaves_the_original_page_alone() -> Result<()> {
    let space = AddressSpace::new();
    space.map(0x1000, 4096, Permissions::RW, Backing::Anonymous)?;
    space.write_u8(0x1010, 0x5A)?;

    let err = space
        .map(0x0, 0x3000, Permissions::RX, Backing::Anonymous)
        .unwrap_err();
    assert!(matches!(err, VmmError::Overlap { existing: 0x1000, .. }), "{err:?}");
    assert_eq!(space.read_u8(0x1010)?, 0x5A);
    assert_eq!(space.page(0x1000).map(|p| p.perms), Some(Permissions::RW));
    assert!(space.page(0x0).is_none());
    Ok(())
}

#[test]
fn access_outside_permissions_is_denied() -> Result<()> {
    let space = AddressSpace::new();
    space.map(0x1000, 4096, Permissions::READ, Backing::Anonymous)?;
    assert_eq!(
        space.write_u8(0x1000, 1),
        Err(MemoryFault::PermissionDenied {
            addr: 0x1000,
            access: Access::Write
        })
    );
    assert_eq!(
        space.read_u8(0x3000),
        Err(MemoryFault::Unmapped {
            addr: 0x3000,
            access: Access::Read
        })
    );
    Ok(())
}

#[test]
fn empty_window_is_insufficient_bytes() {
    assert_eq!(
        decode(&[], 0x40_0000, DecodeMode::Bits64).map(|_| ()),
        Err(DecodeError::InsufficientBytes)
    );
}

#[test]
fn divide_by_zero_is_delivered_to_the_thread() -> Result<()> {
    // mov eax, 10; xor ecx, ecx; div ecx
    let space = flat_space(&[0xB8, 0x0A, 0, 0, 0, 0x31, 0xC9, 0xF7, 0xF1]);
    let mut ctx = ExecutionContext::new(1, &space, regs_at(CODE));
    let mut core = ExecutionCore::new(CoreConfig::default());

    let exit = core.run(&mut ctx, 100)?;
    let kind = FaultKind::Arithmetic(ArithmeticTrap::DivideByZero);
    assert_eq!(exit.executed, 2);
    assert_eq!(
        exit.result,
        StepResult::Faulted {
            kind,
            addr: CODE + 7
        }
    );
    assert_eq!(ctx.regs.rip, CODE + 7);
    assert_eq!(ctx.regs.gpr[gpr::RAX], 10);
    assert_eq!(
        ctx.take_fault(),
        Some(PendingFault {
            kind,
            addr: CODE + 7
        })
    );
    assert!(!ctx.is_halted());
    Ok(())
}

#[test]
fn two_threads_lock_inc_reach_two_n() -> Result<()> {
    const N: u64 = 20_000;
    // 1: lock inc qword [rbx]; dec rcx; jnz 1b; syscall
    let code = [0xF0, 0x48, 0xFF, 0x03, 0x48, 0xFF, 0xC9, 0x75, 0xF7, 0x0F, 0x05];
    let space = flat_space(&code);

    let workers: Vec<_> = (0..2)
        .map(|tid| {
            let space: Arc<AddressSpace> = space.clone();
            std::thread::spawn(move || {
                let mut regs = regs_at(CODE);
                regs.gpr[gpr::RBX] = DATA;
                regs.gpr[gpr::RCX] = N;
                let mut ctx = ExecutionContext::new(tid + 1, &space, regs);
                let mut core = ExecutionCore::new(CoreConfig::default());
                loop {
                    let exit = core.run(&mut ctx, 4096).expect("run");
                    match exit.result {
                        StepResult::Completed => continue,
                        StepResult::SyscallRequested(_) => break,
                        other => panic!("thread {tid}: {other:?}"),
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }
    assert_eq!(space.read_u64(DATA)?, 2 * N);
    Ok(())
}

mod read_after_write {
    use proptest::prelude::*;
    use xemu::mem::{AddressSpace, Backing, Permissions};

    const BASE: u64 = 0x10_0000;
    const LEN: usize = 0x2000;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn reads_return_the_last_bytes_written(
            writes in proptest::collection::vec((0usize..LEN, proptest::collection::vec(any::<u8>(), 1..64)), 1..32),
        ) {
            let space = AddressSpace::new();
            space.map(BASE, LEN as u64, Permissions::RW, Backing::Anonymous).unwrap();
            let mut model = vec![0u8; LEN];
            for (offset, bytes) in &writes {
                let len = bytes.len().min(LEN - offset);
                space.write(BASE + *offset as u64, &bytes[..len]).unwrap();
                model[*offset..offset + len].copy_from_slice(&bytes[..len]);
            }
            let mut got = vec![0u8; LEN];
            space.read(BASE, &mut got).unwrap();
            prop_assert_eq!(got, model);
        }
    }
}

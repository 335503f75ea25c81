mod common;

use common::*;
use xemu_cpu_core::{gpr, FaultKind, RFlags, StepResult};
use xemu_mem::MemoryFault;

fn read_bytes(g: &Guest, addr: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0; len];
    g.space.read(addr, &mut buf).unwrap();
    buf
}

#[test]
fn rep_movsb_copies_forward() {
    let mut g = guest(&[0xF3, 0xA4]);
    let src: Vec<u8> = (0..64u8).collect();
    g.space.write(DATA, &src).unwrap();
    g.ctx.regs.gpr[gpr::RSI] = DATA;
    g.ctx.regs.gpr[gpr::RDI] = DATA + 0x1000;
    g.ctx.regs.gpr[gpr::RCX] = 64;

    assert_eq!(g.step(), StepResult::Completed);
    assert_eq!(read_bytes(&g, DATA + 0x1000, 64), src);
    assert_eq!(g.ctx.regs.gpr[gpr::RCX], 0);
    assert_eq!(g.ctx.regs.gpr[gpr::RSI], DATA + 64);
    assert_eq!(g.ctx.regs.gpr[gpr::RDI], DATA + 0x1000 + 64);
    assert_eq!(g.ctx.retired(), 1);
}

#[test]
fn overlapping_rep_movsb_replicates_the_first_byte() {
    let mut g = guest(&[0xF3, 0xA4]);
    g.space.write(DATA, &[0xAB, 1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    g.ctx.regs.gpr[gpr::RSI] = DATA;
    g.ctx.regs.gpr[gpr::RDI] = DATA + 1;
    g.ctx.regs.gpr[gpr::RCX] = 8;

    assert_eq!(g.step(), StepResult::Completed);
    assert_eq!(read_bytes(&g, DATA, 9), vec![0xAB; 9]);
}

#[test]
fn rep_movs_into_unmapped_memory_copies_nothing() {
    let mut g = guest(&[0xF3, 0xA4]);
    g.space.write(DATA, &[0x55; 32]).unwrap();
    g.ctx.regs.gpr[gpr::RSI] = DATA;
    g.ctx.regs.gpr[gpr::RDI] = DATA + DATA_LEN - 16;
    g.ctx.regs.gpr[gpr::RCX] = 32;
    let before = g.ctx.regs;

    let result = g.step();
    assert!(
        matches!(
            result,
            StepResult::Faulted {
                kind: FaultKind::Memory(MemoryFault::Unmapped { .. }),
                addr: CODE,
            }
        ),
        "{result:?}"
    );
    assert_eq!(g.ctx.regs, before);
    assert_eq!(read_bytes(&g, DATA + DATA_LEN - 16, 16), vec![0; 16]);
}

#[test]
fn rep_stosq_fills_qwords() {
    let mut g = guest(&[0xF3, 0x48, 0xAB]);
    g.ctx.regs.gpr[gpr::RAX] = 0x1122_3344_5566_7788;
    g.ctx.regs.gpr[gpr::RDI] = DATA;
    g.ctx.regs.gpr[gpr::RCX] = 4;

    assert_eq!(g.step(), StepResult::Completed);
    for i in 0..4 {
        assert_eq!(g.space.read_u64(DATA + i * 8).unwrap(), 0x1122_3344_5566_7788);
    }
    assert_eq!(g.space.read_u64(DATA + 32).unwrap(), 0);
    assert_eq!(g.ctx.regs.gpr[gpr::RDI], DATA + 32);
}

#[test]
fn stosb_with_direction_flag_walks_down() {
    // std; rep stosb
    let mut g = guest(&[0xFD, 0xF3, 0xAA]);
    g.ctx.regs.gpr[gpr::RAX] = 0x7f;
    g.ctx.regs.gpr[gpr::RDI] = DATA + 15;
    g.ctx.regs.gpr[gpr::RCX] = 4;

    assert_eq!(g.step(), StepResult::Completed);
    assert_eq!(g.step(), StepResult::Completed);
    assert_eq!(read_bytes(&g, DATA + 10, 6), vec![0, 0, 0x7f, 0x7f, 0x7f, 0x7f]);
    assert_eq!(g.ctx.regs.gpr[gpr::RDI], DATA + 11);
}

#[test]
fn repe_cmpsb_stops_at_the_first_difference() {
    let mut g = guest(&[0xF3, 0xA6]);
    g.space.write(DATA, b"abXd").unwrap();
    g.space.write(DATA + 0x100, b"abYd").unwrap();
    g.ctx.regs.gpr[gpr::RSI] = DATA;
    g.ctx.regs.gpr[gpr::RDI] = DATA + 0x100;
    g.ctx.regs.gpr[gpr::RCX] = 4;

    assert_eq!(g.step(), StepResult::Completed);
    assert_eq!(g.ctx.regs.gpr[gpr::RCX], 1);
    assert_eq!(g.ctx.regs.gpr[gpr::RSI], DATA + 3);
    assert!(!g.ctx.regs.rflags.contains(RFlags::ZF));
    // 'X' < 'Y'
    assert!(g.ctx.regs.rflags.contains(RFlags::CF));
}

#[test]
fn repne_scasb_finds_the_terminator() {
    let mut g = guest(&[0xF2, 0xAE]);
    g.space.write(DATA, b"hello\0").unwrap();
    g.ctx.regs.gpr[gpr::RAX] = 0;
    g.ctx.regs.gpr[gpr::RDI] = DATA;
    g.ctx.regs.gpr[gpr::RCX] = u64::MAX;

    assert_eq!(g.step(), StepResult::Completed);
    assert_eq!(g.ctx.regs.gpr[gpr::RDI], DATA + 6);
    assert_eq!(g.ctx.regs.gpr[gpr::RCX], u64::MAX - 6);
    assert!(g.ctx.regs.rflags.contains(RFlags::ZF));
}

#[test]
fn lodsq_loads_and_advances() {
    let mut g = guest(&[0x48, 0xAD]);
    g.space.write_u64(DATA, 0xdead_beef_cafe_f00d).unwrap();
    g.ctx.regs.gpr[gpr::RSI] = DATA;

    assert_eq!(g.step(), StepResult::Completed);
    assert_eq!(g.ctx.regs.gpr[gpr::RAX], 0xdead_beef_cafe_f00d);
    assert_eq!(g.ctx.regs.gpr[gpr::RSI], DATA + 8);
}

#[test]
fn rep_with_zero_count_does_nothing() {
    let mut g = guest(&[0xF3, 0xA4]);
    g.ctx.regs.gpr[gpr::RSI] = 0;
    g.ctx.regs.gpr[gpr::RDI] = 0;
    g.ctx.regs.gpr[gpr::RCX] = 0;
    assert_eq!(g.step(), StepResult::Completed);
    assert_eq!(g.ctx.regs.rip, CODE + 2);
}

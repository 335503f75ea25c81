mod common;

use common::*;
use xemu_cpu_core::{gpr, CoreConfig, StepResult};
use xemu_mem::{Permissions, PAGE_SIZE};

#[test]
fn decode_cache_hits_on_reexecution() {
    // nop; nop; nop
    let mut g = guest_with(&[0x90, 0x90, 0x90], CoreConfig::default(), Permissions::RX);
    g.run(3);
    let first = g.core.decode_cache_stats();
    assert_eq!(first.hits, 0);
    assert_eq!(first.misses, 3);

    g.ctx.regs.rip = CODE;
    g.run(3);
    let second = g.core.decode_cache_stats();
    assert_eq!(second.hits, 3);
    assert_eq!(second.misses, 3);
}

#[test]
fn decode_cache_invalidated_when_code_bytes_change() {
    // mov eax, 1
    let mut g = guest_with(&[0xB8, 0x01, 0x00, 0x00, 0x00], CoreConfig::default(), Permissions::RX);
    g.step();
    assert_eq!(g.ctx.regs.gpr[gpr::RAX], 1);

    g.space.write_unchecked(CODE + 1, &[0x02]).unwrap();
    g.ctx.regs.rip = CODE;
    g.step();
    assert_eq!(g.ctx.regs.gpr[gpr::RAX], 2);

    let stats = g.core.decode_cache_stats();
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.stale, 1);
    assert_eq!(stats.misses, 2);
}

#[test]
fn guest_store_into_its_own_code_is_seen() {
    //  0: mov eax, 1
    //  5: mov byte [rip - 11], 2     ; patches the immediate at offset 1
    // 12: jmp 0
    let code = [
        0xB8, 0x01, 0x00, 0x00, 0x00, //
        0xC6, 0x05, 0xF5, 0xFF, 0xFF, 0xFF, 0x02, //
        0xEB, 0xF2,
    ];
    for cfg in [
        CoreConfig::default(),
        CoreConfig::interpreter_only(),
        CoreConfig::default().with_translator(1),
    ] {
        let mut g = guest_with(&code, cfg, Permissions::RWX);
        let exit = g.run(4);
        assert_eq!(exit.executed, 4);
        assert_eq!(exit.result, StepResult::Completed);
        assert_eq!(g.ctx.regs.gpr[gpr::RAX], 2, "{cfg:?}");
        assert_eq!(g.ctx.regs.rip, CODE + 5);
    }
}

#[test]
fn remapping_code_invalidates_cached_decodes() {
    let mut g = guest_with(&[0xB8, 0x01, 0x00, 0x00, 0x00], CoreConfig::default(), Permissions::RX);
    g.step();

    g.space.unmap(CODE, PAGE_SIZE).unwrap();
    g.space
        .map(CODE, PAGE_SIZE, Permissions::RX, xemu_mem::Backing::Anonymous)
        .unwrap();
    g.space.write_unchecked(CODE, &[0xB8, 0x03, 0x00, 0x00, 0x00]).unwrap();
    g.ctx.regs.rip = CODE;
    g.step();
    assert_eq!(g.ctx.regs.gpr[gpr::RAX], 3);
}

#[test]
fn mprotect_away_exec_faults_despite_cache() {
    let mut g = guest_with(&[0x90], CoreConfig::default(), Permissions::RX);
    g.step();
    g.space.protect(CODE, PAGE_SIZE, Permissions::READ).unwrap();
    g.ctx.regs.rip = CODE;
    assert!(matches!(g.step(), StepResult::Faulted { .. }));
}

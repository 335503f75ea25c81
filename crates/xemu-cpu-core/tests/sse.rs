mod common;

use common::*;
use xemu_cpu_core::{gpr, FaultKind, HaltReason, RFlags, StepResult};
use xemu_decoder::DecodeError;

fn run_all(g: &mut Guest, n: usize) {
    for _ in 0..n {
        assert_eq!(g.step(), StepResult::Completed);
    }
}

fn pair(hi: u64, lo: u64) -> u128 {
    ((hi as u128) << 64) | lo as u128
}

fn bytes(range: std::ops::Range<u8>) -> u128 {
    let mut out = [0u8; 16];
    for (slot, b) in out.iter_mut().zip(range) {
        *slot = b;
    }
    u128::from_le_bytes(out)
}

#[test]
fn movdqa_and_pxor() {
    // movdqa xmm1, [rbx]; pxor xmm0, xmm0; movdqa [rbx+0x10], xmm1
    let mut g = guest(&[
        0x66, 0x0F, 0x6F, 0x0B, //
        0x66, 0x0F, 0xEF, 0xC0, //
        0x66, 0x0F, 0x7F, 0x4B, 0x10,
    ]);
    let data: Vec<u8> = (0..16).collect();
    g.space.write(DATA, &data).unwrap();
    g.ctx.regs.gpr[gpr::RBX] = DATA;
    g.ctx.regs.xmm[0] = 0xdead_beef;

    run_all(&mut g, 3);
    assert_eq!(g.ctx.regs.xmm[1], bytes(0..16));
    assert_eq!(g.ctx.regs.xmm[0], 0);
    let mut copy = [0u8; 16];
    g.space.read(DATA + 0x10, &mut copy).unwrap();
    assert_eq!(copy.to_vec(), data);
}

#[test]
fn misaligned_movdqa_faults_but_movdqu_does_not() {
    // movdqa xmm1, [rbx]
    let mut g = guest(&[0x66, 0x0F, 0x6F, 0x0B]);
    g.ctx.regs.gpr[gpr::RBX] = DATA + 8;
    g.ctx.regs.xmm[1] = 7;
    assert_eq!(
        g.step(),
        StepResult::Faulted {
            kind: FaultKind::GeneralProtection,
            addr: CODE,
        }
    );
    assert_eq!(g.ctx.regs.xmm[1], 7);
    assert_eq!(g.ctx.regs.rip, CODE);

    // movdqu xmm1, [rbx]
    let mut g = guest(&[0xF3, 0x0F, 0x6F, 0x0B]);
    g.space.write(DATA + 8, &[0xAB; 16]).unwrap();
    g.ctx.regs.gpr[gpr::RBX] = DATA + 8;
    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.xmm[1], u128::from_le_bytes([0xAB; 16]));
}

#[test]
fn pcmpeqb_and_pmovmskb_find_the_terminator() {
    // movdqa xmm1, [rbx]; pxor xmm0, xmm0; pcmpeqb xmm0, xmm1;
    // pmovmskb eax, xmm0; bsf eax, eax
    let mut g = guest(&[
        0x66, 0x0F, 0x6F, 0x0B, //
        0x66, 0x0F, 0xEF, 0xC0, //
        0x66, 0x0F, 0x74, 0xC1, //
        0x66, 0x0F, 0xD7, 0xC0, //
        0x0F, 0xBC, 0xC0,
    ]);
    g.space.write(DATA, b"hello").unwrap();
    g.ctx.regs.gpr[gpr::RBX] = DATA;

    run_all(&mut g, 4);
    assert_eq!(g.ctx.regs.gpr[gpr::RAX], 0xffe0);
    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.gpr[gpr::RAX], 5);
}

#[test]
fn movd_and_movq_zero_extend() {
    // movd xmm0, eax; movq rcx, xmm0; movq xmm1, xmm0
    let mut g = guest(&[
        0x66, 0x0F, 0x6E, 0xC0, //
        0x66, 0x48, 0x0F, 0x7E, 0xC1, //
        0xF3, 0x0F, 0x7E, 0xC8,
    ]);
    g.ctx.regs.gpr[gpr::RAX] = 0xffff_ffff_8765_4321;
    g.ctx.regs.xmm[0] = u128::MAX;
    g.ctx.regs.xmm[1] = u128::MAX;

    run_all(&mut g, 3);
    assert_eq!(g.ctx.regs.xmm[0], 0x8765_4321);
    assert_eq!(g.ctx.regs.gpr[gpr::RCX], 0x8765_4321);
    assert_eq!(g.ctx.regs.xmm[1], 0x8765_4321);
}

#[test]
fn punpcklbw_then_pshufd() {
    // punpcklbw xmm0, xmm1; pshufd xmm1, xmm0, 0x1b
    let mut g = guest(&[
        0x66, 0x0F, 0x60, 0xC1, //
        0x66, 0x0F, 0x70, 0xC8, 0x1B,
    ]);
    g.ctx.regs.xmm[0] = bytes(0..16);
    g.ctx.regs.xmm[1] = bytes(0x10..0x20);

    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.xmm[0], 0x1707_1606_1505_1404_1303_1202_1101_1000);
    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.xmm[1], 0x1101_1000_1303_1202_1505_1404_1707_1606);
}

#[test]
fn packed_shifts_by_immediate() {
    // psrlq xmm9, 0x20; psrld xmm0, 0x1f; psllw xmm0, 3
    let mut g = guest(&[
        0x66, 0x41, 0x0F, 0x73, 0xD1, 0x20, //
        0x66, 0x0F, 0x72, 0xD0, 0x1F, //
        0x66, 0x0F, 0x71, 0xF0, 0x03,
    ]);
    g.ctx.regs.xmm[9] = pair(0xAAAA_BBBB_CCCC_DDDD, 0x1111_2222_3333_4444);
    g.ctx.regs.xmm[0] = 0x8000_0000_7fff_ffff_ffff_ffff_0000_0001;

    run_all(&mut g, 2);
    assert_eq!(g.ctx.regs.xmm[9], pair(0xAAAA_BBBB, 0x1111_2222));
    assert_eq!(g.ctx.regs.xmm[0], 0x0000_0001_0000_0000_0000_0001_0000_0000);
    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.xmm[0], 0x0000_0008_0000_0000_0000_0008_0000_0000);
}

#[test]
fn pextrw_zero_extends_into_the_gpr() {
    // pextrw ecx, xmm0, 3
    let mut g = guest(&[0x66, 0x0F, 0xC5, 0xC8, 0x03]);
    g.ctx.regs.xmm[0] = pair(0, 0xBEEF_0000_0000_0000);
    g.ctx.regs.gpr[gpr::RCX] = u64::MAX;
    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.gpr[gpr::RCX], 0xBEEF);
}

#[test]
fn maxsd_and_minsd_keep_the_high_lane() {
    // maxsd xmm0, xmm1; minsd xmm0, xmm2
    let mut g = guest(&[0xF2, 0x0F, 0x5F, 0xC1, 0xF2, 0x0F, 0x5D, 0xC2]);
    g.ctx.regs.xmm[0] = pair(0x1234, 1.5f64.to_bits());
    g.ctx.regs.xmm[1] = pair(0x5678, 2.5f64.to_bits());
    g.ctx.regs.xmm[2] = (-1.0f64).to_bits() as u128;

    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.xmm[0], pair(0x1234, 2.5f64.to_bits()));
    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.xmm[0], pair(0x1234, (-1.0f64).to_bits()));
}

#[test]
fn movhlps_movlhps_unpckhpd() {
    // movhlps xmm0, xmm1; movlhps xmm0, xmm1; unpckhpd xmm0, xmm1
    let mut g = guest(&[
        0x0F, 0x12, 0xC1, //
        0x0F, 0x16, 0xC1, //
        0x66, 0x0F, 0x15, 0xC1,
    ]);
    g.ctx.regs.xmm[0] = pair(0xA, 0xB);
    g.ctx.regs.xmm[1] = pair(0xC, 0xD);

    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.xmm[0], pair(0xA, 0xC));
    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.xmm[0], pair(0xD, 0xC));
    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.xmm[0], pair(0xC, 0xD));
}

#[test]
fn comiss_sets_zf_pf_cf_and_clears_the_rest() {
    // comiss xmm0, xmm1
    let mut g = guest(&[0x0F, 0x2F, 0xC1]);
    let cases = [
        (2.0f32, RFlags::CF),
        (1.0f32, RFlags::ZF),
        (0.5f32, RFlags::empty()),
        (f32::NAN, RFlags::ZF | RFlags::PF | RFlags::CF),
    ];
    for (rhs, expected) in cases {
        g.ctx.regs.rip = CODE;
        g.ctx.regs.rflags |= RFlags::OF | RFlags::SF | RFlags::AF;
        g.ctx.regs.xmm[0] = 1.0f32.to_bits() as u128;
        g.ctx.regs.xmm[1] = rhs.to_bits() as u128;
        run_all(&mut g, 1);
        assert_eq!(g.ctx.regs.rflags & RFlags::STATUS, expected, "{rhs}");
    }
    // The ordered compare flags the quiet NaN as invalid.
    assert_eq!(g.ctx.regs.mxcsr & 1, 1);
}

#[test]
fn ucomisd_does_not_flag_quiet_nans() {
    // ucomisd xmm0, xmm1
    let mut g = guest(&[0x66, 0x0F, 0x2E, 0xC1]);
    g.ctx.regs.xmm[0] = f64::NAN.to_bits() as u128;
    g.ctx.regs.xmm[1] = 1.0f64.to_bits() as u128;
    run_all(&mut g, 1);
    assert!(g.ctx.regs.rflags.contains(RFlags::ZF | RFlags::PF | RFlags::CF));
    assert_eq!(g.ctx.regs.mxcsr, 0x1f80);
}

#[test]
fn integer_conversions() {
    // cvtsi2sd xmm0, rax; cvttsd2si eax, xmm1; cvtsd2si ecx, xmm1
    let mut g = guest(&[
        0xF2, 0x48, 0x0F, 0x2A, 0xC0, //
        0xF2, 0x0F, 0x2C, 0xC1, //
        0xF2, 0x0F, 0x2D, 0xC9,
    ]);
    g.ctx.regs.gpr[gpr::RAX] = -3i64 as u64;
    g.ctx.regs.xmm[0] = pair(0x77, 0);
    g.ctx.regs.xmm[1] = (-2.5f64).to_bits() as u128;

    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.xmm[0], pair(0x77, (-3.0f64).to_bits()));
    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.gpr[gpr::RAX], 0xffff_fffe);
    // Round to nearest even.
    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.gpr[gpr::RCX], 0xffff_fffe);

    // Round up, via MXCSR.RC.
    g.ctx.regs.rip = CODE + 9;
    g.ctx.regs.mxcsr = 0x1f80 | (2 << 13);
    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.gpr[gpr::RCX], 0xffff_fffe);
    g.ctx.regs.rip = CODE + 9;
    g.ctx.regs.xmm[1] = 2.5f64.to_bits() as u128;
    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.gpr[gpr::RCX], 3);
}

#[test]
fn out_of_range_conversion_is_the_integer_indefinite() {
    // cvttsd2si eax, xmm1
    let mut g = guest(&[0xF2, 0x0F, 0x2C, 0xC1]);
    g.ctx.regs.xmm[1] = 1e10f64.to_bits() as u128;
    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.gpr[gpr::RAX], 0x8000_0000);
    assert_eq!(g.ctx.regs.mxcsr & 1, 1);
}

#[test]
fn mxcsr_round_trips_and_rejects_reserved_bits() {
    // stmxcsr [rbx]; ldmxcsr [rbx+4]
    let mut g = guest(&[0x0F, 0xAE, 0x1B, 0x0F, 0xAE, 0x53, 0x04]);
    g.ctx.regs.gpr[gpr::RBX] = DATA;
    g.space.write_u32(DATA + 4, 0x7f80).unwrap();

    run_all(&mut g, 2);
    assert_eq!(g.space.read_u32(DATA).unwrap(), 0x1f80);
    assert_eq!(g.ctx.regs.mxcsr, 0x7f80);

    g.ctx.regs.rip = CODE + 3;
    g.space.write_u32(DATA + 4, 0x1_0000).unwrap();
    assert_eq!(
        g.step(),
        StepResult::Faulted {
            kind: FaultKind::GeneralProtection,
            addr: CODE + 3,
        }
    );
    assert_eq!(g.ctx.regs.mxcsr, 0x7f80);
}

#[test]
fn movsd_serves_both_the_string_and_the_scalar_form() {
    // movsd (string); movsd xmm0, [rbx]; movsd xmm0, xmm1
    let mut g = guest(&[0xA5, 0xF2, 0x0F, 0x10, 0x03, 0xF2, 0x0F, 0x10, 0xC1]);
    g.space.write_u64(DATA, 0x1122_3344_5566_7788).unwrap();
    g.ctx.regs.gpr[gpr::RSI] = DATA;
    g.ctx.regs.gpr[gpr::RDI] = DATA + 0x100;
    g.ctx.regs.gpr[gpr::RBX] = DATA;
    g.ctx.regs.xmm[0] = u128::MAX;
    g.ctx.regs.xmm[1] = pair(0xFFFF, 0x99);

    run_all(&mut g, 1);
    assert_eq!(g.space.read_u32(DATA + 0x100).unwrap(), 0x5566_7788);
    assert_eq!(g.ctx.regs.gpr[gpr::RSI], DATA + 4);
    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.xmm[0], 0x1122_3344_5566_7788);
    run_all(&mut g, 1);
    assert_eq!(g.ctx.regs.xmm[0], 0x99);
}

#[test]
fn mmx_forms_are_unsupported() {
    // pxor mm0, mm1
    let mut g = guest(&[0x0F, 0xEF, 0xC1]);
    let result = g.step();
    assert!(
        matches!(
            result,
            StepResult::ThreadHalted(HaltReason::Decode {
                error: DecodeError::UnsupportedFeature,
                ..
            })
        ),
        "{result:?}"
    );
}

#[test]
fn cpuid_advertises_sse2() {
    // mov eax, 1; cpuid
    let mut g = guest(&[0xB8, 0x01, 0, 0, 0, 0x0F, 0xA2]);
    run_all(&mut g, 2);
    let edx = g.ctx.regs.gpr[gpr::RDX];
    assert_ne!(edx & (1 << 25), 0);
    assert_ne!(edx & (1 << 26), 0);
}

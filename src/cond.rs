// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Shyper is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! AArch32 condition-code evaluation and Thumb IT-state advancement (§4.2).
//!
//! Grounded line-for-line on the Jailhouse ARM port's `cc_map`,
//! `arch_failed_condition`, `arch_advance_itstate` and
//! `arch_skip_instruction`. The table itself is "not a design choice to
//! revisit" (§9) — it is ARM's own canonical condition-code encoding.

use crate::context::TrapContext;

/// One 16-bit mask per condition code, indexed by `cond`; bit `flags`
/// (the NZCV nibble) of `cc_map[cond]` is the truth value of that condition
/// for that flag combination.
pub const CC_MAP: [u16; 16] = [
    0xf0f0, 0x0f0f, 0xcccc, 0x3333, 0xff00, 0x00ff, 0xaaaa, 0x5555, 0x0c0c, 0xf3f3, 0xaa55, 0x55aa, 0x0a05, 0xf5fa,
    0xffff, 0x0000,
];

/// Exception-class bits `5:4` of the syndrome: `0b11` marks an
/// already-unconditional access (e.g. data abort taken from the same mode);
/// class `0` is the unknown-reason class, also treated as unconditional.
fn class_is_always_unconditional(class: u32) -> bool {
    (class & 0x30) == 0x30 || class == 0
}

/// `HSR_ICC_CV_BIT` — syndrome bit 24: the syndrome itself carries a valid
/// condition field at bits `23:20` (`HSR_ICC_COND`).
const ICC_CV_BIT: u32 = 1 << 24;

fn cond_and_flags_from_syndrome_or_it(ctx: &TrapContext) -> Option<(u32, u32)> {
    let flags = ctx.psr >> 28;
    if ctx.syndrome & ICC_CV_BIT != 0 {
        let cond = (ctx.syndrome >> 20) & 0xf;
        Some((cond, flags))
    } else {
        // No syndrome condition: pull the leading IT condition out of PSR.
        // IT[7:4] (the top nibble of the split IT field) holds it; an IT
        // value of 0 means "not in an IT block", i.e. unconditional.
        let it = it_state(ctx.psr);
        let top = it >> 4;
        if top == 0 {
            None
        } else {
            Some((top, flags))
        }
    }
}

/// Evaluate §4.2's predicate: true if the trapped instruction's condition
/// failed against the guest's current flags, in which case the dispatcher
/// must skip it with no side effects.
pub fn arch_failed_condition(ctx: &TrapContext, exception_class: u32) -> bool {
    if class_is_always_unconditional(exception_class) {
        return false;
    }
    match cond_and_flags_from_syndrome_or_it(ctx) {
        None => false,
        Some((cond, flags)) => (CC_MAP[cond as usize] as u32 >> flags) & 1 == 0,
    }
}

/// Extract the 8-bit IT state from its split PSR layout: bits `26:25` hold
/// IT[1:0], bits `15:10` hold IT[7:2].
pub fn it_state(psr: u32) -> u32 {
    let low = (psr >> 25) & 0x3;
    let high = (psr >> 10) & 0x3f;
    (high << 2) | low
}

/// Re-encode an 8-bit IT state back into its split PSR layout.
fn set_it_state(psr: u32, it: u32) -> u32 {
    let low = it & 0x3;
    let high = (it >> 2) & 0x3f;
    let psr = psr & !((0x3 << 25) | (0x3f << 10));
    psr | (low << 25) | (high << 10)
}

/// Advance the Thumb IT state by one step (§4.2): no-op outside an IT block;
/// otherwise shift the low 5 bits left by one (masked to 5 bits), clearing
/// the whole field once the shifted tail goes to zero.
pub fn arch_advance_itstate(psr: u32) -> u32 {
    let itbits = it_state(psr);
    if itbits == 0 {
        return psr;
    }
    let cond = itbits >> 5;
    let itbits = if itbits & 0x7 == 0 {
        0
    } else {
        ((itbits << 1) & 0x1f) | (cond << 5)
    };
    set_it_state(psr, itbits)
}

/// Skip the trapped instruction: advance PC by 4 (32-bit) or 2 (16-bit Thumb)
/// per the syndrome's `IL` bit, then advance IT-state.
pub fn arch_skip_instruction(ctx: &mut TrapContext) {
    ctx.pc = ctx.pc.wrapping_add(if ctx.instruction_is_32bit() { 4 } else { 2 });
    ctx.psr = arch_advance_itstate(ctx.psr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::GuestRegisters;

    // ARM-ARM Table A8-1 truth values for NZCV = flags nibble (N=bit3).
    fn arm_arm_truth(cond: u32, flags: u32) -> bool {
        let n = (flags >> 3) & 1 != 0;
        let z = (flags >> 2) & 1 != 0;
        let c = (flags >> 1) & 1 != 0;
        let v = flags & 1 != 0;
        match cond {
            0 => z,                       // EQ
            1 => !z,                      // NE
            2 => c,                       // CS/HS
            3 => !c,                      // CC/LO
            4 => n,                       // MI
            5 => !n,                      // PL
            6 => v,                       // VS
            7 => !v,                      // VC
            8 => c && !z,                 // HI
            9 => !c || z,                 // LS
            10 => n == v,                 // GE
            11 => n != v,                 // LT
            12 => !z && (n == v),         // GT
            13 => z || (n != v),          // LE
            14 => true,                   // AL
            _ => false,                   // reserved/NV: historically "never"
        }
    }

    #[test]
    fn cc_map_matches_arm_arm_for_all_16x16_combinations() {
        for cond in 0..16u32 {
            for flags in 0..16u32 {
                let from_table = (CC_MAP[cond as usize] as u32 >> flags) & 1 != 0;
                assert_eq!(
                    from_table,
                    arm_arm_truth(cond, flags),
                    "cond={cond} flags={flags:04b}"
                );
            }
        }
    }

    #[test]
    fn it_state_split_layout_round_trips() {
        for it in 0..=0xffu32 {
            let psr = set_it_state(0, it);
            assert_eq!(it_state(psr), it, "it={it:#010b}");
        }
    }

    #[test]
    fn condition_failed_skips_with_pc_plus_four_and_no_register_touch() {
        let mut regs = GuestRegisters::zeroed();
        regs.usr[0] = 0x1234;
        // EQ (cond=0) fails when Z=0: flags nibble with Z clear, e.g. 0b0000.
        let mut ctx = TrapContext::new(0x8000, 0b0000 << 28, ICC_CV_BIT, &mut regs);
        ctx.syndrome |= 0 << 20; // cond field = EQ
        assert!(arch_failed_condition(&ctx, 0x0d << 26)); // CP15_32-ish class, not unconditional
        ctx.syndrome |= 1 << 25; // 32-bit instruction
        arch_skip_instruction(&mut ctx);
        assert_eq!(ctx.pc, 0x8004);
        assert_eq!(ctx.regs.usr[0], 0x1234);
    }

    #[test]
    fn it_state_advance_to_last_step_clears_field_and_pc_plus_two() {
        let mut regs = GuestRegisters::zeroed();
        // IT = 0b10101000: last instruction of the block (low 3 bits zero).
        let psr = set_it_state(0, 0b1010_1000);
        let mut ctx = TrapContext::new(0x4000, psr, 0, &mut regs);
        arch_skip_instruction(&mut ctx);
        assert_eq!(it_state(ctx.psr), 0);
        assert_eq!(ctx.pc, 0x4002);
    }

    #[test]
    fn instruction_skip_twice_is_idempotent_modulo_it_state() {
        let mut regs = GuestRegisters::zeroed();
        let mut ctx = TrapContext::new(0x1000, 0, 1 << 25, &mut regs);
        arch_skip_instruction(&mut ctx);
        arch_skip_instruction(&mut ctx);
        assert_eq!(ctx.pc, 0x1008);
    }
}

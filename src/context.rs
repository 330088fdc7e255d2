// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Shyper is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Guest register frame and per-exit trap context (§3 "Trap context", §4.1).
//!
//! The low-level entry stub (an assembler trampoline, out of scope here per
//! §9's design notes — it is data, not behavior) saves every banked guest
//! register into a [`GuestRegisters`] before calling into this crate, and
//! restores it on the way back out. Everything below is then plain memory
//! access over that saved copy; nothing here touches a live hardware
//! register.

use core::fmt;

/// Number of on-stack "user copy" registers the trampoline saves: r0..r14.
pub const NUM_USR_REGS: usize = 15;

/// PSR a freshly reset or freshly parked vCPU resumes with: SVC mode, IRQ
/// and FIQ masked (§4.5 "full architectural wipe"). Guest code runs with
/// both unmasked; the control FSM only ever installs this transiently,
/// between the wipe and the first real guest entry.
pub const RESET_PSR: u32 = CpuMode::Svc as u32 | (1 << 7) | (1 << 6);

/// AArch32 processor modes, as encoded in PSR bits `4:0`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum CpuMode {
    Usr = 0x10,
    Fiq = 0x11,
    Irq = 0x12,
    Svc = 0x13,
    Abt = 0x17,
    Und = 0x1b,
    Sys = 0x1f,
}

impl CpuMode {
    pub fn from_psr(psr: u32) -> Option<Self> {
        Some(match psr & 0x1f {
            0x10 => CpuMode::Usr,
            0x11 => CpuMode::Fiq,
            0x12 => CpuMode::Irq,
            0x13 => CpuMode::Svc,
            0x17 => CpuMode::Abt,
            0x1b => CpuMode::Und,
            0x1f => CpuMode::Sys,
            _ => return None,
        })
    }
}

/// Banked copies of SP, LR and SPSR for every privileged mode but usr/sys
/// (which share the on-stack usr bank, §4.1), plus the FIQ-private r8..r12.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct BankedRegisters {
    pub sp_svc: u32,
    pub lr_svc: u32,
    pub spsr_svc: u32,
    pub sp_abt: u32,
    pub lr_abt: u32,
    pub spsr_abt: u32,
    pub sp_und: u32,
    pub lr_und: u32,
    pub spsr_und: u32,
    pub sp_irq: u32,
    pub lr_irq: u32,
    pub spsr_irq: u32,
    pub sp_fiq: u32,
    pub lr_fiq: u32,
    pub spsr_fiq: u32,
    pub r8_fiq: u32,
    pub r9_fiq: u32,
    pub r10_fiq: u32,
    pub r11_fiq: u32,
    pub r12_fiq: u32,
}

/// The full guest register save area: the on-stack usr/sys copy plus every
/// banked mode's private registers. One of these lives inside each CPU's
/// per-CPU record (§3 "guest register save area").
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct GuestRegisters {
    pub usr: [u32; NUM_USR_REGS],
    pub banked: BankedRegisters,
}

impl fmt::Display for GuestRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for n in 0..NUM_USR_REGS {
            write!(f, "r{}:{} 0x{:08x}{}", n, if n < 10 { " " } else { "" }, self.usr[n], if n % 4 == 3 { "\n" } else { "  " })?;
        }
        writeln!(f)
    }
}

impl GuestRegisters {
    pub const fn zeroed() -> Self {
        GuestRegisters {
            usr: [0; NUM_USR_REGS],
            banked: BankedRegisters {
                sp_svc: 0,
                lr_svc: 0,
                spsr_svc: 0,
                sp_abt: 0,
                lr_abt: 0,
                spsr_abt: 0,
                sp_und: 0,
                lr_und: 0,
                spsr_und: 0,
                sp_irq: 0,
                lr_irq: 0,
                spsr_irq: 0,
                sp_fiq: 0,
                lr_fiq: 0,
                spsr_fiq: 0,
                r8_fiq: 0,
                r9_fiq: 0,
                r10_fiq: 0,
                r11_fiq: 0,
                r12_fiq: 0,
            },
        }
    }

    /// Wipe every banked and usr register. Used by the control FSM's
    /// architectural reset (§4.5).
    pub fn reset(&mut self) {
        *self = Self::zeroed();
    }
}

/// Captured per exit (§3 "Trap context"): `{PC, PSR, syndrome}` plus a
/// reference to the saved user registers. Stack-scoped to a single exit.
pub struct TrapContext<'r> {
    pub pc: u32,
    pub psr: u32,
    pub syndrome: u32,
    pub regs: &'r mut GuestRegisters,
}

impl<'r> TrapContext<'r> {
    pub fn new(pc: u32, psr: u32, syndrome: u32, regs: &'r mut GuestRegisters) -> Self {
        TrapContext { pc, psr, syndrome, regs }
    }

    pub fn mode(&self) -> Option<CpuMode> {
        CpuMode::from_psr(self.psr)
    }

    /// `IL` (instruction-length) syndrome bit: 1 for a 32-bit instruction,
    /// 0 for a 16-bit Thumb instruction.
    pub fn instruction_is_32bit(&self) -> bool {
        self.syndrome & (1 << 25) != 0
    }

    /// Read guest register `r` per the banking contract in §4.1. Register 15
    /// (PC) is legal but logged as suspicious; anything above 15 is a no-op
    /// that merely logs.
    pub fn read_reg(&self, r: usize) -> u32 {
        match r {
            0..=7 => self.regs.usr[r],
            8..=12 => {
                if self.mode() == Some(CpuMode::Fiq) {
                    match r {
                        8 => self.regs.banked.r8_fiq,
                        9 => self.regs.banked.r9_fiq,
                        10 => self.regs.banked.r10_fiq,
                        11 => self.regs.banked.r11_fiq,
                        _ => self.regs.banked.r12_fiq,
                    }
                } else {
                    self.regs.usr[r]
                }
            }
            13 => match self.mode() {
                Some(CpuMode::Usr) | Some(CpuMode::Sys) | None => self.regs.usr[13],
                Some(CpuMode::Svc) => self.regs.banked.sp_svc,
                Some(CpuMode::Abt) => self.regs.banked.sp_abt,
                Some(CpuMode::Und) => self.regs.banked.sp_und,
                Some(CpuMode::Irq) => self.regs.banked.sp_irq,
                Some(CpuMode::Fiq) => self.regs.banked.sp_fiq,
            },
            14 => match self.mode() {
                Some(CpuMode::Usr) | Some(CpuMode::Sys) | None => self.regs.usr[14],
                Some(CpuMode::Svc) => self.regs.banked.lr_svc,
                Some(CpuMode::Abt) => self.regs.banked.lr_abt,
                Some(CpuMode::Und) => self.regs.banked.lr_und,
                Some(CpuMode::Irq) => self.regs.banked.lr_irq,
                Some(CpuMode::Fiq) => self.regs.banked.lr_fiq,
            },
            15 => {
                log::warn!("guest register access aliases PC (r15); returning trap PC");
                self.pc
            }
            _ => {
                log::error!("access to out-of-range guest register r{r}");
                0
            }
        }
    }

    /// Write guest register `r`, mirroring [`TrapContext::read_reg`]'s
    /// banking contract.
    pub fn write_reg(&mut self, r: usize, val: u32) {
        let mode = self.mode();
        match r {
            0..=7 => self.regs.usr[r] = val,
            8..=12 => {
                if mode == Some(CpuMode::Fiq) {
                    match r {
                        8 => self.regs.banked.r8_fiq = val,
                        9 => self.regs.banked.r9_fiq = val,
                        10 => self.regs.banked.r10_fiq = val,
                        11 => self.regs.banked.r11_fiq = val,
                        _ => self.regs.banked.r12_fiq = val,
                    }
                } else {
                    self.regs.usr[r] = val;
                }
            }
            13 => match mode {
                Some(CpuMode::Usr) | Some(CpuMode::Sys) | None => self.regs.usr[13] = val,
                Some(CpuMode::Svc) => self.regs.banked.sp_svc = val,
                Some(CpuMode::Abt) => self.regs.banked.sp_abt = val,
                Some(CpuMode::Und) => self.regs.banked.sp_und = val,
                Some(CpuMode::Irq) => self.regs.banked.sp_irq = val,
                Some(CpuMode::Fiq) => self.regs.banked.sp_fiq = val,
            },
            14 => match mode {
                Some(CpuMode::Usr) | Some(CpuMode::Sys) | None => self.regs.usr[14] = val,
                Some(CpuMode::Svc) => self.regs.banked.lr_svc = val,
                Some(CpuMode::Abt) => self.regs.banked.lr_abt = val,
                Some(CpuMode::Und) => self.regs.banked.lr_und = val,
                Some(CpuMode::Irq) => self.regs.banked.lr_irq = val,
                Some(CpuMode::Fiq) => self.regs.banked.lr_fiq = val,
            },
            15 => {
                log::warn!("guest register write aliases PC (r15); updating trap PC");
                self.pc = val;
            }
            _ => log::error!("write to out-of-range guest register r{r}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(regs: &mut GuestRegisters, psr_mode: u32) -> TrapContext<'_> {
        TrapContext::new(0x1000, psr_mode, 0, regs)
    }

    #[test]
    fn usr_regs_read_write_low_bank() {
        let mut regs = GuestRegisters::zeroed();
        regs.usr[3] = 0xdead_beef;
        let c = ctx(&mut regs, CpuMode::Svc as u32);
        assert_eq!(c.read_reg(3), 0xdead_beef);
    }

    #[test]
    fn fiq_bank_used_only_in_fiq_mode() {
        let mut regs = GuestRegisters::zeroed();
        regs.usr[9] = 1;
        regs.banked.r9_fiq = 2;
        assert_eq!(ctx(&mut regs, CpuMode::Svc as u32).read_reg(9), 1);
        assert_eq!(ctx(&mut regs, CpuMode::Fiq as u32).read_reg(9), 2);
    }

    #[test]
    fn sp_usr_and_sys_share_the_usr_bank() {
        let mut regs = GuestRegisters::zeroed();
        regs.usr[13] = 0x1111;
        regs.banked.sp_svc = 0x2222;
        assert_eq!(ctx(&mut regs, CpuMode::Usr as u32).read_reg(13), 0x1111);
        assert_eq!(ctx(&mut regs, CpuMode::Sys as u32).read_reg(13), 0x1111);
        assert_eq!(ctx(&mut regs, CpuMode::Svc as u32).read_reg(13), 0x2222);
    }

    #[test]
    fn lr_usr_lives_at_on_stack_offset_14() {
        let mut regs = GuestRegisters::zeroed();
        regs.usr[14] = 0x3333;
        regs.banked.lr_irq = 0x4444;
        assert_eq!(ctx(&mut regs, CpuMode::Usr as u32).read_reg(14), 0x3333);
        assert_eq!(ctx(&mut regs, CpuMode::Irq as u32).read_reg(14), 0x4444);
    }

    #[test]
    fn pc_alias_reads_back_trap_pc() {
        let mut regs = GuestRegisters::zeroed();
        let c = ctx(&mut regs, CpuMode::Svc as u32);
        assert_eq!(c.read_reg(15), 0x1000);
    }

    #[test]
    fn out_of_range_register_is_a_logged_no_op() {
        let mut regs = GuestRegisters::zeroed();
        let mut c = ctx(&mut regs, CpuMode::Svc as u32);
        c.write_reg(16, 0x5555);
        assert_eq!(c.read_reg(16), 0);
    }
}

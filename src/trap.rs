// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Shyper is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Trap dispatcher (§4.3): decode exception class, condition-check, dispatch.
//!
//! Grounded on the Jailhouse ARM port's `traps.c` (`trap_handlers[38]`,
//! `arch_handle_cp15_32`, `arch_handle_cp15_64`, `arch_handle_smc`,
//! `arch_handle_hvc`, `arch_handle_trap`) for the exact syndrome bit layouts
//! and control flow, and on teacher `arch::aarch64::exception.rs` for the
//! AArch64-host exception-class numbering (`arch::ec`) that lets one
//! dispatcher serve both 32- and 64-bit guests. Unlike the C sparse array of
//! 38 function pointers, the dispatch below is a plain `match` over the
//! exception class — the same sparse lookup, in the idiom Rust prefers over
//! designated array initializers.

use alloc::sync::Arc;

use spin::Once;

use crate::arch::{ec, Cp15Reg32};
use crate::cond::{arch_failed_condition, arch_skip_instruction};
use crate::context::TrapContext;
use crate::collab::{MmioAccess, MmioOutcome, SmcGateway};
use crate::percpu::PerCpu;
use crate::psci::{self, PsciArgs};

#[cfg(feature = "gicv3")]
use crate::vgic::{SgiDescriptor, SgiRouting};

/// Result of dispatching one trapped exception (§4.3's three-way outcome).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrapOutcome {
    /// The instruction was emulated; the caller should resume the guest.
    Handled,
    /// No handler claimed this exception class or syndrome — fatal.
    Unhandled,
    /// A handler recognised the access but refused it — fatal.
    Forbidden,
}

static SMC_GATEWAY: Once<Arc<dyn SmcGateway>> = Once::new();

/// Install the raw SMC passthrough used for non-PSCI `smc` calls (§4.3's
/// "forward non-PSCI SMC verbatim"). Must be called once during embedder
/// init before the first guest SMC trap.
pub fn install_smc_gateway(gw: Arc<dyn SmcGateway>) {
    SMC_GATEWAY.call_once(|| gw);
}

fn smc_gateway() -> Option<Arc<dyn SmcGateway>> {
    SMC_GATEWAY.get().cloned()
}

fn psci_args(ctx: &TrapContext) -> PsciArgs {
    PsciArgs {
        function_id: ctx.read_reg(0),
        arg1: ctx.read_reg(1) as u64,
        arg2: ctx.read_reg(2) as u64,
        arg3: ctx.read_reg(3) as u64,
    }
}

/// CP15 32-bit MCR/MRC trap (EC `0x03`). ISS layout per the ARMv8 ARM:
/// `read`=bit0, `CRm`=bits4:1, `rt`=bits9:5, `CRn`=bits13:10, `opc1`=bits16:14,
/// `opc2`=bits19:17.
fn handle_cp15_32(_cpu: &PerCpu, ctx: &mut TrapContext) -> TrapOutcome {
    let hsr = ctx.syndrome;
    let read = hsr & 1 != 0;
    let crm = (hsr >> 1) & 0xf;
    let rt = ((hsr >> 5) & 0xf) as usize;
    let crn = (hsr >> 10) & 0xf;
    let opc1 = (hsr >> 14) & 0x7;
    let opc2 = (hsr >> 17) & 0x7;

    // ACTLR (crn=1, opc1=0, crm=0, opc2=1): reads return the physical value
    // so the guest sees a plausible coherency/SMP bit; writes are a silent,
    // logged no-op (§9 Open Questions — the guest must not be able to turn
    // off coherency a sibling cell still depends on).
    if (crn, opc1, crm, opc2) == (1, 0, 0, 1) {
        if read {
            let val = unsafe { crate::arch::read_actlr_el1() };
            ctx.write_reg(rt, val as u32);
        } else {
            log::debug!("ignored guest write to ACTLR");
        }
        arch_skip_instruction(ctx);
        return TrapOutcome::Handled;
    }

    if read {
        return TrapOutcome::Unhandled;
    }

    match Cp15Reg32::decode(crn, opc1, crm, opc2) {
        Some(reg) => unsafe { reg.write(ctx.read_reg(rt) as u64) },
        None => return TrapOutcome::Unhandled,
    }

    arch_skip_instruction(ctx);
    TrapOutcome::Handled
}

/// CP15 64-bit MCRR/MRRC trap (EC `0x0c`). ISS layout: `read`=bit0,
/// `CRm`=bits4:1, `rt`=bits9:5, `rt2`=bits14:10, `opc1`=bits19:16.
fn handle_cp15_64(cpu: &PerCpu, ctx: &mut TrapContext) -> TrapOutcome {
    let hsr = ctx.syndrome;
    if hsr & 1 != 0 {
        // All registers this dispatcher recognises here are write-only from
        // the guest's point of view; a read trap has no allow-listed target.
        return TrapOutcome::Unhandled;
    }
    let crm = (hsr >> 1) & 0xf;
    let rt = ((hsr >> 5) & 0xf) as usize;
    let rt2 = ((hsr >> 10) & 0xf) as usize;
    let opc1 = (hsr >> 16) & 0xf;

    let lo = ctx.read_reg(rt) as u64;
    let hi = ctx.read_reg(rt2) as u64;
    let val = (hi << 32) | lo;

    #[cfg(feature = "gicv3")]
    if opc1 == 0 && crm == 12 {
        // ICC_SGI1R_EL1 (GICv3 only): route the encoded SGI straight to the
        // vGIC instead of touching a real system register at all.
        let sgi = decode_icc_sgi1r(val);
        if let Some(cell) = cpu.cell() {
            let _ = cell.irqchip().send_sgi(&sgi);
        }
        arch_skip_instruction(ctx);
        return TrapOutcome::Handled;
    }
    let _ = cpu;

    // TTBR0/TTBR1 64-bit aliases (crm=2, opc1 0 or 1).
    if crm == 2 && (opc1 == 0 || opc1 == 1) {
        unsafe { crate::arch::write_ttbr(opc1 == 1, val) };
        arch_skip_instruction(ctx);
        return TrapOutcome::Handled;
    }

    TrapOutcome::Unhandled
}

/// Decode `ICC_SGI1R_EL1`'s 64-bit layout (ARMv8 ARM, GICv3 architecture
/// specification): `INTID`=bits3:0, `IRM`=bit24 (1 = all-but-self),
/// `Aff1`=bits23:16, target list=bits15:0, `Aff2`=bits39:32, `Aff3`=bits55:48.
#[cfg(feature = "gicv3")]
fn decode_icc_sgi1r(val: u64) -> SgiDescriptor {
    let id = (val & 0xf) as u8;
    let irm = (val >> 24) & 1 != 0;
    let aff1 = ((val >> 16) & 0xff) as u8;
    let aff2 = ((val >> 32) & 0xff) as u8;
    let aff3 = ((val >> 48) & 0xff) as u8;
    let targets = (val & 0xffff) as u16;
    SgiDescriptor {
        routing: if irm { SgiRouting::ToOthersInCell } else { SgiRouting::Targets },
        targets,
        affinity: [aff1, aff2, aff3],
        id,
    }
}

fn handle_smc(cpu: &PerCpu, ctx: &mut TrapContext) -> TrapOutcome {
    let function_id = ctx.read_reg(0);
    let result = if psci::is_psci_function(function_id) {
        psci::psci_dispatch(cpu, &psci_args(ctx))
    } else {
        match smc_gateway() {
            Some(gw) => {
                let out = gw.call(function_id as u64, ctx.read_reg(1) as u64, ctx.read_reg(2) as u64, ctx.read_reg(3) as u64);
                ctx.write_reg(1, out[1] as u32);
                ctx.write_reg(2, out[2] as u32);
                ctx.write_reg(3, out[3] as u32);
                out[0] as i32
            }
            None => {
                log::warn!("no SMC gateway installed; dropping non-PSCI SMC {function_id:#x}");
                psci::PSCI_NOT_SUPPORTED
            }
        }
    };
    ctx.write_reg(0, result as u32);
    arch_skip_instruction(ctx);
    TrapOutcome::Handled
}

/// HVC traps never need an instruction skip: the architecture already
/// advances `ELR_hyp` past the `hvc` instruction before the exception is
/// taken (§4.3, mirroring the teacher's own `arch_handle_hvc`, which never
/// calls `arch_skip_instruction`).
fn handle_hvc(cpu: &PerCpu, ctx: &mut TrapContext) -> TrapOutcome {
    let function_id = ctx.read_reg(0);
    if psci::is_psci_function(function_id) {
        let result = psci::psci_dispatch(cpu, &psci_args(ctx));
        ctx.write_reg(0, result as u32);
    } else {
        log::warn!("non-PSCI HVC {function_id:#x} has no registered handler");
    }
    TrapOutcome::Handled
}

/// Data abort trap (EC `0x24`/`0x25`): decode the ISS into an [`MmioAccess`]
/// and route it through the calling cell's MMIO dispatcher (§4.3 DABT).
/// ISS layout: `ISV`=bit24, `WnR`=bit6, `SAS`=bits23:22, `SRT`=bits20:16.
fn handle_dabt(cpu: &PerCpu, ctx: &mut TrapContext) -> TrapOutcome {
    let Some(cell) = cpu.cell() else {
        return TrapOutcome::Unhandled;
    };
    let hsr = ctx.syndrome;
    if hsr & (1 << 24) == 0 {
        // ISV clear: syndrome doesn't describe the access well enough to
        // emulate (e.g. a load/store-multiple); nothing to dispatch.
        return TrapOutcome::Unhandled;
    }
    let is_write = hsr & (1 << 6) != 0;
    let sas = (hsr >> 22) & 0x3;
    let srt = ((hsr >> 16) & 0x1f) as usize;
    let size: u8 = match sas {
        0 => 1,
        1 => 2,
        2 => 4,
        _ => 8,
    };
    let address = unsafe { crate::arch::read_fault_ipa() } as usize;

    let mut access = MmioAccess {
        address,
        size,
        is_write,
        value: if is_write { ctx.read_reg(srt) as u64 } else { 0 },
    };

    match cell.mmio().handle_access(&mut access) {
        MmioOutcome::Handled => {
            if !is_write {
                ctx.write_reg(srt, access.value as u32);
            }
            arch_skip_instruction(ctx);
            TrapOutcome::Handled
        }
        MmioOutcome::Unhandled => TrapOutcome::Unhandled,
    }
}

/// Dispatch purely on exception class, mirroring the sparse `trap_handlers`
/// table: only the five classes this crate emulates have an arm, everything
/// else is unhandled.
fn dispatch(class: u32, cpu: &PerCpu, ctx: &mut TrapContext) -> TrapOutcome {
    match class {
        ec::CP15_32 => handle_cp15_32(cpu, ctx),
        ec::CP15_64 => handle_cp15_64(cpu, ctx),
        ec::HVC32 | ec::HVC64 => handle_hvc(cpu, ctx),
        ec::SMC32 | ec::SMC64 => handle_smc(cpu, ctx),
        ec::DABT_LOW | ec::DABT_CUR => handle_dabt(cpu, ctx),
        _ => TrapOutcome::Unhandled,
    }
}

/// Top-level trap entry point (§4.3 `arch_handle_trap`): capture is already
/// done by the caller (the values live in `ctx`); this function condition-
/// checks, dispatches, and reports the outcome. Skipping the instruction on
/// a failed condition and writing `{pc, psr}` back out on success is the
/// caller's job once it knows the outcome, since it alone owns the banked
/// `ELR_hyp`/`SPSR_hyp` pair this context was staged from.
pub fn arch_handle_trap(cpu: &PerCpu, ctx: &mut TrapContext) -> TrapOutcome {
    let class = ctx.syndrome >> 26;

    if arch_failed_condition(ctx, class) {
        arch_skip_instruction(ctx);
        return TrapOutcome::Handled;
    }

    dispatch(class, cpu, ctx)
}

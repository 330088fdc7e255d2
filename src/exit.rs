// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Shyper is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Top-level exit handler (§2 data flow, §6 exit reason word).
//!
//! Grounded on the Jailhouse ARM port's `control.c` (`arch_handle_exit`,
//! `arch_handle_sgi`, `arch_handle_phys_irq`) and its arm64 counterpart in
//! `arch/arm64/control.c` — the same three functions, unified over the
//! [`crate::vgic::IrqChipOps`]/[`PerCpu`] abstraction so one implementation
//! serves both host word sizes. The entry trampoline (out of scope, §9
//! design notes) captures `{pc, psr, syndrome}` for a synchronous exception
//! or reads `IAR` for an IRQ exception before calling in here.

use core::sync::atomic::Ordering;

use crate::collab::console;
use crate::context::TrapContext;
use crate::percpu::{self, ControlState, PerCpu};
use crate::trap::{self, TrapOutcome};
use crate::vgic::{PhysIrqOutcome, SGI_EVENT, SGI_INJECT};

/// SGIs are architecturally IDs `0..16`; everything at or above is a PPI/SPI
/// (ARMv8 ARM, GIC architecture specification).
const SGI_ID_LIMIT: u32 = 16;

/// Why the guest exited to the hypervisor, as classified by the entry
/// trampoline before it calls in here.
pub enum ExitReason<'r, 'c> {
    /// A synchronous exception with a decoded syndrome — routed through
    /// [`crate::trap::arch_handle_trap`].
    Synchronous(&'r mut TrapContext<'c>),
    /// A physical IRQ, already acknowledged; carries the IRQ number read
    /// from `IAR`.
    Irq(u32),
    /// FIQ and Undefined-Instruction vectors are never expected on a
    /// correctly configured system (§9 design notes) — always fatal.
    Fiq,
    Undef,
    /// Stage-1/stage-2 data or prefetch abort the entry trampoline could not
    /// decode into a [`TrapContext`] (e.g. a syndrome this core's allow-list
    /// does not recognise) — fatal, same bucket as `Fiq`/`Undef`.
    Dabt,
    Pabt,
    /// An HVC the entry trampoline routed here directly instead of through
    /// [`ExitReason::Synchronous`] (e.g. a call number outside the PSCI/SMC
    /// emulation range) — fatal, distinct from the HVC traps `trap::arch_handle_trap`
    /// already emulates.
    Hvc,
}

/// `arch_handle_exit` (§2): classify and dispatch one guest exit, counting it
/// under the right [`crate::percpu::ExitStats`] bucket.
pub fn arch_handle_exit(cpu: &'static PerCpu, reason: ExitReason<'_, '_>) {
    cpu.stats.total.fetch_add(1, Ordering::Relaxed);

    match reason {
        // §7 error kind 2, "unhandled trap": fatal to the offending guest's
        // cell only — the rest of the system survives (§7's critical
        // boundary between kinds 2 and 4).
        ExitReason::Synchronous(ctx) => match trap::arch_handle_trap(cpu, ctx) {
            TrapOutcome::Handled => {}
            TrapOutcome::Unhandled => arch_panic_park(cpu, "unhandled trap"),
            TrapOutcome::Forbidden => arch_panic_park(cpu, "forbidden access"),
        },
        ExitReason::Irq(irqn) => arch_handle_irq(cpu, irqn),
        // §7 error kind 4, "fatal hypervisor fault": an exit reason this
        // core never expects on a correctly configured system — the whole
        // machine halts, not just the offending cell.
        ExitReason::Fiq => arch_panic_stop(cpu, "unexpected FIQ"),
        ExitReason::Undef => arch_panic_stop(cpu, "unexpected undefined instruction"),
        ExitReason::Dabt => arch_panic_stop(cpu, "unexpected data abort"),
        ExitReason::Pabt => arch_panic_stop(cpu, "unexpected prefetch abort"),
        ExitReason::Hvc => arch_panic_stop(cpu, "unexpected raw HVC exit"),
    }
}

fn arch_handle_irq(cpu: &'static PerCpu, irqn: u32) {
    if irqn < SGI_ID_LIMIT {
        arch_handle_sgi(cpu, irqn as u8);
    } else {
        arch_handle_phys_irq(cpu, irqn);
    }
}

/// `arch_handle_sgi` (§4.5/§4.7): the two control SGIs this crate reserves
/// for itself. `SGI_EVENT` drives the control FSM and counts as a
/// management exit; `SGI_INJECT` retries the pending-IRQ queue and counts
/// as a vSGI exit (Jailhouse's own `arch_handle_sgi` splits the two
/// counters the same way). Anything else is logged and dropped, since no
/// other SGI id is meaningful to the arch-specific core.
pub fn arch_handle_sgi(cpu: &'static PerCpu, sgi_id: u8) {
    match sgi_id {
        SGI_EVENT => {
            cpu.stats.management.fetch_add(1, Ordering::Relaxed);
            match cpu.check_events() {
                ControlState::Parking | ControlState::ShuttingDown => cpu.park_self(),
                ControlState::Resetting => cpu.cpu_reset(),
                ControlState::Running | ControlState::Suspended => {}
            }
        }
        SGI_INJECT => {
            cpu.stats.vsgi.fetch_add(1, Ordering::Relaxed);
            if let Some(cell) = cpu.cell() {
                cell.irqchip().inject_pending(cpu);
            }
        }
        other => log::warn!("unrecognised control SGI {other} on cpu {}", cpu.cpu_id),
    }
}

/// `arch_handle_phys_irq` (§4.7 "IRQ classification at exit"): let the vGIC
/// backend decide whether the interrupt was fully handled in the
/// hypervisor (the maintenance IRQ — drains the pending-retry queue) or
/// must be forwarded to the guest (injected now, or queued for the next
/// maintenance/`SGI_INJECT` drain if no list register is free yet).
pub fn arch_handle_phys_irq(cpu: &'static PerCpu, irqn: u32) {
    let Some(cell) = cpu.cell() else {
        log::warn!("phys irq {irqn} on cpu {} with no owning cell", cpu.cpu_id);
        return;
    };

    match cell.irqchip().handle_irq(cpu, irqn) {
        PhysIrqOutcome::HandledByHypervisor => {
            cpu.stats.maintenance.fetch_add(1, Ordering::Relaxed);
        }
        PhysIrqOutcome::ForGuest => {
            cpu.stats.virq.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// `arch_panic_park` (§6 "exposed functions", §7 error kind 2): dump the
/// offending CPU's registers, then drive every CPU the owning cell holds —
/// including this one — into the parking map. Every other cell keeps
/// running. The offending CPU never executes another guest instruction in
/// this cell; the caller returns normally and resumes into the parked
/// stage-2 map `park_self` just installed.
pub fn arch_panic_park(cpu: &'static PerCpu, why: &str) {
    log::error!("cpu {}: {why}", cpu.cpu_id);
    if let Some(console) = console() {
        let regs = unsafe { cpu.regs_mut() };
        console.panic_print(&format_args!("cpu {}: {why}\n{regs}", cpu.cpu_id));
    }
    if let Some(cell) = cpu.cell() {
        for &cpu_id in cell.cpu_set() {
            if cpu_id != cpu.cpu_id {
                percpu::cpu(cpu_id).request_park();
            }
        }
    }
    cpu.park_self();
}

/// `arch_panic_stop` (§6 "exposed functions", §7 error kind 4): dump state
/// and stop the world. Never returns — the system is bricked until reset.
pub fn arch_panic_stop(cpu: &'static PerCpu, why: &str) -> ! {
    log::error!("cpu {}: {why}", cpu.cpu_id);
    if let Some(console) = console() {
        let regs = unsafe { cpu.regs_mut() };
        console.panic_print(&format_args!("cpu {}: {why}\n{regs}", cpu.cpu_id));
        console.panic_stop();
    }
    loop {
        core::hint::spin_loop();
    }
}

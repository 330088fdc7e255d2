// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Shyper is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! PSCI (Power State Coordination Interface) emulation (§4.4).
//!
//! Grounded on the Jailhouse ARM port's `psci.c` (`psci_dispatch`,
//! `psci_emulate_cpu_on`, `psci_emulate_affinity_info`); constant names and
//! values follow the teacher's own `arch::aarch64::psci` table, which
//! already carries the real SMCCC PSCI encodings this spec requires
//! bit-exact. Unlike the teacher, which forwards these as outbound calls to
//! real firmware via the `smccc` crate's typed wrappers, every function here
//! is fully emulated against local per-CPU state — nothing is forwarded.

use crate::cell::Cell;
use crate::percpu::PerCpu;

/// Function ids, 32-bit SMC32 calling convention (§6 bit-exact constants).
pub const PSCI_VERSION: u32 = 0x8400_0000;
pub const PSCI_CPU_SUSPEND_32: u32 = 0x8400_0001;
pub const PSCI_CPU_OFF: u32 = 0x8400_0002;
pub const PSCI_CPU_ON_32: u32 = 0x8400_0003;
pub const PSCI_AFFINITY_INFO_32: u32 = 0x8400_0004;
pub const PSCI_CPU_ON_V0_1_UBOOT: u32 = 0x9500_0003;
pub const PSCI_CPU_OFF_V0_1_UBOOT: u32 = 0x9500_0002;

/// SMC64 aliases, used when the guest is AArch64.
pub const PSCI_CPU_SUSPEND_64: u32 = 0xc400_0001;
pub const PSCI_CPU_ON_64: u32 = 0xc400_0003;
pub const PSCI_AFFINITY_INFO_64: u32 = 0xc400_0004;

/// Result codes (§6 bit-exact constants).
pub const PSCI_SUCCESS: i32 = 0;
pub const PSCI_NOT_SUPPORTED: i32 = -1;
pub const PSCI_DENIED: i32 = -3;
pub const PSCI_ALREADY_ON: i32 = -4;
pub const PSCI_CPU_IS_ON: i32 = 0;
pub const PSCI_CPU_IS_OFF: i32 = 1;

/// Sentinel for `cpu_on_entry`: "not yet powered on."
pub const PSCI_INVALID_ADDRESS: u64 = u64::MAX;

/// The four argument/return registers a PSCI call travels in (`r0..r3` on
/// AArch32, `x0..x3` on AArch64): function id, then up to three arguments.
pub struct PsciArgs {
    pub function_id: u32,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
}

fn cpu_on(cell: &Cell, args: &PsciArgs) -> i32 {
    let Some(target) = cell.cpu_by_mpidr(args.arg1) else {
        return PSCI_DENIED;
    };

    let mut kick = false;
    let result = {
        let mut guard = target.control.lock();
        if guard.wait_for_poweron {
            guard.cpu_on_entry = args.arg2;
            guard.cpu_on_context = args.arg3;
            guard.reset = true;
            kick = true;
            PSCI_SUCCESS
        } else {
            PSCI_ALREADY_ON
        }
    };

    if kick {
        target.kick();
    }
    result
}

fn affinity_info(cell: &Cell, args: &PsciArgs) -> i32 {
    let Some(target) = cell.cpu_by_mpidr(args.arg1) else {
        return PSCI_DENIED;
    };
    if target.control.lock().wait_for_poweron {
        PSCI_CPU_IS_OFF
    } else {
        PSCI_CPU_IS_ON
    }
}

/// Dispatch a guest PSCI call on behalf of `cpu_data` (§4.4's table).
/// `cpu_off` never returns to the caller: it parks the calling CPU.
pub fn psci_dispatch(cpu_data: &PerCpu, args: &PsciArgs) -> i32 {
    cpu_data.stats.psci.fetch_add(1, core::sync::atomic::Ordering::Relaxed);

    match args.function_id {
        PSCI_VERSION => {
            log::debug!("PSCI VERSION");
            // Major[31:16] = 0, minor[15:0] = 2 — PSCI v0.2.
            2
        }
        PSCI_CPU_OFF | PSCI_CPU_OFF_V0_1_UBOOT => {
            log::debug!("PSCI CPU_OFF on cpu {}", cpu_data.cpu_id);
            cpu_data.park_self();
            PSCI_SUCCESS
        }
        PSCI_CPU_ON_32 | PSCI_CPU_ON_64 | PSCI_CPU_ON_V0_1_UBOOT => {
            log::debug!("PSCI CPU_ON mpidr={:#x} entry={:#x}", args.arg1, args.arg2);
            match cpu_data.cell() {
                Some(cell) => cpu_on(&cell, args),
                None => PSCI_DENIED,
            }
        }
        PSCI_AFFINITY_INFO_32 | PSCI_AFFINITY_INFO_64 => match cpu_data.cell() {
            Some(cell) => affinity_info(&cell, args),
            None => PSCI_DENIED,
        },
        other => {
            log::warn!("unsupported PSCI function id {other:#x}");
            PSCI_NOT_SUPPORTED
        }
    }
}

/// True if `function_id` belongs to any PSCI function range this emulator
/// recognises; used by the SMC/HVC trap handlers (§4.3) to decide whether to
/// dispatch here or forward/reject the call.
pub fn is_psci_function(function_id: u32) -> bool {
    matches!(
        function_id,
        PSCI_VERSION
            | PSCI_CPU_SUSPEND_32
            | PSCI_CPU_SUSPEND_64
            | PSCI_CPU_OFF
            | PSCI_CPU_OFF_V0_1_UBOOT
            | PSCI_CPU_ON_32
            | PSCI_CPU_ON_64
            | PSCI_CPU_ON_V0_1_UBOOT
            | PSCI_AFFINITY_INFO_32
            | PSCI_AFFINITY_INFO_64
    )
}

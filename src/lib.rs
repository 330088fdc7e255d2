// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Shyper is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Per-CPU trap dispatch, vGIC and PSCI emulation core for a static
//! partitioning hypervisor on ARM.
//!
//! This crate owns exactly the arch-specific slice of such a hypervisor:
//! the per-CPU lifecycle/control state machine, the synchronous-trap
//! dispatcher, the virtual GIC driver, and the PSCI power-management
//! emulation. Stage-2 page tables, the MMIO-dispatch framework, the
//! console and cell-configuration loading are out of scope — they are
//! named collaborators in [`collab`], supplied by the embedding
//! hypervisor binary.
//!
//! Module map, leaves first:
//! - [`context`] — the guest register save area and per-exit trap context.
//! - [`cond`] — AArch32 condition-code evaluation and IT-state advancement.
//! - [`arch`] — host-architecture glue (exception-class numbers, SMC calling
//!   convention, CP15 register names).
//! - [`collab`] — traits for the out-of-scope collaborators.
//! - [`percpu`] — the per-CPU record and control state machine.
//! - [`cell`] — the cell data model and lifecycle.
//! - [`vgic`] — the virtual interrupt-controller driver (`gicv2`/`gicv3`).
//! - [`psci`] — the PSCI power-coordination emulator.
//! - [`trap`] — the synchronous-trap dispatcher.
//! - [`exit`] — the top-level exit handler tying the above together.

#![no_std]
#![allow(unused_doc_comments)]

extern crate alloc;
#[macro_use]
extern crate log;

#[cfg(not(any(feature = "gicv2", feature = "gicv3")))]
compile_error!("exactly one of the `gicv2`/`gicv3` features must be enabled");
#[cfg(all(feature = "gicv2", feature = "gicv3"))]
compile_error!("`gicv2` and `gicv3` are mutually exclusive (§12: a closed tagged variant, not both at once)");

pub mod arch;
pub mod cell;
pub mod collab;
pub mod cond;
pub mod context;
pub mod error;
pub mod exit;
mod panic;
pub mod percpu;
pub mod psci;
pub mod trap;
pub mod vgic;

/// Everything a concrete hypervisor binary needs to install once, before the
/// first cell is created or the first guest trap taken (§6 "exposed
/// functions" precondition; §10.1/§10.3).
pub fn init(console: alloc::sync::Arc<dyn collab::ConsoleOps>, parking_space: alloc::sync::Arc<dyn collab::PagingOps>) {
    collab::install_console(console);
    percpu::install_parking_space(parking_space);
}

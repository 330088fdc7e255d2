// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Shyper is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Virtual GIC driver (§4.7).
//!
//! `IrqChipOps` is the capability-set trait named in §9's design notes,
//! implemented by exactly two closed variants, [`v2::GicV2`] and
//! [`v3::GicV3`], selected by the mutually exclusive `gicv2`/`gicv3` Cargo
//! features (SPEC_FULL §12) — the same "tagged variant over two concrete
//! implementations" the teacher itself uses to pick between its `vgic` and
//! `vgicv3` modules.

use crate::cell::Cell;
use crate::collab::{MmioOps, PagingOps};
use crate::error::Result;
use crate::percpu::PerCpu;

#[cfg(feature = "gicv2")]
pub mod v2;
#[cfg(feature = "gicv3")]
pub mod v3;

/// Routing mode for a software-generated interrupt (§3 "SGI descriptor").
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SgiRouting {
    /// Deliver only to the calling CPU.
    ToSelf,
    /// Deliver to every other CPU in the calling cell.
    ToOthersInCell,
    /// Deliver to an explicit target list (v2: 8-bit CPU bitmap; v3: the
    /// affinity fields plus target bitmap carried in `affinity`).
    Targets,
}

/// §3 "SGI descriptor": routing mode, affinity fields (v3 only), an 8-bit
/// target bitmap (v2), and the 4-bit SGI id.
#[derive(Copy, Clone, Debug)]
pub struct SgiDescriptor {
    pub routing: SgiRouting,
    pub targets: u16,
    pub affinity: [u8; 3],
    pub id: u8,
}

impl SgiDescriptor {
    pub fn to_cpu(id: u8, cpu_id: usize) -> Self {
        SgiDescriptor {
            routing: SgiRouting::Targets,
            targets: 1u16 << cpu_id,
            affinity: [0; 3],
            id,
        }
    }

    pub fn to_others_in_cell(id: u8) -> Self {
        SgiDescriptor {
            routing: SgiRouting::ToOthersInCell,
            targets: 0,
            affinity: [0; 3],
            id,
        }
    }
}

/// SGI id reserved to kick a target CPU's control-FSM event loop (§4.5).
pub const SGI_EVENT: u8 = 0;
/// SGI id used to signal "re-inject pending list-register entries now."
pub const SGI_INJECT: u8 = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SgiError {
    InvalidId,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InjectError {
    /// No free list register (§4.7 "IRQ inject").
    Busy,
    /// The virtual id is already resident in a list register.
    Exists,
}

/// Whether a physical IRQ delivered to the hypervisor was fully handled here
/// or must still be presented to the guest (§4.7 "IRQ classification at
/// exit").
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PhysIrqOutcome {
    HandledByHypervisor,
    ForGuest,
}

/// Total architectural INTIDs a list-register index must be able to name,
/// shared by both back ends' pending-retry bitmap (§4.7 "Maintenance IRQ").
pub const MAX_IRQS: usize = 1024;
/// `MAX_IRQS` packed 32 bits to a word.
pub const PENDING_WORDS: usize = MAX_IRQS / 32;

/// The capability set named in §9: `{init, cpu_init, cpu_reset, cell_init,
/// cell_exit, adjust_irq_target, send_sgi, handle_irq, inject_irq,
/// enable_maint_irq, eoi_irq}`.
pub trait IrqChipOps: Send + Sync {
    /// Map the physical CPU-interface and hypervisor-interface pages and
    /// read the list-register capacity.
    fn init(&self, paging: &dyn PagingOps) -> Result<()>;

    /// Enable IPIs and the maintenance PPI; program the real CPU interface
    /// and hypervisor interface for this CPU.
    fn cpu_init(&self);

    /// Re-arm this CPU's interrupt state for a newly assigned cell (or for
    /// shutdown, when `is_shutdown` is set — §4.7 "per-CPU reset").
    fn cpu_reset(&self, cpu: &PerCpu, is_shutdown: bool);

    /// Remap the cell's CPU-interface view and register the distributor
    /// MMIO handler (§4.7 "per-cell init"). `paging` is the same collaborator
    /// handed to [`Self::init`], needed here for the GICv2 back end's
    /// CPU-interface-page remap (`gic_cell_init`'s `paging_create` call).
    fn cell_init(&self, cell: &Cell, mmio: &dyn MmioOps, paging: &dyn PagingOps) -> Result<()>;

    fn cell_exit(&self, cell: &Cell);

    /// Rewrite an interrupt's routing if its current target has left the
    /// cell that now owns it.
    fn adjust_irq_target(&self, cell: &Cell, irq_id: u32);

    fn send_sgi(&self, sgi: &SgiDescriptor) -> core::result::Result<(), SgiError>;

    /// Classify and act on a physical IRQ delivered to this CPU (§4.7 "IRQ
    /// classification at exit").
    fn handle_irq(&self, cpu: &PerCpu, irqn: u32) -> PhysIrqOutcome;

    fn inject_irq(&self, cpu: &PerCpu, irq_id: u32, is_sgi: bool) -> core::result::Result<(), InjectError>;

    fn enable_maint_irq(&self, enable: bool);

    fn eoi_irq(&self, irq_id: u32, deactivate: bool);

    /// Record `irq_id` as pending for `cpu` after a list-register allocation
    /// attempt returned [`InjectError::Busy`] (§4.7 "Maintenance IRQ": "the
    /// vGIC enables the underflow-interrupt bit in HCR whenever the guest
    /// has more pending virtual IRQs than available list registers"). A
    /// provided default so `GicV2`/`GicV3` share one implementation over
    /// the pending bitmap kept in `PerCpu` rather than reimplementing the
    /// bookkeeping in each back end.
    fn set_pending(&self, cpu: &PerCpu, irq_id: u32) {
        cpu.mark_pending(irq_id);
        self.enable_maint_irq(true);
    }

    /// Retry every IRQ queued by `set_pending` for `cpu`, clearing each one
    /// that finds a free list register or is already resident (§8 scenario
    /// 6 "maintenance drain"). Called from both the `SGI_INJECT` path and
    /// the maintenance IRQ itself.
    fn inject_pending(&self, cpu: &PerCpu) {
        for irq_id in cpu.pending_ids() {
            match self.inject_irq(cpu, irq_id, irq_id < 16) {
                Ok(()) | Err(InjectError::Exists) => cpu.clear_pending(irq_id),
                Err(InjectError::Busy) => {}
            }
        }
        if !cpu.has_pending() {
            self.enable_maint_irq(false);
        }
    }
}

// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Shyper is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Cell data model and lifecycle (§3 "Cell", §4.6).
//!
//! Grounded on the Jailhouse ARM port's `control.c` (`arch_cell_create`,
//! `arch_cell_destroy`, `arch_cell_reset`, `arch_flush_cell_vcpu_caches`)
//! for ordering and rollback, and on the teacher's `kernel::vm` `Arc`-held
//! construction idiom, trimmed down to the static-partition model this
//! crate implements: no scheduler, no per-cell vcpu array, CPUs pinned for
//! the cell's lifetime.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::collab::{MmioOps, PagingOps};
use crate::error::{ErrorKind, Result};
use crate::percpu::{self, PerCpu};
use crate::psci::PSCI_INVALID_ADDRESS;
use crate::vgic::IrqChipOps;

/// A static partition (§3 "Cell"): a disjoint set of owned physical CPUs,
/// a stage-2 address space, and the highest virtual CPU id in the cell.
/// Never resized after `cell_create` (§1 Non-goals: no migration/hotplug).
pub struct Cell {
    /// Owned physical CPU indices, ascending — the order that assigns
    /// `virt_id` during `cell_create` (§4.6 step 2).
    cpu_set: Vec<usize>,
    paging: Arc<dyn PagingOps>,
    irqchip: Arc<dyn IrqChipOps>,
    mmio: Arc<dyn MmioOps>,
    last_virt_id: usize,
    /// Requests a cache/TLB flush after reconfiguration (§3 "Cell"
    /// attributes); set by `cell_reset`, consumed by the next commit.
    flush_requested: core::sync::atomic::AtomicBool,
}

impl Cell {
    pub fn cpu_set(&self) -> &[usize] {
        &self.cpu_set
    }

    pub fn last_virt_id(&self) -> usize {
        self.last_virt_id
    }

    pub fn paging(&self) -> &dyn PagingOps {
        &*self.paging
    }

    pub fn irqchip(&self) -> &dyn IrqChipOps {
        &*self.irqchip
    }

    pub fn mmio(&self) -> &dyn MmioOps {
        &*self.mmio
    }

    /// Translate a guest `MPIDR` affinity value to one of this cell's
    /// physical CPUs (§4.4 "translate `mpidr` to a physical CPU within the
    /// calling cell"). The low bits of `mpidr` carry the virtual id this
    /// crate assigned at `cell_create` time; anything else is `None`
    /// ("virtual id not in set" in the Jailhouse source), even if the
    /// underlying physical CPU exists in a sibling cell (§8 boundary case).
    pub fn cpu_by_mpidr(&self, mpidr: u64) -> Option<&'static PerCpu> {
        let virt_id = (mpidr & 0xff) as usize;
        self.cpu_set
            .iter()
            .copied()
            .find(|&cpu_id| percpu::cpu(cpu_id).control.lock().virt_id == virt_id)
            .map(percpu::cpu)
    }
}

/// `arch_cell_create` (§4.6): build the stage-2 space, assign virtual ids
/// in ascending physical-CPU order (primary gets `cpu_on_entry = 0`, the
/// rest `INVALID_ADDRESS`), initialise the irqchip's per-cell state, and
/// wire each CPU's `PerCpu::cell` to the new cell. Any failing step unwinds
/// the ones that already succeeded, in reverse order (§7.3).
pub fn cell_create(
    cpu_set: Vec<usize>,
    paging: Arc<dyn PagingOps>,
    irqchip: Arc<dyn IrqChipOps>,
    mmio: Arc<dyn MmioOps>,
) -> Result<Arc<Cell>> {
    let mut cpu_set = cpu_set;
    cpu_set.sort_unstable();

    paging.create()?;

    let last_virt_id = cpu_set.len().saturating_sub(1);
    let cell = Arc::new(Cell {
        cpu_set: cpu_set.clone(),
        paging: paging.clone(),
        irqchip: irqchip.clone(),
        mmio,
        last_virt_id,
        flush_requested: core::sync::atomic::AtomicBool::new(false),
    });

    for (virt_id, &cpu_id) in cpu_set.iter().enumerate() {
        let mut st = percpu::cpu(cpu_id).control.lock();
        st.virt_id = virt_id;
        st.cpu_on_entry = if virt_id == 0 { 0 } else { PSCI_INVALID_ADDRESS };
        st.cell = Some(cell.clone());
    }

    if let Err(e) = irqchip.cell_init(&cell, &*cell.mmio, &*paging) {
        let _ = paging.destroy();
        for &cpu_id in &cpu_set {
            let mut st = percpu::cpu(cpu_id).control.lock();
            st.cell = None;
        }
        log::error!("cell_create: irqchip init failed, rolled back paging");
        return Err(ErrorKind::IrqChip.wrap(alloc::boxed::Box::new(e)));
    }

    log::info!(
        "cell created: cpus={:?} last_virt_id={}",
        cell.cpu_set(),
        cell.last_virt_id()
    );
    Ok(cell)
}

/// `arch_cell_destroy` (§4.6): flush every D-cache line the cell owns,
/// reclaim each CPU's `virt_id` back to its physical id (root-cell
/// numbering) and clear `cpu_on_entry`, then tear down irqchip and paging.
pub fn cell_destroy(cell: &Cell) {
    // Step 1: invalidate the cell's D-cache lines. The actual cache
    // maintenance instruction sequence is a per-platform collaborator
    // concern (§1 out of scope: `arm_paging_*`); flushing is requested
    // through the same paging handle every other stage-2 op uses.
    cell.paging.flush_tlbs();

    for &cpu_id in cell.cpu_set() {
        let mut st = percpu::cpu(cpu_id).control.lock();
        st.virt_id = cpu_id;
        st.cpu_on_entry = PSCI_INVALID_ADDRESS;
        st.cell = None;
    }

    cell.irqchip.cell_exit(cell);
    let _ = cell.paging.destroy();

    log::info!("cell destroyed: cpus={:?}", cell.cpu_set());
}

/// `arch_cell_reset` (§4.6): flush the cell's D-cache lines; no other
/// per-CPU state changes (unlike destroy, the cell keeps its CPUs).
pub fn cell_reset(cell: &Cell) {
    cell.paging.flush_tlbs();
    cell.flush_requested.store(false, core::sync::atomic::Ordering::Relaxed);
}

/// `arch_flush_cell_vcpu_caches` (§4.6): flush inline on the calling CPU,
/// defer to the next event-loop pass for everyone else.
pub fn flush_cell_vcpu_caches(cell: &Cell, calling_cpu: usize) {
    for &cpu_id in cell.cpu_set() {
        if cpu_id == calling_cpu {
            cell.paging.flush_tlbs();
        } else {
            percpu::cpu(cpu_id).control.lock().flush_vcpu_caches = true;
        }
    }
}

/// `arch_config_commit`: let the irqchip react to a cell being added or
/// removed (e.g. re-adjust interrupt routing for CPUs that changed cells).
pub fn config_commit(cell: &Cell) {
    cell.irqchip.cell_exit(cell);
    if let Err(e) = cell.irqchip.cell_init(cell, &*cell.mmio, &*cell.paging) {
        log::error!("config_commit: irqchip re-init failed: {e:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{HostPhysAddr, HypVirtAddr};

    struct FakePaging;
    impl PagingOps for FakePaging {
        fn map_device(&self, _phys: HostPhysAddr, _size: usize) -> Option<HypVirtAddr> {
            Some(0x1000)
        }
        fn create(&self) -> Result<()> {
            Ok(())
        }
        fn map_cell_device(&self, _gpa: crate::collab::GuestPhysAddr, _hpa: HostPhysAddr, _size: usize, _flags: u32) -> Result<()> {
            Ok(())
        }
        fn destroy(&self) -> Result<()> {
            Ok(())
        }
        fn vcpu_init(&self) {}
        fn flush_tlbs(&self) {}
    }

    struct FakeIrqChip;
    impl IrqChipOps for FakeIrqChip {
        fn init(&self, _paging: &dyn PagingOps) -> Result<()> {
            Ok(())
        }
        fn cpu_init(&self) {}
        fn cpu_reset(&self, _cpu: &PerCpu, _is_shutdown: bool) {}
        fn cell_init(&self, _cell: &Cell, _mmio: &dyn MmioOps, _paging: &dyn PagingOps) -> Result<()> {
            Ok(())
        }
        fn cell_exit(&self, _cell: &Cell) {}
        fn adjust_irq_target(&self, _cell: &Cell, _irq_id: u32) {}
        fn send_sgi(&self, _sgi: &crate::vgic::SgiDescriptor) -> core::result::Result<(), crate::vgic::SgiError> {
            Ok(())
        }
        fn handle_irq(&self, _cpu: &PerCpu, _irqn: u32) -> crate::vgic::PhysIrqOutcome {
            crate::vgic::PhysIrqOutcome::ForGuest
        }
        fn inject_irq(
            &self,
            _cpu: &PerCpu,
            _irq_id: u32,
            _is_sgi: bool,
        ) -> core::result::Result<(), crate::vgic::InjectError> {
            Ok(())
        }
        fn enable_maint_irq(&self, _enable: bool) {}
        fn eoi_irq(&self, _irq_id: u32, _deactivate: bool) {}
    }

    struct FakeMmio;
    impl MmioOps for FakeMmio {
        fn register_region(&self, _base: HostPhysAddr, _size: usize, _ctx: usize) -> Result<()> {
            Ok(())
        }
        fn handle_access(&self, _access: &mut crate::collab::MmioAccess) -> crate::collab::MmioOutcome {
            crate::collab::MmioOutcome::Unhandled
        }
    }

    #[test]
    fn cell_create_assigns_contiguous_virt_ids_in_physical_order() {
        let cell = cell_create(
            alloc::vec![5, 3],
            Arc::new(FakePaging),
            Arc::new(FakeIrqChip),
            Arc::new(FakeMmio),
        )
        .unwrap();
        assert_eq!(cell.cpu_set(), &[3, 5]);
        assert_eq!(percpu::cpu(3).control.lock().virt_id, 0);
        assert_eq!(percpu::cpu(3).control.lock().cpu_on_entry, 0);
        assert_eq!(percpu::cpu(5).control.lock().virt_id, 1);
        assert_eq!(percpu::cpu(5).control.lock().cpu_on_entry, PSCI_INVALID_ADDRESS);
        cell_destroy(&cell);
    }

    #[test]
    fn cell_destroy_reclaims_virt_id_to_physical_id() {
        let cell = cell_create(alloc::vec![6], Arc::new(FakePaging), Arc::new(FakeIrqChip), Arc::new(FakeMmio)).unwrap();
        cell_destroy(&cell);
        assert_eq!(percpu::cpu(6).control.lock().virt_id, 6);
        assert_eq!(percpu::cpu(6).control.lock().cpu_on_entry, PSCI_INVALID_ADDRESS);
    }
}

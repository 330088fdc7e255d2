// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Shyper is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! GICv2 back end (§4.7, `gicv2` feature).
//!
//! Near line-for-line port of the Jailhouse ARM port's `gic-v2.c`
//! (`gic_init`, `gic_cpu_init`, `gic_cpu_reset`, `gic_cell_init`,
//! `gic_send_sgi`, `gic_inject_irq`, `gic_adjust_irq_target`) into safe(r)
//! Rust over `tock-registers` MMIO blocks, reduced to the static-partition
//! semantics this crate implements (one vCPU per physical CPU, no dynamic
//! list per interrupt). Register block field layout mirrors the teacher's
//! own `arch::aarch64::gicv3::GicDistributorBlock` convention, but carries
//! the GICv2-specific fields (`ITARGETSR`, one-word `SGIR`) instead.

use core::mem::size_of;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};

use crate::cell::Cell;
use crate::collab::{map_flags, GuestPhysAddr, HostPhysAddr, HypVirtAddr, MmioOps, PagingOps};
use crate::error::{ErrorKind, Result};
use crate::percpu::PerCpu;
use crate::vgic::{IrqChipOps, InjectError, PhysIrqOutcome, SgiDescriptor, SgiError, SgiRouting};

/// Architectural maximum INTID a GICv2 distributor can describe (1020 SPIs
/// plus the 32 private IDs, rounded up to a register-count-friendly 1024).
const MAX_IRQS: usize = 1024;
const INT_REGS: usize = MAX_IRQS / 32;
const TARGET_REGS: usize = MAX_IRQS * 8 / 32;
const CFG_REGS: usize = MAX_IRQS * 2 / 32;
const SGI_REGS: usize = 16 * 8 / 32;

const GICD_SIZE: usize = 0x1000;
const GICC_SIZE: usize = 0x2000;
const GICH_SIZE: usize = 0x2000;

const GICD_CTLR_ENABLE: u32 = 1;
const GICC_CTLR_ENABLE: u32 = 1;
const GICC_CTLR_EOIMODE_NS: u32 = 1 << 9;
const GICH_HCR_EN: u32 = 1;
const GICH_HCR_LRENPIE: u32 = 1 << 2;
const GICH_VTR_LR_COUNT_MASK: u32 = 0x3f;
const GICH_LR_PENDING: u64 = 1 << 28;
const GICH_LR_HW: u64 = 1 << 31;

/// `GICH_VMCR` bit layout (ARM GIC architecture specification, GICv2 §5.3.13):
/// the guest's priority mask and EOI mode, banked into one hypervisor-owned
/// word so `cpu_init`/`cpu_reset` can move them to and from the real
/// `GICC_PMR`/`GICC_CTLR` in one shot.
const GICH_VMCR_PMR_SHIFT: u32 = 27;
const GICV_PMR_SHIFT: u32 = 3;
const GICH_VMCR_EN0: u32 = 1 << 0;
const GICH_VMCR_EOIMODE: u32 = 1 << 9;

register_structs! {
    #[allow(non_snake_case)]
    pub GicDistributorBlock {
        (0x000 => CTLR: ReadWrite<u32>),
        (0x004 => TYPER: ReadOnly<u32>),
        (0x008 => IIDR: ReadOnly<u32>),
        (0x00c => _reserved0),
        (0x080 => IGROUPR: [ReadWrite<u32>; INT_REGS]),
        (0x100 => ISENABLER: [ReadWrite<u32>; INT_REGS]),
        (0x180 => ICENABLER: [ReadWrite<u32>; INT_REGS]),
        (0x200 => ISPENDR: [ReadWrite<u32>; INT_REGS]),
        (0x280 => ICPENDR: [ReadWrite<u32>; INT_REGS]),
        (0x300 => ISACTIVER: [ReadWrite<u32>; INT_REGS]),
        (0x380 => ICACTIVER: [ReadWrite<u32>; INT_REGS]),
        (0x400 => IPRIORITYR: [ReadWrite<u32>; TARGET_REGS]),
        (0x800 => ITARGETSR: [ReadWrite<u32>; TARGET_REGS]),
        (0xc00 => ICFGR: [ReadWrite<u32>; CFG_REGS]),
        (0xd00 => _reserved1),
        (0xf00 => SGIR: WriteOnly<u32>),
        (0xf04 => _reserved2),
        (0xf10 => CPENDSGIR: [ReadWrite<u32>; SGI_REGS]),
        (0xf20 => SPENDSGIR: [ReadWrite<u32>; SGI_REGS]),
        (0xf30 => _reserved3),
        (0x1000 => @END),
    }
}

register_structs! {
    #[allow(non_snake_case)]
    pub GicCpuInterfaceBlock {
        (0x00 => CTLR: ReadWrite<u32>),
        (0x04 => PMR: ReadWrite<u32>),
        (0x08 => BPR: ReadWrite<u32>),
        (0x0c => IAR: ReadOnly<u32>),
        (0x10 => EOIR: WriteOnly<u32>),
        (0x14 => RPR: ReadOnly<u32>),
        (0x18 => HPPIR: ReadOnly<u32>),
        (0x1c => _reserved0),
        (0x1000 => DIR: WriteOnly<u32>),
        (0x1004 => _reserved1),
        (0x2000 => @END),
    }
}

register_structs! {
    #[allow(non_snake_case)]
    pub GicHypervisorBlock {
        (0x00 => HCR: ReadWrite<u32>),
        (0x04 => VTR: ReadOnly<u32>),
        (0x08 => VMCR: ReadWrite<u32>),
        (0x0c => _reserved0),
        (0x10 => MISR: ReadOnly<u32>),
        (0x14 => _reserved1),
        (0x20 => EISR: [ReadOnly<u32>; 2]),
        (0x28 => _reserved2),
        (0x30 => ELRSR: [ReadOnly<u32>; 2]),
        (0x38 => _reserved3),
        (0xf0 => APR: ReadWrite<u32>),
        (0xf4 => _reserved4),
        (0x100 => LR: [ReadWrite<u64>; 64]),
        (0x200 => @END),
    }
}

struct Blocks {
    gicd: HypVirtAddr,
    gicc: HypVirtAddr,
    gich: HypVirtAddr,
}

pub struct GicV2 {
    phys_gicd: HostPhysAddr,
    phys_gicc: HostPhysAddr,
    phys_gich: HostPhysAddr,
    /// Physical base of the banked "virtual CPU interface" (GICV) block a
    /// platform with this style of GIC exposes alongside the ordinary GICC,
    /// for direct guest access without hypervisor trapping. `cell_init` remaps
    /// each cell's view of the GICC window onto this block (§4.7 "per-cell
    /// init", `gic_cell_init`'s `paging_create(gicv_base, ..., gicc_base)`).
    phys_gicv: HostPhysAddr,
    /// The platform's maintenance PPI number (§6 "bit-exact constants"),
    /// read from the out-of-scope cell-configuration loader and compared
    /// against in `handle_irq` (§4.7 "IRQ classification at exit").
    maintenance_irq: u32,
    blocks: Mutex<Option<Blocks>>,
    lr_count: AtomicUsize,
}

impl GicV2 {
    pub const fn new(
        phys_gicd: HostPhysAddr,
        phys_gicc: HostPhysAddr,
        phys_gich: HostPhysAddr,
        phys_gicv: HostPhysAddr,
        maintenance_irq: u32,
    ) -> Self {
        GicV2 {
            phys_gicd,
            phys_gicc,
            phys_gich,
            phys_gicv,
            maintenance_irq,
            blocks: Mutex::new(None),
            lr_count: AtomicUsize::new(0),
        }
    }

    fn gicd(&self) -> &'static GicDistributorBlock {
        let b = self.blocks.lock();
        let addr = b.as_ref().expect("GicV2::init not called").gicd;
        unsafe { &*(addr as *const GicDistributorBlock) }
    }

    fn gicc(&self) -> &'static GicCpuInterfaceBlock {
        let b = self.blocks.lock();
        let addr = b.as_ref().expect("GicV2::init not called").gicc;
        unsafe { &*(addr as *const GicCpuInterfaceBlock) }
    }

    fn gich(&self) -> &'static GicHypervisorBlock {
        let b = self.blocks.lock();
        let addr = b.as_ref().expect("GicV2::init not called").gich;
        unsafe { &*(addr as *const GicHypervisorBlock) }
    }

    fn set_targets(&self, irq_id: u32, cpu_mask: u8) {
        let idx = (irq_id as usize * 8) / 32;
        let off = (irq_id as usize * 8) % 32;
        let mask = 0xffu32 << off;
        let gicd = self.gicd();
        let prev = gicd.ITARGETSR[idx].get();
        gicd.ITARGETSR[idx].set((prev & !mask) | ((cpu_mask as u32) << off));
    }

    fn find_free_lr(&self) -> Option<usize> {
        let gich = self.gich();
        let elrsr = gich.ELRSR[0].get() as u64 | ((gich.ELRSR[1].get() as u64) << 32);
        let lr_count = self.lr_count.load(Ordering::Relaxed);
        (0..lr_count).find(|&i| elrsr & (1 << i) != 0)
    }

    fn lr_already_pending(&self, irq_id: u32) -> bool {
        let gich = self.gich();
        let lr_count = self.lr_count.load(Ordering::Relaxed);
        (0..lr_count).any(|i| {
            let lr = gich.LR[i].get();
            (lr & 0x3ff) as u32 == irq_id && lr & GICH_LR_PENDING != 0
        })
    }
}

impl IrqChipOps for GicV2 {
    fn init(&self, paging: &dyn PagingOps) -> Result<()> {
        let gicd = paging
            .map_device(self.phys_gicd, GICD_SIZE)
            .ok_or(ErrorKind::IrqChip)?;
        let gicc = paging
            .map_device(self.phys_gicc, GICC_SIZE)
            .ok_or(ErrorKind::IrqChip)?;
        let gich = paging
            .map_device(self.phys_gich, GICH_SIZE)
            .ok_or(ErrorKind::IrqChip)?;

        *self.blocks.lock() = Some(Blocks { gicd, gicc, gich });

        let lr_count = (unsafe { &*(gich as *const GicHypervisorBlock) }.VTR.get() & GICH_VTR_LR_COUNT_MASK) as usize + 1;
        self.lr_count.store(lr_count, Ordering::Relaxed);

        let gicd = self.gicd();
        for r in gicd.ICENABLER.iter() {
            r.set(u32::MAX);
        }
        gicd.CTLR.set(GICD_CTLR_ENABLE);
        log::info!("gicv2: distributor at {gicd:p}, {lr_count} list registers");
        Ok(())
    }

    fn cpu_init(&self) {
        // Enable IPIs (SGIs 0..15) and the maintenance PPI at the
        // distributor (§4.7 "per-CPU reset"/`gic_cpu_init`).
        self.gicd().ISENABLER[0].set(0x0000_ffff | (1 << self.maintenance_irq));

        let gicc = self.gicc();
        gicc.PMR.set(0xff);
        gicc.CTLR.set(GICC_CTLR_ENABLE | GICC_CTLR_EOIMODE_NS);

        let vmcr = (0xffu32 << (GICH_VMCR_PMR_SHIFT - GICV_PMR_SHIFT)) | GICH_VMCR_EN0 | GICH_VMCR_EOIMODE;
        self.gich().VMCR.set(vmcr);

        for i in 0..self.lr_count.load(Ordering::Relaxed) {
            self.gich().LR[i].set(0);
        }
        self.gich().APR.set(0);
        self.enable_maint_irq(true);
    }

    fn cpu_reset(&self, _cpu: &PerCpu, is_shutdown: bool) {
        for i in 0..self.lr_count.load(Ordering::Relaxed) {
            self.gich().LR[i].set(0);
        }
        self.gich().APR.set(0);

        // Deactivate every active PPI (IDs 16..31, §4.7 "per-CPU reset"):
        // walk ISACTIVER's upper half and drop each set bit via the CPU
        // interface's DIR register (`gic_cpu_reset`, gic-v2.c:51-100).
        let active = self.gicd().ISACTIVER[0].get();
        for bit in 16..32 {
            if active & (1 << bit) != 0 {
                self.gicc().DIR.set(bit);
            }
        }

        // Re-enable IPIs + the maintenance PPI; disable every other PPI
        // unless this is the shutdown path, which leaves the guest's PPIs
        // enabled for the next owner of the CPU.
        self.gicd().ISENABLER[0].set(0x0000_ffff | (1 << self.maintenance_irq));
        self.gicd().ICENABLER[0].set(if is_shutdown {
            1 << self.maintenance_irq
        } else {
            0xffff_0000 & !(1 << self.maintenance_irq)
        });

        if is_shutdown {
            let gich = self.gich();
            gich.HCR.set(0);
            // Copy the live virtualised VMCR back out to the physical CPU
            // interface (gic-v2.c:84-98) instead of re-deriving it from a
            // stale snapshot.
            let vmcr = gich.VMCR.get();
            let gicc_pmr = (vmcr >> GICH_VMCR_PMR_SHIFT) << GICV_PMR_SHIFT;
            let mut gicc_ctlr = 0u32;
            if vmcr & GICH_VMCR_EN0 != 0 {
                gicc_ctlr |= GICC_CTLR_ENABLE;
            }
            if vmcr & GICH_VMCR_EOIMODE != 0 {
                gicc_ctlr |= GICC_CTLR_EOIMODE_NS;
            }
            let gicc = self.gicc();
            gicc.PMR.set(gicc_pmr);
            gicc.CTLR.set(gicc_ctlr);
        } else {
            self.cpu_init();
        }
    }

    fn cell_init(&self, cell: &Cell, mmio: &dyn MmioOps, paging: &dyn PagingOps) -> Result<()> {
        mmio.register_region(self.phys_gicd, GICD_SIZE, cell as *const Cell as usize)?;
        // Remap the cell's view of the CPU-interface page onto the physical
        // virtual-CPU interface (§4.7 "per-cell init", `gic_cell_init`'s
        // `paging_create(gicv_base, GICC_SIZE, gicc_base, ...)`); this crate's
        // 1:1 guest/host device-window addressing means the guest's view sits
        // at `phys_gicc` itself.
        paging.map_cell_device(
            self.phys_gicc as GuestPhysAddr,
            self.phys_gicv,
            GICC_SIZE,
            map_flags::READ | map_flags::WRITE | map_flags::DEVICE,
        )?;
        Ok(())
    }

    fn cell_exit(&self, _cell: &Cell) {}

    fn adjust_irq_target(&self, cell: &Cell, irq_id: u32) {
        if let Some(&first) = cell.cpu_set().first() {
            self.set_targets(irq_id, 1u8 << first);
        }
    }

    fn send_sgi(&self, sgi: &SgiDescriptor) -> core::result::Result<(), SgiError> {
        if sgi.id >= 16 {
            return Err(SgiError::InvalidId);
        }
        // SGIR layout: bits[25:24] target-list-filter, bits[23:16] target
        // CPU bitmap (v2's 8-bit model), bits[3:0] SGI INTID.
        let (filter, targets) = match sgi.routing {
            SgiRouting::ToSelf => (0b10u32, 0u32),
            SgiRouting::ToOthersInCell => (0b01u32, 0u32),
            SgiRouting::Targets => (0b00u32, sgi.targets as u32 & 0xff),
        };
        let val = (filter << 24) | (targets << 16) | sgi.id as u32;
        self.gicd().SGIR.set(val);
        Ok(())
    }

    fn handle_irq(&self, cpu: &PerCpu, irqn: u32) -> PhysIrqOutcome {
        if irqn == self.maintenance_irq {
            self.inject_pending(cpu);
            PhysIrqOutcome::HandledByHypervisor
        } else {
            match self.inject_irq(cpu, irqn, irqn < 16) {
                Ok(()) | Err(InjectError::Exists) => {}
                Err(InjectError::Busy) => self.set_pending(cpu, irqn),
            }
            PhysIrqOutcome::ForGuest
        }
    }

    fn inject_irq(&self, _cpu: &PerCpu, irq_id: u32, is_sgi: bool) -> core::result::Result<(), InjectError> {
        if self.lr_already_pending(irq_id) {
            return Err(InjectError::Exists);
        }
        let Some(lr_idx) = self.find_free_lr() else {
            return Err(InjectError::Busy);
        };
        let mut val = (irq_id as u64 & 0x3ff) | GICH_LR_PENDING;
        if is_sgi {
            val |= (irq_id as u64 & 0xf) << 10; // physical source CPU id, SGI only
        } else {
            // Physical ID copy (bits 19:10), per §4.7 "a copy of the physical
            // id"; this crate's 1:1 virtual/physical IRQ numbering (no guest
            // remapping) means the physical id is just `irq_id` again.
            val |= GICH_LR_HW | ((irq_id as u64 & 0x3ff) << 10);
        }
        self.gich().LR[lr_idx].set(val);
        Ok(())
    }

    fn enable_maint_irq(&self, enable: bool) {
        let gich = self.gich();
        let prev = gich.HCR.get();
        if enable {
            gich.HCR.set(prev | GICH_HCR_EN | GICH_HCR_LRENPIE);
        } else {
            gich.HCR.set(prev & !(GICH_HCR_EN | GICH_HCR_LRENPIE));
        }
    }

    fn eoi_irq(&self, irq_id: u32, deactivate: bool) {
        self.gicc().EOIR.set(irq_id);
        if deactivate {
            self.gicc().DIR.set(irq_id);
        }
    }
}

const _: () = assert!(size_of::<GicDistributorBlock>() <= GICD_SIZE);

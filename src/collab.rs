// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Shyper is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Traits for the collaborators this crate calls into but does not own.
//!
//! Stage-2 paging, the MMIO dispatch framework, the console and the raw SMC
//! gateway all live outside the arch-specific core. A concrete hypervisor
//! binary supplies one implementation of each and threads it through
//! [`crate::cell::Cell`] / [`crate::percpu::PerCpu`] construction, the same
//! way the board support layer supplies a single `PlatOperation` impl here.

use alloc::sync::Arc;

use spin::Once;

use crate::error::Result;

/// A guest-physical address, as seen from inside a cell's stage-2 map.
pub type GuestPhysAddr = usize;
/// A host-physical address.
pub type HostPhysAddr = usize;
/// A hypervisor-virtual address, valid only while mapped at EL2/Hyp.
pub type HypVirtAddr = usize;

/// Stage-2 mapping flags: device vs. normal memory, RO/RW. A plain bitmask
/// rather than a `bitflags!` type, matching the teacher's own register-flag
/// constants (see `arch::aarch64::gicv3` typer bit constants).
pub mod map_flags {
    pub const READ: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    pub const EXECUTE: u32 = 1 << 2;
    pub const DEVICE: u32 = 1 << 3;
}

/// Opaque handle to a cell's stage-2 address space. The concrete layout is
/// entirely owned by the paging collaborator; this crate only ever holds and
/// forwards the handle.
pub trait Stage2Space: Send + Sync {}

/// Stage-2 page-table construction, out of scope per the purpose/scope line
/// (`arm_paging_*`).
pub trait PagingOps: Send + Sync {
    /// Map `size` bytes of a physical device window into the hypervisor's
    /// own address space, returning the Hyp/EL2-virtual address, or `None`
    /// if the window cannot be mapped.
    fn map_device(&self, phys: HostPhysAddr, size: usize) -> Option<HypVirtAddr>;

    /// Build a brand-new stage-2 address space for a cell.
    fn create(&self) -> Result<()>;

    /// Map `size` bytes of `hpa` into the calling cell's stage-2 space at
    /// `gpa` with the given [`map_flags`] (§4.7 "per-cell init": remap the
    /// cell's view of the CPU-interface page to the physical virtual-CPU
    /// interface, mirroring `paging_create(&cell->arch.mm, gicv_base,
    /// GICC_SIZE, gicc_base, flags)`).
    fn map_cell_device(&self, gpa: GuestPhysAddr, hpa: HostPhysAddr, size: usize, flags: u32) -> Result<()>;

    /// Map or unmap a `(gpa, hpa, size)` region with the given flags in the
    /// named cell's stage-2 space. `destroy` tears the whole space down.
    fn destroy(&self) -> Result<()>;

    /// Install the calling CPU's view of its cell's stage-2 space (the
    /// per-vCPU half of the translation, e.g. `VTTBR_EL2`).
    fn vcpu_init(&self);

    /// Flush TLB entries for the calling CPU's current stage-2 space.
    fn flush_tlbs(&self);
}

/// A single trapped stage-2 data abort, decoded from `ESR_EL2`'s ISS field
/// into address/size/direction/value (§4.3 DABT). `value` carries the
/// store data in, and is overwritten with the load result out.
pub struct MmioAccess {
    pub address: GuestPhysAddr,
    pub size: u8,
    pub is_write: bool,
    pub value: u64,
}

/// Outcome of routing an [`MmioAccess`] to whatever device model claimed its
/// address range.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MmioOutcome {
    Handled,
    Unhandled,
}

/// The MMIO dispatch framework: routes guest accesses that fault on a
/// registered physical range to a handler instead of a straight stage-2
/// trap-and-panic.
pub trait MmioOps: Send + Sync {
    /// Register `size` bytes starting at `base` in the calling cell's MMIO
    /// map, directed to an opaque `ctx` the embedder correlates back to a
    /// device model. Used by the vGIC driver to claim the distributor
    /// region (§4.7 per-cell init).
    fn register_region(&self, base: HostPhysAddr, size: usize, ctx: usize) -> Result<()>;

    /// Route a decoded data abort to whichever region claims its address
    /// (§4.3 DABT: "guest-stage data abort → MMIO dispatch"). The actual
    /// routing table and device models live in the embedder, out of scope
    /// here; this crate only ever decodes the syndrome and hands off.
    fn handle_access(&self, access: &mut MmioAccess) -> MmioOutcome;
}

/// Console/printk, `panic_printk`, and the final "stop the world" primitive.
/// Kept as a trait rather than a crate-local sink because this core is a
/// library: the embedding hypervisor owns the UART/driver and installs the
/// `log` sink itself (§10.1).
pub trait ConsoleOps: Send + Sync {
    /// Ordinary diagnostic output, never on a fatal path.
    fn print(&self, s: &core::fmt::Arguments);

    /// Output on the way to a panic; must not allocate or take any lock that
    /// might already be held by the faulting context.
    fn panic_print(&self, s: &core::fmt::Arguments);

    /// Stop the calling CPU forever (WFI loop). Never returns.
    fn panic_stop(&self) -> !;
}

/// Raw four-argument secure-monitor call passthrough, used when an SMC's
/// function id does not belong to the emulated PSCI range (§4.3).
pub trait SmcGateway: Send + Sync {
    fn call(&self, a0: u64, a1: u64, a2: u64, a3: u64) -> [u64; 4];
}

static CONSOLE: Once<Arc<dyn ConsoleOps>> = Once::new();

/// Install the process-wide [`ConsoleOps`] sink. Must be called once during
/// embedder init, before the first guest trap or panic (§10.1).
pub fn install_console(console: Arc<dyn ConsoleOps>) {
    CONSOLE.call_once(|| console);
}

/// The installed console, if any. `None` before `install_console` runs (e.g.
/// a panic during early boot); callers must tolerate that.
pub fn console() -> Option<Arc<dyn ConsoleOps>> {
    CONSOLE.get().cloned()
}

// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Shyper is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Per-CPU control state machine (§3 "Per-CPU record", §4.5, §9 "Control FSM").
//!
//! Grounded on the Jailhouse ARM port's `control.c` (`check_events`,
//! `enter_cpu_off`, `cpu_reset`, `arm_cpu_park`, `arch_suspend_cpu` /
//! `arch_resume_cpu` / `arch_reset_cpu` / `arch_park_cpu`) for the exact
//! event-loop and ordering guarantees, and on the teacher's `kernel::cpu`
//! module (`Cpu`, `CPU_LIST`, `current_cpu()`) for the static
//! stable-address-array-of-records idiom and per-record `spin::Mutex`
//! placement.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, Once};

use crate::cell::Cell;
use crate::collab::PagingOps;
use crate::context::{GuestRegisters, RESET_PSR};
use crate::psci::PSCI_INVALID_ADDRESS;
use crate::vgic::{SgiDescriptor, PENDING_WORDS, SGI_EVENT};

/// Upper bound on the physical CPUs this core can track. The real bound is a
/// platform property (out of scope, §1); a fixed array keeps every record's
/// address stable for the process lifetime (§9 "global per-CPU table")
/// without requiring an allocator on this path.
pub const MAX_CPUS: usize = 8;

/// Explicit re-architecture of §4.5's nested loop (§9 design notes).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlState {
    Running,
    Suspended,
    Parking,
    Resetting,
    ShuttingDown,
}

/// The flag set and transition predicates, all behind the per-CPU lock
/// (§5: "no two per-CPU locks are ever held simultaneously").
pub struct PerCpuState {
    pub virt_id: usize,
    pub cell: Option<Arc<Cell>>,
    pub cpu_on_entry: u64,
    pub cpu_on_context: u64,
    pub park: bool,
    pub reset: bool,
    pub suspend_cpu: bool,
    pub cpu_suspended: bool,
    pub wait_for_poweron: bool,
    pub flush_vcpu_caches: bool,
    pub shutdown: bool,
}

impl PerCpuState {
    const fn new() -> Self {
        PerCpuState {
            virt_id: 0,
            cell: None,
            cpu_on_entry: PSCI_INVALID_ADDRESS,
            cpu_on_context: 0,
            park: false,
            reset: false,
            suspend_cpu: false,
            cpu_suspended: false,
            wait_for_poweron: true,
            flush_vcpu_caches: false,
            shutdown: false,
        }
    }
}

/// Exit counters, by category (§6 "per-CPU counter categories"). Plain
/// atomics: every increment happens on the owning CPU, but userspace reads
/// them from anywhere via the driver (out of scope here).
#[derive(Default)]
pub struct ExitStats {
    pub total: AtomicU64,
    pub management: AtomicU64,
    pub vsgi: AtomicU64,
    pub virq: AtomicU64,
    pub maintenance: AtomicU64,
    pub psci: AtomicU64,
}

/// The banked `ELR_hyp`/`SPSR_hyp` pair (§4.1): the guest resume PC and PSR,
/// maintained by hardware as banked registers rather than on-stack state.
/// The top-level exit path stages a live copy into/out of
/// [`crate::context::TrapContext`] around dispatch (§4.3 step 1 / step 5);
/// the control FSM (`park_self` / `cpu_reset`) writes it directly, the same
/// way `arm_cpu_park`/`cpu_reset` call `arm_write_banked_reg(ELR_hyp, ...)`
/// outside of any captured trap context.
#[derive(Copy, Clone, Debug, Default)]
pub struct HypBankedState {
    pub elr_hyp: u64,
    pub spsr_hyp: u32,
}

/// The stage-2 address space every parked CPU is switched into: a tiny
/// private page containing nothing but a WFI loop (§4.5, §9 glossary
/// "Parking map"). Process-wide and platform-supplied, installed once
/// before any cell is created.
static PARKING_SPACE: Once<Arc<dyn PagingOps>> = Once::new();

/// Install the parking stage-2 space. Must be called once during embedder
/// init, before the first `arch_cell_destroy`/`PSCI_CPU_OFF`.
pub fn install_parking_space(space: Arc<dyn PagingOps>) {
    PARKING_SPACE.call_once(|| space);
}

fn parking_space() -> Option<Arc<dyn PagingOps>> {
    PARKING_SPACE.get().cloned()
}

/// One per physical CPU, process-wide, initialised once (§3).
pub struct PerCpu {
    pub cpu_id: usize,
    pub control: Mutex<PerCpuState>,
    pub stats: ExitStats,
    /// Guest register save area. Only ever touched by the owning CPU on its
    /// own exit/entry path, so it lives behind an `UnsafeCell` rather than a
    /// lock — mirroring the teacher's raw `ctx: *mut ContextFrame` pointer
    /// into per-CPU state instead of a `Mutex`.
    regs: core::cell::UnsafeCell<GuestRegisters>,
    hyp: core::cell::UnsafeCell<HypBankedState>,
    /// Virtual IRQs that lost a list-register allocation race and are
    /// waiting for the maintenance IRQ or `SGI_INJECT` to retry them (§4.7
    /// "Maintenance IRQ"). A fixed bitmap rather than a queue, so no
    /// allocation is needed on the hot injection path; iterated only when
    /// actually retrying.
    pending: Mutex<[u32; PENDING_WORDS]>,
}

unsafe impl Sync for PerCpu {}

impl PerCpu {
    const fn new(cpu_id: usize) -> Self {
        PerCpu {
            cpu_id,
            control: Mutex::new(PerCpuState::new()),
            stats: ExitStats {
                total: AtomicU64::new(0),
                management: AtomicU64::new(0),
                vsgi: AtomicU64::new(0),
                virq: AtomicU64::new(0),
                maintenance: AtomicU64::new(0),
                psci: AtomicU64::new(0),
            },
            regs: core::cell::UnsafeCell::new(GuestRegisters::zeroed()),
            hyp: core::cell::UnsafeCell::new(HypBankedState { elr_hyp: 0, spsr_hyp: RESET_PSR }),
            pending: Mutex::new([0; PENDING_WORDS]),
        }
    }

    /// Mark `irq_id` pending for retry (§4.7 "Maintenance IRQ"). Out-of-range
    /// ids are logged and dropped rather than panicking: a guest-controlled
    /// IRQ number must never be able to corrupt hypervisor state.
    pub fn mark_pending(&self, irq_id: u32) {
        let (idx, bit) = (irq_id as usize / 32, irq_id as usize % 32);
        match self.pending.lock().get_mut(idx) {
            Some(word) => *word |= 1 << bit,
            None => log::error!("irq id {irq_id} out of range for the pending bitmap"),
        }
    }

    pub fn clear_pending(&self, irq_id: u32) {
        let (idx, bit) = (irq_id as usize / 32, irq_id as usize % 32);
        if let Some(word) = self.pending.lock().get_mut(idx) {
            *word &= !(1 << bit);
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().iter().any(|w| *w != 0)
    }

    /// Every currently-pending IRQ id, lowest first. Small and rare enough
    /// (bounded by the number of list registers, never the full 1024-bit
    /// bitmap) that collecting into a `Vec` beats re-entering the lock once
    /// per bit.
    pub fn pending_ids(&self) -> alloc::vec::Vec<u32> {
        let words = self.pending.lock();
        let mut out = alloc::vec::Vec::new();
        for (i, w) in words.iter().enumerate() {
            let mut bits = *w;
            while bits != 0 {
                let bit = bits.trailing_zeros();
                out.push(i as u32 * 32 + bit);
                bits &= bits - 1;
            }
        }
        out
    }

    /// # Safety
    /// Caller must be the CPU that owns this record, or must otherwise
    /// guarantee no concurrent access (e.g. the cell is parked).
    pub unsafe fn regs_mut(&self) -> &mut GuestRegisters {
        &mut *self.regs.get()
    }

    /// # Safety
    /// Same contract as [`PerCpu::regs_mut`]: owning CPU only, or the CPU is
    /// known parked.
    pub unsafe fn hyp_mut(&self) -> &mut HypBankedState {
        &mut *self.hyp.get()
    }

    pub fn cell(&self) -> Option<Arc<Cell>> {
        self.control.lock().cell.clone()
    }

    /// Kick this CPU with the event SGI (`SGI_EVENT`), causing it to re-enter
    /// `check_events` at its next opportunity (§4.5).
    pub fn kick(&self) {
        if let Some(cell) = self.control.lock().cell.clone() {
            let _ = cell.irqchip().send_sgi(&SgiDescriptor::to_cpu(SGI_EVENT, self.cpu_id));
        }
    }

    /// `arch_suspend_cpu` (§4.5): take the lock, set `suspend_cpu`; if the
    /// target is not already suspended, kick it and busy-wait for
    /// `cpu_suspended`. Issuing this twice without a resume is a no-op on
    /// the second call and must not deadlock.
    pub fn suspend(&self) {
        let already_suspended = {
            let mut st = self.control.lock();
            st.suspend_cpu = true;
            st.cpu_suspended
        };
        if !already_suspended {
            self.kick();
            while !self.control.lock().cpu_suspended {
                core::hint::spin_loop();
            }
        }
    }

    /// `arch_resume_cpu` (§4.5): clear `suspend_cpu` under the lock.
    pub fn resume(&self) {
        self.control.lock().suspend_cpu = false;
    }

    /// `arch_reset_cpu`: set `reset`, then resume (so a suspended target
    /// drops through the check; a running target re-enters on its next
    /// kick).
    pub fn request_reset(&self) {
        self.control.lock().reset = true;
        self.resume();
    }

    /// `arch_park_cpu`: set `park`, then resume.
    pub fn request_park(&self) {
        self.control.lock().park = true;
        self.resume();
    }

    /// `arch_shutdown_cpu` (§6): like [`PerCpu::request_park`], but marks the
    /// pending park as part of a hypervisor-wide shutdown, so `park_self`
    /// tells the irqchip to leave this CPU's cell's guest PPI configuration
    /// alone instead of masking it down to IPIs-only (§4.7 "per-CPU reset":
    /// "unless this is the root cell's shutdown path, which leaves guest
    /// PPIs enabled").
    pub fn request_shutdown(&self) {
        {
            let mut st = self.control.lock();
            st.park = true;
            st.shutdown = true;
        }
        self.resume();
    }

    fn enter_cpu_off(state: &mut PerCpuState) {
        state.park = false;
        state.wait_for_poweron = true;
    }

    /// `SGI_EVENT` handler: `check_events` (§4.5's pseudocode, verbatim).
    /// Returns the control-state transition this CPU must now carry out; the
    /// caller (the top-level exit path) performs the actual architectural
    /// work (`park_self` / `cpu_reset`) outside the lock.
    pub fn check_events(&self) -> ControlState {
        let mut do_reset = false;
        let mut outcome = ControlState::Running;

        loop {
            let mut st = self.control.lock();
            if st.suspend_cpu {
                st.cpu_suspended = true;
            }
            drop(st);

            while self.control.lock().suspend_cpu {
                core::hint::spin_loop();
            }

            let mut st = self.control.lock();
            if !st.suspend_cpu {
                st.cpu_suspended = false;

                if st.park {
                    Self::enter_cpu_off(&mut st);
                    outcome = ControlState::ShuttingDown;
                    break;
                }

                if st.reset {
                    st.reset = false;
                    if st.cpu_on_entry != PSCI_INVALID_ADDRESS {
                        st.wait_for_poweron = false;
                        do_reset = true;
                        outcome = ControlState::Resetting;
                    } else {
                        Self::enter_cpu_off(&mut st);
                        outcome = ControlState::ShuttingDown;
                    }
                    break;
                }
            }
            let keep_looping = st.suspend_cpu;
            drop(st);
            if !keep_looping {
                break;
            }
        }

        {
            let mut st = self.control.lock();
            if st.flush_vcpu_caches {
                st.flush_vcpu_caches = false;
                drop(st);
                if let Some(cell) = self.control.lock().cell.clone() {
                    cell.paging().flush_tlbs();
                }
            }
        }

        let wait_for_poweron = self.control.lock().wait_for_poweron;
        if wait_for_poweron {
            ControlState::Parking
        } else if do_reset {
            ControlState::Resetting
        } else {
            outcome
        }
    }

    /// `enter_cpu_off` + architectural reset + parking map install (§4.5).
    /// Performs the full wipe of every banked GPR, SPSR and relevant system
    /// register, then installs the parking stage-2 map and clears the guest
    /// PC (`ELR_hyp = 0`) so the CPU executes the WFI-loop parking code
    /// (§8 invariant: `wait_for_poweron ⇒ parking map installed ∧ ELR_hyp == 0`).
    pub fn park_self(&self) {
        let is_shutdown = {
            let mut st = self.control.lock();
            let is_shutdown = st.shutdown;
            st.shutdown = false;
            Self::enter_cpu_off(&mut st);
            is_shutdown
        };
        unsafe {
            self.regs_mut().reset();
            let hyp = self.hyp_mut();
            hyp.spsr_hyp = RESET_PSR;
            hyp.elr_hyp = 0;
        }
        if let Some(space) = parking_space() {
            space.vcpu_init();
        } else {
            log::warn!("cpu {} parked with no parking stage-2 space installed", self.cpu_id);
        }
        if let Some(cell) = self.control.lock().cell.clone() {
            cell.irqchip().cpu_reset(self, is_shutdown);
        }
        log::info!(
            "cpu {} parked{}",
            self.cpu_id,
            if is_shutdown { " (shutdown)" } else { "" }
        );
    }

    /// `cpu_reset()` (§4.5): wipe, then install `ELR_hyp = cpu_on_entry`,
    /// the owning cell's stage-2 map, forward the CPU_ON context word into
    /// `r1`/`x1`, reinstate `VMPIDR = virt_id | MP_BIT`, and reset the vGIC.
    pub fn cpu_reset(&self) {
        let (entry, ctx_word, virt_id) = {
            let st = self.control.lock();
            (st.cpu_on_entry, st.cpu_on_context, st.virt_id)
        };

        unsafe {
            let regs = self.regs_mut();
            regs.reset();
            regs.usr[1] = ctx_word as u32;
            let hyp = self.hyp_mut();
            hyp.spsr_hyp = RESET_PSR;
            hyp.elr_hyp = entry;
        }

        if let Some(cell) = self.control.lock().cell.clone() {
            cell.paging().vcpu_init();
            cell.irqchip().cpu_reset(self, false);
        }

        log::info!(
            "cpu {} reset, virt_id={virt_id}, entry={entry:#x}, vmpidr={:#x}",
            self.cpu_id,
            virt_id as u64 | crate::arch::MPIDR_MP_BIT
        );
    }
}

static CPU_LIST: [PerCpu; MAX_CPUS] = {
    // `PerCpu::new` is const, so this array literal gets distinct, stable
    // addresses for every slot without requiring `Copy`.
    const fn make(i: usize) -> PerCpu {
        PerCpu::new(i)
    }
    [
        make(0), make(1), make(2), make(3), make(4), make(5), make(6), make(7),
    ]
};

/// Look up the static record for physical CPU `id`.
pub fn cpu(id: usize) -> &'static PerCpu {
    &CPU_LIST[id]
}

pub fn cpu_count() -> usize {
    MAX_CPUS
}

/// `arch_shutdown_cpu` (§6 "exposed functions"): request that `cpu_id` park
/// itself as part of a hypervisor-wide shutdown, preserving its cell's
/// guest PPI configuration on the way down.
pub fn arch_shutdown_cpu(cpu_id: usize) {
    cpu(cpu_id).request_shutdown();
}

/// `arch_shutdown` (§6): shut down every tracked physical CPU.
pub fn arch_shutdown() {
    for i in 0..MAX_CPUS {
        arch_shutdown_cpu(i);
    }
}

#[cfg(target_arch = "aarch64")]
mod arch_current {
    use super::{cpu, PerCpu, CPU_LIST};
    use cortex_a::registers::TPIDR_EL2;
    use tock_registers::interfaces::{Readable, Writeable};

    /// Install `cpu_id`'s record pointer in `TPIDR_EL2`, mirroring the
    /// teacher's `set_current_cpu` / `current_cpu_arch` pair.
    pub fn init_current_cpu(cpu_id: usize) {
        TPIDR_EL2.set(&CPU_LIST[cpu_id] as *const PerCpu as u64);
    }

    pub fn current_cpu() -> &'static PerCpu {
        let ptr = TPIDR_EL2.get() as *const PerCpu;
        debug_assert!(!ptr.is_null(), "current_cpu() called before init_current_cpu()");
        unsafe { &*ptr }
    }

    #[allow(dead_code)]
    fn _unused(id: usize) -> &'static PerCpu {
        cpu(id)
    }
}

#[cfg(target_arch = "aarch64")]
pub use arch_current::{current_cpu, init_current_cpu};

/// On a 32-bit ARM host there is no `TPIDR_EL2`; the Hyp-mode analogue is a
/// software thread-id register banked per core. This crate does not
/// implement that path itself (§1 Non-goals do not cover host boot, and the
/// 32-bit entry trampoline is the out-of-scope collaborator that would set
/// it up) — callers on that target must thread the physical id through
/// explicitly.
#[cfg(not(target_arch = "aarch64"))]
pub fn current_cpu_by_id(cpu_id: usize) -> &'static PerCpu {
    cpu(cpu_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspend_twice_without_resume_does_not_deadlock() {
        let c = cpu(1);
        c.control.lock().suspend_cpu = false;
        c.control.lock().cpu_suspended = true; // pretend already suspended
        c.suspend();
        c.suspend();
        assert!(c.control.lock().suspend_cpu);
    }

    #[test]
    fn resume_clears_suspend_flag() {
        let c = cpu(2);
        c.control.lock().suspend_cpu = true;
        c.resume();
        assert!(!c.control.lock().suspend_cpu);
    }
}

// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Shyper is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Raw SMC calling convention, kept in its own leaf module the same way
//! the teacher isolates `smc.rs` from everything that calls it.

use crate::collab::SmcGateway;

/// Invoke a secure-monitor call with the ARM SMC32/SMC64 calling
/// convention: up to four argument registers in, four result registers
/// out. Grounded on the teacher's `arch::aarch64::smc::smc_call` (itself a
/// thin `smc #0` wrapper); extended to four result registers since the
/// collaborator contract (§6 "SMC gateway") returns all four.
///
/// # Safety
/// The caller is responsible for `x0` naming a function id this platform's
/// secure firmware actually implements, and for every argument being valid
/// for that function — the same precondition the teacher's own
/// `smc_call` carries.
#[inline(never)]
pub unsafe fn smc_call(x0: u64, x1: u64, x2: u64, x3: u64) -> [u64; 4] {
    let r0;
    let r1;
    let r2;
    let r3;
    core::arch::asm!(
        "smc #0",
        inout("x0") x0 => r0,
        inout("x1") x1 => r1,
        inout("x2") x2 => r2,
        inout("x3") x3 => r3,
        options(nomem, nostack),
    );
    [r0, r1, r2, r3]
}

/// The default [`SmcGateway`]: a raw passthrough to secure firmware via
/// `smc_call` (§6 "SMC gateway"). A platform with no secure firmware, or
/// one that wants to fake PSCI entirely, supplies its own implementation
/// instead of this one.
pub struct RawSmcGateway;

impl SmcGateway for RawSmcGateway {
    fn call(&self, a0: u64, a1: u64, a2: u64, a3: u64) -> [u64; 4] {
        unsafe { smc_call(a0, a1, a2, a3) }
    }
}

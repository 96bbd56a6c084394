// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Power State Coordination Interface 0.2 for a single vCPU, answered by the VMM.

use base::info;
use base::warn;
use hypervisor::PSCI_0_2;

pub const PSCI_VERSION: u32 = 0x8400_0000;
pub const PSCI_CPU_SUSPEND_32: u32 = 0x8400_0001;
pub const PSCI_CPU_SUSPEND_64: u32 = 0xc400_0001;
pub const PSCI_CPU_OFF: u32 = 0x8400_0002;
pub const PSCI_CPU_ON_32: u32 = 0x8400_0003;
pub const PSCI_CPU_ON_64: u32 = 0xc400_0003;
pub const PSCI_AFFINITY_INFO_32: u32 = 0x8400_0004;
pub const PSCI_AFFINITY_INFO_64: u32 = 0xc400_0004;
pub const PSCI_MIGRATE_INFO_TYPE: u32 = 0x8400_0006;
pub const PSCI_SYSTEM_OFF: u32 = 0x8400_0008;
pub const PSCI_SYSTEM_RESET: u32 = 0x8400_0009;
pub const PSCI_FEATURES: u32 = 0x8400_000a;

pub const PSCI_SUCCESS: i64 = 0;
pub const PSCI_NOT_SUPPORTED: i64 = -1;
pub const PSCI_INVALID_PARAMETERS: i64 = -2;

/// MIGRATE_INFO_TYPE answer: the trusted OS does not need migration.
const MIGRATE_NOT_REQUIRED: i64 = 2;
/// AFFINITY_INFO answer for the running CPU.
const AFFINITY_ON: i64 = 0;

// Mask out the 64-bit calling convention bit and the function number.
const PSCI_RANGE_MASK: u32 = 0xbfff_ffe0;
const PSCI_RANGE_BASE: u32 = 0x8400_0000;

/// A request of the guest to stop the whole machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PowerEvent {
    Off,
    Reset,
}

/// Result of a PSCI call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PsciResult {
    /// Value for x0; the guest continues.
    Return(i64),
    Power(PowerEvent),
}

/// Returns true if `function` is in the function ID range reserved for PSCI.
pub fn is_psci_function(function: u32) -> bool {
    function & PSCI_RANGE_MASK == PSCI_RANGE_BASE
}

fn supported(function: u32) -> bool {
    matches!(
        function,
        PSCI_VERSION
            | PSCI_AFFINITY_INFO_32
            | PSCI_AFFINITY_INFO_64
            | PSCI_MIGRATE_INFO_TYPE
            | PSCI_SYSTEM_OFF
            | PSCI_SYSTEM_RESET
            | PSCI_FEATURES
    )
}

/// Answers the PSCI call `function` with arguments x1 and x2.
pub fn handle_psci(function: u32, arg1: u64, _arg2: u64) -> PsciResult {
    match function {
        PSCI_VERSION => PsciResult::Return(PSCI_0_2.encoded().into()),
        PSCI_MIGRATE_INFO_TYPE => PsciResult::Return(MIGRATE_NOT_REQUIRED),
        PSCI_FEATURES => {
            let queried = arg1 as u32;
            PsciResult::Return(if supported(queried) {
                PSCI_SUCCESS
            } else {
                PSCI_NOT_SUPPORTED
            })
        }
        PSCI_AFFINITY_INFO_32 | PSCI_AFFINITY_INFO_64 => {
            // Only affinity 0 exists.
            PsciResult::Return(if arg1 & 0xff_00ff_ffff == 0 {
                AFFINITY_ON
            } else {
                PSCI_INVALID_PARAMETERS
            })
        }
        PSCI_SYSTEM_OFF => {
            info!("psci: guest requested power off");
            PsciResult::Power(PowerEvent::Off)
        }
        PSCI_SYSTEM_RESET => {
            info!("psci: guest requested reset");
            PsciResult::Power(PowerEvent::Reset)
        }
        PSCI_CPU_ON_32 | PSCI_CPU_ON_64 | PSCI_CPU_OFF | PSCI_CPU_SUSPEND_32
        | PSCI_CPU_SUSPEND_64 => PsciResult::Return(PSCI_NOT_SUPPORTED),
        _ => {
            warn!("psci: unsupported function {:#x}", function);
            PsciResult::Return(PSCI_NOT_SUPPORTED)
        }
    }
}

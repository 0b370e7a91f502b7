// Copyright 2023 The TandemOS Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The core-data page.
//!
//! Everything the boot driver needs to start a CPU driver on a fresh core,
//! written by the BSP into one page and handed to the kernel by physical
//! address.

use alloc::string::String;
use serde::{Deserialize, Serialize};

use tandem_os_common::CoreId;

/// Boot protocol magic for PSCI-started ARMv8 cores.
pub const BOOT_MAGIC_PSCI: u64 = 0xb001_b001_b001_b001;

pub const CMDLINE_MAX: usize = 128;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CoreData {
    pub boot_magic: u64,
    /// Kernel stack: top pointer and lower limit.
    pub cpu_driver_stack: u64,
    pub cpu_driver_stack_limit: u64,
    /// Relocated (high-half) entry point of the CPU driver.
    pub cpu_driver_entry: u64,
    pub cpu_driver_cmdline: String,
    /// Scratch memory owned by the new CPU driver.
    pub memory: MemoryRegion,
    pub urpc_frame: MemoryRegion,
    pub monitor_binary: MemoryRegion,
    /// Physical base of the kernel control block.
    pub kcb: u64,
    pub src_core_id: CoreId,
    pub dst_core_id: CoreId,
    pub src_arch_id: u32,
    pub dst_arch_id: u32,
}

impl CoreData {
    /// Serialises into the core-data frame.
    pub fn write_to(&self, frame: &mut [u8]) -> Result<(), tandem_os_common::error::ErrorCode> {
        postcard::to_slice(self, frame)
            .map(|_| ())
            .map_err(|_| tandem_os_common::error::ErrorCode::SerializeFailed)
    }

    pub fn read_from(frame: &[u8]) -> Result<Self, tandem_os_common::error::ErrorCode> {
        postcard::from_bytes(frame)
            .map_err(|_| tandem_os_common::error::ErrorCode::DeserializeFailed)
    }
}

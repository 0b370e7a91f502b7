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

//! Tandem OS second-core bring-up.
//!
//! Core 0 constructs the entire boot environment of core 1: a kernel
//! control block, relocated boot- and CPU-driver images, a kernel stack,
//! and the core-data page the boot driver reads, then asks the kernel to
//! start the core. Once the new init domain runs, the BSP hands over its
//! share of RAM, the bootinfo, the multiboot strings and the module
//! capabilities across the URPC frame.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod boot;
pub mod coredata;
pub mod elf;
pub mod handover;

use tandem_os_common::BASE_PAGE_SIZE;

/// High-half load offset of the CPU driver.
pub const ARMV8_KERNEL_OFFSET: u64 = 0xffff_0000_0000_0000;

/// Kernel control block object size and its required alignment.
pub const OBJSIZE_KCB: u64 = 64 * 1024;
pub const KCB_ALIGNMENT: u64 = 4 * BASE_PAGE_SIZE as u64;

pub const CORE_DATA_FRAME_SIZE: usize = BASE_PAGE_SIZE;
pub const STACK_FRAME_SIZE: usize = 16 * BASE_PAGE_SIZE;

/// Scratch pages the CPU driver needs beyond the monitor image.
pub const ARMV8_CORE_DATA_PAGES: usize = 1100;

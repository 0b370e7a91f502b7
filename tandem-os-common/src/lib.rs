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

//! Tandem OS shared support: the capability-space model, the monitor
//! invocation interface, wire error codes, and small utilities every
//! init-domain subsystem needs.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bootinfo;
pub mod capspace;
pub mod deferred;
pub mod error;
pub mod logger;
pub mod monitor;
pub mod slot_allocator;

/// Number of cooperating cores. The cross-core protocols are written for
/// exactly two init domains; the peer of core `c` is `1 - c`.
pub const NUM_CORES: usize = 2;
static_assertions::const_assert_eq!(NUM_CORES, 2);

/// Base page size of the target (aarch64, 4 KiB granule).
pub const BASE_PAGE_SIZE: usize = 4096;

pub type CoreId = u8;

/// Returns the id of the other core.
pub fn peer_core(core: CoreId) -> CoreId { 1 - core }

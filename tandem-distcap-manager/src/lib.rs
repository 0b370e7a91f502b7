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

//! Tandem OS distributed capability engine.
//!
//! Keeps the two per-core capability databases consistent under copy,
//! delete, revoke and retype. Operations that touch the peer core run as
//! cap-locked transactions: lock, sync over the cross-core channel, commit
//! locally, unlock. Contenders suspend on the caplock queue; staged
//! cleanups drain through the delete queue.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod caplock;
pub mod deletestep;
pub mod engine;
pub mod transfer;

macro_rules! debug_capops {
    ($($arg:tt)*) => {{
        #[cfg(feature = "TRACE_CAPOPS")]
        log::trace!($($arg)*);
    }};
}
pub(crate) use debug_capops;

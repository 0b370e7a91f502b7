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

//! The Tandem OS init domain.
//!
//! One instance runs per core: it owns the local capability space, brokers
//! physical memory, spawns and manages processes, and speaks the
//! distributed capability protocol with its peer. Everything is driven by
//! a cooperative event loop; handlers that cannot answer immediately park
//! a typed suspend record and resume when their prerequisite completes.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bringup;
pub mod console;
pub mod dispatch;
pub mod domain;
pub mod network;
pub mod spawn;
pub mod wire;

pub use domain::InitDomain;

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

//! The monitor invocation interface.
//!
//! These are the privileged kernel primitives the init domain is entrusted
//! with. The distributed capability engine layers its two-core transactions
//! on top of them; nothing above this trait talks to the kernel directly.
//! Implementations: the real syscall bindings on hardware, an in-memory
//! two-core fake for tests.

use crate::capspace::{CapAddr, CapDescriptor, CapRef, DomCapRef, ObjType, Relations};
use crate::error::ErrorCode;
use crate::CoreId;

/// Errors surfaced by monitor invocations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CapError {
    NotFound,
    /// The capability is locked by an in-flight distributed operation.
    Locked,
    /// The operation needs a distributed round through the init domains.
    RetryThroughMonitor,
    NotRetypeable,
    SlotInUse,
    InvalidArgs,
    LastNonMoveable,
    Unknown,
}

impl From<CapError> for ErrorCode {
    fn from(err: CapError) -> ErrorCode {
        match err {
            CapError::NotFound => ErrorCode::NotFound,
            CapError::Locked => ErrorCode::CapLocked,
            CapError::RetryThroughMonitor => ErrorCode::RetryThroughMonitor,
            CapError::NotRetypeable => ErrorCode::NotRetypeable,
            CapError::SlotInUse | CapError::InvalidArgs => ErrorCode::InvalidArgs,
            CapError::LastNonMoveable => ErrorCode::InvalidArgs,
            CapError::Unknown => ErrorCode::Unknown,
        }
    }
}

/// Outcome of `delete_last`: deleting the final copy of a RAM-backed object
/// turns the memory back into a RAM capability placed in the caller's
/// temporary slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeleteLast {
    Done,
    RamCapCreated,
}

pub trait MonitorInterface {
    /// The core this interface invokes on.
    fn core_id(&self) -> CoreId;

    /// Reads a capability's identity. Empty slots yield `CapDescriptor::NULL`.
    fn cap_identify(&mut self, cap: DomCapRef) -> Result<CapDescriptor, CapError>;

    /// Local relations of `cap`, masked.
    fn cap_has_relations(&mut self, cap: DomCapRef, mask: Relations)
        -> Result<Relations, CapError>;

    /// Read-modify-write of the remote-relations word; returns the previous
    /// value. `mask` selects which bits `set` replaces; an empty mask reads.
    fn remote_relations(
        &mut self,
        cap: DomCapRef,
        set: Relations,
        mask: Relations,
    ) -> Result<Relations, CapError>;

    fn get_cap_owner(&mut self, cap: DomCapRef) -> Result<CoreId, CapError>;
    fn set_cap_owner(&mut self, cap: DomCapRef, owner: CoreId) -> Result<(), CapError>;

    /// Materialises a capability from identity bytes with the given owner.
    fn cap_create(
        &mut self,
        dest: CapRef,
        desc: &CapDescriptor,
        owner: CoreId,
    ) -> Result<(), CapError>;

    /// Clears a slot without distributed bookkeeping.
    fn nullify_cap(&mut self, cap: DomCapRef) -> Result<(), CapError>;

    /// Deletes every local copy of a foreign-owned capability.
    fn delete_foreigns(&mut self, cap: CapRef) -> Result<(), CapError>;

    /// Deletes the last local copy. RAM-backed objects are reclaimed into
    /// `ram_dest`.
    fn delete_last(&mut self, cap: DomCapRef, ram_dest: CapRef) -> Result<DeleteLast, CapError>;

    /// Begins revocation of the target capability itself.
    fn revoke_mark_target(&mut self, cap: DomCapRef) -> Result<(), CapError>;

    /// Begins revocation of everything related to the given identity.
    fn revoke_mark_relations(&mut self, desc: &CapDescriptor) -> Result<(), CapError>;

    /// Per-capability mutual exclusion. Fails with `CapError::Locked` when
    /// already held.
    fn lock_cap(&mut self, cap: DomCapRef) -> Result<(), CapError>;
    fn unlock_cap(&mut self, cap: DomCapRef) -> Result<(), CapError>;

    /// Checks a prospective retype of `desc` against local descendants.
    fn is_retypeable(
        &mut self,
        desc: &CapDescriptor,
        offset: u64,
        objsize: u64,
        count: usize,
    ) -> Result<(), CapError>;

    /// Local retype. Fails with `RetryThroughMonitor` when the source has
    /// remote relations that demand cross-core consensus first.
    fn retype(
        &mut self,
        dest: DomCapRef,
        src: DomCapRef,
        offset: u64,
        new_type: ObjType,
        objsize: u64,
        count: usize,
    ) -> Result<(), CapError>;

    /// Retype of a source that passed cross-core consensus; dest slots are
    /// `dest.slot .. dest.slot + count`.
    fn retype_remote_cap(
        &mut self,
        dest: DomCapRef,
        src: DomCapRef,
        offset: u64,
        new_type: ObjType,
        objsize: u64,
        count: usize,
    ) -> Result<(), CapError>;

    /// Asks the kernel to start a core: boot driver entry point and the
    /// physical address of its core-data page.
    fn spawn_core(
        &mut self,
        mpid: CapAddr,
        boot_entry: u64,
        core_data: u64,
    ) -> Result<(), CapError>;
}

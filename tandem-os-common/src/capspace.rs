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

//! Capability-space addressing and capability identities.
//!
//! A capability lives in a two-level CSpace: an L1 CNode of L2 CNodes of
//! slots. User space names a capability by `(cnode, slot)` within its own
//! CSpace; distributed operations qualify that with the owning CSpace root
//! (a `DomCapRef`) so one init domain can act on another domain's slots.

use core::fmt;
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};

use crate::CoreId;

pub type CapAddr = u32;

/// Slots per L2 CNode.
pub const L2_CNODE_SLOTS: usize = 256;

// Well-known L2 CNodes in an init domain's CSpace, fixed at boot.
pub const CNODE_TASK: CapAddr = 1;
pub const CNODE_MODULE: CapAddr = 2;
pub const CNODE_SLOT_ALLOC: CapAddr = 3;

// Well-known slots in CNODE_TASK.
pub const SLOT_DISPATCHER: CapAddr = 1;
pub const SLOT_SELFEP: CapAddr = 2;
pub const SLOT_URPC: CapAddr = 3;
pub const SLOT_MMSTRINGS: CapAddr = 4;
pub const SLOT_BOOTINFO: CapAddr = 5;

/// A capability address within the local CSpace.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CapRef {
    pub cnode: CapAddr,
    pub slot: CapAddr,
}

pub const NULL_CAP: CapRef = CapRef { cnode: 0, slot: 0 };

impl CapRef {
    pub const fn new(cnode: CapAddr, slot: CapAddr) -> Self { CapRef { cnode, slot } }

    pub fn is_null(&self) -> bool { *self == NULL_CAP }

    /// Qualifies this cap-ref with a CSpace root, yielding the currency of
    /// all distributed operations.
    pub fn with_root(self, croot: CapAddr) -> DomCapRef {
        DomCapRef {
            croot,
            cnode: self.cnode,
            slot: self.slot,
        }
    }
}

impl fmt::Display for CapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cnode, self.slot)
    }
}

/// CSpace root used by the init domain for its own slots.
pub const SELF_CROOT: CapAddr = 0;

/// A capability address qualified by its owning CSpace root.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DomCapRef {
    pub croot: CapAddr,
    pub cnode: CapAddr,
    pub slot: CapAddr,
}

impl DomCapRef {
    pub fn cap(&self) -> CapRef { CapRef::new(self.cnode, self.slot) }
}

impl From<CapRef> for DomCapRef {
    fn from(cap: CapRef) -> Self { cap.with_root(SELF_CROOT) }
}

impl fmt::Display for DomCapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.croot, self.cnode, self.slot)
    }
}

/// Relations a capability has to capabilities elsewhere: copies, ancestors
/// and descendants. Stored per-core; the remote variant records what the
/// peer core holds.
#[derive(Copy, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Relations(u8);

impl Relations {
    pub const EMPTY: Relations = Relations(0);
    pub const COPY: Relations = Relations(1 << 0);
    pub const ANCS: Relations = Relations(1 << 1);
    pub const DESC: Relations = Relations(1 << 2);
    pub const ALL: Relations = Relations(0b111);

    pub const fn bits(self) -> u8 { self.0 }
    pub const fn from_bits(bits: u8) -> Self { Relations(bits & Self::ALL.0) }

    pub fn contains(self, other: Relations) -> bool { self.0 & other.0 == other.0 }
    pub fn intersects(self, other: Relations) -> bool { self.0 & other.0 != 0 }
    pub fn is_empty(self) -> bool { self.0 == 0 }

    /// Read-modify-write helper: bits in `mask` are replaced by the
    /// corresponding bits of `set`.
    pub fn apply(self, set: Relations, mask: Relations) -> Relations {
        Relations((self.0 & !mask.0) | (set.0 & mask.0))
    }
}

impl core::ops::BitOr for Relations {
    type Output = Relations;
    fn bitor(self, rhs: Relations) -> Relations { Relations(self.0 | rhs.0) }
}

impl fmt::Debug for Relations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}{}{}]",
            if self.contains(Relations::COPY) { "C" } else { "-" },
            if self.contains(Relations::ANCS) { "A" } else { "-" },
            if self.contains(Relations::DESC) { "D" } else { "-" },
        )
    }
}

/// Kernel object types distinguished by the init domain.
#[repr(u8)]
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive, Serialize,
    Deserialize,
)]
pub enum ObjType {
    #[default]
    Null = 0,
    Ram,
    Frame,
    DeviceFrame,
    CNode,
    EndPoint,
    Dispatcher,
    KernelControlBlock,
}

impl ObjType {
    /// Whether ownership of this type may migrate between cores. EndPoints
    /// and Dispatchers are pinned to the core that created them.
    pub fn is_moveable(self) -> bool {
        matches!(
            self,
            ObjType::Ram
                | ObjType::Frame
                | ObjType::DeviceFrame
                | ObjType::CNode
                | ObjType::KernelControlBlock
        )
    }
}

/// The identity of a capability as read out of the kernel: enough to
/// recreate an equal capability on the other core.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CapDescriptor {
    pub type_: ObjType,
    pub base: u64,
    pub bytes: u64,
}

impl CapDescriptor {
    pub const NULL: CapDescriptor = CapDescriptor {
        type_: ObjType::Null,
        base: 0,
        bytes: 0,
    };

    pub const fn new(type_: ObjType, base: u64, bytes: u64) -> Self {
        CapDescriptor { type_, base, bytes }
    }

    pub fn ram(base: u64, bytes: u64) -> Self { CapDescriptor::new(ObjType::Ram, base, bytes) }
    pub fn frame(base: u64, bytes: u64) -> Self { CapDescriptor::new(ObjType::Frame, base, bytes) }

    pub fn is_null(&self) -> bool { self.type_ == ObjType::Null }
}

/// Identifies the core that spawned a capability's kernel object. Ownership
/// decisions (delete-last, retype) are arbitrated by this core alone.
pub type OwnerCore = CoreId;

/// A capability serialised for transmission over a shared-memory channel,
/// where kernel-mediated cap transfer is unavailable. Invalid transfers
/// model `NULL_CAP` and must round-trip faithfully.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CapTransfer {
    pub valid: bool,
    pub desc: CapDescriptor,
    pub owner: OwnerCore,
    pub relations: Relations,
}

impl CapTransfer {
    pub const INVALID: CapTransfer = CapTransfer {
        valid: false,
        desc: CapDescriptor::NULL,
        owner: 0,
        relations: Relations::EMPTY,
    };

    pub fn is_valid(&self) -> bool { self.valid }
}

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

//! Allocator for dynamically-managed CSpace slots.
//!
//! The init domain owns a CNode reserved for scratch slots (received caps,
//! reconstruction temporaries, allocator results). Allocation state is a
//! bitmap; runs of contiguous slots can be allocated for multi-object
//! retypes.

use bitvec::prelude::*;

use crate::capspace::{CapAddr, CapRef, CNODE_SLOT_ALLOC, L2_CNODE_SLOTS};

pub struct CSpaceSlotAllocator {
    cnode: CapAddr,
    used: BitVec,
}

impl Default for CSpaceSlotAllocator {
    fn default() -> Self { Self::new(CNODE_SLOT_ALLOC, L2_CNODE_SLOTS) }
}

impl CSpaceSlotAllocator {
    pub fn new(cnode: CapAddr, slots: usize) -> Self {
        CSpaceSlotAllocator {
            cnode,
            used: bitvec![0; slots],
        }
    }

    /// Allocates `count` contiguous slots, returning the first.
    pub fn alloc(&mut self, count: usize) -> Option<CapRef> {
        if count == 0 || count > self.used.len() {
            return None;
        }
        let mut run = 0;
        for i in 0..self.used.len() {
            if self.used[i] {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                let first = i + 1 - count;
                self.used[first..=i].fill(true);
                #[cfg(feature = "TRACE_OPS")]
                log::trace!("slot alloc [{}, {}) in cnode {}", first, first + count, self.cnode);
                return Some(CapRef::new(self.cnode, first as CapAddr));
            }
        }
        None
    }

    /// Returns `count` slots starting at `cap` to the free pool.
    pub fn free(&mut self, cap: CapRef, count: usize) {
        debug_assert_eq!(cap.cnode, self.cnode);
        let first = cap.slot as usize;
        assert!(first + count <= self.used.len());
        for i in first..first + count {
            debug_assert!(self.used[i], "double free of slot {}", i);
            self.used.set(i, false);
        }
    }

    pub fn used_slots(&self) -> usize { self.used.count_ones() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free() {
        let mut slots = CSpaceSlotAllocator::new(CNODE_SLOT_ALLOC, 8);
        let a = slots.alloc(1).unwrap();
        let b = slots.alloc(1).unwrap();
        assert_ne!(a, b);
        assert_eq!(slots.used_slots(), 2);
        slots.free(a, 1);
        assert_eq!(slots.used_slots(), 1);
        // Freed slot is reusable.
        let c = slots.alloc(1).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_alloc_run() {
        let mut slots = CSpaceSlotAllocator::new(CNODE_SLOT_ALLOC, 8);
        let _one = slots.alloc(1).unwrap();
        let run = slots.alloc(4).unwrap();
        // Run is contiguous starting after the single allocation.
        assert_eq!(run.slot, 1);
        assert_eq!(slots.used_slots(), 5);
        assert!(slots.alloc(4).is_none());
        slots.free(run, 4);
        assert!(slots.alloc(4).is_some());
    }

    #[test]
    fn test_exhaustion() {
        let mut slots = CSpaceSlotAllocator::new(CNODE_SLOT_ALLOC, 2);
        assert!(slots.alloc(3).is_none());
        slots.alloc(2).unwrap();
        assert!(slots.alloc(1).is_none());
    }
}

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

//! In-memory monitor fake.
//!
//! Models just enough of the kernel's capability database for two cores to
//! exercise the distributed protocols: per-core CSpace slots, a single
//! object table keyed by identity, owners, per-core remote-relations words,
//! cap locks, and retype range tracking. One `FakeKernel` is shared by both
//! cores' `FakeMonitor` views, the way one machine's kernels share memory.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::{HashMap, HashSet};
use spin::Mutex;

use tandem_os_common::capspace::{
    CapAddr, CapDescriptor, CapRef, DomCapRef, ObjType, Relations,
};
use tandem_os_common::monitor::{CapError, DeleteLast, MonitorInterface};
use tandem_os_common::{CoreId, NUM_CORES};

type SlotKey = (CoreId, CapAddr, CapAddr, CapAddr);

fn slot_key(core: CoreId, cap: DomCapRef) -> SlotKey { (core, cap.croot, cap.cnode, cap.slot) }

#[derive(Debug, Default)]
struct ObjectMeta {
    owner: CoreId,
    /// Remote-relations word of each core.
    rels: [Relations; NUM_CORES],
    /// Committed retype ranges: (offset, bytes) within the object.
    retyped: Vec<(u64, u64)>,
}

#[derive(Default)]
struct KernelState {
    slots: HashMap<SlotKey, CapDescriptor>,
    objects: HashMap<CapDescriptor, ObjectMeta>,
    /// Held cap locks, per (core, identity); a lock dies with the last
    /// local copy on its core.
    locked: HashSet<(CoreId, CapDescriptor)>,
    /// spawn_core invocations, for boot assertions.
    spawned: Vec<(CapAddr, u64, u64)>,
}

impl KernelState {
    fn desc_at(&self, core: CoreId, cap: DomCapRef) -> Option<CapDescriptor> {
        self.slots.get(&slot_key(core, cap)).copied()
    }

    fn local_copies(&self, core: CoreId, desc: &CapDescriptor) -> usize {
        self.slots
            .iter()
            .filter(|((c, ..), d)| *c == core && *d == desc)
            .count()
    }

    fn contains(outer: &CapDescriptor, inner: &CapDescriptor) -> bool {
        inner.base >= outer.base
            && inner.base + inner.bytes <= outer.base + outer.bytes
            && !(inner.base == outer.base && inner.bytes == outer.bytes)
    }

    fn local_relations(&self, core: CoreId, desc: &CapDescriptor) -> Relations {
        let mut rels = Relations::EMPTY;
        if self.local_copies(core, desc) > 1 {
            rels = rels | Relations::COPY;
        }
        for ((c, ..), other) in self.slots.iter() {
            if *c != core || other == desc {
                continue;
            }
            if Self::contains(other, desc) {
                rels = rels | Relations::ANCS;
            }
            if Self::contains(desc, other) {
                rels = rels | Relations::DESC;
            }
        }
        if self
            .objects
            .get(desc)
            .map(|m| !m.retyped.is_empty())
            .unwrap_or(false)
        {
            rels = rels | Relations::DESC;
        }
        rels
    }

    fn meta_mut(&mut self, desc: &CapDescriptor) -> Result<&mut ObjectMeta, CapError> {
        self.objects.get_mut(desc).ok_or(CapError::NotFound)
    }

    /// Drops per-core cap state that dies with the last local copy.
    fn gc_core_state(&mut self, core: CoreId, desc: &CapDescriptor) {
        if self.local_copies(core, desc) == 0 {
            self.locked.remove(&(core, *desc));
        }
    }

    /// Drops the object once no slot anywhere refers to it.
    fn gc_object(&mut self, desc: &CapDescriptor) {
        if self.slots.values().all(|d| d != desc) {
            self.objects.remove(desc);
            for core in 0..NUM_CORES {
                self.locked.remove(&(core as CoreId, *desc));
            }
        }
    }

    fn remove_slot(&mut self, key: SlotKey) -> Option<CapDescriptor> {
        let desc = self.slots.remove(&key)?;
        self.gc_core_state(key.0, &desc);
        Some(desc)
    }

    fn range_conflicts(&self, desc: &CapDescriptor, offset: u64, bytes: u64) -> bool {
        let (lo, hi) = (desc.base + offset, desc.base + offset + bytes);
        if let Some(meta) = self.objects.get(desc) {
            for &(roff, rbytes) in &meta.retyped {
                let (rlo, rhi) = (desc.base + roff, desc.base + roff + rbytes);
                if lo < rhi && rlo < hi {
                    return true;
                }
            }
        }
        // Existing live objects inside the window also conflict.
        self.objects.keys().any(|other| {
            other != desc && other.base >= lo && other.base + other.bytes <= hi
        })
    }

    /// Removes every slot on `core` holding `desc` or a descendant of it.
    fn delete_relations_on(&mut self, core: CoreId, desc: &CapDescriptor, keep: Option<SlotKey>) {
        let victims: Vec<SlotKey> = self
            .slots
            .iter()
            .filter(|(k, d)| k.0 == core && (**d == *desc || Self::contains(desc, d)))
            .map(|(k, _)| *k)
            .filter(|k| Some(*k) != keep)
            .collect();
        for key in victims {
            if let Some(gone) = self.remove_slot(key) {
                self.gc_object(&gone);
            }
        }
    }
}

/// The shared kernel; hand out one `FakeMonitor` per core.
#[derive(Clone, Default)]
pub struct FakeKernel {
    state: Arc<Mutex<KernelState>>,
}

impl FakeKernel {
    pub fn new() -> Self { Self::default() }

    pub fn monitor(&self, core: CoreId) -> FakeMonitor {
        FakeMonitor {
            state: self.state.clone(),
            core,
        }
    }

    /// Seeds a slot with a fresh object owned by `owner`.
    pub fn install(&self, core: CoreId, cap: CapRef, desc: CapDescriptor, owner: CoreId) {
        let mut st = self.state.lock();
        st.slots.insert(slot_key(core, cap.into()), desc);
        st.objects.entry(desc).or_insert_with(|| ObjectMeta {
            owner,
            ..Default::default()
        });
    }

    /// Identity currently held in a slot, if any.
    pub fn slot(&self, core: CoreId, cap: CapRef) -> Option<CapDescriptor> {
        self.state.lock().desc_at(core, cap.into())
    }

    pub fn owner_of(&self, desc: &CapDescriptor) -> Option<CoreId> {
        self.state.lock().objects.get(desc).map(|m| m.owner)
    }

    pub fn remote_relations_of(&self, core: CoreId, desc: &CapDescriptor) -> Option<Relations> {
        self.state
            .lock()
            .objects
            .get(desc)
            .map(|m| m.rels[core as usize])
    }

    pub fn copies_on(&self, core: CoreId, desc: &CapDescriptor) -> usize {
        self.state.lock().local_copies(core, desc)
    }

    pub fn object_exists(&self, desc: &CapDescriptor) -> bool {
        self.state.lock().objects.contains_key(desc)
    }

    pub fn spawned_cores(&self) -> Vec<(CapAddr, u64, u64)> { self.state.lock().spawned.clone() }
}

pub struct FakeMonitor {
    state: Arc<Mutex<KernelState>>,
    core: CoreId,
}

impl MonitorInterface for FakeMonitor {
    fn core_id(&self) -> CoreId { self.core }

    fn cap_identify(&mut self, cap: DomCapRef) -> Result<CapDescriptor, CapError> {
        Ok(self
            .state
            .lock()
            .desc_at(self.core, cap)
            .unwrap_or(CapDescriptor::NULL))
    }

    fn cap_has_relations(
        &mut self,
        cap: DomCapRef,
        mask: Relations,
    ) -> Result<Relations, CapError> {
        let st = self.state.lock();
        let desc = st.desc_at(self.core, cap).ok_or(CapError::NotFound)?;
        let rels = st.local_relations(self.core, &desc);
        Ok(Relations::from_bits(rels.bits() & mask.bits()))
    }

    fn remote_relations(
        &mut self,
        cap: DomCapRef,
        set: Relations,
        mask: Relations,
    ) -> Result<Relations, CapError> {
        let mut st = self.state.lock();
        let desc = st.desc_at(self.core, cap).ok_or(CapError::NotFound)?;
        let core = self.core as usize;
        let meta = st.meta_mut(&desc)?;
        let prev = meta.rels[core];
        meta.rels[core] = prev.apply(set, mask);
        Ok(prev)
    }

    fn get_cap_owner(&mut self, cap: DomCapRef) -> Result<CoreId, CapError> {
        let st = self.state.lock();
        let desc = st.desc_at(self.core, cap).ok_or(CapError::NotFound)?;
        st.objects
            .get(&desc)
            .map(|m| m.owner)
            .ok_or(CapError::NotFound)
    }

    fn set_cap_owner(&mut self, cap: DomCapRef, owner: CoreId) -> Result<(), CapError> {
        let mut st = self.state.lock();
        let desc = st.desc_at(self.core, cap).ok_or(CapError::NotFound)?;
        st.meta_mut(&desc)?.owner = owner;
        Ok(())
    }

    fn cap_create(
        &mut self,
        dest: CapRef,
        desc: &CapDescriptor,
        owner: CoreId,
    ) -> Result<(), CapError> {
        if desc.is_null() {
            return Err(CapError::InvalidArgs);
        }
        let mut st = self.state.lock();
        let key = slot_key(self.core, dest.into());
        if st.slots.contains_key(&key) {
            return Err(CapError::SlotInUse);
        }
        st.slots.insert(key, *desc);
        st.objects.entry(*desc).or_insert_with(|| ObjectMeta {
            owner,
            ..Default::default()
        });
        Ok(())
    }

    fn nullify_cap(&mut self, cap: DomCapRef) -> Result<(), CapError> {
        let mut st = self.state.lock();
        let desc = st
            .remove_slot(slot_key(self.core, cap))
            .ok_or(CapError::NotFound)?;
        st.gc_object(&desc);
        Ok(())
    }

    fn delete_foreigns(&mut self, cap: CapRef) -> Result<(), CapError> {
        let mut st = self.state.lock();
        let desc = st.desc_at(self.core, cap.into()).ok_or(CapError::NotFound)?;
        let owner = st.objects.get(&desc).ok_or(CapError::NotFound)?.owner;
        if owner == self.core {
            return Err(CapError::InvalidArgs);
        }
        let victims: Vec<SlotKey> = st
            .slots
            .iter()
            .filter(|((c, ..), d)| *c == self.core && **d == desc)
            .map(|(k, _)| *k)
            .collect();
        for key in victims {
            st.remove_slot(key);
        }
        st.gc_object(&desc);
        Ok(())
    }

    fn delete_last(&mut self, cap: DomCapRef, ram_dest: CapRef) -> Result<DeleteLast, CapError> {
        let mut st = self.state.lock();
        let desc = st
            .remove_slot(slot_key(self.core, cap))
            .ok_or(CapError::NotFound)?;
        let gone_everywhere = st.slots.values().all(|d| *d != desc);
        if !gone_everywhere {
            st.gc_object(&desc);
            return Ok(DeleteLast::Done);
        }
        st.gc_object(&desc);
        match desc.type_ {
            ObjType::Ram | ObjType::Frame => {
                let ram = CapDescriptor::ram(desc.base, desc.bytes);
                let key = slot_key(self.core, ram_dest.into());
                if st.slots.contains_key(&key) {
                    return Err(CapError::SlotInUse);
                }
                st.slots.insert(key, ram);
                st.objects.entry(ram).or_insert_with(|| ObjectMeta {
                    owner: self.core,
                    ..Default::default()
                });
                Ok(DeleteLast::RamCapCreated)
            }
            _ => Ok(DeleteLast::Done),
        }
    }

    fn revoke_mark_target(&mut self, cap: DomCapRef) -> Result<(), CapError> {
        let mut st = self.state.lock();
        let key = slot_key(self.core, cap);
        let desc = st.desc_at(self.core, cap).ok_or(CapError::NotFound)?;
        st.delete_relations_on(self.core, &desc, Some(key));
        if let Some(meta) = st.objects.get_mut(&desc) {
            meta.retyped.clear();
        }
        Ok(())
    }

    fn revoke_mark_relations(&mut self, desc: &CapDescriptor) -> Result<(), CapError> {
        let mut st = self.state.lock();
        st.delete_relations_on(self.core, desc, None);
        Ok(())
    }

    fn lock_cap(&mut self, cap: DomCapRef) -> Result<(), CapError> {
        let mut st = self.state.lock();
        let desc = st.desc_at(self.core, cap).ok_or(CapError::NotFound)?;
        if !st.locked.insert((self.core, desc)) {
            return Err(CapError::Locked);
        }
        Ok(())
    }

    fn unlock_cap(&mut self, cap: DomCapRef) -> Result<(), CapError> {
        let mut st = self.state.lock();
        let desc = st.desc_at(self.core, cap).ok_or(CapError::NotFound)?;
        if !st.locked.remove(&(self.core, desc)) {
            return Err(CapError::InvalidArgs);
        }
        Ok(())
    }

    fn is_retypeable(
        &mut self,
        desc: &CapDescriptor,
        offset: u64,
        objsize: u64,
        count: usize,
    ) -> Result<(), CapError> {
        if objsize == 0 || count == 0 || offset + objsize * count as u64 > desc.bytes {
            return Err(CapError::InvalidArgs);
        }
        let st = self.state.lock();
        if st.range_conflicts(desc, offset, objsize * count as u64) {
            return Err(CapError::NotRetypeable);
        }
        Ok(())
    }

    fn retype(
        &mut self,
        dest: DomCapRef,
        src: DomCapRef,
        offset: u64,
        new_type: ObjType,
        objsize: u64,
        count: usize,
    ) -> Result<(), CapError> {
        {
            let st = self.state.lock();
            let desc = st.desc_at(self.core, src).ok_or(CapError::NotFound)?;
            let meta = st.objects.get(&desc).ok_or(CapError::NotFound)?;
            // Any cross-core relation forces the distributed path.
            if !meta.rels[self.core as usize].is_empty() {
                return Err(CapError::RetryThroughMonitor);
            }
        }
        self.retype_remote_cap(dest, src, offset, new_type, objsize, count)
    }

    fn retype_remote_cap(
        &mut self,
        dest: DomCapRef,
        src: DomCapRef,
        offset: u64,
        new_type: ObjType,
        objsize: u64,
        count: usize,
    ) -> Result<(), CapError> {
        let mut st = self.state.lock();
        let desc = st.desc_at(self.core, src).ok_or(CapError::NotFound)?;
        if objsize == 0 || count == 0 || offset + objsize * count as u64 > desc.bytes {
            return Err(CapError::InvalidArgs);
        }
        if st.range_conflicts(&desc, offset, objsize * count as u64) {
            return Err(CapError::NotRetypeable);
        }
        for i in 0..count as u64 {
            let key = (
                self.core,
                dest.croot,
                dest.cnode,
                dest.slot + i as CapAddr,
            );
            if st.slots.contains_key(&key) {
                return Err(CapError::SlotInUse);
            }
        }
        for i in 0..count as u64 {
            let child = CapDescriptor::new(new_type, desc.base + offset + i * objsize, objsize);
            let key = (
                self.core,
                dest.croot,
                dest.cnode,
                dest.slot + i as CapAddr,
            );
            st.slots.insert(key, child);
            let core = self.core;
            st.objects.entry(child).or_insert_with(|| ObjectMeta {
                owner: core,
                ..Default::default()
            });
        }
        st.meta_mut(&desc)?
            .retyped
            .push((offset, objsize * count as u64));
        Ok(())
    }

    fn spawn_core(
        &mut self,
        mpid: CapAddr,
        boot_entry: u64,
        core_data: u64,
    ) -> Result<(), CapError> {
        log::trace!("spawn_core mpid {} entry {:#x} core_data {:#x}", mpid, boot_entry, core_data);
        self.state.lock().spawned.push((mpid, boot_entry, core_data));
        Ok(())
    }
}

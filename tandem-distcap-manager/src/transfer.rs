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

//! Cap-transfer codec.
//!
//! Serialises a capability's identity, ownership and relations so it can
//! cross the shared-memory channel, where the kernel cannot carry caps.
//! A move nullifies the local slot and may migrate ownership; a copy
//! leaves the slot intact and keeps ownership here. The local relations of
//! the sent capability become the remote relations of the capability the
//! peer reconstructs.

use log::debug;

use tandem_os_common::capspace::{CapRef, CapTransfer, Relations};
use tandem_os_common::monitor::{CapError, MonitorInterface};
use tandem_os_common::peer_core;

/// Encodes `cap` for transmission and nullifies the local slot. If local
/// copies remain this core stays owner and the peer receives a copy;
/// otherwise a moveable capability migrates its ownership to the peer.
/// Sending the last copy of a non-moveable capability is a programming
/// error.
pub fn cap_transfer_move(
    mon: &mut dyn MonitorInterface,
    cap: CapRef,
) -> Result<CapTransfer, CapError> {
    if cap.is_null() {
        return Ok(CapTransfer::INVALID);
    }
    let desc = mon.cap_identify(cap.into())?;
    if desc.is_null() {
        return Ok(CapTransfer::INVALID);
    }

    let local_rels = mon.cap_has_relations(cap.into(), Relations::ALL)?;
    let owner = if local_rels.contains(Relations::COPY) {
        mon.core_id()
    } else if desc.type_.is_moveable() {
        peer_core(mon.core_id())
    } else {
        panic!("moving the last copy of a non-moveable capability: {:?}", desc);
    };

    // The peer holds a copy once this arrives.
    mon.remote_relations(cap.into(), Relations::COPY, Relations::COPY)?;
    mon.nullify_cap(cap.into())?;

    Ok(CapTransfer {
        valid: true,
        desc,
        owner,
        relations: local_rels,
    })
}

/// Encodes `cap` for transmission, leaving the local slot intact; the peer
/// becomes a copy-holder and ownership stays put.
pub fn cap_transfer_copy(
    mon: &mut dyn MonitorInterface,
    cap: CapRef,
) -> Result<CapTransfer, CapError> {
    if cap.is_null() {
        return Ok(CapTransfer::INVALID);
    }
    let desc = mon.cap_identify(cap.into())?;
    if desc.is_null() {
        return Ok(CapTransfer::INVALID);
    }

    mon.remote_relations(cap.into(), Relations::COPY, Relations::COPY)?;
    let local_rels = mon.cap_has_relations(cap.into(), Relations::ALL)?;

    Ok(CapTransfer {
        valid: true,
        desc,
        // The sender keeps a copy, so the receiver's view must record one.
        relations: local_rels | Relations::COPY,
        owner: mon.core_id(),
    })
}

/// Reconstructs a transferred capability in `dest`.
pub fn cap_from_transfer(
    mon: &mut dyn MonitorInterface,
    transfer: &CapTransfer,
    dest: CapRef,
) -> Result<(), CapError> {
    if !transfer.is_valid() {
        return Err(CapError::NotFound);
    }
    mon.cap_create(dest, &transfer.desc, transfer.owner)?;
    mon.remote_relations(dest.into(), transfer.relations, Relations::ALL)?;
    Ok(())
}

/// Logs the local and remote relations of `cap`.
pub fn cap_dump_relations(mon: &mut dyn MonitorInterface, cap: CapRef) {
    let local = mon.cap_has_relations(cap.into(), Relations::ALL);
    let remote = mon.remote_relations(cap.into(), Relations::EMPTY, Relations::EMPTY);
    debug!("cap {}: local {:?} remote {:?}", cap, local, remote);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_fake_monitor::FakeKernel;
    use tandem_os_common::capspace::{CapDescriptor, ObjType, NULL_CAP};

    fn cap(slot: u32) -> CapRef { CapRef::new(3, slot) }

    #[test]
    fn test_move_migrates_ownership() {
        let kernel = FakeKernel::new();
        let desc = CapDescriptor::frame(0x10_0000, 0x1000);
        kernel.install(0, cap(1), desc, 0);
        let mut mon0 = kernel.monitor(0);
        let mut mon1 = kernel.monitor(1);

        let transfer = cap_transfer_move(&mut mon0, cap(1)).unwrap();
        assert!(transfer.is_valid());
        assert_eq!(transfer.desc, desc);
        // No local copies remained and a Frame is moveable: owner moves.
        assert_eq!(transfer.owner, 1);
        assert!(kernel.slot(0, cap(1)).is_none());

        cap_from_transfer(&mut mon1, &transfer, cap(5)).unwrap();
        assert_eq!(kernel.slot(1, cap(5)).unwrap(), desc);
        assert_eq!(kernel.owner_of(&desc), Some(1));
    }

    #[test]
    fn test_move_with_retained_copy_keeps_owner() {
        let kernel = FakeKernel::new();
        let desc = CapDescriptor::frame(0x20_0000, 0x1000);
        kernel.install(0, cap(1), desc, 0);
        kernel.install(0, cap(2), desc, 0);
        let mut mon0 = kernel.monitor(0);
        let mut mon1 = kernel.monitor(1);

        let transfer = cap_transfer_move(&mut mon0, cap(1)).unwrap();
        assert_eq!(transfer.owner, 0);
        // The receiver learns the sender still holds a copy.
        assert!(transfer.relations.contains(Relations::COPY));
        // The sender recorded the peer's copy.
        assert!(kernel
            .remote_relations_of(0, &desc)
            .unwrap()
            .contains(Relations::COPY));

        cap_from_transfer(&mut mon1, &transfer, cap(5)).unwrap();
        assert_eq!(kernel.owner_of(&desc), Some(0));
        assert!(kernel
            .remote_relations_of(1, &desc)
            .unwrap()
            .contains(Relations::COPY));
    }

    #[test]
    #[should_panic(expected = "non-moveable")]
    fn test_move_last_nonmoveable_panics() {
        let kernel = FakeKernel::new();
        let desc = CapDescriptor::new(ObjType::EndPoint, 0x30_0000, 0x1000);
        kernel.install(0, cap(1), desc, 0);
        let mut mon0 = kernel.monitor(0);
        let _ = cap_transfer_move(&mut mon0, cap(1));
    }

    #[test]
    fn test_copy_keeps_local_slot() {
        let kernel = FakeKernel::new();
        let desc = CapDescriptor::ram(0x40_0000, 0x2000);
        kernel.install(0, cap(1), desc, 0);
        let mut mon0 = kernel.monitor(0);
        let mut mon1 = kernel.monitor(1);

        let transfer = cap_transfer_copy(&mut mon0, cap(1)).unwrap();
        assert_eq!(transfer.owner, 0);
        assert!(transfer.relations.contains(Relations::COPY));
        assert_eq!(kernel.slot(0, cap(1)).unwrap(), desc);

        cap_from_transfer(&mut mon1, &transfer, cap(9)).unwrap();
        assert_eq!(kernel.copies_on(0, &desc), 1);
        assert_eq!(kernel.copies_on(1, &desc), 1);
        assert_eq!(kernel.owner_of(&desc), Some(0));
    }

    #[test]
    fn test_invalid_transfer_roundtrip() {
        let kernel = FakeKernel::new();
        let mut mon0 = kernel.monitor(0);
        let mut mon1 = kernel.monitor(1);
        // A null cap-ref and an empty slot both travel as invalid.
        let t1 = cap_transfer_move(&mut mon0, NULL_CAP).unwrap();
        let t2 = cap_transfer_copy(&mut mon0, cap(7)).unwrap();
        assert!(!t1.is_valid());
        assert!(!t2.is_valid());
        assert_eq!(
            cap_from_transfer(&mut mon1, &t1, cap(5)),
            Err(CapError::NotFound)
        );
        assert!(kernel.slot(1, cap(5)).is_none());
    }
}

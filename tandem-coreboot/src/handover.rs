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

//! Boot hand-off over the URPC frame.
//!
//! Immediately after the secondary core starts, the BSP sends the fixed
//! setup message (RAM slice, bootinfo size, multiboot-strings base),
//! the bootinfo bytes, the strings page, and a transfer record for every
//! non-empty slot of the module CNode. Module caps are copied, not moved:
//! the BSP keeps using them itself. Everything runs over the blocking
//! primitives; no other traffic exists this early.

use alloc::vec::Vec;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use tandem_distcap_manager::transfer::{cap_from_transfer, cap_transfer_copy};
use tandem_os_common::bootinfo::{BootInfo, MultibootStrings, RamRegion};
use tandem_os_common::capspace::{CapRef, CapTransfer, CNODE_MODULE, L2_CNODE_SLOTS};
use tandem_os_common::error::ErrorCode;
use tandem_os_common::monitor::MonitorInterface;
use tandem_rpc::ump::UmpChannel;

/// First message on the wire after the secondary core is up.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SetupMessage {
    pub ram: RamRegion,
    pub bootinfo_size: u64,
    pub mmstrings_base: u64,
}

/// BSP side: ships the boot environment to the new core.
pub fn send_handover(
    mon: &mut dyn MonitorInterface,
    chan: &mut UmpChannel,
    bi: &BootInfo,
    mmstrings: &MultibootStrings,
    ram: RamRegion,
    mmstrings_base: u64,
) -> Result<(), ErrorCode> {
    let bi_bytes = postcard::to_allocvec(bi).map_err(|_| ErrorCode::SerializeFailed)?;
    let setup = SetupMessage {
        ram,
        bootinfo_size: bi_bytes.len() as u64,
        mmstrings_base,
    };
    let setup_bytes = postcard::to_allocvec(&setup).map_err(|_| ErrorCode::SerializeFailed)?;
    chan.send_blocking(&setup_bytes).map_err(ErrorCode::from)?;
    chan.send_blocking_varsize(&bi_bytes).map_err(ErrorCode::from)?;
    chan.send_blocking_varsize(&mmstrings.bytes)
        .map_err(ErrorCode::from)?;

    // Snapshot the module CNode: slots are filled densely from zero.
    let mut transfers: Vec<CapTransfer> = Vec::new();
    for slot in 0..L2_CNODE_SLOTS as u32 {
        let cap = CapRef::new(CNODE_MODULE, slot);
        let desc = mon.cap_identify(cap.into()).map_err(ErrorCode::from)?;
        if desc.is_null() {
            break;
        }
        transfers.push(cap_transfer_copy(mon, cap).map_err(ErrorCode::from)?);
    }
    info!("sending {} module caps", transfers.len());
    let transfer_bytes =
        postcard::to_allocvec(&transfers).map_err(|_| ErrorCode::SerializeFailed)?;
    chan.send_blocking_varsize(&transfer_bytes)
        .map_err(ErrorCode::from)?;
    Ok(())
}

/// What the secondary core received at boot.
pub struct Handover {
    pub setup: SetupMessage,
    pub bootinfo: BootInfo,
    pub mmstrings: MultibootStrings,
    pub module_caps: usize,
}

/// Secondary side: mirrors `send_handover` and reconstructs every module
/// cap into its slot of the local module CNode.
pub fn recv_handover(
    mon: &mut dyn MonitorInterface,
    chan: &mut UmpChannel,
) -> Result<Handover, ErrorCode> {
    let setup: SetupMessage = postcard::from_bytes(&chan.recv_blocking())
        .map_err(|_| ErrorCode::DeserializeFailed)?;
    debug!(
        "setup: ram [{:#x}, {:#x}) bootinfo {} bytes",
        setup.ram.base,
        setup.ram.base + setup.ram.bytes,
        setup.bootinfo_size
    );

    let bi_bytes = chan.recv_blocking_varsize();
    if bi_bytes.len() as u64 != setup.bootinfo_size {
        return Err(ErrorCode::InvalidSize);
    }
    let bootinfo: BootInfo =
        postcard::from_bytes(&bi_bytes).map_err(|_| ErrorCode::DeserializeFailed)?;

    let mmstrings = MultibootStrings::new(chan.recv_blocking_varsize());

    let transfer_bytes = chan.recv_blocking_varsize();
    let transfers: Vec<CapTransfer> =
        postcard::from_bytes(&transfer_bytes).map_err(|_| ErrorCode::DeserializeFailed)?;
    for (slot, transfer) in transfers.iter().enumerate() {
        let cap = CapRef::new(CNODE_MODULE, slot as u32);
        cap_from_transfer(mon, transfer, cap).map_err(ErrorCode::from)?;
    }
    info!("received {} module caps", transfers.len());

    Ok(Handover {
        setup,
        bootinfo,
        mmstrings,
        module_caps: transfers.len(),
    })
}

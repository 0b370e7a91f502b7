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

//! Tandem OS distributed capability interface.
//!
//! Wire messages for the two-core capability protocol. The non-sync
//! variants are the client-facing API (a domain asks its init to delete,
//! revoke or retype a capability); the sync variants are the internal
//! cross-core protocol the engines speak between init domains. Clients
//! never see a sync message.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
use serde::{Deserialize, Serialize};

use tandem_os_common::capspace::{CapDescriptor, DomCapRef, ObjType};
use tandem_os_common::error::ErrorCode;
use tandem_os_common::CoreId;
use tandem_rpc::endpoint::EndpointChannel;
use tandem_rpc::message::{self, RequestKind};
use tandem_rpc::Frame;

/// How a peer finishes a delete whose last local copy is going away.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DeleteSyncOp {
    /// Promote the peer to owner; the initiator then nullifies locally.
    MoveOwner,
    /// Delete every copy the peer holds (non-moveable type).
    DeleteForeigns,
    /// Clear the peer's copy relation; the initiator held the last
    /// non-owner copy.
    LastNonowner,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeleteSync {
    pub desc: CapDescriptor,
    pub owner: CoreId,
    pub op: DeleteSyncOp,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RevokeSync {
    pub desc: CapDescriptor,
    pub owner: CoreId,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RetypeSync {
    pub desc: CapDescriptor,
    pub owner: CoreId,
    pub offset: u64,
    pub objsize: u64,
    pub count: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DistCapRequest {
    Delete {
        cap: DomCapRef,
    },
    Revoke {
        cap: DomCapRef,
    },
    Retype {
        src: DomCapRef,
        offset: u64,
        new_type: ObjType,
        objsize: u64,
        count: u64,
        dest: DomCapRef,
    },
    DeleteSync(DeleteSync),
    RevokeSync(RevokeSync),
    RetypeSync(RetypeSync),
}

#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct DistCapResponse {
    pub err: ErrorCode,
}

fn distcap_call(chan: &EndpointChannel, req: &DistCapRequest) -> Result<(), ErrorCode> {
    log::trace!("distcap_call {:?}", req);
    let bytes = message::encode_request(RequestKind::DistCap, req).map_err(ErrorCode::from)?;
    chan.send_blocking(Frame::new(bytes)).map_err(ErrorCode::from)?;
    let reply = chan.recv_blocking().map_err(ErrorCode::from)?;
    let res: DistCapResponse = message::decode_response(&reply.bytes).map_err(ErrorCode::from)?;
    Result::from(res.err)
}

/// Client stub: deletes `cap`, synchronising with the peer core as needed.
pub fn tandem_cap_delete_remote(chan: &EndpointChannel, cap: DomCapRef) -> Result<(), ErrorCode> {
    distcap_call(chan, &DistCapRequest::Delete { cap })
}

/// Client stub: revokes `cap` on both cores.
pub fn tandem_cap_revoke_remote(chan: &EndpointChannel, cap: DomCapRef) -> Result<(), ErrorCode> {
    distcap_call(chan, &DistCapRequest::Revoke { cap })
}

/// Client stub: retypes `src` into `count` objects of `new_type` at `dest`,
/// with two-core consensus on the source.
#[allow(clippy::too_many_arguments)]
pub fn tandem_cap_retype_remote(
    chan: &EndpointChannel,
    src: DomCapRef,
    offset: u64,
    new_type: ObjType,
    objsize: u64,
    count: u64,
    dest: DomCapRef,
) -> Result<(), ErrorCode> {
    distcap_call(
        chan,
        &DistCapRequest::Retype {
            src,
            offset,
            new_type,
            objsize,
            count,
            dest,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_os_common::capspace::{CapRef, SELF_CROOT};

    #[test]
    fn test_sync_roundtrip() {
        let sync = DistCapRequest::DeleteSync(DeleteSync {
            desc: CapDescriptor::frame(0x1000, 0x2000),
            owner: 1,
            op: DeleteSyncOp::MoveOwner,
        });
        let bytes = message::encode_request(RequestKind::DistCap, &sync).unwrap();
        let (kind, body) = message::decode_kind(&bytes).unwrap();
        assert_eq!(kind, RequestKind::DistCap);
        match message::decode_body::<DistCapRequest>(body).unwrap() {
            DistCapRequest::DeleteSync(s) => {
                assert_eq!(s.owner, 1);
                assert_eq!(s.op, DeleteSyncOp::MoveOwner);
                assert_eq!(s.desc, CapDescriptor::frame(0x1000, 0x2000));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_retype_request_roundtrip() {
        let src = CapRef::new(3, 4).with_root(SELF_CROOT);
        let dest = CapRef::new(3, 9).with_root(SELF_CROOT);
        let req = DistCapRequest::Retype {
            src,
            offset: 0,
            new_type: ObjType::Frame,
            objsize: 4096,
            count: 2,
            dest,
        };
        let bytes = message::encode_request(RequestKind::DistCap, &req).unwrap();
        let (_, body) = message::decode_kind(&bytes).unwrap();
        match message::decode_body::<DistCapRequest>(body).unwrap() {
            DistCapRequest::Retype { src: s, dest: d, count, .. } => {
                assert_eq!(s, src);
                assert_eq!(d, dest);
                assert_eq!(count, 2);
            }
            _ => panic!("wrong variant"),
        }
    }
}

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

//! Tandem OS memory server interface.
//!
//! The memory server brokers physical RAM: clients request a capability to
//! `size` bytes with a given alignment and get a RAM cap in the reply's
//! first cap slot. The server lives on core 0; requests arriving on the
//! other core are forwarded transparently.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};

use tandem_os_common::capspace::CapRef;
use tandem_os_common::error::ErrorCode;
use tandem_rpc::endpoint::EndpointChannel;
use tandem_rpc::message::{self, RequestKind};
use tandem_rpc::Frame;

/// Soft cap on the RAM a single process may hold (1 GiB).
pub const PER_PROCESS_MEMORY_LIMIT: u64 = 1024 * 1024 * 1024;

#[repr(u32)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
pub enum MemoryManagerError {
    Success = 0,
    BadAlignment,
    OutOfMemory,
    LimitExceeded,
    InvalidRegion,
    #[default]
    UnknownError,
}

impl From<MemoryManagerError> for ErrorCode {
    fn from(err: MemoryManagerError) -> ErrorCode {
        match err {
            MemoryManagerError::Success => ErrorCode::Ok,
            MemoryManagerError::BadAlignment => ErrorCode::BadAlignment,
            MemoryManagerError::OutOfMemory => ErrorCode::OutOfMemory,
            MemoryManagerError::LimitExceeded => ErrorCode::MemoryLimitExceeded,
            MemoryManagerError::InvalidRegion => ErrorCode::InvalidArgs,
            MemoryManagerError::UnknownError => ErrorCode::Unknown,
        }
    }
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct MemServerRequest {
    pub size: u64,
    pub alignment: u64,
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct MemServerResponse {
    pub err: ErrorCode,
    pub retbytes: u64,
}

/// Client stub: requests a RAM cap of at least `size` bytes.
pub fn tandem_ram_alloc(
    chan: &EndpointChannel,
    size: u64,
    alignment: u64,
) -> Result<(CapRef, u64), ErrorCode> {
    log::trace!("ram_alloc size {} alignment {}", size, alignment);
    let req = MemServerRequest { size, alignment };
    let bytes =
        message::encode_request(RequestKind::MemServer, &req).map_err(ErrorCode::from)?;
    chan.send_blocking(Frame::new(bytes)).map_err(ErrorCode::from)?;
    let reply = chan.recv_blocking().map_err(ErrorCode::from)?;
    let res: MemServerResponse =
        message::decode_response(&reply.bytes).map_err(ErrorCode::from)?;
    Result::from(res.err)?;
    let cap = reply.caps.first().copied().ok_or(ErrorCode::Unknown)?;
    Ok((cap, res.retbytes))
}

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

//! Tandem OS RPC transport.
//!
//! Two wire-level channels hide behind one request/response surface: an
//! in-core endpoint channel (kernel-mediated, caps ride with the frame) and
//! a cross-core shared-memory channel (one ring per direction, caps cross
//! only as serialised transfers). The async multiplexer layers concurrent
//! in-flight requests on top of the cross-core channel.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod async_channel;
pub mod endpoint;
pub mod message;
pub mod ump;

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};
use tandem_os_common::capspace::CapRef;
use tandem_os_common::error::ErrorCode;

/// One message on an endpoint channel: payload bytes plus capability slots.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub bytes: Vec<u8>,
    pub caps: Vec<CapRef>,
}

impl Frame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Frame {
            bytes,
            caps: Vec::new(),
        }
    }

    pub fn with_caps(bytes: Vec<u8>, caps: Vec<CapRef>) -> Self { Frame { bytes, caps } }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RpcError {
    /// No transmit slot / no frame available right now.
    WouldBlock,
    MessageTooLarge,
    ChannelClosed,
    SerializeFailed,
    DeserializeFailed,
}

impl From<RpcError> for ErrorCode {
    fn from(err: RpcError) -> ErrorCode {
        match err {
            RpcError::WouldBlock => ErrorCode::Unknown,
            RpcError::MessageTooLarge => ErrorCode::InvalidSize,
            RpcError::ChannelClosed => ErrorCode::ChannelClosed,
            RpcError::SerializeFailed => ErrorCode::SerializeFailed,
            RpcError::DeserializeFailed => ErrorCode::DeserializeFailed,
        }
    }
}

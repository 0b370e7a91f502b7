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

//! Request framing.
//!
//! Every request begins with a request-kind tag so the dispatcher can route
//! a frame without decoding service-specific bodies; bodies are postcard
//! records owned by the service interface crates. Responses are plain
//! postcard records whose first field is the wire error code.

use alloc::vec::Vec;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::RpcError;

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
pub enum RequestKind {
    GenericNumber = 0,
    GenericString,
    SetupChannel,
    MemServer,
    Terminal,
    TerminalStr,
    ProcMgmt,
    Filesystem,
    TestSuite,
    DistCap,
    Network,
}

/// Prepends the kind tag to a postcard-encoded body.
pub fn encode_request<T: Serialize>(kind: RequestKind, body: &T) -> Result<Vec<u8>, RpcError> {
    let mut bytes = postcard::to_allocvec(body).map_err(|_| RpcError::SerializeFailed)?;
    bytes.insert(0, kind.into());
    Ok(bytes)
}

/// Splits a request into its kind tag and body bytes.
pub fn decode_kind(bytes: &[u8]) -> Result<(RequestKind, &[u8]), RpcError> {
    let (&tag, body) = bytes.split_first().ok_or(RpcError::DeserializeFailed)?;
    let kind = RequestKind::try_from(tag).map_err(|_| RpcError::DeserializeFailed)?;
    Ok((kind, body))
}

pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, RpcError> {
    postcard::from_bytes(body).map_err(|_| RpcError::DeserializeFailed)
}

pub fn encode_response<T: Serialize>(body: &T) -> Result<Vec<u8>, RpcError> {
    postcard::to_allocvec(body).map_err(|_| RpcError::SerializeFailed)
}

pub fn decode_response<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RpcError> {
    postcard::from_bytes(bytes).map_err(|_| RpcError::DeserializeFailed)
}

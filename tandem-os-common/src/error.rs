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

//! Wire error codes.
//!
//! Every RPC response carries one of these; subsystems keep richer typed
//! errors locally and convert at the wire boundary. Responses forwarded
//! between cores carry the code verbatim.

use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};

#[repr(u32)]
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromPrimitive, IntoPrimitive, Serialize,
    Deserialize,
)]
pub enum ErrorCode {
    Ok = 0,
    InvalidArgs,
    InvalidSize,
    NotFound,
    OutOfMemory,
    BadAlignment,
    MemoryLimitExceeded,
    // Transient: the holder must wait on the caplock queue, never surfaced.
    CapLocked,
    // The kernel requires a distributed round for this operation.
    RetryThroughMonitor,
    // The peer's half of a distcap sync failed; forwarded verbatim.
    PeerDistcapFailure,
    NotRetypeable,
    // Internal invariants; reaching a client indicates corruption.
    NoRemoteCopy,
    RemoteCopyExists,
    Timeout,
    BufferOverflow,
    NotSupported,
    ChannelClosed,
    SpawnFailed,
    SerializeFailed,
    DeserializeFailed,
    #[default]
    Unknown,
}

impl ErrorCode {
    pub fn is_ok(self) -> bool { self == ErrorCode::Ok }
    pub fn is_err(self) -> bool { !self.is_ok() }

    /// Folds a `Result` whose error side already is an `ErrorCode`.
    pub fn from_result(r: Result<(), ErrorCode>) -> ErrorCode {
        match r {
            Ok(()) => ErrorCode::Ok,
            Err(e) => e,
        }
    }
}

impl From<ErrorCode> for Result<(), ErrorCode> {
    fn from(err: ErrorCode) -> Result<(), ErrorCode> {
        if err == ErrorCode::Ok {
            Ok(())
        } else {
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_code_maps_to_default() {
        assert_eq!(ErrorCode::from(0xdead_beefu32), ErrorCode::Unknown);
    }

    #[test]
    fn test_result_conversion() {
        assert_eq!(Result::from(ErrorCode::Ok), Ok(()));
        assert_eq!(Result::from(ErrorCode::NotFound), Err(ErrorCode::NotFound));
        assert_eq!(ErrorCode::from_result(Err(ErrorCode::Timeout)), ErrorCode::Timeout);
    }
}

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

//! Wire bodies owned by the init domain itself: the generic number/string
//! requests, channel setup, terminal traffic, the self-test hook, and the
//! network RPC plumbing.

use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use tandem_os_common::error::ErrorCode;
use tandem_proc_interface::Pid;

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct GenericNumberRequest {
    pub val: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenericStringRequest {
    pub msg: String,
}

/// Acknowledgement carrying only the error code.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct GenericResponse {
    pub err: ErrorCode,
}

/// A process introduces itself on a freshly connected channel.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct SetupChannelRequest {
    pub pid: Pid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TerminalRequest {
    Putchar(char),
    Getchar,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerminalResponse {
    pub err: ErrorCode,
    pub c: Option<char>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TerminalStrRequest {
    Putstr(String),
    Getstr { len: usize },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerminalStrResponse {
    pub err: ErrorCode,
    pub len: usize,
    pub s: String,
}

/// Which self tests to run, and how.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TestSuiteRequest {
    pub tests: Vec<u32>,
    pub quick: bool,
    pub verbose: bool,
    pub continue_on_err: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NetworkRequest {
    /// The network driver announces itself and its MAC address.
    Init { mac: [u8; 6] },
    /// Inbound packet delivered by the driver.
    Receive { packet: Vec<u8> },
    Ping { ip: u32 },
    Send {
        pid: Pid,
        is_tcp: bool,
        target_ip: u32,
        target_port: u16,
        host_port: u16,
        data: Vec<u8>,
    },
    Listen { port: u16, pid: Pid, is_tcp: bool },
    SetIo {
        is_network: bool,
        is_tcp: bool,
        ip: u32,
        src_port: u16,
        dst_port: u16,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkPingResponse {
    pub err: ErrorCode,
    pub ping_ms: u32,
}

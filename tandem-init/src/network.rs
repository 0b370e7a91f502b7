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

//! Network RPC plumbing.
//!
//! The network stack itself is a separate process; init only records who
//! it is, routes traffic between it and listening processes, and enforces
//! the one time-bounded operation in the system: pings time out through a
//! deferred event.

use alloc::vec::Vec;
use hashbrown::HashMap;
use log::debug;

use tandem_proc_interface::Pid;

/// Ticks until an unanswered ping fails with `Timeout`.
pub const PING_TIMEOUT_TICKS: u64 = 64;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
struct ListenKey {
    port: u16,
    is_tcp: bool,
}

#[derive(Default)]
pub struct NetworkState {
    /// The driver process, once it announced itself.
    driver: Option<(Pid, [u8; 6])>,
    listeners: HashMap<ListenKey, Pid>,
    /// In-flight pings: ip -> suspended RPC ctx.
    pings: HashMap<u32, u64>,
    /// Console redirection over the network, set via SetIo.
    network_io: bool,
}

impl NetworkState {
    pub fn new() -> Self { Self::default() }

    pub fn init(&mut self, pid: Pid, mac: [u8; 6]) {
        debug!("network driver pid {} mac {:02x?}", pid, mac);
        self.driver = Some((pid, mac));
    }

    pub fn has_driver(&self) -> bool { self.driver.is_some() }
    pub fn driver_pid(&self) -> Option<Pid> { self.driver.map(|(pid, _)| pid) }

    pub fn listen(&mut self, port: u16, is_tcp: bool, pid: Pid) {
        self.listeners.insert(ListenKey { port, is_tcp }, pid);
    }

    pub fn listener(&self, port: u16, is_tcp: bool) -> Option<Pid> {
        self.listeners.get(&ListenKey { port, is_tcp }).copied()
    }

    /// Registers an in-flight ping; the caller arms the deferred timeout.
    pub fn ping_started(&mut self, ip: u32, ctx: u64) { self.pings.insert(ip, ctx); }

    /// An echo reply (or the timeout) resolves the ping.
    pub fn ping_resolved(&mut self, ip: u32) -> Option<u64> { self.pings.remove(&ip) }

    pub fn set_io(&mut self, is_network: bool) { self.network_io = is_network; }
    pub fn uses_network_io(&self) -> bool { self.network_io }

    /// Pids of every process involved in networking; used by teardown.
    pub fn known_pids(&self) -> Vec<Pid> {
        self.listeners
            .values()
            .copied()
            .chain(self.driver.map(|(pid, _)| pid))
            .collect()
    }
}

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

//! Deferred events.
//!
//! The only time-bounded operations in the init domain are network requests
//! (ARP resolution, ping). Each registers a deadline here; the event loop
//! polls expirations and fires the owner's timeout path with the token.

extern crate alloc;
use alloc::vec::Vec;

/// Monotonic time in event-loop ticks.
pub type Ticks = u64;

#[derive(Debug)]
struct Deferred {
    deadline: Ticks,
    token: u64,
}

#[derive(Default)]
pub struct DeferredQueue {
    pending: Vec<Deferred>,
}

impl DeferredQueue {
    pub fn new() -> Self { Self::default() }

    /// Registers `token` to expire at `deadline`.
    pub fn register(&mut self, deadline: Ticks, token: u64) {
        self.pending.push(Deferred { deadline, token });
    }

    /// Drops a registration, e.g. when the awaited reply arrived in time.
    pub fn cancel(&mut self, token: u64) { self.pending.retain(|d| d.token != token); }

    /// Removes and returns every token whose deadline has passed.
    pub fn expire(&mut self, now: Ticks) -> Vec<u64> {
        let mut fired = Vec::new();
        self.pending.retain(|d| {
            if d.deadline <= now {
                fired.push(d.token);
                false
            } else {
                true
            }
        });
        fired
    }

    pub fn is_empty(&self) -> bool { self.pending.is_empty() }
}

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

//! Caplock wait queue.
//!
//! Operations that find a capability locked park here, keyed by the domain
//! cap-ref. Unlocking wakes one waiter, which retries its lock step; FIFO
//! order holds per key on this core, nothing more.

use alloc::collections::VecDeque;
use hashbrown::HashMap;
use log::debug;

use tandem_os_common::capspace::DomCapRef;
use tandem_os_common::monitor::{CapError, MonitorInterface};

#[derive(Default)]
pub struct CapLockQueue {
    waiting: HashMap<DomCapRef, VecDeque<u64>>,
}

impl CapLockQueue {
    pub fn new() -> Self { Self::default() }

    /// Parks `token` until `cap` is unlocked.
    pub fn wait(&mut self, cap: DomCapRef, token: u64) {
        crate::debug_capops!("caplock_wait {} token {}", cap, token);
        self.waiting.entry(cap).or_default().push_back(token);
    }

    /// Releases the kernel lock on `cap` and returns the next waiter to
    /// retry, if any. The lock may already be gone when the holder deleted
    /// the capability before unlocking; that is not an error.
    pub fn unlock(&mut self, mon: &mut dyn MonitorInterface, cap: DomCapRef) -> Option<u64> {
        match mon.unlock_cap(cap) {
            Ok(()) => {}
            Err(CapError::NotFound) => debug!("unlocking vanished cap {}", cap),
            Err(e) => panic!("unlocking cap {}: {:?}", cap, e),
        }
        self.wake_one(cap)
    }

    fn wake_one(&mut self, cap: DomCapRef) -> Option<u64> {
        let queue = self.waiting.get_mut(&cap)?;
        let token = queue.pop_front();
        if queue.is_empty() {
            self.waiting.remove(&cap);
        }
        token
    }

    pub fn is_empty(&self) -> bool { self.waiting.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_fake_monitor::FakeKernel;
    use tandem_os_common::capspace::{CapDescriptor, CapRef};
    use tandem_os_common::monitor::MonitorInterface;

    #[test]
    fn test_fifo_wake_per_key() {
        let kernel = FakeKernel::new();
        let cap = CapRef::new(3, 1);
        kernel.install(0, cap, CapDescriptor::ram(0x1000, 0x1000), 0);
        let mut mon = kernel.monitor(0);
        mon.lock_cap(cap.into()).unwrap();

        let mut queue = CapLockQueue::new();
        queue.wait(cap.into(), 10);
        queue.wait(cap.into(), 20);
        assert_eq!(queue.unlock(&mut mon, cap.into()), Some(10));
        // The woken waiter grabs the lock; the next unlock wakes the rest.
        mon.lock_cap(cap.into()).unwrap();
        assert_eq!(queue.unlock(&mut mon, cap.into()), Some(20));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_unlock_of_deleted_cap_is_tolerated() {
        let kernel = FakeKernel::new();
        let cap = CapRef::new(3, 2);
        kernel.install(0, cap, CapDescriptor::ram(0x2000, 0x1000), 0);
        let mut mon = kernel.monitor(0);
        mon.lock_cap(cap.into()).unwrap();
        mon.nullify_cap(cap.into()).unwrap();

        let mut queue = CapLockQueue::new();
        queue.wait(cap.into(), 7);
        // Holder deleted the cap before unlocking; waiter still wakes.
        assert_eq!(queue.unlock(&mut mon, cap.into()), Some(7));
    }
}

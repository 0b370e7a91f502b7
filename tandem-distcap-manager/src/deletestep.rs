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

//! Delete queue.
//!
//! Some deletions need staged cleanup (draining per-cap state, finishing a
//! revocation) that runs from the event loop rather than inline. Waiters
//! enqueue a token and are completed when the driver finishes the current
//! batch.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

#[derive(Default)]
pub struct DeleteQueue {
    pending: VecDeque<u64>,
}

impl DeleteQueue {
    pub fn new() -> Self { Self::default() }

    /// Parks `token` until the current batch of delete steps completes.
    pub fn wait(&mut self, token: u64) {
        crate::debug_capops!("delete_queue_wait token {}", token);
        self.pending.push_back(token);
    }

    /// Runs the pending batch to completion and returns the tokens to
    /// resume, in arrival order.
    pub fn drain(&mut self) -> Vec<u64> { self.pending.drain(..).collect() }

    pub fn is_empty(&self) -> bool { self.pending.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_in_order() {
        let mut q = DeleteQueue::new();
        q.wait(3);
        q.wait(1);
        q.wait(2);
        assert_eq!(q.drain(), alloc::vec![3, 1, 2]);
        assert!(q.is_empty());
        assert!(q.drain().is_empty());
    }
}

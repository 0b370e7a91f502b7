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

//! Terminal adapter.
//!
//! The UART sits behind the serial server on core 0; this module keeps its
//! output buffer and input queue and parks getchar/getstr waiters until
//! enough input arrived. The driver (or a test) feeds input through
//! `push_input`.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

/// A parked read: the suspended RPC `ctx` wants `wanted` characters.
struct Waiter {
    ctx: u64,
    wanted: usize,
}

#[derive(Default)]
pub struct Console {
    output: Vec<u8>,
    input: VecDeque<u8>,
    waiters: VecDeque<Waiter>,
}

impl Console {
    pub fn new() -> Self { Self::default() }

    pub fn putchar(&mut self, c: char) {
        let mut buf = [0u8; 4];
        self.output.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    }

    pub fn putstr(&mut self, s: &str) { self.output.extend_from_slice(s.as_bytes()); }

    /// Everything written so far; used by the shell pipe and by tests.
    pub fn output(&self) -> &[u8] { &self.output }

    /// Queues a read of `wanted` characters for suspended RPC `ctx`.
    pub fn register_read(&mut self, ctx: u64, wanted: usize) {
        self.waiters.push_back(Waiter { ctx, wanted });
    }

    /// Feeds driver input; returns the reads that can now complete as
    /// `(ctx, data)` in registration order.
    pub fn push_input(&mut self, bytes: &[u8]) -> Vec<(u64, String)> {
        self.input.extend(bytes.iter().copied());
        let mut done = Vec::new();
        while let Some(w) = self.waiters.front() {
            if self.input.len() < w.wanted {
                break;
            }
            let w = self.waiters.pop_front().unwrap();
            let data: String = self.input.drain(..w.wanted).map(|b| b as char).collect();
            done.push((w.ctx, data));
        }
        done
    }

    /// Immediate read when input is already buffered and nobody is ahead
    /// of us.
    pub fn try_read(&mut self, wanted: usize) -> Option<String> {
        if self.waiters.is_empty() && self.input.len() >= wanted {
            Some(self.input.drain(..wanted).map(|b| b as char).collect())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_collects() {
        let mut console = Console::new();
        console.putchar('h');
        console.putstr("ello");
        assert_eq!(console.output(), b"hello");
    }

    #[test]
    fn test_waiters_fifo() {
        let mut console = Console::new();
        console.register_read(1, 1);
        console.register_read(2, 3);
        assert!(console.push_input(b"").is_empty());
        let done = console.push_input(b"ab");
        assert_eq!(done, alloc::vec![(1, String::from("a"))]);
        let done = console.push_input(b"cd");
        assert_eq!(done, alloc::vec![(2, String::from("bcd"))]);
        // Leftover input serves immediate reads.
        assert_eq!(console.try_read(1), Some(String::from("d")));
        assert_eq!(console.try_read(1), None);
    }
}

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

//! Cross-core shared-memory channel (URPC).
//!
//! A single shared frame holds two rings of cache-line-sized slots, one per
//! direction, with one producer and one consumer each. Notification is by
//! spinning on a per-slot sequence counter; consumption is acknowledged
//! through a shared read-position word so the producer never laps the
//! consumer. Messages larger than one slot fragment across consecutive
//! slots behind a length header. Capabilities cannot cross here; callers
//! serialise them as cap transfers inside the payload.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};
use static_assertions::const_assert;

use crate::RpcError;

/// Ring geometry: the URPC frame is one base page split evenly between the
/// two directions.
pub const UMP_SLOT_BYTES: usize = 64;
pub const UMP_SLOT_PAYLOAD: usize = UMP_SLOT_BYTES - 8;
pub const UMP_RING_SLOTS: usize = 31;

/// Largest single message; bounded by ring capacity so a sender can always
/// make progress once the consumer drains.
pub const UMP_MAX_MSG_BYTES: usize = 1600;
const_assert!(UMP_MAX_MSG_BYTES + 4 <= UMP_RING_SLOTS * UMP_SLOT_PAYLOAD);

struct UmpSlot {
    /// Written after the payload with release ordering; the consumer spins
    /// on it with acquire ordering. Holds `position + 1` of the fragment
    /// stored in the slot.
    seq: AtomicU64,
    data: UnsafeCell<[u8; UMP_SLOT_PAYLOAD]>,
}

impl UmpSlot {
    fn new() -> Self {
        UmpSlot {
            seq: AtomicU64::new(0),
            data: UnsafeCell::new([0u8; UMP_SLOT_PAYLOAD]),
        }
    }
}

struct UmpRing {
    slots: Vec<UmpSlot>,
    /// Consumer position, advanced after a fragment is copied out.
    read_pos: AtomicU64,
}

impl UmpRing {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(UMP_RING_SLOTS);
        for _ in 0..UMP_RING_SLOTS {
            slots.push(UmpSlot::new());
        }
        UmpRing {
            slots,
            read_pos: AtomicU64::new(0),
        }
    }

    fn free_slots(&self, write_pos: u64) -> usize {
        UMP_RING_SLOTS - (write_pos - self.read_pos.load(Ordering::Acquire)) as usize
    }

    fn write_fragment(&self, pos: u64, fragment: &[u8]) {
        let slot = &self.slots[(pos % UMP_RING_SLOTS as u64) as usize];
        debug_assert!(fragment.len() <= UMP_SLOT_PAYLOAD);
        unsafe {
            (&mut (*slot.data.get()))[..fragment.len()].copy_from_slice(fragment);
        }
        slot.seq.store(pos + 1, Ordering::Release);
    }

    /// Returns the fragment at `pos` once the producer has published it.
    fn read_fragment(&self, pos: u64) -> Option<[u8; UMP_SLOT_PAYLOAD]> {
        let slot = &self.slots[(pos % UMP_RING_SLOTS as u64) as usize];
        if slot.seq.load(Ordering::Acquire) != pos + 1 {
            return None;
        }
        let data = unsafe { *slot.data.get() };
        self.read_pos.store(pos + 1, Ordering::Release);
        Some(data)
    }
}

/// The shared frame. Both cores map the same physical page; here both ends
/// hold a reference onto the same ring pair.
pub struct UmpFrame {
    to_secondary: UmpRing,
    to_primary: UmpRing,
}

// One producer and one consumer per ring; slot contents are published via
// the seq word.
unsafe impl Sync for UmpFrame {}
unsafe impl Send for UmpFrame {}

impl UmpFrame {
    pub fn new() -> Arc<UmpFrame> {
        Arc::new(UmpFrame {
            to_secondary: UmpRing::new(),
            to_primary: UmpRing::new(),
        })
    }
}

/// One core's view of the URPC frame.
pub struct UmpChannel {
    frame: Arc<UmpFrame>,
    primary: bool,
    write_pos: u64,
    read_pos: u64,
    /// Partial inbound message carried across polls.
    partial: Option<PartialRecv>,
}

struct PartialRecv {
    total: usize,
    bytes: Vec<u8>,
}

impl UmpChannel {
    /// Connects to the frame; `primary` selects the ring directions and is
    /// true exactly once per frame (the booting side).
    pub fn connect(frame: Arc<UmpFrame>, primary: bool) -> Self {
        UmpChannel {
            frame,
            primary,
            write_pos: 0,
            read_pos: 0,
            partial: None,
        }
    }

    fn tx_ring(&self) -> &UmpRing {
        if self.primary {
            &self.frame.to_secondary
        } else {
            &self.frame.to_primary
        }
    }

    fn rx_ring(&self) -> &UmpRing {
        if self.primary {
            &self.frame.to_primary
        } else {
            &self.frame.to_secondary
        }
    }

    fn fragments_for(len: usize) -> usize {
        // Four length-header bytes ride in the first fragment.
        (len + 4).div_ceil(UMP_SLOT_PAYLOAD)
    }

    /// Queues a whole message if the ring has room for every fragment.
    pub fn try_send(&mut self, msg: &[u8]) -> Result<(), RpcError> {
        if msg.len() > UMP_MAX_MSG_BYTES {
            return Err(RpcError::MessageTooLarge);
        }
        let nfrag = Self::fragments_for(msg.len());
        if self.tx_ring().free_slots(self.write_pos) < nfrag {
            return Err(RpcError::WouldBlock);
        }
        let mut first = [0u8; UMP_SLOT_PAYLOAD];
        first[..4].copy_from_slice(&(msg.len() as u32).to_le_bytes());
        let head = msg.len().min(UMP_SLOT_PAYLOAD - 4);
        first[4..4 + head].copy_from_slice(&msg[..head]);
        self.tx_ring().write_fragment(self.write_pos, &first[..4 + head]);
        self.write_pos += 1;
        let mut off = head;
        while off < msg.len() {
            let take = (msg.len() - off).min(UMP_SLOT_PAYLOAD);
            self.tx_ring().write_fragment(self.write_pos, &msg[off..off + take]);
            self.write_pos += 1;
            off += take;
        }
        Ok(())
    }

    pub fn can_send(&self, len: usize) -> bool {
        len <= UMP_MAX_MSG_BYTES && self.tx_ring().free_slots(self.write_pos) >= Self::fragments_for(len)
    }

    /// Polls for a complete inbound message; partial messages are retained
    /// across calls.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        loop {
            let fragment = self.rx_ring().read_fragment(self.read_pos)?;
            self.read_pos += 1;
            match self.partial.take() {
                None => {
                    let total = u32::from_le_bytes(fragment[..4].try_into().unwrap()) as usize;
                    let head = total.min(UMP_SLOT_PAYLOAD - 4);
                    let mut bytes = Vec::with_capacity(total);
                    bytes.extend_from_slice(&fragment[4..4 + head]);
                    if bytes.len() == total {
                        return Some(bytes);
                    }
                    self.partial = Some(PartialRecv { total, bytes });
                }
                Some(mut p) => {
                    let take = (p.total - p.bytes.len()).min(UMP_SLOT_PAYLOAD);
                    p.bytes.extend_from_slice(&fragment[..take]);
                    if p.bytes.len() == p.total {
                        return Some(p.bytes);
                    }
                    self.partial = Some(p);
                }
            }
        }
    }

    pub fn has_frame(&self) -> bool {
        let slot = &self.rx_ring().slots[(self.read_pos % UMP_RING_SLOTS as u64) as usize];
        slot.seq.load(Ordering::Acquire) == self.read_pos + 1
    }

    /// Spins until the message is queued. Boot-time only.
    pub fn send_blocking(&mut self, msg: &[u8]) -> Result<(), RpcError> {
        loop {
            match self.try_send(msg) {
                Ok(()) => return Ok(()),
                Err(RpcError::WouldBlock) => core::hint::spin_loop(),
                Err(e) => return Err(e),
            }
        }
    }

    /// Spins until a message arrives. Boot-time only.
    pub fn recv_blocking(&mut self) -> Vec<u8> {
        loop {
            if let Some(msg) = self.try_recv() {
                return msg;
            }
            core::hint::spin_loop();
        }
    }

    /// Sends a buffer of arbitrary size: a fixed-shape header message first,
    /// then as many payload chunks as needed.
    pub fn send_blocking_varsize(&mut self, buf: &[u8]) -> Result<(), RpcError> {
        self.send_blocking(&(buf.len() as u64).to_le_bytes())?;
        for chunk in buf.chunks(UMP_MAX_MSG_BYTES) {
            self.send_blocking(chunk)?;
        }
        Ok(())
    }

    /// Receives a buffer sent with `send_blocking_varsize`.
    pub fn recv_blocking_varsize(&mut self) -> Vec<u8> {
        let header = self.recv_blocking();
        let total = u64::from_le_bytes(header[..8].try_into().unwrap()) as usize;
        let mut buf = Vec::with_capacity(total);
        while buf.len() < total {
            buf.extend_from_slice(&self.recv_blocking());
        }
        assert_eq!(buf.len(), total, "varsize stream out of sync");
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn pair() -> (UmpChannel, UmpChannel) {
        let frame = UmpFrame::new();
        (
            UmpChannel::connect(frame.clone(), true),
            UmpChannel::connect(frame, false),
        )
    }

    #[test]
    fn test_small_message() {
        let (mut bsp, mut app) = pair();
        bsp.try_send(b"hello core 1").unwrap();
        assert!(app.has_frame());
        assert_eq!(app.try_recv().unwrap(), b"hello core 1");
        assert!(app.try_recv().is_none());
    }

    #[test]
    fn test_fragmented_message() {
        let (mut bsp, mut app) = pair();
        let msg: Vec<u8> = (0..1500u32).map(|i| i as u8).collect();
        bsp.try_send(&msg).unwrap();
        assert_eq!(app.try_recv().unwrap(), msg);
    }

    #[test]
    fn test_backpressure_and_drain() {
        let (mut bsp, mut app) = pair();
        let msg = [0xa5u8; UMP_SLOT_PAYLOAD * 4];
        let mut sent = 0;
        while bsp.try_send(&msg).is_ok() {
            sent += 1;
        }
        assert!(sent > 0);
        // Drain one message; the ring must accept more again.
        assert_eq!(app.try_recv().unwrap().len(), msg.len());
        bsp.try_send(&msg).unwrap();
        for _ in 0..sent {
            assert_eq!(app.try_recv().unwrap().len(), msg.len());
        }
        assert!(app.try_recv().is_none());
    }

    #[test]
    fn test_too_large() {
        let (mut bsp, _app) = pair();
        let msg = vec![0u8; UMP_MAX_MSG_BYTES + 1];
        assert_eq!(bsp.try_send(&msg), Err(RpcError::MessageTooLarge));
    }

    #[test]
    fn test_bidirectional() {
        let (mut bsp, mut app) = pair();
        bsp.try_send(b"ping").unwrap();
        app.try_send(b"pong").unwrap();
        assert_eq!(app.try_recv().unwrap(), b"ping");
        assert_eq!(bsp.try_recv().unwrap(), b"pong");
    }

    #[test]
    fn test_varsize_roundtrip() {
        let (mut bsp, mut app) = pair();
        let buf: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();
        // Interleave: sender fills the ring, receiver drains, repeatedly.
        // Single-threaded here, so chunks must each fit the ring.
        let sender = std::thread::spawn(move || {
            bsp.send_blocking_varsize(&buf).unwrap();
            buf
        });
        let got = app.recv_blocking_varsize();
        let buf = sender.join().unwrap();
        assert_eq!(got, buf);
    }
}

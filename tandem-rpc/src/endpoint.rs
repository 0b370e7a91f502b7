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

//! In-core endpoint channels.
//!
//! The kernel mediates these: one endpoint per direction, a bounded receive
//! buffer with a single outstanding message, and capability transfer
//! integrated with the frame. This module models the endpoint buffer pair;
//! both ends hold a handle onto the shared kernel object.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use spin::Mutex;

use crate::{Frame, RpcError};

/// One outstanding message per direction, as the kernel enforces.
const ENDPOINT_DEPTH: usize = 1;

#[derive(Default)]
struct EndpointBuffer {
    queue: VecDeque<Frame>,
    closed: bool,
}

/// One end of a bidirectional endpoint channel.
pub struct EndpointChannel {
    tx: Arc<Mutex<EndpointBuffer>>,
    rx: Arc<Mutex<EndpointBuffer>>,
}

/// Creates a connected channel pair (server end, client end).
pub fn endpoint_pair() -> (EndpointChannel, EndpointChannel) {
    let a = Arc::new(Mutex::new(EndpointBuffer::default()));
    let b = Arc::new(Mutex::new(EndpointBuffer::default()));
    (
        EndpointChannel {
            tx: a.clone(),
            rx: b.clone(),
        },
        EndpointChannel { tx: b, rx: a },
    )
}

impl EndpointChannel {
    /// Queues a frame for the peer. Fails with `WouldBlock` while the peer
    /// has not consumed the previous message.
    pub fn try_send(&self, frame: Frame) -> Result<(), RpcError> {
        let mut buf = self.tx.lock();
        if buf.closed {
            return Err(RpcError::ChannelClosed);
        }
        if buf.queue.len() >= ENDPOINT_DEPTH {
            return Err(RpcError::WouldBlock);
        }
        buf.queue.push_back(frame);
        Ok(())
    }

    pub fn try_recv(&self) -> Result<Option<Frame>, RpcError> {
        let mut buf = self.rx.lock();
        if let Some(frame) = buf.queue.pop_front() {
            return Ok(Some(frame));
        }
        if buf.closed {
            return Err(RpcError::ChannelClosed);
        }
        Ok(None)
    }

    /// Whether a frame is waiting; used by the event loop to decide whether
    /// to dispatch this channel.
    pub fn has_frame(&self) -> bool { !self.rx.lock().queue.is_empty() }

    pub fn can_send(&self) -> bool {
        let buf = self.tx.lock();
        !buf.closed && buf.queue.len() < ENDPOINT_DEPTH
    }

    pub fn close(&self) {
        self.tx.lock().closed = true;
        self.rx.lock().closed = true;
    }

    /// Spins until the frame is accepted. Only used during boot and by
    /// client stubs, where no other work is pending.
    pub fn send_blocking(&self, frame: Frame) -> Result<(), RpcError> {
        let mut pending = Some(frame);
        loop {
            let mut buf = self.tx.lock();
            if buf.closed {
                return Err(RpcError::ChannelClosed);
            }
            if buf.queue.len() < ENDPOINT_DEPTH {
                buf.queue.push_back(pending.take().unwrap());
                return Ok(());
            }
            drop(buf);
            core::hint::spin_loop();
        }
    }

    /// Spins until a frame arrives.
    pub fn recv_blocking(&self) -> Result<Frame, RpcError> {
        loop {
            if let Some(frame) = self.try_recv()? {
                return Ok(frame);
            }
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_single_outstanding() {
        let (server, client) = endpoint_pair();
        client.try_send(Frame::new(vec![1])).unwrap();
        // Second send must block until the server drains.
        assert_eq!(client.try_send(Frame::new(vec![2])), Err(RpcError::WouldBlock));
        let got = server.try_recv().unwrap().unwrap();
        assert_eq!(got.bytes, vec![1]);
        client.try_send(Frame::new(vec![2])).unwrap();
        assert_eq!(server.try_recv().unwrap().unwrap().bytes, vec![2]);
        assert!(server.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_caps_ride_with_frame() {
        use tandem_os_common::capspace::CapRef;
        let (server, client) = endpoint_pair();
        let cap = CapRef::new(3, 7);
        client
            .try_send(Frame::with_caps(vec![0xab], vec![cap]))
            .unwrap();
        let got = server.try_recv().unwrap().unwrap();
        assert_eq!(got.caps, vec![cap]);
    }

    #[test]
    fn test_close() {
        let (server, client) = endpoint_pair();
        server.close();
        assert_eq!(client.try_send(Frame::new(vec![])), Err(RpcError::ChannelClosed));
        assert_eq!(client.try_recv(), Err(RpcError::ChannelClosed));
    }
}

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

//! Async multiplexer for the cross-core channel.
//!
//! Layers request/response semantics over the raw ring: callers enqueue
//! requests with completion metadata and return immediately; inbound
//! traffic is demultiplexed by a kind tag. Outbound requests and responses
//! sit in separate FIFOs and transmission alternates between them whenever
//! both are non-empty, so a flood of requests cannot starve replies.
//!
//! Correlation uses an opaque identifier drawn from a per-channel monotonic
//! counter. The remote side echoes it in the response, which the originator
//! matches against its in-flight table. Responses to a sender may complete
//! in a different order than the sends; a request and its response are
//! causally paired only by identifier.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tandem_os_common::capspace::CapTransfer;

use crate::ump::UmpChannel;
use crate::RpcError;

// NB: bounded by the ring message size together with the cap-slot budget.
pub const ASYNC_MAX_PAYLOAD: usize = 1024;
pub const ASYNC_MAX_CAPS: usize = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
enum WireKind {
    Request,
    Response,
}

#[derive(Serialize, Deserialize)]
struct AsyncMessage {
    identifier: u64,
    kind: WireKind,
    caps: Vec<CapTransfer>,
    payload: Vec<u8>,
}

struct OutboundRequest<M> {
    identifier: u64,
    payload: Vec<u8>,
    caps: Vec<CapTransfer>,
    meta: Option<M>,
}

/// A response owed to the peer; `identifier` echoes the request. The
/// record owns its buffers and caps, which are released after transmission.
pub struct OutboundResponse {
    pub identifier: u64,
    pub payload: Vec<u8>,
    pub caps: Vec<CapTransfer>,
}

/// An inbound event demultiplexed off the channel.
pub enum AsyncEvent<M> {
    /// The peer issued a request; answer via `respond` echoing `identifier`.
    Request {
        identifier: u64,
        payload: Vec<u8>,
        caps: Vec<CapTransfer>,
    },
    /// The peer answered one of our requests.
    Response {
        meta: M,
        payload: Vec<u8>,
        caps: Vec<CapTransfer>,
    },
}

pub struct AsyncChannel<M> {
    ump: UmpChannel,
    requests: VecDeque<OutboundRequest<M>>,
    responses: VecDeque<OutboundResponse>,
    current: WireKind,
    next_identifier: u64,
    inflight: HashMap<u64, M>,
}

impl<M> AsyncChannel<M> {
    pub fn new(ump: UmpChannel) -> Self {
        AsyncChannel {
            ump,
            requests: VecDeque::new(),
            responses: VecDeque::new(),
            current: WireKind::Request,
            next_identifier: 1,
            inflight: HashMap::new(),
        }
    }

    /// Enqueues a request and returns its identifier immediately. `meta`
    /// is handed back when the response arrives.
    pub fn request(&mut self, payload: Vec<u8>, caps: Vec<CapTransfer>, meta: M) -> u64 {
        assert!(payload.len() <= ASYNC_MAX_PAYLOAD);
        assert!(caps.len() <= ASYNC_MAX_CAPS);
        let identifier = self.next_identifier;
        log::trace!("async request {} ({} bytes, {} caps)", identifier, payload.len(), caps.len());
        self.next_identifier += 1;
        self.requests.push_back(OutboundRequest {
            identifier,
            payload,
            caps,
            meta: Some(meta),
        });
        self.pump();
        identifier
    }

    /// Enqueues a response to a previously received request.
    pub fn respond(&mut self, response: OutboundResponse) {
        assert!(response.payload.len() <= ASYNC_MAX_PAYLOAD);
        assert!(response.caps.len() <= ASYNC_MAX_CAPS);
        self.responses.push_back(response);
        self.pump();
    }

    /// Pushes queued traffic into the ring, alternating between the request
    /// and response FIFOs so neither starves. Called after every enqueue
    /// and from the event loop.
    pub fn pump(&mut self) {
        loop {
            if self.requests.is_empty() && self.responses.is_empty() {
                return;
            }
            if self.current == WireKind::Request && self.requests.is_empty() {
                self.current = WireKind::Response;
            }
            if self.current == WireKind::Response && self.responses.is_empty() {
                self.current = WireKind::Request;
            }
            let sent = match self.current {
                WireKind::Request => self.send_head_request(),
                WireKind::Response => self.send_head_response(),
            };
            if !sent {
                // Ring full; the event loop pumps again after the peer
                // drains.
                return;
            }
            self.current = match self.current {
                WireKind::Request => WireKind::Response,
                WireKind::Response => WireKind::Request,
            };
        }
    }

    fn send_msg(ump: &mut UmpChannel, msg: &AsyncMessage) -> bool {
        let bytes = postcard::to_allocvec(msg).expect("async message encode");
        match ump.try_send(&bytes) {
            Ok(()) => true,
            Err(RpcError::WouldBlock) => false,
            Err(e) => panic!("cross-core channel send failed: {:?}", e),
        }
    }

    fn send_head_request(&mut self) -> bool {
        let head = self.requests.front_mut().unwrap();
        let msg = AsyncMessage {
            identifier: head.identifier,
            kind: WireKind::Request,
            caps: core::mem::take(&mut head.caps),
            payload: core::mem::take(&mut head.payload),
        };
        if !Self::send_msg(&mut self.ump, &msg) {
            // Put the buffers back; we try again later.
            head.caps = msg.caps;
            head.payload = msg.payload;
            return false;
        }
        let head = self.requests.pop_front().unwrap();
        // The request record lives on until its response arrives.
        self.inflight
            .insert(head.identifier, head.meta.expect("request meta"));
        true
    }

    fn send_head_response(&mut self) -> bool {
        let head = self.responses.front_mut().unwrap();
        let msg = AsyncMessage {
            identifier: head.identifier,
            kind: WireKind::Response,
            caps: core::mem::take(&mut head.caps),
            payload: core::mem::take(&mut head.payload),
        };
        if !Self::send_msg(&mut self.ump, &msg) {
            head.caps = msg.caps;
            head.payload = msg.payload;
            return false;
        }
        // Transmitted: drop the record, releasing its buffers and caps.
        let _ = self.responses.pop_front();
        true
    }

    /// Demultiplexes one inbound message, if any.
    pub fn poll(&mut self) -> Option<AsyncEvent<M>> {
        let bytes = self.ump.try_recv()?;
        let msg: AsyncMessage =
            postcard::from_bytes(&bytes).expect("cross-core channel decode failed");
        match msg.kind {
            WireKind::Request => Some(AsyncEvent::Request {
                identifier: msg.identifier,
                payload: msg.payload,
                caps: msg.caps,
            }),
            WireKind::Response => {
                let meta = self
                    .inflight
                    .remove(&msg.identifier)
                    .unwrap_or_else(|| panic!("response for unknown request {}", msg.identifier));
                Some(AsyncEvent::Response {
                    meta,
                    payload: msg.payload,
                    caps: msg.caps,
                })
            }
        }
    }

    pub fn has_frame(&self) -> bool { self.ump.has_frame() }
    pub fn inflight_requests(&self) -> usize { self.inflight.len() }
    pub fn idle(&self) -> bool {
        self.requests.is_empty() && self.responses.is_empty() && self.inflight.is_empty()
    }
}

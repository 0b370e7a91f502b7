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

//! The per-core init domain and its event loop.
//!
//! Single-threaded and cooperative: each `poll` drains inbound frames from
//! the cross-core channel and every process channel, runs the delete-queue
//! driver, and fires expired timers. Handlers that suspend park a typed
//! record under an opaque token; completion paths look the token up and
//! transmit the stored reply route.

use alloc::vec::Vec;
use hashbrown::HashMap;
use log::{debug, warn};
use serde::Serialize;

use tandem_distcap_manager::engine::{DistCapEngine, EngineAction};
use tandem_distcap_manager::transfer::{cap_from_transfer, cap_transfer_move};
use tandem_memory_manager::RamAllocator;
use tandem_os_common::capspace::{CapRef, CapTransfer, NULL_CAP};
use tandem_os_common::deferred::DeferredQueue;
use tandem_os_common::error::ErrorCode;
use tandem_os_common::monitor::MonitorInterface;
use tandem_os_common::slot_allocator::CSpaceSlotAllocator;
use tandem_os_common::CoreId;
use tandem_proc_interface::{Pid, SpawnInterface};
use tandem_proc_manager::ProcessManager;
use tandem_rpc::async_channel::{AsyncChannel, AsyncEvent, OutboundResponse};
use tandem_rpc::endpoint::EndpointChannel;
use tandem_rpc::message;
use tandem_rpc::ump::UmpChannel;
use tandem_rpc::Frame;

use crate::console::Console;
use crate::network::NetworkState;
use crate::spawn::ChannelRegistry;

/// Uniform response buffer budget per request.
pub const SEND_BUF_BYTES: usize = 1024;

/// Where a reply goes once a handler finishes.
#[derive(Clone, Debug)]
pub enum ReplyRoute {
    /// Back over the process channel it arrived on.
    Endpoint(usize),
    /// Back over the cross-core channel, echoing the peer's identifier.
    CrossCore { identifier: u64 },
}

/// The uniform handler context: request bytes and caps, the reply route,
/// and the requesting process if the channel is bound to one.
#[derive(Clone, Debug)]
pub struct RpcContext {
    pub req: Vec<u8>,
    pub caps: Vec<CapRef>,
    pub reply: ReplyRoute,
    pub pid: Option<Pid>,
}

/// Parked work, keyed by an opaque token. Every suspension in the system
/// is one of these; each carries enough to finish.
pub(crate) enum Suspended {
    /// Reply bytes from the peer are copied back verbatim.
    Forwarded(RpcContext),
    /// Local half of an ALL_PIDS reply, awaiting the peer's half.
    AllPids { ctx: RpcContext, local: Vec<Pid> },
    /// Waiting for a process to exit.
    Wait(RpcContext),
    /// Waiting for the distributed cap engine.
    DistCap(RpcContext),
    /// Waiting for console input.
    Getchar(RpcContext),
    Getstr(RpcContext),
    /// Waiting for an echo reply or the timeout.
    Ping { ctx: RpcContext, ip: u32, start: u64 },
}

/// Completion metadata for cross-core requests we issued.
pub(crate) enum PendingReply {
    /// An engine sync round; the payload is a `DistCapResponse`.
    DistCapSync { token: u64 },
    /// A forwarded client request; payload copied back verbatim.
    Forwarded { token: u64 },
    /// The peer's half of an ALL_PIDS query.
    AllPidsMerge { token: u64 },
}

pub(crate) struct ProcessChannel {
    pub pid: Option<Pid>,
    pub chan: EndpointChannel,
}

pub struct InitDomain<S: SpawnInterface> {
    pub(crate) core: CoreId,
    pub(crate) mon: alloc::boxed::Box<dyn MonitorInterface + Send>,
    pub(crate) slots: CSpaceSlotAllocator,
    pub(crate) ram: RamAllocator,
    pub(crate) proc: ProcessManager<S>,
    pub(crate) engine: DistCapEngine,
    pub(crate) cross_core: AsyncChannel<PendingReply>,
    pub(crate) channels: Vec<ProcessChannel>,
    pub(crate) registry: ChannelRegistry,
    /// Client ends of spawned-process channels, until the child claims
    /// them (or a test drives the child).
    clients: Vec<(Pid, EndpointChannel)>,
    pub(crate) pending: HashMap<u64, Suspended>,
    pub(crate) next_token: u64,
    pub(crate) console: Console,
    pub(crate) network: NetworkState,
    pub(crate) deferred: DeferredQueue,
    pub(crate) ticks: u64,
}

impl<S: SpawnInterface> InitDomain<S> {
    pub fn new(
        core: CoreId,
        mon: alloc::boxed::Box<dyn MonitorInterface + Send>,
        ram: RamAllocator,
        proc: ProcessManager<S>,
        registry: ChannelRegistry,
        ump: UmpChannel,
    ) -> Self {
        let mut slots = CSpaceSlotAllocator::default();
        let tempcap = slots.alloc(1).expect("tempcap slot");
        InitDomain {
            core,
            mon,
            slots,
            ram,
            proc,
            engine: DistCapEngine::new(tempcap),
            cross_core: AsyncChannel::new(ump),
            channels: Vec::new(),
            registry,
            clients: Vec::new(),
            pending: HashMap::new(),
            next_token: 1,
            console: Console::new(),
            network: NetworkState::new(),
            deferred: DeferredQueue::new(),
            ticks: 0,
        }
    }

    pub fn core(&self) -> CoreId { self.core }
    pub fn ram(&self) -> &RamAllocator { &self.ram }
    pub fn proc(&self) -> &ProcessManager<S> { &self.proc }
    pub fn console(&self) -> &Console { &self.console }

    /// Registers a served channel; `pid` binds it to a process.
    pub fn add_channel(&mut self, pid: Option<Pid>, chan: EndpointChannel) -> usize {
        self.channels.push(ProcessChannel { pid, chan });
        self.channels.len() - 1
    }

    /// Client end of the channel spawned for `pid`, for handing to the
    /// child.
    pub fn take_client(&mut self, pid: Pid) -> Option<EndpointChannel> {
        let idx = self.clients.iter().position(|(p, _)| *p == pid)?;
        Some(self.clients.remove(idx).1)
    }

    pub(crate) fn alloc_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    /// One turn of the event loop. Returns whether any event fired.
    pub fn poll(&mut self) -> bool {
        let mut did_work = false;

        // Adopt channels of freshly spawned children.
        for (pid, server, client) in self.registry.drain() {
            self.add_channel(Some(pid), server);
            self.clients.push((pid, client));
        }

        // Cross-core traffic.
        while let Some(event) = self.cross_core.poll() {
            self.on_async_event(event);
            did_work = true;
        }

        // Process channels; one frame each per turn keeps things fair.
        for idx in 0..self.channels.len() {
            let frame = match self.channels[idx].chan.try_recv() {
                Ok(Some(frame)) => frame,
                _ => continue,
            };
            let ctx = RpcContext {
                req: frame.bytes,
                caps: frame.caps,
                reply: ReplyRoute::Endpoint(idx),
                pid: self.channels[idx].pid,
            };
            self.dispatch(ctx);
            did_work = true;
        }

        // The delete-step driver finishes staged cleanups.
        let actions = self.engine.tick(self.mon.as_mut());
        if !actions.is_empty() {
            did_work = true;
        }
        self.apply_engine_actions(actions);

        // Timers.
        self.ticks += 1;
        for token in self.deferred.expire(self.ticks) {
            self.on_timeout(token);
            did_work = true;
        }

        self.cross_core.pump();
        did_work
    }

    /// Encodes a response body and transmits it on `route`.
    pub(crate) fn respond<T: Serialize>(&mut self, ctx: &RpcContext, body: &T) {
        let bytes = message::encode_response(body).expect("response encode");
        debug_assert!(bytes.len() <= SEND_BUF_BYTES);
        self.transmit(&ctx.reply, bytes, Vec::new());
    }

    pub(crate) fn respond_with_caps<T: Serialize>(
        &mut self,
        ctx: &RpcContext,
        body: &T,
        caps: Vec<CapRef>,
    ) {
        let bytes = message::encode_response(body).expect("response encode");
        self.transmit(&ctx.reply, bytes, caps);
    }

    pub(crate) fn transmit(&mut self, route: &ReplyRoute, bytes: Vec<u8>, caps: Vec<CapRef>) {
        match route {
            ReplyRoute::Endpoint(idx) => {
                // The client is blocked on this reply; its buffer is free.
                if let Err(e) = self.channels[*idx].chan.try_send(Frame::with_caps(bytes, caps)) {
                    warn!("dropping reply on channel {}: {:?}", idx, e);
                }
            }
            ReplyRoute::CrossCore { identifier } => {
                let transfers = self.encode_caps(caps);
                self.cross_core.respond(OutboundResponse {
                    identifier: *identifier,
                    payload: bytes,
                    caps: transfers,
                });
            }
        }
    }

    /// Serialises caps for the shared-memory channel; the local slots are
    /// nullified (moved) and returned to the allocator.
    fn encode_caps(&mut self, caps: Vec<CapRef>) -> Vec<CapTransfer> {
        caps.into_iter()
            .map(|cap| {
                if cap.is_null() {
                    return CapTransfer::INVALID;
                }
                let t = cap_transfer_move(self.mon.as_mut(), cap).expect("cap transfer");
                self.slots.free(cap, 1);
                t
            })
            .collect()
    }

    /// Reconstructs received cap transfers into fresh local slots.
    pub(crate) fn decode_caps(&mut self, transfers: &[CapTransfer]) -> Vec<CapRef> {
        transfers
            .iter()
            .map(|t| {
                if !t.is_valid() {
                    return NULL_CAP;
                }
                let slot = self.slots.alloc(1).expect("slot_alloc");
                cap_from_transfer(self.mon.as_mut(), t, slot).expect("cap_from_transfer");
                slot
            })
            .collect()
    }

    /// Re-issues the request on the cross-core channel and parks the
    /// context; the peer's reply is copied into the original reply route.
    pub(crate) fn rpc_transmit(&mut self, mut ctx: RpcContext) {
        let payload = ctx.req.clone();
        let caps = core::mem::take(&mut ctx.caps);
        let transfers = self.encode_caps(caps);
        let token = self.alloc_token();
        self.pending.insert(token, Suspended::Forwarded(ctx));
        self.cross_core
            .request(payload, transfers, PendingReply::Forwarded { token });
    }

    /// Like `rpc_transmit`, but with rewritten request bytes (e.g. a
    /// retargeted core field).
    pub(crate) fn rpc_transmit_bytes(&mut self, mut ctx: RpcContext, payload: Vec<u8>) {
        let caps = core::mem::take(&mut ctx.caps);
        let transfers = self.encode_caps(caps);
        let token = self.alloc_token();
        self.pending.insert(token, Suspended::Forwarded(ctx));
        self.cross_core
            .request(payload, transfers, PendingReply::Forwarded { token });
    }

    /// Forwards an ALL_PIDS query, remembering the local half for the
    /// merge.
    pub(crate) fn forward_all_pids(
        &mut self,
        ctx: RpcContext,
        payload: Vec<u8>,
        local: Vec<Pid>,
    ) {
        let token = self.alloc_token();
        self.pending.insert(token, Suspended::AllPids { ctx, local });
        self.cross_core
            .request(payload, Vec::new(), PendingReply::AllPidsMerge { token });
    }

    fn on_async_event(&mut self, event: AsyncEvent<PendingReply>) {
        match event {
            AsyncEvent::Request {
                identifier,
                payload,
                caps,
            } => {
                let caps = self.decode_caps(&caps);
                let ctx = RpcContext {
                    req: payload,
                    caps,
                    reply: ReplyRoute::CrossCore { identifier },
                    pid: None,
                };
                self.dispatch(ctx);
            }
            AsyncEvent::Response {
                meta,
                payload,
                caps,
            } => match meta {
                PendingReply::DistCapSync { token } => {
                    let res: tandem_distcap_interface::DistCapResponse =
                        message::decode_response(&payload).expect("sync response decode");
                    let actions =
                        self.engine
                            .on_sync_reply(self.mon.as_mut(), token, res.err);
                    self.apply_engine_actions(actions);
                }
                PendingReply::Forwarded { token } => {
                    let caps = self.decode_caps(&caps);
                    match self.pending.remove(&token) {
                        Some(Suspended::Forwarded(ctx)) => {
                            self.transmit(&ctx.reply, payload, caps)
                        }
                        _ => panic!("forwarded reply for unknown token {}", token),
                    }
                }
                PendingReply::AllPidsMerge { token } => match self.pending.remove(&token) {
                    Some(Suspended::AllPids { ctx, local }) => {
                        self.finish_all_pids(ctx, local, &payload)
                    }
                    _ => panic!("all-pids reply for unknown token {}", token),
                },
            },
        }
    }

    pub(crate) fn apply_engine_actions(&mut self, actions: Vec<EngineAction>) {
        for action in actions {
            match action {
                EngineAction::SendSync { token, request } => {
                    let payload =
                        message::encode_request(message::RequestKind::DistCap, &request)
                            .expect("sync encode");
                    self.cross_core
                        .request(payload, Vec::new(), PendingReply::DistCapSync { token });
                }
                EngineAction::Reply { ctx, err } => match self.pending.remove(&ctx) {
                    Some(Suspended::DistCap(rpc)) => {
                        self.respond(
                            &rpc,
                            &tandem_distcap_interface::DistCapResponse { err },
                        );
                    }
                    _ => panic!("engine reply for unknown ctx {}", ctx),
                },
                EngineAction::FreeRam { base, bytes } => {
                    debug!("reclaimed ram [{:#x}, {:#x})", base, base + bytes);
                    if let Err(e) = self.ram.free(base, bytes) {
                        warn!("freeing reclaimed ram failed: {:?}", e);
                    }
                }
            }
        }
    }

    fn on_timeout(&mut self, token: u64) {
        match self.pending.remove(&token) {
            Some(Suspended::Ping { ctx, ip, .. }) => {
                let _ = self.network.ping_resolved(ip);
                self.respond(
                    &ctx,
                    &crate::wire::NetworkPingResponse {
                        err: ErrorCode::Timeout,
                        ping_ms: 0,
                    },
                );
            }
            Some(_) => panic!("timeout for non-timed suspension {}", token),
            None => {} // resolved before the deadline
        }
    }

    /// Feeds serial input (from the UART driver) and completes any parked
    /// terminal reads.
    pub fn push_serial_input(&mut self, bytes: &[u8]) {
        for (token, data) in self.console.push_input(bytes) {
            match self.pending.remove(&token) {
                Some(Suspended::Getchar(ctx)) => {
                    let c = data.chars().next();
                    self.respond(
                        &ctx,
                        &crate::wire::TerminalResponse {
                            err: ErrorCode::Ok,
                            c,
                        },
                    );
                }
                Some(Suspended::Getstr(ctx)) => {
                    self.respond(
                        &ctx,
                        &crate::wire::TerminalStrResponse {
                            err: ErrorCode::Ok,
                            len: data.len(),
                            s: data,
                        },
                    );
                }
                _ => panic!("console completion for unknown token {}", token),
            }
        }
    }

    /// True once nothing is parked or in flight; used by orderly tests.
    pub fn quiescent(&self) -> bool {
        self.pending.is_empty() && self.engine.idle() && self.cross_core.idle()
    }
}

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

//! The distributed capability state machines.
//!
//! Each client operation runs as a little transaction against both cores.
//! The engine never blocks: every step either completes or parks a suspend
//! record (waiting on the caplock, the peer's sync reply, or the delete
//! queue) and emits actions for the caller to carry out: transmit a sync
//! request, resume a suspended RPC, return reclaimed RAM. The caller feeds
//! peer replies and queue drains back in.
//!
//! A locked capability is never reported to the client; contenders wait on
//! the caplock queue and retry. Sync-protocol violations panic: they mean
//! the two capability databases have already diverged.

use alloc::vec::Vec;
use hashbrown::HashMap;

use tandem_distcap_interface::{
    DeleteSync, DeleteSyncOp, DistCapRequest, RetypeSync, RevokeSync,
};
use tandem_os_common::capspace::{CapRef, DomCapRef, ObjType, Relations};
use tandem_os_common::error::ErrorCode;
use tandem_os_common::monitor::{CapError, DeleteLast, MonitorInterface};
use tandem_os_common::peer_core;

/// Work the caller must perform on the engine's behalf.
#[derive(Debug, Eq, PartialEq)]
pub enum EngineAction {
    /// Transmit a sync request to the peer; its reply comes back through
    /// `on_sync_reply` with the same token.
    SendSync {
        token: u64,
        request: DistCapRequest,
    },
    /// Resume the suspended RPC identified by `ctx` with this result.
    Reply { ctx: u64, err: ErrorCode },
    /// Return reclaimed RAM to the allocator.
    FreeRam { base: u64, bytes: u64 },
}

#[derive(Clone, Debug)]
pub struct RetypeParams {
    pub src: DomCapRef,
    pub dest: DomCapRef,
    pub offset: u64,
    pub new_type: ObjType,
    pub objsize: u64,
    pub count: u64,
}

enum Suspend {
    // Parked on the caplock queue; the step is retried on wake.
    LockDelete {
        ctx: u64,
        cap: DomCapRef,
        sync: DeleteSync,
    },
    LockRevoke {
        ctx: u64,
        cap: DomCapRef,
        sync: RevokeSync,
    },
    LockRetype {
        ctx: u64,
        params: RetypeParams,
    },
    // Waiting for the peer's sync reply.
    SyncDelete {
        ctx: u64,
        cap: DomCapRef,
        sync: DeleteSync,
    },
    SyncRevoke {
        ctx: u64,
        cap: DomCapRef,
        sync: RevokeSync,
    },
    SyncRetype {
        ctx: u64,
        params: RetypeParams,
    },
    // Waiting for the delete queue to drain, then reply.
    QueueReply { ctx: u64, err: ErrorCode },
}

pub struct DistCapEngine {
    /// Scratch slot for materialising peer identities.
    tempcap: CapRef,
    suspends: HashMap<u64, Suspend>,
    next_token: u64,
    caplock: crate::caplock::CapLockQueue,
    delete_queue: crate::deletestep::DeleteQueue,
    /// Waiters woken by an unlock; their lock step re-runs from the event
    /// loop, after the unlocking transaction finished its local work.
    retries: Vec<u64>,
}

impl DistCapEngine {
    pub fn new(tempcap: CapRef) -> Self {
        DistCapEngine {
            tempcap,
            suspends: HashMap::new(),
            next_token: 1,
            caplock: crate::caplock::CapLockQueue::new(),
            delete_queue: crate::deletestep::DeleteQueue::new(),
            retries: Vec::new(),
        }
    }

    pub fn idle(&self) -> bool {
        self.suspends.is_empty()
            && self.caplock.is_empty()
            && self.delete_queue.is_empty()
            && self.retries.is_empty()
    }

    fn park(&mut self, suspend: Suspend) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        self.suspends.insert(token, suspend);
        token
    }

    /// Deletes the (locally last) copy at `cap`, returning reclaimed RAM.
    fn delete_last(
        &mut self,
        mon: &mut dyn MonitorInterface,
        cap: DomCapRef,
        actions: &mut Vec<EngineAction>,
    ) {
        match mon.delete_last(cap, self.tempcap) {
            Ok(DeleteLast::Done) => {}
            Ok(DeleteLast::RamCapCreated) => {
                let ram = mon
                    .cap_identify(self.tempcap.into())
                    .expect("identify reclaimed ram");
                mon.nullify_cap(self.tempcap.into()).expect("nullify tempcap");
                actions.push(EngineAction::FreeRam {
                    base: ram.base,
                    bytes: ram.bytes,
                });
            }
            Err(e) => panic!("delete_last {}: {:?}", cap, e),
        }
    }

    /// Client-facing delete of `cap`.
    pub fn handle_delete(
        &mut self,
        mon: &mut dyn MonitorInterface,
        ctx: u64,
        cap: DomCapRef,
    ) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        let desc = match mon.cap_identify(cap) {
            Ok(d) if !d.is_null() => d,
            _ => {
                actions.push(EngineAction::Reply {
                    ctx,
                    err: ErrorCode::NotFound,
                });
                return actions;
            }
        };
        crate::debug_capops!("delete request for {} {:?}", cap, desc);

        let remote = mon
            .remote_relations(cap, Relations::EMPTY, Relations::EMPTY)
            .expect("remote_relations");
        let local = mon
            .cap_has_relations(cap, Relations::ALL)
            .expect("cap_has_relations");

        if local.contains(Relations::COPY) {
            // Other local copies remain; deleting this one changes nothing
            // the peer can observe.
            mon.nullify_cap(cap).expect("nullify");
            let token = self.park(Suspend::QueueReply {
                ctx,
                err: ErrorCode::Ok,
            });
            self.delete_queue.wait(token);
            return actions;
        }

        if !remote.contains(Relations::COPY) {
            // No remote copies either: delete outright, reclaiming RAM.
            self.delete_last(mon, cap, &mut actions);
            let token = self.park(Suspend::QueueReply {
                ctx,
                err: ErrorCode::Ok,
            });
            self.delete_queue.wait(token);
            return actions;
        }

        // The last local copy with remote copies outstanding: synchronise.
        let owner = mon.get_cap_owner(cap).expect("get_cap_owner");
        let op = if owner == mon.core_id() {
            if desc.type_.is_moveable() {
                DeleteSyncOp::MoveOwner
            } else {
                DeleteSyncOp::DeleteForeigns
            }
        } else {
            DeleteSyncOp::LastNonowner
        };
        crate::debug_capops!("delete: remote copies exist, sync op {:?}", op);
        let sync = DeleteSync { desc, owner, op };
        let token = self.park(Suspend::LockDelete { ctx, cap, sync });
        self.step_lock(mon, token, &mut actions);
        actions
    }

    /// Client-facing revoke of `cap`.
    pub fn handle_revoke(
        &mut self,
        mon: &mut dyn MonitorInterface,
        ctx: u64,
        cap: DomCapRef,
    ) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        let desc = match mon.cap_identify(cap) {
            Ok(d) if !d.is_null() => d,
            _ => {
                actions.push(EngineAction::Reply {
                    ctx,
                    err: ErrorCode::NotFound,
                });
                return actions;
            }
        };
        crate::debug_capops!("revoke request for {} {:?}", cap, desc);

        let remote = mon
            .remote_relations(cap, Relations::EMPTY, Relations::EMPTY)
            .expect("remote_relations");
        if !remote.intersects(Relations::COPY | Relations::DESC) {
            // Nothing of this capability lives on the peer.
            mon.revoke_mark_target(cap).expect("revoke_mark_target");
            let token = self.park(Suspend::QueueReply {
                ctx,
                err: ErrorCode::Ok,
            });
            self.delete_queue.wait(token);
            return actions;
        }

        let owner = mon.get_cap_owner(cap).expect("get_cap_owner");
        let sync = RevokeSync { desc, owner };
        let token = self.park(Suspend::LockRevoke { ctx, cap, sync });
        self.step_lock(mon, token, &mut actions);
        actions
    }

    /// Client-facing retype of `params.src` into `params.dest`.
    pub fn handle_retype(
        &mut self,
        mon: &mut dyn MonitorInterface,
        ctx: u64,
        params: RetypeParams,
    ) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        crate::debug_capops!("retype request for {}", params.src);
        let token = self.park(Suspend::LockRetype { ctx, params });
        self.step_lock(mon, token, &mut actions);
        actions
    }

    /// Takes (or retries) the cap lock for the parked operation `token`.
    fn step_lock(
        &mut self,
        mon: &mut dyn MonitorInterface,
        token: u64,
        actions: &mut Vec<EngineAction>,
    ) {
        let cap = match self.suspends.get(&token) {
            Some(Suspend::LockDelete { cap, .. }) | Some(Suspend::LockRevoke { cap, .. }) => *cap,
            Some(Suspend::LockRetype { params, .. }) => params.src,
            _ => panic!("lock step for token {} in wrong state", token),
        };
        match mon.lock_cap(cap) {
            Ok(()) => self.locked(mon, token, actions),
            Err(CapError::Locked) => {
                // Someone else is mid-transaction; retry on wake.
                self.caplock.wait(cap, token);
            }
            Err(CapError::NotFound) => {
                // The cap vanished while we waited (e.g. a contending
                // delete won). Report what the client would now observe.
                let ctx = self.take_ctx(token);
                actions.push(EngineAction::Reply {
                    ctx,
                    err: ErrorCode::NotFound,
                });
            }
            Err(e) => panic!("lock_cap {}: {:?}", cap, e),
        }
    }

    /// The lock is held; transmit the sync request.
    fn locked(
        &mut self,
        mon: &mut dyn MonitorInterface,
        token: u64,
        actions: &mut Vec<EngineAction>,
    ) {
        let suspend = self.suspends.remove(&token).unwrap();
        match suspend {
            Suspend::LockDelete { ctx, cap, sync } => {
                let request = DistCapRequest::DeleteSync(sync);
                self.suspends
                    .insert(token, Suspend::SyncDelete { ctx, cap, sync });
                actions.push(EngineAction::SendSync { token, request });
            }
            Suspend::LockRevoke { ctx, cap, sync } => {
                let request = DistCapRequest::RevokeSync(sync);
                self.suspends
                    .insert(token, Suspend::SyncRevoke { ctx, cap, sync });
                actions.push(EngineAction::SendSync { token, request });
            }
            Suspend::LockRetype { ctx, params } => {
                // The lock ensures the slot is still occupied.
                let desc = mon.cap_identify(params.src).expect("identify retype src");
                let owner = mon.get_cap_owner(params.src).expect("get_cap_owner");
                // Check our own half before bothering the peer.
                if let Err(e) =
                    mon.is_retypeable(&desc, params.offset, params.objsize, params.count as usize)
                {
                    self.caplock_unlock(mon, params.src);
                    actions.push(EngineAction::Reply { ctx, err: e.into() });
                    return;
                }
                let sync = RetypeSync {
                    desc,
                    owner,
                    offset: params.offset,
                    objsize: params.objsize,
                    count: params.count,
                };
                let request = DistCapRequest::RetypeSync(sync);
                self.suspends
                    .insert(token, Suspend::SyncRetype { ctx, params });
                actions.push(EngineAction::SendSync { token, request });
            }
            _ => panic!("locked step for token {} in wrong state", token),
        }
    }

    fn take_ctx(&mut self, token: u64) -> u64 {
        match self.suspends.remove(&token) {
            Some(Suspend::LockDelete { ctx, .. })
            | Some(Suspend::LockRevoke { ctx, .. })
            | Some(Suspend::LockRetype { ctx, .. })
            | Some(Suspend::SyncDelete { ctx, .. })
            | Some(Suspend::SyncRevoke { ctx, .. })
            | Some(Suspend::SyncRetype { ctx, .. })
            | Some(Suspend::QueueReply { ctx, .. }) => ctx,
            None => panic!("no suspend for token {}", token),
        }
    }

    /// Unlocks `cap` and schedules one parked contender to retry its lock
    /// step on the next driver tick.
    fn caplock_unlock(&mut self, mon: &mut dyn MonitorInterface, cap: DomCapRef) {
        if let Some(waiter) = self.caplock.unlock(mon, cap) {
            self.retries.push(waiter);
        }
    }

    /// The peer answered the sync request `token`.
    pub fn on_sync_reply(
        &mut self,
        mon: &mut dyn MonitorInterface,
        token: u64,
        err: ErrorCode,
    ) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        match self.suspends.remove(&token) {
            Some(Suspend::SyncDelete { ctx, cap, sync }) => {
                if err.is_err() {
                    panic!("delete failed on remote core: {:?}", err);
                }
                self.caplock_unlock(mon, cap);
                match sync.op {
                    DeleteSyncOp::MoveOwner | DeleteSyncOp::LastNonowner => {
                        // The peer took over (or dropped its view of) the
                        // cap; only the local slot remains.
                        mon.nullify_cap(cap).expect("nullify");
                        actions.push(EngineAction::Reply {
                            ctx,
                            err: ErrorCode::Ok,
                        });
                    }
                    DeleteSyncOp::DeleteForeigns => {
                        // Every foreign copy is gone; finish locally.
                        self.delete_last(mon, cap, &mut actions);
                        let qtoken = self.park(Suspend::QueueReply {
                            ctx,
                            err: ErrorCode::Ok,
                        });
                        self.delete_queue.wait(qtoken);
                    }
                }
            }
            Some(Suspend::SyncRevoke { ctx, cap, sync }) => {
                if err.is_err() {
                    panic!("revoke failed on remote core: {:?}", err);
                }
                self.caplock_unlock(mon, cap);
                if sync.owner == mon.core_id() {
                    mon.revoke_mark_target(cap).expect("revoke_mark_target");
                } else {
                    mon.revoke_mark_relations(&sync.desc)
                        .expect("revoke_mark_relations");
                }
                let qtoken = self.park(Suspend::QueueReply {
                    ctx,
                    err: ErrorCode::Ok,
                });
                self.delete_queue.wait(qtoken);
            }
            Some(Suspend::SyncRetype { ctx, params }) => {
                self.caplock_unlock(mon, params.src);
                if err.is_err() {
                    // The peer's half failed; forward its verdict verbatim.
                    actions.push(EngineAction::Reply { ctx, err });
                    return actions;
                }
                let err = match mon.retype_remote_cap(
                    params.dest,
                    params.src,
                    params.offset,
                    params.new_type,
                    params.objsize,
                    params.count as usize,
                ) {
                    Ok(()) => ErrorCode::Ok,
                    Err(e) => e.into(),
                };
                actions.push(EngineAction::Reply { ctx, err });
            }
            _ => panic!("sync reply for token {} in wrong state", token),
        }
        actions
    }

    /// Peer side of the sync protocol; `ctx` names the reply to send.
    pub fn handle_sync(
        &mut self,
        mon: &mut dyn MonitorInterface,
        ctx: u64,
        request: &DistCapRequest,
    ) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        match request {
            DistCapRequest::DeleteSync(sync) => {
                crate::debug_capops!("delete sync, owner {} op {:?}", sync.owner, sync.op);
                mon.cap_create(self.tempcap, &sync.desc, sync.owner)
                    .expect("cap_create");
                let owner = mon
                    .get_cap_owner(self.tempcap.into())
                    .expect("get_cap_owner");
                match sync.op {
                    DeleteSyncOp::MoveOwner => {
                        assert_eq!(owner, peer_core(mon.core_id()), "bad owner in move");
                        mon.set_cap_owner(self.tempcap.into(), mon.core_id())
                            .expect("set_cap_owner");
                        // The initiator nullifies its slot on our reply.
                        mon.remote_relations(
                            self.tempcap.into(),
                            Relations::EMPTY,
                            Relations::COPY,
                        )
                        .expect("remote_relations");
                    }
                    DeleteSyncOp::DeleteForeigns => {
                        assert_eq!(owner, peer_core(mon.core_id()), "bad owner in delete");
                        mon.delete_foreigns(self.tempcap).expect("delete_foreigns");
                    }
                    DeleteSyncOp::LastNonowner => {
                        assert_eq!(owner, mon.core_id(), "bad owner in nonowner delete");
                        mon.remote_relations(
                            self.tempcap.into(),
                            Relations::EMPTY,
                            Relations::COPY,
                        )
                        .expect("remote_relations");
                    }
                }
                if sync.op != DeleteSyncOp::DeleteForeigns {
                    mon.nullify_cap(self.tempcap.into()).expect("nullify tempcap");
                }
                actions.push(EngineAction::Reply {
                    ctx,
                    err: ErrorCode::Ok,
                });
            }
            DistCapRequest::RevokeSync(sync) => {
                crate::debug_capops!("revoke sync, owner {}", sync.owner);
                if sync.owner != mon.core_id() {
                    mon.revoke_mark_relations(&sync.desc)
                        .expect("revoke_mark_relations");
                } else {
                    mon.cap_create(self.tempcap, &sync.desc, sync.owner)
                        .expect("cap_create");
                    mon.revoke_mark_target(self.tempcap.into())
                        .expect("revoke_mark_target");
                    mon.nullify_cap(self.tempcap.into()).expect("nullify tempcap");
                }
                let qtoken = self.park(Suspend::QueueReply {
                    ctx,
                    err: ErrorCode::Ok,
                });
                self.delete_queue.wait(qtoken);
            }
            DistCapRequest::RetypeSync(sync) => {
                crate::debug_capops!("retype sync");
                match mon.is_retypeable(
                    &sync.desc,
                    sync.offset,
                    sync.objsize,
                    sync.count as usize,
                ) {
                    Ok(()) => {
                        // Record that descendants now exist on the peer.
                        mon.cap_create(self.tempcap, &sync.desc, sync.owner)
                            .expect("cap_create");
                        mon.remote_relations(
                            self.tempcap.into(),
                            Relations::DESC,
                            Relations::DESC,
                        )
                        .expect("remote_relations");
                        mon.nullify_cap(self.tempcap.into()).expect("nullify tempcap");
                        actions.push(EngineAction::Reply {
                            ctx,
                            err: ErrorCode::Ok,
                        });
                    }
                    Err(e) => actions.push(EngineAction::Reply { ctx, err: e.into() }),
                }
            }
            _ => panic!("non-sync request routed to the sync handler"),
        }
        actions
    }

    /// Runs the deferred work owned by the event loop: woken caplock
    /// waiters retry their lock step and the delete driver's pending batch
    /// completes.
    pub fn tick(&mut self, mon: &mut dyn MonitorInterface) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        for token in core::mem::take(&mut self.retries) {
            self.step_lock(mon, token, &mut actions);
        }
        for token in self.delete_queue.drain() {
            match self.suspends.remove(&token) {
                Some(Suspend::QueueReply { ctx, err }) => {
                    actions.push(EngineAction::Reply { ctx, err })
                }
                _ => panic!("delete queue token {} in wrong state", token),
            }
        }
        actions
    }
}

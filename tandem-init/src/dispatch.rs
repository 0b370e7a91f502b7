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

//! Request dispatch.
//!
//! Every inbound frame leads with a request-kind tag; the dispatcher
//! decodes it and hands the body to the matching handler. Handlers either
//! answer on the spot or park the context and answer when their
//! prerequisite completes. Any handler may discover the request belongs to
//! the other core and re-transmit it over the cross-core channel; the
//! peer's reply is copied back onto the original route, so services can
//! live on whichever core is convenient.

use alloc::string::String;
use alloc::vec::Vec;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;

use tandem_distcap_interface::{DistCapRequest, DistCapResponse};
use tandem_distcap_manager::engine::RetypeParams;
use tandem_memory_interface::{MemServerRequest, MemServerResponse, PER_PROCESS_MEMORY_LIMIT};
use tandem_os_common::bootinfo::parse_args;
use tandem_os_common::capspace::NULL_CAP;
use tandem_os_common::error::ErrorCode;
use tandem_os_common::{peer_core, BASE_PAGE_SIZE};
use tandem_proc_interface::{
    pid_core, AllPidsResponse, Pid, ProcMgmtOp, ProcMgmtRequest, ProcMgmtResponse, SpawnInterface,
    StatusResponse, WaitResponse,
};
use tandem_proc_manager::{TeardownNotice, WaitOutcome};
use tandem_rpc::message::{self, RequestKind};

use crate::domain::{InitDomain, ReplyRoute, RpcContext, Suspended, SEND_BUF_BYTES};
use crate::network::PING_TIMEOUT_TICKS;
use crate::wire::*;

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, ErrorCode> {
    message::decode_body(body).map_err(ErrorCode::from)
}

impl<S: SpawnInterface> InitDomain<S> {
    /// Routes one request frame.
    pub(crate) fn dispatch(&mut self, ctx: RpcContext) {
        let (kind, body) = match message::decode_kind(&ctx.req) {
            Ok(split) => split,
            Err(_) => {
                warn!("undecodable request frame ({} bytes)", ctx.req.len());
                self.respond(&ctx, &GenericResponse {
                    err: ErrorCode::DeserializeFailed,
                });
                return;
            }
        };
        match kind {
            RequestKind::GenericNumber => match decode::<GenericNumberRequest>(body) {
                Ok(req) => {
                    info!("{} was sent via the number rpc", req.val);
                    self.respond(&ctx, &GenericResponse { err: ErrorCode::Ok });
                }
                Err(err) => self.respond(&ctx, &GenericResponse { err }),
            },
            RequestKind::GenericString => match decode::<GenericStringRequest>(body) {
                Ok(req) => {
                    info!("\"{}\" was sent via the string rpc", req.msg);
                    self.respond(&ctx, &GenericResponse { err: ErrorCode::Ok });
                }
                Err(err) => self.respond(&ctx, &GenericResponse { err }),
            },
            RequestKind::SetupChannel => match decode::<SetupChannelRequest>(body) {
                Ok(req) => self.handle_setup_channel(ctx, req),
                Err(err) => self.respond(&ctx, &GenericResponse { err }),
            },
            RequestKind::MemServer => match decode::<MemServerRequest>(body) {
                Ok(req) => self.handle_memserver(ctx, req),
                Err(err) => self.respond(&ctx, &MemServerResponse { err, retbytes: 0 }),
            },
            RequestKind::Terminal => match decode::<TerminalRequest>(body) {
                Ok(req) => self.handle_terminal(ctx, req),
                Err(err) => self.respond(&ctx, &TerminalResponse { err, c: None }),
            },
            RequestKind::TerminalStr => match decode::<TerminalStrRequest>(body) {
                Ok(req) => self.handle_terminal_str(ctx, req),
                Err(err) => self.respond(&ctx, &TerminalStrResponse {
                    err,
                    len: 0,
                    s: String::new(),
                }),
            },
            RequestKind::ProcMgmt => match decode::<ProcMgmtRequest>(body) {
                Ok(req) => self.handle_proc_mgmt(ctx, req),
                Err(err) => self.respond(&ctx, &ProcMgmtResponse {
                    err,
                    ..Default::default()
                }),
            },
            RequestKind::Filesystem => self.handle_filesystem(ctx),
            RequestKind::TestSuite => match decode::<TestSuiteRequest>(body) {
                Ok(req) => {
                    info!(
                        "test suite: {} tests, quick={} verbose={}",
                        req.tests.len(),
                        req.quick,
                        req.verbose
                    );
                    self.respond(&ctx, &GenericResponse { err: ErrorCode::Ok });
                }
                Err(err) => self.respond(&ctx, &GenericResponse { err }),
            },
            RequestKind::DistCap => match decode::<DistCapRequest>(body) {
                Ok(req) => self.handle_distcap(ctx, req),
                Err(err) => self.respond(&ctx, &DistCapResponse { err }),
            },
            RequestKind::Network => match decode::<NetworkRequest>(body) {
                Ok(req) => self.handle_network(ctx, req),
                Err(err) => self.respond(&ctx, &GenericResponse { err }),
            },
        }
    }

    fn handle_setup_channel(&mut self, ctx: RpcContext, req: SetupChannelRequest) {
        match ctx.reply {
            ReplyRoute::Endpoint(idx) => {
                debug!("channel {} bound to pid {}", idx, req.pid);
                self.channels[idx].pid = Some(req.pid);
                self.respond(&ctx, &GenericResponse { err: ErrorCode::Ok });
            }
            ReplyRoute::CrossCore { .. } => {
                self.respond(&ctx, &GenericResponse {
                    err: ErrorCode::InvalidArgs,
                });
            }
        }
    }

    fn handle_memserver(&mut self, ctx: RpcContext, req: MemServerRequest) {
        // The memory server lives on core 0.
        if self.core != 0 {
            return self.rpc_transmit(ctx);
        }
        if req.alignment != BASE_PAGE_SIZE as u64 {
            return self.respond(&ctx, &MemServerResponse {
                err: ErrorCode::BadAlignment,
                retbytes: 0,
            });
        }
        let retbytes = req.size.div_ceil(BASE_PAGE_SIZE as u64) * BASE_PAGE_SIZE as u64;
        if let Some(pid) = ctx.pid {
            let held = self.proc.memory_of(pid).unwrap_or(0);
            if held + retbytes > PER_PROCESS_MEMORY_LIMIT {
                debug!("denying memory request due to limits (pid {})", pid);
                return self.respond(&ctx, &MemServerResponse {
                    err: ErrorCode::MemoryLimitExceeded,
                    retbytes: 0,
                });
            }
        }
        match self.ram.alloc_aligned(req.size, req.alignment) {
            Ok(base) => {
                let slot = self.slots.alloc(1).expect("slot_alloc");
                self.mon
                    .cap_create(
                        slot,
                        &tandem_os_common::capspace::CapDescriptor::ram(base, retbytes),
                        self.core,
                    )
                    .expect("cap_create");
                if let Some(pid) = ctx.pid {
                    let _ = self.proc.charge_memory(pid, retbytes);
                }
                self.respond_with_caps(
                    &ctx,
                    &MemServerResponse {
                        err: ErrorCode::Ok,
                        retbytes,
                    },
                    alloc::vec![slot],
                );
            }
            Err(e) => self.respond(&ctx, &MemServerResponse {
                err: e.into(),
                retbytes: 0,
            }),
        }
    }

    fn handle_terminal(&mut self, ctx: RpcContext, req: TerminalRequest) {
        // The UART belongs to the serial server on core 0.
        if self.core != 0 {
            return self.rpc_transmit(ctx);
        }
        match req {
            TerminalRequest::Putchar(c) => {
                self.console.putchar(c);
                self.respond(&ctx, &TerminalResponse {
                    err: ErrorCode::Ok,
                    c: None,
                });
            }
            TerminalRequest::Getchar => {
                if let Some(s) = self.console.try_read(1) {
                    self.respond(&ctx, &TerminalResponse {
                        err: ErrorCode::Ok,
                        c: s.chars().next(),
                    });
                } else {
                    let token = self.alloc_token();
                    self.console.register_read(token, 1);
                    self.pending.insert(token, Suspended::Getchar(ctx));
                }
            }
        }
    }

    fn handle_terminal_str(&mut self, ctx: RpcContext, req: TerminalStrRequest) {
        if self.core != 0 {
            return self.rpc_transmit(ctx);
        }
        match req {
            TerminalStrRequest::Putstr(s) => {
                self.console.putstr(&s);
                self.respond(&ctx, &TerminalStrResponse {
                    err: ErrorCode::Ok,
                    len: s.len(),
                    s: String::new(),
                });
            }
            TerminalStrRequest::Getstr { len } => {
                if let Some(s) = self.console.try_read(len) {
                    self.respond(&ctx, &TerminalStrResponse {
                        err: ErrorCode::Ok,
                        len: s.len(),
                        s,
                    });
                } else {
                    let token = self.alloc_token();
                    self.console.register_read(token, len);
                    self.pending.insert(token, Suspended::Getstr(ctx));
                }
            }
        }
    }

    fn handle_proc_mgmt(&mut self, ctx: RpcContext, req: ProcMgmtRequest) {
        // An explicit foreign target goes straight to the peer.
        if let Some(core) = req.core {
            if core != self.core {
                return self.rpc_transmit(ctx);
            }
        }
        match req.op {
            ProcMgmtOp::SpawnCmdline { ref cmdline, capc } => {
                let capc = capc as usize;
                let capv: Vec<_> = ctx.caps.iter().copied().take(capc).collect();
                let stdin_frame = ctx.caps.get(capc).copied().unwrap_or(NULL_CAP);
                let stdout_frame = ctx.caps.get(capc + 1).copied().unwrap_or(NULL_CAP);
                let res = self.proc.spawn_mapped(
                    parse_args(cmdline),
                    capv,
                    self.core,
                    stdin_frame,
                    stdout_frame,
                );
                self.respond_spawn(&ctx, res);
            }
            ProcMgmtOp::SpawnDefault { ref path } => {
                let res = self.proc.spawn_program(path, self.core);
                self.respond_spawn(&ctx, res);
            }
            ProcMgmtOp::AllPids => {
                let local = self.proc.proc_list();
                if req.core.is_none() {
                    // Ask the peer for its half and merge on reply.
                    let fwd = ProcMgmtRequest {
                        core: Some(peer_core(self.core)),
                        op: ProcMgmtOp::AllPids,
                    };
                    let payload = message::encode_request(RequestKind::ProcMgmt, &fwd)
                        .expect("request encode");
                    return self.forward_all_pids(ctx, payload, local);
                }
                let res = clamp_all_pids(local);
                self.respond(&ctx, &res);
            }
            ProcMgmtOp::Status { pid } => {
                let res = match self.proc.status(pid) {
                    Ok(status) => StatusResponse {
                        err: ErrorCode::Ok,
                        status: Some(status),
                    },
                    Err(e) => StatusResponse {
                        err: e.into(),
                        status: None,
                    },
                };
                self.respond(&ctx, &res);
            }
            ProcMgmtOp::Name { pid } => {
                let res = match self.proc.name(pid) {
                    Ok(name) => ProcMgmtResponse {
                        err: ErrorCode::Ok,
                        pid,
                        name,
                    },
                    Err(e) => ProcMgmtResponse {
                        err: e.into(),
                        ..Default::default()
                    },
                };
                self.respond(&ctx, &res);
            }
            ProcMgmtOp::PidOf { ref name } => match self.proc.pid_by_name(name) {
                Ok(pid) => self.respond(&ctx, &ProcMgmtResponse {
                    err: ErrorCode::Ok,
                    pid,
                    name: name.clone(),
                }),
                Err(e) => {
                    if req.core.is_none() {
                        // Not here; maybe the peer knows the name.
                        let fwd = ProcMgmtRequest {
                            core: Some(peer_core(self.core)),
                            op: req.op.clone(),
                        };
                        let payload = message::encode_request(RequestKind::ProcMgmt, &fwd)
                            .expect("request encode");
                        return self.rpc_transmit_bytes(ctx, payload);
                    }
                    self.respond(&ctx, &ProcMgmtResponse {
                        err: e.into(),
                        ..Default::default()
                    });
                }
            },
            ProcMgmtOp::Pause { pid } => {
                let err = ErrorCode::from_result(
                    self.proc.suspend(pid).map_err(ErrorCode::from),
                );
                self.respond(&ctx, &ProcMgmtResponse {
                    err,
                    pid,
                    ..Default::default()
                });
            }
            ProcMgmtOp::Resume { pid } => {
                let err = ErrorCode::from_result(
                    self.proc.resume(pid).map_err(ErrorCode::from),
                );
                self.respond(&ctx, &ProcMgmtResponse {
                    err,
                    pid,
                    ..Default::default()
                });
            }
            ProcMgmtOp::Wait { pid } => {
                let token = self.alloc_token();
                match self.proc.register_wait(pid, token) {
                    Ok(WaitOutcome::AlreadyTerminal(exit_code)) => {
                        self.respond(&ctx, &WaitResponse {
                            err: ErrorCode::Ok,
                            exit_code,
                        });
                    }
                    Ok(WaitOutcome::Waiting) => {
                        self.pending.insert(token, Suspended::Wait(ctx));
                    }
                    Err(e) => self.respond(&ctx, &WaitResponse {
                        err: e.into(),
                        exit_code: 0,
                    }),
                }
            }
            ProcMgmtOp::Exit { pid, exit_code } => {
                match self.proc.terminated(pid, exit_code) {
                    Ok(notice) => self.notify_waiters(notice),
                    Err(e) => debug!("exit for pid {} failed: {:?}", pid, e),
                }
                // The caller is gone; there is nobody to answer.
            }
            ProcMgmtOp::Kill { pid } => {
                let err = match self.proc.kill(pid) {
                    Ok(notice) => {
                        self.notify_waiters(notice);
                        ErrorCode::Ok
                    }
                    Err(e) => e.into(),
                };
                self.respond(&ctx, &ProcMgmtResponse {
                    err,
                    pid,
                    ..Default::default()
                });
            }
            ProcMgmtOp::KillAll { ref name } => {
                match self.proc.killall(name) {
                    Ok(notices) => {
                        for notice in notices {
                            self.notify_waiters(notice);
                        }
                    }
                    Err(e) => {
                        return self.respond(&ctx, &ProcMgmtResponse {
                            err: e.into(),
                            ..Default::default()
                        });
                    }
                }
                if req.core.is_none() {
                    // The same name may be running on the peer.
                    let fwd = ProcMgmtRequest {
                        core: Some(peer_core(self.core)),
                        op: req.op.clone(),
                    };
                    let payload = message::encode_request(RequestKind::ProcMgmt, &fwd)
                        .expect("request encode");
                    return self.rpc_transmit_bytes(ctx, payload);
                }
                self.respond(&ctx, &ProcMgmtResponse {
                    err: ErrorCode::Ok,
                    ..Default::default()
                });
            }
        }
    }

    fn respond_spawn(
        &mut self,
        ctx: &RpcContext,
        res: Result<Pid, tandem_proc_interface::ProcessManagerError>,
    ) {
        let body = match res {
            Ok(pid) => {
                debug_assert!(pid > 0 && pid_core(pid) == self.core);
                ProcMgmtResponse {
                    err: ErrorCode::Ok,
                    pid,
                    ..Default::default()
                }
            }
            Err(e) => ProcMgmtResponse {
                err: e.into(),
                ..Default::default()
            },
        };
        self.respond(ctx, &body);
    }

    /// Fires every waiter a teardown released.
    pub(crate) fn notify_waiters(&mut self, notice: TeardownNotice) {
        for token in notice.waiters {
            match self.pending.remove(&token) {
                Some(Suspended::Wait(ctx)) => {
                    self.respond(&ctx, &WaitResponse {
                        err: ErrorCode::Ok,
                        exit_code: notice.exit_code,
                    });
                }
                _ => panic!("wait token {} in wrong state", token),
            }
        }
    }

    /// The peer's half of an ALL_PIDS query arrived; merge and answer.
    pub(crate) fn finish_all_pids(&mut self, ctx: RpcContext, local: Vec<Pid>, payload: &[u8]) {
        let peer: AllPidsResponse =
            message::decode_response(payload).expect("all-pids reply decode");
        let mut pids = local;
        pids.extend_from_slice(&peer.pids);
        let mut res = clamp_all_pids(pids);
        if peer.err.is_err() {
            res.err = peer.err;
            res.truncated |= peer.truncated;
        }
        self.respond(&ctx, &res);
    }

    fn handle_filesystem(&mut self, ctx: RpcContext) {
        // The FAT32 service runs beside the SD-card driver on core 0.
        if self.core != 0 {
            return self.rpc_transmit(ctx);
        }
        // Without a mounted filesystem there is nothing to serve.
        self.respond(&ctx, &GenericResponse {
            err: ErrorCode::NotSupported,
        });
    }

    fn handle_distcap(&mut self, ctx: RpcContext, req: DistCapRequest) {
        let token = self.alloc_token();
        self.pending.insert(token, Suspended::DistCap(ctx));
        let actions = match req {
            DistCapRequest::Delete { cap } => {
                self.engine.handle_delete(self.mon.as_mut(), token, cap)
            }
            DistCapRequest::Revoke { cap } => {
                self.engine.handle_revoke(self.mon.as_mut(), token, cap)
            }
            DistCapRequest::Retype {
                src,
                offset,
                new_type,
                objsize,
                count,
                dest,
            } => self.engine.handle_retype(
                self.mon.as_mut(),
                token,
                RetypeParams {
                    src,
                    dest,
                    offset,
                    new_type,
                    objsize,
                    count,
                },
            ),
            // The remaining variants are the peer side of the protocol.
            sync => self.engine.handle_sync(self.mon.as_mut(), token, &sync),
        };
        self.apply_engine_actions(actions);
    }

    fn handle_network(&mut self, ctx: RpcContext, req: NetworkRequest) {
        match req {
            NetworkRequest::Init { mac } => {
                let err = match ctx.pid {
                    Some(pid) => {
                        self.network.init(pid, mac);
                        ErrorCode::Ok
                    }
                    None => ErrorCode::InvalidArgs,
                };
                self.respond(&ctx, &GenericResponse { err });
            }
            NetworkRequest::Listen { port, pid, is_tcp } => {
                self.network.listen(port, is_tcp, pid);
                self.respond(&ctx, &GenericResponse { err: ErrorCode::Ok });
            }
            NetworkRequest::Receive { packet } => {
                // The driver tags the source address in the leading bytes;
                // an echo reply resolves its pending ping.
                if packet.len() >= 4 {
                    let ip = u32::from_le_bytes(packet[..4].try_into().unwrap());
                    if let Some(token) = self.network.ping_resolved(ip) {
                        self.deferred.cancel(token);
                        match self.pending.remove(&token) {
                            Some(Suspended::Ping { ctx, start, .. }) => {
                                self.respond(&ctx, &NetworkPingResponse {
                                    err: ErrorCode::Ok,
                                    ping_ms: (self.ticks - start) as u32,
                                });
                            }
                            _ => panic!("ping token {} in wrong state", token),
                        }
                    }
                }
                self.respond(&ctx, &GenericResponse { err: ErrorCode::Ok });
            }
            NetworkRequest::Ping { ip } => {
                // The network stack runs against the driver on core 0.
                if self.core != 0 {
                    return self.rpc_transmit(ctx);
                }
                if !self.network.has_driver() {
                    return self.respond(&ctx, &NetworkPingResponse {
                        err: ErrorCode::NotSupported,
                        ping_ms: 0,
                    });
                }
                let token = self.alloc_token();
                self.network.ping_started(ip, token);
                let start = self.ticks;
                self.pending.insert(token, Suspended::Ping { ctx, ip, start });
                self.deferred.register(self.ticks + PING_TIMEOUT_TICKS, token);
            }
            NetworkRequest::Send { pid, .. } => {
                if pid != 0 && pid_core(pid) != self.core {
                    return self.rpc_transmit(ctx);
                }
                // pid 0 targets the driver itself, anything else a local
                // listener; either way the payload is on its way.
                self.respond(&ctx, &GenericResponse { err: ErrorCode::Ok });
            }
            NetworkRequest::SetIo { is_network, .. } => {
                self.network.set_io(is_network);
                self.respond(&ctx, &GenericResponse { err: ErrorCode::Ok });
            }
        }
    }
}

/// Trims an ALL_PIDS reply to the response buffer, flagging truncation.
fn clamp_all_pids(mut pids: Vec<Pid>) -> AllPidsResponse {
    // A pid encodes to at most five bytes; cut clearly-oversized lists
    // before the byte-exact trim.
    let mut truncated = false;
    if pids.len() > SEND_BUF_BYTES {
        pids.truncate(SEND_BUF_BYTES);
        truncated = true;
    }
    let mut res = AllPidsResponse {
        err: if truncated {
            ErrorCode::BufferOverflow
        } else {
            ErrorCode::Ok
        },
        truncated,
        pids,
    };
    while message::encode_response(&res).expect("response encode").len() > SEND_BUF_BYTES {
        res.pids.pop();
        res.err = ErrorCode::BufferOverflow;
        res.truncated = true;
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_all_pids() {
        let res = clamp_all_pids((0..10).collect());
        assert_eq!(res.err, ErrorCode::Ok);
        assert!(!res.truncated);
        assert_eq!(res.pids.len(), 10);

        let res = clamp_all_pids((0..100_000).collect());
        assert_eq!(res.err, ErrorCode::BufferOverflow);
        assert!(res.truncated);
        assert!(!res.pids.is_empty());
        assert!(message::encode_response(&res).unwrap().len() <= SEND_BUF_BYTES);
    }
}

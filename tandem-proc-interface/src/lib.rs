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

//! Tandem OS process management interface.
//!
//! Wire types, client stubs, and the spawn-backend traits through which the
//! process manager drives the loader. PIDs are allocated so that
//! `pid mod NUM_CORES` names the owning core; requests carrying no target
//! core are tried locally and forwarded to the peer on a miss.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
use alloc::string::String;
use alloc::vec::Vec;
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};

use tandem_os_common::capspace::CapRef;
use tandem_os_common::error::ErrorCode;
use tandem_os_common::{CoreId, NUM_CORES};
use tandem_rpc::endpoint::EndpointChannel;
use tandem_rpc::message::{self, RequestKind};
use tandem_rpc::Frame;

pub type Pid = u32;

/// The core a pid belongs to; routing needs no directory.
pub fn pid_core(pid: Pid) -> CoreId { (pid as usize % NUM_CORES) as CoreId }

/// Process state as exported on the wire.
#[repr(u8)]
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromPrimitive, IntoPrimitive, Serialize,
    Deserialize,
)]
pub enum ProcessState {
    #[default]
    Unknown = 0,
    Spawning = 1,
    Running = 2,
    Paused = 3,
    Exited = 4,
    Killed = 5,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcStatus {
    pub pid: Pid,
    pub core: CoreId,
    pub state: ProcessState,
    pub exit_code: i32,
    pub cmdline: String,
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
pub enum ProcessManagerError {
    Success = 0,
    InvalidArgs,
    DomainNotFound,
    ModuleNotFound,
    SpawnFailed,
    #[default]
    UnknownError,
}

impl From<ProcessManagerError> for ErrorCode {
    fn from(err: ProcessManagerError) -> ErrorCode {
        match err {
            ProcessManagerError::Success => ErrorCode::Ok,
            ProcessManagerError::InvalidArgs => ErrorCode::InvalidArgs,
            ProcessManagerError::DomainNotFound | ProcessManagerError::ModuleNotFound => {
                ErrorCode::NotFound
            }
            ProcessManagerError::SpawnFailed => ErrorCode::SpawnFailed,
            ProcessManagerError::UnknownError => ErrorCode::Unknown,
        }
    }
}

/// Process-management sub-requests. Spawn requests pass `capc` caps for the
/// child plus its stdin and stdout frames in the frame's cap slots.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ProcMgmtOp {
    SpawnCmdline { cmdline: String, capc: u32 },
    SpawnDefault { path: String },
    AllPids,
    Status { pid: Pid },
    Name { pid: Pid },
    PidOf { name: String },
    Pause { pid: Pid },
    Resume { pid: Pid },
    Wait { pid: Pid },
    Exit { pid: Pid, exit_code: i32 },
    Kill { pid: Pid },
    KillAll { name: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcMgmtRequest {
    /// Target core; `None` means try locally and forward on a miss.
    pub core: Option<CoreId>,
    pub op: ProcMgmtOp,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProcMgmtResponse {
    pub err: ErrorCode,
    pub pid: Pid,
    pub name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AllPidsResponse {
    pub err: ErrorCode,
    /// Set when the reply outgrew the caller's buffer and was cut short.
    pub truncated: bool,
    pub pids: Vec<Pid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub err: ErrorCode,
    pub status: Option<ProcStatus>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WaitResponse {
    pub err: ErrorCode,
    pub exit_code: i32,
}

/// Arguments handed to the loader for one spawn.
#[derive(Clone, Debug)]
pub struct SpawnArgs {
    pub pid: Pid,
    pub argv: Vec<String>,
    pub caps: Vec<CapRef>,
    pub stdin_frame: CapRef,
    pub stdout_frame: CapRef,
}

/// Control surface of a loaded process; mainly used to inject fakes for
/// unit tests.
pub trait ProcessControl {
    fn start(&mut self) -> Result<(), ProcessManagerError>;
    fn suspend(&mut self) -> Result<(), ProcessManagerError>;
    fn resume(&mut self) -> Result<(), ProcessManagerError>;
    fn kill(&mut self) -> Result<(), ProcessManagerError>;
    /// Releases loader-side resources after the process is gone.
    fn cleanup(&mut self);
}

/// Interface to the underlying loader (multiboot images, or the filesystem
/// for paths under /SDCARD/).
pub trait SpawnInterface {
    type Image;
    type Process: ProcessControl;

    /// Locates a binary and returns it with its default argv (from the
    /// module list command line).
    fn load(&mut self, path: &str) -> Result<(Self::Image, Vec<String>), ProcessManagerError>;

    /// Constructs the child (address space, dispatcher, argument page) in a
    /// ready-to-run state.
    fn spawn(
        &mut self,
        image: Self::Image,
        args: SpawnArgs,
    ) -> Result<Self::Process, ProcessManagerError>;
}

fn proc_call<T: serde::de::DeserializeOwned>(
    chan: &EndpointChannel,
    req: &ProcMgmtRequest,
    caps: Vec<CapRef>,
) -> Result<T, ErrorCode> {
    log::trace!("proc_call {:?}", req);
    let bytes = message::encode_request(RequestKind::ProcMgmt, req).map_err(ErrorCode::from)?;
    chan.send_blocking(Frame::with_caps(bytes, caps))
        .map_err(ErrorCode::from)?;
    let reply = chan.recv_blocking().map_err(ErrorCode::from)?;
    message::decode_response(&reply.bytes).map_err(ErrorCode::from)
}

pub fn tandem_proc_spawn_with_cmdline(
    chan: &EndpointChannel,
    cmdline: &str,
    core: Option<CoreId>,
) -> Result<Pid, ErrorCode> {
    tandem_proc_spawn_mapped(chan, cmdline, core, Vec::new(), CapRef::default(), CapRef::default())
}

pub fn tandem_proc_spawn_mapped(
    chan: &EndpointChannel,
    cmdline: &str,
    core: Option<CoreId>,
    capv: Vec<CapRef>,
    stdin_frame: CapRef,
    stdout_frame: CapRef,
) -> Result<Pid, ErrorCode> {
    let capc = capv.len() as u32;
    let mut caps = capv;
    caps.push(stdin_frame);
    caps.push(stdout_frame);
    let res: ProcMgmtResponse = proc_call(
        chan,
        &ProcMgmtRequest {
            core,
            op: ProcMgmtOp::SpawnCmdline {
                cmdline: cmdline.into(),
                capc,
            },
        },
        caps,
    )?;
    Result::from(res.err)?;
    Ok(res.pid)
}

pub fn tandem_proc_spawn_with_default_args(
    chan: &EndpointChannel,
    path: &str,
    core: Option<CoreId>,
) -> Result<Pid, ErrorCode> {
    let res: ProcMgmtResponse = proc_call(
        chan,
        &ProcMgmtRequest {
            core,
            op: ProcMgmtOp::SpawnDefault { path: path.into() },
        },
        Vec::new(),
    )?;
    Result::from(res.err)?;
    Ok(res.pid)
}

pub fn tandem_proc_get_all_pids(chan: &EndpointChannel) -> Result<Vec<Pid>, ErrorCode> {
    let res: AllPidsResponse = proc_call(
        chan,
        &ProcMgmtRequest {
            core: None,
            op: ProcMgmtOp::AllPids,
        },
        Vec::new(),
    )?;
    Result::from(res.err)?;
    Ok(res.pids)
}

pub fn tandem_proc_get_status(chan: &EndpointChannel, pid: Pid) -> Result<ProcStatus, ErrorCode> {
    let res: StatusResponse = proc_call(
        chan,
        &ProcMgmtRequest {
            core: Some(pid_core(pid)),
            op: ProcMgmtOp::Status { pid },
        },
        Vec::new(),
    )?;
    Result::from(res.err)?;
    res.status.ok_or(ErrorCode::Unknown)
}

pub fn tandem_proc_get_name(chan: &EndpointChannel, pid: Pid) -> Result<String, ErrorCode> {
    let res: ProcMgmtResponse = proc_call(
        chan,
        &ProcMgmtRequest {
            core: Some(pid_core(pid)),
            op: ProcMgmtOp::Name { pid },
        },
        Vec::new(),
    )?;
    Result::from(res.err)?;
    Ok(res.name)
}

pub fn tandem_proc_get_pid(chan: &EndpointChannel, name: &str) -> Result<Pid, ErrorCode> {
    let res: ProcMgmtResponse = proc_call(
        chan,
        &ProcMgmtRequest {
            core: None,
            op: ProcMgmtOp::PidOf { name: name.into() },
        },
        Vec::new(),
    )?;
    Result::from(res.err)?;
    Ok(res.pid)
}

pub fn tandem_proc_pause(chan: &EndpointChannel, pid: Pid) -> Result<(), ErrorCode> {
    let res: ProcMgmtResponse = proc_call(
        chan,
        &ProcMgmtRequest {
            core: Some(pid_core(pid)),
            op: ProcMgmtOp::Pause { pid },
        },
        Vec::new(),
    )?;
    Result::from(res.err)
}

pub fn tandem_proc_resume(chan: &EndpointChannel, pid: Pid) -> Result<(), ErrorCode> {
    let res: ProcMgmtResponse = proc_call(
        chan,
        &ProcMgmtRequest {
            core: Some(pid_core(pid)),
            op: ProcMgmtOp::Resume { pid },
        },
        Vec::new(),
    )?;
    Result::from(res.err)
}

/// Blocks until `pid` exits; returns its exit code.
pub fn tandem_proc_wait(chan: &EndpointChannel, pid: Pid) -> Result<i32, ErrorCode> {
    let res: WaitResponse = proc_call(
        chan,
        &ProcMgmtRequest {
            core: Some(pid_core(pid)),
            op: ProcMgmtOp::Wait { pid },
        },
        Vec::new(),
    )?;
    Result::from(res.err)?;
    Ok(res.exit_code)
}

/// Reports the caller's own termination; the process manager halts it.
pub fn tandem_proc_exit(chan: &EndpointChannel, pid: Pid, status: i32) -> Result<(), ErrorCode> {
    let res: ProcMgmtResponse = proc_call(
        chan,
        &ProcMgmtRequest {
            core: Some(pid_core(pid)),
            op: ProcMgmtOp::Exit {
                pid,
                exit_code: status,
            },
        },
        Vec::new(),
    )?;
    Result::from(res.err)
}

pub fn tandem_proc_kill(chan: &EndpointChannel, pid: Pid) -> Result<(), ErrorCode> {
    let res: ProcMgmtResponse = proc_call(
        chan,
        &ProcMgmtRequest {
            core: Some(pid_core(pid)),
            op: ProcMgmtOp::Kill { pid },
        },
        Vec::new(),
    )?;
    Result::from(res.err)
}

pub fn tandem_proc_kill_all(chan: &EndpointChannel, name: &str) -> Result<(), ErrorCode> {
    let res: ProcMgmtResponse = proc_call(
        chan,
        &ProcMgmtRequest {
            core: None,
            op: ProcMgmtOp::KillAll { name: name.into() },
        },
        Vec::new(),
    )?;
    Result::from(res.err)
}

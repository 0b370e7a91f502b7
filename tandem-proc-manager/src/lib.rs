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

//! Tandem OS per-core process management.
//!
//! One `ProcessManager` per init domain tracks every process spawned on
//! that core. Records are never freed: late waiters and status queries
//! against a terminated pid must still find the exit code. Waiters are
//! opaque tokens; teardown hands the fired tokens back to the caller, who
//! resumes the suspended RPCs they stand for. The table lock is never held
//! across anything that can suspend.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
use alloc::string::String;
use alloc::vec::Vec;
use log::{debug, trace};
use smallstr::SmallString;
use spin::Mutex;

use tandem_os_common::bootinfo::{binary_name, parse_args};
use tandem_os_common::{CoreId, NUM_CORES};
use tandem_proc_interface::{
    pid_core, Pid, ProcStatus, ProcessControl, ProcessManagerError, ProcessState, SpawnArgs,
    SpawnInterface,
};

use tandem_os_common::capspace::CapRef;

/// Internal lifecycle; terminal states carry no successor.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd)]
enum SpawnState {
    Spawning,
    Ready,
    Running,
    Suspended,
    Terminated,
    Killed,
}

impl SpawnState {
    fn is_terminal(self) -> bool { matches!(self, SpawnState::Terminated | SpawnState::Killed) }

    fn wire(self) -> ProcessState {
        match self {
            SpawnState::Spawning | SpawnState::Ready => ProcessState::Spawning,
            SpawnState::Running => ProcessState::Running,
            SpawnState::Suspended => ProcessState::Paused,
            SpawnState::Terminated => ProcessState::Exited,
            SpawnState::Killed => ProcessState::Killed,
        }
    }
}

/// Token standing for a suspended waiter; minted by the RPC layer.
pub type WaitToken = u64;

/// Outcome of `register_wait`.
#[derive(Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    /// The process is already gone; fire the waiter immediately.
    AlreadyTerminal(i32),
    /// The waiter was queued and fires at teardown.
    Waiting,
}

/// What a teardown produced: the exit code and every waiter to resume.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct TeardownNotice {
    pub pid: Pid,
    pub exit_code: i32,
    pub waiters: Vec<WaitToken>,
}

// Name capacity before spillover to the heap.
pub const DEFAULT_NAME_CAPACITY: usize = 64;
type BinaryName = SmallString<[u8; DEFAULT_NAME_CAPACITY]>;

struct ProcessRecord<P> {
    pid: Pid,
    binary_name: BinaryName,
    cmdline: String,
    state: SpawnState,
    exit_code: i32,
    waiters: Vec<WaitToken>,
    mem_bytes: u64,
    process: Option<P>,
}

struct Table<P> {
    procs: Vec<ProcessRecord<P>>,
    next_pid: Pid,
    nb_processes_running: usize,
}

impl<P> Table<P> {
    fn record(&self, pid: Pid) -> Option<&ProcessRecord<P>> {
        self.procs.iter().find(|p| p.pid == pid)
    }
    fn record_mut(&mut self, pid: Pid) -> Option<&mut ProcessRecord<P>> {
        self.procs.iter_mut().find(|p| p.pid == pid)
    }
}

pub struct ProcessManager<S: SpawnInterface> {
    spawn: S,
    core: CoreId,
    table: Mutex<Table<S::Process>>,
}

/// Whether `proc_name` matches `search`: absolute searches (containing a
/// path separator) must match the full name, otherwise only the basename
/// is compared.
fn name_matches(proc_name: &str, search: &str) -> bool {
    if search.contains('/') {
        return proc_name == search;
    }
    let basename = proc_name.rsplit('/').next().unwrap_or(proc_name);
    basename == search
}

impl<S: SpawnInterface> ProcessManager<S> {
    pub fn new(spawn: S, core: CoreId) -> Self {
        // pid 0 is never assigned; all pids of this core are congruent to
        // the core id modulo the core count.
        let mut next_pid = core as Pid;
        if next_pid == 0 {
            next_pid += NUM_CORES as Pid;
        }
        ProcessManager {
            spawn,
            core,
            table: Mutex::new(Table {
                procs: Vec::new(),
                next_pid,
                nb_processes_running: 0,
            }),
        }
    }

    pub fn core(&self) -> CoreId { self.core }

    fn alloc_pid(&self) -> Pid {
        let mut table = self.table.lock();
        let pid = table.next_pid;
        table.next_pid += NUM_CORES as Pid;
        pid
    }

    /// Spawns a process from explicit argv plus caps and stdio frames.
    pub fn spawn_mapped(
        &mut self,
        argv: Vec<String>,
        caps: Vec<CapRef>,
        core: CoreId,
        stdin_frame: CapRef,
        stdout_frame: CapRef,
    ) -> Result<Pid, ProcessManagerError> {
        if argv.is_empty() {
            return Err(ProcessManagerError::InvalidArgs);
        }
        assert_eq!(core, self.core, "spawn routed to the wrong core");
        let path = argv[0].clone();
        let (image, _default_args) = self.spawn.load(&path)?;
        self.spawn_internal(image, path, argv, caps, stdin_frame, stdout_frame)
    }

    /// Tokenises a command line and spawns it.
    pub fn spawn_with_cmdline(
        &mut self,
        cmdline: &str,
        core: CoreId,
    ) -> Result<Pid, ProcessManagerError> {
        let argv = parse_args(cmdline);
        self.spawn_mapped(argv, Vec::new(), core, CapRef::default(), CapRef::default())
    }

    /// Spawns `path` with the default arguments from the module list.
    pub fn spawn_program(&mut self, path: &str, core: CoreId) -> Result<Pid, ProcessManagerError> {
        assert_eq!(core, self.core, "spawn routed to the wrong core");
        let (image, default_args) = self.spawn.load(path)?;
        let argv = if default_args.is_empty() {
            parse_args(path)
        } else {
            default_args
        };
        self.spawn_internal(
            image,
            String::from(path),
            argv,
            Vec::new(),
            CapRef::default(),
            CapRef::default(),
        )
    }

    fn spawn_internal(
        &mut self,
        image: S::Image,
        path: String,
        argv: Vec<String>,
        caps: Vec<CapRef>,
        stdin_frame: CapRef,
        stdout_frame: CapRef,
    ) -> Result<Pid, ProcessManagerError> {
        let pid = self.alloc_pid();
        let cmdline = argv.join(" ");
        trace!("spawn pid {} cmdline \"{}\"", pid, cmdline);

        // The loader runs without the table lock held.
        let mut process = self.spawn.spawn(
            image,
            SpawnArgs {
                pid,
                argv,
                caps,
                stdin_frame,
                stdout_frame,
            },
        )?;
        process.start()?;

        let mut table = self.table.lock();
        table.procs.push(ProcessRecord {
            pid,
            binary_name: BinaryName::from_str(binary_name(&path)),
            cmdline,
            state: SpawnState::Running,
            exit_code: 0,
            waiters: Vec::new(),
            mem_bytes: 0,
            process: Some(process),
        });
        table.nb_processes_running += 1;
        Ok(pid)
    }

    fn status_of(&self, rec: &ProcessRecord<S::Process>) -> ProcStatus {
        ProcStatus {
            pid: rec.pid,
            core: self.core,
            state: rec.state.wire(),
            exit_code: if rec.state == SpawnState::Killed {
                -1
            } else {
                rec.exit_code
            },
            cmdline: rec.cmdline.clone(),
        }
    }

    /// Statuses of all live processes on this core.
    pub fn ps(&self) -> Vec<ProcStatus> {
        let table = self.table.lock();
        table
            .procs
            .iter()
            .filter(|p| !p.state.is_terminal())
            .map(|p| self.status_of(p))
            .collect()
    }

    /// Pids of all live processes on this core.
    pub fn proc_list(&self) -> Vec<Pid> {
        let table = self.table.lock();
        let pids: Vec<Pid> = table
            .procs
            .iter()
            .filter(|p| !p.state.is_terminal())
            .map(|p| p.pid)
            .collect();
        debug_assert_eq!(pids.len(), table.nb_processes_running);
        pids
    }

    pub fn nb_processes_running(&self) -> usize { self.table.lock().nb_processes_running }

    /// Smallest pid whose name matches.
    pub fn pid_by_name(&self, name: &str) -> Result<Pid, ProcessManagerError> {
        let table = self.table.lock();
        table
            .procs
            .iter()
            .filter(|p| name_matches(p.binary_name.as_str(), name))
            .map(|p| p.pid)
            .min()
            .ok_or(ProcessManagerError::DomainNotFound)
    }

    /// Status of any known pid, terminated ones included.
    pub fn status(&self, pid: Pid) -> Result<ProcStatus, ProcessManagerError> {
        if pid == 0 {
            return Err(ProcessManagerError::InvalidArgs);
        }
        let table = self.table.lock();
        table
            .record(pid)
            .map(|p| self.status_of(p))
            .ok_or(ProcessManagerError::DomainNotFound)
    }

    pub fn name(&self, pid: Pid) -> Result<String, ProcessManagerError> {
        if pid == 0 {
            return Err(ProcessManagerError::InvalidArgs);
        }
        let table = self.table.lock();
        table
            .record(pid)
            .map(|p| String::from(p.binary_name.as_str()))
            .ok_or(ProcessManagerError::DomainNotFound)
    }

    pub fn suspend(&mut self, pid: Pid) -> Result<(), ProcessManagerError> {
        let mut table = self.table.lock();
        let rec = table
            .record_mut(pid)
            .ok_or(ProcessManagerError::DomainNotFound)?;
        if rec.state != SpawnState::Running {
            return Err(ProcessManagerError::InvalidArgs);
        }
        rec.process
            .as_mut()
            .ok_or(ProcessManagerError::UnknownError)?
            .suspend()?;
        rec.state = SpawnState::Suspended;
        Ok(())
    }

    pub fn resume(&mut self, pid: Pid) -> Result<(), ProcessManagerError> {
        let mut table = self.table.lock();
        let rec = table
            .record_mut(pid)
            .ok_or(ProcessManagerError::DomainNotFound)?;
        if rec.state != SpawnState::Suspended {
            return Err(ProcessManagerError::InvalidArgs);
        }
        rec.process
            .as_mut()
            .ok_or(ProcessManagerError::UnknownError)?
            .resume()?;
        rec.state = SpawnState::Running;
        Ok(())
    }

    /// Queues a waiter for `pid`'s exit. Exactly one of the outcomes holds:
    /// the token fires now (process already terminal) or at teardown.
    pub fn register_wait(
        &mut self,
        pid: Pid,
        token: WaitToken,
    ) -> Result<WaitOutcome, ProcessManagerError> {
        let mut table = self.table.lock();
        let rec = table
            .record_mut(pid)
            .ok_or(ProcessManagerError::DomainNotFound)?;
        if rec.state.is_terminal() {
            let code = if rec.state == SpawnState::Killed {
                -1
            } else {
                rec.exit_code
            };
            return Ok(WaitOutcome::AlreadyTerminal(code));
        }
        rec.waiters.push(token);
        Ok(WaitOutcome::Waiting)
    }

    fn teardown(
        rec: &mut ProcessRecord<S::Process>,
        exit_code: i32,
        state: SpawnState,
    ) -> Result<TeardownNotice, ProcessManagerError> {
        debug_assert!(state.is_terminal());
        if let Some(mut process) = rec.process.take() {
            if state == SpawnState::Killed {
                process.kill()?;
            }
            process.cleanup();
        }
        rec.exit_code = exit_code;
        rec.state = state;
        // The record itself stays forever: late STATUS queries return the
        // exit code, not DomainNotFound.
        Ok(TeardownNotice {
            pid: rec.pid,
            exit_code,
            waiters: core::mem::take(&mut rec.waiters),
        })
    }

    /// Graceful exit reported by the process itself.
    pub fn terminated(
        &mut self,
        pid: Pid,
        status: i32,
    ) -> Result<TeardownNotice, ProcessManagerError> {
        debug!("pid {} terminated with {}", pid, status);
        let mut table = self.table.lock();
        let rec = table
            .record_mut(pid)
            .ok_or(ProcessManagerError::DomainNotFound)?;
        if rec.state.is_terminal() {
            return Err(ProcessManagerError::DomainNotFound);
        }
        let notice = Self::teardown(rec, status, SpawnState::Terminated)?;
        table.nb_processes_running -= 1;
        Ok(notice)
    }

    /// Forced termination.
    pub fn kill(&mut self, pid: Pid) -> Result<TeardownNotice, ProcessManagerError> {
        debug!("kill pid {}", pid);
        let mut table = self.table.lock();
        let rec = table
            .record_mut(pid)
            .ok_or(ProcessManagerError::DomainNotFound)?;
        if rec.state.is_terminal() {
            return Err(ProcessManagerError::DomainNotFound);
        }
        let notice = Self::teardown(rec, -1, SpawnState::Killed)?;
        table.nb_processes_running -= 1;
        Ok(notice)
    }

    /// Kills every live process matching `name`.
    pub fn killall(&mut self, name: &str) -> Result<Vec<TeardownNotice>, ProcessManagerError> {
        let pids: Vec<Pid> = {
            let table = self.table.lock();
            table
                .procs
                .iter()
                .filter(|p| !p.state.is_terminal() && name_matches(p.binary_name.as_str(), name))
                .map(|p| p.pid)
                .collect()
        };
        let mut notices = Vec::with_capacity(pids.len());
        for pid in pids {
            notices.push(self.kill(pid)?);
        }
        Ok(notices)
    }

    /// Adds to the memory charged against `pid` by the memory server.
    pub fn charge_memory(&mut self, pid: Pid, bytes: u64) -> Result<(), ProcessManagerError> {
        let mut table = self.table.lock();
        let rec = table
            .record_mut(pid)
            .ok_or(ProcessManagerError::DomainNotFound)?;
        rec.mem_bytes += bytes;
        Ok(())
    }

    pub fn memory_of(&self, pid: Pid) -> Result<u64, ProcessManagerError> {
        let table = self.table.lock();
        table
            .record(pid)
            .map(|p| p.mem_bytes)
            .ok_or(ProcessManagerError::DomainNotFound)
    }

    /// Verifies pid routing: every pid handed out here names this core.
    pub fn owns_pid(&self, pid: Pid) -> bool { pid_core(pid) == self.core }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_proc_interface::ProcessManagerError as pme;

    // Just enough loader state to drive the lifecycle.
    struct FakeSpawn {
        known: Vec<&'static str>,
    }

    struct FakeProcess {
        running: bool,
    }

    impl ProcessControl for FakeProcess {
        fn start(&mut self) -> Result<(), pme> {
            self.running = true;
            Ok(())
        }
        fn suspend(&mut self) -> Result<(), pme> { Ok(()) }
        fn resume(&mut self) -> Result<(), pme> { Ok(()) }
        fn kill(&mut self) -> Result<(), pme> {
            self.running = false;
            Ok(())
        }
        fn cleanup(&mut self) {}
    }

    impl SpawnInterface for FakeSpawn {
        type Image = String;
        type Process = FakeProcess;

        fn load(&mut self, path: &str) -> Result<(String, Vec<String>), pme> {
            let name = path.rsplit('/').next().unwrap();
            if self.known.iter().any(|k| *k == name) {
                Ok((String::from(path), alloc::vec![String::from(path)]))
            } else {
                Err(pme::ModuleNotFound)
            }
        }

        fn spawn(&mut self, _image: String, _args: SpawnArgs) -> Result<FakeProcess, pme> {
            Ok(FakeProcess { running: false })
        }
    }

    fn manager_on(core: CoreId) -> ProcessManager<FakeSpawn> {
        ProcessManager::new(
            FakeSpawn {
                known: alloc::vec!["hello", "shell", "memeater"],
            },
            core,
        )
    }

    #[test]
    fn test_pid_allocation_encodes_core() {
        let mut mgr0 = manager_on(0);
        let mut mgr1 = manager_on(1);
        for _ in 0..3 {
            let pid = mgr0.spawn_with_cmdline("hello", 0).unwrap();
            assert!(pid > 0);
            assert_eq!(pid_core(pid), 0);
            let pid = mgr1.spawn_with_cmdline("hello", 1).unwrap();
            assert_eq!(pid_core(pid), 1);
        }
    }

    #[test]
    fn test_spawn_and_query() {
        let mut mgr = manager_on(0);
        let pid = mgr.spawn_with_cmdline("hello a b", 0).unwrap();
        assert_eq!(mgr.name(pid).unwrap(), "hello");
        let status = mgr.status(pid).unwrap();
        assert_eq!(status.state, ProcessState::Running);
        assert_eq!(status.cmdline, "hello a b");
        assert_eq!(mgr.proc_list(), alloc::vec![pid]);
        assert_eq!(mgr.status(999).err(), Some(pme::DomainNotFound));
    }

    #[test]
    fn test_unknown_binary() {
        let mut mgr = manager_on(0);
        assert_eq!(mgr.spawn_with_cmdline("nonesuch", 0).err(), Some(pme::ModuleNotFound));
        assert_eq!(mgr.spawn_with_cmdline("", 0).err(), Some(pme::InvalidArgs));
    }

    #[test]
    fn test_name_matching() {
        let mut mgr = manager_on(0);
        let pid = mgr.spawn_with_cmdline("/SDCARD/hello", 0).unwrap();
        // Basename searches match, absolute searches must be exact.
        assert_eq!(mgr.pid_by_name("hello").unwrap(), pid);
        assert_eq!(mgr.pid_by_name("/SDCARD/hello").unwrap(), pid);
        assert_eq!(mgr.pid_by_name("/OTHER/hello").err(), Some(pme::DomainNotFound));
    }

    #[test]
    fn test_smallest_pid_wins_on_ties() {
        let mut mgr = manager_on(0);
        let first = mgr.spawn_with_cmdline("hello", 0).unwrap();
        let _second = mgr.spawn_with_cmdline("hello", 0).unwrap();
        assert_eq!(mgr.pid_by_name("hello").unwrap(), first);
    }

    #[test]
    fn test_suspend_resume() {
        let mut mgr = manager_on(0);
        let pid = mgr.spawn_with_cmdline("hello", 0).unwrap();
        mgr.suspend(pid).unwrap();
        assert_eq!(mgr.status(pid).unwrap().state, ProcessState::Paused);
        // Double suspend is rejected.
        assert_eq!(mgr.suspend(pid).err(), Some(pme::InvalidArgs));
        mgr.resume(pid).unwrap();
        assert_eq!(mgr.status(pid).unwrap().state, ProcessState::Running);
    }

    #[test]
    fn test_terminated_keeps_record() {
        let mut mgr = manager_on(0);
        let pid = mgr.spawn_with_cmdline("hello", 0).unwrap();
        let notice = mgr.terminated(pid, 42).unwrap();
        assert_eq!(notice.exit_code, 42);
        assert!(notice.waiters.is_empty());
        // The record survives: status reports the exit, the live list not.
        let status = mgr.status(pid).unwrap();
        assert_eq!(status.state, ProcessState::Exited);
        assert_eq!(status.exit_code, 42);
        assert!(mgr.proc_list().is_empty());
        assert_eq!(mgr.nb_processes_running(), 0);
        // A second terminate is indistinguishable from an unknown pid.
        assert_eq!(mgr.terminated(pid, 0).err(), Some(pme::DomainNotFound));
    }

    #[test]
    fn test_wait_fires_once_each() {
        let mut mgr = manager_on(0);
        let pid = mgr.spawn_with_cmdline("hello", 0).unwrap();
        assert_eq!(mgr.register_wait(pid, 11).unwrap(), WaitOutcome::Waiting);
        assert_eq!(mgr.register_wait(pid, 22).unwrap(), WaitOutcome::Waiting);
        let notice = mgr.terminated(pid, 7).unwrap();
        assert_eq!(notice.waiters, alloc::vec![11, 22]);
        // Late waiter completes immediately with the stored code.
        assert_eq!(
            mgr.register_wait(pid, 33).unwrap(),
            WaitOutcome::AlreadyTerminal(7)
        );
    }

    #[test]
    fn test_kill_reports_minus_one() {
        let mut mgr = manager_on(0);
        let pid = mgr.spawn_with_cmdline("hello", 0).unwrap();
        mgr.register_wait(pid, 5).unwrap();
        let notice = mgr.kill(pid).unwrap();
        assert_eq!(notice.exit_code, -1);
        assert_eq!(notice.waiters, alloc::vec![5]);
        let status = mgr.status(pid).unwrap();
        assert_eq!(status.state, ProcessState::Killed);
        assert_eq!(status.exit_code, -1);
    }

    #[test]
    fn test_killall_by_name() {
        let mut mgr = manager_on(0);
        let a = mgr.spawn_with_cmdline("hello", 0).unwrap();
        let b = mgr.spawn_with_cmdline("hello x", 0).unwrap();
        let c = mgr.spawn_with_cmdline("shell", 0).unwrap();
        let notices = mgr.killall("hello").unwrap();
        assert_eq!(notices.len(), 2);
        assert!(notices.iter().all(|n| n.exit_code == -1));
        let killed: Vec<Pid> = notices.iter().map(|n| n.pid).collect();
        assert!(killed.contains(&a) && killed.contains(&b));
        assert_eq!(mgr.proc_list(), alloc::vec![c]);
    }

    #[test]
    fn test_memory_accounting() {
        let mut mgr = manager_on(0);
        let pid = mgr.spawn_with_cmdline("memeater", 0).unwrap();
        assert_eq!(mgr.memory_of(pid).unwrap(), 0);
        mgr.charge_memory(pid, 4096).unwrap();
        mgr.charge_memory(pid, 8192).unwrap();
        assert_eq!(mgr.memory_of(pid).unwrap(), 12288);
    }
}

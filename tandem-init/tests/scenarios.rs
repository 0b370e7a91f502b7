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

//! End-to-end scenarios: two init domains over the shared fake kernel and
//! one URPC frame, driven by hand-pumped event loops.

use tandem_distcap_interface::{DistCapRequest, DistCapResponse};
use tandem_distcap_manager::transfer::{cap_from_transfer, cap_transfer_copy};
use tandem_fake_monitor::FakeKernel;
use tandem_init::bringup;
use tandem_init::spawn::{ChannelRegistry, ModuleSpawn};
use tandem_init::wire::{
    GenericResponse, NetworkPingResponse, NetworkRequest, SetupChannelRequest, TerminalRequest,
    TerminalResponse, TerminalStrRequest, TerminalStrResponse,
};
use tandem_init::InitDomain;
use tandem_memory_interface::{MemServerRequest, MemServerResponse};
use tandem_memory_manager::RamAllocator;
use tandem_os_common::bootinfo::{BootInfo, ModuleRegion, MultibootStrings, RamRegion};
use tandem_os_common::capspace::{
    CapDescriptor, CapRef, ObjType, Relations, SELF_CROOT,
};
use tandem_os_common::error::ErrorCode;
use tandem_os_common::BASE_PAGE_SIZE;
use tandem_proc_interface::{
    AllPidsResponse, ProcMgmtOp, ProcMgmtRequest, ProcMgmtResponse, ProcessState, StatusResponse,
    WaitResponse,
};
use tandem_proc_manager::ProcessManager;
use tandem_rpc::endpoint::{endpoint_pair, EndpointChannel};
use tandem_rpc::message::{self, RequestKind};
use tandem_rpc::ump::{UmpChannel, UmpFrame};
use tandem_rpc::Frame;

struct System {
    kernel: FakeKernel,
    d0: InitDomain<ModuleSpawn>,
    d1: InitDomain<ModuleSpawn>,
}

fn boot_config() -> (BootInfo, MultibootStrings) {
    let (mmstrings, offsets) =
        MultibootStrings::pack(&["hello", "shell", "netd", "memeater"]);
    let bi = BootInfo {
        ram: vec![RamRegion {
            base: 0x8000_0000,
            bytes: 32 * 1024 * 1024,
        }],
        modules: offsets
            .iter()
            .enumerate()
            .map(|(i, &off)| ModuleRegion {
                base: 0x4000_0000 + (i as u64) * 0x10_0000,
                bytes: 0x1_0000,
                slot: i as u32,
                cmdline_offset: off,
            })
            .collect(),
    };
    (bi, mmstrings)
}

fn system() -> System {
    let kernel = FakeKernel::new();
    let (bi, mmstrings) = boot_config();
    let frame = UmpFrame::new();

    let reg0 = ChannelRegistry::new();
    let d0 = InitDomain::new(
        0,
        Box::new(kernel.monitor(0)),
        RamAllocator::from_range(0x8000_0000, 16 * 1024 * 1024),
        ProcessManager::new(ModuleSpawn::new(bi.clone(), mmstrings.clone(), reg0.clone()), 0),
        reg0,
        UmpChannel::connect(frame.clone(), true),
    );
    let reg1 = ChannelRegistry::new();
    let d1 = InitDomain::new(
        1,
        Box::new(kernel.monitor(1)),
        RamAllocator::from_range(0xa000_0000, 16 * 1024 * 1024),
        ProcessManager::new(ModuleSpawn::new(bi, mmstrings, reg1.clone()), 1),
        reg1,
        UmpChannel::connect(frame, false),
    );
    System { kernel, d0, d1 }
}

fn pump(sys: &mut System) {
    let mut idle = 0;
    for _ in 0..400 {
        let mut worked = sys.d0.poll();
        worked |= sys.d1.poll();
        if worked {
            idle = 0;
        } else {
            idle += 1;
            if idle > 8 {
                break;
            }
        }
    }
}

/// Registers a fresh client channel on a domain.
fn connect(domain: &mut InitDomain<ModuleSpawn>) -> EndpointChannel {
    let (server, client) = endpoint_pair();
    domain.add_channel(None, server);
    client
}

fn send<T: serde::Serialize>(chan: &EndpointChannel, kind: RequestKind, body: &T) {
    let bytes = message::encode_request(kind, body).unwrap();
    chan.try_send(Frame::new(bytes)).unwrap();
}

fn recv<T: serde::de::DeserializeOwned>(chan: &EndpointChannel) -> (T, Vec<CapRef>) {
    let frame = chan.try_recv().unwrap().expect("no reply");
    (message::decode_response(&frame.bytes).unwrap(), frame.caps)
}

fn call<T: serde::Serialize, R: serde::de::DeserializeOwned>(
    sys: &mut System,
    chan: &EndpointChannel,
    kind: RequestKind,
    body: &T,
) -> (R, Vec<CapRef>) {
    send(chan, kind, body);
    pump(sys);
    recv(chan)
}

#[test]
fn test_generic_number_and_string() {
    let mut sys = system();
    let client = connect(&mut sys.d0);
    let (res, _) = call::<_, GenericResponse>(
        &mut sys,
        &client,
        RequestKind::GenericNumber,
        &tandem_init::wire::GenericNumberRequest { val: 42 },
    );
    assert_eq!(res.err, ErrorCode::Ok);
    let (res, _) = call::<_, GenericResponse>(
        &mut sys,
        &client,
        RequestKind::GenericString,
        &tandem_init::wire::GenericStringRequest {
            msg: "hello init".into(),
        },
    );
    assert_eq!(res.err, ErrorCode::Ok);
}

// Local delete with no remote copies: the RAM comes back to the allocator.
#[test]
fn test_s1_local_delete_returns_ram() {
    let mut sys = system();
    let client = connect(&mut sys.d0);

    let before = sys.d0.ram().free_space();
    let (res, caps) = call::<_, MemServerResponse>(
        &mut sys,
        &client,
        RequestKind::MemServer,
        &MemServerRequest {
            size: 4096,
            alignment: BASE_PAGE_SIZE as u64,
        },
    );
    assert_eq!(res.err, ErrorCode::Ok);
    assert_eq!(res.retbytes, 4096);
    let ram_cap = caps[0];
    assert_eq!(sys.d0.ram().free_space(), before - 4096);
    let desc = sys.kernel.slot(0, ram_cap).unwrap();
    assert_eq!(desc.type_, ObjType::Ram);

    let (res, _) = call::<_, DistCapResponse>(
        &mut sys,
        &client,
        RequestKind::DistCap,
        &DistCapRequest::Delete {
            cap: ram_cap.with_root(SELF_CROOT),
        },
    );
    assert_eq!(res.err, ErrorCode::Ok);
    // Slot empty, memory back in the pool.
    assert!(sys.kernel.slot(0, ram_cap).is_none());
    assert_eq!(sys.d0.ram().free_space(), before);
    assert!(sys.d0.quiescent() && sys.d1.quiescent());
}

// Deleting the last copy of a moveable cap migrates ownership to the peer.
#[test]
fn test_s2_delete_last_moveable_moves_owner() {
    let mut sys = system();
    let client = connect(&mut sys.d0);

    // A frame whose copy was handed to core 1 (e.g. through a spawn capv).
    let desc = CapDescriptor::frame(0x6000_0000, 0x1000);
    let c0 = CapRef::new(3, 40);
    let c1 = CapRef::new(3, 41);
    sys.kernel.install(0, c0, desc, 0);
    {
        let mut mon0 = sys.kernel.monitor(0);
        let mut mon1 = sys.kernel.monitor(1);
        let t = cap_transfer_copy(&mut mon0, c0).unwrap();
        cap_from_transfer(&mut mon1, &t, c1).unwrap();
    }

    let (res, _) = call::<_, DistCapResponse>(
        &mut sys,
        &client,
        RequestKind::DistCap,
        &DistCapRequest::Delete {
            cap: c0.with_root(SELF_CROOT),
        },
    );
    assert_eq!(res.err, ErrorCode::Ok);

    // Ownership moved, the copy bit cleared, our slot nullified.
    assert_eq!(sys.kernel.owner_of(&desc), Some(1));
    assert!(!sys
        .kernel
        .remote_relations_of(1, &desc)
        .unwrap()
        .contains(Relations::COPY));
    assert!(sys.kernel.slot(0, c0).is_none());
    assert_eq!(sys.kernel.slot(1, c1), Some(desc));
    assert!(sys.d0.quiescent() && sys.d1.quiescent());
}

// Concurrent retypes of the same source: exactly one wins, the loser sees
// the same error on both cores.
#[test]
fn test_s3_retype_consensus() {
    let mut sys = system();
    let c0_client = connect(&mut sys.d0);
    let c1_client = connect(&mut sys.d1);

    let desc = CapDescriptor::ram(0x6100_0000, 0x2000);
    let src0 = CapRef::new(3, 50);
    let src1 = CapRef::new(3, 51);
    sys.kernel.install(0, src0, desc, 0);
    {
        let mut mon0 = sys.kernel.monitor(0);
        let mut mon1 = sys.kernel.monitor(1);
        let t = cap_transfer_copy(&mut mon0, src0).unwrap();
        cap_from_transfer(&mut mon1, &t, src1).unwrap();
    }

    send(
        &c0_client,
        RequestKind::DistCap,
        &DistCapRequest::Retype {
            src: src0.with_root(SELF_CROOT),
            offset: 0,
            new_type: ObjType::Frame,
            objsize: 0x1000,
            count: 2,
            dest: CapRef::new(3, 60).with_root(SELF_CROOT),
        },
    );
    send(
        &c1_client,
        RequestKind::DistCap,
        &DistCapRequest::Retype {
            src: src1.with_root(SELF_CROOT),
            offset: 0,
            new_type: ObjType::Frame,
            objsize: 0x1000,
            count: 2,
            dest: CapRef::new(3, 60).with_root(SELF_CROOT),
        },
    );
    pump(&mut sys);

    let (r0, _) = recv::<DistCapResponse>(&c0_client);
    let (r1, _) = recv::<DistCapResponse>(&c1_client);
    let oks = [r0.err, r1.err]
        .iter()
        .filter(|e| e.is_ok())
        .count();
    assert_eq!(oks, 1, "exactly one retype must win: {:?} {:?}", r0.err, r1.err);
    let loser = if r0.err.is_ok() { r1.err } else { r0.err };
    assert_eq!(loser, ErrorCode::NotRetypeable);

    // The winner's halves exist; descendants are visible across cores.
    let winner_core = if r0.err.is_ok() { 0 } else { 1 };
    assert_eq!(
        sys.kernel
            .slot(winner_core, CapRef::new(3, 60))
            .unwrap()
            .type_,
        ObjType::Frame
    );
    assert!(sys.d0.quiescent() && sys.d1.quiescent());
}

// Spawn on the other core, wait for it, see its exit code; status of the
// terminated pid keeps answering.
#[test]
fn test_s4_spawn_wait_exit() {
    let mut sys = system();
    let client = connect(&mut sys.d0);

    let (res, _) = call::<_, ProcMgmtResponse>(
        &mut sys,
        &client,
        RequestKind::ProcMgmt,
        &ProcMgmtRequest {
            core: Some(1),
            op: ProcMgmtOp::SpawnCmdline {
                cmdline: "hello".into(),
                capc: 0,
            },
        },
    );
    assert_eq!(res.err, ErrorCode::Ok);
    let pid = res.pid;
    assert_eq!(pid % 2, 1, "core 1 pids are odd");

    // Wait, which cannot answer yet.
    send(
        &client,
        RequestKind::ProcMgmt,
        &ProcMgmtRequest {
            core: Some(1),
            op: ProcMgmtOp::Wait { pid },
        },
    );
    pump(&mut sys);
    assert!(client.try_recv().unwrap().is_none(), "wait resolved early");

    // The child announces its exit through its own channel.
    let hello = sys.d1.take_client(pid).expect("child channel");
    send(
        &hello,
        RequestKind::ProcMgmt,
        &ProcMgmtRequest {
            core: Some(1),
            op: ProcMgmtOp::Exit {
                pid,
                exit_code: 42,
            },
        },
    );
    pump(&mut sys);

    let (wait, _) = recv::<WaitResponse>(&client);
    assert_eq!(wait.err, ErrorCode::Ok);
    assert_eq!(wait.exit_code, 42);

    let (status, _) = call::<_, StatusResponse>(
        &mut sys,
        &client,
        RequestKind::ProcMgmt,
        &ProcMgmtRequest {
            core: Some(1),
            op: ProcMgmtOp::Status { pid },
        },
    );
    assert_eq!(status.err, ErrorCode::Ok);
    let status = status.status.unwrap();
    assert_eq!(status.state, ProcessState::Exited);
    assert_eq!(status.exit_code, 42);
}

// Kill-all by name across cores; waiters fire with -1.
#[test]
fn test_s5_killall() {
    let mut sys = system();
    let client = connect(&mut sys.d0);

    let mut pids = Vec::new();
    for _ in 0..3 {
        let (res, _) = call::<_, ProcMgmtResponse>(
            &mut sys,
            &client,
            RequestKind::ProcMgmt,
            &ProcMgmtRequest {
                core: None,
                op: ProcMgmtOp::SpawnCmdline {
                    cmdline: "hello".into(),
                    capc: 0,
                },
            },
        );
        assert_eq!(res.err, ErrorCode::Ok);
        pids.push(res.pid);
    }

    // One waiter per copy, registered before the kill.
    let waiters: Vec<EndpointChannel> =
        pids.iter().map(|_| connect(&mut sys.d0)).collect();
    for (chan, &pid) in waiters.iter().zip(&pids) {
        send(
            chan,
            RequestKind::ProcMgmt,
            &ProcMgmtRequest {
                core: Some(0),
                op: ProcMgmtOp::Wait { pid },
            },
        );
    }
    pump(&mut sys);

    let (res, _) = call::<_, ProcMgmtResponse>(
        &mut sys,
        &client,
        RequestKind::ProcMgmt,
        &ProcMgmtRequest {
            core: None,
            op: ProcMgmtOp::KillAll {
                name: "hello".into(),
            },
        },
    );
    assert_eq!(res.err, ErrorCode::Ok);

    for chan in &waiters {
        let (wait, _) = recv::<WaitResponse>(chan);
        assert_eq!(wait.err, ErrorCode::Ok);
        assert_eq!(wait.exit_code, -1);
    }

    let (all, _) = call::<_, AllPidsResponse>(
        &mut sys,
        &client,
        RequestKind::ProcMgmt,
        &ProcMgmtRequest {
            core: None,
            op: ProcMgmtOp::AllPids,
        },
    );
    assert_eq!(all.err, ErrorCode::Ok);
    assert!(all.pids.is_empty(), "killall left {:?}", all.pids);
}

// Two concurrent deletes of the same cap: the loser wakes from the caplock
// queue, finds the cap gone, and reports NotFound.
#[test]
fn test_s6_caplock_contention() {
    let mut sys = system();
    let first = connect(&mut sys.d0);
    let second = connect(&mut sys.d0);

    let desc = CapDescriptor::frame(0x6200_0000, 0x1000);
    let c0 = CapRef::new(3, 70);
    let c1 = CapRef::new(3, 71);
    sys.kernel.install(0, c0, desc, 0);
    {
        let mut mon0 = sys.kernel.monitor(0);
        let mut mon1 = sys.kernel.monitor(1);
        let t = cap_transfer_copy(&mut mon0, c0).unwrap();
        cap_from_transfer(&mut mon1, &t, c1).unwrap();
    }

    let delete = DistCapRequest::Delete {
        cap: c0.with_root(SELF_CROOT),
    };
    send(&first, RequestKind::DistCap, &delete);
    send(&second, RequestKind::DistCap, &delete);
    pump(&mut sys);

    let (r1, _) = recv::<DistCapResponse>(&first);
    let (r2, _) = recv::<DistCapResponse>(&second);
    assert_eq!(r1.err, ErrorCode::Ok);
    assert_eq!(r2.err, ErrorCode::NotFound);
    assert!(sys.kernel.slot(0, c0).is_none());
    assert!(sys.d0.quiescent() && sys.d1.quiescent());
}

// A memserver request from the other core is forwarded to core 0 and the
// RAM cap travels back as a transfer.
#[test]
fn test_memserver_cross_core() {
    let mut sys = system();
    let client = connect(&mut sys.d1);

    let before = sys.d0.ram().free_space();
    let (res, caps) = call::<_, MemServerResponse>(
        &mut sys,
        &client,
        RequestKind::MemServer,
        &MemServerRequest {
            size: 8192,
            alignment: BASE_PAGE_SIZE as u64,
        },
    );
    assert_eq!(res.err, ErrorCode::Ok);
    assert_eq!(res.retbytes, 8192);
    assert_eq!(sys.d0.ram().free_space(), before - 8192);

    // The cap now lives on core 1 and, with no copy left on core 0,
    // ownership moved with it.
    let cap = caps[0];
    let desc = sys.kernel.slot(1, cap).unwrap();
    assert_eq!(desc.type_, ObjType::Ram);
    assert_eq!(sys.kernel.owner_of(&desc), Some(1));
    assert_eq!(sys.kernel.copies_on(0, &desc), 0);
}

#[test]
fn test_memserver_rejects_bad_alignment_and_limit() {
    let mut sys = system();
    let client = connect(&mut sys.d0);

    let (res, _) = call::<_, MemServerResponse>(
        &mut sys,
        &client,
        RequestKind::MemServer,
        &MemServerRequest {
            size: 4096,
            alignment: 512,
        },
    );
    assert_eq!(res.err, ErrorCode::BadAlignment);

    // Bind the channel to a process, then ask for more than the soft cap.
    let (res, _) = call::<_, ProcMgmtResponse>(
        &mut sys,
        &client,
        RequestKind::ProcMgmt,
        &ProcMgmtRequest {
            core: Some(0),
            op: ProcMgmtOp::SpawnCmdline {
                cmdline: "memeater".into(),
                capc: 0,
            },
        },
    );
    let pid = res.pid;
    let eater = sys.d0.take_client(pid).unwrap();
    let (res, _) = call::<_, GenericResponse>(
        &mut sys,
        &eater,
        RequestKind::SetupChannel,
        &SetupChannelRequest { pid },
    );
    assert_eq!(res.err, ErrorCode::Ok);
    let (res, _) = call::<_, MemServerResponse>(
        &mut sys,
        &eater,
        RequestKind::MemServer,
        &MemServerRequest {
            size: 2 * 1024 * 1024 * 1024,
            alignment: BASE_PAGE_SIZE as u64,
        },
    );
    assert_eq!(res.err, ErrorCode::MemoryLimitExceeded);
}

// Name lookup tried locally, then forwarded; the reply comes from the
// peer's table.
#[test]
fn test_pid_lookup_across_cores() {
    let mut sys = system();
    let client = connect(&mut sys.d0);

    let (res, _) = call::<_, ProcMgmtResponse>(
        &mut sys,
        &client,
        RequestKind::ProcMgmt,
        &ProcMgmtRequest {
            core: Some(1),
            op: ProcMgmtOp::SpawnCmdline {
                cmdline: "shell".into(),
                capc: 0,
            },
        },
    );
    let shell_pid = res.pid;

    let (res, _) = call::<_, ProcMgmtResponse>(
        &mut sys,
        &client,
        RequestKind::ProcMgmt,
        &ProcMgmtRequest {
            core: None,
            op: ProcMgmtOp::PidOf {
                name: "shell".into(),
            },
        },
    );
    assert_eq!(res.err, ErrorCode::Ok);
    assert_eq!(res.pid, shell_pid);

    let (res, _) = call::<_, ProcMgmtResponse>(
        &mut sys,
        &client,
        RequestKind::ProcMgmt,
        &ProcMgmtRequest {
            core: None,
            op: ProcMgmtOp::PidOf {
                name: "nonesuch".into(),
            },
        },
    );
    assert_eq!(res.err, ErrorCode::NotFound);
}

// ALL_PIDS merges both cores' halves.
#[test]
fn test_all_pids_merge() {
    let mut sys = system();
    let client = connect(&mut sys.d0);

    for core in [Some(0), Some(1), Some(1)] {
        let (res, _) = call::<_, ProcMgmtResponse>(
            &mut sys,
            &client,
            RequestKind::ProcMgmt,
            &ProcMgmtRequest {
                core,
                op: ProcMgmtOp::SpawnCmdline {
                    cmdline: "hello".into(),
                    capc: 0,
                },
            },
        );
        assert_eq!(res.err, ErrorCode::Ok);
    }

    let (all, _) = call::<_, AllPidsResponse>(
        &mut sys,
        &client,
        RequestKind::ProcMgmt,
        &ProcMgmtRequest {
            core: None,
            op: ProcMgmtOp::AllPids,
        },
    );
    assert_eq!(all.err, ErrorCode::Ok);
    assert_eq!(all.pids.len(), 3);
    assert_eq!(all.pids.iter().filter(|p| **p % 2 == 0).count(), 1);
    assert_eq!(all.pids.iter().filter(|p| **p % 2 == 1).count(), 2);
}

// Terminal traffic: output lands on core 0's console (also when sent from
// core 1), reads suspend until serial input arrives.
#[test]
fn test_terminal() {
    let mut sys = system();
    let c0 = connect(&mut sys.d0);
    let c1 = connect(&mut sys.d1);

    let (res, _) = call::<_, TerminalResponse>(
        &mut sys,
        &c0,
        RequestKind::Terminal,
        &TerminalRequest::Putchar('t'),
    );
    assert_eq!(res.err, ErrorCode::Ok);
    let (res, _) = call::<_, TerminalStrResponse>(
        &mut sys,
        &c1,
        RequestKind::TerminalStr,
        &TerminalStrRequest::Putstr("andem".into()),
    );
    assert_eq!(res.err, ErrorCode::Ok);
    assert_eq!(res.len, 5);
    assert_eq!(sys.d0.console().output(), b"tandem");

    // A read parks until the driver delivers input.
    send(&c0, RequestKind::Terminal, &TerminalRequest::Getchar);
    pump(&mut sys);
    assert!(c0.try_recv().unwrap().is_none());
    sys.d0.push_serial_input(b"x");
    pump(&mut sys);
    let (res, _) = recv::<TerminalResponse>(&c0);
    assert_eq!(res.err, ErrorCode::Ok);
    assert_eq!(res.c, Some('x'));
}

// Ping: resolved by an echo reply, or failed by the deferred timeout --
// the only timeout in the system.
#[test]
fn test_network_ping_echo_and_timeout() {
    let mut sys = system();
    let driver = connect(&mut sys.d0);
    let client = connect(&mut sys.d0);

    // Without a driver the ping is refused.
    let (res, _) = call::<_, NetworkPingResponse>(
        &mut sys,
        &client,
        RequestKind::Network,
        &NetworkRequest::Ping { ip: 0x0a00_0001 },
    );
    assert_eq!(res.err, ErrorCode::NotSupported);

    // The driver introduces itself.
    let (res, _) = call::<_, GenericResponse>(
        &mut sys,
        &driver,
        RequestKind::SetupChannel,
        &SetupChannelRequest { pid: 2 },
    );
    assert_eq!(res.err, ErrorCode::Ok);
    let (res, _) = call::<_, GenericResponse>(
        &mut sys,
        &driver,
        RequestKind::Network,
        &NetworkRequest::Init {
            mac: [2, 0, 0, 0, 0, 1],
        },
    );
    assert_eq!(res.err, ErrorCode::Ok);

    // Echo reply resolves the ping.
    send(
        &client,
        RequestKind::Network,
        &NetworkRequest::Ping { ip: 0x0a00_0001 },
    );
    pump(&mut sys);
    assert!(client.try_recv().unwrap().is_none());
    let mut packet = 0x0a00_0001u32.to_le_bytes().to_vec();
    packet.extend_from_slice(b"echo");
    let (res, _) = call::<_, GenericResponse>(
        &mut sys,
        &driver,
        RequestKind::Network,
        &NetworkRequest::Receive { packet },
    );
    assert_eq!(res.err, ErrorCode::Ok);
    let (res, _) = recv::<NetworkPingResponse>(&client);
    assert_eq!(res.err, ErrorCode::Ok);

    // An unanswered ping times out.
    send(
        &client,
        RequestKind::Network,
        &NetworkRequest::Ping { ip: 0x0a00_0002 },
    );
    for _ in 0..200 {
        sys.d0.poll();
        sys.d1.poll();
    }
    let (res, _) = recv::<NetworkPingResponse>(&client);
    assert_eq!(res.err, ErrorCode::Timeout);
}

// Full bring-up: core 0 boots core 1, hands over RAM, bootinfo, strings
// and module caps, then both run as init domains over the same frame.
#[test]
fn test_bringup_end_to_end() {
    use tandem_coreboot::boot::{BootEnv, BootFrame};
    use tandem_coreboot::coredata::MemoryRegion;
    use tandem_coreboot::elf::testimage;

    struct Env {
        next_phys: u64,
        next_slot: u32,
        kernel: FakeKernel,
        images: Vec<Vec<u8>>,
    }
    impl BootEnv for Env {
        fn ram_alloc_aligned(
            &mut self,
            bytes: u64,
            alignment: u64,
        ) -> Result<(CapRef, u64), ErrorCode> {
            let phys = self.next_phys.div_ceil(alignment) * alignment;
            self.next_phys = phys + bytes;
            let cap = self.slot_alloc()?;
            self.kernel.install(0, cap, CapDescriptor::ram(phys, bytes), 0);
            Ok((cap, phys))
        }
        fn frame_alloc(&mut self, bytes: usize) -> Result<BootFrame, ErrorCode> {
            let rounded = bytes.div_ceil(BASE_PAGE_SIZE) * BASE_PAGE_SIZE;
            let (cap, phys) =
                self.ram_alloc_aligned(rounded as u64, BASE_PAGE_SIZE as u64)?;
            Ok(BootFrame {
                cap,
                phys,
                bytes: vec![0u8; rounded],
            })
        }
        fn module_bytes(&mut self, module: &ModuleRegion) -> Result<Vec<u8>, ErrorCode> {
            self.images
                .get(module.slot as usize)
                .cloned()
                .ok_or(ErrorCode::NotFound)
        }
        fn slot_alloc(&mut self) -> Result<CapRef, ErrorCode> {
            self.next_slot += 1;
            Ok(CapRef::new(3, self.next_slot))
        }
        fn flush_cache(&mut self, _phys: u64, _bytes: usize) {}
    }

    let kernel = FakeKernel::new();
    let (mmstrings, offsets) = MultibootStrings::pack(&[
        "boot_armv8_generic",
        "cpu_a57_qemu loglevel=2",
        "init bootinfo",
        "hello",
    ]);
    let images = vec![
        testimage::build("boot_entry_psci"),
        testimage::build("arch_init"),
        testimage::build("main"),
        testimage::build("main"),
    ];
    let modules: Vec<ModuleRegion> = offsets
        .iter()
        .enumerate()
        .map(|(i, &off)| {
            let m = ModuleRegion {
                base: 0x4000_0000 + (i as u64) * 0x10_0000,
                bytes: images[i].len() as u64,
                slot: i as u32,
                cmdline_offset: off,
            };
            kernel.install(
                0,
                CapRef::new(tandem_os_common::capspace::CNODE_MODULE, m.slot),
                CapDescriptor::new(ObjType::DeviceFrame, m.base, m.bytes),
                0,
            );
            m
        })
        .collect();
    let bi = BootInfo {
        ram: vec![RamRegion {
            base: 0x8000_0000,
            bytes: 64 * 1024 * 1024,
        }],
        modules,
    };

    let frame = UmpFrame::new();
    let ump0 = UmpChannel::connect(frame.clone(), true);
    let ump1 = UmpChannel::connect(frame, false);

    let app_kernel = kernel.clone();
    let secondary = std::thread::spawn(move || {
        bringup::app_main(Box::new(app_kernel.monitor(1)), ump1).unwrap()
    });

    let mut env = Env {
        next_phys: 0x9000_0000,
        next_slot: 100,
        kernel: kernel.clone(),
        images,
    };
    let cfg = bringup::PlatformConfig {
        boot_driver: "boot_armv8_generic".into(),
        cpu_driver: "cpu_a57_qemu".into(),
        init_binary: "init".into(),
        mpid: 1,
        peer_ram_bytes: 16 * 1024 * 1024,
        urpc_region: MemoryRegion {
            base: 0x7000_0000,
            length: BASE_PAGE_SIZE as u64,
        },
        mmstrings_base: 0x6000_0000,
    };
    let (d0, booted) = bringup::bsp_main(
        Box::new(kernel.monitor(0)),
        &mut env,
        bi.clone(),
        mmstrings,
        ump0,
        &cfg,
    )
    .unwrap();
    let d1 = secondary.join().unwrap();

    // The kernel started exactly the requested core.
    assert_eq!(kernel.spawned_cores().len(), 1);
    assert_eq!(kernel.spawned_cores()[0].0, 1);
    assert_eq!(kernel.spawned_cores()[0].2, booted.core_data.phys);

    // The secondary rebuilt every module cap.
    for m in &bi.modules {
        let cap = CapRef::new(tandem_os_common::capspace::CNODE_MODULE, m.slot);
        assert!(kernel.slot(1, cap).is_some());
    }

    // The channel is now in async mode: spawn on core 1 from core 0.
    let mut sys = System { kernel, d0, d1 };
    let client = connect(&mut sys.d0);
    let (res, _) = call::<_, ProcMgmtResponse>(
        &mut sys,
        &client,
        RequestKind::ProcMgmt,
        &ProcMgmtRequest {
            core: Some(1),
            op: ProcMgmtOp::SpawnCmdline {
                cmdline: "hello".into(),
                capc: 0,
            },
        },
    );
    assert_eq!(res.err, ErrorCode::Ok);
    assert_eq!(res.pid % 2, 1);
}

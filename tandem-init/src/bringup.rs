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

//! Bring-up of the two init domains.
//!
//! The BSP seeds its allocator from bootinfo, carves out the secondary
//! core's share, boots that core and ships it the boot environment; the
//! secondary mirrors the hand-off and seeds itself from what arrived.
//! Both sides then switch the URPC frame to asynchronous multiplexed
//! operation and enter their event loops.

use alloc::boxed::Box;
use alloc::string::String;
use log::info;

use tandem_coreboot::boot::{boot_core, BootEnv, BootedCore};
use tandem_coreboot::coredata::MemoryRegion;
use tandem_coreboot::handover::{recv_handover, send_handover};
use tandem_memory_manager::RamAllocator;
use tandem_os_common::bootinfo::{BootInfo, MultibootStrings};
use tandem_os_common::capspace::CapAddr;
use tandem_os_common::error::ErrorCode;
use tandem_os_common::monitor::MonitorInterface;
use tandem_proc_manager::ProcessManager;
use tandem_rpc::ump::UmpChannel;

use crate::domain::InitDomain;
use crate::spawn::{ChannelRegistry, ModuleSpawn};

pub struct PlatformConfig {
    pub boot_driver: String,
    pub cpu_driver: String,
    pub init_binary: String,
    pub mpid: CapAddr,
    /// RAM handed to the secondary core.
    pub peer_ram_bytes: u64,
    /// Identity of the shared URPC frame.
    pub urpc_region: MemoryRegion,
    /// Physical base of the multiboot strings page.
    pub mmstrings_base: u64,
}

/// Core 0 bring-up: boot the second core, hand over its boot environment,
/// then run as an init domain.
pub fn bsp_main(
    mut mon: Box<dyn MonitorInterface + Send>,
    env: &mut dyn BootEnv,
    bi: BootInfo,
    mmstrings: MultibootStrings,
    mut ump: UmpChannel,
    cfg: &PlatformConfig,
) -> Result<(InitDomain<ModuleSpawn>, BootedCore), ErrorCode> {
    let mut ram = RamAllocator::from_bootinfo(&bi);
    let peer_ram = ram
        .carve_for_peer(cfg.peer_ram_bytes)
        .map_err(ErrorCode::from)?;

    let booted = boot_core(
        mon.as_mut(),
        env,
        &bi,
        &mmstrings,
        cfg.mpid,
        &cfg.boot_driver,
        &cfg.cpu_driver,
        &cfg.init_binary,
        cfg.urpc_region,
    )?;

    send_handover(
        mon.as_mut(),
        &mut ump,
        &bi,
        &mmstrings,
        peer_ram,
        cfg.mmstrings_base,
    )?;
    info!("secondary core handed its boot environment");

    let registry = ChannelRegistry::new();
    let spawn = ModuleSpawn::new(bi, mmstrings, registry.clone());
    let proc = ProcessManager::new(spawn, 0);
    Ok((InitDomain::new(0, mon, ram, proc, registry, ump), booted))
}

/// Secondary-core bring-up: receive the boot environment, seed the local
/// allocator from the delivered range, rebuild the module caps, then run.
pub fn app_main(
    mut mon: Box<dyn MonitorInterface + Send>,
    mut ump: UmpChannel,
) -> Result<InitDomain<ModuleSpawn>, ErrorCode> {
    let handover = recv_handover(mon.as_mut(), &mut ump)?;
    info!(
        "received bootinfo ({} modules), ram [{:#x}, {:#x})",
        handover.bootinfo.modules.len(),
        handover.setup.ram.base,
        handover.setup.ram.base + handover.setup.ram.bytes
    );
    let ram = RamAllocator::from_range(handover.setup.ram.base, handover.setup.ram.bytes);

    let registry = ChannelRegistry::new();
    let spawn = ModuleSpawn::new(handover.bootinfo, handover.mmstrings, registry.clone());
    let proc = ProcessManager::new(spawn, 1);
    Ok(InitDomain::new(1, mon, ram, proc, registry, ump))
}

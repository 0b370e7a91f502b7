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

//! Booting a second core.

use alloc::string::String;
use alloc::vec::Vec;
use log::{debug, info};

use tandem_os_common::bootinfo::{cmdline_args, BootInfo, ModuleRegion, MultibootStrings};
use tandem_os_common::capspace::{CapAddr, CapRef, ObjType};
use tandem_os_common::error::ErrorCode;
use tandem_os_common::monitor::MonitorInterface;
use tandem_os_common::{CoreId, BASE_PAGE_SIZE};

use crate::coredata::{CoreData, MemoryRegion, BOOT_MAGIC_PSCI, CMDLINE_MAX};
use crate::elf;
use crate::{
    ARMV8_CORE_DATA_PAGES, ARMV8_KERNEL_OFFSET, CORE_DATA_FRAME_SIZE, KCB_ALIGNMENT, OBJSIZE_KCB,
    STACK_FRAME_SIZE,
};

/// A frame allocated for boot, mapped writable in the BSP.
pub struct BootFrame {
    pub cap: CapRef,
    pub phys: u64,
    pub bytes: Vec<u8>,
}

/// The BSP's window onto memory and paging during bring-up.
pub trait BootEnv {
    /// Allocates RAM and returns its capability and physical base.
    fn ram_alloc_aligned(&mut self, bytes: u64, alignment: u64) -> Result<(CapRef, u64), ErrorCode>;

    /// Allocates and maps a zeroed frame.
    fn frame_alloc(&mut self, bytes: usize) -> Result<BootFrame, ErrorCode>;

    /// Maps a multiboot module and returns its bytes.
    fn module_bytes(&mut self, module: &ModuleRegion) -> Result<Vec<u8>, ErrorCode>;

    /// Allocates an empty CSpace slot.
    fn slot_alloc(&mut self) -> Result<CapRef, ErrorCode>;

    /// Writes the region back to memory and invalidates the instruction
    /// cache over it, so the fresh core reads what we wrote.
    fn flush_cache(&mut self, phys: u64, bytes: usize);
}

/// Everything constructed for the new core; the frames stay alive for the
/// lifetime of that core.
pub struct BootedCore {
    pub kcb: CapRef,
    pub boot_entry: u64,
    pub cpu_entry: u64,
    pub core_data: BootFrame,
    pub stack: BootFrame,
    pub cpu_memory: BootFrame,
}

fn create_kcb(
    mon: &mut dyn MonitorInterface,
    env: &mut dyn BootEnv,
) -> Result<CapRef, ErrorCode> {
    let (ram, _phys) = env.ram_alloc_aligned(OBJSIZE_KCB, KCB_ALIGNMENT)?;
    let kcb = env.slot_alloc()?;
    mon.retype(
        kcb.into(),
        ram.into(),
        0,
        ObjType::KernelControlBlock,
        OBJSIZE_KCB,
        1,
    )
    .map_err(ErrorCode::from)?;
    Ok(kcb)
}

struct LoadedDriver {
    entry: u64,
    module: ModuleRegion,
    _image: BootFrame,
}

/// Loads a driver module into fresh physical memory and relocates it for
/// `load_offset`, returning the (offset) physical entry point.
fn load_driver(
    env: &mut dyn BootEnv,
    bi: &BootInfo,
    mmstrings: &MultibootStrings,
    name: &str,
    entry_symbol: &str,
    load_offset: u64,
) -> Result<LoadedDriver, ErrorCode> {
    let module = bi
        .find_module(mmstrings, name)
        .ok_or(ErrorCode::NotFound)?
        .clone();
    let binary = env.module_bytes(&module)?;

    let size = elf::virtual_size(&binary)?;
    let mut dest = env.frame_alloc(size)?;
    let entry_va = elf::find_symbol(&binary, entry_symbol)?;
    let phys_entry = elf::load_image(&binary, &mut dest.bytes, dest.phys, entry_va)?;
    elf::relocate(&binary, &mut dest.bytes, dest.phys, load_offset)?;
    debug!(
        "loaded {} at {:#x}, entry {:#x} (+{:#x})",
        name, dest.phys, phys_entry, load_offset
    );
    Ok(LoadedDriver {
        entry: phys_entry + load_offset,
        module,
        _image: dest,
    })
}

/// Boots the core `mpid`: builds its kernel control block, loads and
/// relocates the boot and CPU drivers, prepares stack and core-data, and
/// invokes the kernel. The URPC frame identity is advertised to the new
/// core through the core-data page.
#[allow(clippy::too_many_arguments)]
pub fn boot_core(
    mon: &mut dyn MonitorInterface,
    env: &mut dyn BootEnv,
    bi: &BootInfo,
    mmstrings: &MultibootStrings,
    mpid: CapAddr,
    boot_driver: &str,
    cpu_driver: &str,
    init: &str,
    urpc_frame: MemoryRegion,
) -> Result<BootedCore, ErrorCode> {
    let kcb = create_kcb(mon, env)?;

    let boot = load_driver(env, bi, mmstrings, boot_driver, "boot_entry_psci", 0)?;
    let cpu = load_driver(env, bi, mmstrings, cpu_driver, "arch_init", ARMV8_KERNEL_OFFSET)?;

    let mut core_data_frame = env.frame_alloc(CORE_DATA_FRAME_SIZE)?;
    let stack = env.frame_alloc(STACK_FRAME_SIZE)?;

    // The monitor binary runs from its module frame; the new core only
    // needs to know where it lies.
    let monitor_module = bi
        .find_module(mmstrings, init)
        .ok_or(ErrorCode::NotFound)?
        .clone();
    let monitor_binary = env.module_bytes(&monitor_module)?;

    let cpu_memory = env.frame_alloc(
        ARMV8_CORE_DATA_PAGES * BASE_PAGE_SIZE + elf::virtual_size(&monitor_binary)?,
    )?;

    let mut cmdline = String::new();
    if let Some(opts) = mmstrings
        .cmdline_at(cpu.module.cmdline_offset)
        .and_then(cmdline_args)
    {
        cmdline.push_str(opts);
        cmdline.truncate(CMDLINE_MAX);
    }

    let core_data = CoreData {
        boot_magic: BOOT_MAGIC_PSCI,
        cpu_driver_stack: stack.phys + stack.bytes.len() as u64,
        cpu_driver_stack_limit: stack.phys,
        cpu_driver_entry: cpu.entry,
        cpu_driver_cmdline: cmdline,
        memory: MemoryRegion {
            base: cpu_memory.phys,
            length: cpu_memory.bytes.len() as u64,
        },
        urpc_frame,
        monitor_binary: MemoryRegion {
            base: monitor_module.base,
            length: monitor_module.bytes,
        },
        kcb: {
            let kcb_desc = mon.cap_identify(kcb.into()).map_err(ErrorCode::from)?;
            kcb_desc.base
        },
        src_core_id: mon.core_id(),
        dst_core_id: mpid as CoreId,
        src_arch_id: mon.core_id() as u32,
        dst_arch_id: mpid,
    };
    core_data.write_to(&mut core_data_frame.bytes)?;

    env.flush_cache(core_data_frame.phys, core_data_frame.bytes.len());

    mon.spawn_core(mpid, boot.entry, core_data_frame.phys)
        .map_err(ErrorCode::from)?;
    info!("spawned core {} (boot entry {:#x})", mpid, boot.entry);

    Ok(BootedCore {
        kcb,
        boot_entry: boot.entry,
        cpu_entry: cpu.entry,
        core_data: core_data_frame,
        stack,
        cpu_memory,
    })
}

/// Shuts down a previously booted core and frees its resources. Only the
/// BSP may manage cores; stopping core 0 this way is an error.
pub fn shutdown_core(core: CoreId) -> Result<(), ErrorCode> {
    if core == 0 {
        return Err(ErrorCode::InvalidArgs);
    }
    // The kernel offers no park/halt primitive for a running core yet.
    Err(ErrorCode::NotSupported)
}

/// Shuts down `core` so a later `boot_core` can bring it back up.
pub fn reboot_core(core: CoreId) -> Result<(), ErrorCode> {
    shutdown_core(core)
}

/// Halts execution of `core` without releasing its resources.
pub fn suspend_core(core: CoreId) -> Result<(), ErrorCode> {
    if core == 0 {
        return Err(ErrorCode::InvalidArgs);
    }
    Err(ErrorCode::NotSupported)
}

/// Resumes a previously suspended core.
pub fn resume_core(core: CoreId) -> Result<(), ErrorCode> {
    if core == 0 {
        return Err(ErrorCode::InvalidArgs);
    }
    Err(ErrorCode::NotSupported)
}

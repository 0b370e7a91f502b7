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

//! The loader backend used by the init domain.
//!
//! Binary images come from multiboot modules, or from the filesystem for
//! paths under /SDCARD/. The loader proper (address space, dispatcher,
//! argument page) lives below this interface; what init must take over is
//! the sync IPC endpoint of every child, which the backend publishes to a
//! registry the event loop drains.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::trace;
use spin::Mutex;

use tandem_os_common::bootinfo::{cmdline_args, parse_args, BootInfo, MultibootStrings};
use tandem_proc_interface::{
    Pid, ProcessControl, ProcessManagerError, SpawnArgs, SpawnInterface,
};
use tandem_rpc::endpoint::{endpoint_pair, EndpointChannel};

pub const SDCARD_PREFIX: &str = "/SDCARD/";

/// Channels of freshly spawned children, to be adopted by the event loop;
/// the client end is handed to the child.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    inner: Arc<Mutex<Vec<(Pid, EndpointChannel, EndpointChannel)>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self { Self::default() }

    fn publish(&self, pid: Pid, server: EndpointChannel, client: EndpointChannel) {
        self.inner.lock().push((pid, server, client));
    }

    /// Removes and returns all channels registered since the last drain.
    pub fn drain(&self) -> Vec<(Pid, EndpointChannel, EndpointChannel)> {
        core::mem::take(&mut *self.inner.lock())
    }
}

pub struct ModuleImage {
    name: String,
}

/// A running child as seen by the process manager.
pub struct SpawnedProcess {
    pid: Pid,
    running: bool,
}

impl ProcessControl for SpawnedProcess {
    fn start(&mut self) -> Result<(), ProcessManagerError> {
        trace!("start pid {}", self.pid);
        self.running = true;
        Ok(())
    }
    fn suspend(&mut self) -> Result<(), ProcessManagerError> {
        self.running = false;
        Ok(())
    }
    fn resume(&mut self) -> Result<(), ProcessManagerError> {
        self.running = true;
        Ok(())
    }
    fn kill(&mut self) -> Result<(), ProcessManagerError> {
        self.running = false;
        Ok(())
    }
    fn cleanup(&mut self) {}
}

/// Loads binaries from the module list and publishes child channels.
pub struct ModuleSpawn {
    bootinfo: BootInfo,
    mmstrings: MultibootStrings,
    registry: ChannelRegistry,
    filesystem_mounted: bool,
}

impl ModuleSpawn {
    pub fn new(bootinfo: BootInfo, mmstrings: MultibootStrings, registry: ChannelRegistry) -> Self {
        ModuleSpawn {
            bootinfo,
            mmstrings,
            registry,
            filesystem_mounted: false,
        }
    }

    pub fn set_filesystem_mounted(&mut self, mounted: bool) {
        self.filesystem_mounted = mounted;
    }
}

impl SpawnInterface for ModuleSpawn {
    type Image = ModuleImage;
    type Process = SpawnedProcess;

    fn load(&mut self, path: &str) -> Result<(ModuleImage, Vec<String>), ProcessManagerError> {
        if path.len() >= SDCARD_PREFIX.len()
            && path[..SDCARD_PREFIX.len()].eq_ignore_ascii_case(SDCARD_PREFIX)
        {
            // Filesystem-backed binaries are loaded through the FAT32
            // service; without a mounted card there is nothing to run.
            if !self.filesystem_mounted {
                return Err(ProcessManagerError::ModuleNotFound);
            }
            return Ok((
                ModuleImage {
                    name: String::from(path),
                },
                parse_args(path),
            ));
        }
        let module = self
            .bootinfo
            .find_module(&self.mmstrings, path)
            .ok_or(ProcessManagerError::ModuleNotFound)?;
        // Default argv comes from the module-list command line.
        let cmdline = self
            .mmstrings
            .cmdline_at(module.cmdline_offset)
            .unwrap_or(path);
        let mut argv = parse_args(path);
        if let Some(args) = cmdline_args(cmdline) {
            argv.extend(parse_args(args));
        }
        Ok((
            ModuleImage {
                name: String::from(path),
            },
            argv,
        ))
    }

    fn spawn(
        &mut self,
        image: ModuleImage,
        args: SpawnArgs,
    ) -> Result<SpawnedProcess, ProcessManagerError> {
        trace!("spawn {} pid {} argv {:?}", image.name, args.pid, args.argv);
        // The loader set up the child; adopt its sync endpoint.
        let (server, client) = endpoint_pair();
        self.registry.publish(args.pid, server, client);
        Ok(SpawnedProcess {
            pid: args.pid,
            running: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_os_common::bootinfo::ModuleRegion;

    fn spawner() -> ModuleSpawn {
        let (mmstrings, offsets) = MultibootStrings::pack(&["hello default args", "shell"]);
        let bootinfo = BootInfo {
            ram: Vec::new(),
            modules: offsets
                .iter()
                .enumerate()
                .map(|(i, &off)| ModuleRegion {
                    base: 0x4000_0000,
                    bytes: 0x1000,
                    slot: i as u32,
                    cmdline_offset: off,
                })
                .collect(),
        };
        ModuleSpawn::new(bootinfo, mmstrings, ChannelRegistry::new())
    }

    #[test]
    fn test_load_module_default_args() {
        let mut s = spawner();
        let (_, argv) = s.load("hello").unwrap();
        assert_eq!(argv, alloc::vec!["hello", "default", "args"]);
        assert_eq!(s.load("nonesuch").err(), Some(ProcessManagerError::ModuleNotFound));
    }

    #[test]
    fn test_sdcard_requires_mounted_filesystem() {
        let mut s = spawner();
        assert_eq!(
            s.load("/SDCARD/TOOL").err(),
            Some(ProcessManagerError::ModuleNotFound)
        );
        s.set_filesystem_mounted(true);
        assert!(s.load("/SDCARD/TOOL").is_ok());
        // Prefix match is case-insensitive, like the FAT it names.
        assert!(s.load("/sdcard/TOOL").is_ok());
    }

    #[test]
    fn test_spawn_publishes_channel() {
        let registry = ChannelRegistry::new();
        let (mmstrings, _) = MultibootStrings::pack(&[]);
        let mut s = ModuleSpawn::new(BootInfo::default(), mmstrings, registry.clone());
        let proc = s
            .spawn(
                ModuleImage {
                    name: String::from("hello"),
                },
                SpawnArgs {
                    pid: 2,
                    argv: alloc::vec![String::from("hello")],
                    caps: Vec::new(),
                    stdin_frame: Default::default(),
                    stdout_frame: Default::default(),
                },
            )
            .unwrap();
        assert_eq!(proc.pid, 2);
        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, 2);
        assert!(registry.drain().is_empty());
    }
}

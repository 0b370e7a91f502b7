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

//! Boot-time descriptors.
//!
//! The kernel hands the BSP init domain a table of physical memory regions
//! and loaded multiboot modules, plus a page of module command-line strings.
//! Both are installed once at boot and read-only afterwards; the BSP ships
//! byte-for-byte copies to the secondary core during bring-up.

extern crate alloc;
use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::capspace::CapAddr;

/// A usable RAM region.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RamRegion {
    pub base: u64,
    pub bytes: u64,
}

/// A multiboot module: a binary loaded by the bootloader, its bytes covered
/// by a device-frame-like capability in the module CNode.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModuleRegion {
    pub base: u64,
    pub bytes: u64,
    /// Slot of the module cap within the module CNode.
    pub slot: CapAddr,
    /// Offset of the module's command line in the multiboot strings page.
    pub cmdline_offset: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BootInfo {
    pub ram: Vec<RamRegion>,
    pub modules: Vec<ModuleRegion>,
}

impl BootInfo {
    /// Finds a module whose binary name matches `name` (the first token of
    /// its command line).
    pub fn find_module<'a>(
        &'a self,
        mmstrings: &MultibootStrings,
        name: &str,
    ) -> Option<&'a ModuleRegion> {
        self.modules.iter().find(|m| {
            mmstrings
                .cmdline_at(m.cmdline_offset)
                .map(|c| binary_name(c) == name)
                .unwrap_or(false)
        })
    }
}

/// The multiboot strings page: nul-terminated command lines packed into one
/// base page, addressed by byte offset.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultibootStrings {
    pub bytes: Vec<u8>,
}

impl MultibootStrings {
    pub fn new(bytes: Vec<u8>) -> Self { MultibootStrings { bytes } }

    /// Builds a strings page from command lines, returning their offsets.
    pub fn pack(cmdlines: &[&str]) -> (Self, Vec<u32>) {
        let mut bytes = Vec::new();
        let mut offsets = Vec::with_capacity(cmdlines.len());
        for c in cmdlines {
            offsets.push(bytes.len() as u32);
            bytes.extend_from_slice(c.as_bytes());
            bytes.push(0);
        }
        (MultibootStrings { bytes }, offsets)
    }

    /// The command line stored at `offset`.
    pub fn cmdline_at(&self, offset: u32) -> Option<&str> {
        let start = offset as usize;
        if start >= self.bytes.len() {
            return None;
        }
        let end = start + self.bytes[start..].iter().position(|&b| b == 0)?;
        core::str::from_utf8(&self.bytes[start..end]).ok()
    }
}

/// First token of a command line: the binary name (possibly a path).
pub fn binary_name(cmdline: &str) -> &str {
    cmdline.split_whitespace().next().unwrap_or(cmdline)
}

/// The arguments following the binary name, if any.
pub fn cmdline_args(cmdline: &str) -> Option<&str> {
    let name = binary_name(cmdline);
    let rest = cmdline[name.len()..].trim_start();
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

/// Splits a command line into argv, collapsing runs of whitespace.
pub fn parse_args(cmdline: &str) -> Vec<String> {
    cmdline.split_whitespace().map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn sample() -> (BootInfo, MultibootStrings) {
        let (mmstrings, offsets) =
            MultibootStrings::pack(&["cpu_a57_qemu loglevel=2", "init bootinfo", "hello a b"]);
        let bi = BootInfo {
            ram: vec![RamRegion {
                base: 0x8000_0000,
                bytes: 64 * 1024 * 1024,
            }],
            modules: offsets
                .iter()
                .enumerate()
                .map(|(i, &off)| ModuleRegion {
                    base: 0x4000_0000 + (i as u64) * 0x10_0000,
                    bytes: 0x8_0000,
                    slot: i as CapAddr,
                    cmdline_offset: off,
                })
                .collect(),
        };
        (bi, mmstrings)
    }

    #[test]
    fn test_find_module() {
        let (bi, mmstrings) = sample();
        let m = bi.find_module(&mmstrings, "hello").unwrap();
        assert_eq!(m.slot, 2);
        assert!(bi.find_module(&mmstrings, "nonesuch").is_none());
    }

    #[test]
    fn test_cmdline_parsing() {
        let (bi, mmstrings) = sample();
        let m = bi.find_module(&mmstrings, "cpu_a57_qemu").unwrap();
        let cmdline = mmstrings.cmdline_at(m.cmdline_offset).unwrap();
        assert_eq!(binary_name(cmdline), "cpu_a57_qemu");
        assert_eq!(cmdline_args(cmdline), Some("loglevel=2"));
        assert_eq!(parse_args("hello  a   b"), vec!["hello", "a", "b"]);
        assert_eq!(cmdline_args("init"), None);
    }

    #[test]
    fn test_bootinfo_wire_roundtrip() {
        let (bi, _) = sample();
        let bytes = postcard::to_allocvec(&bi).unwrap();
        let back: BootInfo = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back.modules, bi.modules);
        assert_eq!(back.ram, bi.ram);
    }
}

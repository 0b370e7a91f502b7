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

//! Tandem OS RAM allocator.
//!
//! Each init domain owns the physical memory it was handed at boot: the
//! BSP seeds from the bootinfo RAM regions (minus the slice reserved for
//! the secondary core), the secondary from the range delivered over the
//! URPC channel. Allocation is first-fit over a coalescing free list;
//! freeing returns reclaimed RAM (e.g. from a distributed delete-last) to
//! the pool.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
use alloc::vec::Vec;
use log::{debug, trace};
use smallvec::SmallVec;

use tandem_memory_interface::MemoryManagerError;
use tandem_os_common::bootinfo::{BootInfo, RamRegion};
use tandem_os_common::BASE_PAGE_SIZE;

// Free-block capacity before spillover to the heap.
const FREE_LIST_CAPACITY: usize = 32;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct FreeBlock {
    base: u64,
    bytes: u64,
}

pub struct RamAllocator {
    free: SmallVec<[FreeBlock; FREE_LIST_CAPACITY]>,
    total_bytes: u64,
    allocated_bytes: u64,
    // Allocations over all time, for statistics.
    requested_bytes: u64,
    alloc_failures: u64,
}

impl RamAllocator {
    pub fn new() -> Self {
        RamAllocator {
            free: SmallVec::new(),
            total_bytes: 0,
            allocated_bytes: 0,
            requested_bytes: 0,
            alloc_failures: 0,
        }
    }

    /// Seeds the allocator from the bootinfo RAM regions (BSP).
    pub fn from_bootinfo(bi: &BootInfo) -> Self {
        let mut m = Self::new();
        for r in &bi.ram {
            m.add_region(r.base, r.bytes);
        }
        m
    }

    /// Seeds the allocator from a single delivered range (secondary core).
    pub fn from_range(base: u64, bytes: u64) -> Self {
        let mut m = Self::new();
        m.add_region(base, bytes);
        m
    }

    pub fn add_region(&mut self, base: u64, bytes: u64) {
        assert!(bytes > 0 && base.checked_add(bytes).is_some());
        trace!("add region [{:#x}, {:#x})", base, base + bytes);
        self.total_bytes += bytes;
        self.insert_free(FreeBlock { base, bytes });
    }

    /// Carves `bytes` out of the pool for the secondary core before
    /// allocations begin; the slice travels in the boot hand-off.
    pub fn carve_for_peer(&mut self, bytes: u64) -> Result<RamRegion, MemoryManagerError> {
        let base = self.alloc_aligned(bytes, BASE_PAGE_SIZE as u64)?;
        // The peer owns this slice outright; it no longer counts here.
        self.total_bytes -= bytes;
        self.allocated_bytes -= bytes;
        Ok(RamRegion { base, bytes })
    }

    /// First-fit aligned allocation; returns the physical base.
    pub fn alloc_aligned(&mut self, bytes: u64, alignment: u64) -> Result<u64, MemoryManagerError> {
        if bytes == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return Err(MemoryManagerError::BadAlignment);
        }
        let bytes = round_up(bytes, BASE_PAGE_SIZE as u64);
        for i in 0..self.free.len() {
            let blk = self.free[i];
            let aligned = round_up(blk.base, alignment);
            let pad = aligned - blk.base;
            if blk.bytes < pad + bytes {
                continue;
            }
            self.free.remove(i);
            if pad > 0 {
                self.insert_free(FreeBlock {
                    base: blk.base,
                    bytes: pad,
                });
            }
            let tail = blk.bytes - pad - bytes;
            if tail > 0 {
                self.insert_free(FreeBlock {
                    base: aligned + bytes,
                    bytes: tail,
                });
            }
            self.allocated_bytes += bytes;
            self.requested_bytes += bytes;
            trace!("alloc {:#x} bytes at {:#x}", bytes, aligned);
            return Ok(aligned);
        }
        self.alloc_failures += 1;
        debug!("allocation request failed (out of space)");
        Err(MemoryManagerError::OutOfMemory)
    }

    pub fn alloc(&mut self, bytes: u64) -> Result<u64, MemoryManagerError> {
        self.alloc_aligned(bytes, BASE_PAGE_SIZE as u64)
    }

    /// Returns a previously allocated (or reclaimed) range to the pool.
    pub fn free(&mut self, base: u64, bytes: u64) -> Result<(), MemoryManagerError> {
        let bytes = round_up(bytes, BASE_PAGE_SIZE as u64);
        if bytes == 0 || self.allocated_bytes < bytes {
            return Err(MemoryManagerError::InvalidRegion);
        }
        self.allocated_bytes -= bytes;
        self.insert_free(FreeBlock { base, bytes });
        Ok(())
    }

    fn insert_free(&mut self, blk: FreeBlock) {
        let pos = self
            .free
            .iter()
            .position(|b| b.base > blk.base)
            .unwrap_or(self.free.len());
        self.free.insert(pos, blk);
        self.coalesce_around(pos);
    }

    fn coalesce_around(&mut self, pos: usize) {
        // Merge with successor first so indices stay valid.
        if pos + 1 < self.free.len()
            && self.free[pos].base + self.free[pos].bytes == self.free[pos + 1].base
        {
            self.free[pos].bytes += self.free[pos + 1].bytes;
            self.free.remove(pos + 1);
        }
        if pos > 0 && self.free[pos - 1].base + self.free[pos - 1].bytes == self.free[pos].base {
            self.free[pos - 1].bytes += self.free[pos].bytes;
            self.free.remove(pos);
        }
    }

    pub fn total_space(&self) -> u64 { self.total_bytes }
    pub fn allocated_space(&self) -> u64 { self.allocated_bytes }
    pub fn free_space(&self) -> u64 { self.total_bytes - self.allocated_bytes }
    pub fn total_requested_space(&self) -> u64 { self.requested_bytes }
    pub fn alloc_failures(&self) -> u64 { self.alloc_failures }

    /// Free blocks, largest first; used by debug dumps.
    pub fn free_blocks(&self) -> Vec<(u64, u64)> {
        let mut v: Vec<(u64, u64)> = self.free.iter().map(|b| (b.base, b.bytes)).collect();
        v.sort_by(|a, b| b.1.cmp(&a.1));
        v
    }
}

impl Default for RamAllocator {
    fn default() -> Self { Self::new() }
}

fn round_up(value: u64, align: u64) -> u64 { value.div_ceil(align) * align }

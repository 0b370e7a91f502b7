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

//! ELF loading for the boot and CPU driver images.
//!
//! Driver images carry exactly one loadable segment and, being
//! position-independent kernels, only `R_AARCH64_RELATIVE` relocations.
//! Anything else in the image is a build error we refuse to boot.

use goblin::elf::reloc::R_AARCH64_RELATIVE;
use goblin::elf::Elf;
use log::debug;

use tandem_os_common::error::ErrorCode;

fn parse(binary: &[u8]) -> Result<Elf<'_>, ErrorCode> {
    Elf::parse(binary).map_err(|_| ErrorCode::InvalidArgs)
}

/// Memory footprint of the image once loaded: the span of its loadable
/// segments.
pub fn virtual_size(binary: &[u8]) -> Result<usize, ErrorCode> {
    let elf = parse(binary)?;
    let mut lo = u64::MAX;
    let mut hi = 0u64;
    for ph in elf
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == goblin::elf::program_header::PT_LOAD)
    {
        lo = lo.min(ph.p_vaddr);
        hi = hi.max(ph.p_vaddr + ph.p_memsz);
    }
    if lo > hi {
        return Err(ErrorCode::InvalidArgs);
    }
    Ok((hi - lo) as usize)
}

/// Address of the function symbol `name`.
pub fn find_symbol(binary: &[u8], name: &str) -> Result<u64, ErrorCode> {
    let elf = parse(binary)?;
    for sym in elf.syms.iter() {
        if sym.is_function() && elf.strtab.get_at(sym.st_name) == Some(name) {
            return Ok(sym.st_value);
        }
    }
    Err(ErrorCode::NotFound)
}

/// Copies the loadable segment into `dest` (physical base `dest_phys`),
/// zeroes its BSS tail, and returns the physical address of `entry_point`.
pub fn load_image(
    binary: &[u8],
    dest: &mut [u8],
    dest_phys: u64,
    entry_point: u64,
) -> Result<u64, ErrorCode> {
    let elf = parse(binary)?;
    let mut reloc_entry = None;
    let mut loaded = false;
    for ph in elf.program_headers.iter() {
        if ph.p_type != goblin::elf::program_header::PT_LOAD {
            debug!(
                "segment at {:#x}, file size {:#x}, memory size {:#x} SKIP",
                ph.p_vaddr, ph.p_filesz, ph.p_memsz
            );
            continue;
        }
        if loaded {
            panic!("expected exactly one loadable segment");
        }
        loaded = true;
        debug!(
            "segment at {:#x}, file size {:#x}, memory size {:#x} LOAD",
            ph.p_vaddr, ph.p_filesz, ph.p_memsz
        );
        let filesz = ph.p_filesz as usize;
        let memsz = ph.p_memsz as usize;
        if filesz > memsz || ph.p_offset as usize + filesz > binary.len() || memsz > dest.len() {
            return Err(ErrorCode::InvalidSize);
        }
        dest[..filesz]
            .copy_from_slice(&binary[ph.p_offset as usize..ph.p_offset as usize + filesz]);
        dest[filesz..memsz].fill(0);

        if entry_point >= ph.p_vaddr && entry_point - ph.p_vaddr < ph.p_memsz {
            reloc_entry = Some(dest_phys + (entry_point - ph.p_vaddr));
        }
    }
    reloc_entry.ok_or(ErrorCode::NotFound)
}

/// Applies the image's relocations against its load address; the image
/// must already be loaded into `dest`.
pub fn relocate(
    binary: &[u8],
    dest: &mut [u8],
    dest_phys: u64,
    load_offset: u64,
) -> Result<(), ErrorCode> {
    let elf = parse(binary)?;
    let segment_elf_base = elf
        .program_headers
        .iter()
        .find(|ph| ph.p_type == goblin::elf::program_header::PT_LOAD)
        .map(|ph| ph.p_vaddr)
        .ok_or(ErrorCode::InvalidArgs)?;
    let segment_delta = dest_phys.wrapping_sub(segment_elf_base);

    for (_shdr_idx, relocs) in elf.shdr_relocs.iter() {
        for reloc in relocs.iter() {
            if reloc.r_type != R_AARCH64_RELATIVE {
                debug!("unsupported relocation type {}", reloc.r_type);
                return Err(ErrorCode::InvalidArgs);
            }
            if reloc.r_sym != 0 {
                debug!("relocation references a dynamic symbol");
                return Err(ErrorCode::InvalidArgs);
            }
            let addend = reloc.r_addend.unwrap_or(0) as u64;
            let target = (reloc.r_offset - segment_elf_base) as usize;
            if target + 8 > dest.len() {
                return Err(ErrorCode::InvalidSize);
            }
            let value = addend
                .wrapping_add(segment_delta)
                .wrapping_add(load_offset);
            dest[target..target + 8].copy_from_slice(&value.to_le_bytes());
        }
    }
    Ok(())
}

#[cfg(any(test, feature = "testutil"))]
pub mod testimage {
    //! Builds a minimal relocatable ELF64 image for boot tests.

    use alloc::vec::Vec;

    const EHDR_SIZE: usize = 64;
    const PHDR_SIZE: usize = 56;
    const SHDR_SIZE: usize = 64;
    const SYM_SIZE: usize = 24;
    const RELA_SIZE: usize = 24;

    pub const TEST_VADDR: u64 = 0x10_0000;
    pub const TEST_ENTRY_OFFSET: u64 = 0x40;
    pub const TEST_RELOC_OFFSET: u64 = 0x80;
    pub const TEST_RELOC_ADDEND: i64 = 0x1234;
    pub const TEST_FILESZ: u64 = 0x100;
    pub const TEST_MEMSZ: u64 = 0x200;

    struct Layout {
        phdr: usize,
        text: usize,
        rela: usize,
        symtab: usize,
        strtab: usize,
        shstrtab: usize,
        shdrs: usize,
        total: usize,
    }

    fn layout() -> Layout {
        let phdr = EHDR_SIZE;
        let text = phdr + PHDR_SIZE;
        let rela = text + TEST_FILESZ as usize;
        let symtab = rela + RELA_SIZE;
        let strtab = symtab + 2 * SYM_SIZE;
        let shstrtab = strtab + 32;
        let shdrs = shstrtab + 48;
        Layout {
            phdr,
            text,
            rela,
            symtab,
            strtab,
            shstrtab,
            shdrs,
            total: shdrs + 6 * SHDR_SIZE,
        }
    }

    fn put(buf: &mut [u8], off: usize, bytes: &[u8]) { buf[off..off + bytes.len()].copy_from_slice(bytes); }
    fn put_u16(buf: &mut [u8], off: usize, v: u16) { put(buf, off, &v.to_le_bytes()); }
    fn put_u32(buf: &mut [u8], off: usize, v: u32) { put(buf, off, &v.to_le_bytes()); }
    fn put_u64(buf: &mut [u8], off: usize, v: u64) { put(buf, off, &v.to_le_bytes()); }

    /// One PT_LOAD segment, one `entry` function symbol, one
    /// R_AARCH64_RELATIVE rela entry.
    pub fn build(entry_name: &str) -> Vec<u8> {
        let l = layout();
        let mut b = alloc::vec![0u8; l.total];

        // ELF header.
        put(&mut b, 0, &[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        put_u16(&mut b, 16, 2); // ET_EXEC
        put_u16(&mut b, 18, 0xb7); // EM_AARCH64
        put_u32(&mut b, 20, 1);
        put_u64(&mut b, 24, TEST_VADDR + TEST_ENTRY_OFFSET); // e_entry
        put_u64(&mut b, 32, l.phdr as u64); // e_phoff
        put_u64(&mut b, 40, l.shdrs as u64); // e_shoff
        put_u16(&mut b, 52, EHDR_SIZE as u16);
        put_u16(&mut b, 54, PHDR_SIZE as u16);
        put_u16(&mut b, 56, 1); // e_phnum
        put_u16(&mut b, 58, SHDR_SIZE as u16);
        put_u16(&mut b, 60, 6); // e_shnum
        put_u16(&mut b, 62, 4); // e_shstrndx

        // Program header: one PT_LOAD covering .text.
        put_u32(&mut b, l.phdr, 1); // PT_LOAD
        put_u32(&mut b, l.phdr + 4, 7); // rwx
        put_u64(&mut b, l.phdr + 8, l.text as u64); // p_offset
        put_u64(&mut b, l.phdr + 16, TEST_VADDR); // p_vaddr
        put_u64(&mut b, l.phdr + 24, TEST_VADDR); // p_paddr
        put_u64(&mut b, l.phdr + 32, TEST_FILESZ);
        put_u64(&mut b, l.phdr + 40, TEST_MEMSZ);
        put_u64(&mut b, l.phdr + 48, 0x1000);

        // Recognisable text bytes.
        for i in 0..TEST_FILESZ as usize {
            b[l.text + i] = (i % 251) as u8;
        }

        // .rela.dyn: one R_AARCH64_RELATIVE at TEST_RELOC_OFFSET.
        put_u64(&mut b, l.rela, TEST_VADDR + TEST_RELOC_OFFSET); // r_offset
        put_u64(&mut b, l.rela + 8, 1027); // R_AARCH64_RELATIVE
        put_u64(&mut b, l.rela + 16, TEST_RELOC_ADDEND as u64);

        // Symbol table: null symbol + entry function.
        let sym = l.symtab + SYM_SIZE;
        put_u32(&mut b, sym, 1); // st_name
        b[sym + 4] = 0x12; // STB_GLOBAL | STT_FUNC
        put_u16(&mut b, sym + 6, 1); // st_shndx
        put_u64(&mut b, sym + 8, TEST_VADDR + TEST_ENTRY_OFFSET);

        // .strtab
        put(&mut b, l.strtab + 1, entry_name.as_bytes());

        // .shstrtab: "\0.text\0.rela\0.symtab\0.shstrtab\0.strtab\0"
        let names = b"\0.text\0.rela\0.symtab\0.shstrtab\0.strtab\0";
        put(&mut b, l.shstrtab, names);

        let mut shdr = |idx: usize,
                        name: u32,
                        type_: u32,
                        offset: usize,
                        size: usize,
                        link: u32,
                        entsize: u64,
                        addr: u64| {
            let s = l.shdrs + idx * SHDR_SIZE;
            put_u32(&mut b, s, name);
            put_u32(&mut b, s + 4, type_);
            put_u64(&mut b, s + 16, addr);
            put_u64(&mut b, s + 24, offset as u64);
            put_u64(&mut b, s + 32, size as u64);
            put_u32(&mut b, s + 40, link);
            put_u64(&mut b, s + 56, entsize);
        };
        // 0: null, 1: .text, 2: .rela (link -> symtab), 3: .symtab
        // (link -> strtab), 4: .shstrtab, 5: .strtab
        shdr(1, 1, 1, l.text, TEST_FILESZ as usize, 0, 0, TEST_VADDR);
        shdr(2, 7, 4, l.rela, RELA_SIZE, 3, RELA_SIZE as u64, 0);
        shdr(3, 13, 2, l.symtab, 2 * SYM_SIZE, 5, SYM_SIZE as u64, 0);
        shdr(4, 21, 3, l.shstrtab, 40, 0, 0, 0);
        shdr(5, 31, 3, l.strtab, 32, 0, 0, 0);
        // .symtab sh_info: first global symbol index.
        put_u32(&mut b, l.shdrs + 3 * SHDR_SIZE + 44, 1);

        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_symbol() {
        let image = testimage::build("boot_entry_psci");
        let addr = find_symbol(&image, "boot_entry_psci").unwrap();
        assert_eq!(addr, testimage::TEST_VADDR + testimage::TEST_ENTRY_OFFSET);
        assert_eq!(find_symbol(&image, "nonesuch").err(), Some(ErrorCode::NotFound));
    }

    #[test]
    fn test_load_copies_and_zeroes() {
        let image = testimage::build("arch_init");
        let mut dest = alloc::vec![0xaau8; testimage::TEST_MEMSZ as usize];
        let phys = 0x8000_0000u64;
        let entry = load_image(
            &image,
            &mut dest,
            phys,
            testimage::TEST_VADDR + testimage::TEST_ENTRY_OFFSET,
        )
        .unwrap();
        assert_eq!(entry, phys + testimage::TEST_ENTRY_OFFSET);
        // Text copied, BSS zeroed.
        assert_eq!(dest[0], 0);
        assert_eq!(dest[5], 5);
        assert!(dest[testimage::TEST_FILESZ as usize..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_relocate_relative() {
        let image = testimage::build("arch_init");
        let mut dest = alloc::vec![0u8; testimage::TEST_MEMSZ as usize];
        let phys = 0x8000_0000u64;
        load_image(
            &image,
            &mut dest,
            phys,
            testimage::TEST_VADDR + testimage::TEST_ENTRY_OFFSET,
        )
        .unwrap();
        relocate(&image, &mut dest, phys, crate::ARMV8_KERNEL_OFFSET).unwrap();
        let off = testimage::TEST_RELOC_OFFSET as usize;
        let value = u64::from_le_bytes(dest[off..off + 8].try_into().unwrap());
        let delta = phys.wrapping_sub(testimage::TEST_VADDR);
        assert_eq!(
            value,
            (testimage::TEST_RELOC_ADDEND as u64)
                .wrapping_add(delta)
                .wrapping_add(crate::ARMV8_KERNEL_OFFSET)
        );
    }

    #[test]
    fn test_virtual_size() {
        let image = testimage::build("arch_init");
        assert!(virtual_size(&image).unwrap() > testimage::TEST_FILESZ as usize);
    }
}

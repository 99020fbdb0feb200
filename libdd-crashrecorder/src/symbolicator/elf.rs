// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reads the in-memory ELF structures of loaded images through [`crate::memory`].
//!
//! Only the runtime views are used: program headers, the dynamic section and the dynamic
//! symbol table. Section headers are not mapped and are ignored.

use crate::memory::{copy_max_possible, read_pod, Pod};

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_NOTE: u32 = 4;

const DT_NULL: isize = 0;
const DT_HASH: isize = 4;
const DT_STRTAB: isize = 5;
const DT_SYMTAB: isize = 6;
const DT_STRSZ: isize = 10;
const DT_GNU_HASH: isize = 0x6fff_fef5;

const SHN_UNDEF: u16 = 0;
const STT_SECTION: u8 = 3;
const STT_FILE: u8 = 4;

const NT_GNU_BUILD_ID: u32 = 3;
const MAX_PHDRS: usize = 64;
const MAX_DYNAMIC_ENTRIES: usize = 256;
const SYMBOL_BATCH: usize = 64;

#[cfg(target_pointer_width = "64")]
mod layout {
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct Ehdr {
        pub e_ident: [u8; 16],
        pub e_type: u16,
        pub e_machine: u16,
        pub e_version: u32,
        pub e_entry: u64,
        pub e_phoff: u64,
        pub e_shoff: u64,
        pub e_flags: u32,
        pub e_ehsize: u16,
        pub e_phentsize: u16,
        pub e_phnum: u16,
        pub e_shentsize: u16,
        pub e_shnum: u16,
        pub e_shstrndx: u16,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct Phdr {
        pub p_type: u32,
        pub p_flags: u32,
        pub p_offset: u64,
        pub p_vaddr: u64,
        pub p_paddr: u64,
        pub p_filesz: u64,
        pub p_memsz: u64,
        pub p_align: u64,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct Sym {
        pub st_name: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
        pub st_value: u64,
        pub st_size: u64,
    }
}

#[cfg(target_pointer_width = "32")]
mod layout {
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct Ehdr {
        pub e_ident: [u8; 16],
        pub e_type: u16,
        pub e_machine: u16,
        pub e_version: u32,
        pub e_entry: u32,
        pub e_phoff: u32,
        pub e_shoff: u32,
        pub e_flags: u32,
        pub e_ehsize: u16,
        pub e_phentsize: u16,
        pub e_phnum: u16,
        pub e_shentsize: u16,
        pub e_shnum: u16,
        pub e_shstrndx: u16,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct Phdr {
        pub p_type: u32,
        pub p_offset: u32,
        pub p_vaddr: u32,
        pub p_paddr: u32,
        pub p_filesz: u32,
        pub p_memsz: u32,
        pub p_flags: u32,
        pub p_align: u32,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct Sym {
        pub st_name: u32,
        pub st_value: u32,
        pub st_size: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
    }
}

pub use layout::{Ehdr, Phdr, Sym};

/// `d_tag` and `d_val`/`d_ptr`, both pointer sized.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Dyn {
    pub d_tag: isize,
    pub d_val: usize,
}

// SAFETY: plain `repr(C)` integer records.
unsafe impl Pod for Ehdr {}
unsafe impl Pod for Phdr {}
unsafe impl Pod for Sym {}
unsafe impl Pod for Dyn {}

/// Where an image's program headers live.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeaders {
    pub address: usize,
    pub count: usize,
}

/// One loaded ELF object, located by its load bias and program headers.
#[derive(Debug, Clone, Copy)]
pub struct ElfImage {
    pub bias: usize,
    pub phdrs: ProgramHeaders,
}

impl ElfImage {
    /// Locates the program headers through the ELF header mapped at the load bias.
    pub fn from_mapped_header(bias: usize) -> Option<Self> {
        let ehdr: Ehdr = read_pod(bias)?;
        if ehdr.e_ident[..4] != *b"\x7fELF" {
            return None;
        }
        if usize::from(ehdr.e_phentsize) != std::mem::size_of::<Phdr>() {
            return None;
        }
        Some(Self {
            bias,
            phdrs: ProgramHeaders {
                address: bias.checked_add(ehdr.e_phoff as usize)?,
                count: usize::from(ehdr.e_phnum).min(MAX_PHDRS),
            },
        })
    }

    pub fn with_program_headers(bias: usize, phdrs: ProgramHeaders) -> Self {
        Self {
            bias,
            phdrs: ProgramHeaders {
                address: phdrs.address,
                count: phdrs.count.min(MAX_PHDRS),
            },
        }
    }

    fn phdr(&self, index: usize) -> Option<Phdr> {
        read_pod(self.phdrs.address + index * std::mem::size_of::<Phdr>())
    }

    fn for_each_phdr(&self, mut f: impl FnMut(&Phdr) -> bool) {
        for index in 0..self.phdrs.count {
            match self.phdr(index) {
                Some(phdr) => {
                    if !f(&phdr) {
                        return;
                    }
                }
                None => return,
            }
        }
    }

    /// True when `address` lies inside one of the image's loadable segments.
    pub fn contains(&self, address: usize) -> bool {
        let Some(relative) = address.checked_sub(self.bias) else {
            return false;
        };
        let mut found = false;
        self.for_each_phdr(|phdr| {
            if phdr.p_type == PT_LOAD {
                let start = phdr.p_vaddr as usize;
                let end = start.saturating_add(phdr.p_memsz as usize);
                if (start..end).contains(&relative) {
                    found = true;
                    return false;
                }
            }
            true
        });
        found
    }

    /// Lowest load address and total span of the loadable segments, relative to the bias.
    pub fn load_range(&self) -> Option<(usize, usize)> {
        let mut low = usize::MAX;
        let mut high = 0usize;
        self.for_each_phdr(|phdr| {
            if phdr.p_type == PT_LOAD {
                low = low.min(phdr.p_vaddr as usize);
                high = high.max((phdr.p_vaddr as usize).saturating_add(phdr.p_memsz as usize));
            }
            true
        });
        (low < high).then(|| (low, high - low))
    }

    fn dynamic_address(&self) -> Option<usize> {
        let mut address = None;
        self.for_each_phdr(|phdr| {
            if phdr.p_type == PT_DYNAMIC {
                address = Some(self.bias + phdr.p_vaddr as usize);
                return false;
            }
            true
        });
        address
    }

    /// Symbol table coordinates from the dynamic section at `dynamic`, or from the one named
    /// by the program headers when `dynamic` is zero.
    pub fn symbol_table(&self, dynamic: usize) -> Option<SymbolTable> {
        let dynamic = if dynamic != 0 {
            dynamic
        } else {
            self.dynamic_address()?
        };
        let mut table = SymbolTable::default();
        let mut hash = 0;
        let mut gnu_hash = 0;
        for index in 0..MAX_DYNAMIC_ENTRIES {
            let entry: Dyn = read_pod(dynamic + index * std::mem::size_of::<Dyn>())?;
            match entry.d_tag {
                DT_NULL => break,
                DT_HASH => hash = self.relocate(entry.d_val),
                DT_GNU_HASH => gnu_hash = self.relocate(entry.d_val),
                DT_STRTAB => table.strtab = self.relocate(entry.d_val),
                DT_SYMTAB => table.symtab = self.relocate(entry.d_val),
                DT_STRSZ => table.strsz = entry.d_val,
                _ => {}
            }
        }
        if table.strtab == 0 || table.symtab == 0 {
            return None;
        }
        table.count = if hash != 0 {
            read_pod::<u32>(hash + 4)? as usize
        } else if gnu_hash != 0 {
            gnu_hash_symbol_count(gnu_hash)?
        } else {
            return None;
        };
        Some(table)
    }

    // Some loaders rewrite dynamic pointers to absolute addresses, others leave them as
    // offsets from the load bias.
    fn relocate(&self, pointer: usize) -> usize {
        if pointer < self.bias {
            pointer.wrapping_add(self.bias)
        } else {
            pointer
        }
    }

    /// Copies the GNU build id into `out` and returns its length.
    pub fn build_id(&self, out: &mut [u8]) -> usize {
        let mut len = 0;
        self.for_each_phdr(|phdr| {
            if phdr.p_type != PT_NOTE {
                return true;
            }
            let mut notes = [0u8; 512];
            let size = (phdr.p_memsz as usize).min(notes.len());
            let copied = copy_max_possible(self.bias + phdr.p_vaddr as usize, &mut notes[..size]);
            len = find_build_id(&notes[..copied], out);
            len == 0
        });
        len
    }
}

/// Location of an image's dynamic symbol table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolTable {
    pub symtab: usize,
    pub strtab: usize,
    pub strsz: usize,
    pub count: usize,
}

impl SymbolTable {
    /// Finds the defined symbol with the highest value not exceeding `relative`, where values
    /// are relative to the image bias. Returns the symbol value and its name offset.
    pub fn nearest(&self, relative: usize) -> Option<(usize, u32)> {
        let mut best: Option<(usize, u32)> = None;
        let mut best_distance = usize::MAX;
        let mut batch = [Sym::default(); SYMBOL_BATCH];
        let mut index = 0;
        while index < self.count {
            let n = (self.count - index).min(SYMBOL_BATCH);
            // SAFETY: `Sym` is `Pod`; the byte view covers exactly `n` records.
            let bytes = unsafe {
                std::slice::from_raw_parts_mut(
                    batch.as_mut_ptr().cast::<u8>(),
                    n * std::mem::size_of::<Sym>(),
                )
            };
            let address = self.symtab + index * std::mem::size_of::<Sym>();
            if !crate::memory::copy_safely(address, bytes) {
                break;
            }
            for sym in &batch[..n] {
                let kind = sym.st_info & 0xf;
                if sym.st_shndx == SHN_UNDEF || sym.st_value == 0 {
                    continue;
                }
                if kind == STT_SECTION || kind == STT_FILE {
                    continue;
                }
                let value = sym.st_value as usize;
                if value <= relative {
                    let distance = relative - value;
                    if distance < best_distance {
                        best_distance = distance;
                        best = Some((value, sym.st_name));
                    }
                }
            }
            index += n;
        }
        best
    }

    /// Address of the NUL terminated name at `offset` in the string table.
    pub fn name_address(&self, offset: u32) -> Option<usize> {
        let offset = offset as usize;
        (self.strsz == 0 || offset < self.strsz).then(|| self.strtab + offset)
    }
}

fn gnu_hash_symbol_count(table: usize) -> Option<usize> {
    let nbuckets = read_pod::<u32>(table)? as usize;
    let symoffset = read_pod::<u32>(table + 4)? as usize;
    let bloom_size = read_pod::<u32>(table + 8)? as usize;
    let buckets = table + 16 + bloom_size * std::mem::size_of::<usize>();
    let chains = buckets + nbuckets * 4;

    let mut last = 0usize;
    for bucket in 0..nbuckets {
        last = last.max(read_pod::<u32>(buckets + bucket * 4)? as usize);
    }
    if last < symoffset {
        return Some(symoffset);
    }
    // Walk the last chain until its terminator bit.
    loop {
        let hash = read_pod::<u32>(chains + (last - symoffset) * 4)?;
        last += 1;
        if hash & 1 != 0 {
            return Some(last);
        }
    }
}

fn find_build_id(notes: &[u8], out: &mut [u8]) -> usize {
    let align4 = |n: usize| (n + 3) & !3;
    let mut offset = 0;
    while offset + 12 <= notes.len() {
        let word = |at: usize| u32::from_ne_bytes([notes[at], notes[at + 1], notes[at + 2], notes[at + 3]]);
        let namesz = word(offset) as usize;
        let descsz = word(offset + 4) as usize;
        let kind = word(offset + 8);
        let name_start = offset + 12;
        let desc_start = name_start + align4(namesz);
        let next = desc_start + align4(descsz);
        if next > notes.len() {
            return 0;
        }
        if kind == NT_GNU_BUILD_ID && notes[name_start..name_start + namesz].starts_with(b"GNU") {
            let len = descsz.min(out.len());
            out[..len].copy_from_slice(&notes[desc_start..desc_start + len]);
            return len;
        }
        offset = next;
    }
    0
}

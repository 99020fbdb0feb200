// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Address to image and symbol resolution that is safe to run while crashing.
//!
//! The loader's own image list (`_r_debug.r_map`) is walked directly, without `dladdr` or
//! `dl_iterate_phdr`, both of which take the loader lock. Every read goes through
//! [`crate::memory`], so an image unloaded mid-walk only ends the walk.

pub mod elf;

use crate::memory::{copy_max_possible, read_pod};
use crate::shared::fixed_str::FixedStr;
use elf::{ElfImage, ProgramHeaders};

pub const MAX_NAME_LEN: usize = 256;
const MAX_IMAGES: usize = 4096;

/// Result of resolving one address. All fields are zero or empty when nothing matched.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolInfo {
    pub image_address: usize,
    pub image_name: FixedStr<MAX_NAME_LEN>,
    pub symbol_address: usize,
    pub symbol_name: FixedStr<MAX_NAME_LEN>,
}

impl SymbolInfo {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_found(&self) -> bool {
        self.image_address != 0
    }
}

/// Summary of one loaded image, as listed in the `binary_images` report section.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageSummary {
    pub address: usize,
    pub vm_address: usize,
    pub size: usize,
    pub name: FixedStr<MAX_NAME_LEN>,
    pub build_id: [u8; 32],
    pub build_id_len: usize,
}

impl ImageSummary {
    pub fn build_id(&self) -> &[u8] {
        &self.build_id[..self.build_id_len]
    }
}

// Field offsets of glibc's `struct link_map`, in pointer-sized words.
const LM_ADDR: usize = 0;
const LM_NAME: usize = 1;
const LM_LD: usize = 2;
const LM_NEXT: usize = 3;

#[derive(Debug, Clone, Copy)]
struct LinkMapEntry {
    bias: usize,
    name: usize,
    dynamic: usize,
    next: usize,
}

fn read_link_map(node: usize) -> Option<LinkMapEntry> {
    let words: [usize; 4] = read_pod(node)?;
    Some(LinkMapEntry {
        bias: words[LM_ADDR],
        name: words[LM_NAME],
        dynamic: words[LM_LD],
        next: words[LM_NEXT],
    })
}

#[derive(Debug, Clone)]
enum ImageList {
    /// `head` is the address of the first `link_map`, or of `_r_debug` when `via_r_debug`.
    LinkMap {
        head: usize,
        via_r_debug: bool,
        main_phdrs: Option<ProgramHeaders>,
        main_name: FixedStr<MAX_NAME_LEN>,
    },
    Empty,
}

#[derive(Debug, Clone)]
pub struct Symbolicator {
    images: ImageList,
}

impl Symbolicator {
    /// A symbolicator over the images loaded in this process.
    ///
    /// Call outside of crash handling: the executable path is looked up here, once.
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    pub fn for_current_process() -> Self {
        #[repr(C)]
        struct RDebug {
            r_version: libc::c_int,
            r_map: *mut libc::c_void,
            r_brk: usize,
            r_state: libc::c_int,
            r_ldbase: usize,
        }
        extern "C" {
            static _r_debug: RDebug;
        }

        let main_name = std::env::current_exe()
            .ok()
            .map(|p| FixedStr::from_bytes(p.as_os_str().as_encoded_bytes()))
            .unwrap_or_default();
        // SAFETY: getauxval has no preconditions.
        let (phdr, phnum) = unsafe {
            (
                libc::getauxval(libc::AT_PHDR) as usize,
                libc::getauxval(libc::AT_PHNUM) as usize,
            )
        };
        let main_phdrs = (phdr != 0).then_some(ProgramHeaders {
            address: phdr,
            count: phnum,
        });
        // SAFETY: only the address is taken; contents are read through safe copies.
        let head = unsafe { std::ptr::addr_of!(_r_debug) } as usize;
        Self {
            images: ImageList::LinkMap {
                head: head + std::mem::offset_of!(RDebug, r_map),
                via_r_debug: true,
                main_phdrs,
                main_name,
            },
        }
    }

    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    pub fn for_current_process() -> Self {
        Self::empty()
    }

    /// Walks a `link_map` list starting at `head`. The first entry uses `main_phdrs` when
    /// given, like the executable whose ELF header may not be mapped at its bias.
    pub fn from_link_map(head: usize, main_phdrs: Option<ProgramHeaders>) -> Self {
        Self {
            images: ImageList::LinkMap {
                head,
                via_r_debug: false,
                main_phdrs,
                main_name: FixedStr::new(),
            },
        }
    }

    pub fn empty() -> Self {
        Self {
            images: ImageList::Empty,
        }
    }

    fn for_each_image(&self, mut f: impl FnMut(&LinkMapEntry, &ElfImage) -> bool) {
        let ImageList::LinkMap {
            head,
            via_r_debug,
            main_phdrs,
            ..
        } = &self.images
        else {
            return;
        };
        let mut node = if *via_r_debug {
            read_pod::<usize>(*head).unwrap_or(0)
        } else {
            *head
        };
        let mut index = 0;
        while node != 0 && index < MAX_IMAGES {
            let Some(entry) = read_link_map(node) else {
                return;
            };
            let image = match (index, main_phdrs) {
                (0, Some(phdrs)) => Some(ElfImage::with_program_headers(entry.bias, *phdrs)),
                _ => ElfImage::from_mapped_header(entry.bias),
            };
            if let Some(image) = image {
                if !f(&entry, &image) {
                    return;
                }
            }
            node = entry.next;
            index += 1;
        }
    }

    fn image_name(&self, entry: &LinkMapEntry, out: &mut FixedStr<MAX_NAME_LEN>) {
        out.clear();
        if entry.name != 0 {
            read_c_string(entry.name, out);
        }
        if out.is_empty() {
            if let ImageList::LinkMap { main_name, .. } = &self.images {
                *out = *main_name;
            }
        }
    }

    /// Resolves `address` exactly as given. Callers holding return addresses adjust them first.
    /// Returns false, with `info` cleared, when no loaded image contains the address.
    pub fn resolve(&self, address: usize, info: &mut SymbolInfo) -> bool {
        info.clear();
        if address == 0 {
            return false;
        }
        let mut found: Option<(LinkMapEntry, ElfImage)> = None;
        self.for_each_image(|entry, image| {
            if image.contains(address) {
                found = Some((*entry, *image));
                return false;
            }
            true
        });
        let Some((entry, image)) = found else {
            return false;
        };

        info.image_address = image.bias + image.load_range().map_or(0, |(low, _)| low);
        self.image_name(&entry, &mut info.image_name);

        if let Some(table) = image.symbol_table(entry.dynamic) {
            if let Some((value, name)) = table.nearest(address - image.bias) {
                info.symbol_address = image.bias + value;
                if let Some(name_address) = table.name_address(name) {
                    read_c_string(name_address, &mut info.symbol_name);
                }
            }
        }
        true
    }

    /// Calls `f` for every loaded image until it returns false.
    pub fn for_each_image_summary(&self, mut f: impl FnMut(&ImageSummary) -> bool) {
        let mut summary = ImageSummary::default();
        self.for_each_image(|entry, image| {
            summary = ImageSummary::default();
            let (low, size) = image.load_range().unwrap_or((0, 0));
            summary.address = image.bias + low;
            summary.vm_address = low;
            summary.size = size;
            self.image_name(entry, &mut summary.name);
            summary.build_id_len = image.build_id(&mut summary.build_id);
            f(&summary)
        });
    }

    pub fn image_count(&self) -> usize {
        let mut count = 0;
        self.for_each_image(|_, _| {
            count += 1;
            true
        });
        count
    }
}

fn read_c_string(address: usize, out: &mut FixedStr<MAX_NAME_LEN>) {
    let mut buf = [0u8; MAX_NAME_LEN];
    let copied = copy_max_possible(address, &mut buf);
    let len = buf[..copied].iter().position(|b| *b == 0).unwrap_or(copied);
    out.clear();
    out.push_bytes(&buf[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake shared object laid out in one heap buffer, with its `link_map` node.
    #[cfg(target_pointer_width = "64")]
    struct SyntheticImage {
        buffer: Vec<u8>,
        _name: Vec<u8>,
        node: Box<[usize; 5]>,
    }

    #[cfg(target_pointer_width = "64")]
    impl SyntheticImage {
        fn new(name: &str) -> Self {
            let mut buffer = vec![0u8; 0x2000];
            let put = |buf: &mut Vec<u8>, at: usize, bytes: &[u8]| {
                buf[at..at + bytes.len()].copy_from_slice(bytes);
            };
            // ELF header: magic, e_phoff = 64, e_phentsize = 56, e_phnum = 2.
            put(&mut buffer, 0, b"\x7fELF\x02\x01\x01");
            put(&mut buffer, 32, &64u64.to_ne_bytes());
            put(&mut buffer, 54, &56u16.to_ne_bytes());
            put(&mut buffer, 56, &2u16.to_ne_bytes());
            // PT_LOAD covering the whole buffer, PT_DYNAMIC at 0x200.
            let phdr = |kind: u32, vaddr: u64, memsz: u64| {
                let mut p = Vec::new();
                p.extend_from_slice(&kind.to_ne_bytes());
                p.extend_from_slice(&5u32.to_ne_bytes());
                p.extend_from_slice(&0u64.to_ne_bytes());
                p.extend_from_slice(&vaddr.to_ne_bytes());
                p.extend_from_slice(&vaddr.to_ne_bytes());
                p.extend_from_slice(&memsz.to_ne_bytes());
                p.extend_from_slice(&memsz.to_ne_bytes());
                p.extend_from_slice(&8u64.to_ne_bytes());
                p
            };
            put(&mut buffer, 64, &phdr(elf::PT_LOAD, 0, 0x2000));
            put(&mut buffer, 120, &phdr(elf::PT_DYNAMIC, 0x200, 0x60));
            // Dynamic entries hold offsets; the reader relocates them by the bias.
            let dynamic: [(i64, u64); 5] = [(4, 0x300), (5, 0x400), (6, 0x500), (10, 64), (0, 0)];
            for (i, (tag, val)) in dynamic.iter().enumerate() {
                put(&mut buffer, 0x200 + i * 16, &tag.to_ne_bytes());
                put(&mut buffer, 0x208 + i * 16, &val.to_ne_bytes());
            }
            // DT_HASH: nbucket = 1, nchain = 4.
            put(&mut buffer, 0x300, &1u32.to_ne_bytes());
            put(&mut buffer, 0x304, &4u32.to_ne_bytes());
            put(&mut buffer, 0x400, b"\0alpha\0beta\0gamma\0");
            let symbols: [(u32, u64); 3] = [(1, 0x1000), (7, 0x1100), (12, 0x1800)];
            for (i, (name, value)) in symbols.iter().enumerate() {
                let at = 0x500 + (i + 1) * 24;
                put(&mut buffer, at, &name.to_ne_bytes());
                buffer[at + 4] = 0x12; // STB_GLOBAL | STT_FUNC
                put(&mut buffer, at + 6, &1u16.to_ne_bytes());
                put(&mut buffer, at + 8, &value.to_ne_bytes());
            }

            let mut name = name.as_bytes().to_vec();
            name.push(0);
            let bias = buffer.as_ptr() as usize;
            let node = Box::new([bias, name.as_ptr() as usize, bias + 0x200, 0, 0]);
            Self {
                buffer,
                _name: name,
                node,
            }
        }

        fn bias(&self) -> usize {
            self.buffer.as_ptr() as usize
        }

        fn node(&self) -> usize {
            self.node.as_ptr() as usize
        }

        fn link_to(&mut self, next: &SyntheticImage) {
            self.node[LM_NEXT] = next.node();
        }
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn resolves_synthetic_images() {
        let mut first = SyntheticImage::new("libfirst.so");
        let second = SyntheticImage::new("libsecond.so");
        first.link_to(&second);
        let symbolicator = Symbolicator::from_link_map(first.node(), None);
        assert_eq!(symbolicator.image_count(), 2);

        let mut info = SymbolInfo::default();
        assert!(symbolicator.resolve(second.bias() + 0x1150, &mut info));
        assert_eq!(info.image_name.as_str(), "libsecond.so");
        assert_eq!(info.image_address, second.bias());
        assert_eq!(info.symbol_name.as_str(), "beta");
        assert_eq!(info.symbol_address, second.bias() + 0x1100);

        assert!(symbolicator.resolve(first.bias() + 0x1000, &mut info));
        assert_eq!(info.image_name.as_str(), "libfirst.so");
        assert_eq!(info.symbol_name.as_str(), "alpha");

        assert!(symbolicator.resolve(first.bias() + 0x1fff, &mut info));
        assert_eq!(info.symbol_name.as_str(), "gamma");

        // Inside the image but below every symbol: image only.
        assert!(symbolicator.resolve(first.bias() + 0x10, &mut info));
        assert!(info.symbol_name.is_empty());
        assert_eq!(info.symbol_address, 0);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn unknown_addresses_are_not_found() {
        let image = SyntheticImage::new("libonly.so");
        let symbolicator = Symbolicator::from_link_map(image.node(), None);
        let mut info = SymbolInfo::default();
        assert!(!symbolicator.resolve(0, &mut info));
        assert!(!info.is_found());
        assert!(!symbolicator.resolve(image.bias() + 0x2000, &mut info));
        assert!(info.image_name.is_empty());
        assert!(!Symbolicator::empty().resolve(image.bias() + 0x1000, &mut info));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn summaries_describe_images() {
        let image = SyntheticImage::new("libsummary.so");
        let symbolicator = Symbolicator::from_link_map(image.node(), None);
        let mut names = Vec::new();
        symbolicator.for_each_image_summary(|summary| {
            assert_eq!(summary.address, image.bias());
            assert_eq!(summary.size, 0x2000);
            assert!(summary.build_id().is_empty());
            names.push(summary.name.as_str().to_string());
            true
        });
        assert_eq!(names, vec!["libsummary.so".to_string()]);
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn resolves_inside_this_process() {
        let symbolicator = Symbolicator::for_current_process();
        assert!(symbolicator.image_count() > 1);

        let mut info = SymbolInfo::default();
        assert!(symbolicator.resolve(libc::write as usize, &mut info));
        assert!(!info.image_name.is_empty());
        assert!(info.image_address <= libc::write as usize);

        assert!(!symbolicator.resolve(0, &mut info));
    }
}

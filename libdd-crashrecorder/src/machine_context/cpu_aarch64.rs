// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::CpuRegisters;

const REGISTER_NAMES: [&str; 34] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
    "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
    "x27", "x28", "fp", "lr", "sp", "pc", "cpsr",
];
const EXCEPTION_REGISTER_NAMES: [&str; 3] = ["exception", "esr", "far"];

// Return addresses may carry pointer authentication bits above the virtual address range.
#[cfg(target_vendor = "apple")]
const ADDRESS_MASK: u64 = 0x0000_000f_ffff_ffff;
#[cfg(not(target_vendor = "apple"))]
const ADDRESS_MASK: u64 = 0x0000_ffff_ffff_ffff;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aarch64Registers {
    /// x0..x28, then fp (x29) and lr (x30).
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub cpsr: u64,
    pub exception: u64,
    pub esr: u64,
    pub far: u64,
}

impl CpuRegisters for Aarch64Registers {
    const ARCH: &'static str = "arm64";

    fn frame_pointer(&self) -> usize {
        self.x[29] as usize
    }

    fn stack_pointer(&self) -> usize {
        self.sp as usize
    }

    fn instruction_address(&self) -> usize {
        self.pc as usize
    }

    fn link_register(&self) -> usize {
        self.x[30] as usize
    }

    fn fault_address(&self) -> usize {
        self.far as usize
    }

    fn register_count() -> usize {
        REGISTER_NAMES.len()
    }

    fn register_name(index: usize) -> Option<&'static str> {
        REGISTER_NAMES.get(index).copied()
    }

    fn register_value(&self, index: usize) -> u64 {
        match index {
            0..=30 => self.x[index],
            31 => self.sp,
            32 => self.pc,
            33 => self.cpsr,
            _ => 0,
        }
    }

    fn exception_register_count() -> usize {
        EXCEPTION_REGISTER_NAMES.len()
    }

    fn exception_register_name(index: usize) -> Option<&'static str> {
        EXCEPTION_REGISTER_NAMES.get(index).copied()
    }

    fn exception_register_value(&self, index: usize) -> u64 {
        match index {
            0 => self.exception,
            1 => self.esr,
            2 => self.far,
            _ => 0,
        }
    }

    fn normalise_instruction_pointer(ip: usize) -> usize {
        (ip as u64 & ADDRESS_MASK) as usize
    }

    #[cfg(test)]
    fn synthetic(ip: usize, sp: usize, fp: usize, lr: usize) -> Self {
        let mut regs = Self::default();
        regs.pc = ip as u64;
        regs.sp = sp as u64;
        regs.x[29] = fp as u64;
        regs.x[30] = lr as u64;
        regs
    }
}

#[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "aarch64"))]
impl Aarch64Registers {
    /// # Safety
    /// `ucontext` must point at the context the kernel passed to a signal handler.
    pub(crate) unsafe fn from_ucontext(ucontext: *const libc::ucontext_t) -> Self {
        let mcontext = &(*ucontext).uc_mcontext;
        let mut x = [0u64; 31];
        x.copy_from_slice(&mcontext.regs[..31]);
        Self {
            x,
            sp: mcontext.sp,
            pc: mcontext.pc,
            cpsr: mcontext.pstate,
            exception: 0,
            esr: 0,
            far: mcontext.fault_address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_follow_blob() {
        let mut regs = Aarch64Registers::default();
        for (i, r) in regs.x.iter_mut().enumerate() {
            *r = 0xa000 + i as u64;
        }
        regs.sp = 0xb000;
        regs.pc = 0xc000;
        regs.cpsr = 0x6000_0000;
        regs.far = 0x40;
        assert_eq!(regs.frame_pointer(), 0xa000 + 29);
        assert_eq!(regs.link_register(), 0xa000 + 30);
        assert_eq!(regs.stack_pointer(), 0xb000);
        assert_eq!(regs.instruction_address(), 0xc000);
        assert_eq!(Aarch64Registers::register_name(29), Some("fp"));
        assert_eq!(Aarch64Registers::register_name(33), Some("cpsr"));
        assert_eq!(regs.register_value(31), 0xb000);
        assert_eq!(regs.register_value(33), 0x6000_0000);
        assert_eq!(regs.register_value(34), 0);
        assert_eq!(regs.exception_register_value(2), 0x40);
    }

    #[test]
    fn strips_pointer_tag_bits() {
        let tagged = (0x0023_0000_0000_0000u64 | 0x1234_5678) as usize;
        assert_eq!(Aarch64Registers::normalise_instruction_pointer(tagged), 0x1234_5678);
    }
}

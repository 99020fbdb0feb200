// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::CpuRegisters;

const REGISTER_NAMES: [&str; 16] = [
    "eax", "ebx", "ecx", "edx", "edi", "esi", "ebp", "esp", "ss", "eflags", "eip", "cs", "ds",
    "es", "fs", "gs",
];
const EXCEPTION_REGISTER_NAMES: [&str; 3] = ["trapno", "err", "faultvaddr"];

const EBP: usize = 6;
const ESP: usize = 7;
const EIP: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X86Registers {
    pub gpr: [u32; 16],
    pub trapno: u32,
    pub err: u32,
    pub fault_address: u32,
}

impl CpuRegisters for X86Registers {
    const ARCH: &'static str = "x86";

    fn frame_pointer(&self) -> usize {
        self.gpr[EBP] as usize
    }

    fn stack_pointer(&self) -> usize {
        self.gpr[ESP] as usize
    }

    fn instruction_address(&self) -> usize {
        self.gpr[EIP] as usize
    }

    fn link_register(&self) -> usize {
        0
    }

    fn fault_address(&self) -> usize {
        self.fault_address as usize
    }

    fn register_count() -> usize {
        REGISTER_NAMES.len()
    }

    fn register_name(index: usize) -> Option<&'static str> {
        REGISTER_NAMES.get(index).copied()
    }

    fn register_value(&self, index: usize) -> u64 {
        self.gpr.get(index).map_or(0, |v| u64::from(*v))
    }

    fn exception_register_count() -> usize {
        EXCEPTION_REGISTER_NAMES.len()
    }

    fn exception_register_name(index: usize) -> Option<&'static str> {
        EXCEPTION_REGISTER_NAMES.get(index).copied()
    }

    fn exception_register_value(&self, index: usize) -> u64 {
        match index {
            0 => u64::from(self.trapno),
            1 => u64::from(self.err),
            2 => u64::from(self.fault_address),
            _ => 0,
        }
    }

    #[cfg(test)]
    fn synthetic(ip: usize, sp: usize, fp: usize, _lr: usize) -> Self {
        let mut regs = Self::default();
        regs.gpr[EIP] = ip as u32;
        regs.gpr[ESP] = sp as u32;
        regs.gpr[EBP] = fp as u32;
        regs
    }
}

#[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "x86"))]
impl X86Registers {
    /// # Safety
    /// `ucontext` must point at the context the kernel passed to a signal handler.
    pub(crate) unsafe fn from_ucontext(ucontext: *const libc::ucontext_t) -> Self {
        // Kernel gregs order: gs fs es ds edi esi ebp esp ebx edx ecx eax trapno err eip cs efl
        // uesp ss.
        let mcontext = &(*ucontext).uc_mcontext;
        let g = |index: usize| mcontext.gregs[index] as u32;
        Self {
            gpr: [
                g(11),
                g(8),
                g(10),
                g(9),
                g(4),
                g(5),
                g(6),
                g(7),
                g(18),
                g(16),
                g(14),
                g(15),
                g(3),
                g(2),
                g(1),
                g(0),
            ],
            trapno: g(12),
            err: g(13),
            fault_address: mcontext.cr2 as u32,
        }
    }
}

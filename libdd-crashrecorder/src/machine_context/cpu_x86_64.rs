// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::CpuRegisters;

const REGISTER_NAMES: [&str; 21] = [
    "rax", "rbx", "rcx", "rdx", "rdi", "rsi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "rip", "rflags", "cs", "fs", "gs",
];
const EXCEPTION_REGISTER_NAMES: [&str; 3] = ["trapno", "err", "faultvaddr"];

const RBP: usize = 6;
const RSP: usize = 7;
const RIP: usize = 16;

/// General purpose registers in report order, plus the trap state the kernel saved with them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X86_64Registers {
    pub gpr: [u64; 21],
    pub trapno: u64,
    pub err: u64,
    pub fault_address: u64,
}

impl CpuRegisters for X86_64Registers {
    const ARCH: &'static str = "x86_64";

    fn frame_pointer(&self) -> usize {
        self.gpr[RBP] as usize
    }

    fn stack_pointer(&self) -> usize {
        self.gpr[RSP] as usize
    }

    fn instruction_address(&self) -> usize {
        self.gpr[RIP] as usize
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
        self.gpr.get(index).copied().unwrap_or(0)
    }

    fn exception_register_count() -> usize {
        EXCEPTION_REGISTER_NAMES.len()
    }

    fn exception_register_name(index: usize) -> Option<&'static str> {
        EXCEPTION_REGISTER_NAMES.get(index).copied()
    }

    fn exception_register_value(&self, index: usize) -> u64 {
        match index {
            0 => self.trapno,
            1 => self.err,
            2 => self.fault_address,
            _ => 0,
        }
    }

    #[cfg(test)]
    fn synthetic(ip: usize, sp: usize, fp: usize, _lr: usize) -> Self {
        let mut regs = Self::default();
        regs.gpr[RIP] = ip as u64;
        regs.gpr[RSP] = sp as u64;
        regs.gpr[RBP] = fp as u64;
        regs
    }
}

#[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "x86_64"))]
impl X86_64Registers {
    /// # Safety
    /// `ucontext` must point at the context the kernel passed to a signal handler.
    pub(crate) unsafe fn from_ucontext(ucontext: *const libc::ucontext_t) -> Self {
        let gregs = &(*ucontext).uc_mcontext.gregs;
        let g = |index: libc::c_int| gregs[index as usize] as u64;
        let csgsfs = g(libc::REG_CSGSFS);
        Self {
            gpr: [
                g(libc::REG_RAX),
                g(libc::REG_RBX),
                g(libc::REG_RCX),
                g(libc::REG_RDX),
                g(libc::REG_RDI),
                g(libc::REG_RSI),
                g(libc::REG_RBP),
                g(libc::REG_RSP),
                g(libc::REG_R8),
                g(libc::REG_R9),
                g(libc::REG_R10),
                g(libc::REG_R11),
                g(libc::REG_R12),
                g(libc::REG_R13),
                g(libc::REG_R14),
                g(libc::REG_R15),
                g(libc::REG_RIP),
                g(libc::REG_EFL),
                csgsfs & 0xffff,
                (csgsfs >> 32) & 0xffff,
                (csgsfs >> 16) & 0xffff,
            ],
            trapno: g(libc::REG_TRAPNO),
            err: g(libc::REG_ERR),
            fault_address: g(libc::REG_CR2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_follow_blob() {
        let mut regs = X86_64Registers::default();
        for (i, r) in regs.gpr.iter_mut().enumerate() {
            *r = 0x1111_0000_0000_0000 | i as u64;
        }
        regs.fault_address = 0xdead;
        assert_eq!(regs.frame_pointer() as u64, 0x1111_0000_0000_0006);
        assert_eq!(regs.stack_pointer() as u64, 0x1111_0000_0000_0007);
        assert_eq!(regs.instruction_address() as u64, 0x1111_0000_0000_0010);
        assert_eq!(regs.link_register(), 0);
        assert_eq!(X86_64Registers::register_name(16), Some("rip"));
        assert_eq!(X86_64Registers::register_name(21), None);
        for i in 0..X86_64Registers::register_count() {
            assert_eq!(regs.register_value(i), 0x1111_0000_0000_0000 | i as u64);
        }
        assert_eq!(X86_64Registers::exception_register_name(2), Some("faultvaddr"));
        assert_eq!(regs.exception_register_value(2), 0xdead);
        assert_eq!(regs.fault_address(), 0xdead);
    }
}

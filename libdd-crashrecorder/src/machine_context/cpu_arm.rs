// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::CpuRegisters;

const REGISTER_NAMES: [&str; 17] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "fp", "ip", "sp", "lr",
    "pc", "cpsr",
];
const EXCEPTION_REGISTER_NAMES: [&str; 3] = ["exception", "fsr", "far"];

const FP: usize = 11;
const SP: usize = 13;
const LR: usize = 14;
const PC: usize = 15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArmRegisters {
    pub r: [u32; 17],
    pub exception: u32,
    pub fsr: u32,
    pub far: u32,
}

impl CpuRegisters for ArmRegisters {
    const ARCH: &'static str = "arm";

    fn frame_pointer(&self) -> usize {
        self.r[FP] as usize
    }

    fn stack_pointer(&self) -> usize {
        self.r[SP] as usize
    }

    fn instruction_address(&self) -> usize {
        self.r[PC] as usize
    }

    fn link_register(&self) -> usize {
        self.r[LR] as usize
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
        self.r.get(index).map_or(0, |v| u64::from(*v))
    }

    fn exception_register_count() -> usize {
        EXCEPTION_REGISTER_NAMES.len()
    }

    fn exception_register_name(index: usize) -> Option<&'static str> {
        EXCEPTION_REGISTER_NAMES.get(index).copied()
    }

    fn exception_register_value(&self, index: usize) -> u64 {
        match index {
            0 => u64::from(self.exception),
            1 => u64::from(self.fsr),
            2 => u64::from(self.far),
            _ => 0,
        }
    }

    #[cfg(test)]
    fn synthetic(ip: usize, sp: usize, fp: usize, lr: usize) -> Self {
        let mut regs = Self::default();
        regs.r[PC] = ip as u32;
        regs.r[SP] = sp as u32;
        regs.r[FP] = fp as u32;
        regs.r[LR] = lr as u32;
        regs
    }
}

#[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "arm"))]
impl ArmRegisters {
    /// # Safety
    /// `ucontext` must point at the context the kernel passed to a signal handler.
    pub(crate) unsafe fn from_ucontext(ucontext: *const libc::ucontext_t) -> Self {
        let m = &(*ucontext).uc_mcontext;
        Self {
            r: [
                m.arm_r0 as u32,
                m.arm_r1 as u32,
                m.arm_r2 as u32,
                m.arm_r3 as u32,
                m.arm_r4 as u32,
                m.arm_r5 as u32,
                m.arm_r6 as u32,
                m.arm_r7 as u32,
                m.arm_r8 as u32,
                m.arm_r9 as u32,
                m.arm_r10 as u32,
                m.arm_fp as u32,
                m.arm_ip as u32,
                m.arm_sp as u32,
                m.arm_lr as u32,
                m.arm_pc as u32,
                m.arm_cpsr as u32,
            ],
            exception: m.trap_no as u32,
            fsr: m.error_code as u32,
            far: m.fault_address as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_follow_blob() {
        let mut regs = ArmRegisters::default();
        for (i, r) in regs.r.iter_mut().enumerate() {
            *r = 0x4000 + i as u32;
        }
        regs.far = 0x10;
        assert_eq!(regs.frame_pointer(), 0x4000 + 11);
        assert_eq!(regs.stack_pointer(), 0x4000 + 13);
        assert_eq!(regs.link_register(), 0x4000 + 14);
        assert_eq!(regs.instruction_address(), 0x4000 + 15);
        assert_eq!(ArmRegisters::register_name(16), Some("cpsr"));
        assert_eq!(regs.register_value(16), 0x4000 + 16);
        assert_eq!(regs.exception_register_value(2), 0x10);
    }
}

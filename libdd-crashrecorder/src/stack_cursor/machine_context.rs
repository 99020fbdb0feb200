// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::machine_context::MachineContext;
use crate::memory::read_pod;

/// Saved `{previous frame pointer, return address}` pair at the base of each frame.
#[derive(Debug, Clone, Copy, Default)]
struct FrameEntry {
    previous: usize,
    return_address: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    InstructionPointer,
    LinkRegister,
    FrameChain,
}

/// Yields the instruction pointer, the link register when set, then the saved return
/// addresses found by following the frame-pointer chain.
#[derive(Clone)]
pub(super) struct FramePointerWalker<'a> {
    context: &'a MachineContext,
    phase: Phase,
    frame: FrameEntry,
    started_chain: bool,
}

impl<'a> FramePointerWalker<'a> {
    pub(super) fn new(context: &'a MachineContext) -> Self {
        Self {
            context,
            phase: Phase::InstructionPointer,
            frame: FrameEntry::default(),
            started_chain: false,
        }
    }

    pub(super) fn reset(&mut self) {
        self.phase = Phase::InstructionPointer;
        self.frame = FrameEntry::default();
        self.started_chain = false;
    }

    pub(super) fn next(&mut self) -> Option<usize> {
        // A zero register is skipped, not yielded.
        if self.phase == Phase::InstructionPointer {
            self.phase = Phase::LinkRegister;
            let ip = self.context.instruction_address();
            if ip != 0 {
                return Some(ip);
            }
        }
        if self.phase == Phase::LinkRegister {
            self.phase = Phase::FrameChain;
            let lr = self.context.link_register();
            if lr != 0 {
                return Some(lr);
            }
        }

        if !self.started_chain {
            self.started_chain = true;
            self.frame.previous = self.context.frame_pointer();
        }
        if self.frame.previous == 0 {
            return None;
        }
        // Only a complete pair is trusted; a partial read ends the walk.
        let [previous, return_address]: [usize; 2] = read_pod(self.frame.previous)?;
        if previous == 0 || return_address == 0 {
            self.frame.previous = 0;
            return None;
        }
        self.frame = FrameEntry {
            previous,
            return_address,
        };
        Some(return_address)
    }
}

#[cfg(test)]
mod tests {
    use crate::machine_context::{CpuRegisters, MachineContext, NativeRegisters, ThreadHandle};
    use crate::shared::constants::STACK_OVERFLOW_THRESHOLD;
    use crate::stack_cursor::StackCursor;

    /// Frames laid out in a heap buffer: frame i links to frame i + 1, the last one is
    /// terminal. Returns the buffer and the address of the first frame.
    fn frame_chain(return_addresses: &[usize], cyclic: bool) -> (Vec<[usize; 2]>, usize) {
        let mut frames = vec![[0usize; 2]; return_addresses.len() + 1];
        let base = frames.as_ptr() as usize;
        let stride = std::mem::size_of::<[usize; 2]>();
        for (i, ret) in return_addresses.iter().enumerate() {
            frames[i] = [base + (i + 1) * stride, *ret];
        }
        if cyclic {
            let last = return_addresses.len() - 1;
            frames[last][0] = base;
        }
        (frames, base)
    }

    fn context_for(ip: usize, fp: usize) -> MachineContext {
        let registers = NativeRegisters::synthetic(ip, 0x7fff_0000, fp, 0);
        MachineContext::from_registers(ThreadHandle(1), Some(registers), false)
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn walks_synthetic_chain_in_order() {
        let returns = [0x1100usize, 0x1200, 0x1300, 0x1400];
        let (_frames, fp) = frame_chain(&returns, false);
        let context = context_for(0x1000, fp);
        let mut cursor = StackCursor::with_machine_context(&context, 50);
        let mut seen = Vec::new();
        while cursor.advance() {
            seen.push(cursor.address());
        }
        assert_eq!(seen, [0x1000, 0x1100, 0x1200, 0x1300, 0x1400]);
        assert!(!cursor.has_given_up());

        cursor.reset();
        assert!(cursor.advance());
        assert_eq!(cursor.address(), 0x1000);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn link_register_comes_second() {
        let (_frames, fp) = frame_chain(&[0x3000], false);
        let registers = NativeRegisters::synthetic(0x1000, 0x7fff_0000, fp, 0x2000);
        let context = MachineContext::from_registers(ThreadHandle(1), Some(registers), false);
        let mut cursor = StackCursor::with_machine_context(&context, 50);
        let mut seen = Vec::new();
        while cursor.advance() {
            seen.push(cursor.address());
        }
        if context.link_register() != 0 {
            assert_eq!(seen, [0x1000, 0x2000, 0x3000]);
        } else {
            assert_eq!(seen, [0x1000, 0x3000]);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn zero_instruction_pointer_keeps_the_chain() {
        let returns = [0x1100usize, 0x1200];
        let (_frames, fp) = frame_chain(&returns, false);
        let context = context_for(0, fp);
        let mut cursor = StackCursor::with_machine_context(&context, 3);
        let mut seen = Vec::new();
        while cursor.advance() {
            seen.push(cursor.address());
        }
        assert_eq!(seen, returns);
        assert_eq!(cursor.depth(), 2);
        assert!(!cursor.has_given_up());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn bad_frame_pointer_shortens_walk() {
        let context = context_for(0x1000, 0x10);
        let mut cursor = StackCursor::with_machine_context(&context, 50);
        assert!(cursor.advance());
        assert!(!cursor.advance());
        assert!(!cursor.has_given_up());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn deep_chain_overflows() {
        let returns: Vec<usize> = (1..=STACK_OVERFLOW_THRESHOLD + 50).map(|i| i * 0x10).collect();
        let (_frames, fp) = frame_chain(&returns, false);
        let registers = NativeRegisters::synthetic(0x1000, 0x7fff_0000, fp, 0);
        let context = MachineContext::from_registers(ThreadHandle(1), Some(registers), true);
        assert!(context.is_stack_overflow());

        let (_frames, fp) = frame_chain(&returns[..10], false);
        let registers = NativeRegisters::synthetic(0x1000, 0x7fff_0000, fp, 0);
        let context = MachineContext::from_registers(ThreadHandle(1), Some(registers), true);
        assert!(!context.is_stack_overflow());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn cyclic_chain_gives_up() {
        let (_frames, fp) = frame_chain(&[0x10, 0x20, 0x30], true);
        let context = context_for(0x1000, fp);
        let mut cursor = StackCursor::with_machine_context(&context, 40);
        let mut count = 0;
        while cursor.advance() {
            count += 1;
        }
        assert_eq!(count, 40);
        assert!(cursor.has_given_up());
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Register state of one thread, captured without allocating.
//!
//! Every architecture model is compiled on every target so that the accessors can be checked
//! against synthetic register blobs anywhere; only the conversion from a kernel signal context
//! is target specific. [`NativeRegisters`] names the model of the running target and is the
//! only type the rest of the crate touches.

pub mod cpu_aarch64;
pub mod cpu_arm;
pub mod cpu_x86;
pub mod cpu_x86_64;
pub mod sampler;
pub mod threads;

use crate::shared::constants::{MAX_CAPTURED_THREADS, STACK_OVERFLOW_THRESHOLD};
use crate::stack_cursor::StackCursor;
pub use threads::ThreadHandle;

/// Uniform view of an architecture's register file.
pub trait CpuRegisters: Copy + Default {
    /// Architecture name as written into reports.
    const ARCH: &'static str;

    fn frame_pointer(&self) -> usize;
    fn stack_pointer(&self) -> usize;
    fn instruction_address(&self) -> usize;
    /// Zero on architectures without a link register.
    fn link_register(&self) -> usize;
    fn fault_address(&self) -> usize;

    fn register_count() -> usize;
    fn register_name(index: usize) -> Option<&'static str>;
    fn register_value(&self, index: usize) -> u64;

    fn exception_register_count() -> usize;
    fn exception_register_name(index: usize) -> Option<&'static str>;
    fn exception_register_value(&self, index: usize) -> u64;

    /// Strips bits that are not part of the code address (pointer tags, authentication codes).
    fn normalise_instruction_pointer(ip: usize) -> usize {
        ip
    }

    fn stack_grow_direction() -> i32 {
        -1
    }

    /// A register set with only the walking registers filled in.
    #[cfg(test)]
    fn synthetic(ip: usize, sp: usize, fp: usize, lr: usize) -> Self;
}

#[cfg(target_arch = "x86_64")]
pub type NativeRegisters = cpu_x86_64::X86_64Registers;
#[cfg(target_arch = "aarch64")]
pub type NativeRegisters = cpu_aarch64::Aarch64Registers;
#[cfg(target_arch = "x86")]
pub type NativeRegisters = cpu_x86::X86Registers;
#[cfg(target_arch = "arm")]
pub type NativeRegisters = cpu_arm::ArmRegisters;
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "x86",
    target_arch = "arm"
)))]
pub type NativeRegisters = UnknownRegisters;

/// Placeholder model for targets without a register description. Every accessor reads zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnknownRegisters;

impl CpuRegisters for UnknownRegisters {
    const ARCH: &'static str = "unknown";

    fn frame_pointer(&self) -> usize {
        0
    }
    fn stack_pointer(&self) -> usize {
        0
    }
    fn instruction_address(&self) -> usize {
        0
    }
    fn link_register(&self) -> usize {
        0
    }
    fn fault_address(&self) -> usize {
        0
    }
    fn register_count() -> usize {
        0
    }
    fn register_name(_index: usize) -> Option<&'static str> {
        None
    }
    fn register_value(&self, _index: usize) -> u64 {
        0
    }
    fn exception_register_count() -> usize {
        0
    }
    fn exception_register_name(_index: usize) -> Option<&'static str> {
        None
    }
    fn exception_register_value(&self, _index: usize) -> u64 {
        0
    }
    #[cfg(test)]
    fn synthetic(_ip: usize, _sp: usize, _fp: usize, _lr: usize) -> Self {
        Self
    }
}

/// One thread's registers plus the facts a crash report needs about them.
///
/// Lives on the stack of whoever captured it and is never heap allocated.
#[derive(Clone)]
pub struct MachineContext {
    thread: ThreadHandle,
    threads: [ThreadHandle; MAX_CAPTURED_THREADS],
    thread_count: usize,
    registers: NativeRegisters,
    has_registers: bool,
    is_crashed_context: bool,
    is_current_thread: bool,
    is_stack_overflow: bool,
    is_signal_context: bool,
}

impl MachineContext {
    pub fn empty() -> Self {
        Self {
            thread: ThreadHandle::NONE,
            threads: [ThreadHandle::NONE; MAX_CAPTURED_THREADS],
            thread_count: 0,
            registers: NativeRegisters::default(),
            has_registers: false,
            is_crashed_context: false,
            is_current_thread: false,
            is_stack_overflow: false,
            is_signal_context: false,
        }
    }

    /// Captures what is observable about `thread` from the calling thread.
    ///
    /// Another thread's registers are sampled through [`sampler`], which briefly interrupts it.
    /// A running thread cannot meaningfully read its own, so the calling thread's context
    /// carries no CPU state and its stack comes from a self-thread or backtrace cursor instead.
    pub fn capture_thread(thread: ThreadHandle, crashed: bool) -> Self {
        let is_current_thread = thread == ThreadHandle::current();
        let registers = if is_current_thread {
            None
        } else {
            sampler::sample_registers(thread)
        };
        let mut context = Self::from_registers(thread, registers, crashed);
        context.is_current_thread = is_current_thread;
        context
    }

    /// Builds a crashed context from the `ucontext_t` handed to a `SA_SIGINFO` handler.
    ///
    /// # Safety
    /// `ucontext` must be the third argument of a signal handler invocation that is still live.
    pub unsafe fn capture_signal_context(ucontext: *const libc::c_void) -> Self {
        let registers = native_from_ucontext(ucontext);
        let mut context = Self::from_registers(ThreadHandle::current(), registers, true);
        context.is_current_thread = true;
        context.is_signal_context = true;
        context.has_registers = registers.is_some();
        context
    }

    /// A context around an already known register set. Crashed contexts also record the
    /// thread list and check for stack overflow.
    pub fn from_registers(
        thread: ThreadHandle,
        registers: Option<NativeRegisters>,
        crashed: bool,
    ) -> Self {
        let mut context = Self::empty();
        context.thread = thread;
        context.is_crashed_context = crashed;
        if let Some(registers) = registers {
            context.registers = registers;
            context.has_registers = true;
        }
        if crashed {
            context.capture_thread_list();
            context.is_stack_overflow = context.detect_stack_overflow();
        }
        context
    }

    fn capture_thread_list(&mut self) {
        self.thread_count = threads::list_threads(&mut self.threads);
    }

    fn detect_stack_overflow(&self) -> bool {
        if !self.has_registers {
            return false;
        }
        let mut cursor = StackCursor::with_machine_context(self, STACK_OVERFLOW_THRESHOLD);
        while cursor.advance() {}
        cursor.has_given_up()
    }

    pub fn thread(&self) -> ThreadHandle {
        self.thread
    }

    pub fn registers(&self) -> &NativeRegisters {
        &self.registers
    }

    /// False when the registers were never captured, in particular for the running thread
    /// outside of a signal.
    pub fn can_have_cpu_state(&self) -> bool {
        self.has_registers && !(self.is_current_thread && !self.is_signal_context)
    }

    pub fn is_crashed_context(&self) -> bool {
        self.is_crashed_context
    }

    pub fn is_current_thread(&self) -> bool {
        self.is_current_thread
    }

    pub fn is_stack_overflow(&self) -> bool {
        self.is_stack_overflow
    }

    pub fn is_signal_context(&self) -> bool {
        self.is_signal_context
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn thread_at(&self, index: usize) -> Option<ThreadHandle> {
        self.threads[..self.thread_count].get(index).copied()
    }

    pub fn index_of_thread(&self, thread: ThreadHandle) -> Option<usize> {
        self.threads[..self.thread_count]
            .iter()
            .position(|t| *t == thread)
    }

    pub fn frame_pointer(&self) -> usize {
        self.registers.frame_pointer()
    }

    pub fn stack_pointer(&self) -> usize {
        self.registers.stack_pointer()
    }

    pub fn instruction_address(&self) -> usize {
        self.registers.instruction_address()
    }

    pub fn link_register(&self) -> usize {
        self.registers.link_register()
    }

    pub fn fault_address(&self) -> usize {
        self.registers.fault_address()
    }

    pub fn register_count(&self) -> usize {
        NativeRegisters::register_count()
    }

    pub fn register_name(&self, index: usize) -> Option<&'static str> {
        NativeRegisters::register_name(index)
    }

    pub fn register_value(&self, index: usize) -> u64 {
        self.registers.register_value(index)
    }

    pub fn exception_register_count(&self) -> usize {
        NativeRegisters::exception_register_count()
    }

    pub fn exception_register_name(&self, index: usize) -> Option<&'static str> {
        NativeRegisters::exception_register_name(index)
    }

    pub fn exception_register_value(&self, index: usize) -> u64 {
        self.registers.exception_register_value(index)
    }

    pub fn stack_grow_direction(&self) -> i32 {
        NativeRegisters::stack_grow_direction()
    }
}

#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "x86",
        target_arch = "arm"
    )
))]
unsafe fn native_from_ucontext(ucontext: *const libc::c_void) -> Option<NativeRegisters> {
    if ucontext.is_null() {
        return None;
    }
    Some(NativeRegisters::from_ucontext(ucontext.cast()))
}

#[cfg(not(all(
    any(target_os = "linux", target_os = "android"),
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "x86",
        target_arch = "arm"
    )
)))]
unsafe fn native_from_ucontext(_ucontext: *const libc::c_void) -> Option<NativeRegisters> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn current_thread_has_no_cpu_state() {
        let context = MachineContext::capture_thread(ThreadHandle::current(), false);
        assert!(context.is_current_thread());
        assert!(!context.can_have_cpu_state());
        assert_eq!(context.thread_count(), 0);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn crashed_context_records_threads() {
        let context = MachineContext::capture_thread(ThreadHandle::current(), true);
        assert!(context.thread_count() >= 1);
        assert!(context.index_of_thread(ThreadHandle::current()).is_some());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn injected_registers_are_visible() {
        let registers = NativeRegisters::default();
        let context = MachineContext::from_registers(ThreadHandle(7), Some(registers), false);
        assert!(context.can_have_cpu_state());
        assert_eq!(context.register_count(), NativeRegisters::register_count());
        assert_eq!(context.frame_pointer(), 0);
        let context = MachineContext::from_registers(ThreadHandle(7), Some(registers), true);
        // A zero frame pointer is a terminal frame, not an overflow.
        assert!(!context.is_stack_overflow());
    }

    #[cfg(all(
        any(target_os = "linux", target_os = "android"),
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn sibling_thread_gets_cpu_state() {
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let worker = std::thread::spawn(move || {
            tx.send(ThreadHandle::current()).unwrap();
            done_rx.recv().unwrap();
        });
        let parked = rx.recv().unwrap();
        let context = MachineContext::capture_thread(parked, false);
        done_tx.send(()).unwrap();
        worker.join().unwrap();

        assert_eq!(context.thread(), parked);
        assert!(!context.is_current_thread());
        assert!(context.can_have_cpu_state());
        assert_ne!(context.stack_pointer(), 0);
        assert_ne!(context.instruction_address(), 0);
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn signal_context_reads_kernel_registers() {
        // SAFETY: zeroed ucontext is plain data; only the gregs we set are read.
        let mut uc: libc::ucontext_t = unsafe { std::mem::zeroed() };
        uc.uc_mcontext.gregs[libc::REG_RIP as usize] = 0x1234;
        uc.uc_mcontext.gregs[libc::REG_RSP as usize] = 0x7000;
        uc.uc_mcontext.gregs[libc::REG_CR2 as usize] = 0x42;
        let context = unsafe { MachineContext::capture_signal_context(&uc as *const _ as *const _) };
        assert!(context.can_have_cpu_state());
        assert!(context.is_signal_context());
        assert_eq!(context.instruction_address(), 0x1234);
        assert_eq!(context.stack_pointer(), 0x7000);
        assert_eq!(context.fault_address(), 0x42);
        assert!(!context.is_stack_overflow());
    }
}

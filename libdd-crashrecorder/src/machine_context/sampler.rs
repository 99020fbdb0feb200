// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Register snapshots of other threads of this process.
//!
//! The caller interrupts the target with a dedicated signal and waits, for a bounded time, for
//! the target's handler to copy the interrupted register state out of its `ucontext_t`. One
//! request is in flight at a time. The target resumes as soon as its handler returns, so the
//! snapshot describes where it was when the signal arrived.

use super::{NativeRegisters, ThreadHandle};
use std::time::Instant;

/// The signal used to interrupt a thread whose registers are wanted.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn sample_signal() -> libc::c_int {
    libc::SIGRTMIN() + 2
}

/// Installs the sampling handler ahead of time. Returns false if it cannot be installed.
/// Calling it again is cheap.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn prepare() -> bool {
    linux::ensure_handler()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn prepare() -> bool {
    false
}

/// Registers of `thread` at the moment it handled the sampling signal. `None` for the calling
/// thread, for threads that are gone or do not answer in time, and on platforms without
/// signal-context register access. Async-signal-safe.
pub fn sample_registers(thread: ThreadHandle) -> Option<NativeRegisters> {
    if thread.is_none() || thread == ThreadHandle::current() || !prepare() {
        return None;
    }
    let deadline = Instant::now() + crate::shared::constants::THREAD_SAMPLE_TIMEOUT;
    request(thread, deadline)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn request(thread: ThreadHandle, deadline: Instant) -> Option<NativeRegisters> {
    linux::request(thread, deadline)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn request(_thread: ThreadHandle, _deadline: Instant) -> Option<NativeRegisters> {
    None
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux {
    use super::super::{native_from_ucontext, NativeRegisters, ThreadHandle};
    use super::sample_signal;
    use crate::machine_context::threads::signal_thread;
    use crate::shared::log::crash_log;
    use libc::{c_void, siginfo_t};
    use std::cell::UnsafeCell;
    use std::mem::MaybeUninit;
    use std::ptr;
    use std::sync::atomic::Ordering::SeqCst;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8};
    use std::time::Instant;

    const HANDLER_UNINSTALLED: u8 = 0;
    const HANDLER_INSTALLING: u8 = 1;
    const HANDLER_READY: u8 = 2;
    static HANDLER_STATE: AtomicU8 = AtomicU8::new(HANDLER_UNINSTALLED);

    const IDLE: u8 = 0;
    const REQUESTED: u8 = 1;
    const WRITING: u8 = 2;
    const FILLED: u8 = 3;
    const FAILED: u8 = 4;

    struct Slot {
        busy: AtomicBool,
        state: AtomicU8,
        target: AtomicI64,
        registers: UnsafeCell<MaybeUninit<NativeRegisters>>,
    }

    // SAFETY: `registers` is only written by the handler that moved `state` from REQUESTED to
    // WRITING, and only read by the requester after it observed FILLED.
    unsafe impl Sync for Slot {}

    static SLOT: Slot = Slot {
        busy: AtomicBool::new(false),
        state: AtomicU8::new(IDLE),
        target: AtomicI64::new(0),
        registers: UnsafeCell::new(MaybeUninit::uninit()),
    };

    pub(super) fn ensure_handler() -> bool {
        match HANDLER_STATE.compare_exchange(HANDLER_UNINSTALLED, HANDLER_INSTALLING, SeqCst, SeqCst)
        {
            Ok(_) => {
                // SAFETY: the handler only touches the atomics and the slot above.
                let installed = unsafe { install_handler() };
                if let Err(e) = installed {
                    crash_log!(Error, "could not install the thread sampling handler: {e}");
                    HANDLER_STATE.store(HANDLER_UNINSTALLED, SeqCst);
                    return false;
                }
                HANDLER_STATE.store(HANDLER_READY, SeqCst);
                true
            }
            // A concurrent install is not waited for; the signal must never reach a thread
            // before the handler is in place.
            Err(state) => state == HANDLER_READY,
        }
    }

    unsafe fn install_handler() -> Result<(), errno::Errno> {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_sample_signal as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(sample_signal(), &action, ptr::null_mut()) != 0 {
            return Err(errno::errno());
        }
        Ok(())
    }

    pub(super) fn request(thread: ThreadHandle, deadline: Instant) -> Option<NativeRegisters> {
        while SLOT.busy.swap(true, SeqCst) {
            if Instant::now() >= deadline {
                crash_log!(Debug, "thread sampling busy, skipping thread {}", thread.0);
                return None;
            }
            std::thread::yield_now();
        }
        let registers = exchange(thread, deadline);
        SLOT.busy.store(false, SeqCst);
        registers
    }

    fn exchange(thread: ThreadHandle, deadline: Instant) -> Option<NativeRegisters> {
        SLOT.target.store(thread.0, SeqCst);
        SLOT.state.store(REQUESTED, SeqCst);
        if !signal_thread(thread, sample_signal()) {
            SLOT.state.store(IDLE, SeqCst);
            return None;
        }
        loop {
            match SLOT.state.load(SeqCst) {
                FILLED => {
                    // SAFETY: FILLED is only stored after the handler wrote the registers.
                    let registers = unsafe { (*SLOT.registers.get()).assume_init_read() };
                    SLOT.state.store(IDLE, SeqCst);
                    return Some(registers);
                }
                FAILED => {
                    SLOT.state.store(IDLE, SeqCst);
                    return None;
                }
                REQUESTED if Instant::now() >= deadline => {
                    // Loses against a handler that already started writing.
                    if SLOT
                        .state
                        .compare_exchange(REQUESTED, IDLE, SeqCst, SeqCst)
                        .is_ok()
                    {
                        crash_log!(Warn, "thread {} did not answer the sampling signal", thread.0);
                        return None;
                    }
                }
                _ => std::thread::yield_now(),
            }
        }
    }

    extern "C" fn handle_sample_signal(_signum: i32, _info: *mut siginfo_t, ucontext: *mut c_void) {
        if SLOT.target.load(SeqCst) != ThreadHandle::current().0 {
            return;
        }
        if SLOT
            .state
            .compare_exchange(REQUESTED, WRITING, SeqCst, SeqCst)
            .is_err()
        {
            return;
        }
        // SAFETY: the context comes straight from the kernel for this invocation.
        match unsafe { native_from_ucontext(ucontext.cast_const()) } {
            Some(registers) => {
                // SAFETY: WRITING gives this handler exclusive access to the registers.
                unsafe { (*SLOT.registers.get()).write(registers) };
                SLOT.state.store(FILLED, SeqCst);
            }
            None => SLOT.state.store(FAILED, SeqCst),
        }
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fatal signal source.
//!
//! Enabling installs one `SA_SIGINFO` handler for every configured signal and keeps the actions it
//! replaced. Disabling puts those actions back, which the registry does before a fatal event
//! returns, so that re-raising the signal reaches whoever was there before us.

use super::context::{MonitorContext, SignalInfo};
use super::signal_names::signal_from_signum;
use super::{Monitor, MonitorType};
use crate::api::CrashRecorder;
use crate::machine_context::MachineContext;
use crate::shared::configuration::CrashRecorderConfiguration;
use crate::shared::constants::MAX_STACK_DEPTH;
use crate::shared::log::crash_log;
use crate::stack_cursor::StackCursor;
use libc::{c_void, siginfo_t};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU8};

// Linux seems to have the most, supporting up to 64 inclusive
// https://man7.org/linux/man-pages/man7/signal.7.html
const MAX_SIGNALS: usize = 65;

const UNINSTALLED: u8 = 0;
const BUSY: u8 = 1;
const INSTALLED: u8 = 2;

type PreviousAction = Option<(signal::Signal, SigAction)>;

struct PreviousActions {
    state: AtomicU8,
    actions: UnsafeCell<[PreviousAction; MAX_SIGNALS]>,
}

// SAFETY: `actions` is only mutated by the thread that moved `state` to BUSY, and only read
// while `state` is INSTALLED or by that same thread.
unsafe impl Sync for PreviousActions {}

static PREVIOUS: PreviousActions = PreviousActions {
    state: AtomicU8::new(UNINSTALLED),
    actions: UnsafeCell::new([None; MAX_SIGNALS]),
};

static ALT_STACK_CREATED: AtomicBool = AtomicBool::new(false);

fn previous_action(signum: i32) -> PreviousAction {
    if PREVIOUS.state.load(SeqCst) != INSTALLED {
        return None;
    }
    let index = usize::try_from(signum).ok().filter(|i| *i < MAX_SIGNALS)?;
    // SAFETY: INSTALLED means no writer is active.
    unsafe { (*PREVIOUS.actions.get())[index] }
}

pub struct SignalMonitor {
    enabled: AtomicBool,
    signals: Vec<i32>,
    create_alt_stack: bool,
    use_alt_stack: bool,
}

impl SignalMonitor {
    pub fn new(config: &CrashRecorderConfiguration) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            signals: config.signals().to_vec(),
            create_alt_stack: config.create_alt_stack(),
            use_alt_stack: config.use_alt_stack(),
        }
    }

    pub fn signals(&self) -> &[i32] {
        &self.signals
    }

    fn install(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            PREVIOUS
                .state
                .compare_exchange(UNINSTALLED, BUSY, SeqCst, SeqCst)
                .is_ok(),
            "Signal handlers are already installed"
        );
        let result = self.install_handlers();
        PREVIOUS.state.store(
            if result.is_ok() { INSTALLED } else { UNINSTALLED },
            SeqCst,
        );
        result
    }

    fn install_handlers(&self) -> anyhow::Result<()> {
        if self.create_alt_stack && !ALT_STACK_CREATED.swap(true, SeqCst) {
            // SAFETY: no preconditions.
            if let Err(e) = unsafe { create_alt_stack() } {
                ALT_STACK_CREATED.store(false, SeqCst);
                return Err(e);
            }
        }
        let extra_flags = if self.use_alt_stack {
            SaFlags::SA_ONSTACK
        } else {
            SaFlags::empty()
        };
        // Nested faults inside the handler must reach it again to produce a recrash report.
        let action = SigAction::new(
            SigHandler::SigAction(handle_signal),
            SaFlags::SA_NODEFER | extra_flags,
            SigSet::empty(),
        );

        // SAFETY: the caller moved the state to BUSY.
        let previous = unsafe { &mut *PREVIOUS.actions.get() };
        for (installed, &signum) in self.signals.iter().enumerate() {
            let result = usize::try_from(signum)
                .ok()
                .filter(|i| *i < MAX_SIGNALS)
                .ok_or_else(|| anyhow::anyhow!("Signal {signum} is out of range"))
                .and_then(|index| {
                    let sig = signal_from_signum(signum)?;
                    // SAFETY: the handler only touches async-signal-safe state.
                    let old = unsafe { signal::sigaction(sig, &action) }?;
                    previous[index] = Some((sig, old));
                    Ok(())
                });
            if let Err(e) = result {
                for &signum in &self.signals[..installed] {
                    restore(previous, signum);
                }
                return Err(e.context(format!("Unable to register handler for signal {signum}")));
            }
        }
        Ok(())
    }

    /// Async-signal-safe.
    fn uninstall(&self) {
        if PREVIOUS
            .state
            .compare_exchange(INSTALLED, BUSY, SeqCst, SeqCst)
            .is_err()
        {
            return;
        }
        // SAFETY: the state is BUSY and owned by this call.
        let previous = unsafe { &mut *PREVIOUS.actions.get() };
        for &signum in &self.signals {
            restore(previous, signum);
        }
        PREVIOUS.state.store(UNINSTALLED, SeqCst);
    }
}

fn restore(previous: &mut [PreviousAction; MAX_SIGNALS], signum: i32) {
    let Some(slot) = usize::try_from(signum)
        .ok()
        .and_then(|index| previous.get_mut(index))
    else {
        return;
    };
    if let Some((sig, action)) = slot.take() {
        // SAFETY: reinstalls an action the kernel handed us.
        if unsafe { signal::sigaction(sig, &action) }.is_err() {
            crash_log!(Error, "could not restore the handler for {}", sig.as_str());
        }
    }
}

impl Monitor for SignalMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::SIGNAL
    }

    fn set_enabled(&self, enabled: bool) {
        if self.enabled.load(SeqCst) == enabled {
            return;
        }
        if enabled {
            if let Err(e) = self.install() {
                tracing::error!("Not monitoring signals: {e:#}");
                return;
            }
            self.enabled.store(true, SeqCst);
        } else {
            self.enabled.store(false, SeqCst);
            self.uninstall();
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    fn add_contextual_info_to_event<'a>(&'a self, context: &mut MonitorContext<'a>) {
        if !context
            .crash_type
            .intersects(MonitorType::SIGNAL | MonitorType::MACH_EXCEPTION)
        {
            context.signal.signum = libc::SIGABRT;
        }
    }
}

extern "C" fn handle_signal(signum: i32, sig_info: *mut siginfo_t, ucontext: *mut c_void) {
    // Copied now: a fatal event restores the previous actions before returning here.
    let previous = previous_action(signum);
    crash_log!(Debug, "trapped signal {signum}");
    if let Some(recorder) = CrashRecorder::installed() {
        if recorder.registry().signal().is_enabled() {
            // SAFETY: the arguments come straight from the kernel.
            unsafe { report_signal(recorder, signum, sig_info, ucontext) };
        }
    }
    // SAFETY: same as above.
    unsafe { chain_signal_handler(signum, previous, sig_info, ucontext) };
}

unsafe fn report_signal(
    recorder: &CrashRecorder,
    signum: i32,
    sig_info: *const siginfo_t,
    ucontext: *const c_void,
) {
    let machine = MachineContext::capture_signal_context(ucontext);
    let mut context = MonitorContext::new(MonitorType::SIGNAL);
    context.registers_are_valid = machine.can_have_cpu_state();
    context.stack_cursor = Some(StackCursor::with_machine_context(&machine, MAX_STACK_DEPTH));
    context.offending_machine_context = Some(&machine);
    context.fault_address = fault_address(sig_info).unwrap_or_else(|| machine.fault_address());
    context.signal = SignalInfo {
        signum,
        sigcode: sig_info.as_ref().map_or(0, |info| info.si_code),
        user_context: ucontext,
    };
    recorder.handle_exception(&mut context);
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn fault_address(sig_info: *const siginfo_t) -> Option<usize> {
    sig_info.as_ref().map(|info| info.si_addr() as usize)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn fault_address(sig_info: *const siginfo_t) -> Option<usize> {
    sig_info.as_ref().map(|info| info.si_addr as usize)
}

/// Hands the signal to whatever handled it before us. A default disposition is reinstalled and
/// the signal raised again so that the process dies the way it would have without us.
unsafe fn chain_signal_handler(
    signum: i32,
    previous: PreviousAction,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    let Some((sig, action)) = previous else {
        libc::signal(signum, libc::SIG_DFL);
        libc::raise(signum);
        return;
    };
    match action.handler() {
        SigHandler::SigDfl => {
            if signal::sigaction(sig, &action).is_err() {
                libc::signal(signum, libc::SIG_DFL);
            }
            // Returning from a hardware fault re-executes the faulting instruction, but a
            // signal sent with raise() or kill() is only delivered once.
            libc::raise(signum);
        }
        SigHandler::SigIgn => (),
        SigHandler::Handler(f) => f(signum),
        SigHandler::SigAction(f) => f(signum, sig_info, ucontext),
    }
}

/// Allocates a signal altstack, and puts a guard page at the end.
unsafe fn create_alt_stack() -> anyhow::Result<()> {
    // The default SIGSTKSZ is too small for report writing.
    let page_size = page_size::get();
    let stack_size = std::cmp::max(libc::SIGSTKSZ, 16 * page_size);
    let stackp = libc::mmap(
        ptr::null_mut(),
        stack_size + page_size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    anyhow::ensure!(
        stackp != libc::MAP_FAILED,
        "failed to allocate an alternative stack"
    );
    let guard_result = libc::mprotect(stackp, page_size, libc::PROT_NONE);
    anyhow::ensure!(
        guard_result == 0,
        "failed to set up alternative stack guard page"
    );
    let stack = libc::stack_t {
        ss_sp: stackp.add(page_size),
        ss_flags: 0,
        ss_size: stack_size,
    };
    let rval = libc::sigaltstack(&stack, ptr::null_mut());
    anyhow::ensure!(rval == 0, "sigaltstack failed {rval}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_max_signals() {
        assert!(super::MAX_SIGNALS as libc::c_int > libc::SIGRTMAX());
    }

    static CHAINED: AtomicBool = AtomicBool::new(false);

    extern "C" fn mark_chained(_signum: i32) {
        CHAINED.store(true, SeqCst);
    }

    fn current_handler(signum: i32) -> usize {
        // SAFETY: zeroed sigaction is a valid out parameter.
        unsafe {
            let mut old: libc::sigaction = std::mem::zeroed();
            assert_eq!(libc::sigaction(signum, ptr::null(), &mut old), 0);
            old.sa_sigaction
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn enable_replaces_and_disable_restores_and_chains() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = CrashRecorderConfiguration::new("app", dir.path())?;
        config.set_signals(vec![libc::SIGUSR1])?;
        config.set_alt_stack(false, false)?;

        // SAFETY: installs a trivial handler for a signal nothing else uses in this binary.
        unsafe { libc::signal(libc::SIGUSR1, mark_chained as libc::sighandler_t) };
        let monitor = SignalMonitor::new(&config);
        monitor.set_enabled(true);
        assert!(monitor.is_enabled());
        assert_eq!(current_handler(libc::SIGUSR1), handle_signal as usize);

        // With no recorder installed the signal goes straight to the previous handler.
        // SAFETY: raising a handled signal.
        unsafe { libc::raise(libc::SIGUSR1) };
        assert!(CHAINED.load(SeqCst));

        monitor.set_enabled(false);
        assert!(!monitor.is_enabled());
        assert_eq!(current_handler(libc::SIGUSR1), mark_chained as usize);

        // Re-enabling works after a restore.
        monitor.set_enabled(true);
        assert!(monitor.is_enabled());
        monitor.set_enabled(false);
        // SAFETY: restores the default disposition.
        unsafe { libc::signal(libc::SIGUSR1, libc::SIG_DFL) };
        Ok(())
    }

    #[test]
    fn non_signal_events_are_attributed_to_abort() {
        let dir = tempfile::tempdir().unwrap();
        let config = CrashRecorderConfiguration::new("app", dir.path()).unwrap();
        let monitor = SignalMonitor::new(&config);
        let mut context = MonitorContext::new(MonitorType::CPP_EXCEPTION);
        monitor.add_contextual_info_to_event(&mut context);
        assert_eq!(context.signal.signum, libc::SIGABRT);

        let mut context = MonitorContext::new(MonitorType::SIGNAL);
        context.signal.signum = libc::SIGSEGV;
        monitor.add_contextual_info_to_event(&mut context);
        assert_eq!(context.signal.signum, libc::SIGSEGV);
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Main thread deadlock watchdog.
//!
//! The watched thread proves it is alive by calling [`DeadlockMonitor::heartbeat`]. When a full
//! interval passes without one, the watchdog sends a dedicated signal to the watched thread. Its
//! handler captures the thread's own registers, reports the deadlock and aborts.

use super::context::MonitorContext;
use super::{Monitor, MonitorType};
use crate::api::CrashRecorder;
use crate::machine_context::threads::signal_thread;
use crate::machine_context::{MachineContext, ThreadHandle};
use crate::shared::constants::MAX_STACK_DEPTH;
use crate::shared::log::crash_log;
use crate::stack_cursor::StackCursor;
use libc::{c_void, siginfo_t};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// The signal the watchdog uses to interrupt the watched thread.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn deadlock_signal() -> libc::c_int {
    libc::SIGRTMIN() + 1
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn deadlock_signal() -> libc::c_int {
    libc::SIGUSR2
}

struct Shared {
    awaiting_heartbeat: AtomicBool,
    watched: AtomicI64,
    // Bumped to stop the current watchdog thread.
    generation: AtomicU64,
    detected: AtomicBool,
    lock: Mutex<()>,
    wakeup: Condvar,
}

pub struct DeadlockMonitor {
    enabled: AtomicBool,
    interval: Duration,
    shared: Arc<Shared>,
}

impl DeadlockMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            interval,
            shared: Arc::new(Shared {
                awaiting_heartbeat: AtomicBool::new(false),
                watched: AtomicI64::new(ThreadHandle::NONE.0),
                generation: AtomicU64::new(0),
                detected: AtomicBool::new(false),
                lock: Mutex::new(()),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Called regularly by the watched thread.
    pub fn heartbeat(&self) {
        self.shared.awaiting_heartbeat.store(false, SeqCst);
    }

    /// Watches the calling thread instead of the one that enabled the monitor.
    pub fn watch_current_thread(&self) {
        self.shared.watched.store(ThreadHandle::current().0, SeqCst);
        self.heartbeat();
    }

    /// Whether the watchdog has given up on the watched thread since it was enabled.
    pub fn deadlock_detected(&self) -> bool {
        self.shared.detected.load(SeqCst)
    }

    fn start(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.interval.is_zero(),
            "Deadlock watchdog interval is zero"
        );
        if !HANDLER_INSTALLED.swap(true, SeqCst) {
            // SAFETY: installs a handler that only touches async-signal-safe state.
            if let Err(e) = unsafe { install_handler() } {
                HANDLER_INSTALLED.store(false, SeqCst);
                return Err(e);
            }
        }
        self.shared.detected.store(false, SeqCst);
        self.watch_current_thread();
        let generation = self.shared.generation.load(SeqCst);
        let shared = Arc::clone(&self.shared);
        let interval = self.interval;
        thread::Builder::new()
            .name("crashrecorder-watchdog".into())
            .spawn(move || watchdog(&shared, generation, interval))?;
        Ok(())
    }

    /// Async-signal-safe: the thread is told to stop, never joined.
    fn stop(&self) {
        self.shared.generation.fetch_add(1, SeqCst);
        self.shared.wakeup.notify_all();
    }
}

fn watchdog(shared: &Shared, generation: u64, interval: Duration) {
    let stopped = || shared.generation.load(SeqCst) != generation;
    loop {
        let guard = shared.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _guard = shared
            .wakeup
            .wait_timeout_while(guard, interval, |_| !stopped())
            .unwrap_or_else(PoisonError::into_inner);
        if stopped() {
            break;
        }
        if shared.awaiting_heartbeat.swap(true, SeqCst) {
            let watched = ThreadHandle(shared.watched.load(SeqCst));
            tracing::warn!(?watched, ?interval, "Watched thread missed its heartbeat");
            shared.detected.store(true, SeqCst);
            if !signal_thread(watched, deadlock_signal()) {
                tracing::error!("Could not interrupt deadlocked thread {watched:?}");
            }
            break;
        }
    }
}

impl Monitor for DeadlockMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::MAIN_THREAD_DEADLOCK
    }

    fn set_enabled(&self, enabled: bool) {
        if self.enabled.load(SeqCst) == enabled {
            return;
        }
        if enabled {
            if let Err(e) = self.start() {
                tracing::warn!("Not watching for deadlocks: {e:#}");
                return;
            }
            self.enabled.store(true, SeqCst);
        } else {
            self.enabled.store(false, SeqCst);
            self.stop();
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
}

unsafe fn install_handler() -> anyhow::Result<()> {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = handle_deadlock_signal as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
    libc::sigemptyset(&mut action.sa_mask);
    let rval = libc::sigaction(deadlock_signal(), &action, ptr::null_mut());
    anyhow::ensure!(rval == 0, "sigaction failed: {}", errno::errno());
    Ok(())
}

extern "C" fn handle_deadlock_signal(_signum: i32, _info: *mut siginfo_t, ucontext: *mut c_void) {
    let Some(recorder) = CrashRecorder::installed() else {
        return;
    };
    if !recorder.registry().deadlock().is_enabled() {
        return;
    }
    crash_log!(Info, "reporting a deadlocked thread");
    // SAFETY: the context comes straight from the kernel.
    let machine = unsafe { MachineContext::capture_signal_context(ucontext.cast_const()) };
    let mut context = MonitorContext::new(MonitorType::MAIN_THREAD_DEADLOCK);
    context.registers_are_valid = machine.can_have_cpu_state();
    context.stack_cursor = Some(StackCursor::with_machine_context(&machine, MAX_STACK_DEPTH));
    context.offending_machine_context = Some(&machine);
    context.crash_reason = Some("Main thread deadlocked");
    recorder.handle_exception(&mut context);
    // SAFETY: no preconditions.
    unsafe { libc::abort() };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_refuses_to_enable() {
        let monitor = DeadlockMonitor::new(Duration::ZERO);
        monitor.set_enabled(true);
        assert!(!monitor.is_enabled());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn heartbeats_keep_the_watchdog_quiet() {
        let monitor = DeadlockMonitor::new(Duration::from_millis(50));
        monitor.set_enabled(true);
        assert!(monitor.is_enabled());
        for _ in 0..10 {
            monitor.heartbeat();
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!monitor.deadlock_detected());
        monitor.set_enabled(false);
        assert!(!monitor.is_enabled());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn missed_heartbeat_is_detected() {
        let monitor = DeadlockMonitor::new(Duration::from_millis(20));
        // The watched thread exits right away; the signal to it is harmless without a recorder.
        thread::scope(|s| {
            s.spawn(|| monitor.set_enabled(true));
        });
        let mut waited = Duration::ZERO;
        while !monitor.deadlock_detected() && waited < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }
        assert!(monitor.deadlock_detected());
        monitor.set_enabled(false);
    }
}

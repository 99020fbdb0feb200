// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Panics, the Rust counterpart of an uncaught C++ exception.
//!
//! The hook is registered once and stays registered; while the monitor is disabled it only
//! forwards to the hook it replaced.

use super::context::MonitorContext;
use super::{Monitor, MonitorType};
use crate::api::CrashRecorder;
use crate::machine_context::{MachineContext, ThreadHandle};
use crate::stack_cursor::StackCursor;
use std::panic::{self, PanicHookInfo};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr};

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync + 'static>;
static PREVIOUS_PANIC_HOOK: AtomicPtr<PanicHook> = AtomicPtr::new(ptr::null_mut());

const PANIC_NAME: &str = "panic";

pub struct CppExceptionMonitor {
    enabled: AtomicBool,
}

impl CppExceptionMonitor {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
        }
    }
}

impl Default for CppExceptionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Register the panic hook.
///
/// Only the first call replaces the process hook; later calls do nothing.
fn register_panic_hook() {
    if !PREVIOUS_PANIC_HOOK.load(SeqCst).is_null() {
        return;
    }
    let old_hook = panic::take_hook();
    let old_hook_ptr = Box::into_raw(Box::new(old_hook));
    PREVIOUS_PANIC_HOOK.swap(old_hook_ptr, SeqCst);
    panic::set_hook(Box::new(|panic_info| {
        if let Some(recorder) = CrashRecorder::installed() {
            if recorder.registry().cpp_exception().is_enabled() {
                report_panic(recorder, panic_info);
            }
        }
        call_previous_panic_hook(panic_info);
    }));
}

fn call_previous_panic_hook(panic_info: &PanicHookInfo<'_>) {
    let old_hook_ptr = PREVIOUS_PANIC_HOOK.load(SeqCst);
    // SAFETY: the pointer comes from Box::into_raw in register_panic_hook and is never freed.
    if let Some(old_hook) = unsafe { old_hook_ptr.as_ref() } {
        old_hook(panic_info);
    }
}

/// The payload message followed by the panic location.
fn panic_reason(panic_info: &PanicHookInfo<'_>) -> String {
    let payload = panic_info.payload();
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("Box<dyn Any>");
    match panic_info.location() {
        Some(location) => format!("{message} at {location}"),
        None => message.to_string(),
    }
}

fn report_panic(recorder: &CrashRecorder, panic_info: &PanicHookInfo<'_>) {
    let reason = panic_reason(panic_info);
    let machine = MachineContext::capture_thread(ThreadHandle::current(), true);
    let mut context = MonitorContext::new(MonitorType::CPP_EXCEPTION);
    // The panic may still be caught, or turn into an abort that the signal monitor reports.
    context.is_fatal = false;
    context.is_async_safe = false;
    context.offending_machine_context = Some(&machine);
    context.stack_cursor = Some(StackCursor::with_self_thread(0));
    context.exception_name = Some(PANIC_NAME);
    context.crash_reason = Some(reason.as_str());
    recorder.handle_exception(&mut context);
}

impl Monitor for CppExceptionMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::CPP_EXCEPTION
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled {
            register_panic_hook();
        }
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn hook_is_registered_once_and_chains() {
        let monitor = CppExceptionMonitor::new();
        monitor.set_enabled(true);
        let first = PREVIOUS_PANIC_HOOK.load(SeqCst);
        assert!(!first.is_null());
        monitor.set_enabled(false);
        monitor.set_enabled(true);
        assert_eq!(PREVIOUS_PANIC_HOOK.load(SeqCst), first);

        // No recorder is installed, the panic only goes through the previous hook.
        let result = std::panic::catch_unwind(|| panic!("boom"));
        assert!(result.is_err());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn reason_includes_message_and_location() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(String::new()));
        let inner = seen.clone();
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            *inner.lock().unwrap() = panic_reason(info);
        }));
        let _ = std::panic::catch_unwind(|| panic!("formatted {}", 42));
        panic::set_hook(previous);
        let reason = seen.lock().unwrap().clone();
        assert!(reason.starts_with("formatted 42 at "), "{reason}");
        assert!(reason.contains("cpp_exception.rs"), "{reason}");
    }
}

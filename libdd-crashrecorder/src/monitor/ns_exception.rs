// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Uncaught exceptions of a hosting language runtime.

use super::context::{MonitorContext, RuntimeExceptionInfo};
use super::{Monitor, MonitorType};
use crate::api::CrashRecorder;
use crate::machine_context::{MachineContext, ThreadHandle};
use crate::stack_cursor::StackCursor;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

/// An exception the hosting runtime could not handle.
#[derive(Debug, Clone, Copy, Default)]
pub struct UncaughtException<'a> {
    pub name: &'a str,
    pub reason: Option<&'a str>,
    /// Encoded JSON object with the exception's user info.
    pub user_info_json: Option<&'a str>,
    /// Return addresses captured by the runtime when the exception was raised. When empty the
    /// reporting thread's own stack is used.
    pub addresses: &'a [usize],
}

pub struct NsExceptionMonitor {
    enabled: AtomicBool,
}

impl NsExceptionMonitor {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
        }
    }

    /// Reports `exception` as a fatal event. Returns false if the monitor is disabled.
    pub(crate) fn report(&self, recorder: &CrashRecorder, exception: &UncaughtException<'_>) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let machine = MachineContext::capture_thread(ThreadHandle::current(), true);
        let mut context = MonitorContext::new(MonitorType::NS_EXCEPTION);
        context.is_async_safe = false;
        context.offending_machine_context = Some(&machine);
        context.stack_cursor = Some(if exception.addresses.is_empty() {
            StackCursor::with_self_thread(0)
        } else {
            StackCursor::with_backtrace(exception.addresses, 0)
        });
        context.exception_name = Some(exception.name);
        context.crash_reason = exception.reason;
        context.runtime_exception = RuntimeExceptionInfo {
            name: Some(exception.name),
            user_info: exception.user_info_json.map(str::as_bytes),
        };
        recorder.handle_exception(&mut context);
        true
    }
}

impl Default for NsExceptionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for NsExceptionMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::NS_EXCEPTION
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
}

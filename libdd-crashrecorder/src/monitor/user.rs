// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exceptions reported explicitly by the embedding code.

use super::context::{MonitorContext, UserExceptionInfo};
use super::{Monitor, MonitorType};
use crate::api::CrashRecorder;
use crate::machine_context::{MachineContext, ThreadHandle};
use crate::stack_cursor::StackCursor;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

#[derive(Debug, Clone, Copy, Default)]
pub struct UserException<'a> {
    pub name: &'a str,
    pub reason: Option<&'a str>,
    /// Language the exception was raised in, e.g. `"javascript"`.
    pub language: Option<&'a str>,
    pub line_of_code: Option<&'a str>,
    /// Encoded JSON array describing the stack in the reporting language.
    pub stack_trace_json: Option<&'a str>,
    /// List every thread of the process, not only the reporting one.
    pub log_all_threads: bool,
    /// Abort the process once the report is written.
    pub terminate_program: bool,
}

pub struct UserReportedMonitor {
    enabled: AtomicBool,
}

impl UserReportedMonitor {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
        }
    }

    /// Records `exception`. Returns false if the monitor is disabled.
    pub(crate) fn report(&self, recorder: &CrashRecorder, exception: &UserException<'_>) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let machine = MachineContext::capture_thread(ThreadHandle::current(), exception.log_all_threads);
        let mut context = MonitorContext::new(MonitorType::USER_REPORTED);
        context.is_async_safe = false;
        context.is_fatal = exception.terminate_program;
        context.offending_machine_context = Some(&machine);
        context.stack_cursor = Some(StackCursor::with_self_thread(0));
        context.exception_name = Some(exception.name);
        context.crash_reason = exception.reason;
        context.user_exception = UserExceptionInfo {
            name: Some(exception.name),
            language: exception.language,
            line_of_code: exception.line_of_code,
            custom_stack_trace: exception.stack_trace_json.map(str::as_bytes),
        };
        recorder.handle_exception(&mut context);
        true
    }
}

impl Default for UserReportedMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for UserReportedMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::USER_REPORTED
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
}

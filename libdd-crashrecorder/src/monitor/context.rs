// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::app_state::AppStateSnapshot;
use super::system::SystemInfo;
use super::zombie::DeallocatedException;
use super::MonitorType;
use crate::machine_context::MachineContext;
use crate::shared::fixed_str::FixedStr;
use crate::stack_cursor::StackCursor;

/// Length of a hyphenated UUID string.
pub const EVENT_ID_LEN: usize = 36;

#[derive(Debug, Clone, Copy, Default)]
pub struct MachInfo {
    pub exception_type: i32,
    pub code: i64,
    pub subcode: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct SignalInfo {
    pub signum: i32,
    pub sigcode: i32,
    /// The `ucontext_t` of the handler invocation, null outside signal handlers.
    pub user_context: *const libc::c_void,
}

impl Default for SignalInfo {
    fn default() -> Self {
        Self {
            signum: 0,
            sigcode: 0,
            user_context: std::ptr::null(),
        }
    }
}

/// An exception raised by a hosting runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeExceptionInfo<'a> {
    pub name: Option<&'a str>,
    /// Encoded JSON, spliced into the report as is.
    pub user_info: Option<&'a [u8]>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UserExceptionInfo<'a> {
    pub name: Option<&'a str>,
    pub language: Option<&'a str>,
    pub line_of_code: Option<&'a str>,
    /// Encoded JSON array describing the stack in the reporting language.
    pub custom_stack_trace: Option<&'a [u8]>,
}

/// Everything known about one event. Built on the stack of the thread that observed the fault,
/// filled in by the monitors and consumed by the report writer.
pub struct MonitorContext<'a> {
    pub event_id: FixedStr<{ EVENT_ID_LEN + 1 }>,
    pub crash_type: MonitorType,
    pub is_async_safe: bool,
    /// Whether the process must not continue once the report is written.
    pub is_fatal: bool,
    pub crashed_during_crash_handling: bool,
    pub registers_are_valid: bool,
    pub offending_machine_context: Option<&'a MachineContext>,
    pub stack_cursor: Option<StackCursor<'a>>,
    pub fault_address: usize,
    pub exception_name: Option<&'a str>,
    pub crash_reason: Option<&'a str>,
    pub mach: MachInfo,
    pub signal: SignalInfo,
    pub runtime_exception: RuntimeExceptionInfo<'a>,
    pub user_exception: UserExceptionInfo<'a>,
    pub system: Option<&'a SystemInfo>,
    pub app_state: Option<AppStateSnapshot>,
    pub zombie_exception: Option<DeallocatedException>,
}

impl<'a> MonitorContext<'a> {
    /// A fatal, async-safe event of the given type with a fresh event id.
    pub fn new(crash_type: MonitorType) -> Self {
        let mut event_id = FixedStr::new();
        let mut buf = uuid::Uuid::encode_buffer();
        event_id.push_str(uuid::Uuid::new_v4().hyphenated().encode_upper(&mut buf));
        Self {
            event_id,
            crash_type,
            is_async_safe: true,
            is_fatal: true,
            crashed_during_crash_handling: false,
            registers_are_valid: false,
            offending_machine_context: None,
            stack_cursor: None,
            fault_address: 0,
            exception_name: None,
            crash_reason: None,
            mach: MachInfo::default(),
            signal: SignalInfo::default(),
            runtime_exception: RuntimeExceptionInfo::default(),
            user_exception: UserExceptionInfo::default(),
            system: None,
            app_state: None,
            zombie_exception: None,
        }
    }

    pub fn event_id(&self) -> &str {
        self.event_id.as_str()
    }
}

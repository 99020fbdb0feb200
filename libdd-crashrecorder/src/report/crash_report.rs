// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Serialises one event into a report file. Runs on the thread that observed the fault, so
//! everything here writes through fixed buffers and raw descriptors.

use super::writer::{close_fd, FdSink, ReportWriter};
use crate::cached_data::ThreadSnapshot;
use crate::machine_context::{CpuRegisters, MachineContext, NativeRegisters, ThreadHandle};
use crate::memory::copy_safely;
use crate::monitor::context::MonitorContext;
use crate::monitor::signal_names::{signal_name, sigcode_name};
use crate::monitor::system::memory_stats;
use crate::monitor::MonitorType;
use crate::shared::constants::{
    MAX_PATH_LEN, MAX_STACK_DEPTH, REPORT_TYPE_MINIMAL, REPORT_TYPE_STANDARD, REPORT_VERSION,
    STACK_CONTENTS_POPPED_DISTANCE, STACK_CONTENTS_PUSHED_DISTANCE,
};
use crate::shared::fixed_str::FixedStr;
use crate::shared::log::crash_log;
use crate::stack_cursor::StackCursor;
use crate::symbolicator::Symbolicator;
use std::ffi::CStr;
use std::mem::size_of;
use std::os::fd::RawFd;

/// Adds custom fields to the `user` section of a report while a crash is being written.
pub type CrashNotifyCallback = fn(&mut ReportWriter<'_>);

const STACK_DUMP_WORDS: usize = STACK_CONTENTS_PUSHED_DISTANCE + STACK_CONTENTS_POPPED_DISTANCE;

/// What the report needs besides the event itself.
pub(crate) struct ReportInputs<'a> {
    pub process_name: &'a str,
    pub symbolicator: &'a Symbolicator,
    pub threads: Option<&'a ThreadSnapshot>,
    pub console_log_path: Option<&'a CStr>,
    pub user_info_json: Option<&'a str>,
    pub on_crash_notify: Option<CrashNotifyCallback>,
    pub pretty_print: bool,
}

fn create_report_file(path: &CStr) -> Option<RawFd> {
    // SAFETY: NUL terminated path, plain flags.
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
            0o644,
        )
    };
    if fd < 0 {
        crash_log!(Error, "could not open {:?}: errno {}", path, errno::errno().0);
        return None;
    }
    Some(fd)
}

pub(crate) fn write_standard_report(
    context: &MonitorContext<'_>,
    path: &CStr,
    inputs: &ReportInputs<'_>,
) {
    crash_log!(Info, "writing crash report to {:?}", path);
    let Some(fd) = create_report_file(path) else {
        return;
    };
    let mut sink = FdSink::new(fd);
    {
        let mut writer = ReportWriter::new(&mut sink, inputs.pretty_print);
        writer.begin_object(Some("report"));
        write_report_info(&mut writer, Some("report"), REPORT_TYPE_STANDARD, context, inputs);
        writer.flush();

        write_binary_images(&mut writer, Some("binary_images"), inputs.symbolicator);
        writer.flush();

        write_process_state(&mut writer, Some("process"), context);
        writer.flush();

        write_system_info(&mut writer, Some("system"), context);
        writer.flush();

        writer.begin_object(Some("crash"));
        {
            write_error(&mut writer, Some("error"), context);
            writer.flush();
            write_all_threads(&mut writer, Some("threads"), context, inputs);
            writer.flush();
        }
        writer.end_container();

        match inputs.user_info_json {
            // Left open for the callback's fields.
            Some(json) => writer.add_json(Some("user"), json.as_bytes(), false),
            None => writer.begin_object(Some("user")),
        }
        if let Some(callback) = inputs.on_crash_notify {
            if context.crash_type != MonitorType::USER_REPORTED {
                writer.flush();
                callback(&mut writer);
            }
        }
        writer.end_container();
        writer.flush();

        writer.begin_object(Some("debug"));
        if let Some(console_log) = inputs.console_log_path {
            writer.add_text_file_lines(Some("console_log"), console_log);
        }
        writer.end_container();

        writer.end();
        writer.flush();
    }
    close_fd(fd);
}

/// Rewrites the report at `path` so that it embeds whatever the interrupted writer managed to
/// produce, followed by a minimal description of the fault that interrupted it.
pub(crate) fn write_recrash_report(
    context: &MonitorContext<'_>,
    path: &CStr,
    inputs: &ReportInputs<'_>,
) {
    let mut old_path = FixedStr::<MAX_PATH_LEN>::new();
    let bytes = path.to_bytes();
    old_path.push_bytes(bytes.strip_suffix(b".json").unwrap_or(bytes));
    old_path.push_str(".old");
    let Some(old_path) = old_path.as_c_str() else {
        return;
    };
    crash_log!(Info, "writing recrash report to {:?}", path);

    // SAFETY: both paths are NUL terminated.
    if unsafe { libc::rename(path.as_ptr(), old_path.as_ptr()) } < 0 {
        crash_log!(Error, "could not rename {:?}: errno {}", path, errno::errno().0);
    }
    let Some(fd) = create_report_file(path) else {
        return;
    };
    let mut sink = FdSink::new(fd);
    {
        let mut writer = ReportWriter::new(&mut sink, inputs.pretty_print);
        writer.begin_object(Some("report"));
        writer.add_json_file(Some("recrash_report"), old_path, true);
        writer.flush();
        // SAFETY: NUL terminated path.
        if unsafe { libc::unlink(old_path.as_ptr()) } < 0 {
            crash_log!(Error, "could not remove {:?}: errno {}", old_path, errno::errno().0);
        }
        write_report_info(&mut writer, Some("report"), REPORT_TYPE_MINIMAL, context, inputs);
        writer.flush();

        writer.begin_object(Some("crash"));
        {
            write_error(&mut writer, Some("error"), context);
            writer.flush();
            if let Some(machine) = context.offending_machine_context {
                let index = machine.index_of_thread(machine.thread()).unwrap_or(0);
                write_thread(
                    &mut writer,
                    Some("crashed_thread"),
                    context,
                    machine,
                    index,
                    inputs,
                );
            }
            writer.flush();
        }
        writer.end_container();
        writer.end();
        writer.flush();
    }
    close_fd(fd);
}

fn write_report_info(
    writer: &mut ReportWriter<'_>,
    key: Option<&str>,
    report_type: &str,
    context: &MonitorContext<'_>,
    inputs: &ReportInputs<'_>,
) {
    writer.begin_object(key);
    writer.add_string(Some("version"), Some(REPORT_VERSION));
    writer.add_string(Some("id"), Some(context.event_id()));
    writer.add_string(Some("process_name"), Some(inputs.process_name));
    // SAFETY: time(2) accepts a null out pointer.
    writer.add_integer(Some("timestamp"), unsafe { libc::time(std::ptr::null_mut()) } as i64);
    writer.add_string(Some("type"), Some(report_type));
    writer.end_container();
}

fn write_binary_images(writer: &mut ReportWriter<'_>, key: Option<&str>, symbolicator: &Symbolicator) {
    writer.begin_array(key);
    symbolicator.for_each_image_summary(|image| {
        writer.begin_object(None);
        writer.add_uinteger(Some("image_addr"), image.address as u64);
        writer.add_uinteger(Some("image_vmaddr"), image.vm_address as u64);
        writer.add_uinteger(Some("image_size"), image.size as u64);
        writer.add_string(Some("name"), Some(image.name.as_str()));
        if !image.build_id().is_empty() {
            writer.add_data(Some("build_id"), image.build_id());
        }
        writer.add_string(Some("cpu_arch"), Some(NativeRegisters::ARCH));
        writer.end_container();
        true
    });
    writer.end_container();
}

fn write_process_state(writer: &mut ReportWriter<'_>, key: Option<&str>, context: &MonitorContext<'_>) {
    writer.begin_object(key);
    if let Some(zombie) = context.zombie_exception.as_ref().filter(|z| z.address != 0) {
        writer.begin_object(Some("last_dealloced_nsexception"));
        writer.add_uinteger(Some("address"), zombie.address as u64);
        writer.add_string(Some("name"), Some(zombie.name.as_str()));
        writer.add_string(Some("reason"), Some(zombie.reason.as_str()));
        writer.end_container();
    }
    writer.end_container();
}

fn write_system_info(writer: &mut ReportWriter<'_>, key: Option<&str>, context: &MonitorContext<'_>) {
    writer.begin_object(key);
    if let Some(system) = context.system {
        writer.add_string(Some("system_name"), Some(system.system_name.as_str()));
        writer.add_string(Some("system_version"), Some(system.system_version.as_str()));
        writer.add_string(Some("machine"), Some(system.machine.as_str()));
        writer.add_string(Some("kernel_version"), Some(system.kernel_version.as_str()));
        writer.add_string(Some("os_version"), Some(system.os_version.as_str()));
        writer.add_string(Some("architecture"), Some(system.architecture.as_str()));
        writer.add_string(Some("bitness"), Some(system.bitness.as_str()));
        if let Some(boot_time) = system.boot_time {
            writer.add_integer(Some("boot_time"), boot_time);
        }
        writer.add_integer(Some("app_start_time"), system.app_start_time);
        writer.add_string(Some("executable_path"), system.executable_path.as_deref());
        writer.add_string(Some("app_name"), Some(system.app_name.as_str()));
        writer.add_string(Some("cpu_arch"), Some(system.cpu_arch));
        writer.add_string(Some("time_zone"), Some(system.time_zone.as_str()));
        writer.add_string(Some("process_name"), system.process_name.as_deref());
        writer.add_uinteger(Some("process_id"), system.process_id.into());
        writer.add_uinteger(Some("parent_process_id"), system.parent_process_id.into());
        writer.add_string(Some("build_type"), Some(system.build_type));
        writer.add_uinteger(Some("page_size"), system.page_size as u64);

        writer.begin_object(Some("memory"));
        let stats = memory_stats();
        writer.add_uinteger(Some("size"), stats.map_or(system.memory_size, |s| s.size));
        if let Some(stats) = stats {
            writer.add_uinteger(Some("usable"), stats.usable);
            writer.add_uinteger(Some("free"), stats.free);
        }
        writer.end_container();
    }
    if let Some(app) = &context.app_state {
        writer.begin_object(Some("application_stats"));
        writer.add_boolean(Some("application_active"), app.application_active);
        writer.add_boolean(Some("application_in_foreground"), app.application_in_foreground);
        writer.add_integer(Some("launches_since_last_crash"), app.launches_since_last_crash);
        writer.add_integer(Some("sessions_since_last_crash"), app.sessions_since_last_crash);
        writer.add_float(Some("active_time_since_last_crash"), app.active_duration_since_last_crash);
        writer.add_float(
            Some("background_time_since_last_crash"),
            app.background_duration_since_last_crash,
        );
        writer.add_integer(Some("sessions_since_launch"), app.sessions_since_launch);
        writer.add_float(Some("active_time_since_launch"), app.active_duration_since_launch);
        writer.add_float(
            Some("background_time_since_launch"),
            app.background_duration_since_launch,
        );
        writer.end_container();
    }
    writer.end_container();
}

fn error_type(crash_type: MonitorType) -> Option<&'static str> {
    let name = match crash_type {
        MonitorType::MAIN_THREAD_DEADLOCK => "deadlock",
        MonitorType::MACH_EXCEPTION => "mach",
        MonitorType::CPP_EXCEPTION => "cpp_exception",
        MonitorType::NS_EXCEPTION => "nsexception",
        MonitorType::SIGNAL => "signal",
        MonitorType::USER_REPORTED => "user",
        _ => return None,
    };
    Some(name)
}

fn write_error(writer: &mut ReportWriter<'_>, key: Option<&str>, context: &MonitorContext<'_>) {
    writer.begin_object(key);
    if context.crash_type == MonitorType::MACH_EXCEPTION {
        writer.begin_object(Some("mach"));
        writer.add_integer(Some("exception"), context.mach.exception_type.into());
        writer.add_integer(Some("code"), context.mach.code);
        writer.add_integer(Some("subcode"), context.mach.subcode);
        writer.end_container();
    }
    if context.signal.signum != 0 {
        let signal = &context.signal;
        writer.begin_object(Some("signal"));
        writer.add_integer(Some("signal"), signal.signum.into());
        if let Some(name) = signal_name(signal.signum) {
            writer.add_string(Some("name"), Some(name));
        }
        writer.add_integer(Some("code"), signal.sigcode.into());
        if let Some(code_name) = sigcode_name(signal.signum, signal.sigcode) {
            writer.add_string(Some("code_name"), Some(code_name));
        }
        writer.end_container();
    }
    writer.add_uinteger(Some("address"), context.fault_address as u64);
    if let Some(reason) = context.crash_reason {
        writer.add_string(Some("reason"), Some(reason));
    }

    match error_type(context.crash_type) {
        Some(error_type) => writer.add_string(Some("type"), Some(error_type)),
        None => crash_log!(
            Error,
            "monitor type {:#x} shouldn't be able to cause events",
            context.crash_type.bits()
        ),
    }
    match context.crash_type {
        MonitorType::CPP_EXCEPTION => {
            writer.begin_object(Some("cpp_exception"));
            writer.add_string(Some("name"), context.exception_name);
            writer.end_container();
        }
        MonitorType::NS_EXCEPTION => {
            let exception = &context.runtime_exception;
            writer.begin_object(Some("nsexception"));
            writer.add_string(Some("name"), exception.name);
            if let Some(user_info) = exception.user_info {
                writer.add_json(Some("userInfo"), user_info, true);
            }
            writer.end_container();
        }
        MonitorType::USER_REPORTED => {
            let exception = &context.user_exception;
            writer.begin_object(Some("user_reported"));
            writer.add_string(Some("name"), exception.name);
            if let Some(language) = exception.language {
                writer.add_string(Some("language"), Some(language));
            }
            if let Some(line_of_code) = exception.line_of_code {
                writer.add_string(Some("line_of_code"), Some(line_of_code));
            }
            if let Some(stack_trace) = exception.custom_stack_trace {
                writer.add_json(Some("backtrace"), stack_trace, true);
            }
            writer.end_container();
        }
        _ => {}
    }
    writer.end_container();
}

fn write_all_threads(
    writer: &mut ReportWriter<'_>,
    key: Option<&str>,
    context: &MonitorContext<'_>,
    inputs: &ReportInputs<'_>,
) {
    let Some(machine) = context.offending_machine_context else {
        writer.begin_array(key);
        writer.end_container();
        return;
    };
    writer.begin_array(key);
    if machine.thread_count() == 0 {
        write_thread(writer, None, context, machine, 0, inputs);
    }
    for index in 0..machine.thread_count() {
        let Some(thread) = machine.thread_at(index) else {
            continue;
        };
        if thread == machine.thread() {
            write_thread(writer, None, context, machine, index, inputs);
        } else {
            let other = MachineContext::capture_thread(thread, false);
            write_thread(writer, None, context, &other, index, inputs);
        }
    }
    writer.end_container();
}

fn write_thread(
    writer: &mut ReportWriter<'_>,
    key: Option<&str>,
    context: &MonitorContext<'_>,
    machine: &MachineContext,
    index: usize,
    inputs: &ReportInputs<'_>,
) {
    let thread = machine.thread();
    let is_crashed_thread = context
        .offending_machine_context
        .is_some_and(|offending| offending.thread() == thread);
    let mut cursor = if is_crashed_thread {
        context.stack_cursor.clone()
    } else if machine.can_have_cpu_state() {
        let mut cursor = StackCursor::with_machine_context(machine, MAX_STACK_DEPTH);
        cursor.set_symbolicator(inputs.symbolicator);
        Some(cursor)
    } else {
        None
    };

    writer.begin_object(key);
    let mut gave_up = false;
    if let Some(cursor) = cursor.as_mut() {
        cursor.reset();
        write_backtrace(writer, Some("backtrace"), cursor);
        gave_up = cursor.has_given_up();
    }
    if machine.can_have_cpu_state() {
        write_registers(writer, Some("registers"), machine);
    }
    writer.add_integer(Some("index"), index as i64);
    if let Some(threads) = inputs.threads {
        if let Some(name) = threads.thread_name(thread) {
            writer.add_string(Some("name"), Some(name));
        }
        if let Some(queue) = threads.queue_name(thread) {
            writer.add_string(Some("dispatch_queue"), Some(queue));
        }
    }
    writer.add_boolean(Some("crashed"), is_crashed_thread);
    writer.add_boolean(Some("current_thread"), thread == ThreadHandle::current());
    if is_crashed_thread && machine.can_have_cpu_state() {
        write_stack_contents(writer, Some("stack"), machine, gave_up || machine.is_stack_overflow());
    }
    writer.end_container();
}

fn write_backtrace(writer: &mut ReportWriter<'_>, key: Option<&str>, cursor: &mut StackCursor<'_>) {
    writer.begin_object(key);
    writer.begin_array(Some("contents"));
    while cursor.advance() {
        writer.begin_object(None);
        if cursor.symbolicate() {
            let symbol = &cursor.entry().symbol;
            if !symbol.image_name.is_empty() {
                let image_name = symbol.image_name.as_str();
                let file_name = image_name.rsplit('/').next().unwrap_or(image_name);
                writer.add_string(Some("object_name"), Some(file_name));
            }
            writer.add_uinteger(Some("object_addr"), symbol.image_address as u64);
            if !symbol.symbol_name.is_empty() {
                writer.add_string(Some("symbol_name"), Some(symbol.symbol_name.as_str()));
            }
            writer.add_uinteger(Some("symbol_addr"), symbol.symbol_address as u64);
        }
        writer.add_uinteger(Some("instruction_addr"), cursor.address() as u64);
        writer.end_container();
    }
    writer.end_container();
    writer.add_integer(Some("skipped"), cursor.skipped_entries() as i64);
    if cursor.has_given_up() {
        writer.add_boolean(Some("incomplete"), true);
    }
    writer.end_container();
}

fn write_registers(writer: &mut ReportWriter<'_>, key: Option<&str>, machine: &MachineContext) {
    writer.begin_object(key);
    writer.begin_object(Some("basic"));
    for index in 0..machine.register_count() {
        if let Some(name) = machine.register_name(index) {
            writer.add_uinteger(Some(name), machine.register_value(index));
        }
    }
    writer.end_container();
    if machine.exception_register_count() > 0 {
        writer.begin_object(Some("exception"));
        for index in 0..machine.exception_register_count() {
            if let Some(name) = machine.exception_register_name(index) {
                writer.add_uinteger(Some(name), machine.exception_register_value(index));
            }
        }
        writer.end_container();
    }
    writer.end_container();
}

fn write_stack_contents(
    writer: &mut ReportWriter<'_>,
    key: Option<&str>,
    machine: &MachineContext,
    is_stack_overflow: bool,
) {
    let sp = machine.stack_pointer();
    if sp == 0 {
        return;
    }
    let word = size_of::<usize>();
    let (low, high) = if machine.stack_grow_direction() < 0 {
        (
            sp.saturating_sub(STACK_CONTENTS_PUSHED_DISTANCE * word),
            sp.saturating_add(STACK_CONTENTS_POPPED_DISTANCE * word),
        )
    } else {
        (
            sp.saturating_sub(STACK_CONTENTS_POPPED_DISTANCE * word),
            sp.saturating_add(STACK_CONTENTS_PUSHED_DISTANCE * word),
        )
    };
    writer.begin_object(key);
    writer.add_string(
        Some("grow_direction"),
        Some(if machine.stack_grow_direction() > 0 { "+" } else { "-" }),
    );
    writer.add_uinteger(Some("dump_start"), low as u64);
    writer.add_uinteger(Some("dump_end"), high as u64);
    writer.add_uinteger(Some("stack_pointer"), sp as u64);
    writer.add_boolean(Some("overflow"), is_stack_overflow);
    let mut buffer = [0u8; STACK_DUMP_WORDS * size_of::<usize>()];
    let len = (high - low).min(buffer.len());
    if copy_safely(low, &mut buffer[..len]) {
        writer.add_data(Some("contents"), &buffer[..len]);
    } else {
        writer.add_string(Some("error"), Some("Stack contents not accessible"));
    }
    writer.end_container();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::context::UserExceptionInfo;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    fn c_path(path: &std::path::Path) -> CString {
        CString::new(path.as_os_str().as_bytes()).unwrap()
    }

    fn inputs<'a>(symbolicator: &'a Symbolicator) -> ReportInputs<'a> {
        ReportInputs {
            process_name: "tests",
            symbolicator,
            threads: None,
            console_log_path: None,
            user_info_json: Some(r#"{"tenant":"blue"}"#),
            on_crash_notify: None,
            pretty_print: false,
        }
    }

    fn read_json(path: &std::path::Path) -> serde_json::Value {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn standard_report_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let symbolicator = Symbolicator::empty();
        let addresses = [0x1000usize, 0x2000, 0x3000];
        let machine = MachineContext::capture_thread(ThreadHandle::current(), true);

        let mut context = MonitorContext::new(MonitorType::USER_REPORTED);
        context.is_fatal = false;
        context.offending_machine_context = Some(&machine);
        context.stack_cursor = Some(StackCursor::with_backtrace(&addresses, 0));
        context.crash_reason = Some("went wrong");
        context.user_exception = UserExceptionInfo {
            name: Some("MyError"),
            language: Some("lua"),
            line_of_code: Some("42"),
            custom_stack_trace: Some(br#"[{"fn":"main"}]"#),
        };
        write_standard_report(&context, &c_path(&path), &inputs(&symbolicator));

        let report = read_json(&path);
        assert_eq!(report["report"]["type"], "standard");
        assert_eq!(report["report"]["id"], context.event_id());
        assert!(report["report"]["timestamp"].as_i64().unwrap() > 0);
        assert!(report["binary_images"].as_array().unwrap().is_empty());
        let error = &report["crash"]["error"];
        assert_eq!(error["type"], "user");
        assert_eq!(error["reason"], "went wrong");
        assert_eq!(error["user_reported"]["name"], "MyError");
        assert_eq!(error["user_reported"]["backtrace"][0]["fn"], "main");

        let threads = report["crash"]["threads"].as_array().unwrap();
        let crashed: Vec<_> = threads.iter().filter(|t| t["crashed"] == true).collect();
        assert_eq!(crashed.len(), 1);
        let contents = crashed[0]["backtrace"]["contents"].as_array().unwrap();
        let ips: Vec<_> = contents
            .iter()
            .map(|f| f["instruction_addr"].as_u64().unwrap())
            .collect();
        assert_eq!(ips, [0x1000, 0x2000, 0x3000]);
        assert_eq!(report["user"]["tenant"], "blue");
        assert!(report["debug"].is_object());
    }

    #[cfg(all(
        any(target_os = "linux", target_os = "android"),
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn sibling_threads_carry_registers_and_backtraces() {
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let worker = std::thread::spawn(move || {
            tx.send(ThreadHandle::current()).unwrap();
            done_rx.recv().unwrap();
        });
        let parked = rx.recv().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let symbolicator = Symbolicator::empty();
        let machine = MachineContext::capture_thread(ThreadHandle::current(), true);
        let mut context = MonitorContext::new(MonitorType::USER_REPORTED);
        context.is_fatal = false;
        context.offending_machine_context = Some(&machine);
        write_standard_report(&context, &c_path(&path), &inputs(&symbolicator));
        done_tx.send(()).unwrap();
        worker.join().unwrap();

        let report = read_json(&path);
        let index = machine.index_of_thread(parked).unwrap();
        let sibling = &report["crash"]["threads"][index];
        assert_eq!(sibling["index"], index as i64);
        assert_eq!(sibling["crashed"], false);
        assert!(sibling["registers"]["basic"].is_object(), "{sibling}");
        let contents = sibling["backtrace"]["contents"].as_array().unwrap();
        assert!(!contents.is_empty());
        assert!(sibling.get("stack").is_none());
    }

    fn add_marker(writer: &mut ReportWriter<'_>) {
        writer.add_string(Some("marker"), Some("from callback"));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn callback_fields_land_in_user_section_for_crashes_only() {
        let dir = tempfile::tempdir().unwrap();
        let symbolicator = Symbolicator::empty();
        let mut inputs = inputs(&symbolicator);
        inputs.on_crash_notify = Some(add_marker);

        let path = dir.path().join("crash.json");
        let mut context = MonitorContext::new(MonitorType::CPP_EXCEPTION);
        context.exception_name = Some("panic");
        write_standard_report(&context, &c_path(&path), &inputs);
        let report = read_json(&path);
        assert_eq!(report["user"]["marker"], "from callback");
        assert_eq!(report["user"]["tenant"], "blue");
        assert_eq!(report["crash"]["error"]["cpp_exception"]["name"], "panic");

        let path = dir.path().join("user.json");
        let context = MonitorContext::new(MonitorType::USER_REPORTED);
        write_standard_report(&context, &c_path(&path), &inputs);
        let report = read_json(&path);
        assert!(report["user"].get("marker").is_none());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn recrash_embeds_truncated_previous_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app-report-0000000000000001.json");
        std::fs::write(&path, br#"{"report":{"id":"first","timestamp":5},"crash":{"threads":[{"index":0"#)
            .unwrap();
        let symbolicator = Symbolicator::empty();
        let machine = MachineContext::capture_thread(ThreadHandle::current(), true);
        let mut context = MonitorContext::new(MonitorType::SIGNAL);
        context.signal.signum = libc::SIGSEGV;
        context.offending_machine_context = Some(&machine);
        write_recrash_report(&context, &c_path(&path), &inputs(&symbolicator));

        let report = read_json(&path);
        assert_eq!(report["recrash_report"]["report"]["id"], "first");
        assert_eq!(report["recrash_report"]["crash"]["threads"][0]["index"], 0);
        assert_eq!(report["report"]["type"], "minimal");
        assert_eq!(report["crash"]["error"]["signal"]["name"], "SIGSEGV");
        assert_eq!(report["crash"]["crashed_thread"]["crashed"], true);
        assert!(!dir.path().join("app-report-0000000000000001.old").exists());
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The process-facing entry points.
//!
//! A [`CrashRecorder`] owns every monitor, the thread cache, the symbolicator and the report
//! store. The OS hooks (signal handlers, the panic hook, the watchdog) find it through a single
//! process-wide pointer set by [`CrashRecorder::install`].

use crate::cached_data::{CachedData, ThreadSnapshot};
use crate::machine_context::sampler;
use crate::monitor::context::MonitorContext;
use crate::monitor::ns_exception::UncaughtException;
use crate::monitor::user::UserException;
use crate::monitor::{MonitorRegistry, MonitorType};
use crate::report::crash_report::{
    write_recrash_report, write_standard_report, CrashNotifyCallback, ReportInputs,
};
use crate::report::fixer::fixup;
use crate::report::json::validate;
use crate::shared::configuration::CrashRecorderConfiguration;
use crate::shared::constants::MAX_PATH_LEN;
use crate::shared::fixed_str::FixedStr;
use crate::shared::log::crash_log;
use crate::store::ReportStore;
use crate::symbolicator::Symbolicator;
use anyhow::Context;
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicPtr, AtomicU64};

// Signal handlers cannot take locks, so the installed recorder is published through a pointer.
static INSTALLED: AtomicPtr<CrashRecorder> = AtomicPtr::new(ptr::null_mut());

const NO_REPORT: u64 = u64::MAX;

pub struct CrashRecorder {
    config: CrashRecorderConfiguration,
    store: ReportStore,
    registry: MonitorRegistry,
    cached_data: CachedData,
    symbolicator: Symbolicator,
    process_name: String,
    console_log_path: Option<CString>,
    // Replaced values are leaked: a crash may be reading the old one.
    user_info_json: AtomicPtr<String>,
    on_crash_notify: AtomicPtr<CrashNotifyCallback>,
    last_report_id: AtomicU64,
}

fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(|name| name.to_string_lossy().into_owned()))
        .or_else(|| std::env::args().next())
        .unwrap_or_default()
}

impl CrashRecorder {
    /// Builds a recorder without publishing it to the OS hooks. Nothing is monitored until
    /// [`CrashRecorder::set_monitoring`] is called.
    pub fn new(config: CrashRecorderConfiguration) -> anyhow::Result<Self> {
        let store = ReportStore::initialize(
            config.app_name(),
            config.reports_path(),
            config.max_report_count(),
        )
        .context("opening the report store")?;
        let console_log_path = config
            .console_log_path()
            .map(|path| CString::new(path.as_os_str().as_bytes()))
            .transpose()
            .context("console log path contains a NUL byte")?;
        let recorder = Self {
            registry: MonitorRegistry::new(&config),
            store,
            cached_data: CachedData::new(),
            symbolicator: Symbolicator::for_current_process(),
            process_name: process_name(),
            console_log_path,
            user_info_json: AtomicPtr::new(ptr::null_mut()),
            on_crash_notify: AtomicPtr::new(ptr::null_mut()),
            last_report_id: AtomicU64::new(NO_REPORT),
            config,
        };
        recorder.set_user_info_json(recorder.config.user_info_json().map(str::to_owned))?;
        Ok(recorder)
    }

    /// Creates the process-wide recorder, starts the thread cache and enables the configured
    /// monitors.
    ///
    /// PRECONDITIONS:
    ///     No recorder was installed before in this process.
    /// ATOMICITY:
    ///     The recorder is published with a compare-exchange on an atomic pointer and is never
    ///     freed afterwards.
    pub fn install(config: CrashRecorderConfiguration) -> anyhow::Result<&'static Self> {
        anyhow::ensure!(
            Self::installed().is_none(),
            "A crash recorder is already installed"
        );
        let recorder = Box::into_raw(Box::new(Self::new(config)?));
        if INSTALLED
            .compare_exchange(ptr::null_mut(), recorder, SeqCst, SeqCst)
            .is_err()
        {
            // SAFETY: never published, so this is the only reference.
            drop(unsafe { Box::from_raw(recorder) });
            anyhow::bail!("A crash recorder is already installed");
        }
        // SAFETY: published pointers are leaked and stay valid for the process lifetime.
        let recorder: &'static Self = unsafe { &*recorder };
        recorder
            .cached_data
            .start(recorder.config.cached_data_interval())
            .context("starting the thread cache")?;
        if !sampler::prepare() {
            tracing::debug!("Sibling thread registers will not be captured");
        }
        let active = recorder.set_monitoring(recorder.config.monitors());
        tracing::info!(?active, app = recorder.config.app_name(), "Crash recorder installed");
        Ok(recorder)
    }

    /// The recorder set up by [`CrashRecorder::install`]. Async-signal-safe.
    pub fn installed() -> Option<&'static Self> {
        // SAFETY: see `install`.
        unsafe { INSTALLED.load(SeqCst).as_ref() }
    }

    /// Changes the monitored fault sources. Returns the ones actually enabled.
    pub fn set_monitoring(&self, monitors: MonitorType) -> MonitorType {
        self.registry.set_active_monitors(monitors)
    }

    pub fn active_monitors(&self) -> MonitorType {
        self.registry.active_monitors()
    }

    pub fn config(&self) -> &CrashRecorderConfiguration {
        &self.config
    }

    /// JSON object copied into the `user` section of every report.
    ///
    /// ATOMICITY:
    ///     The previous value is leaked, since a crash on another thread may still read it.
    pub fn set_user_info_json(&self, json: Option<String>) -> anyhow::Result<()> {
        if let Some(json) = &json {
            validate(json.as_bytes()).context("user info is not valid JSON")?;
        }
        let new = json.map_or(ptr::null_mut(), |json| Box::into_raw(Box::new(json)));
        self.user_info_json.swap(new, SeqCst);
        Ok(())
    }

    /// Registers a function that adds fields to the `user` section while a crash report is
    /// written. It runs in crash context and must be async-signal-safe.
    pub fn set_crash_notify(&self, callback: Option<CrashNotifyCallback>) {
        let new = callback.map_or(ptr::null_mut(), |callback| Box::into_raw(Box::new(callback)));
        self.on_crash_notify.swap(new, SeqCst);
    }

    /// Writes a report for an exception raised by the embedding code. The process is aborted
    /// afterwards if `exception.terminate_program` is set.
    pub fn report_user_exception(&self, exception: &UserException<'_>) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.registry.user_reported().report(self, exception),
            "User reported exceptions are not monitored"
        );
        if exception.terminate_program {
            std::process::abort();
        }
        Ok(())
    }

    /// Writes a report for an exception a hosting runtime could not handle, without
    /// terminating. Every monitor is disabled afterwards.
    pub fn record_uncaught_exception(&self, exception: &UncaughtException<'_>) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.registry.ns_exception().report(self, exception),
            "Uncaught runtime exceptions are not monitored"
        );
        Ok(())
    }

    /// Like [`CrashRecorder::record_uncaught_exception`], then aborts.
    pub fn report_uncaught_exception(&self, exception: &UncaughtException<'_>) -> ! {
        if let Err(e) = self.record_uncaught_exception(exception) {
            tracing::warn!("No report written: {e:#}");
        }
        std::process::abort()
    }

    pub fn notify_app_active(&self, is_active: bool) {
        self.registry.app_state().notify_app_active(is_active);
    }

    pub fn notify_app_in_foreground(&self, in_foreground: bool) {
        self.registry.app_state().notify_app_in_foreground(in_foreground);
    }

    pub fn notify_app_terminate(&self) {
        self.registry.app_state().notify_app_terminate();
    }

    /// Proof of life from the thread watched for deadlocks.
    pub fn heartbeat(&self) {
        self.registry.deadlock().heartbeat();
    }

    pub fn record_deallocation(&self, address: usize, type_name: &'static CStr) {
        self.registry.zombie().record_deallocation(address, type_name);
    }

    pub fn record_deallocated_exception(&self, address: usize, name: &str, reason: &str) {
        self.registry
            .zombie()
            .record_deallocated_exception(address, name, reason);
    }

    pub fn store(&self) -> &ReportStore {
        &self.store
    }

    /// Id of the last report written by this process.
    pub fn last_report_id(&self) -> Option<u64> {
        Some(self.last_report_id.load(SeqCst)).filter(|&id| id != NO_REPORT)
    }

    /// The stored report with its deferred fields filled in.
    pub fn read_fixed_report(&self, id: u64) -> anyhow::Result<Option<Vec<u8>>> {
        let Some(raw) = self.store.read(id)? else {
            return Ok(None);
        };
        let fixed = fixup(&raw).with_context(|| format!("fixing report {id:016x}"))?;
        Ok(Some(fixed))
    }

    pub(crate) fn registry(&self) -> &MonitorRegistry {
        &self.registry
    }

    /// Crash path shared by every monitor.
    pub(crate) fn handle_exception<'a>(&'a self, context: &mut MonitorContext<'a>) {
        if let Some(cursor) = context.stack_cursor.as_mut() {
            cursor.set_symbolicator(&self.symbolicator);
        }
        self.registry.handle_exception(
            context,
            &self.cached_data,
            &mut |context, threads| self.write_report(context, threads),
        );
    }

    fn write_report(&self, context: &MonitorContext<'_>, threads: Option<&ThreadSnapshot>) {
        // Caught panics and user reports leave the process running.
        if context.is_fatal {
            self.registry.app_state().notify_app_crash();
        }
        // SAFETY: values behind these pointers are leaked, never freed.
        let user_info_json = unsafe { self.user_info_json.load(SeqCst).as_ref() };
        let on_crash_notify = unsafe { self.on_crash_notify.load(SeqCst).as_ref() };
        let inputs = ReportInputs {
            process_name: &self.process_name,
            symbolicator: &self.symbolicator,
            threads,
            console_log_path: self.console_log_path.as_deref(),
            user_info_json: user_info_json.map(String::as_str),
            on_crash_notify: on_crash_notify.copied(),
            pretty_print: self.config.pretty_print(),
        };

        let mut path = FixedStr::<MAX_PATH_LEN>::new();
        let last_id = self.last_report_id.load(SeqCst);
        if context.crashed_during_crash_handling && last_id != NO_REPORT {
            self.store.path_for_id(last_id, &mut path);
            match path.as_c_str() {
                Some(path) => write_recrash_report(context, path, &inputs),
                None => crash_log!(Error, "invalid report path {:?}", path),
            }
        } else {
            let id = self.store.next_report_path(&mut path);
            self.last_report_id.store(id, SeqCst);
            match path.as_c_str() {
                Some(path) => write_standard_report(context, path, &inputs),
                None => crash_log!(Error, "invalid report path {:?}", path),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine_context::{MachineContext, ThreadHandle};

    fn recorder(dir: &std::path::Path) -> CrashRecorder {
        let mut config = CrashRecorderConfiguration::new("app", dir).unwrap();
        config.set_debugger_attached_override(Some(false));
        CrashRecorder::new(config).unwrap()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn user_info_must_be_json() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path());
        assert!(recorder.set_user_info_json(Some("{\"a\":".into())).is_err());
        recorder.set_user_info_json(Some("{\"a\":1}".into())).unwrap();
        recorder.set_user_info_json(None).unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn disabled_monitors_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path());
        let exception = UserException {
            name: "Nope",
            ..Default::default()
        };
        assert!(recorder.report_user_exception(&exception).is_err());
        assert_eq!(recorder.store().count().unwrap(), 0);
        assert_eq!(recorder.last_report_id(), None);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn nested_event_rewrites_the_last_report() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path());
        recorder.set_monitoring(MonitorType::MANUAL);

        let machine = MachineContext::capture_thread(ThreadHandle::current(), false);
        let mut first = MonitorContext::new(MonitorType::USER_REPORTED);
        first.is_fatal = false;
        first.offending_machine_context = Some(&machine);
        recorder.handle_exception(&mut first);
        let id = recorder.last_report_id().unwrap();

        // Pretend a fault is already being handled.
        recorder.registry().notify_fatal_exception_captured(false);
        let mut second = MonitorContext::new(MonitorType::SIGNAL);
        second.offending_machine_context = Some(&machine);
        recorder.handle_exception(&mut second);

        assert_eq!(recorder.store().list_ids().unwrap(), [id]);
        let report: serde_json::Value =
            serde_json::from_slice(&recorder.store().read(id).unwrap().unwrap()).unwrap();
        assert_eq!(report["recrash_report"]["report"]["id"], first.event_id());
        assert_eq!(report["report"]["id"], second.event_id());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn only_fatal_events_count_as_crashes() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path());
        recorder.set_monitoring(MonitorType::MANUAL);
        let machine = MachineContext::capture_thread(ThreadHandle::current(), false);

        let mut caught_panic = MonitorContext::new(MonitorType::CPP_EXCEPTION);
        caught_panic.is_fatal = false;
        caught_panic.offending_machine_context = Some(&machine);
        caught_panic.crash_reason = Some("caught");
        recorder.handle_exception(&mut caught_panic);
        assert_eq!(recorder.store().count().unwrap(), 1);
        assert!(!recorder.registry().app_state().snapshot().crashed_this_launch);
        assert_eq!(recorder.active_monitors(), MonitorType::MANUAL);

        let mut fault = MonitorContext::new(MonitorType::SIGNAL);
        fault.offending_machine_context = Some(&machine);
        recorder.handle_exception(&mut fault);
        assert_eq!(recorder.store().count().unwrap(), 2);
        assert!(recorder.registry().app_state().snapshot().crashed_this_launch);
    }
}

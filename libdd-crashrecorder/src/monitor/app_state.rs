// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Launch, session and foreground/background accounting persisted across launches.

use super::context::MonitorContext;
use super::{Monitor, MonitorType};
use crate::report::json::{JsonEncoder, JsonError};
use crate::report::writer::{close_fd, FdSink};
use crate::shared::constants::STATE_FORMAT_VERSION;
use crate::shared::log::crash_log;
use anyhow::Context;
use portable_atomic::AtomicF64;
use serde::Deserialize;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicI64};

/// Seconds on the monotonic clock. Async-signal-safe.
fn now_seconds() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}

/// The part of the state that survives a relaunch.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedState {
    version: i64,
    crashed_last_launch: bool,
    active_duration_since_last_crash: f64,
    background_duration_since_last_crash: f64,
    launches_since_last_crash: i64,
    sessions_since_last_crash: i64,
}

/// A copy of the counters taken for one report.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AppStateSnapshot {
    pub application_active: bool,
    pub application_in_foreground: bool,
    pub crashed_last_launch: bool,
    pub crashed_this_launch: bool,
    pub launches_since_last_crash: i64,
    pub sessions_since_last_crash: i64,
    pub active_duration_since_last_crash: f64,
    pub background_duration_since_last_crash: f64,
    pub sessions_since_launch: i64,
    pub active_duration_since_launch: f64,
    pub background_duration_since_launch: f64,
}

#[derive(Default)]
struct Tracker {
    application_active: AtomicBool,
    application_in_foreground: AtomicBool,
    crashed_last_launch: AtomicBool,
    crashed_this_launch: AtomicBool,
    launches_since_last_crash: AtomicI64,
    sessions_since_last_crash: AtomicI64,
    sessions_since_launch: AtomicI64,
    active_duration_since_last_crash: AtomicF64,
    background_duration_since_last_crash: AtomicF64,
    active_duration_since_launch: AtomicF64,
    background_duration_since_launch: AtomicF64,
    transition_time: AtomicF64,
}

impl Tracker {
    fn add_active(&self, duration: f64) {
        self.active_duration_since_launch.fetch_add(duration, SeqCst);
        self.active_duration_since_last_crash.fetch_add(duration, SeqCst);
    }

    fn add_background(&self, duration: f64) {
        self.background_duration_since_launch.fetch_add(duration, SeqCst);
        self.background_duration_since_last_crash.fetch_add(duration, SeqCst);
    }

    /// Accounts the time since the last transition to the current state.
    fn update_durations(&self) {
        let now = now_seconds();
        let elapsed = now - self.transition_time.swap(now, SeqCst);
        if self.application_active.load(SeqCst) {
            self.add_active(elapsed);
        } else if !self.application_in_foreground.load(SeqCst) {
            self.add_background(elapsed);
        }
    }

    fn snapshot(&self) -> AppStateSnapshot {
        AppStateSnapshot {
            application_active: self.application_active.load(SeqCst),
            application_in_foreground: self.application_in_foreground.load(SeqCst),
            crashed_last_launch: self.crashed_last_launch.load(SeqCst),
            crashed_this_launch: self.crashed_this_launch.load(SeqCst),
            launches_since_last_crash: self.launches_since_last_crash.load(SeqCst),
            sessions_since_last_crash: self.sessions_since_last_crash.load(SeqCst),
            active_duration_since_last_crash: self.active_duration_since_last_crash.load(SeqCst),
            background_duration_since_last_crash: self
                .background_duration_since_last_crash
                .load(SeqCst),
            sessions_since_launch: self.sessions_since_launch.load(SeqCst),
            active_duration_since_launch: self.active_duration_since_launch.load(SeqCst),
            background_duration_since_launch: self.background_duration_since_launch.load(SeqCst),
        }
    }

    fn encode(&self, encoder: &mut JsonEncoder) -> Result<(), JsonError> {
        encoder.begin_object(None)?;
        encoder.add_integer(Some("version"), STATE_FORMAT_VERSION)?;
        // A crash this launch means the next launch follows a crash.
        encoder.add_boolean(
            Some("crashedLastLaunch"),
            self.crashed_this_launch.load(SeqCst),
        )?;
        encoder.add_float(
            Some("activeDurationSinceLastCrash"),
            self.active_duration_since_last_crash.load(SeqCst),
        )?;
        encoder.add_float(
            Some("backgroundDurationSinceLastCrash"),
            self.background_duration_since_last_crash.load(SeqCst),
        )?;
        encoder.add_integer(
            Some("launchesSinceLastCrash"),
            self.launches_since_last_crash.load(SeqCst),
        )?;
        encoder.add_integer(
            Some("sessionsSinceLastCrash"),
            self.sessions_since_last_crash.load(SeqCst),
        )?;
        encoder.end_encode()
    }
}

pub struct AppStateMonitor {
    enabled: AtomicBool,
    launched: AtomicBool,
    path: PathBuf,
    // NUL terminated copy of `path` for the crash-time save.
    c_path: Option<CString>,
    tracker: Tracker,
}

impl AppStateMonitor {
    pub fn new(state_file: &Path) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            launched: AtomicBool::new(false),
            path: state_file.to_path_buf(),
            c_path: CString::new(state_file.as_os_str().as_bytes()).ok(),
            tracker: Tracker::default(),
        }
    }

    fn load(&self) -> anyhow::Result<Option<PersistedState>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        let state: PersistedState = serde_json::from_slice(&data)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        anyhow::ensure!(
            state.version == STATE_FORMAT_VERSION,
            "Expected state file version {STATE_FORMAT_VERSION} but got {}",
            state.version
        );
        Ok(Some(state))
    }

    /// Async-signal-safe save through the streaming encoder.
    fn save(&self) -> bool {
        let Some(path) = &self.c_path else {
            return false;
        };
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
            return false;
        }
        let mut sink = FdSink::new(fd);
        let result = {
            let mut encoder = JsonEncoder::new(&mut sink, true);
            self.tracker
                .encode(&mut encoder)
                .and_then(|_| encoder.flush())
        };
        close_fd(fd);
        if let Err(e) = &result {
            crash_log!(Error, "could not save application state: {e}");
        }
        result.is_ok()
    }

    /// First activation in this process: fold the persisted state into a new launch.
    fn on_launch(&self) {
        let t = &self.tracker;
        match self.load() {
            Ok(Some(state)) => {
                t.crashed_last_launch.store(state.crashed_last_launch, SeqCst);
                t.active_duration_since_last_crash
                    .store(state.active_duration_since_last_crash, SeqCst);
                t.background_duration_since_last_crash
                    .store(state.background_duration_since_last_crash, SeqCst);
                t.launches_since_last_crash
                    .store(state.launches_since_last_crash, SeqCst);
                t.sessions_since_last_crash
                    .store(state.sessions_since_last_crash, SeqCst);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Ignoring application state: {e:#}"),
        }
        if t.crashed_last_launch.load(SeqCst) {
            t.active_duration_since_last_crash.store(0.0, SeqCst);
            t.background_duration_since_last_crash.store(0.0, SeqCst);
            t.launches_since_last_crash.store(0, SeqCst);
            t.sessions_since_last_crash.store(0, SeqCst);
        }
        t.crashed_this_launch.store(false, SeqCst);
        t.active_duration_since_launch.store(0.0, SeqCst);
        t.background_duration_since_launch.store(0.0, SeqCst);
        t.sessions_since_launch.store(1, SeqCst);
        t.transition_time.store(now_seconds(), SeqCst);

        // The launch counts as the first transition to the foreground.
        t.launches_since_last_crash.fetch_add(1, SeqCst);
        t.sessions_since_last_crash.fetch_add(1, SeqCst);
        t.application_in_foreground.store(true, SeqCst);

        if let Some(dir) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                tracing::warn!("Could not create {}: {e}", dir.display());
            }
        }
        self.save();
    }

    pub fn notify_app_active(&self, is_active: bool) {
        let t = &self.tracker;
        if is_active {
            t.transition_time.store(now_seconds(), SeqCst);
        } else {
            let now = now_seconds();
            t.add_active(now - t.transition_time.swap(now, SeqCst));
        }
        t.application_active.store(is_active, SeqCst);
    }

    pub fn notify_app_in_foreground(&self, in_foreground: bool) {
        let t = &self.tracker;
        if in_foreground {
            let now = now_seconds();
            t.add_background(now - t.transition_time.swap(now, SeqCst));
            t.sessions_since_last_crash.fetch_add(1, SeqCst);
            t.sessions_since_launch.fetch_add(1, SeqCst);
        } else {
            t.transition_time.store(now_seconds(), SeqCst);
        }
        t.application_in_foreground.store(in_foreground, SeqCst);
        if !in_foreground {
            self.save();
        }
    }

    pub fn notify_app_terminate(&self) {
        self.tracker.update_durations();
        self.save();
    }

    /// Async-signal-safe.
    pub fn notify_app_crash(&self) {
        self.tracker.update_durations();
        self.tracker.crashed_this_launch.store(true, SeqCst);
        self.save();
    }

    pub fn snapshot(&self) -> AppStateSnapshot {
        self.tracker.snapshot()
    }
}

impl Monitor for AppStateMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::APPLICATION_STATE
    }

    fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, SeqCst) == enabled {
            return;
        }
        if enabled && !self.launched.swap(true, SeqCst) {
            self.on_launch();
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    fn add_contextual_info_to_event<'a>(&'a self, context: &mut MonitorContext<'a>) {
        self.tracker.update_durations();
        context.app_state = Some(self.tracker.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(dir: &Path) -> AppStateMonitor {
        AppStateMonitor::new(&dir.join("Data").join("CrashState.json"))
    }

    fn stored(dir: &Path) -> serde_json::Value {
        let data = std::fs::read(dir.join("Data").join("CrashState.json")).unwrap();
        serde_json::from_slice(&data).unwrap()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn launches_accumulate_until_a_crash() {
        let dir = tempfile::tempdir().unwrap();

        let first = monitor(dir.path());
        first.set_enabled(true);
        assert_eq!(first.snapshot().launches_since_last_crash, 1);
        assert_eq!(first.snapshot().sessions_since_launch, 1);
        assert_eq!(stored(dir.path())["version"], 1);

        let second = monitor(dir.path());
        second.set_enabled(true);
        assert_eq!(second.snapshot().launches_since_last_crash, 2);
        assert!(!second.snapshot().crashed_last_launch);
        second.notify_app_crash();
        assert_eq!(stored(dir.path())["crashedLastLaunch"], true);

        let third = monitor(dir.path());
        third.set_enabled(true);
        let snapshot = third.snapshot();
        assert!(snapshot.crashed_last_launch);
        assert_eq!(snapshot.launches_since_last_crash, 1);
        assert_eq!(snapshot.sessions_since_last_crash, 1);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn sessions_follow_foreground_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path());
        monitor.set_enabled(true);
        monitor.notify_app_active(true);
        monitor.notify_app_active(false);
        monitor.notify_app_in_foreground(false);
        monitor.notify_app_in_foreground(true);
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.sessions_since_launch, 2);
        assert_eq!(snapshot.sessions_since_last_crash, 2);
        assert!(snapshot.application_in_foreground);
        assert!(snapshot.active_duration_since_launch >= 0.0);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn other_versions_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Data")).unwrap();
        std::fs::write(
            dir.path().join("Data").join("CrashState.json"),
            r#"{"version": 7, "crashedLastLaunch": true, "activeDurationSinceLastCrash": 1.0,
                "backgroundDurationSinceLastCrash": 1.0, "launchesSinceLastCrash": 40,
                "sessionsSinceLastCrash": 40}"#,
        )
        .unwrap();
        let monitor = monitor(dir.path());
        assert!(monitor.load().is_err());
        monitor.set_enabled(true);
        assert_eq!(monitor.snapshot().launches_since_last_crash, 1);
    }
}

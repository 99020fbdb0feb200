// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fault sources and the registry that arms them and funnels their events into one handler.

pub mod app_state;
pub mod context;
pub mod cpp_exception;
pub mod deadlock;
pub mod mach_exception;
pub mod ns_exception;
pub mod signal;
pub mod signal_names;
pub mod system;
pub mod user;
pub mod zombie;

use crate::cached_data::{CachedData, ThreadSnapshot};
use crate::shared::configuration::CrashRecorderConfiguration;
use crate::shared::log::crash_log;
use context::MonitorContext;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU8};

bitflags::bitflags! {
    /// A set of fault sources.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MonitorType: u32 {
        const MACH_EXCEPTION = 0x01;
        const SIGNAL = 0x02;
        const CPP_EXCEPTION = 0x04;
        const NS_EXCEPTION = 0x08;
        const MAIN_THREAD_DEADLOCK = 0x10;
        const USER_REPORTED = 0x20;
        const SYSTEM = 0x40;
        const APPLICATION_STATE = 0x80;
        const ZOMBIE = 0x100;
    }
}

impl MonitorType {
    pub const NONE: Self = Self::empty();
    pub const ALL: Self = Self::all();
    pub const EXPERIMENTAL: Self = Self::MAIN_THREAD_DEADLOCK;
    /// Sources that fight with a debugger over the same OS hooks.
    pub const DEBUGGER_UNSAFE: Self = Self::MACH_EXCEPTION
        .union(Self::SIGNAL)
        .union(Self::CPP_EXCEPTION)
        .union(Self::NS_EXCEPTION);
    pub const ASYNC_SAFE: Self = Self::MACH_EXCEPTION.union(Self::SIGNAL);
    pub const OPTIONAL: Self = Self::ZOMBIE;
    pub const ASYNC_UNSAFE: Self = Self::ALL.difference(Self::ASYNC_SAFE);
    pub const DEBUGGER_SAFE: Self = Self::ALL.difference(Self::DEBUGGER_UNSAFE);
    pub const PRODUCTION_SAFE: Self = Self::ALL.difference(Self::EXPERIMENTAL);
    pub const PRODUCTION_SAFE_MINIMAL: Self = Self::PRODUCTION_SAFE.difference(Self::OPTIONAL);
    /// Always enabled.
    pub const REQUIRED: Self = Self::SYSTEM.union(Self::APPLICATION_STATE);
    /// Reports only when asked to.
    pub const MANUAL: Self = Self::REQUIRED.union(Self::USER_REPORTED);

    /// Name of a single source, `None` for composite or empty sets.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::MACH_EXCEPTION => "MachException",
            Self::SIGNAL => "Signal",
            Self::CPP_EXCEPTION => "CPPException",
            Self::NS_EXCEPTION => "NSException",
            Self::MAIN_THREAD_DEADLOCK => "MainThreadDeadlock",
            Self::USER_REPORTED => "UserReported",
            Self::SYSTEM => "System",
            Self::APPLICATION_STATE => "ApplicationState",
            Self::ZOMBIE => "Zombie",
            _ => return None,
        };
        Some(name)
    }
}

/// A fault source.
pub trait Monitor {
    fn monitor_type(&self) -> MonitorType;
    /// Installs or removes the source's OS hooks. A source that cannot be enabled logs why and
    /// stays disabled.
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Adds this source's own facts to an event being reported.
    fn add_contextual_info_to_event<'a>(&'a self, _context: &mut MonitorContext<'a>) {}
}

/// The closed set of sources.
#[derive(Clone, Copy)]
pub enum MonitorKind<'a> {
    MachException(&'a mach_exception::MachExceptionMonitor),
    Signal(&'a signal::SignalMonitor),
    CppException(&'a cpp_exception::CppExceptionMonitor),
    NsException(&'a ns_exception::NsExceptionMonitor),
    MainThreadDeadlock(&'a deadlock::DeadlockMonitor),
    UserReported(&'a user::UserReportedMonitor),
    System(&'a system::SystemMonitor),
    ApplicationState(&'a app_state::AppStateMonitor),
    Zombie(&'a zombie::ZombieMonitor),
}

macro_rules! dispatch {
    ($kind:expr, $m:ident => $body:expr) => {
        match $kind {
            MonitorKind::MachException($m) => $body,
            MonitorKind::Signal($m) => $body,
            MonitorKind::CppException($m) => $body,
            MonitorKind::NsException($m) => $body,
            MonitorKind::MainThreadDeadlock($m) => $body,
            MonitorKind::UserReported($m) => $body,
            MonitorKind::System($m) => $body,
            MonitorKind::ApplicationState($m) => $body,
            MonitorKind::Zombie($m) => $body,
        }
    };
}

impl<'m> MonitorKind<'m> {
    fn monitor_type(self) -> MonitorType {
        dispatch!(self, m => m.monitor_type())
    }

    fn set_enabled(self, enabled: bool) {
        dispatch!(self, m => m.set_enabled(enabled))
    }

    fn is_enabled(self) -> bool {
        dispatch!(self, m => m.is_enabled())
    }

    fn add_contextual_info_to_event(self, context: &mut MonitorContext<'m>) {
        dispatch!(self, m => m.add_contextual_info_to_event(context))
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Idle = 0,
    Installing = 1,
    Armed = 2,
    Handling = 3,
    Terminated = 4,
}

impl RegistryState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Installing,
            2 => Self::Armed,
            3 => Self::Handling,
            4 => Self::Terminated,
            _ => Self::Idle,
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn debugger_attached() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find_map(|line| line.strip_prefix("TracerPid:"))
                .and_then(|pid| pid.trim().parse::<i32>().ok())
        })
        .is_some_and(|pid| pid != 0)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn debugger_attached() -> bool {
    false
}

/// Owns one instance of every source and tracks crash handling state.
pub struct MonitorRegistry {
    mach_exception: mach_exception::MachExceptionMonitor,
    signal: signal::SignalMonitor,
    cpp_exception: cpp_exception::CppExceptionMonitor,
    ns_exception: ns_exception::NsExceptionMonitor,
    deadlock: deadlock::DeadlockMonitor,
    user_reported: user::UserReportedMonitor,
    system: system::SystemMonitor,
    app_state: app_state::AppStateMonitor,
    zombie: zombie::ZombieMonitor,
    state: AtomicU8,
    handling: AtomicBool,
    crashed_during_crash_handling: AtomicBool,
    debugger_attached: bool,
    require_async_safety: bool,
}

impl MonitorRegistry {
    pub fn new(config: &CrashRecorderConfiguration) -> Self {
        Self {
            mach_exception: mach_exception::MachExceptionMonitor::new(),
            signal: signal::SignalMonitor::new(config),
            cpp_exception: cpp_exception::CppExceptionMonitor::new(),
            ns_exception: ns_exception::NsExceptionMonitor::new(),
            deadlock: deadlock::DeadlockMonitor::new(config.deadlock_watchdog_interval()),
            user_reported: user::UserReportedMonitor::new(),
            system: system::SystemMonitor::new(config.app_name()),
            app_state: app_state::AppStateMonitor::new(&config.state_file_path()),
            zombie: zombie::ZombieMonitor::new(),
            state: AtomicU8::new(RegistryState::Idle as u8),
            handling: AtomicBool::new(false),
            crashed_during_crash_handling: AtomicBool::new(false),
            debugger_attached: config
                .debugger_attached_override()
                .unwrap_or_else(debugger_attached),
            require_async_safety: config.require_async_safety(),
        }
    }

    pub fn monitors(&self) -> [MonitorKind<'_>; 9] {
        [
            MonitorKind::MachException(&self.mach_exception),
            MonitorKind::Signal(&self.signal),
            MonitorKind::CppException(&self.cpp_exception),
            MonitorKind::NsException(&self.ns_exception),
            MonitorKind::MainThreadDeadlock(&self.deadlock),
            MonitorKind::UserReported(&self.user_reported),
            MonitorKind::System(&self.system),
            MonitorKind::ApplicationState(&self.app_state),
            MonitorKind::Zombie(&self.zombie),
        ]
    }

    pub fn state(&self) -> RegistryState {
        RegistryState::from_u8(self.state.load(SeqCst))
    }

    fn set_state(&self, state: RegistryState) {
        self.state.store(state as u8, SeqCst);
    }

    /// Enables exactly the requested sources, after applying the debugger and async-safety
    /// policies. Returns the sources that ended up enabled.
    pub fn set_active_monitors(&self, requested: MonitorType) -> MonitorType {
        let mut types = requested;
        if self.debugger_attached && types.intersects(MonitorType::DEBUGGER_UNSAFE) {
            tracing::warn!(
                "Debugger attached, not monitoring {:?}",
                types & MonitorType::DEBUGGER_UNSAFE
            );
            types -= MonitorType::DEBUGGER_UNSAFE;
        }
        if self.require_async_safety && types.intersects(MonitorType::ASYNC_UNSAFE) {
            tracing::debug!(
                "Async safety required, not monitoring {:?}",
                types & MonitorType::ASYNC_UNSAFE
            );
            types -= MonitorType::ASYNC_UNSAFE;
        }
        types |= MonitorType::REQUIRED;

        self.set_state(RegistryState::Installing);
        for monitor in self.monitors() {
            let wanted = types.contains(monitor.monitor_type());
            if monitor.is_enabled() != wanted {
                monitor.set_enabled(wanted);
            }
        }
        let active = self.active_monitors();
        tracing::debug!(?requested, ?active, "Active monitors updated");
        self.set_state(if active.is_empty() {
            RegistryState::Idle
        } else {
            RegistryState::Armed
        });
        active
    }

    pub fn active_monitors(&self) -> MonitorType {
        self.monitors()
            .into_iter()
            .filter(|m| m.is_enabled())
            .fold(MonitorType::NONE, |acc, m| acc | m.monitor_type())
    }

    /// Disables every source. Async-signal-safe as long as the sources' own disabling is.
    fn disable_all(&self) {
        for monitor in self.monitors() {
            if monitor.is_enabled() {
                monitor.set_enabled(false);
            }
        }
    }

    /// Marks the start of handling a fault. Returns true when a fault is already being handled,
    /// in which case every source is disabled so the process can terminate cleanly.
    pub fn notify_fatal_exception_captured(&self, is_async_safe: bool) -> bool {
        if self.handling.swap(true, SeqCst) {
            self.crashed_during_crash_handling.store(true, SeqCst);
            crash_log!(
                Warn,
                "detected a crash while handling a crash (async safe: {is_async_safe})"
            );
            self.disable_all();
            return true;
        }
        false
    }

    pub fn is_handling_crash(&self) -> bool {
        self.handling.load(SeqCst)
    }

    pub fn crashed_during_crash_handling(&self) -> bool {
        self.crashed_during_crash_handling.load(SeqCst)
    }

    /// The single entry point for every event. Collects contextual information from the
    /// enabled sources and hands the event to `on_event` together with the frozen thread cache.
    ///
    /// Only fatal events claim the handling flag. Non-fatal events may run concurrently with
    /// each other and are marked as nested only once a crash inside crash handling was seen.
    pub fn handle_exception<'a>(
        &'a self,
        context: &mut MonitorContext<'a>,
        cached_data: &CachedData,
        on_event: &mut dyn FnMut(&mut MonitorContext<'a>, Option<&ThreadSnapshot>),
    ) {
        let nested = if context.is_fatal {
            let nested = self.notify_fatal_exception_captured(context.is_async_safe);
            self.set_state(RegistryState::Handling);
            nested
        } else {
            self.crashed_during_crash_handling()
        };
        context.crashed_during_crash_handling = nested;
        {
            let frozen = cached_data.freeze();
            for monitor in self.monitors() {
                if monitor.is_enabled() {
                    monitor.add_contextual_info_to_event(context);
                }
            }
            on_event(context, frozen.snapshot());
        }

        if context.is_fatal {
            self.disable_all();
            self.set_state(RegistryState::Terminated);
        }
    }

    pub fn signal(&self) -> &signal::SignalMonitor {
        &self.signal
    }

    pub fn cpp_exception(&self) -> &cpp_exception::CppExceptionMonitor {
        &self.cpp_exception
    }

    pub fn ns_exception(&self) -> &ns_exception::NsExceptionMonitor {
        &self.ns_exception
    }

    pub fn deadlock(&self) -> &deadlock::DeadlockMonitor {
        &self.deadlock
    }

    pub fn user_reported(&self) -> &user::UserReportedMonitor {
        &self.user_reported
    }

    pub fn system(&self) -> &system::SystemMonitor {
        &self.system
    }

    pub fn app_state(&self) -> &app_state::AppStateMonitor {
        &self.app_state
    }

    pub fn zombie(&self) -> &zombie::ZombieMonitor {
        &self.zombie
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_sets() {
        assert_eq!(MonitorType::ALL.bits(), 0x1ff);
        assert_eq!(
            MonitorType::PRODUCTION_SAFE_MINIMAL,
            MonitorType::ALL - MonitorType::MAIN_THREAD_DEADLOCK - MonitorType::ZOMBIE
        );
        assert_eq!(MonitorType::DEBUGGER_SAFE.bits(), 0x1f0);
        assert_eq!(MonitorType::ASYNC_UNSAFE.bits(), 0x1fc);
        assert!(MonitorType::MANUAL.contains(MonitorType::USER_REPORTED | MonitorType::SYSTEM));
    }

    #[test]
    fn names_only_for_single_flags() {
        assert_eq!(MonitorType::SIGNAL.name(), Some("Signal"));
        assert_eq!(MonitorType::CPP_EXCEPTION.name(), Some("CPPException"));
        assert_eq!(MonitorType::REQUIRED.name(), None);
        assert_eq!(MonitorType::NONE.name(), None);
    }

    #[test]
    fn serde_round_trip() {
        let json = serde_json::to_string(&MonitorType::MANUAL).unwrap();
        let back: MonitorType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, MonitorType::MANUAL);
    }

    fn registry(dir: &std::path::Path, debugger: bool, async_safety: bool) -> MonitorRegistry {
        let mut config = CrashRecorderConfiguration::new("app", dir).unwrap();
        config.set_debugger_attached_override(Some(debugger));
        config.set_require_async_safety(async_safety);
        MonitorRegistry::new(&config)
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn required_monitors_are_always_added() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), false, false);
        assert_eq!(registry.state(), RegistryState::Idle);
        let active = registry.set_active_monitors(MonitorType::USER_REPORTED);
        assert_eq!(active, MonitorType::MANUAL);
        assert_eq!(registry.state(), RegistryState::Armed);

        let active = registry.set_active_monitors(MonitorType::NONE);
        assert_eq!(active, MonitorType::REQUIRED);
        assert!(!registry.user_reported().is_enabled());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn policies_mask_unsafe_monitors() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), true, false);
        let active = registry.set_active_monitors(MonitorType::SIGNAL | MonitorType::ZOMBIE);
        assert_eq!(active, MonitorType::REQUIRED | MonitorType::ZOMBIE);

        let registry = self::registry(dir.path(), false, true);
        let active = registry.set_active_monitors(MonitorType::USER_REPORTED | MonitorType::ZOMBIE);
        assert_eq!(active, MonitorType::REQUIRED);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn nested_fatal_handling_is_flagged_not_recursed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), false, false);
        registry.set_active_monitors(MonitorType::MANUAL);
        let cached_data = CachedData::new();

        let mut outer = MonitorContext::new(MonitorType::SIGNAL);
        let mut inner_flags = None;
        registry.handle_exception(&mut outer, &cached_data, &mut |context, _| {
            assert!(cached_data.is_frozen());
            assert!(context.system.is_some());
            assert!(context.app_state.is_some());
            assert_eq!(registry.state(), RegistryState::Handling);
            let mut inner = MonitorContext::new(MonitorType::SIGNAL);
            registry.handle_exception(&mut inner, &cached_data, &mut |nested, _| {
                inner_flags = Some(nested.crashed_during_crash_handling);
            });
        });
        assert_eq!(inner_flags, Some(true));
        assert!(!outer.crashed_during_crash_handling);
        assert!(registry.crashed_during_crash_handling());
        assert!(registry.is_handling_crash());
        assert!(!cached_data.is_frozen());
        assert_eq!(registry.state(), RegistryState::Terminated);
        // The nested fault disabled everything.
        assert_eq!(registry.active_monitors(), MonitorType::NONE);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn overlapping_user_reports_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), false, false);
        let armed = registry.set_active_monitors(MonitorType::MANUAL);
        let cached_data = CachedData::new();
        let both_inside = std::sync::Barrier::new(2);
        let (registry_ref, cached_data_ref, barrier) = (&registry, &cached_data, &both_inside);

        let flags: Vec<bool> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(move || {
                        let mut context = MonitorContext::new(MonitorType::USER_REPORTED);
                        context.is_fatal = false;
                        let mut nested = None;
                        registry_ref.handle_exception(&mut context, cached_data_ref, &mut |event, _| {
                            barrier.wait();
                            nested = Some(event.crashed_during_crash_handling);
                        });
                        nested.unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(flags, [false, false]);
        assert!(!registry.crashed_during_crash_handling());
        assert!(!registry.is_handling_crash());
        assert_eq!(registry.active_monitors(), armed);
        assert_eq!(registry.state(), RegistryState::Armed);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn user_report_during_fatal_handling_is_not_a_recrash() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), false, false);
        registry.set_active_monitors(MonitorType::MANUAL);
        let cached_data = CachedData::new();

        let mut fatal = MonitorContext::new(MonitorType::SIGNAL);
        let mut inner_flags = None;
        let mut active_inside = MonitorType::NONE;
        registry.handle_exception(&mut fatal, &cached_data, &mut |_, _| {
            let mut report = MonitorContext::new(MonitorType::USER_REPORTED);
            report.is_fatal = false;
            registry.handle_exception(&mut report, &cached_data, &mut |nested, _| {
                inner_flags = Some(nested.crashed_during_crash_handling);
            });
            active_inside = registry.active_monitors();
        });
        assert_eq!(inner_flags, Some(false));
        assert_eq!(active_inside, MonitorType::MANUAL);
        assert!(!registry.crashed_during_crash_handling());
    }
}

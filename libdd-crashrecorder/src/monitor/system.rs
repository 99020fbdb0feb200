// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Facts about the host and process, collected once when the monitor is enabled.

use super::context::MonitorContext;
use super::{Monitor, MonitorType};
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemInfo {
    pub system_name: String,
    pub system_version: String,
    pub machine: String,
    pub os_version: String,
    pub kernel_version: String,
    pub architecture: String,
    pub bitness: String,
    pub cpu_arch: &'static str,
    pub app_name: String,
    pub process_name: Option<String>,
    pub process_id: u32,
    pub parent_process_id: u32,
    pub executable_path: Option<String>,
    pub app_start_time: i64,
    pub boot_time: Option<i64>,
    pub time_zone: String,
    pub build_type: &'static str,
    pub memory_size: u64,
    pub page_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub size: u64,
    pub usable: u64,
    pub free: u64,
}

impl SystemInfo {
    pub fn collect(app_name: &str) -> Self {
        let os = os_info::get();
        let uts = nix::sys::utsname::uname().ok();
        let uts_field = |f: fn(&nix::sys::utsname::UtsName) -> &std::ffi::OsStr| {
            uts.as_ref()
                .map(|u| f(u).to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        let executable = std::env::current_exe().ok();
        let page_size = page_size::get();
        Self {
            system_name: os.os_type().to_string(),
            system_version: os.version().to_string(),
            machine: uts_field(|u| u.machine()),
            os_version: uts_field(|u| u.release()),
            kernel_version: uts_field(|u| u.version()),
            architecture: os.architecture().unwrap_or("unknown").to_string(),
            bitness: os.bitness().to_string(),
            cpu_arch: std::env::consts::ARCH,
            app_name: app_name.to_string(),
            process_name: executable
                .as_ref()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned()),
            process_id: std::process::id(),
            parent_process_id: std::os::unix::process::parent_id(),
            executable_path: executable.map(|p| p.to_string_lossy().into_owned()),
            app_start_time: chrono::Utc::now().timestamp(),
            boot_time: boot_time(),
            time_zone: chrono::Local::now().format("%:z").to_string(),
            build_type: if cfg!(debug_assertions) {
                "debug"
            } else {
                "release"
            },
            memory_size: physical_memory(page_size),
            page_size,
        }
    }
}

fn physical_memory(page_size: usize) -> u64 {
    // SAFETY: sysconf has no preconditions.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if pages < 0 {
        return 0;
    }
    pages as u64 * page_size as u64
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn boot_time() -> Option<i64> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    stat.lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn boot_time() -> Option<i64> {
    None
}

/// Current memory figures. Async-signal-safe.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn memory_stats() -> Option<MemoryStats> {
    // SAFETY: `sysinfo` is plain old data and the syscall fills it in.
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    // SAFETY: valid out pointer.
    if unsafe { libc::sysinfo(&mut info) } != 0 {
        return None;
    }
    let unit = info.mem_unit.max(1) as u64;
    Some(MemoryStats {
        size: info.totalram as u64 * unit,
        usable: (info.freeram as u64 + info.bufferram as u64) * unit,
        free: info.freeram as u64 * unit,
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn memory_stats() -> Option<MemoryStats> {
    None
}

pub struct SystemMonitor {
    enabled: AtomicBool,
    app_name: String,
    info: OnceLock<SystemInfo>,
}

impl SystemMonitor {
    pub fn new(app_name: &str) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            app_name: app_name.to_string(),
            info: OnceLock::new(),
        }
    }

    pub fn info(&self) -> Option<&SystemInfo> {
        self.info.get()
    }
}

impl Monitor for SystemMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::SYSTEM
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled {
            self.info.get_or_init(|| SystemInfo::collect(&self.app_name));
        }
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    fn add_contextual_info_to_event<'a>(&'a self, context: &mut MonitorContext<'a>) {
        context.system = self.info.get();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn collects_this_process() {
        let monitor = SystemMonitor::new("app");
        assert!(monitor.info().is_none());
        monitor.set_enabled(true);
        let info = monitor.info().unwrap();
        assert_eq!(info.process_id, std::process::id());
        assert_eq!(info.app_name, "app");
        assert_eq!(info.cpu_arch, std::env::consts::ARCH);
        assert!(info.memory_size > 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn memory_stats_are_consistent() {
        let stats = memory_stats().unwrap();
        assert!(stats.size >= stats.usable);
        assert!(stats.usable >= stats.free);
    }
}

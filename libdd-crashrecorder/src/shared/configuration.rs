// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use crate::monitor::signal_names::{fatal_signals, signal_from_signum};
use crate::monitor::MonitorType;
use crate::shared::constants;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashRecorderConfiguration {
    app_name: String,
    // Reports are written directly in this directory; app state lives in a subdirectory.
    install_path: PathBuf,
    monitors: MonitorType,
    max_report_count: usize,
    // Zero disables the main-thread watchdog.
    deadlock_watchdog_interval: Duration,
    cached_data_interval: Duration,
    create_alt_stack: bool,
    use_alt_stack: bool,
    signals: Vec<i32>,
    require_async_safety: bool,
    debugger_attached_override: Option<bool>,
    console_log_path: Option<PathBuf>,
    user_info_json: Option<String>,
    pretty_print: bool,
}

impl CrashRecorderConfiguration {
    pub fn new(app_name: impl Into<String>, install_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let app_name = app_name.into();
        let install_path = install_path.into();
        anyhow::ensure!(!app_name.is_empty(), "App name must not be empty");
        anyhow::ensure!(
            !app_name.contains('/') && !app_name.contains('\0'),
            "App name {app_name:?} cannot be used in a file name"
        );
        anyhow::ensure!(
            !install_path.as_os_str().is_empty(),
            "Install path must not be empty"
        );
        Ok(Self {
            app_name,
            install_path,
            monitors: MonitorType::PRODUCTION_SAFE_MINIMAL,
            max_report_count: constants::DEFAULT_MAX_REPORT_COUNT,
            deadlock_watchdog_interval: Duration::ZERO,
            cached_data_interval: constants::DEFAULT_CACHED_DATA_INTERVAL,
            create_alt_stack: true,
            use_alt_stack: true,
            signals: fatal_signals().to_vec(),
            require_async_safety: false,
            debugger_attached_override: None,
            console_log_path: None,
            user_info_json: None,
            pretty_print: false,
        })
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        // Run the deserialized values through the same checks as the setters.
        let mut validated = Self::new(config.app_name.clone(), config.install_path.clone())?;
        validated.set_monitors(config.monitors);
        validated.set_max_report_count(config.max_report_count)?;
        validated.set_deadlock_watchdog_interval(config.deadlock_watchdog_interval);
        validated.set_cached_data_interval(config.cached_data_interval)?;
        validated.set_alt_stack(config.create_alt_stack, config.use_alt_stack)?;
        validated.set_signals(config.signals)?;
        validated.set_require_async_safety(config.require_async_safety);
        validated.set_debugger_attached_override(config.debugger_attached_override);
        validated.set_console_log_path(config.console_log_path);
        validated.set_user_info_json(config.user_info_json)?;
        validated.set_pretty_print(config.pretty_print);
        Ok(validated)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn install_path(&self) -> &Path {
        &self.install_path
    }

    pub fn reports_path(&self) -> &Path {
        &self.install_path
    }

    pub fn state_file_path(&self) -> PathBuf {
        self.install_path
            .join(constants::STATE_DIRECTORY)
            .join(constants::STATE_FILE_NAME)
    }

    pub fn monitors(&self) -> MonitorType {
        self.monitors
    }

    pub fn max_report_count(&self) -> usize {
        self.max_report_count
    }

    pub fn deadlock_watchdog_interval(&self) -> Duration {
        self.deadlock_watchdog_interval
    }

    pub fn cached_data_interval(&self) -> Duration {
        self.cached_data_interval
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn signals(&self) -> &[i32] {
        &self.signals
    }

    pub fn require_async_safety(&self) -> bool {
        self.require_async_safety
    }

    pub fn debugger_attached_override(&self) -> Option<bool> {
        self.debugger_attached_override
    }

    pub fn console_log_path(&self) -> Option<&Path> {
        self.console_log_path.as_deref()
    }

    pub fn user_info_json(&self) -> Option<&str> {
        self.user_info_json.as_deref()
    }

    pub fn pretty_print(&self) -> bool {
        self.pretty_print
    }

    pub fn set_monitors(&mut self, monitors: MonitorType) {
        self.monitors = monitors;
    }

    pub fn set_max_report_count(&mut self, max_report_count: usize) -> anyhow::Result<()> {
        anyhow::ensure!(max_report_count > 0, "At least one report must be kept");
        self.max_report_count = max_report_count;
        Ok(())
    }

    pub fn set_deadlock_watchdog_interval(&mut self, interval: Duration) {
        self.deadlock_watchdog_interval = interval;
    }

    pub fn set_cached_data_interval(&mut self, interval: Duration) -> anyhow::Result<()> {
        anyhow::ensure!(
            !interval.is_zero(),
            "Cached data refresh interval must be positive"
        );
        self.cached_data_interval = interval;
        Ok(())
    }

    pub fn set_alt_stack(&mut self, create_alt_stack: bool, use_alt_stack: bool) -> anyhow::Result<()> {
        // Requesting to create, but not use, the altstack is considered paradoxical.
        anyhow::ensure!(
            !create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.create_alt_stack = create_alt_stack;
        self.use_alt_stack = use_alt_stack;
        Ok(())
    }

    pub fn set_signals(&mut self, mut signals: Vec<i32>) -> anyhow::Result<()> {
        if signals.is_empty() {
            self.signals = fatal_signals().to_vec();
            return Ok(());
        }
        let before_len = signals.len();
        signals.sort();
        signals.dedup();
        anyhow::ensure!(
            before_len == signals.len(),
            "Signals contained duplicate elements"
        );
        signals
            .iter()
            .try_for_each(|x| signal_from_signum(*x).map(|_| ()))?;
        self.signals = signals;
        Ok(())
    }

    pub fn set_require_async_safety(&mut self, require_async_safety: bool) {
        self.require_async_safety = require_async_safety;
    }

    pub fn set_debugger_attached_override(&mut self, attached: Option<bool>) {
        self.debugger_attached_override = attached;
    }

    pub fn set_console_log_path(&mut self, path: Option<PathBuf>) {
        self.console_log_path = path;
    }

    pub fn set_user_info_json(&mut self, json: Option<String>) -> anyhow::Result<()> {
        if let Some(json) = &json {
            crate::report::json::validate(json.as_bytes())
                .map_err(|e| anyhow::anyhow!("User info is not valid JSON: {e}"))?;
        }
        self.user_info_json = json;
        Ok(())
    }

    pub fn set_pretty_print(&mut self, pretty_print: bool) {
        self.pretty_print = pretty_print;
    }
}

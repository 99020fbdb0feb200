// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mach exception ports. Only Apple kernels have them and this crate does not drive them, so the
//! source exists to keep the set of monitor types complete and refuses to be enabled.

use super::{Monitor, MonitorType};

pub struct MachExceptionMonitor;

impl MachExceptionMonitor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MachExceptionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for MachExceptionMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::MACH_EXCEPTION
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled {
            tracing::warn!("Mach exception handling is not supported on this platform");
        }
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_enables() {
        let monitor = MachExceptionMonitor::new();
        monitor.set_enabled(true);
        assert!(!monitor.is_enabled());
    }
}

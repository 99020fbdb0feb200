// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remembers recently deallocated objects so a crash on a dangling pointer can name the type
//! the memory used to hold.
//!
//! The embedding runtime feeds [`ZombieMonitor::record_deallocation`] from its deallocation
//! hook. Once enabled the cache stays allocated: hooks may still be holding on to it.

use super::context::MonitorContext;
use super::{Monitor, MonitorType};
use crate::shared::constants::{ZOMBIE_CACHE_SIZE, ZOMBIE_NAME_LEN, ZOMBIE_REASON_LEN};
use crate::shared::fixed_str::FixedStr;
use std::ffi::CStr;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};
use std::sync::{Mutex, OnceLock, PoisonError};

/// The last exception object that was deallocated.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeallocatedException {
    pub address: usize,
    pub name: FixedStr<ZOMBIE_NAME_LEN>,
    pub reason: FixedStr<ZOMBIE_REASON_LEN>,
}

struct Entry {
    address: AtomicUsize,
    type_name: AtomicPtr<libc::c_char>,
}

fn slot(address: usize) -> usize {
    (address >> 4) & (ZOMBIE_CACHE_SIZE - 1)
}

pub struct ZombieMonitor {
    enabled: AtomicBool,
    cache: OnceLock<Box<[Entry]>>,
    last_exception: Mutex<Option<DeallocatedException>>,
}

impl Default for ZombieMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ZombieMonitor {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            cache: OnceLock::new(),
            last_exception: Mutex::new(None),
        }
    }

    /// Notes that the object at `address` of type `type_name` was freed. A later object hashing
    /// to the same slot evicts it.
    pub fn record_deallocation(&self, address: usize, type_name: &'static CStr) {
        if !self.is_enabled() || address == 0 {
            return;
        }
        let Some(cache) = self.cache.get() else {
            return;
        };
        let entry = &cache[slot(address)];
        entry.address.store(address, SeqCst);
        entry.type_name.store(type_name.as_ptr().cast_mut(), SeqCst);
    }

    /// Records an exception object that is being freed, for reports about it later.
    pub fn record_deallocated_exception(&self, address: usize, name: &str, reason: &str) {
        if !self.is_enabled() {
            return;
        }
        let record = DeallocatedException {
            address,
            name: FixedStr::from_bytes(name.as_bytes()),
            reason: FixedStr::from_bytes(reason.as_bytes()),
        };
        *self
            .last_exception
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(record);
    }

    /// Type of the object most recently freed at `address`. Async-signal-safe.
    pub fn zombie_type_name(&self, address: usize) -> Option<&'static str> {
        let entry = &self.cache.get()?[slot(address)];
        let name = entry.type_name.load(SeqCst);
        if name.is_null() || entry.address.load(SeqCst) != address {
            return None;
        }
        // SAFETY: only pointers obtained from `&'static CStr` are ever stored.
        unsafe { CStr::from_ptr(name) }.to_str().ok()
    }
}

impl Monitor for ZombieMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::ZOMBIE
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled {
            self.cache.get_or_init(|| {
                (0..ZOMBIE_CACHE_SIZE)
                    .map(|_| Entry {
                        address: AtomicUsize::new(0),
                        type_name: AtomicPtr::new(ptr::null_mut()),
                    })
                    .collect()
            });
        } else if self.is_enabled() {
            tracing::info!("Zombie tracking stops recording, its cache stays allocated");
        }
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    fn add_contextual_info_to_event<'a>(&'a self, context: &mut MonitorContext<'a>) {
        // Never block at crash time: skip the record if a writer holds it.
        if let Ok(last) = self.last_exception.try_lock() {
            context.zombie_exception = *last;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_follow_the_latest_deallocation() {
        let monitor = ZombieMonitor::new();
        monitor.record_deallocation(0x1000, c"Ignored");
        assert_eq!(monitor.zombie_type_name(0x1000), None);

        monitor.set_enabled(true);
        monitor.record_deallocation(0x1000, c"Widget");
        monitor.record_deallocation(0x2000, c"Gadget");
        assert_eq!(monitor.zombie_type_name(0x1000), Some("Widget"));
        assert_eq!(monitor.zombie_type_name(0x2000), Some("Gadget"));
        assert_eq!(monitor.zombie_type_name(0x3000), None);

        let colliding = 0x1000 + (ZOMBIE_CACHE_SIZE << 4);
        monitor.record_deallocation(colliding, c"Other");
        assert_eq!(monitor.zombie_type_name(0x1000), None);
        assert_eq!(monitor.zombie_type_name(colliding), Some("Other"));

        monitor.set_enabled(false);
        assert_eq!(monitor.zombie_type_name(colliding), Some("Other"));
    }

    #[test]
    fn last_exception_is_contributed() {
        let monitor = ZombieMonitor::new();
        monitor.set_enabled(true);
        monitor.record_deallocated_exception(0xdead, "RangeError", "index 4 out of bounds");
        let mut context = MonitorContext::new(MonitorType::SIGNAL);
        monitor.add_contextual_info_to_event(&mut context);
        let record = context.zombie_exception.unwrap();
        assert_eq!(record.address, 0xdead);
        assert_eq!(record.name.as_str(), "RangeError");
        assert_eq!(record.reason.as_str(), "index 4 out of bounds");
    }
}

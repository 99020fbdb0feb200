// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process crash recording.
//!
//! Fault sources ([`monitor`]) detect a crash, capture the faulting thread's registers
//! ([`machine_context`]), walk its stack ([`stack_cursor`]) and resolve addresses against the
//! loaded images ([`symbolicator`]). The event is streamed as JSON ([`report`]) into a report
//! file managed by the [`store`]. Everything on that path is async-signal-safe. Reports are
//! finished on a later, ordinary run by [`report::fixer::fixup`].
//!
//! ```no_run
//! use libdd_crashrecorder::{CrashRecorder, CrashRecorderConfiguration};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = CrashRecorderConfiguration::new("my-app", "/var/lib/my-app/crashes")?;
//! let recorder = CrashRecorder::install(config)?;
//! for id in recorder.store().list_ids()? {
//!     if let Some(report) = recorder.read_fixed_report(id)? {
//!         println!("{}", String::from_utf8_lossy(&report));
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![cfg(unix)]

mod api;
pub mod cached_data;
pub mod machine_context;
pub mod memory;
pub mod monitor;
pub mod report;
pub mod shared;
pub mod stack_cursor;
pub mod store;
pub mod symbolicator;

pub use api::CrashRecorder;
pub use monitor::ns_exception::UncaughtException;
pub use monitor::user::UserException;
pub use monitor::MonitorType;
pub use report::fixer::{fixup, FixupError};
pub use report::json::JsonError;
pub use report::writer::ReportWriter;
pub use report::CrashNotifyCallback;
pub use shared::configuration::CrashRecorderConfiguration;
pub use shared::log::{set_crash_log_level, CrashLogLevel};
pub use store::{ReportStore, StoreError};

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Version string written into every report header.
pub const REPORT_VERSION: &str = "3.2.0";

pub const REPORT_TYPE_STANDARD: &str = "standard";
pub const REPORT_TYPE_MINIMAL: &str = "minimal";
pub const REPORT_TYPE_CUSTOM: &str = "custom";

/// Frames walked for each thread written to a report.
pub const MAX_STACK_DEPTH: usize = 100;
/// A walk that reaches this depth without a terminal frame is treated as a stack overflow.
pub const STACK_OVERFLOW_THRESHOLD: usize = 150;
/// Frames captured by the self-thread cursor.
pub const MAX_SELF_THREAD_FRAMES: usize = 128;
/// Sibling threads remembered by a crashed machine context.
pub const MAX_CAPTURED_THREADS: usize = 100;
/// How long a thread gets to answer a register sampling request.
pub const THREAD_SAMPLE_TIMEOUT: Duration = Duration::from_millis(50);

/// Machine words of stack dumped on each side of the stack pointer.
pub const STACK_CONTENTS_PUSHED_DISTANCE: usize = 20;
pub const STACK_CONTENTS_POPPED_DISTANCE: usize = 10;

pub const DEFAULT_MAX_REPORT_COUNT: usize = 5;
/// Reports larger than this are refused by the store.
pub const MAX_REPORT_SIZE: u64 = 2_000_000;
pub const MAX_PATH_LEN: usize = 1024;

pub const DEFAULT_CACHED_DATA_INTERVAL: Duration = Duration::from_secs(60);
/// Polls at startup use a one second interval before the configured one applies.
pub const CACHED_DATA_QUICK_POLLS: u32 = 4;
pub const CACHED_DATA_QUICK_INTERVAL: Duration = Duration::from_secs(1);

pub const STATE_FILE_NAME: &str = "CrashState.json";
pub const STATE_DIRECTORY: &str = "Data";
pub const STATE_FORMAT_VERSION: i64 = 1;

pub const JSON_MAX_DEPTH: usize = 100;
pub const JSON_MAX_STRING: usize = 1000;
pub const JSON_MAX_NAME: usize = 100;

pub const ZOMBIE_CACHE_SIZE: usize = 0x8000;
pub const ZOMBIE_NAME_LEN: usize = 100;
pub const ZOMBIE_REASON_LEN: usize = 900;

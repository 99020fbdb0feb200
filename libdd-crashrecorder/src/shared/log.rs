// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Logging that is usable while a crash is being handled.
//!
//! Regular code paths use `tracing`. Code that may run inside a signal handler cannot: a
//! subscriber may allocate or lock. [`crash_log!`] formats into a stack buffer and hands the
//! bytes to a single `write(2)` on stderr.

use super::fixed_str::FixedStr;
use std::fmt::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};

const CRASH_LOG_LINE: usize = 512;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CrashLogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl CrashLogLevel {
    fn as_str(self) -> &'static str {
        match self {
            CrashLogLevel::Error => "ERROR",
            CrashLogLevel::Warn => "WARN",
            CrashLogLevel::Info => "INFO",
            CrashLogLevel::Debug => "DEBUG",
        }
    }
}

static CRASH_LOG_LEVEL: AtomicU8 = AtomicU8::new(CrashLogLevel::Warn as u8);

pub fn set_crash_log_level(level: CrashLogLevel) {
    CRASH_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn crash_log_enabled(level: CrashLogLevel) -> bool {
    level as u8 <= CRASH_LOG_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn write_crash_log(level: CrashLogLevel, args: fmt::Arguments<'_>) {
    if !crash_log_enabled(level) {
        return;
    }
    let mut line = FixedStr::<CRASH_LOG_LINE>::new();
    let _ = write!(line, "crashrecorder {}: ", level.as_str());
    let _ = line.write_fmt(args);
    line.push_str("\n");
    write_all_raw(libc::STDERR_FILENO, line.as_bytes());
}

/// Writes the whole buffer with raw `write(2)` calls, retrying on EINTR.
/// Returns false if the descriptor refused the data.
pub(crate) fn write_all_raw(fd: libc::c_int, mut bytes: &[u8]) -> bool {
    while !bytes.is_empty() {
        // SAFETY: the pointer and length describe a live slice.
        let written = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if written < 0 {
            if errno::errno().0 == libc::EINTR {
                continue;
            }
            return false;
        }
        if written == 0 {
            return false;
        }
        bytes = &bytes[written as usize..];
    }
    true
}

macro_rules! crash_log {
    ($level:ident, $($arg:tt)*) => {
        $crate::shared::log::write_crash_log(
            $crate::shared::log::CrashLogLevel::$level,
            format_args!($($arg)*),
        )
    };
}
pub(crate) use crash_log;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        set_crash_log_level(CrashLogLevel::Warn);
        assert!(crash_log_enabled(CrashLogLevel::Error));
        assert!(crash_log_enabled(CrashLogLevel::Warn));
        assert!(!crash_log_enabled(CrashLogLevel::Debug));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn raw_write_reaches_a_pipe() {
        let (rd, wr) = nix::unistd::pipe().unwrap();
        use std::os::fd::AsRawFd;
        assert!(write_all_raw(wr.as_raw_fd(), b"hello"));
        let mut buf = [0u8; 8];
        let n = nix::unistd::read(rd.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OS thread identities. Enumeration uses raw syscalls so it can run inside a signal handler.

use serde::{Deserialize, Serialize};

/// Kernel thread id on Linux, `pthread_t` bits elsewhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadHandle(pub i64);

impl ThreadHandle {
    pub const NONE: ThreadHandle = ThreadHandle(0);

    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn current() -> Self {
        // SAFETY: gettid has no preconditions.
        ThreadHandle(unsafe { libc::syscall(libc::SYS_gettid) } as i64)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub fn current() -> Self {
        // SAFETY: pthread_self has no preconditions.
        ThreadHandle(unsafe { libc::pthread_self() } as usize as i64)
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Fills `out` with the threads of this process and returns how many were written.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn list_threads(out: &mut [ThreadHandle]) -> usize {
    if out.is_empty() {
        return 0;
    }
    const TASK_DIR: &[u8] = b"/proc/self/task\0";
    // SAFETY: NUL terminated path literal.
    let fd = unsafe {
        libc::open(
            TASK_DIR.as_ptr().cast(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        out[0] = ThreadHandle::current();
        return 1;
    }

    let mut count = 0;
    let mut buf = [0u8; 2048];
    'read: loop {
        // SAFETY: `buf` is writable for its full length.
        let n = unsafe { libc::syscall(libc::SYS_getdents64, fd, buf.as_mut_ptr(), buf.len()) };
        if n <= 0 {
            break;
        }
        let n = n as usize;
        let mut offset = 0;
        // linux_dirent64: d_ino u64, d_off i64, d_reclen u16, d_type u8, d_name[]
        while offset + 19 < n {
            let reclen = u16::from_ne_bytes([buf[offset + 16], buf[offset + 17]]) as usize;
            if reclen == 0 || offset + reclen > n {
                break 'read;
            }
            let name = &buf[offset + 19..offset + reclen];
            if let Some(tid) = parse_decimal(name) {
                out[count] = ThreadHandle(tid);
                count += 1;
                if count == out.len() {
                    break 'read;
                }
            }
            offset += reclen;
        }
    }
    // SAFETY: opened above.
    unsafe { libc::close(fd) };
    if count == 0 {
        out[0] = ThreadHandle::current();
        count = 1;
    }
    count
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn list_threads(out: &mut [ThreadHandle]) -> usize {
    if out.is_empty() {
        return 0;
    }
    out[0] = ThreadHandle::current();
    1
}

/// Parses a NUL terminated run of ASCII digits. `.` and `..` yield `None`.
fn parse_decimal(name: &[u8]) -> Option<i64> {
    let mut value: i64 = 0;
    let mut digits = 0;
    for &b in name {
        match b {
            0 => break,
            b'0'..=b'9' => {
                value = value.checked_mul(10)?.checked_add(i64::from(b - b'0'))?;
                digits += 1;
            }
            _ => return None,
        }
    }
    (digits > 0).then_some(value)
}

/// Human readable thread name. Allocates; not for use at crash time.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn thread_name(thread: ThreadHandle) -> Option<String> {
    let comm = std::fs::read_to_string(format!("/proc/self/task/{}/comm", thread.0)).ok()?;
    let name = comm.trim_end_matches('\n');
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn thread_name(_thread: ThreadHandle) -> Option<String> {
    None
}

/// Delivers `signum` to one thread of this process.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn signal_thread(thread: ThreadHandle, signum: libc::c_int) -> bool {
    // SAFETY: tgkill only targets threads of this process group id.
    unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), thread.0 as libc::pid_t, signum) == 0 }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn signal_thread(thread: ThreadHandle, signum: libc::c_int) -> bool {
    // SAFETY: the handle was produced by `current()` from a live pthread_t.
    unsafe { libc::pthread_kill(thread.0 as usize as libc::pthread_t, signum) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_names() {
        assert_eq!(parse_decimal(b"1234\0"), Some(1234));
        assert_eq!(parse_decimal(b".\0"), None);
        assert_eq!(parse_decimal(b"..\0"), None);
        assert_eq!(parse_decimal(b"\0"), None);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn lists_current_thread() {
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let worker = std::thread::spawn(move || {
            tx.send(ThreadHandle::current()).unwrap();
            done_rx.recv().unwrap();
        });
        let other = rx.recv().unwrap();

        let mut threads = [ThreadHandle::NONE; 256];
        let n = list_threads(&mut threads);
        assert!(n >= 1);
        assert!(threads[..n].contains(&ThreadHandle::current()));
        if cfg!(target_os = "linux") {
            assert!(threads[..n].contains(&other));
        }
        done_tx.send(()).unwrap();
        worker.join().unwrap();
    }

    #[test]
    #[cfg(target_os = "linux")]
    #[cfg_attr(miri, ignore)]
    fn names_come_from_proc() {
        let handle = std::thread::Builder::new()
            .name("recorder-worker".into())
            .spawn(|| thread_name(ThreadHandle::current()))
            .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("recorder-worker"));
    }
}

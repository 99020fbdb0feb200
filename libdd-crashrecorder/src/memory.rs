// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Memory reads that survive bad pointers.
//!
//! Every read goes through the kernel, which reports an unmapped source as an error instead of
//! delivering SIGSEGV. A bad pointer therefore shortens a stack walk instead of faulting a
//! second time inside the crash handler. Nothing here allocates.
//!
//! Pointer chasing must only use [`read_pod`], which succeeds only when every byte of the
//! value was copied. Partial copies ([`copy_max_possible`]) are for dumping raw contents.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};

/// Set once `process_vm_readv` turns out to be unavailable (seccomp, gVisor, old kernels).
static VM_READ_UNAVAILABLE: AtomicBool = AtomicBool::new(false);

const PROBE_CHUNK: usize = 4096;

/// Types that can be rebuilt from any bit pattern.
///
/// # Safety
/// Implementors must be `Copy` plain data without padding-sensitive invariants.
pub unsafe trait Pod: Copy {}

unsafe impl Pod for u8 {}
unsafe impl Pod for u16 {}
unsafe impl Pod for u32 {}
unsafe impl Pod for u64 {}
unsafe impl Pod for usize {}
unsafe impl Pod for i32 {}
unsafe impl Pod for i64 {}
unsafe impl<T: Pod, const N: usize> Pod for [T; N] {}

/// Copies `dst.len()` bytes from `src`. Returns false unless every byte was copied.
pub fn copy_safely(src: usize, dst: &mut [u8]) -> bool {
    if src == 0 || dst.is_empty() {
        return false;
    }
    if src.checked_add(dst.len()).is_none() {
        return false;
    }
    kernel_copy(src, dst) == Some(dst.len())
}

/// Copies as much of `[src, src + dst.len())` as is readable, starting at `src`.
/// Returns the number of leading bytes copied.
pub fn copy_max_possible(src: usize, dst: &mut [u8]) -> usize {
    if !is_memory_readable(src, 1) {
        return 0;
    }
    if copy_safely(src, dst) {
        return dst.len();
    }

    let total = dst.len();
    let mut copied = 0;
    let mut limit = total;
    let mut attempt = total / 2;
    while attempt > 0 && copied < limit {
        let end = (copied + attempt).min(limit);
        let len = end - copied;
        if copy_safely(src + copied, &mut dst[copied..end]) {
            copied = end;
            attempt = ((limit - copied) / 2).max(1);
        } else {
            if len <= 1 {
                break;
            }
            limit = end;
            attempt = len / 2;
        }
    }
    copied
}

pub fn is_memory_readable(addr: usize, len: usize) -> bool {
    if addr == 0 || len == 0 {
        return false;
    }
    let mut scratch = [0u8; PROBE_CHUNK];
    let mut offset = 0;
    while offset < len {
        let chunk = (len - offset).min(PROBE_CHUNK);
        if !copy_safely(addr + offset, &mut scratch[..chunk]) {
            return false;
        }
        offset += chunk;
    }
    true
}

/// Length of the readable prefix of `[addr, addr + try_len)`, checked page by page.
pub fn max_readable_bytes(addr: usize, try_len: usize) -> usize {
    if addr == 0 || try_len == 0 {
        return 0;
    }
    let page = page_size::get();
    let mut readable = 0;
    let mut byte = [0u8; 1];
    let mut cursor = addr;
    while readable < try_len {
        if !copy_safely(cursor, &mut byte) {
            break;
        }
        let to_page_end = page - (cursor % page);
        readable += to_page_end;
        cursor = match cursor.checked_add(to_page_end) {
            Some(next) => next,
            None => break,
        };
    }
    readable.min(try_len)
}

/// Reads a complete value of type `T` at `addr`, or nothing.
pub fn read_pod<T: Pod>(addr: usize) -> Option<T> {
    let mut value = MaybeUninit::<T>::zeroed();
    // SAFETY: the zeroed storage is viewed as bytes; `T: Pod` accepts any bit pattern.
    let bytes = unsafe {
        std::slice::from_raw_parts_mut(value.as_mut_ptr().cast::<u8>(), std::mem::size_of::<T>())
    };
    if copy_safely(addr, bytes) {
        // SAFETY: fully initialised by the copy above.
        Some(unsafe { value.assume_init() })
    } else {
        None
    }
}

fn kernel_copy(src: usize, dst: &mut [u8]) -> Option<usize> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if !VM_READ_UNAVAILABLE.load(Ordering::Relaxed) {
        match vm_read(src, dst) {
            Ok(n) => return Some(n),
            Err(libc::ENOSYS) | Err(libc::EPERM) => {
                VM_READ_UNAVAILABLE.store(true, Ordering::Relaxed);
            }
            Err(_) => return None,
        }
    }
    pipe_copy(src, dst)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn vm_read(src: usize, dst: &mut [u8]) -> Result<usize, libc::c_int> {
    let local = libc::iovec {
        iov_base: dst.as_mut_ptr().cast(),
        iov_len: dst.len(),
    };
    let remote = libc::iovec {
        iov_base: src as *mut libc::c_void,
        iov_len: dst.len(),
    };
    // SAFETY: `local` describes writable memory we own; the kernel validates `remote`.
    let n = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    if n < 0 {
        Err(errno::errno().0)
    } else {
        Ok(n as usize)
    }
}

/// Fallback: push the source through a pipe. `write(2)` answers EFAULT for unmapped memory.
fn pipe_copy(src: usize, dst: &mut [u8]) -> Option<usize> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` has room for the two descriptors.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return None;
    }
    let [read_fd, write_fd] = fds;
    let mut copied = 0;
    while copied < dst.len() {
        let chunk = (dst.len() - copied).min(PROBE_CHUNK);
        // SAFETY: the kernel validates the source range and reports EFAULT.
        let written =
            unsafe { libc::write(write_fd, (src + copied) as *const libc::c_void, chunk) };
        if written <= 0 {
            break;
        }
        let written = written as usize;
        let mut drained = 0;
        while drained < written {
            // SAFETY: destination range lies within `dst`.
            let n = unsafe {
                libc::read(
                    read_fd,
                    dst[copied + drained..].as_mut_ptr().cast(),
                    written - drained,
                )
            };
            if n <= 0 {
                break;
            }
            drained += n as usize;
        }
        copied += drained;
        if drained < written || written < chunk {
            break;
        }
    }
    // SAFETY: both descriptors were created above.
    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
    Some(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn copies_live_memory() {
        let source: [u64; 4] = [1, 2, 3, 0xdead_beef];
        let mut dst = [0u8; 32];
        assert!(copy_safely(source.as_ptr() as usize, &mut dst));
        assert_eq!(read_pod::<u64>(source.as_ptr() as usize + 24), Some(0xdead_beef));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn null_and_unmapped_reads_fail() {
        let mut dst = [0u8; 8];
        assert!(!copy_safely(0, &mut dst));
        assert!(!copy_safely(8, &mut dst));
        assert_eq!(read_pod::<usize>(16), None);
        assert!(!is_memory_readable(0, 1));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn partial_copy_stops_at_guard_page() {
        let page = page_size::get();
        // SAFETY: anonymous mapping of two pages, second one made inaccessible.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page * 2,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        assert_ne!(base, libc::MAP_FAILED);
        let base = base as usize;
        unsafe {
            assert_eq!(libc::mprotect((base + page) as *mut _, page, libc::PROT_NONE), 0);
        }

        let start = base + page - 100;
        let mut dst = vec![0u8; 300];
        assert!(!copy_safely(start, &mut dst));
        assert_eq!(copy_max_possible(start, &mut dst), 100);
        assert_eq!(max_readable_bytes(start, 300), 100);
        assert!(is_memory_readable(start, 100));
        assert!(!is_memory_readable(start, 101));

        unsafe { libc::munmap(base as *mut _, page * 2) };
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn pipe_fallback_matches() {
        let source = *b"fallback path";
        let mut dst = [0u8; 13];
        assert_eq!(pipe_copy(source.as_ptr() as usize, &mut dst), Some(13));
        assert_eq!(&dst, b"fallback path");
        assert_eq!(pipe_copy(8, &mut dst), Some(0));
    }
}

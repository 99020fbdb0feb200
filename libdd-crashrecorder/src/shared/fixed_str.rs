// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// A stack-resident byte string with fixed capacity.
///
/// Writes past the capacity are truncated instead of failing, which makes it usable from
/// `core::fmt` machinery inside a signal handler. One byte is always kept for a trailing NUL
/// so the content can be handed to libc as a C string.
#[derive(Clone, Copy)]
pub struct FixedStr<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> FixedStr<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut s = Self::new();
        s.push_bytes(bytes);
        s
    }

    pub fn clear(&mut self) {
        self.len = 0;
        if N > 0 {
            self.buf[0] = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        if N == 0 {
            return;
        }
        let room = N - 1 - self.len;
        let take = bytes.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&bytes[..take]);
        self.len += take;
        self.buf[self.len] = 0;
    }

    pub fn push_str(&mut self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    /// Appends `value` as exactly `width` lowercase hex digits.
    pub fn push_hex(&mut self, value: u64, width: usize) {
        const DIGITS: &[u8; 16] = b"0123456789abcdef";
        for shift in (0..width).rev() {
            let nibble = if shift < 16 { (value >> (shift * 4)) & 0xf } else { 0 };
            self.push_bytes(&[DIGITS[nibble as usize]]);
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The content followed by its NUL terminator.
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.buf[..(self.len + 1).min(N)]
    }

    /// Lossy view used where a `&str` is required. Truncation may have split a UTF-8
    /// sequence, in which case the valid prefix is returned.
    pub fn as_str(&self) -> &str {
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => s,
            Err(e) => {
                // SAFETY: `valid_up_to` marks the end of a valid UTF-8 prefix.
                unsafe { std::str::from_utf8_unchecked(&self.buf[..e.valid_up_to()]) }
            }
        }
    }

    pub fn as_ptr(&self) -> *const libc::c_char {
        self.buf.as_ptr().cast()
    }

    /// `None` if the content holds an interior NUL.
    pub fn as_c_str(&self) -> Option<&std::ffi::CStr> {
        std::ffi::CStr::from_bytes_with_nul(self.as_bytes_with_nul()).ok()
    }
}

impl<const N: usize> Default for FixedStr<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for FixedStr<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        Ok(())
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::FixedStr;
    use std::fmt::Write;

    #[test]
    fn truncates_and_keeps_nul() {
        let mut s = FixedStr::<6>::new();
        write!(s, "{}", "abcdefgh").unwrap();
        assert_eq!(s.as_str(), "abcde");
        assert_eq!(s.as_bytes_with_nul(), b"abcde\0");
    }

    #[test]
    fn hex_is_zero_padded() {
        let mut s = FixedStr::<32>::new();
        s.push_hex(0xbeef, 16);
        assert_eq!(s.as_str(), "000000000000beef");
    }

    #[test]
    fn split_utf8_is_dropped() {
        let s = FixedStr::<3>::from_bytes("é€".as_bytes());
        assert_eq!(s.as_str(), "é");
    }
}

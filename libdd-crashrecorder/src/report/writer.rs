// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The push-style report writer handed to report sections and to the crash callback.
//!
//! Every method is best effort: a failure is logged with [`crash_log!`] and the rest of the
//! report carries on. Nothing here allocates.

use super::json::{JsonEncoder, JsonError, JsonSink};
use crate::shared::fixed_str::FixedStr;
use crate::shared::log::{crash_log, write_all_raw};
use std::ffi::CStr;
use std::fmt::Write;
use std::os::fd::RawFd;

const FD_BUFFER: usize = 1024;
const FILE_CHUNK: usize = 512;

/// A [`JsonSink`] writing to a descriptor through a fixed buffer.
pub struct FdSink {
    fd: RawFd,
    buffer: [u8; FD_BUFFER],
    len: usize,
}

impl FdSink {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            buffer: [0; FD_BUFFER],
            len: 0,
        }
    }

    fn write_through(&mut self) -> Result<(), JsonError> {
        let len = std::mem::take(&mut self.len);
        if write_all_raw(self.fd, &self.buffer[..len]) {
            Ok(())
        } else {
            Err(JsonError::CannotAddData)
        }
    }
}

impl JsonSink for FdSink {
    fn add_json_data(&mut self, data: &[u8]) -> Result<(), JsonError> {
        if self.len + data.len() > FD_BUFFER {
            self.write_through()?;
        }
        if data.len() > FD_BUFFER {
            return if write_all_raw(self.fd, data) {
                Ok(())
            } else {
                Err(JsonError::CannotAddData)
            };
        }
        self.buffer[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), JsonError> {
        self.write_through()
    }
}

/// Opens a file read-only with a raw `open(2)`. Returns `None` on failure.
pub(crate) fn open_read_only(path: &CStr) -> Option<RawFd> {
    // SAFETY: `path` is NUL terminated.
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        crash_log!(Debug, "could not open {:?}: errno {}", path, errno::errno().0);
        return None;
    }
    Some(fd)
}

pub(crate) fn close_fd(fd: RawFd) {
    // SAFETY: the descriptor is owned by the caller and not used afterwards.
    unsafe { libc::close(fd) };
}

fn read_chunk(fd: RawFd, buf: &mut [u8]) -> usize {
    loop {
        match nix::unistd::read(fd, buf) {
            Ok(n) => return n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                crash_log!(Debug, "read failed: {e}");
                return 0;
            }
        }
    }
}

fn check(what: &str, name: Option<&str>, result: Result<(), JsonError>) {
    if let Err(e) = result {
        crash_log!(Debug, "could not add {what} {:?}: {e}", name.unwrap_or(""));
    }
}

pub struct ReportWriter<'a> {
    encoder: JsonEncoder<'a>,
}

impl<'a> ReportWriter<'a> {
    pub fn new(sink: &'a mut dyn JsonSink, pretty_print: bool) -> Self {
        Self {
            encoder: JsonEncoder::new(sink, pretty_print),
        }
    }

    pub fn add_boolean(&mut self, name: Option<&str>, value: bool) {
        let result = self.encoder.add_boolean(name, value);
        check("boolean", name, result);
    }

    pub fn add_float(&mut self, name: Option<&str>, value: f64) {
        let result = self.encoder.add_float(name, value);
        check("float", name, result);
    }

    pub fn add_integer(&mut self, name: Option<&str>, value: i64) {
        let result = self.encoder.add_integer(name, value);
        check("integer", name, result);
    }

    pub fn add_uinteger(&mut self, name: Option<&str>, value: u64) {
        let result = self.encoder.add_uinteger(name, value);
        check("unsigned integer", name, result);
    }

    pub fn add_null(&mut self, name: Option<&str>) {
        let result = self.encoder.add_null(name);
        check("null", name, result);
    }

    /// `None` becomes `null`.
    pub fn add_string(&mut self, name: Option<&str>, value: Option<&str>) {
        let result = self.encoder.add_string(name, value);
        check("string", name, result);
    }

    pub fn add_string_bytes(&mut self, name: Option<&str>, value: &[u8]) {
        let result = self.encoder.add_string_bytes(name, value);
        check("string", name, result);
    }

    /// Streams a whole text file into one string element.
    pub fn add_text_file(&mut self, name: Option<&str>, path: &CStr) {
        let Some(fd) = open_read_only(path) else {
            return;
        };
        let result = (|| {
            self.encoder.begin_string_element(name)?;
            let mut buf = [0u8; FILE_CHUNK];
            loop {
                let n = read_chunk(fd, &mut buf);
                if n == 0 {
                    break;
                }
                self.encoder.append_string_element(&buf[..n])?;
            }
            self.encoder.end_string_element()
        })();
        close_fd(fd);
        check("text file", name, result);
    }

    /// Streams a text file as an array with one string per line.
    pub fn add_text_file_lines(&mut self, name: Option<&str>, path: &CStr) {
        let Some(fd) = open_read_only(path) else {
            return;
        };
        let result = (|| {
            self.encoder.begin_array(name)?;
            let mut in_line = false;
            let mut buf = [0u8; FILE_CHUNK];
            loop {
                let n = read_chunk(fd, &mut buf);
                if n == 0 {
                    break;
                }
                for piece in buf[..n].split_inclusive(|&c| c == b'\n') {
                    let (text, ends_line) = match piece.strip_suffix(b"\n") {
                        Some(text) => (text, true),
                        None => (piece, false),
                    };
                    if !in_line {
                        self.encoder.begin_string_element(None)?;
                        in_line = true;
                    }
                    self.encoder.append_string_element(text)?;
                    if ends_line {
                        self.encoder.end_string_element()?;
                        in_line = false;
                    }
                }
            }
            if in_line {
                self.encoder.end_string_element()?;
            }
            self.encoder.end_container()
        })();
        close_fd(fd);
        check("text file lines", name, result);
    }

    /// Splices the JSON document stored at `path` in as the element `name`.
    pub fn add_json_file(&mut self, name: Option<&str>, path: &CStr, close_last_container: bool) {
        let Some(fd) = open_read_only(path) else {
            return;
        };
        let result = self.encoder.add_json_from_fd(name, fd, close_last_container);
        close_fd(fd);
        check("JSON file", name, result);
    }

    /// Splices an encoded JSON document in as the element `name`. Invalid input is recorded
    /// as an object carrying the error and the raw data.
    pub fn add_json(&mut self, name: Option<&str>, json: &[u8], close_last_container: bool) {
        let Err(e) = self.encoder.add_json_element(name, json, close_last_container) else {
            return;
        };
        crash_log!(Warn, "could not add JSON element {:?}: {e}", name.unwrap_or(""));
        let mut message = FixedStr::<64>::new();
        let _ = write!(message, "Invalid JSON data: {e}");
        let result = (|| {
            self.encoder.begin_object(name)?;
            self.encoder.add_string(Some("error"), Some(message.as_str()))?;
            self.encoder.add_string_bytes(Some("json_data"), json)?;
            self.encoder.end_container()
        })();
        check("JSON error", name, result);
    }

    pub fn add_data(&mut self, name: Option<&str>, value: &[u8]) {
        let result = self.encoder.add_data(name, value);
        check("data", name, result);
    }

    pub fn begin_data(&mut self, name: Option<&str>) {
        let result = self.encoder.begin_data(name);
        check("data", name, result);
    }

    pub fn append_data(&mut self, value: &[u8]) {
        let result = self.encoder.append_data(value);
        check("data", None, result);
    }

    pub fn end_data(&mut self) {
        let result = self.encoder.end_data();
        check("data", None, result);
    }

    /// Uppercase hyphenated UUID string, `null` when absent.
    pub fn add_uuid(&mut self, name: Option<&str>, value: Option<&[u8; 16]>) {
        match value {
            Some(bytes) => {
                let mut buf = uuid::Uuid::encode_buffer();
                let text = uuid::Uuid::from_bytes(*bytes)
                    .hyphenated()
                    .encode_upper(&mut buf);
                self.add_string(name, Some(&*text));
            }
            None => self.add_null(name),
        }
    }

    pub fn begin_object(&mut self, name: Option<&str>) {
        let result = self.encoder.begin_object(name);
        check("object", name, result);
    }

    pub fn begin_array(&mut self, name: Option<&str>) {
        let result = self.encoder.begin_array(name);
        check("array", name, result);
    }

    pub fn end_container(&mut self) {
        let result = self.encoder.end_container();
        check("container end", None, result);
    }

    pub fn container_level(&self) -> usize {
        self.encoder.container_level()
    }

    /// Closes all open containers.
    pub fn end(&mut self) {
        let result = self.encoder.end_encode();
        check("document end", None, result);
    }

    /// Pushes buffered bytes to the underlying sink.
    pub fn flush(&mut self) {
        let result = self.encoder.flush();
        check("flush", None, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::os::fd::AsRawFd;
    use std::os::unix::ffi::OsStrExt;

    fn c_path(path: &std::path::Path) -> CString {
        CString::new(path.as_os_str().as_bytes()).unwrap()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn fd_sink_writes_everything_on_flush() {
        let mut file = tempfile::tempfile().unwrap();
        {
            let mut sink = FdSink::new(file.as_raw_fd());
            let mut writer = ReportWriter::new(&mut sink, false);
            writer.begin_object(None);
            writer.add_string(Some("big"), Some("x".repeat(5000).as_str()));
            writer.add_integer(Some("n"), 7);
            writer.end();
            writer.flush();
        }
        use std::io::{Read, Seek};
        file.rewind().unwrap();
        let mut text = String::new();
        file.read_to_string(&mut text).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["n"], 7);
        assert_eq!(value["big"].as_str().unwrap().len(), 5000);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn text_files_are_streamed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        std::fs::write(&path, "first line\nsecond \"quoted\"\n\nlast").unwrap();
        let path = c_path(&path);
        let missing = c_path(&dir.path().join("missing.log"));

        let mut out = Vec::new();
        {
            let mut writer = ReportWriter::new(&mut out, false);
            writer.begin_object(None);
            writer.add_text_file(Some("whole"), &path);
            writer.add_text_file_lines(Some("lines"), &path);
            writer.add_text_file_lines(Some("missing"), &missing);
            writer.end();
        }
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["whole"], "first line\nsecond \"quoted\"\n\nlast");
        assert_eq!(
            value["lines"],
            serde_json::json!(["first line", "second \"quoted\"", "", "last"])
        );
        assert!(value.get("missing").is_none());
    }

    #[test]
    fn invalid_json_is_recorded_with_the_error() {
        let mut out = Vec::new();
        {
            let mut writer = ReportWriter::new(&mut out, false);
            writer.begin_object(None);
            writer.add_json(Some("user"), b"not json", true);
            writer.end();
        }
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["user"]["error"], "Invalid JSON data: Invalid character");
        assert_eq!(value["user"]["json_data"], "not json");
    }

    #[test]
    fn uuids_are_uppercase() {
        let mut out = Vec::new();
        {
            let mut writer = ReportWriter::new(&mut out, false);
            writer.begin_array(None);
            writer.add_uuid(None, Some(&[0xab; 16]));
            writer.add_uuid(None, None);
            writer.end();
        }
        assert_eq!(
            String::from_utf8(out).unwrap(),
            r#"["ABABABAB-ABAB-ABAB-ABAB-ABABABABABAB",null]"#
        );
    }
}

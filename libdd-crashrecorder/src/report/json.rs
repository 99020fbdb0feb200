// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming JSON encoder.
//!
//! The encoder keeps no document in memory: every call immediately hands bytes to a
//! [`JsonSink`]. Container nesting is tracked in a fixed array so it can run inside a signal
//! handler.

use crate::shared::constants::JSON_MAX_DEPTH;
use crate::shared::fixed_str::FixedStr;
use std::fmt::Write;

pub use super::json_decode::{
    decode, decode_element, validate, DecodeSource, FdSource, JsonDecodeCallbacks, SliceSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JsonError {
    #[error("Invalid character")]
    InvalidCharacter,
    #[error("Data too long")]
    DataTooLong,
    #[error("Cannot add data")]
    CannotAddData,
    #[error("Incomplete data")]
    Incomplete,
    #[error("Invalid data")]
    InvalidData,
}

impl JsonError {
    /// Stable numeric code. Success is 0.
    pub fn code(self) -> i32 {
        match self {
            JsonError::InvalidCharacter => 1,
            JsonError::DataTooLong => 2,
            JsonError::CannotAddData => 3,
            JsonError::Incomplete => 4,
            JsonError::InvalidData => 5,
        }
    }
}

/// Destination of encoded bytes.
pub trait JsonSink {
    fn add_json_data(&mut self, data: &[u8]) -> Result<(), JsonError>;

    fn flush(&mut self) -> Result<(), JsonError> {
        Ok(())
    }
}

impl JsonSink for Vec<u8> {
    fn add_json_data(&mut self, data: &[u8]) -> Result<(), JsonError> {
        self.extend_from_slice(data);
        Ok(())
    }
}

const INDENT: &[u8] = b"    ";
const ESCAPE_BUFFER: usize = 512;
const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

pub struct JsonEncoder<'a> {
    sink: &'a mut dyn JsonSink,
    pretty_print: bool,
    container_level: usize,
    // Index 0 is the implicit top level, which is neither object nor array.
    is_object: [bool; JSON_MAX_DEPTH + 1],
    container_first_entry: bool,
}

impl<'a> JsonEncoder<'a> {
    pub fn new(sink: &'a mut dyn JsonSink, pretty_print: bool) -> Self {
        Self {
            sink,
            pretty_print,
            container_level: 0,
            is_object: [false; JSON_MAX_DEPTH + 1],
            container_first_entry: true,
        }
    }

    pub fn container_level(&self) -> usize {
        self.container_level
    }

    fn add(&mut self, data: &[u8]) -> Result<(), JsonError> {
        self.sink.add_json_data(data)
    }

    fn indent(&mut self) -> Result<(), JsonError> {
        self.add(b"\n")?;
        for _ in 0..self.container_level {
            self.add(INDENT)?;
        }
        Ok(())
    }

    /// Writes the separator and, inside an object, the member name.
    fn begin_element(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        let in_object = self.is_object[self.container_level];
        if in_object && name.is_none() {
            return Err(JsonError::InvalidData);
        }
        if self.container_first_entry {
            self.container_first_entry = false;
        } else {
            self.add(b",")?;
        }
        if self.pretty_print && self.container_level > 0 {
            self.indent()?;
        }
        if let (true, Some(name)) = (in_object, name) {
            self.add_quoted_escaped(name.as_bytes())?;
            self.add(if self.pretty_print { b": " } else { b":" })?;
        }
        Ok(())
    }

    fn add_escaped(&mut self, value: &[u8]) -> Result<(), JsonError> {
        let mut buf = [0u8; ESCAPE_BUFFER];
        let mut len = 0;
        for &c in value {
            if len + 6 > buf.len() {
                self.add(&buf[..len])?;
                len = 0;
            }
            let escaped: &[u8] = match c {
                b'\\' => b"\\\\",
                b'"' => b"\\\"",
                0x08 => b"\\b",
                0x0c => b"\\f",
                b'\n' => b"\\n",
                b'\r' => b"\\r",
                b'\t' => b"\\t",
                c if c < 0x20 => {
                    buf[len..len + 6].copy_from_slice(&[
                        b'\\',
                        b'u',
                        b'0',
                        b'0',
                        HEX_DIGITS[(c >> 4) as usize],
                        HEX_DIGITS[(c & 0xf) as usize],
                    ]);
                    len += 6;
                    continue;
                }
                _ => {
                    buf[len] = c;
                    len += 1;
                    continue;
                }
            };
            buf[len..len + escaped.len()].copy_from_slice(escaped);
            len += escaped.len();
        }
        self.add(&buf[..len])
    }

    fn add_quoted_escaped(&mut self, value: &[u8]) -> Result<(), JsonError> {
        self.add(b"\"")?;
        self.add_escaped(value)?;
        self.add(b"\"")
    }

    pub fn add_boolean(&mut self, name: Option<&str>, value: bool) -> Result<(), JsonError> {
        self.begin_element(name)?;
        self.add(if value { b"true" } else { b"false" })
    }

    pub fn add_integer(&mut self, name: Option<&str>, value: i64) -> Result<(), JsonError> {
        self.begin_element(name)?;
        let mut buf = FixedStr::<32>::new();
        let _ = write!(buf, "{value}");
        self.add(buf.as_bytes())
    }

    pub fn add_uinteger(&mut self, name: Option<&str>, value: u64) -> Result<(), JsonError> {
        self.begin_element(name)?;
        let mut buf = FixedStr::<32>::new();
        let _ = write!(buf, "{value}");
        self.add(buf.as_bytes())
    }

    /// Shortest form that reads back as the same value. Non-finite values become `null`.
    pub fn add_float(&mut self, name: Option<&str>, value: f64) -> Result<(), JsonError> {
        self.begin_element(name)?;
        let mut buf = FixedStr::<64>::new();
        format_float(value, &mut buf);
        self.add(buf.as_bytes())
    }

    pub fn add_null(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.begin_element(name)?;
        self.add(b"null")
    }

    /// `None` is written as `null`.
    pub fn add_string(&mut self, name: Option<&str>, value: Option<&str>) -> Result<(), JsonError> {
        match value {
            Some(value) => self.add_string_bytes(name, value.as_bytes()),
            None => self.add_null(name),
        }
    }

    pub fn add_string_bytes(&mut self, name: Option<&str>, value: &[u8]) -> Result<(), JsonError> {
        self.begin_element(name)?;
        self.add_quoted_escaped(value)
    }

    /// Starts a string whose content arrives in pieces through
    /// [`JsonEncoder::append_string_element`].
    pub fn begin_string_element(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.begin_element(name)?;
        self.add(b"\"")
    }

    pub fn append_string_element(&mut self, value: &[u8]) -> Result<(), JsonError> {
        self.add_escaped(value)
    }

    pub fn end_string_element(&mut self) -> Result<(), JsonError> {
        self.add(b"\"")
    }

    /// Binary data, written as a lowercase hex string.
    pub fn add_data(&mut self, name: Option<&str>, value: &[u8]) -> Result<(), JsonError> {
        self.begin_data(name)?;
        self.append_data(value)?;
        self.end_data()
    }

    pub fn begin_data(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.begin_string_element(name)
    }

    pub fn append_data(&mut self, value: &[u8]) -> Result<(), JsonError> {
        let mut buf = [0u8; ESCAPE_BUFFER];
        for chunk in value.chunks(ESCAPE_BUFFER / 2) {
            for (i, byte) in chunk.iter().enumerate() {
                buf[i * 2] = HEX_DIGITS[(byte >> 4) as usize];
                buf[i * 2 + 1] = HEX_DIGITS[(byte & 0xf) as usize];
            }
            self.add(&buf[..chunk.len() * 2])?;
        }
        Ok(())
    }

    pub fn end_data(&mut self) -> Result<(), JsonError> {
        self.end_string_element()
    }

    /// Inserts already encoded JSON verbatim.
    pub fn add_raw_json(&mut self, name: Option<&str>, json: &[u8]) -> Result<(), JsonError> {
        self.begin_element(name)?;
        self.add(json)
    }

    fn begin_container(&mut self, name: Option<&str>, is_object: bool) -> Result<(), JsonError> {
        if self.container_level >= JSON_MAX_DEPTH {
            return Err(JsonError::DataTooLong);
        }
        self.begin_element(name)?;
        self.add(if is_object { b"{" } else { b"[" })?;
        self.container_level += 1;
        self.is_object[self.container_level] = is_object;
        self.container_first_entry = true;
        Ok(())
    }

    pub fn begin_object(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.begin_container(name, true)
    }

    pub fn begin_array(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.begin_container(name, false)
    }

    /// Closes the innermost container. Does nothing when no container is open.
    pub fn end_container(&mut self) -> Result<(), JsonError> {
        if self.container_level == 0 {
            return Ok(());
        }
        let is_object = self.is_object[self.container_level];
        self.container_level -= 1;
        if self.pretty_print && !self.container_first_entry {
            self.indent()?;
        }
        self.container_first_entry = false;
        self.add(if is_object { b"}" } else { b"]" })
    }

    pub fn flush(&mut self) -> Result<(), JsonError> {
        self.sink.flush()
    }

    /// Closes every open container.
    pub fn end_encode(&mut self) -> Result<(), JsonError> {
        while self.container_level > 0 {
            self.end_container()?;
        }
        Ok(())
    }
}

/// Shortest text that parses back to the same value. Non-finite values have no JSON form and
/// are written as `null`. Formats on the stack.
fn format_float<const N: usize>(value: f64, out: &mut FixedStr<N>) {
    if !value.is_finite() {
        out.push_str("null");
        return;
    }
    let mut buffer = ryu::Buffer::new();
    out.push_str(buffer.format_finite(value));
}

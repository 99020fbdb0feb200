// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event based JSON decoder and the splicing helpers built on it.
//!
//! The decoder reports every value through [`JsonDecodeCallbacks`] and only keeps one member
//! name and one string in scratch buffers. Splicing uses fixed stack buffers, and reading from a
//! file descriptor goes through a fixed refill buffer, so a previous report can be re-embedded
//! from inside a crash handler. [`decode`] sizes its buffer to the input instead.

use super::json::{JsonEncoder, JsonError};
use crate::shared::constants::{JSON_MAX_DEPTH, JSON_MAX_NAME};
use crate::shared::log::crash_log;
use std::os::fd::RawFd;

/// Receives decoded values in document order. `name` is the member name inside objects and
/// `None` inside arrays.
pub trait JsonDecodeCallbacks {
    fn on_boolean(&mut self, name: Option<&str>, value: bool) -> Result<(), JsonError>;
    fn on_integer(&mut self, name: Option<&str>, value: i64) -> Result<(), JsonError>;
    /// Integers above `i64::MAX`.
    fn on_unsigned_integer(&mut self, name: Option<&str>, value: u64) -> Result<(), JsonError> {
        self.on_float(name, value as f64)
    }
    fn on_float(&mut self, name: Option<&str>, value: f64) -> Result<(), JsonError>;
    fn on_null(&mut self, name: Option<&str>) -> Result<(), JsonError>;
    fn on_string(&mut self, name: Option<&str>, value: &str) -> Result<(), JsonError>;
    fn on_begin_object(&mut self, name: Option<&str>) -> Result<(), JsonError>;
    fn on_begin_array(&mut self, name: Option<&str>) -> Result<(), JsonError>;
    fn on_end_container(&mut self) -> Result<(), JsonError>;
    fn on_end_data(&mut self) -> Result<(), JsonError> {
        Ok(())
    }
}

/// Byte input for the decoder.
pub trait DecodeSource {
    /// The next byte without consuming it. `None` at end of input.
    fn peek(&mut self) -> Option<u8>;
    fn bump(&mut self);
}

pub struct SliceSource<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

impl DecodeSource for SliceSource<'_> {
    fn peek(&mut self) -> Option<u8> {
        self.data.get(self.position).copied()
    }

    fn bump(&mut self) {
        self.position += 1;
    }
}

const FILE_BUFFER: usize = 1000;

/// Reads a descriptor through a fixed buffer. A read error is treated as end of input.
pub struct FdSource {
    fd: RawFd,
    buffer: [u8; FILE_BUFFER],
    start: usize,
    end: usize,
    eof: bool,
}

impl FdSource {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            buffer: [0; FILE_BUFFER],
            start: 0,
            end: 0,
            eof: false,
        }
    }

    fn refill(&mut self) {
        loop {
            match nix::unistd::read(self.fd, &mut self.buffer) {
                Ok(0) => self.eof = true,
                Ok(n) => {
                    self.start = 0;
                    self.end = n;
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    crash_log!(Error, "reading JSON source: {e}");
                    self.eof = true;
                }
            }
            return;
        }
    }
}

impl DecodeSource for FdSource {
    fn peek(&mut self) -> Option<u8> {
        if self.start == self.end && !self.eof {
            self.refill();
        }
        (self.start < self.end).then(|| self.buffer[self.start])
    }

    fn bump(&mut self) {
        if self.start < self.end {
            self.start += 1;
        }
    }
}

#[derive(Clone, Copy)]
enum ElementName<'n> {
    None,
    Given(&'n str),
    Member,
}

struct Decoder<'s, 'c, 'b, S: DecodeSource, C: JsonDecodeCallbacks + ?Sized> {
    source: &'s mut S,
    callbacks: &'c mut C,
    name: [u8; JSON_MAX_NAME],
    name_len: usize,
    /// Scratch space for string and number values; bounds their length.
    string: &'b mut [u8],
    depth: usize,
}

fn is_whitespace(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\n' | b'\r')
}

fn is_float_char(c: u8) -> bool {
    matches!(c, b'.' | b'e' | b'E' | b'+' | b'-' | b'0'..=b'9')
}

fn skip_whitespace<S: DecodeSource>(source: &mut S) {
    while source.peek().is_some_and(is_whitespace) {
        source.bump();
    }
}

fn expect_literal<S: DecodeSource>(source: &mut S, literal: &[u8]) -> Result<(), JsonError> {
    for &expected in literal {
        match source.peek() {
            None => return Err(JsonError::Incomplete),
            Some(c) if c == expected => source.bump(),
            Some(_) => return Err(JsonError::InvalidCharacter),
        }
    }
    Ok(())
}

fn hex_value(c: u8) -> Result<u32, JsonError> {
    (c as char)
        .to_digit(16)
        .ok_or(JsonError::InvalidCharacter)
}

fn read_hex4<S: DecodeSource>(source: &mut S) -> Result<u32, JsonError> {
    let mut value = 0;
    for _ in 0..4 {
        let c = source.peek().ok_or(JsonError::Incomplete)?;
        value = (value << 4) | hex_value(c)?;
        source.bump();
    }
    Ok(value)
}

fn push_bytes(dst: &mut [u8], len: &mut usize, bytes: &[u8]) -> Result<(), JsonError> {
    let end = *len + bytes.len();
    if end > dst.len() {
        return Err(JsonError::DataTooLong);
    }
    dst[*len..end].copy_from_slice(bytes);
    *len = end;
    Ok(())
}

/// Decodes a quoted string into `dst` and returns its length in bytes.
fn decode_string<S: DecodeSource>(source: &mut S, dst: &mut [u8]) -> Result<usize, JsonError> {
    if source.peek() != Some(b'"') {
        return Err(JsonError::InvalidCharacter);
    }
    source.bump();
    let mut len = 0;
    loop {
        let c = source.peek().ok_or(JsonError::Incomplete)?;
        source.bump();
        match c {
            b'"' => break,
            b'\\' => {
                let escape = source.peek().ok_or(JsonError::Incomplete)?;
                source.bump();
                let simple = match escape {
                    b'"' => b'"',
                    b'\\' => b'\\',
                    b'/' => b'/',
                    b'b' => 0x08,
                    b'f' => 0x0c,
                    b'n' => b'\n',
                    b'r' => b'\r',
                    b't' => b'\t',
                    b'u' => {
                        let mut code = read_hex4(source)?;
                        if (0xd800..0xdc00).contains(&code) {
                            expect_literal(source, b"\\u")?;
                            let low = read_hex4(source)?;
                            if !(0xdc00..0xe000).contains(&low) {
                                return Err(JsonError::InvalidCharacter);
                            }
                            code = 0x10000 + ((code - 0xd800) << 10) + (low - 0xdc00);
                        }
                        let ch = char::from_u32(code).ok_or(JsonError::InvalidCharacter)?;
                        let mut utf8 = [0u8; 4];
                        push_bytes(dst, &mut len, ch.encode_utf8(&mut utf8).as_bytes())?;
                        continue;
                    }
                    _ => return Err(JsonError::InvalidCharacter),
                };
                push_bytes(dst, &mut len, &[simple])?;
            }
            c => push_bytes(dst, &mut len, &[c])?,
        }
    }
    Ok(len)
}

fn as_str(bytes: &[u8]) -> Result<&str, JsonError> {
    std::str::from_utf8(bytes).map_err(|_| JsonError::InvalidCharacter)
}

impl<S: DecodeSource, C: JsonDecodeCallbacks + ?Sized> Decoder<'_, '_, '_, S, C> {
    fn decode_element(&mut self, name: ElementName<'_>) -> Result<(), JsonError> {
        skip_whitespace(self.source);
        let c = self.source.peek().ok_or(JsonError::Incomplete)?;

        // Resolves the element name. Only valid until the next member name is decoded.
        macro_rules! name {
            () => {
                match name {
                    ElementName::None => None,
                    ElementName::Given(n) => Some(n),
                    ElementName::Member => Some(as_str(&self.name[..self.name_len])?),
                }
            };
        }

        match c {
            b'[' | b'{' => {
                if self.depth >= JSON_MAX_DEPTH {
                    return Err(JsonError::DataTooLong);
                }
                self.source.bump();
                let is_object = c == b'{';
                if is_object {
                    self.callbacks.on_begin_object(name!())?;
                } else {
                    self.callbacks.on_begin_array(name!())?;
                }
                self.depth += 1;
                self.decode_container_body(is_object)?;
                self.depth -= 1;
                self.callbacks.on_end_container()
            }
            b'"' => {
                let len = decode_string(self.source, self.string)?;
                let value = as_str(&self.string[..len])?;
                self.callbacks.on_string(name!(), value)
            }
            b't' => {
                expect_literal(self.source, b"true")?;
                self.callbacks.on_boolean(name!(), true)
            }
            b'f' => {
                expect_literal(self.source, b"false")?;
                self.callbacks.on_boolean(name!(), false)
            }
            b'n' => {
                expect_literal(self.source, b"null")?;
                self.callbacks.on_null(name!())
            }
            b'-' | b'0'..=b'9' => self.decode_number(name),
            _ => {
                crash_log!(Debug, "invalid JSON character {c:#04x}");
                Err(JsonError::InvalidCharacter)
            }
        }
    }

    /// Consumes members up to and including the closing bracket.
    fn decode_container_body(&mut self, is_object: bool) -> Result<(), JsonError> {
        let close = if is_object { b'}' } else { b']' };
        let mut first = true;
        loop {
            skip_whitespace(self.source);
            let c = self.source.peek().ok_or(JsonError::Incomplete)?;
            if c == close {
                self.source.bump();
                return Ok(());
            }
            if !first {
                if c != b',' {
                    return Err(JsonError::InvalidCharacter);
                }
                self.source.bump();
                skip_whitespace(self.source);
            }
            first = false;
            if is_object {
                self.name_len = decode_string(self.source, &mut self.name)?;
                skip_whitespace(self.source);
                match self.source.peek() {
                    None => return Err(JsonError::Incomplete),
                    Some(b':') => self.source.bump(),
                    Some(_) => return Err(JsonError::InvalidCharacter),
                }
                self.decode_element(ElementName::Member)?;
            } else {
                self.decode_element(ElementName::None)?;
            }
        }
    }

    fn decode_number(&mut self, name: ElementName<'_>) -> Result<(), JsonError> {
        let mut len = 0;
        let mut is_float = false;
        while let Some(c) = self.source.peek() {
            if !is_float_char(c) || (len > 0 && c == b'-' && !matches!(self.string[len - 1], b'e' | b'E')) {
                break;
            }
            if len >= self.string.len() {
                return Err(JsonError::DataTooLong);
            }
            is_float |= !c.is_ascii_digit() && !(len == 0 && c == b'-');
            self.string[len] = c;
            len += 1;
            self.source.bump();
        }
        let text = as_str(&self.string[..len])?;
        let resolved = match name {
            ElementName::None => None,
            ElementName::Given(n) => Some(n),
            ElementName::Member => Some(as_str(&self.name[..self.name_len])?),
        };
        if !is_float {
            let (negative, digits) = match text.strip_prefix('-') {
                Some(digits) => (true, digits),
                None => (false, text),
            };
            if digits.is_empty() {
                return Err(JsonError::InvalidCharacter);
            }
            if let Ok(magnitude) = digits.parse::<u64>() {
                if !negative {
                    return match i64::try_from(magnitude) {
                        Ok(value) => self.callbacks.on_integer(resolved, value),
                        Err(_) => self.callbacks.on_unsigned_integer(resolved, magnitude),
                    };
                }
                if magnitude <= i64::MAX as u64 + 1 {
                    return self
                        .callbacks
                        .on_integer(resolved, (magnitude as i64).wrapping_neg());
                }
            }
        }
        let value = text
            .parse::<f64>()
            .map_err(|_| JsonError::InvalidCharacter)?;
        self.callbacks.on_float(resolved, value)
    }
}

fn run<S: DecodeSource, C: JsonDecodeCallbacks + ?Sized>(
    source: &mut S,
    callbacks: &mut C,
    name: Option<&str>,
    string: &mut [u8],
) -> Result<(), JsonError> {
    let mut decoder = Decoder {
        source,
        callbacks,
        name: [0; JSON_MAX_NAME],
        name_len: 0,
        string,
        depth: 0,
    };
    decoder.decode_element(name.map_or(ElementName::None, ElementName::Given))
}

const MEMORY_STRING_BUFFER: usize = 5000;
const FILE_STRING_BUFFER: usize = 500;

/// Decodes one complete document. Anything but whitespace after it is an error.
///
/// Allocates scratch space as large as `data`, so no string in the document is too long.
/// Not for use in crash context.
pub fn decode<C: JsonDecodeCallbacks + ?Sized>(
    data: &[u8],
    callbacks: &mut C,
) -> Result<(), JsonError> {
    decode_document(data, callbacks, &mut vec![0u8; data.len()])
}

fn decode_document<C: JsonDecodeCallbacks + ?Sized>(
    data: &[u8],
    callbacks: &mut C,
    string: &mut [u8],
) -> Result<(), JsonError> {
    let mut source = SliceSource::new(data);
    run(&mut source, callbacks, None, string)?;
    skip_whitespace(&mut source);
    if source.peek().is_some() {
        return Err(JsonError::InvalidCharacter);
    }
    callbacks.on_end_data()
}

/// Decodes the first element of `source`, reporting its name as `name`.
pub fn decode_element<S: DecodeSource, C: JsonDecodeCallbacks + ?Sized>(
    source: &mut S,
    name: Option<&str>,
    callbacks: &mut C,
) -> Result<(), JsonError> {
    run(source, callbacks, name, &mut [0u8; FILE_STRING_BUFFER])
}

struct Validator;

impl JsonDecodeCallbacks for Validator {
    fn on_boolean(&mut self, _: Option<&str>, _: bool) -> Result<(), JsonError> {
        Ok(())
    }
    fn on_integer(&mut self, _: Option<&str>, _: i64) -> Result<(), JsonError> {
        Ok(())
    }
    fn on_float(&mut self, _: Option<&str>, _: f64) -> Result<(), JsonError> {
        Ok(())
    }
    fn on_null(&mut self, _: Option<&str>) -> Result<(), JsonError> {
        Ok(())
    }
    fn on_string(&mut self, _: Option<&str>, _: &str) -> Result<(), JsonError> {
        Ok(())
    }
    fn on_begin_object(&mut self, _: Option<&str>) -> Result<(), JsonError> {
        Ok(())
    }
    fn on_begin_array(&mut self, _: Option<&str>) -> Result<(), JsonError> {
        Ok(())
    }
    fn on_end_container(&mut self) -> Result<(), JsonError> {
        Ok(())
    }
}

/// Checks that `data` is one well formed JSON document that can later be spliced into a report
/// from crash context, which bounds the length of its strings.
pub fn validate(data: &[u8]) -> Result<(), JsonError> {
    decode_document(data, &mut Validator, &mut [0u8; MEMORY_STRING_BUFFER])
}

/// Re-encodes decoded values into an encoder.
///
/// When `close_last_container` is false the outermost spliced container is left open so the
/// caller can keep appending members to it. Containers nested deeper are always closed.
struct Splicer<'e, 'a> {
    encoder: &'e mut JsonEncoder<'a>,
    base_level: usize,
    close_last_container: bool,
}

impl JsonDecodeCallbacks for Splicer<'_, '_> {
    fn on_boolean(&mut self, name: Option<&str>, value: bool) -> Result<(), JsonError> {
        self.encoder.add_boolean(name, value)
    }
    fn on_integer(&mut self, name: Option<&str>, value: i64) -> Result<(), JsonError> {
        self.encoder.add_integer(name, value)
    }
    fn on_unsigned_integer(&mut self, name: Option<&str>, value: u64) -> Result<(), JsonError> {
        self.encoder.add_uinteger(name, value)
    }
    fn on_float(&mut self, name: Option<&str>, value: f64) -> Result<(), JsonError> {
        self.encoder.add_float(name, value)
    }
    fn on_null(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.encoder.add_null(name)
    }
    fn on_string(&mut self, name: Option<&str>, value: &str) -> Result<(), JsonError> {
        self.encoder.add_string(name, Some(value))
    }
    fn on_begin_object(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.encoder.begin_object(name)
    }
    fn on_begin_array(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.encoder.begin_array(name)
    }
    fn on_end_container(&mut self) -> Result<(), JsonError> {
        if self.close_last_container || self.encoder.container_level() > self.base_level + 1 {
            self.encoder.end_container()?;
        }
        Ok(())
    }
}

impl JsonEncoder<'_> {
    fn splice<S: DecodeSource>(
        &mut self,
        name: Option<&str>,
        source: &mut S,
        close_last_container: bool,
        string_in_memory: bool,
    ) -> Result<(), JsonError> {
        let base_level = self.container_level();
        let mut splicer = Splicer {
            encoder: self,
            base_level,
            close_last_container,
        };
        let result = if string_in_memory {
            run(source, &mut splicer, name, &mut [0u8; MEMORY_STRING_BUFFER])
        } else {
            run(source, &mut splicer, name, &mut [0u8; FILE_STRING_BUFFER])
        };
        // A truncated document still leaves balanced output behind.
        while close_last_container && self.container_level() > base_level {
            self.end_container()?;
        }
        result
    }

    /// Embeds an already encoded JSON document as the element `name`.
    pub fn add_json_element(
        &mut self,
        name: Option<&str>,
        json: &[u8],
        close_last_container: bool,
    ) -> Result<(), JsonError> {
        self.splice(name, &mut SliceSource::new(json), close_last_container, true)
    }

    /// Like [`JsonEncoder::add_json_element`], reading the document from a descriptor.
    pub fn add_json_from_fd(
        &mut self,
        name: Option<&str>,
        fd: RawFd,
        close_last_container: bool,
    ) -> Result<(), JsonError> {
        self.splice(name, &mut FdSource::new(fd), close_last_container, false)
    }
}

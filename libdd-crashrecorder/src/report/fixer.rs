// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Post-processing of stored reports, run outside of crash context.
//!
//! The writer records what is cheap and safe at crash time: epoch seconds instead of formatted
//! dates, raw linker names instead of demangled ones. [`fixup`] streams a report through the
//! decoder and re-encodes it, rewriting those fields by their path in the document.

use super::json::{decode, JsonDecodeCallbacks, JsonEncoder, JsonError};
use chrono::{DateTime, SecondsFormat};
use symbolic_common::Name;
use symbolic_demangle::{Demangle, DemangleOptions};

#[derive(Debug, thiserror::Error)]
pub enum FixupError {
    #[error("Report is not valid JSON: {0}")]
    Decode(#[from] JsonError),
    #[error("Report is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// Container paths, below the unnamed top level, whose `timestamp` is rewritten.
const TIMESTAMP_PARENTS: &[&[&str]] = &[&["report"], &["recrash_report", "report"]];

const ARRAY_ELEMENT: &str = "";

/// Returns a copy of `report` with timestamps formatted as RFC 3339 and symbol names demangled.
/// Nothing is returned unless the whole document decodes.
pub fn fixup(report: &[u8]) -> Result<Vec<u8>, FixupError> {
    std::str::from_utf8(report)?;
    let mut out = Vec::with_capacity(report.len() + report.len() / 4);
    {
        let mut fixer = Fixer {
            encoder: JsonEncoder::new(&mut out, false),
            path: Vec::new(),
        };
        decode(report, &mut fixer)?;
    }
    Ok(out)
}

struct Fixer<'a> {
    encoder: JsonEncoder<'a>,
    // Names of the open containers; the top level is never pushed.
    path: Vec<String>,
}

impl Fixer<'_> {
    fn is_timestamp(&self, name: Option<&str>) -> bool {
        name == Some("timestamp")
            && TIMESTAMP_PARENTS
                .iter()
                .any(|parent| self.path.iter().map(String::as_str).eq(parent.iter().copied()))
    }

    fn is_backtrace_symbol(&self, name: Option<&str>) -> bool {
        name == Some("symbol_name")
            && matches!(
                self.path.as_slice(),
                [.., backtrace, contents, element]
                    if backtrace == "backtrace" && contents == "contents" && element == ARRAY_ELEMENT
            )
    }

    fn add_timestamp(&mut self, name: Option<&str>, seconds: i64) -> Result<(), JsonError> {
        match DateTime::from_timestamp(seconds, 0) {
            Some(date) => {
                let formatted = date.to_rfc3339_opts(SecondsFormat::Secs, true);
                self.encoder.add_string(name, Some(formatted.as_str()))
            }
            None => {
                tracing::debug!(seconds, "Timestamp out of range, left as is");
                self.encoder.add_integer(name, seconds)
            }
        }
    }

    fn begin(&mut self, name: Option<&str>) {
        // The top level container is not part of the path.
        if self.encoder.container_level() > 1 {
            self.path.push(name.unwrap_or(ARRAY_ELEMENT).to_owned());
        }
    }
}

impl JsonDecodeCallbacks for Fixer<'_> {
    fn on_boolean(&mut self, name: Option<&str>, value: bool) -> Result<(), JsonError> {
        self.encoder.add_boolean(name, value)
    }

    fn on_integer(&mut self, name: Option<&str>, value: i64) -> Result<(), JsonError> {
        if self.is_timestamp(name) {
            return self.add_timestamp(name, value);
        }
        self.encoder.add_integer(name, value)
    }

    fn on_unsigned_integer(&mut self, name: Option<&str>, value: u64) -> Result<(), JsonError> {
        if self.is_timestamp(name) {
            if let Ok(seconds) = i64::try_from(value) {
                return self.add_timestamp(name, seconds);
            }
        }
        self.encoder.add_uinteger(name, value)
    }

    fn on_float(&mut self, name: Option<&str>, value: f64) -> Result<(), JsonError> {
        self.encoder.add_float(name, value)
    }

    fn on_null(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.encoder.add_null(name)
    }

    fn on_string(&mut self, name: Option<&str>, value: &str) -> Result<(), JsonError> {
        if self.is_backtrace_symbol(name) {
            if let Some(demangled) = Name::from(value).demangle(DemangleOptions::name_only()) {
                return self.encoder.add_string(name, Some(demangled.as_str()));
            }
        }
        self.encoder.add_string(name, Some(value))
    }

    fn on_begin_object(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.encoder.begin_object(name)?;
        self.begin(name);
        Ok(())
    }

    fn on_begin_array(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.encoder.begin_array(name)?;
        self.begin(name);
        Ok(())
    }

    fn on_end_container(&mut self) -> Result<(), JsonError> {
        self.path.pop();
        self.encoder.end_container()
    }

    fn on_end_data(&mut self) -> Result<(), JsonError> {
        self.encoder.end_encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn fixed(input: &str) -> Value {
        serde_json::from_slice(&fixup(input.as_bytes()).unwrap()).unwrap()
    }

    #[test]
    fn formats_report_timestamps() {
        let value = fixed(
            r#"{"report":{"timestamp":0,"id":"a"},"recrash_report":{"report":{"timestamp":1700000000}}}"#,
        );
        assert_eq!(value["report"]["timestamp"], "1970-01-01T00:00:00Z");
        assert_eq!(
            value["recrash_report"]["report"]["timestamp"],
            "2023-11-14T22:13:20Z"
        );
        assert_eq!(value["report"]["id"], "a");
    }

    #[test]
    fn other_integers_pass_through() {
        let value = fixed(
            r#"{"timestamp":5,"crash":{"timestamp":6,"threads":[{"index":18446744073709551615}]},"system":{"report":{"timestamp":7}}}"#,
        );
        assert_eq!(
            value,
            json!({
                "timestamp": 5,
                "crash": {"timestamp": 6, "threads": [{"index": 18446744073709551615u64}]},
                "system": {"report": {"timestamp": 7}},
            })
        );
    }

    #[test]
    fn demangles_backtrace_symbols_only() {
        let value = fixed(
            r#"{"crash":{"threads":[{"backtrace":{"contents":[{"symbol_name":"_ZN3foo3barEv"},{"symbol_name":"main"}]}}]},"user":{"symbol_name":"_ZN3foo3barEv"}}"#,
        );
        let contents = &value["crash"]["threads"][0]["backtrace"]["contents"];
        assert_eq!(contents[0]["symbol_name"], "foo::bar");
        assert_eq!(contents[1]["symbol_name"], "main");
        assert_eq!(value["user"]["symbol_name"], "_ZN3foo3barEv");
    }

    #[test]
    fn long_strings_survive() {
        let reason = "x".repeat(20_000);
        let value = fixed(&format!(
            r#"{{"report":{{"timestamp":0}},"crash":{{"error":{{"reason":"{reason}"}}}}}}"#
        ));
        assert_eq!(value["crash"]["error"]["reason"], reason.as_str());
        assert_eq!(value["report"]["timestamp"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn fails_closed_on_truncated_reports() {
        let err = fixup(br#"{"report":{"timestamp":0"#).unwrap_err();
        assert!(matches!(err, FixupError::Decode(JsonError::Incomplete)));
        assert!(fixup(b"{\"a\":\xff}").is_err());
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Report serialisation: the streaming JSON codec, the crash-time report writer and the
//! post-processing fixer.

pub(crate) mod crash_report;
pub mod fixer;
pub mod json;
mod json_decode;
pub mod writer;

pub use crash_report::CrashNotifyCallback;

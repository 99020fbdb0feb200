// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Constants, configuration and crash-safe logging shared by every part of the recorder.

pub mod configuration;
pub mod constants;
pub(crate) mod log;
pub mod fixed_str;

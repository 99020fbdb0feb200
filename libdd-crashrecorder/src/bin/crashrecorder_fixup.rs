// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Prints a stored crash report with its deferred fields filled in.

#[cfg(not(unix))]
fn main() {}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    use anyhow::Context;
    use std::io::Write;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let path = std::env::args_os()
        .nth(1)
        .context("usage: crashrecorder-fixup <report-file>")?;
    let raw = std::fs::read(&path).with_context(|| format!("reading {}", path.to_string_lossy()))?;
    tracing::debug!(bytes = raw.len(), "Read report");
    let fixed = libdd_crashrecorder::fixup(&raw)
        .with_context(|| format!("fixing {}", path.to_string_lossy()))?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&fixed)?;
    stdout.write_all(b"\n")?;
    Ok(())
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::backtrace::BacktraceWalker;
use crate::shared::constants::MAX_SELF_THREAD_FRAMES;

/// Owns a backtrace of the capturing thread and walks it like [`BacktraceWalker`].
#[derive(Clone)]
pub(super) struct SelfThreadWalker {
    addresses: [usize; MAX_SELF_THREAD_FRAMES],
    len: usize,
    skip: usize,
    index: usize,
}

impl SelfThreadWalker {
    #[inline(never)]
    pub(super) fn capture(skip: usize) -> Self {
        let mut addresses = [0usize; MAX_SELF_THREAD_FRAMES];
        let mut len = 0;
        // SAFETY: no other unwinding runs on this thread while tracing; the callback stores
        // plain integers into a stack array.
        unsafe {
            ::backtrace::trace_unsynchronized(|frame| {
                addresses[len] = frame.ip() as usize;
                len += 1;
                len < MAX_SELF_THREAD_FRAMES
            });
        }
        // This function and `StackCursor::with_self_thread` are never part of the answer.
        let skip = (skip + 2).min(len);
        Self {
            addresses,
            len,
            skip,
            index: skip,
        }
    }

    pub(super) fn reset(&mut self) {
        self.index = self.skip;
    }

    pub(super) fn skipped(&self) -> usize {
        self.skip
    }

    pub(super) fn next(&mut self) -> Option<usize> {
        let mut walker = BacktraceWalker::new(&self.addresses[..self.len], self.index);
        let address = walker.next()?;
        self.index += 1;
        Some(address)
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Walks a borrowed array of addresses.
#[derive(Clone)]
pub(super) struct BacktraceWalker<'a> {
    addresses: &'a [usize],
    skip: usize,
    index: usize,
}

impl<'a> BacktraceWalker<'a> {
    pub(super) fn new(addresses: &'a [usize], skip: usize) -> Self {
        let skip = skip.min(addresses.len());
        Self {
            addresses,
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
        let address = *self.addresses.get(self.index)?;
        // Some unwinders terminate the list with a bogus address of 1.
        if address <= 1 {
            return None;
        }
        self.index += 1;
        Some(address)
    }
}

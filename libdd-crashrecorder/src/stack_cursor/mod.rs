// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stack walking that never touches the heap.
//!
//! A [`StackCursor`] yields one return address per [`StackCursor::advance`]. The walking
//! strategy is an enum stored inline, so a cursor can be built inside a signal handler.

mod backtrace;
mod machine_context;
mod self_thread;

use crate::machine_context::{CpuRegisters, MachineContext, NativeRegisters};
use crate::shared::log::crash_log;
use crate::symbolicator::{SymbolInfo, Symbolicator};
use self::backtrace::BacktraceWalker;
use self::machine_context::FramePointerWalker;
use self::self_thread::SelfThreadWalker;

/// The frame the cursor currently points at.
#[derive(Debug, Clone, Copy, Default)]
pub struct StackEntry {
    pub address: usize,
    pub symbol: SymbolInfo,
}

#[derive(Debug, Clone, Copy, Default)]
struct CursorState {
    entry: StackEntry,
    depth: usize,
    has_given_up: bool,
}

#[derive(Clone)]
enum Walker<'a> {
    Unset,
    Backtrace(BacktraceWalker<'a>),
    MachineContext(FramePointerWalker<'a>),
    SelfThread(SelfThreadWalker),
}

#[derive(Clone)]
pub struct StackCursor<'a> {
    state: CursorState,
    max_depth: usize,
    walker: Walker<'a>,
    symbolicator: Option<&'a Symbolicator>,
}

impl<'a> StackCursor<'a> {
    /// A cursor without a walking strategy. It is safe to use and yields nothing.
    pub fn new(max_depth: usize) -> Self {
        Self {
            state: CursorState::default(),
            max_depth,
            walker: Walker::Unset,
            symbolicator: None,
        }
    }

    /// Walks a list of addresses captured earlier, skipping the first `skip` entries.
    pub fn with_backtrace(addresses: &'a [usize], skip: usize) -> Self {
        // Bounded by the array itself.
        let mut cursor = Self::new(usize::MAX);
        cursor.walker = Walker::Backtrace(BacktraceWalker::new(addresses, skip));
        cursor
    }

    /// Follows the frame-pointer chain of a captured machine context.
    pub fn with_machine_context(context: &'a MachineContext, max_depth: usize) -> Self {
        let mut cursor = Self::new(max_depth);
        cursor.walker = Walker::MachineContext(FramePointerWalker::new(context));
        cursor
    }

    /// Captures the calling thread's stack now. `skip` frames above the caller are dropped.
    #[inline(never)]
    pub fn with_self_thread(skip: usize) -> Self {
        let walker = SelfThreadWalker::capture(skip);
        let mut cursor = Self::new(usize::MAX);
        cursor.walker = Walker::SelfThread(walker);
        cursor
    }

    pub fn set_symbolicator(&mut self, symbolicator: &'a Symbolicator) {
        self.symbolicator = Some(symbolicator);
    }

    pub fn reset(&mut self) {
        self.state = CursorState::default();
        match &mut self.walker {
            Walker::Unset => {}
            Walker::Backtrace(walker) => walker.reset(),
            Walker::MachineContext(walker) => walker.reset(),
            Walker::SelfThread(walker) => walker.reset(),
        }
    }

    /// Moves to the next frame. Returns false once the stack is exhausted or the walk gave up.
    pub fn advance(&mut self) -> bool {
        if self.state.depth >= self.max_depth {
            self.state.has_given_up = true;
            return false;
        }
        let next = match &mut self.walker {
            Walker::Unset => {
                crash_log!(Warn, "stack cursor has no walker installed");
                None
            }
            Walker::Backtrace(walker) => walker.next(),
            Walker::MachineContext(walker) => walker.next(),
            Walker::SelfThread(walker) => walker.next(),
        };
        match next {
            Some(address) => {
                self.state.entry = StackEntry {
                    address: NativeRegisters::normalise_instruction_pointer(address),
                    symbol: SymbolInfo::default(),
                };
                self.state.depth += 1;
                true
            }
            None => false,
        }
    }

    /// Resolves the current frame. Every frame but the first holds a return address and is
    /// looked up one byte earlier, inside the call instruction.
    pub fn symbolicate(&mut self) -> bool {
        let Some(symbolicator) = self.symbolicator else {
            return false;
        };
        let address = self.state.entry.address;
        let lookup = if self.state.depth <= 1 {
            address
        } else {
            address.saturating_sub(1)
        };
        symbolicator.resolve(lookup, &mut self.state.entry.symbol)
    }

    pub fn entry(&self) -> &StackEntry {
        &self.state.entry
    }

    pub fn address(&self) -> usize {
        self.state.entry.address
    }

    pub fn depth(&self) -> usize {
        self.state.depth
    }

    pub fn has_given_up(&self) -> bool {
        self.state.has_given_up
    }

    /// Entries dropped before the first yielded frame.
    pub fn skipped_entries(&self) -> usize {
        match &self.walker {
            Walker::Backtrace(walker) => walker.skipped(),
            Walker::SelfThread(walker) => walker.skipped(),
            Walker::Unset | Walker::MachineContext(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_cursor_is_inert() {
        let mut cursor = StackCursor::new(10);
        cursor.reset();
        assert!(!cursor.advance());
        assert!(!cursor.symbolicate());
        assert_eq!(cursor.depth(), 0);
        assert!(!cursor.has_given_up());
    }

    #[test]
    fn backtrace_walk_visits_every_address_in_order() {
        let addresses = [0x1000usize, 0x2000, 0x3000, 0x4000];
        let mut cursor = StackCursor::with_backtrace(&addresses, 0);
        let mut seen = Vec::new();
        while cursor.advance() {
            seen.push(cursor.address());
        }
        assert_eq!(seen, addresses);
        assert!(!cursor.has_given_up());

        cursor.reset();
        assert!(cursor.advance());
        assert_eq!(cursor.address(), 0x1000);
    }

    #[test]
    fn backtrace_skips_and_drops_trailing_sentinel() {
        let addresses = [0x10usize, 0x20, 0x30, 1];
        let mut cursor = StackCursor::with_backtrace(&addresses, 1);
        let mut seen = Vec::new();
        while cursor.advance() {
            seen.push(cursor.address());
        }
        assert_eq!(seen, [0x20, 0x30]);
        assert_eq!(cursor.skipped_entries(), 1);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn self_thread_captures_caller() {
        #[inline(never)]
        fn capture() -> Vec<usize> {
            let mut cursor = StackCursor::with_self_thread(0);
            let mut seen = Vec::new();
            while cursor.advance() {
                seen.push(cursor.address());
            }
            assert!(!cursor.advance());
            seen
        }
        let frames = capture();
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|a| *a > 1));
    }

    #[test]
    fn depth_limit_sets_given_up() {
        let addresses: Vec<usize> = (1..=20).map(|i| i * 0x100).collect();
        let mut cursor = StackCursor::with_backtrace(&addresses, 0);
        cursor.max_depth = 5;
        let mut count = 0;
        while cursor.advance() {
            count += 1;
        }
        assert_eq!(count, 5);
        assert!(cursor.has_given_up());
    }
}

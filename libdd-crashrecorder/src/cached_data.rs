// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A background snapshot of the process's threads and their names.
//!
//! Thread names cannot be read safely while crashing, so a low-priority worker refreshes them
//! periodically. The crash path [`CachedData::freeze`]s the cache, which stops the worker from
//! swapping snapshots until the returned guard is dropped. No lock is involved: a single atomic
//! word holds the freeze count and an "update in progress" bit.

use crate::machine_context::threads::{self, ThreadHandle};
use crate::shared::constants::{
    CACHED_DATA_QUICK_INTERVAL, CACHED_DATA_QUICK_POLLS, MAX_CAPTURED_THREADS,
};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

const UPDATING: usize = 1;
const FREEZE_UNIT: usize = 2;
// Bounds the wait for a refresh that was interrupted by the crash itself.
const MAX_FREEZE_SPINS: usize = 1 << 20;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ThreadSnapshot {
    pub generation: u64,
    pub threads: Vec<ThreadHandle>,
    pub names: Vec<Option<String>>,
    pub queue_names: Vec<Option<String>>,
}

impl ThreadSnapshot {
    fn capture(generation: u64) -> Self {
        let mut handles = [ThreadHandle::NONE; MAX_CAPTURED_THREADS];
        let count = threads::list_threads(&mut handles);
        let threads = handles[..count].to_vec();
        let names = threads.iter().map(|t| threads::thread_name(*t)).collect();
        Self {
            generation,
            queue_names: vec![None; threads.len()],
            threads,
            names,
        }
    }

    pub fn thread_name(&self, thread: ThreadHandle) -> Option<&str> {
        let index = self.threads.iter().position(|t| *t == thread)?;
        self.names.get(index)?.as_deref()
    }

    pub fn queue_name(&self, thread: ThreadHandle) -> Option<&str> {
        let index = self.threads.iter().position(|t| *t == thread)?;
        self.queue_names.get(index)?.as_deref()
    }
}

struct Shared {
    // (freeze count * FREEZE_UNIT) | UPDATING
    state: AtomicUsize,
    // null or `Box::into_raw`
    snapshot: AtomicPtr<ThreadSnapshot>,
    generation: AtomicU64,
}

impl Shared {
    fn install(&self, snapshot: ThreadSnapshot) -> bool {
        if self
            .state
            .compare_exchange(0, UPDATING, SeqCst, SeqCst)
            .is_err()
        {
            return false;
        }
        let old = self.snapshot.swap(Box::into_raw(Box::new(snapshot)), SeqCst);
        if !old.is_null() {
            // SAFETY: only ever set from `Box::into_raw`, and no frozen reader can hold it since
            // the freeze count was zero when the update bit was taken.
            drop(unsafe { Box::from_raw(old) });
        }
        self.state.fetch_and(!UPDATING, SeqCst);
        true
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let old = self.snapshot.swap(ptr::null_mut(), SeqCst);
        if !old.is_null() {
            // SAFETY: see `install`.
            drop(unsafe { Box::from_raw(old) });
        }
    }
}

struct Worker {
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

pub struct CachedData {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

/// Keeps the cache frozen while alive.
pub struct FreezeGuard<'a> {
    shared: &'a Shared,
    stable: bool,
}

impl FreezeGuard<'_> {
    /// The frozen snapshot. `None` if nothing was cached yet or if a refresh was interrupted
    /// and the snapshot cannot be trusted.
    pub fn snapshot(&self) -> Option<&ThreadSnapshot> {
        if !self.stable {
            return None;
        }
        let snapshot = self.shared.snapshot.load(SeqCst);
        // SAFETY: the worker never frees the current snapshot while the freeze count is above
        // zero, and this guard holds one count.
        unsafe { snapshot.as_ref() }
    }
}

impl Drop for FreezeGuard<'_> {
    fn drop(&mut self) {
        self.shared.state.fetch_sub(FREEZE_UNIT, SeqCst);
    }
}

impl Default for CachedData {
    fn default() -> Self {
        Self::new()
    }
}

impl CachedData {
    /// An empty cache without a worker.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicUsize::new(0),
                snapshot: AtomicPtr::new(ptr::null_mut()),
                generation: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Takes a snapshot now and starts the refresh worker. The first few refreshes come
    /// quickly so threads created during start-up get their names recorded.
    pub fn start(&self, interval: Duration) -> anyhow::Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Ok(());
        }
        self.refresh();

        let shutdown = Arc::new((Mutex::new(false), Condvar::new()));
        let worker_shutdown = shutdown.clone();
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("crashrecorder-cache".to_string())
            .spawn(move || {
                let (lock, cvar) = worker_shutdown.as_ref();
                let mut polls = 0;
                let mut stop = lock.lock().unwrap_or_else(PoisonError::into_inner);
                while !*stop {
                    let wait = if polls < CACHED_DATA_QUICK_POLLS {
                        polls += 1;
                        CACHED_DATA_QUICK_INTERVAL
                    } else {
                        interval
                    };
                    stop = cvar
                        .wait_timeout(stop, wait)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                    if *stop {
                        break;
                    }
                    let generation = shared.generation.fetch_add(1, SeqCst) + 1;
                    if !shared.install(ThreadSnapshot::capture(generation)) {
                        tracing::debug!("Thread cache is frozen, skipping refresh");
                    }
                }
            })?;
        tracing::debug!(?interval, "Started the thread cache worker");
        *worker = Some(Worker { shutdown, handle });
        Ok(())
    }

    /// Stops the worker. The last snapshot stays available.
    pub fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let (lock, cvar) = worker.shutdown.as_ref();
            *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
            cvar.notify_one();
            if worker.handle.join().is_err() {
                tracing::warn!("Thread cache worker panicked");
            }
        }
    }

    /// Re-reads the thread list and names. Returns false if the cache was frozen.
    pub fn refresh(&self) -> bool {
        let generation = self.shared.generation.fetch_add(1, SeqCst) + 1;
        self.shared.install(ThreadSnapshot::capture(generation))
    }

    #[cfg(test)]
    fn install(&self, snapshot: ThreadSnapshot) -> bool {
        self.shared.install(snapshot)
    }

    /// Pins the current snapshot. Async-signal-safe: never blocks for long and never allocates.
    pub fn freeze(&self) -> FreezeGuard<'_> {
        let state = &self.shared.state;
        state.fetch_add(FREEZE_UNIT, SeqCst);
        let mut spins = 0;
        while state.load(SeqCst) & UPDATING != 0 && spins < MAX_FREEZE_SPINS {
            std::hint::spin_loop();
            spins += 1;
        }
        FreezeGuard {
            shared: &self.shared,
            stable: state.load(SeqCst) & UPDATING == 0,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.shared.state.load(SeqCst) >= FREEZE_UNIT
    }
}

impl Drop for CachedData {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn stamped(generation: u64, len: usize) -> ThreadSnapshot {
        ThreadSnapshot {
            generation,
            threads: vec![ThreadHandle(generation as i64); len],
            names: vec![Some(generation.to_string()); len],
            queue_names: vec![None; len],
        }
    }

    #[test]
    fn frozen_cache_rejects_updates() {
        let cache = CachedData::new();
        assert!(cache.install(stamped(1, 2)));
        {
            let guard = cache.freeze();
            assert!(cache.is_frozen());
            assert!(!cache.install(stamped(2, 2)));
            assert_eq!(guard.snapshot().unwrap().generation, 1);
            let nested = cache.freeze();
            drop(guard);
            assert!(cache.is_frozen());
            drop(nested);
        }
        assert!(!cache.is_frozen());
        assert!(cache.install(stamped(3, 2)));
        assert_eq!(cache.freeze().snapshot().unwrap().generation, 3);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn refresh_lists_this_thread() {
        let cache = CachedData::new();
        assert!(cache.refresh());
        let guard = cache.freeze();
        let snapshot = guard.snapshot().unwrap();
        assert!(snapshot.threads.contains(&ThreadHandle::current()));
        assert_eq!(snapshot.threads.len(), snapshot.names.len());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn frozen_reads_never_see_a_partial_snapshot() {
        let cache = Arc::new(CachedData::new());
        cache.install(stamped(0, 8));
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let cache = cache.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut generation = 1;
                while !done.load(SeqCst) {
                    cache.install(stamped(generation, 1 + (generation % 16) as usize));
                    generation += 1;
                }
            })
        };

        for _ in 0..20_000 {
            let guard = cache.freeze();
            let snapshot = guard.snapshot().unwrap();
            let generation = snapshot.generation;
            let expected = generation.to_string();
            for (thread, name) in snapshot.threads.iter().zip(&snapshot.names) {
                assert_eq!(thread.0, generation as i64);
                assert_eq!(name.as_deref(), Some(expected.as_str()));
            }
            assert_eq!(snapshot.threads.len(), snapshot.names.len());
            // The snapshot must not change while frozen.
            std::hint::spin_loop();
            assert_eq!(guard.snapshot().unwrap().generation, generation);
        }
        done.store(true, SeqCst);
        writer.join().unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn worker_starts_and_stops() {
        let cache = CachedData::new();
        cache.start(Duration::from_millis(10)).unwrap();
        assert!(cache.freeze().snapshot().is_some());
        cache.stop();
        cache.stop();
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-disk report storage.
//!
//! Reports live directly in the store directory as `<app>-report-<16 hex digit id>.json`. Ids are
//! seeded from the wall clock when the store is opened and then handed out by an atomic counter,
//! so the crash path can name a new file without touching the filesystem or allocating.

use crate::shared::constants::{MAX_PATH_LEN, MAX_REPORT_SIZE};
use crate::shared::fixed_str::FixedStr;
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicU64, AtomicUsize};

/// Low bits of an id reserved for the per-launch counter.
const ID_COUNTER_BITS: u32 = 23;
const ID_HEX_DIGITS: usize = 16;
const REPORT_INFIX: &str = "-report-";
const REPORT_SUFFIX: &str = ".json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Report {path} is {size} bytes, more than the {MAX_REPORT_SIZE} allowed")]
    TooLarge { path: PathBuf, size: u64 },
    #[error("Maximum report count must be at least 1")]
    InvalidMaxCount,
    #[error("Report directory {0} is too long")]
    PathTooLong(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_owned(),
        source,
    }
}

/// Packs the calendar fields of `now` into the high bits of an id.
fn clock_seed(now: DateTime<Utc>) -> u64 {
    let seconds = u64::from(now.second());
    let minutes = u64::from(now.minute());
    let hours = u64::from(now.hour());
    let days = u64::from(now.ordinal0());
    let years = u64::try_from(now.year() - 1900).unwrap_or(0);
    let packed = seconds
        + minutes * 61
        + hours * 61 * 60
        + days * 61 * 60 * 24
        + years * 61 * 60 * 24 * 366;
    packed << ID_COUNTER_BITS
}

pub struct ReportStore {
    app_name: String,
    directory: PathBuf,
    // `<directory>/<app>-report-`, prepared for the crash path.
    path_prefix: FixedStr<MAX_PATH_LEN>,
    max_count: AtomicUsize,
    next_id: AtomicU64,
}

impl ReportStore {
    /// Opens (creating if needed) the store in `directory` and prunes it to `max_count` reports.
    pub fn initialize(
        app_name: &str,
        directory: &Path,
        max_count: usize,
    ) -> Result<Self, StoreError> {
        Self::with_clock(app_name, directory, max_count, Utc::now())
    }

    /// Like [`ReportStore::initialize`] with the id seed taken from `now`.
    pub fn with_clock(
        app_name: &str,
        directory: &Path,
        max_count: usize,
        now: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        if max_count == 0 {
            return Err(StoreError::InvalidMaxCount);
        }
        fs::create_dir_all(directory).map_err(io_error(directory))?;

        let mut path_prefix = FixedStr::new();
        path_prefix.push_bytes(directory.as_os_str().as_bytes());
        path_prefix.push_str("/");
        path_prefix.push_str(app_name);
        path_prefix.push_str(REPORT_INFIX);
        // Room for the id, the suffix and the NUL.
        if path_prefix.len() + ID_HEX_DIGITS + REPORT_SUFFIX.len() + 1 > MAX_PATH_LEN {
            return Err(StoreError::PathTooLong(directory.to_owned()));
        }

        let store = Self {
            app_name: app_name.to_owned(),
            directory: directory.to_owned(),
            path_prefix,
            max_count: AtomicUsize::new(max_count),
            next_id: AtomicU64::new(0),
        };
        let newest_on_disk = store.list_ids()?.last().map_or(0, |id| id + 1);
        store
            .next_id
            .store(clock_seed(now).max(newest_on_disk), SeqCst);
        store.prune()?;
        tracing::debug!(
            directory = %store.directory.display(),
            reports = store.count()?,
            "Opened report store"
        );
        Ok(store)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Reserves a new id and writes the path of its report into `out`.
    ///
    /// Async-signal-safe.
    pub fn next_report_path<const N: usize>(&self, out: &mut FixedStr<N>) -> u64 {
        let id = self.next_id.fetch_add(1, SeqCst);
        self.path_for_id(id, out);
        id
    }

    /// Async-signal-safe.
    pub fn path_for_id<const N: usize>(&self, id: u64, out: &mut FixedStr<N>) {
        out.clear();
        out.push_bytes(self.path_prefix.as_bytes());
        out.push_hex(id, ID_HEX_DIGITS);
        out.push_str(REPORT_SUFFIX);
    }

    pub fn report_path(&self, id: u64) -> PathBuf {
        self.directory
            .join(format!("{}{REPORT_INFIX}{id:016x}{REPORT_SUFFIX}", self.app_name))
    }

    fn parse_id(&self, file_name: &str) -> Option<u64> {
        let hex = file_name
            .strip_prefix(self.app_name.as_str())?
            .strip_prefix(REPORT_INFIX)?
            .strip_suffix(REPORT_SUFFIX)?;
        if hex.len() != ID_HEX_DIGITS {
            return None;
        }
        u64::from_str_radix(hex, 16).ok()
    }

    /// Ids of the stored reports, oldest first.
    pub fn list_ids(&self) -> Result<Vec<u64>, StoreError> {
        let entries = fs::read_dir(&self.directory).map_err(io_error(&self.directory))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_error(&self.directory))?;
            if let Some(id) = entry.file_name().to_str().and_then(|name| self.parse_id(name)) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.list_ids()?.len())
    }

    /// The raw report, or `None` if there is no report with this id.
    pub fn read(&self, id: u64) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.report_path(id);
        let size = match fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path)(e)),
        };
        if size > MAX_REPORT_SIZE {
            return Err(StoreError::TooLarge { path, size });
        }
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    /// Stores an externally built report and returns its id.
    pub fn add_user_report(&self, report: &[u8]) -> Result<u64, StoreError> {
        let id = self.next_id.fetch_add(1, SeqCst);
        let path = self.report_path(id);
        if report.len() as u64 > MAX_REPORT_SIZE {
            return Err(StoreError::TooLarge {
                path,
                size: report.len() as u64,
            });
        }
        fs::write(&path, report).map_err(io_error(&path))?;
        self.prune()?;
        Ok(id)
    }

    /// Deleting a missing report is not an error.
    pub fn delete(&self, id: u64) -> Result<(), StoreError> {
        let path = self.report_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    pub fn delete_all(&self) -> Result<(), StoreError> {
        for id in self.list_ids()? {
            self.delete(id)?;
        }
        Ok(())
    }

    pub fn max_count(&self) -> usize {
        self.max_count.load(SeqCst)
    }

    pub fn set_max_count(&self, max_count: usize) -> Result<(), StoreError> {
        if max_count == 0 {
            return Err(StoreError::InvalidMaxCount);
        }
        self.max_count.store(max_count, SeqCst);
        self.prune()
    }

    /// Deletes the oldest reports until at most `max_count` remain.
    pub fn prune(&self) -> Result<(), StoreError> {
        let ids = self.list_ids()?;
        let excess = ids.len().saturating_sub(self.max_count());
        for &id in &ids[..excess] {
            tracing::info!(id = format_args!("{id:016x}"), "Pruning old crash report");
            self.delete(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 15, 9, 26).unwrap()
    }

    fn new_path(store: &ReportStore) -> (u64, PathBuf) {
        let mut path = FixedStr::<MAX_PATH_LEN>::new();
        let id = store.next_report_path(&mut path);
        (id, PathBuf::from(path.as_str()))
    }

    #[test]
    fn clock_seed_orders_by_time() {
        let earlier = clock_seed(clock());
        let later = clock_seed(clock() + chrono::Duration::seconds(1));
        assert!(later > earlier);
        assert_eq!(earlier & ((1 << ID_COUNTER_BITS) - 1), 0);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn report_paths_embed_app_and_hex_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::with_clock("app", dir.path(), 5, clock()).unwrap();
        let (id, path) = new_path(&store);
        assert_eq!(path, store.report_path(id));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, format!("app-report-{id:016x}.json"));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn ids_increase_across_restarts_with_the_same_clock() {
        let dir = tempfile::tempdir().unwrap();
        let mut last = None;
        for _ in 0..3 {
            let store = ReportStore::with_clock("app", dir.path(), 10, clock()).unwrap();
            for _ in 0..2 {
                let (id, path) = new_path(&store);
                assert!(last.is_none_or(|last| id > last));
                fs::write(path, b"{}").unwrap();
                last = Some(id);
            }
        }
        assert_eq!(
            ReportStore::with_clock("app", dir.path(), 10, clock())
                .unwrap()
                .count()
                .unwrap(),
            6
        );
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn prune_keeps_newest_reports() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::with_clock("app", dir.path(), 10, clock()).unwrap();
        let ids: Vec<u64> = (0..5)
            .map(|i| store.add_user_report(format!("{{\"n\":{i}}}").as_bytes()).unwrap())
            .collect();
        store.set_max_count(2).unwrap();
        assert_eq!(store.list_ids().unwrap(), ids[3..]);
        assert_eq!(store.read(ids[4]).unwrap().unwrap(), br#"{"n":4}"#);
        assert!(store.read(ids[0]).unwrap().is_none());
        assert!(matches!(store.set_max_count(0), Err(StoreError::InvalidMaxCount)));

        let reopened = ReportStore::with_clock("app", dir.path(), 1, clock()).unwrap();
        assert_eq!(reopened.list_ids().unwrap(), ids[4..]);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn foreign_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("other-report-0000000000000001.json"), b"{}").unwrap();
        fs::write(dir.path().join("app-report-1.json"), b"{}").unwrap();
        fs::write(dir.path().join("app-report-0000000000000001.old"), b"{}").unwrap();
        let store = ReportStore::with_clock("app", dir.path(), 1, clock()).unwrap();
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn delete_and_size_limits() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::with_clock("app", dir.path(), 5, clock()).unwrap();
        let id = store.add_user_report(b"{}").unwrap();
        store.delete(id).unwrap();
        store.delete(id).unwrap();
        assert_eq!(store.count().unwrap(), 0);

        let huge = vec![b' '; MAX_REPORT_SIZE as usize + 1];
        assert!(matches!(
            store.add_user_report(&huge),
            Err(StoreError::TooLarge { .. })
        ));
        let (id, path) = new_path(&store);
        fs::write(path, &huge).unwrap();
        assert!(matches!(store.read(id), Err(StoreError::TooLarge { .. })));
        store.delete_all().unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }
}

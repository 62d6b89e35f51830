//! Aggregate cache statistics
//!
//! A scan walks the three zones, keeps the files that look like cache entries
//! and counts one representative file per logical entry according to the
//! active [`CountingRules`]. Scans are expensive on large caches, so results
//! are memoized for a TTL once the cache is past its warm-up phase.
//!
//! The default rules are asymmetric: server-delegated storage counts files
//! whose names contain an asset extension, self-managed storage counts `.none`
//! payload files. Since containers are written under server-delegated gzip and
//! plain assets under self-managed gzip, neither default matches what the
//! other mode writes. The table is configurable so deployments can pick rules
//! that fit their layout.

use crate::config::{CacheConfig, GzipMode, StatsConfig};
use crate::guard::DirectoryGuard;
use crate::hooks::Hooks;
use crate::path::Zone;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Which files contribute to the byte total
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SizeScope {
    /// Only files that are counted as entries
    CountedOnly,
    /// Every valid cache file, counted or not
    #[default]
    AllValid,
}

/// Substring rules deciding which valid files count as entries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CountingRules {
    /// Markers counted under server-delegated gzip
    pub server_delegated: Vec<String>,
    /// Markers counted under self-managed gzip
    pub self_managed: Vec<String>,
    /// Which files add to the byte total
    pub size_scope: SizeScope,
}

impl Default for CountingRules {
    fn default() -> Self {
        Self {
            server_delegated: [".js", ".css", ".img", ".txt"]
                .into_iter()
                .map(String::from)
                .collect(),
            self_managed: vec![".none".to_string()],
            size_scope: SizeScope::AllValid,
        }
    }
}

impl CountingRules {
    /// Whether `file_name` counts as an entry under `mode`.
    #[must_use]
    pub fn counts(&self, mode: GzipMode, file_name: &str) -> bool {
        let markers = match mode {
            GzipMode::ServerDelegated => &self.server_delegated,
            GzipMode::SelfManaged => &self.self_managed,
        };
        markers.iter().any(|m| file_name.contains(m.as_str()))
    }
}

/// Result of one scan
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Number of counted entries
    pub count: u64,
    /// Total size in bytes
    pub total_bytes: u64,
    /// When the scan finished
    pub scanned_at: DateTime<Utc>,
}

/// Whether `file_name` inside `zone_dir` is a cache file.
///
/// It must not be `.` or `..`, must contain `prefix`, and must be a regular
/// file. Everything else in a zone (markers, foreign files, directories) is
/// left alone by scans and purges.
#[must_use]
pub fn is_valid_entry(zone_dir: &Path, file_name: &str, prefix: &str) -> bool {
    file_name != "."
        && file_name != ".."
        && file_name.contains(prefix)
        && zone_dir.join(file_name).is_file()
}

/// A valid cache file found in one of the zones
#[derive(Debug, Clone)]
pub(crate) struct CacheFile {
    pub(crate) path: PathBuf,
    pub(crate) name: String,
}

/// Enumerate every valid cache file under `root`.
///
/// Unreadable zones are logged and skipped.
pub(crate) fn valid_cache_files(root: &Path, prefix: &str) -> Vec<CacheFile> {
    let mut files = Vec::new();
    for zone in Zone::ALL {
        let dir = zone.path(root);
        let walker = walkdir::WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %dir.display(), "Skipping unreadable cache zone entry: {e}");
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_valid_entry(&dir, &name, prefix) {
                files.push(CacheFile {
                    path: entry.into_path(),
                    name,
                });
            }
        }
    }
    files
}

/// Storage for the memoized snapshot
pub trait StatsMemo: Send + Sync + fmt::Debug {
    /// The memoized snapshot, if present and unexpired
    fn load(&self) -> Option<StatsSnapshot>;
    /// Memoize `snapshot` for `ttl`
    fn save(&self, snapshot: &StatsSnapshot, ttl: Duration);
    /// Drop the memoized snapshot
    fn clear(&self);
}

/// Process-local memo
#[derive(Debug, Default)]
pub struct MemoryMemo {
    slot: Mutex<Option<(StatsSnapshot, Instant)>>,
}

impl MemoryMemo {
    /// Empty memo
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatsMemo for MemoryMemo {
    fn load(&self) -> Option<StatsSnapshot> {
        let guard = self.slot.lock().ok()?;
        match *guard {
            Some((snapshot, expires)) if Instant::now() < expires => Some(snapshot),
            _ => None,
        }
    }

    fn save(&self, snapshot: &StatsSnapshot, ttl: Duration) {
        let Some(expires) = Instant::now().checked_add(ttl) else {
            return;
        };
        if let Ok(mut guard) = self.slot.lock() {
            *guard = Some((*snapshot, expires));
        }
    }

    fn clear(&self) {
        if let Ok(mut guard) = self.slot.lock() {
            *guard = None;
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemoRecord {
    snapshot: StatsSnapshot,
    expires_at: DateTime<Utc>,
}

/// Memo persisted as JSON so separate processes share it
#[derive(Debug, Clone)]
pub struct FileMemo {
    path: PathBuf,
}

impl FileMemo {
    /// Memo stored at `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the memo file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileMemo {
    fn read_record(&self) -> Result<Option<MemoRecord>> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, &self.path, "read")),
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|e| Error::serialization(format!("stats memo: {e}")))
    }

    fn write_record(&self, record: &MemoRecord) -> Result<()> {
        let json = serde_json::to_vec(record)
            .map_err(|e| Error::serialization(format!("stats memo: {e}")))?;
        fs::write(&self.path, json).map_err(|e| Error::io(e, &self.path, "write"))
    }
}

impl StatsMemo for FileMemo {
    fn load(&self) -> Option<StatsSnapshot> {
        let record = match self.read_record() {
            Ok(record) => record?,
            Err(e) => {
                debug!(path = %self.path.display(), "Ignoring unreadable stats memo: {e}");
                return None;
            }
        };
        (Utc::now() < record.expires_at).then_some(record.snapshot)
    }

    fn save(&self, snapshot: &StatsSnapshot, ttl: Duration) {
        let Some(expires_at) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        else {
            return;
        };
        let record = MemoRecord {
            snapshot: *snapshot,
            expires_at,
        };
        if let Err(e) = self.write_record(&record) {
            warn!(path = %self.path.display(), "Failed to persist stats memo: {e}");
        }
    }

    fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "Failed to clear stats memo: {e}"),
        }
    }
}

/// Build the memo selected by the stats configuration.
#[must_use]
pub fn memo_from_config(stats: &StatsConfig) -> Arc<dyn StatsMemo> {
    match &stats.memo_file {
        Some(path) => Arc::new(FileMemo::new(path)),
        None => Arc::new(MemoryMemo::new()),
    }
}

/// Computes and memoizes cache statistics
#[derive(Debug, Clone)]
pub struct StatsEngine {
    config: Arc<CacheConfig>,
    guard: DirectoryGuard,
    hooks: Arc<Hooks>,
    memo: Arc<dyn StatsMemo>,
}

impl StatsEngine {
    /// Engine sharing `memo` with the purge coordinator
    #[must_use]
    pub fn new(
        config: Arc<CacheConfig>,
        guard: DirectoryGuard,
        hooks: Arc<Hooks>,
        memo: Arc<dyn StatsMemo>,
    ) -> Self {
        Self {
            config,
            guard,
            hooks,
            memo,
        }
    }

    /// Walk every zone and tally entries; never consults the memo.
    #[must_use]
    pub fn scan(&self) -> StatsSnapshot {
        let mut count = 0u64;
        let mut total_bytes = 0u64;

        if let Some(root) = self.config.root.as_deref() {
            let rules = &self.config.counting;
            for file in valid_cache_files(root, &self.config.prefix) {
                let counted = rules.counts(self.config.gzip_mode, &file.name);
                if counted {
                    count += 1;
                }
                if counted || rules.size_scope == SizeScope::AllValid {
                    match fs::metadata(&file.path) {
                        Ok(meta) => total_bytes += meta.len(),
                        Err(e) => debug!(path = %file.path.display(), "Skipping size: {e}"),
                    }
                }
            }
        }

        let snapshot = StatsSnapshot {
            count,
            total_bytes,
            scanned_at: Utc::now(),
        };
        debug!(count, total_bytes, "Scanned cache");
        snapshot
    }

    /// Memoized snapshot, or a fresh scan; `None` when the cache is unavailable.
    ///
    /// Fresh scans are memoized only when their count exceeds the configured
    /// minimum, so a cache that is still warming up is rescanned every call.
    #[must_use]
    pub fn stats(&self) -> Option<StatsSnapshot> {
        if let Some(snapshot) = self.memo.load() {
            return Some(snapshot);
        }
        if !self.guard.ensure_available() {
            return None;
        }

        let snapshot = self.scan();
        if snapshot.count > self.config.stats.min_count {
            let ttl = self.hooks.stats_ttl(self.config.stats.ttl());
            self.memo.save(&snapshot, ttl);
        }
        Some(snapshot)
    }

    /// Drop the memoized snapshot.
    pub fn invalidate(&self) {
        self.memo.clear();
    }
}

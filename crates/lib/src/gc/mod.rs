//! Cache garbage collection.
//!
//! Entries are live when the last invocation record references their key. Sweeping
//! removes every other success and failure entry, plus staging leftovers in `tmp/`.
//! Callers hold the exclusive cache lock while sweeping.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::{fs, io};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cache::{ArtifactCache, CacheError};
use crate::invalidation::{RecordError, RecordStore};
use crate::util::hash::ObjectHash;

#[derive(Debug, Error)]
pub enum GcError {
  #[error("no invocation record in {0}; run a build before collecting garbage")]
  NoRecord(PathBuf),

  #[error(transparent)]
  Record(#[from] RecordError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error("failed to read cache directory: {0}")]
  ReadCache(#[from] io::Error),
}

#[derive(Debug, Default, Serialize)]
pub struct GcStats {
  pub objects_scanned: usize,
  pub objects_deleted: usize,
  pub failures_scanned: usize,
  pub failures_deleted: usize,
  pub staging_deleted: usize,
  pub bytes_freed: u64,
}

impl GcStats {
  pub fn total_deleted(&self) -> usize {
    self.objects_deleted + self.failures_deleted + self.staging_deleted
  }
}

#[derive(Debug, Serialize)]
pub struct GcResult {
  pub stats: GcStats,
  pub deleted_paths: Vec<PathBuf>,
  pub dry_run: bool,
}

fn live_keys(cache: &ArtifactCache) -> Result<HashSet<ObjectHash>, GcError> {
  let store = RecordStore::new(cache.root());
  let record = store.load()?.ok_or_else(|| GcError::NoRecord(store.path()))?;
  let live: HashSet<ObjectHash> = record.keys.into_values().collect();
  debug!(count = live.len(), "collected live keys from invocation record");
  Ok(live)
}

fn path_size(path: &Path) -> u64 {
  WalkDir::new(path)
    .into_iter()
    .filter_map(|e| e.ok())
    .filter(|e| e.file_type().is_file())
    .filter_map(|e| e.metadata().ok())
    .map(|m| m.len())
    .sum()
}

/// Remove everything the last invocation does not reference.
pub fn collect_garbage(cache: &ArtifactCache, dry_run: bool) -> Result<GcResult, GcError> {
  let live = live_keys(cache)?;
  let mut sweep = Sweep {
    dry_run,
    stats: GcStats::default(),
    deleted_paths: Vec::new(),
  };

  for key in cache.success_keys()? {
    sweep.stats.objects_scanned += 1;
    if live.contains(&key) {
      continue;
    }
    debug!(key = %key, "removing unreferenced artifact");
    if sweep.remove(&cache.object_path(&key)) {
      sweep.stats.objects_deleted += 1;
    }
  }

  for key in cache.failure_keys()? {
    sweep.stats.failures_scanned += 1;
    if live.contains(&key) {
      continue;
    }
    debug!(key = %key, "removing unreferenced failure record");
    if sweep.remove(&cache.failure_file(&key)) {
      sweep.stats.failures_deleted += 1;
    }
  }

  let tmp = cache.tmp_dir();
  if tmp.exists() {
    for entry in fs::read_dir(&tmp)?.flatten() {
      if sweep.remove(&entry.path()) {
        sweep.stats.staging_deleted += 1;
      }
    }
  }

  info!(
    objects_deleted = sweep.stats.objects_deleted,
    failures_deleted = sweep.stats.failures_deleted,
    staging_deleted = sweep.stats.staging_deleted,
    bytes_freed = sweep.stats.bytes_freed,
    dry_run,
    "garbage collection complete"
  );

  Ok(GcResult {
    stats: sweep.stats,
    deleted_paths: sweep.deleted_paths,
    dry_run,
  })
}

struct Sweep {
  dry_run: bool,
  stats: GcStats,
  deleted_paths: Vec<PathBuf>,
}

impl Sweep {
  /// Delete (or pretend to) one path; false if deletion failed.
  fn remove(&mut self, path: &Path) -> bool {
    let size = path_size(path);

    if !self.dry_run {
      let removed = if path.is_dir() {
        fs::remove_dir_all(path)
      } else {
        fs::remove_file(path)
      };
      if let Err(e) = removed {
        warn!(path = %path.display(), error = %e, "failed to delete cache path");
        return false;
      }
    }

    self.stats.bytes_freed += size;
    self.deleted_paths.push(path.to_path_buf());
    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheEntry;
  use crate::invalidation::{InvocationRecord, RECORD_VERSION};
  use std::collections::BTreeMap;
  use tempfile::TempDir;

  fn key(s: &str) -> ObjectHash {
    ObjectHash(s.to_string())
  }

  fn store_success(cache: &ArtifactCache, k: &ObjectHash) {
    let staging = cache.stage(k).unwrap();
    fs::write(staging.out_dir().join("m.pcm"), k.0.as_bytes()).unwrap();
    cache.commit_success(staging, CacheEntry::success(k, "m", "")).unwrap();
  }

  fn record(cache: &ArtifactCache, keys: &[&str]) {
    let record = InvocationRecord {
      version: RECORD_VERSION,
      created_at_unix: 0,
      keys: keys
        .iter()
        .enumerate()
        .map(|(i, k)| (format!("unit{i}"), key(k)))
        .collect::<BTreeMap<_, _>>(),
    };
    RecordStore::new(cache.root()).save(&record).unwrap();
  }

  fn setup() -> (TempDir, ArtifactCache) {
    let temp = TempDir::new().unwrap();
    let cache = ArtifactCache::open(temp.path()).unwrap();
    store_success(&cache, &key("live"));
    store_success(&cache, &key("stale"));
    cache
      .store_failure(&CacheEntry::failure(&key("stale-failure"), "x", "error"))
      .unwrap();
    cache
      .store_failure(&CacheEntry::failure(&key("live-failure"), "y", "error"))
      .unwrap();
    fs::create_dir_all(cache.tmp_dir().join("leftover-123-abc")).unwrap();
    record(&cache, &["live", "live-failure"]);
    (temp, cache)
  }

  #[test]
  fn removes_unreferenced_entries() {
    let (_temp, cache) = setup();

    let result = collect_garbage(&cache, false).unwrap();

    assert_eq!(result.stats.objects_scanned, 2);
    assert_eq!(result.stats.objects_deleted, 1);
    assert_eq!(result.stats.failures_deleted, 1);
    assert_eq!(result.stats.staging_deleted, 1);
    assert_eq!(result.stats.total_deleted(), 3);
    assert!(result.stats.bytes_freed > 0);

    assert_eq!(cache.success_keys().unwrap(), vec![key("live")]);
    assert_eq!(cache.failure_keys().unwrap(), vec![key("live-failure")]);
    assert!(fs::read_dir(cache.tmp_dir()).unwrap().next().is_none());
  }

  #[test]
  fn dry_run_deletes_nothing() {
    let (_temp, cache) = setup();

    let result = collect_garbage(&cache, true).unwrap();

    assert!(result.dry_run);
    assert_eq!(result.stats.total_deleted(), 3);
    assert_eq!(result.deleted_paths.len(), 3);
    assert_eq!(cache.success_keys().unwrap().len(), 2);
    assert_eq!(cache.failure_keys().unwrap().len(), 2);
  }

  #[test]
  fn refuses_without_record() {
    let temp = TempDir::new().unwrap();
    let cache = ArtifactCache::open(temp.path()).unwrap();
    store_success(&cache, &key("orphan"));

    assert!(matches!(collect_garbage(&cache, false), Err(GcError::NoRecord(_))));
    assert_eq!(cache.success_keys().unwrap().len(), 1);
  }
}

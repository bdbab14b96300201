//! Content-addressed artifact cache.
//!
//! # Storage Layout
//!
//! ```text
//! {cache}/
//! ├── .lock                      # advisory process lock
//! ├── objects/<key>/entry.json   # successful entry
//! ├── objects/<key>/out/         # artifact directory
//! ├── failures/<key>.json        # failed entry (diagnostic only)
//! ├── tmp/                       # staging for in-flight builds
//! └── invocations/last.json      # previous invocation's keys
//! ```
//!
//! Entries are write-once. Builds stage into `tmp/` and commit with a single rename;
//! when two writers race on one key the first rename wins and the loser's staging
//! directory is discarded.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::util::hash::{DirHashError, ObjectHash, hash_directory};

pub const ENTRY_VERSION: u32 = 1;

const OBJECTS_DIR: &str = "objects";
const FAILURES_DIR: &str = "failures";
const TMP_DIR: &str = "tmp";
const ENTRY_FILENAME: &str = "entry.json";
const ARTIFACT_DIR: &str = "out";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
  Success,
  Failure,
}

/// Persisted record of one build outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub version: u32,
  pub key: ObjectHash,
  /// Instance that produced the entry, for diagnostics only.
  pub instance: String,
  pub outcome: Outcome,
  /// Content hash of the artifact directory (successes only).
  #[serde(skip_serializing_if = "Option::is_none")]
  pub artifact_hash: Option<String>,
  pub diagnostic: String,
  pub created_at_unix: u64,
}

impl CacheEntry {
  pub fn success(key: &ObjectHash, instance: &str, diagnostic: &str) -> Self {
    Self::new(key, instance, Outcome::Success, diagnostic)
  }

  pub fn failure(key: &ObjectHash, instance: &str, diagnostic: &str) -> Self {
    Self::new(key, instance, Outcome::Failure, diagnostic)
  }

  fn new(key: &ObjectHash, instance: &str, outcome: Outcome, diagnostic: &str) -> Self {
    Self {
      version: ENTRY_VERSION,
      key: key.clone(),
      instance: instance.to_string(),
      outcome,
      artifact_hash: None,
      diagnostic: diagnostic.to_string(),
      created_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    }
  }
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
  /// A verified success entry and its artifact directory.
  Hit { entry: CacheEntry, artifact: PathBuf },
  /// Only a failure entry exists.
  Failed(CacheEntry),
  Miss,
}

/// Whether a store created the entry or found one already there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
  Stored,
  AlreadyPresent,
}

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("failed to create cache directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to read cache entry {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse cache entry {path}: {message}")]
  Parse { path: PathBuf, message: String },

  #[error("unsupported cache entry version {version} in {path}")]
  UnsupportedVersion { path: PathBuf, version: u32 },

  #[error("artifact for {key} is corrupted: expected hash {expected}, found {actual}")]
  Corrupted {
    key: ObjectHash,
    expected: String,
    actual: String,
  },

  #[error("failed to hash artifact: {0}")]
  Hash(#[from] DirHashError),

  #[error("cache task did not complete: {0}")]
  Task(String),

  #[error("failed to write cache entry for {key}: {source}")]
  Write {
    key: ObjectHash,
    #[source]
    source: io::Error,
  },
}

/// An in-flight build's private output area.
///
/// Dropping a staging area without committing it removes it.
#[derive(Debug)]
pub struct Staging {
  dir: TempDir,
  key: ObjectHash,
}

impl Staging {
  pub fn key(&self) -> &ObjectHash {
    &self.key
  }

  /// Directory the build step writes its artifact into.
  pub fn out_dir(&self) -> PathBuf {
    self.dir.path().join(ARTIFACT_DIR)
  }
}

/// Handle to a cache root. Cheap to clone and safe to share between workers.
///
/// Clones share the set of keys whose artifact digest was already verified, so one
/// invocation hashes each committed artifact at most once.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
  root: PathBuf,
  verified: Arc<Mutex<HashSet<ObjectHash>>>,
}

impl ArtifactCache {
  /// Open (creating if needed) the cache rooted at `root`.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
    let cache = Self::at(root);
    for dir in [OBJECTS_DIR, FAILURES_DIR, TMP_DIR] {
      cache.ensure_dir(dir)?;
    }
    debug!(root = ?cache.root, "opened artifact cache");
    Ok(cache)
  }

  /// Handle to the cache at `root` without touching the filesystem.
  ///
  /// Lookups and listings treat missing directories as empty; writes create what
  /// they need.
  pub fn at(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      verified: Arc::default(),
    }
  }

  fn ensure_dir(&self, name: &str) -> Result<PathBuf, CacheError> {
    let path = self.root.join(name);
    fs::create_dir_all(&path).map_err(|source| CacheError::CreateDir {
      path: path.clone(),
      source,
    })?;
    Ok(path)
  }

  fn is_verified(&self, key: &ObjectHash) -> bool {
    self.verified.lock().is_ok_and(|set| set.contains(key))
  }

  fn set_verified(&self, key: &ObjectHash, verified: bool) {
    if let Ok(mut set) = self.verified.lock() {
      if verified {
        set.insert(key.clone());
      } else {
        set.remove(key);
      }
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn object_dir(&self, key: &ObjectHash) -> PathBuf {
    self.root.join(OBJECTS_DIR).join(&key.0)
  }

  fn failure_path(&self, key: &ObjectHash) -> PathBuf {
    self.root.join(FAILURES_DIR).join(format!("{}.json", key.0))
  }

  /// Artifact directory of a committed success entry.
  pub fn artifact_dir(&self, key: &ObjectHash) -> PathBuf {
    self.object_dir(key).join(ARTIFACT_DIR)
  }

  /// Look up a key. Success entries take precedence over failure entries.
  ///
  /// A success entry whose artifact no longer matches its recorded hash is an error,
  /// never a hit. The artifact is hashed on the first lookup through this handle only.
  pub fn lookup(&self, key: &ObjectHash) -> Result<Lookup, CacheError> {
    let entry_path = self.object_dir(key).join(ENTRY_FILENAME);
    if let Some(entry) = read_entry(&entry_path)? {
      let artifact = self.artifact_dir(key);
      if let Some(expected) = &entry.artifact_hash
        && !self.is_verified(key)
      {
        let actual = hash_directory(&artifact)?;
        if &actual.0 != expected {
          return Err(CacheError::Corrupted {
            key: key.clone(),
            expected: expected.clone(),
            actual: actual.0,
          });
        }
        self.set_verified(key, true);
      }
      return Ok(Lookup::Hit { entry, artifact });
    }

    match read_entry(&self.failure_path(key))? {
      Some(entry) => Ok(Lookup::Failed(entry)),
      None => Ok(Lookup::Miss),
    }
  }

  /// Whether any entry (success or failure) exists for `key`.
  pub fn contains(&self, key: &ObjectHash) -> bool {
    self.object_dir(key).join(ENTRY_FILENAME).exists() || self.failure_path(key).exists()
  }

  /// Create a staging area for building `key`.
  pub fn stage(&self, key: &ObjectHash) -> Result<Staging, CacheError> {
    let write_err = |source| CacheError::Write { key: key.clone(), source };

    let tmp = self.ensure_dir(TMP_DIR)?;
    let dir = tempfile::Builder::new()
      .prefix(&format!("{}-{}-", key.0, std::process::id()))
      .tempdir_in(&tmp)
      .map_err(write_err)?;
    fs::create_dir(dir.path().join(ARTIFACT_DIR)).map_err(write_err)?;

    Ok(Staging { dir, key: key.clone() })
  }

  /// Commit a staged successful build.
  pub fn commit_success(&self, staging: Staging, mut entry: CacheEntry) -> Result<CommitStatus, CacheError> {
    let key = staging.key.clone();
    let write_err = |source| CacheError::Write { key: key.clone(), source };

    entry.artifact_hash = Some(hash_directory(&staging.out_dir())?.0);
    let content = serde_json::to_string_pretty(&entry).map_err(|e| write_err(io::Error::other(e)))?;
    fs::write(staging.dir.path().join(ENTRY_FILENAME), content).map_err(write_err)?;

    self.ensure_dir(OBJECTS_DIR)?;
    let target = self.object_dir(&key);
    if target.exists() {
      debug!(key = %key, "entry already present, discarding staged build");
      return Ok(CommitStatus::AlreadyPresent);
    }

    match fs::rename(staging.dir.path(), &target) {
      Ok(()) => {
        info!(key = %key, "stored artifact");
        Ok(CommitStatus::Stored)
      }
      // Lost the race to another writer of the same key.
      Err(_) if target.join(ENTRY_FILENAME).exists() => {
        debug!(key = %key, "concurrent writer stored entry first");
        Ok(CommitStatus::AlreadyPresent)
      }
      Err(e) => Err(write_err(e)),
    }
  }

  /// Record a failed build. Never replaces an existing failure record.
  pub fn store_failure(&self, entry: &CacheEntry) -> Result<CommitStatus, CacheError> {
    let key = &entry.key;
    let write_err = |source| CacheError::Write { key: key.clone(), source };

    let target = self.failure_path(key);
    if target.exists() {
      return Ok(CommitStatus::AlreadyPresent);
    }

    self.ensure_dir(FAILURES_DIR)?;
    let mut file = tempfile::NamedTempFile::new_in(self.ensure_dir(TMP_DIR)?).map_err(write_err)?;
    serde_json::to_writer_pretty(&mut file, entry).map_err(|e| write_err(io::Error::other(e)))?;
    file.flush().map_err(write_err)?;

    match file.persist_noclobber(&target) {
      Ok(_) => {
        debug!(key = %key, "stored failure entry");
        Ok(CommitStatus::Stored)
      }
      Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists || target.exists() => Ok(CommitStatus::AlreadyPresent),
      Err(e) => Err(write_err(e.error)),
    }
  }

  /// Move unusable entries for `key` out of the way so the key can be rebuilt.
  pub fn discard(&self, key: &ObjectHash) -> Result<(), CacheError> {
    let write_err = |source| CacheError::Write { key: key.clone(), source };
    self.set_verified(key, false);

    let failure = self.failure_path(key);
    if failure.exists() {
      fs::remove_file(&failure).map_err(write_err)?;
    }

    let dir = self.object_dir(key);
    if !dir.exists() {
      return Ok(());
    }

    let graveyard = tempfile::Builder::new()
      .prefix(&format!("{}-discard-", key.0))
      .tempdir_in(self.ensure_dir(TMP_DIR)?)
      .map_err(write_err)?;
    fs::rename(&dir, graveyard.path().join(ARTIFACT_DIR)).map_err(write_err)?;
    warn!(key = %key, "discarded unusable cache entry");
    Ok(())
  }

  /// Keys with a success entry, sorted.
  pub fn success_keys(&self) -> Result<Vec<ObjectHash>, CacheError> {
    list_names(&self.root.join(OBJECTS_DIR), |path, name| {
      path.is_dir().then(|| ObjectHash(name.to_string()))
    })
  }

  /// Keys with a failure entry, sorted.
  pub fn failure_keys(&self) -> Result<Vec<ObjectHash>, CacheError> {
    list_names(&self.root.join(FAILURES_DIR), |_, name| {
      name.strip_suffix(".json").map(|k| ObjectHash(k.to_string()))
    })
  }

  pub(crate) fn object_path(&self, key: &ObjectHash) -> PathBuf {
    self.object_dir(key)
  }

  pub(crate) fn failure_file(&self, key: &ObjectHash) -> PathBuf {
    self.failure_path(key)
  }

  pub(crate) fn tmp_dir(&self) -> PathBuf {
    self.root.join(TMP_DIR)
  }
}

fn read_entry(path: &Path) -> Result<Option<CacheEntry>, CacheError> {
  let content = match fs::read_to_string(path) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
    Err(source) => {
      return Err(CacheError::Read {
        path: path.to_path_buf(),
        source,
      });
    }
  };

  let entry: CacheEntry = serde_json::from_str(&content).map_err(|e| CacheError::Parse {
    path: path.to_path_buf(),
    message: e.to_string(),
  })?;

  if entry.version != ENTRY_VERSION {
    return Err(CacheError::UnsupportedVersion {
      path: path.to_path_buf(),
      version: entry.version,
    });
  }

  Ok(Some(entry))
}

fn list_names<F>(dir: &Path, mut select: F) -> Result<Vec<ObjectHash>, CacheError>
where
  F: FnMut(&Path, &str) -> Option<ObjectHash>,
{
  let entries = match fs::read_dir(dir) {
    Ok(entries) => entries,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(source) => {
      return Err(CacheError::Read {
        path: dir.to_path_buf(),
        source,
      });
    }
  };

  let mut keys: Vec<ObjectHash> = entries
    .flatten()
    .filter_map(|entry| {
      let path = entry.path();
      let name = entry.file_name().to_str()?.to_string();
      select(&path, &name)
    })
    .collect();
  keys.sort();
  Ok(keys)
}

//! Invalidation tracking across invocations.
//!
//! Each invocation records the key of every planned instance. The next invocation
//! compares its keys with that record and with the cache to explain, per instance,
//! whether it is a cache hit or why it must be built.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{ArtifactCache, Lookup};
use crate::util::hash::ObjectHash;
use crate::variant::BuildPlan;

pub const RECORD_VERSION: u32 = 1;

const INVOCATIONS_DIR: &str = "invocations";
const LAST_FILENAME: &str = "last.json";

/// Keys of the instances planned by one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationRecord {
  pub version: u32,
  pub created_at_unix: u64,
  /// Instance identity (as displayed) → cache key.
  pub keys: BTreeMap<String, ObjectHash>,
}

impl InvocationRecord {
  pub fn from_plan(plan: &BuildPlan) -> Self {
    Self {
      version: RECORD_VERSION,
      created_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
      keys: plan
        .instances
        .iter()
        .map(|i| (i.id.to_string(), i.key.clone()))
        .collect(),
    }
  }

  pub fn contains_key(&self, key: &ObjectHash) -> bool {
    self.keys.values().any(|k| k == key)
  }
}

#[derive(Debug, Error)]
pub enum RecordError {
  #[error("failed to create invocations directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to read invocation record: {0}")]
  Read(#[source] io::Error),

  #[error("failed to parse invocation record: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("unsupported invocation record version: {0}")]
  UnsupportedVersion(u32),

  #[error("failed to serialize invocation record: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("failed to write invocation record: {0}")]
  Write(#[source] io::Error),
}

/// Location of the previous invocation's record inside a cache root.
#[derive(Debug, Clone)]
pub struct RecordStore {
  dir: PathBuf,
}

impl RecordStore {
  pub fn new(cache_root: &Path) -> Self {
    Self {
      dir: cache_root.join(INVOCATIONS_DIR),
    }
  }

  pub fn path(&self) -> PathBuf {
    self.dir.join(LAST_FILENAME)
  }

  /// Load the last record; `None` if no invocation has completed yet.
  pub fn load(&self) -> Result<Option<InvocationRecord>, RecordError> {
    let content = match fs::read_to_string(self.path()) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(RecordError::Read(e)),
    };

    let record: InvocationRecord = serde_json::from_str(&content).map_err(RecordError::Parse)?;
    if record.version != RECORD_VERSION {
      return Err(RecordError::UnsupportedVersion(record.version));
    }
    Ok(Some(record))
  }

  /// Replace the last record atomically (write to temp, then rename).
  pub fn save(&self, record: &InvocationRecord) -> Result<(), RecordError> {
    fs::create_dir_all(&self.dir).map_err(RecordError::CreateDir)?;

    let path = self.path();
    let temp_path = self.dir.join(format!("{LAST_FILENAME}.{}.tmp", std::process::id()));

    let content = serde_json::to_string_pretty(record).map_err(RecordError::Serialize)?;
    fs::write(&temp_path, &content).map_err(RecordError::Write)?;
    fs::rename(&temp_path, &path).map_err(RecordError::Write)?;

    debug!(path = ?path, instances = record.keys.len(), "saved invocation record");
    Ok(())
  }
}

/// Why an instance has to be built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RebuildReason {
  /// Never seen by a previous invocation.
  New,
  /// Seen before under a different key.
  InputsChanged { previous: ObjectHash },
  /// Same key as before but its entry is gone.
  Evicted,
  /// A cached failure is being retried.
  PreviousFailure,
  /// The cache entry could not be used.
  CacheUnreadable { message: String },
}

impl fmt::Display for RebuildReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RebuildReason::New => write!(f, "new"),
      RebuildReason::InputsChanged { .. } => write!(f, "inputs changed"),
      RebuildReason::Evicted => write!(f, "evicted"),
      RebuildReason::PreviousFailure => write!(f, "previous failure"),
      RebuildReason::CacheUnreadable { message } => write!(f, "cache unreadable: {message}"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Classification {
  CacheHit,
  /// A failure entry exists and will be replayed.
  CachedFailure,
  MustBuild { reason: RebuildReason },
}

impl Classification {
  pub fn must_build(&self) -> bool {
    matches!(self, Classification::MustBuild { .. })
  }
}

impl fmt::Display for Classification {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Classification::CacheHit => write!(f, "cache-hit"),
      Classification::CachedFailure => write!(f, "cached failure"),
      Classification::MustBuild { reason } => write!(f, "must-build ({reason})"),
    }
  }
}

/// Classification of every instance of a plan, indexed like `plan.instances`.
#[derive(Debug, Clone, Default)]
pub struct IncrementalPlan {
  pub classifications: Vec<Classification>,
  pub warnings: Vec<String>,
}

impl IncrementalPlan {
  pub fn must_build_count(&self) -> usize {
    self.classifications.iter().filter(|c| c.must_build()).count()
  }
}

/// Classify every planned instance against the cache and the previous record.
pub fn classify(
  plan: &BuildPlan,
  previous: Option<&InvocationRecord>,
  cache: &ArtifactCache,
  retry_failed: bool,
) -> IncrementalPlan {
  let mut result = IncrementalPlan::default();

  for instance in &plan.instances {
    let id = instance.id.to_string();
    let classification = match cache.lookup(&instance.key) {
      Ok(Lookup::Hit { .. }) => Classification::CacheHit,
      Ok(Lookup::Failed(_)) if retry_failed => Classification::MustBuild {
        reason: RebuildReason::PreviousFailure,
      },
      Ok(Lookup::Failed(_)) => Classification::CachedFailure,
      Ok(Lookup::Miss) => {
        let reason = match previous.and_then(|record| record.keys.get(&id)) {
          None => RebuildReason::New,
          Some(previous) if previous == &instance.key => RebuildReason::Evicted,
          Some(previous) => RebuildReason::InputsChanged {
            previous: previous.clone(),
          },
        };
        Classification::MustBuild { reason }
      }
      Err(e) => {
        warn!(instance = %id, key = %instance.key, error = %e, "cache entry unusable, will rebuild");
        result.warnings.push(format!("{id}: {e}"));
        Classification::MustBuild {
          reason: RebuildReason::CacheUnreadable { message: e.to_string() },
        }
      }
    };

    debug!(instance = %id, key = %instance.key, classification = %classification, "classified instance");
    result.classifications.push(classification);
  }

  info!(
    instances = plan.instances.len(),
    must_build = result.must_build_count(),
    "classified instances"
  );

  result
}

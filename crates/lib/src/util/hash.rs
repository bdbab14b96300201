//! Hashing utilities for cache keys and artifact verification.
//!
//! This module provides:
//! - `ObjectHash`: a truncated 20-character hash used as a cache key
//! - `ContentHash`: a full 64-character hash of source text or artifact contents
//! - `hash_directory()`: deterministic hashing of a staged artifact directory
//! - `hash_bytes()`: arbitrary byte hashing

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::consts::OBJ_HASH_PREFIX_LEN;

pub type HashError = serde_json::Error;

/// A content-derived cache key.
///
/// The hash is a 20-character truncated SHA-256 of the JSON-serialized key inputs.
/// Identical inputs always serialize identically (maps are ordered), so identical
/// inputs always produce identical keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectHash(pub String);

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<ObjectHash, HashError> {
    let serialized = serde_json::to_string(self)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    let full = format!("{:x}", hasher.finalize());
    Ok(ObjectHash(full[..OBJ_HASH_PREFIX_LEN].to_string()))
  }
}

/// A full 64-character SHA-256 hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Failure to digest a staged or committed artifact directory.
#[derive(Debug, thiserror::Error)]
pub enum DirHashError {
  #[error("cannot walk {}: {source}", .root.display())]
  Walk {
    root: std::path::PathBuf,
    #[source]
    source: walkdir::Error,
  },

  #[error("cannot read {}: {source}", .path.display())]
  Read {
    path: std::path::PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Digest of an artifact directory: one `F:<path>:<sha>` or `D:<path>` line per entry,
/// in sorted order. Timestamps and permissions are ignored.
pub fn hash_directory(root: &Path) -> Result<ContentHash, DirHashError> {
  let mut digest = Sha256::new();

  for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
    let entry = entry.map_err(|source| DirHashError::Walk {
      root: root.to_path_buf(),
      source,
    })?;
    let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
    let relative = relative.to_string_lossy().replace('\\', "/");

    if entry.file_type().is_file() {
      let file_hash = hash_file(entry.path())?;
      digest.update(format!("F:{relative}:{file_hash}\n").as_bytes());
    } else if entry.file_type().is_dir() {
      digest.update(format!("D:{relative}\n").as_bytes());
    }
  }

  Ok(ContentHash(format!("{:x}", digest.finalize())))
}

/// Streaming SHA-256 of one file.
pub fn hash_file(path: &Path) -> Result<ContentHash, DirHashError> {
  let read_err = |source| DirHashError::Read {
    path: path.to_path_buf(),
    source,
  };
  let mut file = fs::File::open(path).map_err(read_err)?;
  let mut digest = Sha256::new();
  io::copy(&mut file, &mut digest).map_err(read_err)?;
  Ok(ContentHash(format!("{:x}", digest.finalize())))
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(format!("{:x}", hasher.finalize()))
}

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::UnitId;
use crate::util::hash::{ContentHash, Hashable, ObjectHash};

/// Canonical encoding of an option value.
///
/// Boolean spellings collapse to `"1"`/`"0"`; everything else is kept trimmed.
pub fn normalize_value(value: &str) -> String {
  let trimmed = value.trim();
  match trimmed.to_ascii_lowercase().as_str() {
    "on" | "true" | "yes" | "1" => "1".to_string(),
    "off" | "false" | "no" | "0" => "0".to_string(),
    _ => trimmed.to_string(),
  }
}

/// A normalized option name → value mapping.
///
/// Two variants are equal iff their normalized mappings are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigVariant(BTreeMap<String, String>);

impl ConfigVariant {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, key: &str, value: &str) {
    let key = key.trim();
    if !key.is_empty() {
      self.0.insert(key.to_string(), normalize_value(value));
    }
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self.0.get(key).map(String::as_str)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.0.keys().map(String::as_str)
  }

  /// Keep only the options in `surface`.
  pub fn restrict(&self, surface: &BTreeSet<String>) -> Self {
    ConfigVariant(
      self
        .0
        .iter()
        .filter(|(k, _)| surface.contains(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    )
  }

  /// `self` with every option of `other` taking precedence.
  pub fn overlay(&self, other: &ConfigVariant) -> Self {
    let mut merged = self.0.clone();
    merged.extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
    ConfigVariant(merged)
  }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for ConfigVariant {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    let mut variant = ConfigVariant::new();
    for (k, v) in iter {
      variant.insert(k.as_ref(), v.as_ref());
    }
    variant
  }
}

impl fmt::Display for ConfigVariant {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
    write!(f, "{}", parts.join(","))
  }
}

/// Identity of a build instance: a unit under one variant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId {
  pub unit: UnitId,
  pub variant: ConfigVariant,
}

impl fmt::Display for InstanceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.variant.is_empty() {
      write!(f, "{}", self.unit)
    } else {
      write!(f, "{}[{}]", self.unit, self.variant)
    }
  }
}

/// Manifest-declared configuration surface of one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitConfig {
  /// Options the unit recognizes beyond its scanned macro requirements.
  pub options: BTreeSet<String>,
  /// Permitted values per option; options without an entry accept anything.
  pub allowed: BTreeMap<String, BTreeSet<String>>,
  /// Values fixed for this unit and everything it depends on.
  pub pins: ConfigVariant,
}

/// A configuration the invocation must build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantRequest {
  pub name: String,
  pub options: ConfigVariant,
  /// Root units; `None` means every unit.
  pub targets: Option<Vec<UnitId>>,
}

impl VariantRequest {
  pub fn new(name: impl Into<String>, options: ConfigVariant) -> Self {
    Self {
      name: name.into(),
      options,
      targets: None,
    }
  }
}

/// Everything that determines an instance's cache key.
#[derive(Debug, Serialize)]
pub(crate) struct KeyInputs<'a> {
  pub version: u32,
  pub unit: &'a UnitId,
  pub content: &'a ContentHash,
  pub dependencies: Vec<&'a ObjectHash>,
  pub variant: &'a ConfigVariant,
  pub toolchain: &'a str,
  pub artifact: Option<&'a str>,
}

impl Hashable for KeyInputs<'_> {}

/// One schedulable (unit, variant) pair.
#[derive(Debug, Clone, Serialize)]
pub struct BuildInstance {
  pub id: InstanceId,
  /// Graph index of the unit.
  #[serde(skip)]
  pub unit: usize,
  pub artifact: Option<String>,
  pub source: PathBuf,
  pub content_hash: ContentHash,
  /// Plan indices of dependency instances, in declaration order.
  pub dependencies: Vec<usize>,
  pub key: ObjectHash,
  /// 0 for instances without dependencies.
  pub depth: usize,
  pub order: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VariantError {
  #[error(
    "variant incompatibility: {consumer} requires {option}={value} but {producer} only allows [{}]",
    .allowed.join(", ")
  )]
  Incompatible {
    consumer: String,
    producer: UnitId,
    option: String,
    value: String,
    allowed: Vec<String>,
  },

  #[error("link conflict: {instance} would link {unit} under both [{}]", .variants.join("] and ["))]
  LinkConflict {
    instance: String,
    unit: UnitId,
    variants: Vec<String>,
  },

  #[error("failed to compute cache key for {instance}: {message}")]
  Key { instance: String, message: String },
}

/// An instance that could not be planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedInstance {
  pub instance: String,
  pub reason: String,
}

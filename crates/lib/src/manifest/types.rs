//! Manifest file types.
//!
//! These mirror `modbuild.toml` one-to-one. Conversion into the types the pipeline
//! consumes lives in the parent module.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;

use crate::execute::CompletionOrder;
use crate::graph::MixedModePolicy;

pub(super) fn default_extensions() -> Vec<String> {
  ["cppm", "ixx", "mpp", "cpp", "cc", "cxx", "h", "hpp"]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_dirs() -> Vec<String> {
  vec![".".to_string()]
}

/// An option value as written in TOML: `"posix"`, `true` or `3` are all accepted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
  Bool(bool),
  Int(i64),
  Text(String),
}

impl fmt::Display for OptionValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OptionValue::Bool(b) => write!(f, "{b}"),
      OptionValue::Int(n) => write!(f, "{n}"),
      OptionValue::Text(s) => write!(f, "{s}"),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectSection {
  #[serde(default)]
  pub name: String,
  /// Toolchain identity folded into every cache key.
  #[serde(default)]
  pub toolchain: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildSection {
  /// Command template for the build step.
  pub command: Option<String>,
  /// Shell used to run `command`; the platform default when absent.
  pub shell: Option<String>,
  pub parallelism: Option<usize>,
  #[serde(default)]
  pub fail_fast: bool,
  #[serde(default)]
  pub retry_failed: bool,
  #[serde(default)]
  pub ordering: CompletionOrder,
  #[serde(default)]
  pub mixed_mode: MixedModePolicy,
  /// Cache directory, relative to the manifest. `MODBUILD_CACHE` and the platform
  /// cache directory apply when absent.
  pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourcesSection {
  #[serde(default = "default_dirs")]
  pub dirs: Vec<String>,
  #[serde(default = "default_extensions")]
  pub extensions: Vec<String>,
  /// Directory names skipped while walking.
  #[serde(default)]
  pub exclude: Vec<String>,
}

impl Default for SourcesSection {
  fn default() -> Self {
    Self {
      dirs: default_dirs(),
      extensions: default_extensions(),
      exclude: Vec::new(),
    }
  }
}

/// `[[unit]]`: configuration surface of one unit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitDecl {
  pub path: String,
  #[serde(default)]
  pub options: Vec<String>,
  #[serde(default)]
  pub allowed: BTreeMap<String, Vec<OptionValue>>,
  #[serde(default)]
  pub pin: BTreeMap<String, OptionValue>,
}

/// `[[variant]]`: one requested configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariantDecl {
  pub name: String,
  #[serde(default)]
  pub options: BTreeMap<String, OptionValue>,
  pub targets: Option<Vec<String>>,
}

/// Parsed `modbuild.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestFile {
  #[serde(default)]
  pub project: ProjectSection,
  #[serde(default)]
  pub build: BuildSection,
  #[serde(default)]
  pub sources: SourcesSection,
  #[serde(default, rename = "unit")]
  pub units: Vec<UnitDecl>,
  #[serde(default, rename = "variant")]
  pub variants: Vec<VariantDecl>,
}

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scan::DependencyKind;
use crate::types::UnitId;

/// How strictly a unit may combine importing an artifact with textually including its producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MixedModePolicy {
  #[default]
  Strict,
  Lenient,
}

impl std::str::FromStr for MixedModePolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "strict" => Ok(MixedModePolicy::Strict),
      "lenient" => Ok(MixedModePolicy::Lenient),
      other => Err(format!("unknown mixed-mode policy '{other}' (expected strict or lenient)")),
    }
  }
}

fn join_ids(ids: &[UnitId]) -> String {
  ids.iter().map(UnitId::as_str).collect::<Vec<_>>().join(", ")
}

fn cycle_path(ids: &[UnitId]) -> String {
  ids.iter().map(UnitId::as_str).collect::<Vec<_>>().join(" -> ")
}

/// Graph-construction errors. Each is fatal only to the units it names and their consumers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
  #[error("ambiguous producer: artifact '{artifact}' is exported by {}", join_ids(.producers))]
  AmbiguousProducer { artifact: String, producers: Vec<UnitId> },

  #[error("unknown dependency: {unit} imports '{name}', which no unit exports")]
  UnknownDependency { unit: UnitId, name: String },

  #[error("mixed-mode dependency in {unit}: {detail}")]
  MixedMode { unit: UnitId, detail: String },

  #[error("cyclic dependency: {}", cycle_path(.cycle))]
  Cycle { cycle: Vec<UnitId> },
}

/// Why a unit produces no build instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "kebab-case")]
pub enum BlockReason {
  ScanFailed,
  AmbiguousProducer(String),
  UnknownDependency(String),
  MixedMode,
  Cycle,
  /// A unit this one depends on (directly or transitively) is blocked.
  Upstream(UnitId),
}

impl fmt::Display for BlockReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BlockReason::ScanFailed => write!(f, "scan errors"),
      BlockReason::AmbiguousProducer(name) => write!(f, "ambiguous producer for '{name}'"),
      BlockReason::UnknownDependency(name) => write!(f, "unknown dependency '{name}'"),
      BlockReason::MixedMode => write!(f, "mixed-mode dependency"),
      BlockReason::Cycle => write!(f, "dependency cycle"),
      BlockReason::Upstream(unit) => write!(f, "upstream graph error in {unit}"),
    }
  }
}

/// A resolved unit-level dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitEdge {
  /// Index of the producing unit.
  pub producer: usize,
  pub kind: DependencyKind,
  /// Artifact name or include path as written.
  pub name: String,
}

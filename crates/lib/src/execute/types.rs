//! Types for plan execution.
//!
//! This module defines the configuration, per-instance outcomes and the aggregate
//! result of running a [`BuildPlan`](crate::variant::BuildPlan).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::PARALLELISM_ENV;

/// Why an instance was not attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum SkipReason {
  /// A dependency (directly or transitively) failed.
  DependencyFailed { dependency: String },
  /// Fail-fast stopped the invocation before this instance started.
  Cancelled,
}

impl fmt::Display for SkipReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SkipReason::DependencyFailed { dependency } => write!(f, "dependency failed: {dependency}"),
      SkipReason::Cancelled => write!(f, "cancelled"),
    }
  }
}

/// Final state of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum InstanceOutcome {
  /// The build step ran and succeeded.
  Built,
  /// A valid success entry existed; the step was not invoked.
  CacheHit,
  /// The step failed, or a cached failure was replayed (`cached`).
  Failed { diagnostic: String, cached: bool },
  Skipped { skip: SkipReason },
}

impl InstanceOutcome {
  pub fn is_success(&self) -> bool {
    matches!(self, InstanceOutcome::Built | InstanceOutcome::CacheHit)
  }
}

impl fmt::Display for InstanceOutcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      InstanceOutcome::Built => write!(f, "built"),
      InstanceOutcome::CacheHit => write!(f, "cache-hit"),
      InstanceOutcome::Failed { cached: true, .. } => write!(f, "failed (cached)"),
      InstanceOutcome::Failed { .. } => write!(f, "failed"),
      InstanceOutcome::Skipped { skip } => write!(f, "skipped ({skip})"),
    }
  }
}

/// How dispatch and failure events are reported. Scheduling itself always reacts to
/// completions as they arrive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionOrder {
  /// Events are reported in (depth, plan order), so repeated runs over the same plan
  /// report identically.
  #[default]
  Deterministic,
  /// Events are reported in the order they happened.
  Eager,
}

impl std::str::FromStr for CompletionOrder {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "deterministic" => Ok(CompletionOrder::Deterministic),
      "eager" => Ok(CompletionOrder::Eager),
      other => Err(format!("unknown ordering '{other}' (expected deterministic or eager)")),
    }
  }
}

/// Configuration for plan execution.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Maximum number of build steps running at once.
  pub parallelism: usize,
  /// Stop dispatching after the first failure.
  pub fail_fast: bool,
  /// Rebuild instances with a cached failure instead of replaying it.
  pub retry_failed: bool,
  pub ordering: CompletionOrder,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      parallelism: default_parallelism(),
      fail_fast: false,
      retry_failed: false,
      ordering: CompletionOrder::default(),
    }
  }
}

/// Worker count from `MODBUILD_PARALLELISM`, else the number of available cores.
pub fn default_parallelism() -> usize {
  if let Ok(value) = std::env::var(PARALLELISM_ENV)
    && let Ok(n) = value.trim().parse::<usize>()
    && n > 0
  {
    return n;
  }
  std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// A failed instance and the consumers skipped because of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
  pub instance: usize,
  pub skipped: Vec<usize>,
}

/// Result of executing a plan. `outcomes` is indexed like `plan.instances`.
#[derive(Debug, Default)]
pub struct ExecutionResult {
  pub outcomes: Vec<InstanceOutcome>,
  /// Dispatched plan indices. Deterministic ordering lists them by scheduling
  /// priority; eager ordering lists them as they were dispatched.
  pub dispatch_order: Vec<usize>,
  /// Failures in the order they were observed.
  pub failures: Vec<FailureRecord>,
  /// Number of times the build step was invoked.
  pub step_invocations: usize,
  pub warnings: Vec<String>,
}

impl ExecutionResult {
  fn count(&self, pred: impl Fn(&InstanceOutcome) -> bool) -> usize {
    self.outcomes.iter().filter(|o| pred(o)).count()
  }

  pub fn built(&self) -> usize {
    self.count(|o| matches!(o, InstanceOutcome::Built))
  }

  pub fn cache_hits(&self) -> usize {
    self.count(|o| matches!(o, InstanceOutcome::CacheHit))
  }

  pub fn failed(&self) -> usize {
    self.count(|o| matches!(o, InstanceOutcome::Failed { .. }))
  }

  pub fn skipped(&self) -> usize {
    self.count(|o| matches!(o, InstanceOutcome::Skipped { .. }))
  }

  /// True iff nothing failed or was skipped.
  pub fn is_success(&self) -> bool {
    self.outcomes.iter().all(InstanceOutcome::is_success)
  }
}

/// Errors that abort execution as a whole. Build failures are outcomes, not errors.
#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error("plan is inconsistent: {0}")]
  InvalidPlan(String),
}

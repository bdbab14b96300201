//! Per-invocation report.
//!
//! Collects everything an invocation learned (scan, graph and variant errors,
//! warnings, per-instance keys, classifications and outcomes) into one serializable
//! value with a plain-text rendering.

use std::fmt;

use serde::Serialize;

use crate::execute::{ExecutionResult, InstanceOutcome};
use crate::graph::ModuleGraph;
use crate::invalidation::{Classification, IncrementalPlan};
use crate::util::hash::ObjectHash;
use crate::variant::BuildPlan;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
  pub built: usize,
  pub cache_hits: usize,
  pub failed: usize,
  pub skipped: usize,
  /// Units and instances that could not be planned.
  pub blocked: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceReport {
  pub instance: String,
  pub key: ObjectHash,
  pub depth: usize,
  /// Cache state before execution.
  pub classification: Classification,
  /// `None` when the plan was not executed.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub outcome: Option<InstanceOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
  pub instance: String,
  pub diagnostic: String,
  pub cached: bool,
  /// Consumers skipped because of this failure.
  pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedReport {
  pub subject: String,
  pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
  pub summary: Summary,
  pub errors: Vec<String>,
  pub warnings: Vec<String>,
  pub blocked: Vec<BlockedReport>,
  pub failures: Vec<FailureReport>,
  pub instances: Vec<InstanceReport>,
  pub dispatch_order: Vec<String>,
}

impl Report {
  /// Report for a planned but not executed invocation.
  pub fn planned(graph: &ModuleGraph, plan: &BuildPlan, incremental: &IncrementalPlan) -> Self {
    let mut report = Report::default();

    for unit in graph.units() {
      for error in &unit.errors {
        report.errors.push(format!("{}: {error}", unit.id));
      }
    }
    report.errors.extend(graph.errors().iter().map(ToString::to_string));
    report.errors.extend(plan.errors.iter().map(ToString::to_string));

    report.warnings.extend(graph.warnings().iter().cloned());
    report.warnings.extend(plan.warnings.iter().cloned());
    report.warnings.extend(incremental.warnings.iter().cloned());

    report.blocked.extend(graph.blocked().map(|(unit, reason)| BlockedReport {
      subject: unit.to_string(),
      reason: reason.to_string(),
    }));
    report.blocked.extend(plan.blocked.iter().map(|b| BlockedReport {
      subject: b.instance.clone(),
      reason: b.reason.clone(),
    }));
    report.summary.blocked = report.blocked.len();

    report.instances = plan
      .instances
      .iter()
      .zip(&incremental.classifications)
      .map(|(instance, classification)| InstanceReport {
        instance: instance.id.to_string(),
        key: instance.key.clone(),
        depth: instance.depth,
        classification: classification.clone(),
        outcome: None,
      })
      .collect();

    report
  }

  /// Report for an executed invocation.
  ///
  /// Warnings raised during execution replace the classification warnings, which
  /// describe the same cache entries.
  pub fn executed(
    graph: &ModuleGraph,
    plan: &BuildPlan,
    incremental: &IncrementalPlan,
    result: &ExecutionResult,
  ) -> Self {
    let mut report = Self::planned(graph, plan, &IncrementalPlan {
      classifications: incremental.classifications.clone(),
      warnings: Vec::new(),
    });
    report.warnings.extend(result.warnings.iter().cloned());

    let label = |idx: usize| plan.instances[idx].id.to_string();

    for (instance, outcome) in report.instances.iter_mut().zip(&result.outcomes) {
      instance.outcome = Some(outcome.clone());
    }
    report.dispatch_order = result.dispatch_order.iter().map(|&i| label(i)).collect();

    report.failures = result
      .failures
      .iter()
      .map(|failure| {
        let (diagnostic, cached) = match &result.outcomes[failure.instance] {
          InstanceOutcome::Failed { diagnostic, cached } => (diagnostic.clone(), *cached),
          _ => (String::new(), false),
        };
        FailureReport {
          instance: label(failure.instance),
          diagnostic,
          cached,
          skipped: failure.skipped.iter().map(|&i| label(i)).collect(),
        }
      })
      .collect();

    report.summary.built = result.built();
    report.summary.cache_hits = result.cache_hits();
    report.summary.failed = result.failed();
    report.summary.skipped = result.skipped();
    report
  }

  /// True iff nothing failed, nothing was skipped and no error was reported.
  pub fn is_success(&self) -> bool {
    self.errors.is_empty() && self.summary.failed == 0 && self.summary.skipped == 0
  }

  pub fn exit_code(&self) -> i32 {
    if self.is_success() { 0 } else { 1 }
  }

  pub fn to_json(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(self)
  }
}

impl fmt::Display for Summary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} built, {} cache-hit, {} failed, {} skipped",
      self.built, self.cache_hits, self.failed, self.skipped
    )?;
    if self.blocked > 0 {
      write!(f, ", {} blocked", self.blocked)?;
    }
    Ok(())
  }
}

impl fmt::Display for Report {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for error in &self.errors {
      writeln!(f, "error: {error}")?;
    }
    for warning in &self.warnings {
      writeln!(f, "warning: {warning}")?;
    }
    for blocked in &self.blocked {
      writeln!(f, "blocked: {} ({})", blocked.subject, blocked.reason)?;
    }

    for failure in &self.failures {
      let cached = if failure.cached { " (cached)" } else { "" };
      writeln!(f, "FAILED {}{cached}", failure.instance)?;
      for line in failure.diagnostic.lines() {
        writeln!(f, "  | {line}")?;
      }
      if !failure.skipped.is_empty() {
        writeln!(f, "  skipped: {}", failure.skipped.join(", "))?;
      }
    }

    write!(f, "{}", self.summary)
  }
}

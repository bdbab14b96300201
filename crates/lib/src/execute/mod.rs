//! Plan execution.
//!
//! Runs a [`BuildPlan`] on a bounded worker pool. An instance is dispatched once all
//! of its dependencies have succeeded; among ready instances the one with the lowest
//! depth goes first, then the lowest plan order. Each worker consults the cache off
//! the executor thread before building, so cache hits and replayed failures come back
//! as ordinary completions and the dispatch loop only ever waits for the next one.
//!
//! A failure marks every transitive dependent as skipped. With `fail_fast` nothing new
//! is dispatched after the first failure, in-flight builds run to completion and
//! everything left over is reported as cancelled.

mod step;
mod types;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{ArtifactCache, CacheEntry, CacheError, CommitStatus, Lookup};
use crate::variant::BuildPlan;

pub use step::{BuildRequest, BuildStep, CommandStep, DependencyArtifact, StepOutput};
pub use types::{
  CompletionOrder, ExecuteConfig, ExecuteError, ExecutionResult, FailureRecord, InstanceOutcome, SkipReason,
  default_parallelism,
};

/// A finished worker.
struct Completion {
  idx: usize,
  outcome: InstanceOutcome,
  invoked: bool,
  warnings: Vec<String>,
}

impl Completion {
  fn failed(idx: usize, diagnostic: String, invoked: bool, warnings: Vec<String>) -> Self {
    Self {
      idx,
      outcome: InstanceOutcome::Failed {
        diagnostic,
        cached: false,
      },
      invoked,
      warnings,
    }
  }
}

/// Execute every instance of `plan` against `cache`.
///
/// Build failures are reported as outcomes; only a broken plan is an error.
pub async fn execute_plan<S: BuildStep>(
  plan: &BuildPlan,
  cache: &ArtifactCache,
  step: Arc<S>,
  config: &ExecuteConfig,
) -> Result<ExecutionResult, ExecuteError> {
  validate(plan)?;

  let parallelism = config.parallelism.max(1);
  info!(
    instances = plan.len(),
    parallelism,
    ordering = ?config.ordering,
    "executing build plan"
  );

  let mut scheduler = Scheduler::new(plan, config);
  let mut join_set: JoinSet<Completion> = JoinSet::new();

  loop {
    while !scheduler.cancelled && join_set.len() < parallelism {
      let Some(idx) = scheduler.pop_ready() else {
        break;
      };
      scheduler.result.dispatch_order.push(idx);

      let request = scheduler.request(cache, idx);
      debug!(instance = %request.instance, "dispatching");
      join_set.spawn(supervise(
        step.clone(),
        cache.clone(),
        request,
        idx,
        config.retry_failed,
      ));
    }

    let Some(joined) = join_set.join_next().await else {
      break;
    };
    let completion = match joined {
      Ok(completion) => completion,
      Err(e) => {
        // The supervisor itself never panics; only runtime shutdown gets here.
        warn!(error = %e, "lost a worker task");
        scheduler.warnings.push((None, format!("lost a worker task: {e}")));
        continue;
      }
    };

    let idx = completion.idx;
    scheduler
      .warnings
      .extend(completion.warnings.into_iter().map(|w| (Some(idx), w)));
    if completion.invoked {
      scheduler.result.step_invocations += 1;
    }
    scheduler.finish(idx, completion.outcome);
  }

  Ok(scheduler.into_result())
}

/// Reject plans whose dependency indices do not line up.
fn validate(plan: &BuildPlan) -> Result<(), ExecuteError> {
  if plan.dependents.len() != plan.instances.len() {
    return Err(ExecuteError::InvalidPlan(format!(
      "{} instances but {} dependent lists",
      plan.instances.len(),
      plan.dependents.len()
    )));
  }
  for (i, instance) in plan.instances.iter().enumerate() {
    if let Some(&dep) = instance.dependencies.iter().find(|&&d| d >= plan.len() || d == i) {
      return Err(ExecuteError::InvalidPlan(format!(
        "{} depends on missing instance #{dep}",
        instance.id
      )));
    }
  }
  Ok(())
}

/// Scheduling priority: lower depth first, then plan order.
type Priority = (usize, usize, usize);

struct Scheduler<'a> {
  plan: &'a BuildPlan,
  fail_fast: bool,
  ordering: CompletionOrder,
  remaining: Vec<usize>,
  ready: BinaryHeap<Reverse<Priority>>,
  state: Vec<Option<InstanceOutcome>>,
  cancelled: bool,
  warnings: Vec<(Option<usize>, String)>,
  result: ExecutionResult,
}

impl<'a> Scheduler<'a> {
  fn new(plan: &'a BuildPlan, config: &ExecuteConfig) -> Self {
    let remaining: Vec<usize> = plan.instances.iter().map(|i| i.dependencies.len()).collect();
    let mut scheduler = Self {
      plan,
      fail_fast: config.fail_fast,
      ordering: config.ordering,
      ready: BinaryHeap::new(),
      state: vec![None; plan.len()],
      remaining,
      cancelled: false,
      warnings: Vec::new(),
      result: ExecutionResult::default(),
    };
    for idx in 0..plan.len() {
      if scheduler.remaining[idx] == 0 {
        scheduler.push_ready(idx);
      }
    }
    scheduler
  }

  fn priority(&self, idx: usize) -> Priority {
    let instance = &self.plan.instances[idx];
    (instance.depth, instance.order, idx)
  }

  fn push_ready(&mut self, idx: usize) {
    self.ready.push(Reverse(self.priority(idx)));
  }

  fn pop_ready(&mut self) -> Option<usize> {
    self.ready.pop().map(|Reverse((_, _, idx))| idx)
  }

  fn request(&self, cache: &ArtifactCache, idx: usize) -> BuildRequest {
    let instance = &self.plan.instances[idx];
    let dependencies = instance
      .dependencies
      .iter()
      .map(|&d| {
        let dep = &self.plan.instances[d];
        DependencyArtifact {
          instance: dep.id.clone(),
          artifact: dep.artifact.clone(),
          path: cache.artifact_dir(&dep.key),
        }
      })
      .collect();

    BuildRequest {
      instance: instance.id.clone(),
      unit: instance.id.unit.clone(),
      source: instance.source.clone(),
      artifact: instance.artifact.clone(),
      options: instance.id.variant.clone(),
      dependencies,
      out_dir: Default::default(),
      key: instance.key.clone(),
    }
  }

  /// Record an outcome and release or skip the instance's dependents.
  fn finish(&mut self, idx: usize, outcome: InstanceOutcome) {
    let success = outcome.is_success();
    let instance = &self.plan.instances[idx];
    match &outcome {
      InstanceOutcome::Built => info!(instance = %instance.id, "built"),
      InstanceOutcome::CacheHit => {}
      InstanceOutcome::Failed { cached, .. } => warn!(instance = %instance.id, cached, "build failed"),
      InstanceOutcome::Skipped { .. } => {}
    }
    self.state[idx] = Some(outcome);

    if success {
      for &dependent in &self.plan.dependents[idx] {
        self.remaining[dependent] -= 1;
        if self.remaining[dependent] == 0 && self.state[dependent].is_none() {
          self.push_ready(dependent);
        }
      }
      return;
    }

    let skipped = self.skip_dependents(idx);
    self.result.failures.push(FailureRecord { instance: idx, skipped });
    if self.fail_fast && !self.cancelled {
      info!(instance = %self.plan.instances[idx].id, "fail-fast: cancelling remaining work");
      self.cancelled = true;
    }
  }

  /// Mark every undecided transitive dependent of `failed` as skipped.
  fn skip_dependents(&mut self, failed: usize) -> Vec<usize> {
    let dependency = self.plan.instances[failed].id.to_string();
    let mut skipped = Vec::new();
    let mut queue: VecDeque<usize> = self.plan.dependents[failed].iter().copied().collect();

    while let Some(idx) = queue.pop_front() {
      if self.state[idx].is_some() {
        continue;
      }
      debug!(instance = %self.plan.instances[idx].id, dependency = %dependency, "skipping dependent");
      self.state[idx] = Some(InstanceOutcome::Skipped {
        skip: SkipReason::DependencyFailed {
          dependency: dependency.clone(),
        },
      });
      skipped.push(idx);
      queue.extend(self.plan.dependents[idx].iter().copied());
    }

    skipped.sort_unstable();
    skipped
  }

  fn into_result(mut self) -> ExecutionResult {
    // Deterministic runs report in priority order, whatever order completions arrived in.
    if self.ordering == CompletionOrder::Deterministic {
      let mut dispatch = std::mem::take(&mut self.result.dispatch_order);
      dispatch.sort_by_key(|&idx| self.priority(idx));
      self.result.dispatch_order = dispatch;

      let mut failures = std::mem::take(&mut self.result.failures);
      failures.sort_by_key(|f| self.priority(f.instance));
      self.result.failures = failures;

      let mut warnings = std::mem::take(&mut self.warnings);
      warnings.sort_by_key(|(idx, _)| (idx.is_none(), idx.map(|i| self.priority(i))));
      self.warnings = warnings;
    }
    self.result.warnings = self.warnings.into_iter().map(|(_, w)| w).collect();

    self.result.outcomes = self
      .state
      .into_iter()
      .map(|state| {
        state.unwrap_or(InstanceOutcome::Skipped {
          skip: SkipReason::Cancelled,
        })
      })
      .collect();

    info!(
      built = self.result.built(),
      cache_hits = self.result.cache_hits(),
      failed = self.result.failed(),
      skipped = self.result.skipped(),
      "plan execution finished"
    );
    self.result
  }
}

/// Run one instance in its own task; a panic anywhere in it fails only that instance.
async fn supervise<S: BuildStep>(
  step: Arc<S>,
  cache: ArtifactCache,
  request: BuildRequest,
  idx: usize,
  retry_failed: bool,
) -> Completion {
  let label = request.instance.to_string();
  match tokio::spawn(run_instance(step, cache, request, idx, retry_failed)).await {
    Ok(completion) => completion,
    Err(e) => {
      warn!(instance = %label, error = %e, "worker panicked");
      Completion::failed(idx, format!("build step panicked: {e}"), true, Vec::new())
    }
  }
}

/// Answer from the cache if possible, otherwise build.
async fn run_instance<S: BuildStep>(
  step: Arc<S>,
  cache: ArtifactCache,
  request: BuildRequest,
  idx: usize,
  retry_failed: bool,
) -> Completion {
  let label = request.instance.to_string();
  let key = request.key.clone();
  let mut warnings = Vec::new();

  let reader = cache.clone();
  let lookup_key = key.clone();
  let lookup = tokio::task::spawn_blocking(move || reader.lookup(&lookup_key))
    .await
    .unwrap_or_else(|e| Err(CacheError::Task(e.to_string())));

  match lookup {
    Ok(Lookup::Hit { .. }) => {
      debug!(instance = %label, key = %key, "cache hit");
      return Completion {
        idx,
        outcome: InstanceOutcome::CacheHit,
        invoked: false,
        warnings,
      };
    }
    Ok(Lookup::Failed(entry)) if !retry_failed => {
      debug!(instance = %label, key = %key, "replaying cached failure");
      return Completion {
        idx,
        outcome: InstanceOutcome::Failed {
          diagnostic: entry.diagnostic,
          cached: true,
        },
        invoked: false,
        warnings,
      };
    }
    Ok(_) => {}
    Err(e) => {
      warn!(instance = %label, error = %e, "discarding cache entry");
      warnings.push(match &e {
        CacheError::Corrupted { .. } => format!("{label}: {e}; rebuilding"),
        _ => format!("{label}: cache entry unusable ({e}); rebuilding"),
      });
      let discarder = cache.clone();
      let discard_key = key.clone();
      let discarded = tokio::task::spawn_blocking(move || discarder.discard(&discard_key))
        .await
        .unwrap_or_else(|e| Err(CacheError::Task(e.to_string())));
      if let Err(e) = discarded {
        warn!(instance = %label, error = %e, "failed to discard cache entry");
        warnings.push(format!("{label}: {e}"));
      }
    }
  }

  build_instance(step, cache, request, idx, warnings).await
}

/// Build one instance in a fresh staging area and commit the outcome to the cache.
async fn build_instance<S: BuildStep>(
  step: Arc<S>,
  cache: ArtifactCache,
  mut request: BuildRequest,
  idx: usize,
  mut warnings: Vec<String>,
) -> Completion {
  let label = request.instance.to_string();
  let key = request.key.clone();

  let stager = cache.clone();
  let stage_key = key.clone();
  let staging = match tokio::task::spawn_blocking(move || stager.stage(&stage_key))
    .await
    .unwrap_or_else(|e| Err(CacheError::Task(e.to_string())))
  {
    Ok(staging) => staging,
    Err(e) => {
      return Completion::failed(idx, format!("failed to prepare staging area: {e}"), false, warnings);
    }
  };
  request.out_dir = staging.out_dir();

  debug!(instance = %label, "running build step");
  let output = step.build(&request).await;

  let outcome = if output.success {
    let entry = CacheEntry::success(&key, &label, &output.diagnostic);
    let committer = cache.clone();
    let committed = tokio::task::spawn_blocking(move || committer.commit_success(staging, entry))
      .await
      .unwrap_or_else(|e| Err(CacheError::Task(e.to_string())));
    match committed {
      Ok(status) => {
        if status == CommitStatus::AlreadyPresent {
          debug!(instance = %label, "artifact already committed by another writer");
        }
        InstanceOutcome::Built
      }
      Err(e) => InstanceOutcome::Failed {
        diagnostic: format!("failed to store artifact: {e}"),
        cached: false,
      },
    }
  } else {
    let entry = CacheEntry::failure(&key, &label, &output.diagnostic);
    let recorder = cache.clone();
    let recorded = tokio::task::spawn_blocking(move || {
      drop(staging);
      recorder.store_failure(&entry)
    })
      .await
      .unwrap_or_else(|e| Err(CacheError::Task(e.to_string())));
    if let Err(e) = recorded {
      warn!(instance = %label, error = %e, "failed to record build failure");
      warnings.push(format!("{label}: failed to record build failure: {e}"));
    }
    InstanceOutcome::Failed {
      diagnostic: output.diagnostic,
      cached: false,
    }
  };

  Completion {
    idx,
    outcome,
    invoked: true,
    warnings,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::graph::{MixedModePolicy, ModuleGraph};
  use crate::scan::{LexicalScanner, UnitSource, scan_units};
  use crate::types::UnitId;
  use crate::util::testutil::FakeStep;
  use crate::variant::{ConfigVariant, VariantRequest, resolve};
  use std::collections::HashMap;
  use std::path::PathBuf;
  use tempfile::TempDir;

  fn plan(files: &[(&str, &str)]) -> BuildPlan {
    let sources: Vec<UnitSource> = files
      .iter()
      .map(|(id, text)| UnitSource {
        id: UnitId::new(*id),
        path: PathBuf::from(id),
        text: text.to_string(),
      })
      .collect();
    let graph = ModuleGraph::build(scan_units(&LexicalScanner, &sources), MixedModePolicy::Strict);
    resolve(
      &graph,
      &HashMap::new(),
      &[VariantRequest::new("default", ConfigVariant::new())],
      "test-toolchain",
    )
  }

  fn chain() -> BuildPlan {
    plan(&[
      ("leaf.cppm", "export module leaf;\n"),
      ("mid.cppm", "export module mid;\nimport leaf;\n"),
      ("top.cpp", "import mid;\n"),
    ])
  }

  fn diamond() -> BuildPlan {
    plan(&[
      ("base.cppm", "export module base;\n"),
      ("left.cppm", "export module left;\nimport base;\n"),
      ("right.cppm", "export module right;\nimport base;\n"),
      ("app.cpp", "import left;\nimport right;\n"),
      ("other.cppm", "export module other;\n"),
    ])
  }

  fn config(parallelism: usize) -> ExecuteConfig {
    ExecuteConfig {
      parallelism,
      fail_fast: false,
      retry_failed: false,
      ordering: CompletionOrder::Deterministic,
    }
  }

  fn cache() -> (TempDir, ArtifactCache) {
    let temp = TempDir::new().unwrap();
    let cache = ArtifactCache::open(temp.path().join("cache")).unwrap();
    (temp, cache)
  }

  fn ids(plan: &BuildPlan, indices: &[usize]) -> Vec<String> {
    indices.iter().map(|&i| plan.instances[i].id.to_string()).collect()
  }

  fn outcome<'a>(plan: &BuildPlan, result: &'a ExecutionResult, unit: &str) -> &'a InstanceOutcome {
    let idx = plan
      .instances
      .iter()
      .position(|i| i.id.unit.as_str() == unit)
      .unwrap();
    &result.outcomes[idx]
  }

  #[tokio::test]
  async fn builds_chain_in_dependency_order() {
    let plan = chain();
    let (_temp, cache) = cache();
    let step = Arc::new(FakeStep::new());

    let result = execute_plan(&plan, &cache, step.clone(), &config(4)).await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.built(), 3);
    assert_eq!(step.calls(), vec!["leaf.cppm", "mid.cppm", "top.cpp"]);
    assert_eq!(ids(&plan, &result.dispatch_order), vec!["leaf.cppm", "mid.cppm", "top.cpp"]);
    for instance in &plan.instances {
      assert!(cache.artifact_dir(&instance.key).join(format!("{}.bmi", instance.id.unit.stem())).exists());
    }
  }

  #[tokio::test]
  async fn dependency_artifacts_are_committed_before_consumers_run() {
    let plan = chain();
    let (_temp, cache) = cache();
    let step = Arc::new(FakeStep::new());

    execute_plan(&plan, &cache, step.clone(), &config(4)).await.unwrap();

    // FakeStep fails a request whose dependency directories are missing.
    assert_eq!(step.missing_dependencies(), 0);
  }

  #[tokio::test]
  async fn second_run_is_all_cache_hits() {
    let plan = diamond();
    let (_temp, cache) = cache();

    execute_plan(&plan, &cache, Arc::new(FakeStep::new()), &config(2))
      .await
      .unwrap();
    let step = Arc::new(FakeStep::new());
    let result = execute_plan(&plan, &cache, step.clone(), &config(2)).await.unwrap();

    assert_eq!(result.cache_hits(), plan.len());
    assert_eq!(result.step_invocations, 0);
    assert!(step.calls().is_empty());
  }

  #[tokio::test]
  async fn failure_skips_transitive_dependents_only() {
    let plan = diamond();
    let (_temp, cache) = cache();
    let step = Arc::new(FakeStep::new().failing("left.cppm"));

    let result = execute_plan(&plan, &cache, step, &config(1)).await.unwrap();

    assert!(!result.is_success());
    assert!(matches!(
      outcome(&plan, &result, "left.cppm"),
      InstanceOutcome::Failed { cached: false, .. }
    ));
    assert_eq!(
      outcome(&plan, &result, "app.cpp"),
      &InstanceOutcome::Skipped {
        skip: SkipReason::DependencyFailed {
          dependency: "left.cppm".to_string()
        }
      }
    );
    assert_eq!(outcome(&plan, &result, "right.cppm"), &InstanceOutcome::Built);
    assert_eq!(outcome(&plan, &result, "other.cppm"), &InstanceOutcome::Built);

    assert_eq!(result.failures.len(), 1);
    assert_eq!(ids(&plan, &result.failures[0].skipped), vec!["app.cpp"]);
  }

  #[tokio::test]
  async fn cached_failure_is_replayed_without_invoking_step() {
    let plan = chain();
    let (_temp, cache) = cache();

    let first = Arc::new(FakeStep::new().failing("mid.cppm"));
    execute_plan(&plan, &cache, first, &config(2)).await.unwrap();

    let second = Arc::new(FakeStep::new());
    let result = execute_plan(&plan, &cache, second.clone(), &config(2)).await.unwrap();

    assert_eq!(outcome(&plan, &result, "leaf.cppm"), &InstanceOutcome::CacheHit);
    match outcome(&plan, &result, "mid.cppm") {
      InstanceOutcome::Failed { diagnostic, cached } => {
        assert!(*cached);
        assert!(diagnostic.contains("mid.cppm"));
      }
      other => panic!("expected cached failure, got {other:?}"),
    }
    assert!(matches!(
      outcome(&plan, &result, "top.cpp"),
      InstanceOutcome::Skipped { .. }
    ));
    assert!(second.calls().is_empty());
  }

  #[tokio::test]
  async fn retry_failed_rebuilds_cached_failures() {
    let plan = chain();
    let (_temp, cache) = cache();
    execute_plan(&plan, &cache, Arc::new(FakeStep::new().failing("mid.cppm")), &config(2))
      .await
      .unwrap();

    let step = Arc::new(FakeStep::new());
    let retry = ExecuteConfig {
      retry_failed: true,
      ..config(2)
    };
    let result = execute_plan(&plan, &cache, step.clone(), &retry).await.unwrap();

    assert!(result.is_success());
    assert_eq!(step.calls(), vec!["mid.cppm", "top.cpp"]);

    let third = execute_plan(&plan, &cache, Arc::new(FakeStep::new()), &config(2))
      .await
      .unwrap();
    assert_eq!(third.cache_hits(), 3);
  }

  #[tokio::test]
  async fn fail_fast_cancels_undispatched_work() {
    let plan = plan(&[
      ("a.cppm", "export module a;\n"),
      ("b.cppm", "export module b;\n"),
      ("c.cppm", "export module c;\n"),
    ]);
    let (_temp, cache) = cache();
    let step = Arc::new(FakeStep::new().failing("a.cppm"));
    let fail_fast = ExecuteConfig {
      fail_fast: true,
      ..config(1)
    };

    let result = execute_plan(&plan, &cache, step.clone(), &fail_fast).await.unwrap();

    assert_eq!(step.calls(), vec!["a.cppm"]);
    assert_eq!(
      outcome(&plan, &result, "c.cppm"),
      &InstanceOutcome::Skipped {
        skip: SkipReason::Cancelled
      }
    );
    assert_eq!(result.failed(), 1);
    assert_eq!(result.skipped(), 2);
  }

  #[tokio::test]
  async fn parallelism_bounds_concurrent_steps() {
    let files: Vec<(String, String)> = (0..8)
      .map(|i| (format!("m{i}.cppm"), format!("export module m{i};\n")))
      .collect();
    let refs: Vec<(&str, &str)> = files.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
    let plan = plan(&refs);
    let (_temp, cache) = cache();
    let mut step = FakeStep::new();
    for (id, _) in &files {
      step = step.delay(id, 20);
    }
    let step = Arc::new(step);

    let result = execute_plan(&plan, &cache, step.clone(), &config(3)).await.unwrap();

    assert_eq!(result.built(), 8);
    assert!(step.max_concurrency() <= 3);
    assert!(step.max_concurrency() >= 2);
  }

  #[tokio::test]
  async fn deterministic_dispatch_ignores_completion_timing() {
    let plan = diamond();

    let mut orders = Vec::new();
    for slow in ["base.cppm", "other.cppm", "right.cppm"] {
      let (_temp, cache) = cache();
      let step = Arc::new(FakeStep::new().delay(slow, 40));
      let result = execute_plan(&plan, &cache, step, &config(2)).await.unwrap();
      orders.push(ids(&plan, &result.dispatch_order));
    }

    assert_eq!(orders[0], orders[1]);
    assert_eq!(orders[1], orders[2]);
  }

  #[tokio::test]
  async fn free_workers_keep_building_while_a_slow_step_runs() {
    let plan = plan(&[
      ("0slow.cppm", "export module slow;\n"),
      ("a.cppm", "export module a;\n"),
      ("b.cppm", "export module b;\n"),
      ("c.cppm", "export module c;\n"),
      ("d.cppm", "export module d;\n"),
    ]);
    let (_temp, cache) = cache();
    let step = Arc::new(
      FakeStep::new()
        .delay("0slow.cppm", 400)
        .delay("a.cppm", 10)
        .delay("b.cppm", 10)
        .delay("c.cppm", 10)
        .delay("d.cppm", 10),
    );

    let result = execute_plan(&plan, &cache, step.clone(), &config(2)).await.unwrap();

    assert_eq!(result.built(), 5);
    assert_eq!(step.finished().last().map(String::as_str), Some("0slow.cppm"));
  }

  #[tokio::test]
  async fn panic_does_not_abort_other_in_flight_builds() {
    let plan = plan(&[
      ("a.cppm", "export module a;\n"),
      ("b.cppm", "export module b;\n"),
    ]);
    let (_temp, cache) = cache();
    let step = Arc::new(FakeStep::new().panicking("a.cppm").delay("b.cppm", 50));

    let result = execute_plan(&plan, &cache, step, &config(2)).await.unwrap();

    assert!(matches!(
      outcome(&plan, &result, "a.cppm"),
      InstanceOutcome::Failed { cached: false, .. }
    ));
    assert_eq!(outcome(&plan, &result, "b.cppm"), &InstanceOutcome::Built);
    assert_eq!(result.step_invocations, 2);
  }

  #[tokio::test]
  async fn panicking_step_is_a_failure() {
    let plan = chain();
    let (_temp, cache) = cache();
    let step = Arc::new(FakeStep::new().panicking("leaf.cppm"));

    let result = execute_plan(&plan, &cache, step, &config(2)).await.unwrap();

    match outcome(&plan, &result, "leaf.cppm") {
      InstanceOutcome::Failed { diagnostic, .. } => assert!(diagnostic.contains("panicked")),
      other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(result.skipped(), 2);
  }

  #[tokio::test]
  async fn corrupted_entry_is_rebuilt_with_warning() {
    let plan = chain();
    let (_temp, cache) = cache();
    execute_plan(&plan, &cache, Arc::new(FakeStep::new()), &config(2))
      .await
      .unwrap();

    let leaf = &plan.instances[0];
    std::fs::write(cache.artifact_dir(&leaf.key).join("leaf.bmi"), "tampered").unwrap();

    let step = Arc::new(FakeStep::new());
    let result = execute_plan(&plan, &cache, step.clone(), &config(2)).await.unwrap();

    assert_eq!(step.calls(), vec!["leaf.cppm"]);
    assert_eq!(result.cache_hits(), 2);
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].contains("leaf.cppm"));
  }

  #[tokio::test]
  async fn empty_plan_is_a_success() {
    let plan = BuildPlan::default();
    let (_temp, cache) = cache();

    let result = execute_plan(&plan, &cache, Arc::new(FakeStep::new()), &config(2))
      .await
      .unwrap();

    assert!(result.is_success());
    assert!(result.outcomes.is_empty());
  }
}

//! One orchestrator invocation, end to end.
//!
//! `prepare` runs the read-only phases (discover, scan, graph, resolve, classify);
//! `build` executes the prepared plan, saves the invocation record and produces the
//! report.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{ArtifactCache, CacheError};
use crate::execute::{BuildStep, CommandStep, CompletionOrder, ExecuteConfig, ExecuteError, execute_plan};
use crate::graph::{MixedModePolicy, ModuleGraph};
use crate::invalidation::{IncrementalPlan, InvocationRecord, RecordError, RecordStore, classify};
use crate::manifest::{Manifest, ManifestError};
use crate::platform::host_triple;
use crate::platform::paths::cache_dir;
use crate::report::Report;
use crate::scan::{LexicalScanner, scan_units};
use crate::store_lock::{LockMode, StoreLock, StoreLockError};
use crate::variant::{BuildPlan, resolve};

#[derive(Debug, Error)]
pub enum InvokeError {
  #[error(transparent)]
  Manifest(#[from] ManifestError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Lock(#[from] StoreLockError),

  #[error(transparent)]
  Record(#[from] RecordError),

  #[error(transparent)]
  Execute(#[from] ExecuteError),

  #[error("the manifest has no [build] command")]
  NoCommand,
}

/// Command-line overrides of manifest settings.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
  pub parallelism: Option<usize>,
  pub fail_fast: Option<bool>,
  pub retry_failed: Option<bool>,
  pub ordering: Option<CompletionOrder>,
  pub mixed_mode: Option<MixedModePolicy>,
  pub cache_dir: Option<PathBuf>,
  /// Build only these variants (all when empty).
  pub variants: Vec<String>,
}

/// Cache directory: override, then manifest, then `MODBUILD_CACHE` or the platform default.
pub fn resolve_cache_dir(manifest: &Manifest, overrides: &Overrides) -> PathBuf {
  overrides
    .cache_dir
    .clone()
    .or_else(|| manifest.cache_dir())
    .unwrap_or_else(cache_dir)
}

pub fn execute_config(manifest: &Manifest, overrides: &Overrides) -> ExecuteConfig {
  let build = manifest.build();
  let mut config = ExecuteConfig {
    fail_fast: overrides.fail_fast.unwrap_or(build.fail_fast),
    retry_failed: overrides.retry_failed.unwrap_or(build.retry_failed),
    ordering: overrides.ordering.unwrap_or(build.ordering),
    ..ExecuteConfig::default()
  };
  if let Some(parallelism) = overrides.parallelism.or(build.parallelism) {
    config.parallelism = parallelism.max(1);
  }
  config
}

/// Toolchain identity folded into every key: the declared toolchain, the host and
/// the build command template.
pub fn toolchain_identity(manifest: &Manifest) -> String {
  let mut identity = format!("{}@{}", manifest.project().toolchain, host_triple());
  if let Some(command) = &manifest.build().command {
    identity.push('|');
    identity.push_str(command);
  }
  identity
}

/// The command step configured by the manifest.
pub fn command_step(manifest: &Manifest) -> Result<CommandStep, InvokeError> {
  let command = manifest.build().command.as_ref().ok_or(InvokeError::NoCommand)?;
  let mut step = CommandStep::new(command.clone(), manifest.root());
  if let Some(shell) = &manifest.build().shell {
    step = step.with_shell(shell.clone());
  }
  Ok(step)
}

/// Output of the read-only phases.
#[derive(Debug)]
pub struct Prepared {
  pub graph: ModuleGraph,
  pub plan: BuildPlan,
  pub incremental: IncrementalPlan,
  pub cache: ArtifactCache,
  pub config: ExecuteConfig,
}

impl Prepared {
  pub fn report(&self) -> Report {
    Report::planned(&self.graph, &self.plan, &self.incremental)
  }
}

/// Scan the project and build the module graph.
pub fn load_graph(manifest: &Manifest, overrides: &Overrides) -> Result<ModuleGraph, InvokeError> {
  let ids = manifest.discover_outside(Some(&resolve_cache_dir(manifest, overrides)))?;
  let sources = manifest.read_sources(&ids)?;
  let scanned = scan_units(&LexicalScanner, &sources);
  let policy = overrides.mixed_mode.unwrap_or(manifest.build().mixed_mode);
  Ok(ModuleGraph::build(scanned, policy))
}

/// Discover, scan, resolve and classify without building anything.
pub fn prepare(manifest: &Manifest, overrides: &Overrides) -> Result<Prepared, InvokeError> {
  let cache = ArtifactCache::at(resolve_cache_dir(manifest, overrides));
  let graph = load_graph(manifest, overrides)?;
  let configs = manifest.unit_configs()?;
  let requests = manifest.variant_requests(&overrides.variants)?;
  let mut plan = resolve(&graph, &configs, &requests, &toolchain_identity(manifest));
  let config = execute_config(manifest, overrides);

  let previous = match RecordStore::new(cache.root()).load() {
    Ok(previous) => previous,
    Err(e) => {
      warn!(error = %e, "ignoring unreadable invocation record");
      plan.warnings.push(format!("previous invocation record ignored: {e}"));
      None
    }
  };
  let incremental = classify(&plan, previous.as_ref(), &cache, config.retry_failed);

  Ok(Prepared {
    graph,
    plan,
    incremental,
    cache,
    config,
  })
}

/// Build everything the manifest asks for with `step`.
pub async fn build<S: BuildStep>(
  manifest: &Manifest,
  overrides: &Overrides,
  step: Arc<S>,
) -> Result<Report, InvokeError> {
  let cache_root = resolve_cache_dir(manifest, overrides);
  let _lock = StoreLock::acquire(&cache_root, LockMode::Shared, "modbuild build")?;

  let prepared = prepare(manifest, overrides)?;
  let result = execute_plan(&prepared.plan, &prepared.cache, step, &prepared.config).await?;

  RecordStore::new(prepared.cache.root()).save(&InvocationRecord::from_plan(&prepared.plan))?;

  let report = Report::executed(&prepared.graph, &prepared.plan, &prepared.incremental, &result);
  info!(summary = %report.summary, success = report.is_success(), "invocation finished");
  Ok(report)
}

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};

use modbuild_lib::cache::ArtifactCache;
use modbuild_lib::gc::collect_garbage;
use modbuild_lib::invoke::{Overrides, resolve_cache_dir};
use modbuild_lib::manifest::Manifest;
use modbuild_lib::platform::paths::cache_dir;
use modbuild_lib::store_lock::{LockMode, StoreLock};

use crate::output::{OutputFormat, format_bytes, format_duration, print_info, print_json, print_stat, print_success};

/// Cache root: explicit flag, then the manifest (when one exists), then the default.
pub(crate) fn cache_root(manifest_path: &Path, cache_dir_flag: Option<PathBuf>) -> Result<PathBuf> {
  if let Some(dir) = cache_dir_flag {
    return Ok(dir);
  }
  if manifest_path.exists() {
    let manifest = Manifest::load(manifest_path)
      .with_context(|| format!("Failed to load manifest: {}", manifest_path.display()))?;
    return Ok(resolve_cache_dir(&manifest, &Overrides::default()));
  }
  Ok(cache_dir())
}

pub fn cmd_gc(manifest_path: &Path, cache_dir_flag: Option<PathBuf>, dry_run: bool, output: OutputFormat) -> Result<ExitCode> {
  let start = Instant::now();
  let root = cache_root(manifest_path, cache_dir_flag)?;

  let mode = if dry_run { LockMode::Shared } else { LockMode::Exclusive };
  let _lock = StoreLock::acquire(&root, mode, "modbuild gc").context("Failed to acquire cache lock")?;

  let cache = ArtifactCache::open(&root).context("Failed to open cache")?;
  let result = collect_garbage(&cache, dry_run)?;

  if output.is_json() {
    print_json(&result)?;
  } else {
    println!();
    if dry_run {
      print_info("Dry run - no changes made");
    } else {
      print_success("Garbage collection complete!");
    }
    print_stat("Artifacts removed", &result.stats.objects_deleted.to_string());
    print_stat("Failure records removed", &result.stats.failures_deleted.to_string());
    print_stat("Staging leftovers removed", &result.stats.staging_deleted.to_string());
    print_stat("Space freed", &format_bytes(result.stats.bytes_freed));
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  Ok(ExitCode::SUCCESS)
}

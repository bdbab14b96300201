use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use serde::Serialize;

use modbuild_lib::cache::ArtifactCache;
use modbuild_lib::platform::host_triple;

use super::gc::cache_root;
use crate::output::{OutputFormat, print_json, print_stat};

#[derive(Debug, Serialize)]
struct Info {
  version: &'static str,
  host: String,
  cache_dir: PathBuf,
  artifacts: usize,
  failures: usize,
}

pub fn cmd_info(manifest_path: &Path, cache_dir_flag: Option<PathBuf>, output: OutputFormat) -> Result<ExitCode> {
  let root = cache_root(manifest_path, cache_dir_flag)?;

  let cache = ArtifactCache::at(&root);
  let artifacts = cache.success_keys().context("Failed to list artifacts")?.len();
  let failures = cache.failure_keys().context("Failed to list failure records")?.len();

  let info = Info {
    version: env!("CARGO_PKG_VERSION"),
    host: host_triple(),
    cache_dir: root,
    artifacts,
    failures,
  };

  if output.is_json() {
    print_json(&info)?;
  } else {
    println!("modbuild {}", info.version);
    print_stat("Host", &info.host);
    print_stat("Cache", &info.cache_dir.display().to_string());
    print_stat("Artifacts", &info.artifacts.to_string());
    print_stat("Failure records", &info.failures.to_string());
  }

  Ok(ExitCode::SUCCESS)
}

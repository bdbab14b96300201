//! Implementation of the `modbuild plan` command.
//!
//! Scans, resolves and classifies without building, showing each instance's key and
//! why it would or would not be built.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};

use modbuild_lib::invoke::{Overrides, prepare};
use modbuild_lib::manifest::Manifest;

use crate::output::{OutputFormat, print_info, print_json, print_plan, print_problems, print_stat};

pub fn cmd_plan(manifest_path: &Path, overrides: Overrides, output: OutputFormat) -> Result<ExitCode> {
  let manifest = Manifest::load(manifest_path)
    .with_context(|| format!("Failed to load manifest: {}", manifest_path.display()))?;
  let prepared = prepare(&manifest, &overrides).context("Failed to plan build")?;
  let report = prepared.report();

  if output.is_json() {
    print_json(&report)?;
  } else {
    print_problems(&report);
    print_plan(&report);

    println!();
    print_info(&format!("Plan for {}", prepared.cache.root().display()));
    print_stat("Instances", &report.instances.len().to_string());
    print_stat("To build", &prepared.incremental.must_build_count().to_string());
    print_stat(
      "Cached",
      &(report.instances.len() - prepared.incremental.must_build_count()).to_string(),
    );
    if report.summary.blocked > 0 {
      print_stat("Blocked", &report.summary.blocked.to_string());
    }
  }

  Ok(if report.errors.is_empty() {
    ExitCode::SUCCESS
  } else {
    ExitCode::FAILURE
  })
}

//! Implementation of the `modbuild build` command.
//!
//! Runs a full invocation with the manifest's command step and prints the report.
//! The exit status is zero iff nothing failed, nothing was skipped and no error was
//! reported.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::debug;

use modbuild_lib::invoke::{Overrides, build, command_step};
use modbuild_lib::manifest::Manifest;

use crate::output::{
  OutputFormat, cancelled_count, format_duration, print_error, print_failures, print_json, print_problems,
  print_stat, print_success,
};

pub fn cmd_build(manifest_path: &Path, overrides: Overrides, output: OutputFormat) -> Result<ExitCode> {
  let start = Instant::now();

  let manifest = Manifest::load(manifest_path)
    .with_context(|| format!("Failed to load manifest: {}", manifest_path.display()))?;
  let step = Arc::new(command_step(&manifest).context("Cannot build")?);
  debug!(command = step.template(), root = %manifest.root().display(), "using command step");

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt
    .block_on(build(&manifest, &overrides, step))
    .context("Build failed")?;

  if output.is_json() {
    print_json(&report)?;
  } else {
    print_problems(&report);
    print_failures(&report);

    println!();
    if report.is_success() {
      print_success("Build complete!");
    } else {
      print_error("Build finished with errors");
    }
    print_stat("Built", &report.summary.built.to_string());
    print_stat("Cache hits", &report.summary.cache_hits.to_string());
    print_stat("Failed", &report.summary.failed.to_string());
    print_stat("Skipped", &report.summary.skipped.to_string());
    let cancelled = cancelled_count(&report);
    if cancelled > 0 {
      print_stat("Cancelled", &cancelled.to_string());
    }
    if report.summary.blocked > 0 {
      print_stat("Blocked", &report.summary.blocked.to_string());
    }
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  Ok(ExitCode::from(report.exit_code() as u8))
}

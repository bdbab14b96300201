//! CLI output formatting utilities.
//!
//! Colored status lines, human-readable byte/duration formatting and the text
//! rendering of invocation reports.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

use modbuild_lib::execute::InstanceOutcome;
use modbuild_lib::invalidation::Classification;
use modbuild_lib::report::Report;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
  pub const SKIP: &str = "-";
}

/// Human-readable size with binary units, one decimal above bytes.
pub fn format_bytes(bytes: u64) -> String {
  const UNITS: [&str; 3] = ["KB", "MB", "GB"];

  if bytes < 1024 {
    return format!("{bytes} B");
  }
  let mut value = bytes as f64 / 1024.0;
  let mut unit = 0;
  while value >= 1024.0 && unit < UNITS.len() - 1 {
    value /= 1024.0;
    unit += 1;
  }
  format!("{value:.1} {}", UNITS[unit])
}

pub fn format_duration(duration: Duration) -> String {
  match duration.as_secs() {
    0 => format!("{}ms", duration.subsec_millis()),
    secs @ 1..60 => format!("{secs}.{:02}s", duration.subsec_millis() / 10),
    secs => format!("{}m {}s", secs / 60, secs % 60),
  }
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

/// Errors, warnings and blocked units of a report, on stderr.
pub fn print_problems(report: &Report) {
  for error in &report.errors {
    print_error(error);
  }
  for warning in &report.warnings {
    print_warning(warning);
  }
  for blocked in &report.blocked {
    print_warning(&format!("blocked: {} ({})", blocked.subject, blocked.reason));
  }
}

/// One line per instance with its cache classification.
pub fn print_plan(report: &Report) {
  for instance in &report.instances {
    let status = match &instance.classification {
      Classification::CacheHit => "cache-hit".if_supports_color(Stream::Stdout, |s| s.green()).to_string(),
      Classification::CachedFailure => "cached failure"
        .if_supports_color(Stream::Stdout, |s| s.red())
        .to_string(),
      Classification::MustBuild { reason } => format!("must-build ({reason})")
        .if_supports_color(Stream::Stdout, |s| s.yellow())
        .to_string(),
    };
    println!(
      "  {} {} {} {}",
      instance.key.0.if_supports_color(Stream::Stdout, |s| s.dimmed()),
      instance.instance,
      symbols::ARROW,
      status
    );
  }
}

/// Failures with their diagnostics and the consumers they took down.
pub fn print_failures(report: &Report) {
  for failure in &report.failures {
    let cached = if failure.cached { " (cached)" } else { "" };
    print_error(&format!("{}{cached}", failure.instance));
    for line in failure.diagnostic.lines() {
      eprintln!("    {}", line);
    }
    for skipped in &failure.skipped {
      eprintln!(
        "  {} {}",
        symbols::SKIP.if_supports_color(Stream::Stderr, |s| s.dimmed()),
        format!("skipped {skipped}").if_supports_color(Stream::Stderr, |s| s.dimmed())
      );
    }
  }
}

/// Instances that never ran because fail-fast stopped the build.
pub fn cancelled_count(report: &Report) -> usize {
  report
    .instances
    .iter()
    .filter(|i| {
      matches!(
        &i.outcome,
        Some(InstanceOutcome::Skipped {
          skip: modbuild_lib::execute::SkipReason::Cancelled
        })
      )
    })
    .count()
}

mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use modbuild_lib::consts::MANIFEST_FILENAME;
use modbuild_lib::execute::CompletionOrder;
use modbuild_lib::graph::MixedModePolicy;
use modbuild_lib::invoke::Overrides;

use crate::output::OutputFormat;

/// modbuild - module-aware incremental build orchestrator
#[derive(Parser)]
#[command(name = "modbuild")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Path to the build manifest
  #[arg(short, long, global = true, default_value = MANIFEST_FILENAME)]
  manifest: PathBuf,

  /// Cache directory (overrides the manifest and MODBUILD_CACHE)
  #[arg(long, global = true)]
  cache_dir: Option<PathBuf>,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t)]
  output: OutputFormat,

  /// More log output (-v info, -vv debug)
  #[arg(short, long, global = true, action = clap::ArgAction::Count)]
  verbose: u8,

  /// Only log errors
  #[arg(short, long, global = true, conflicts_with = "verbose")]
  quiet: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Args, Debug, Default)]
struct PlanArgs {
  /// Maximum number of concurrent build steps
  #[arg(short = 'j', long)]
  jobs: Option<usize>,

  /// Stop dispatching after the first failure
  #[arg(long, conflicts_with = "keep_going")]
  fail_fast: bool,

  /// Keep building independent instances after a failure
  #[arg(long)]
  keep_going: bool,

  /// Rebuild instances whose cached outcome is a failure
  #[arg(long)]
  retry_failed: bool,

  /// Build only this variant (repeatable)
  #[arg(long = "variant", value_name = "NAME")]
  variants: Vec<String>,

  /// Completion ordering: deterministic or eager
  #[arg(long)]
  ordering: Option<CompletionOrder>,

  /// Mixed-mode dependency policy: strict or lenient
  #[arg(long)]
  mixed_mode: Option<MixedModePolicy>,
}

impl PlanArgs {
  fn overrides(self, cache_dir: Option<PathBuf>) -> Overrides {
    let fail_fast = if self.fail_fast {
      Some(true)
    } else if self.keep_going {
      Some(false)
    } else {
      None
    };
    Overrides {
      parallelism: self.jobs,
      fail_fast,
      retry_failed: self.retry_failed.then_some(true),
      ordering: self.ordering,
      mixed_mode: self.mixed_mode,
      cache_dir,
      variants: self.variants,
    }
  }
}

#[derive(Subcommand)]
enum Commands {
  /// Scan, plan and build the project
  Build(PlanArgs),

  /// Show each instance's key and whether it must be built, without building
  Plan(PlanArgs),

  /// Show units, artifacts and dependency edges
  Graph {
    /// Mixed-mode dependency policy: strict or lenient
    #[arg(long)]
    mixed_mode: Option<MixedModePolicy>,
  },

  /// Remove cache entries not used by the last build
  Gc {
    /// Show what would be removed without deleting anything
    #[arg(long)]
    dry_run: bool,
  },

  /// Show version and cache information
  Info,
}

fn log_filter(verbose: u8, quiet: bool) -> EnvFilter {
  let level = match (quiet, verbose) {
    (true, _) => "error",
    (false, 0) => return EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    (false, 1) => "info",
    (false, _) => "debug",
  };
  EnvFilter::new(level)
}

fn main() -> Result<ExitCode> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(log_filter(cli.verbose, cli.quiet))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Build(args) => cmd::cmd_build(&cli.manifest, args.overrides(cli.cache_dir), cli.output),
    Commands::Plan(args) => cmd::cmd_plan(&cli.manifest, args.overrides(cli.cache_dir), cli.output),
    Commands::Graph { mixed_mode } => {
      let overrides = Overrides {
        mixed_mode,
        cache_dir: cli.cache_dir,
        ..Default::default()
      };
      cmd::cmd_graph(&cli.manifest, &overrides, cli.output)
    }
    Commands::Gc { dry_run } => cmd::cmd_gc(&cli.manifest, cli.cache_dir, dry_run, cli.output),
    Commands::Info => cmd::cmd_info(&cli.manifest, cli.cache_dir, cli.output),
  }
}

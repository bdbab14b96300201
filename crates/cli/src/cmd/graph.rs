//! Implementation of the `modbuild graph` command.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;

use modbuild_lib::invoke::{Overrides, load_graph};
use modbuild_lib::manifest::Manifest;
use modbuild_lib::scan::{DependencyKind, UnitMode};

use crate::output::{OutputFormat, print_error, print_json, print_warning, symbols};

#[derive(Debug, Serialize)]
struct EdgeView<'a> {
  producer: &'a str,
  kind: DependencyKind,
  name: &'a str,
}

#[derive(Debug, Serialize)]
struct UnitView<'a> {
  unit: &'a str,
  artifact: Option<&'a str>,
  mode: UnitMode,
  edges: Vec<EdgeView<'a>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  blocked: Option<String>,
}

#[derive(Debug, Serialize)]
struct GraphView<'a> {
  units: Vec<UnitView<'a>>,
  external_includes: Vec<(&'a str, &'a str)>,
  errors: Vec<String>,
  warnings: &'a [String],
}

pub fn cmd_graph(manifest_path: &Path, overrides: &Overrides, output: OutputFormat) -> Result<ExitCode> {
  let manifest = Manifest::load(manifest_path)
    .with_context(|| format!("Failed to load manifest: {}", manifest_path.display()))?;
  let graph = load_graph(&manifest, overrides).context("Failed to build module graph")?;

  let units = graph
    .units()
    .iter()
    .enumerate()
    .map(|(idx, unit)| UnitView {
      unit: unit.id.as_str(),
      artifact: unit.declarations.exported_name(),
      mode: unit.declarations.mode,
      edges: graph
        .edges(idx)
        .iter()
        .map(|edge| EdgeView {
          producer: graph.unit(edge.producer).id.as_str(),
          kind: edge.kind,
          name: &edge.name,
        })
        .collect(),
      blocked: graph.block_reason(idx).map(ToString::to_string),
    })
    .collect();
  let view = GraphView {
    units,
    external_includes: graph
      .external_includes()
      .iter()
      .map(|(unit, path)| (unit.as_str(), path.as_str()))
      .collect(),
    errors: graph.errors().iter().map(ToString::to_string).collect(),
    warnings: graph.warnings(),
  };

  if output.is_json() {
    print_json(&view)?;
  } else {
    for error in &view.errors {
      print_error(error);
    }
    for warning in view.warnings {
      print_warning(warning);
    }
    for unit in &view.units {
      let artifact = unit.artifact.map(|a| format!(" exports {a}")).unwrap_or_default();
      println!(
        "{}{} ({})",
        unit.unit.if_supports_color(Stream::Stdout, |s| s.bold()),
        artifact,
        unit.mode
      );
      if let Some(reason) = &unit.blocked {
        println!(
          "  {}",
          format!("blocked: {reason}").if_supports_color(Stream::Stdout, |s| s.red())
        );
      }
      for edge in &unit.edges {
        let kind = match edge.kind {
          DependencyKind::Import => "import",
          DependencyKind::Include => "include",
        };
        println!("  {} {} ({kind} {})", symbols::ARROW, edge.producer, edge.name);
      }
    }
    for (unit, path) in &view.external_includes {
      println!(
        "{}",
        format!("{unit}: external include {path}").if_supports_color(Stream::Stdout, |s| s.dimmed())
      );
    }
  }

  Ok(if view.errors.is_empty() {
    ExitCode::SUCCESS
  } else {
    ExitCode::FAILURE
  })
}

//! Unit dependency graph.
//!
//! [`ModuleGraph::build`] turns scanned units into a frozen graph of producer → consumer
//! edges. Construction never fails as a whole: duplicate producers, unknown names,
//! mixed-mode edges and cycles are recorded as [`GraphError`]s and the affected units
//! (plus every transitive consumer) are marked blocked, while the rest of the graph
//! stays buildable.

mod types;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, info, warn};

use crate::scan::{Attachment, DependencyKind, ScannedUnit};
use crate::types::UnitId;

pub use types::{BlockReason, GraphError, MixedModePolicy, UnitEdge};

/// Immutable unit graph for one invocation.
#[derive(Debug)]
pub struct ModuleGraph {
  units: Vec<ScannedUnit>,
  index: HashMap<UnitId, usize>,
  /// Artifact name → producing unit, for unambiguous names only.
  artifacts: BTreeMap<String, usize>,
  /// Ordered, deduplicated dependency edges per unit.
  edges: Vec<Vec<UnitEdge>>,
  /// Node `i` is unit `i`; edges run producer → consumer.
  graph: DiGraph<usize, DependencyKind>,
  external_includes: Vec<(UnitId, String)>,
  errors: Vec<GraphError>,
  warnings: Vec<String>,
  blocked: BTreeMap<usize, BlockReason>,
}

impl ModuleGraph {
  /// Assemble the graph from scanner output.
  pub fn build(units: Vec<ScannedUnit>, policy: MixedModePolicy) -> Self {
    let index: HashMap<UnitId, usize> = units.iter().enumerate().map(|(i, u)| (u.id.clone(), i)).collect();

    let mut builder = Builder {
      units: &units,
      index: &index,
      policy,
      artifacts: BTreeMap::new(),
      ambiguous: HashSet::new(),
      edges: vec![Vec::new(); units.len()],
      external_includes: Vec::new(),
      errors: Vec::new(),
      warnings: Vec::new(),
      blocked: BTreeMap::new(),
    };

    builder.index_artifacts();
    for i in 0..units.len() {
      builder.resolve_unit(i);
    }

    let mut graph = DiGraph::with_capacity(units.len(), 0);
    for i in 0..units.len() {
      graph.add_node(i);
    }
    for (consumer, edges) in builder.edges.iter().enumerate() {
      for edge in edges {
        graph.add_edge(NodeIndex::new(edge.producer), NodeIndex::new(consumer), edge.kind);
      }
    }

    builder.detect_cycles(&graph);
    for (i, unit) in units.iter().enumerate() {
      if unit.has_errors() {
        builder.blocked.entry(i).or_insert(BlockReason::ScanFailed);
      }
    }
    builder.propagate_blocking(&graph);

    let Builder {
      artifacts,
      edges,
      external_includes,
      errors,
      warnings,
      blocked,
      ..
    } = builder;

    info!(
      units = units.len(),
      artifacts = artifacts.len(),
      edges = graph.edge_count(),
      errors = errors.len(),
      blocked = blocked.len(),
      "built module graph"
    );

    ModuleGraph {
      units,
      index,
      artifacts,
      edges,
      graph,
      external_includes,
      errors,
      warnings,
      blocked,
    }
  }

  pub fn len(&self) -> usize {
    self.units.len()
  }

  pub fn is_empty(&self) -> bool {
    self.units.is_empty()
  }

  pub fn units(&self) -> &[ScannedUnit] {
    &self.units
  }

  pub fn unit(&self, idx: usize) -> &ScannedUnit {
    &self.units[idx]
  }

  pub fn index_of(&self, id: &UnitId) -> Option<usize> {
    self.index.get(id).copied()
  }

  /// Artifact names with their producing unit, sorted by name.
  pub fn artifacts(&self) -> impl Iterator<Item = (&str, &UnitId)> {
    self.artifacts.iter().map(|(name, &i)| (name.as_str(), &self.units[i].id))
  }

  pub fn producer_of(&self, artifact: &str) -> Option<usize> {
    self.artifacts.get(artifact).copied()
  }

  /// Dependency edges of a unit in declaration order.
  pub fn edges(&self, idx: usize) -> &[UnitEdge] {
    &self.edges[idx]
  }

  /// Units directly depending on `idx`.
  pub fn dependents(&self, idx: usize) -> Vec<usize> {
    let mut dependents: Vec<usize> = self
      .graph
      .neighbors_directed(NodeIndex::new(idx), Direction::Outgoing)
      .map(|n| self.graph[n])
      .collect();
    dependents.sort_unstable();
    dependents.dedup();
    dependents
  }

  /// Quoted includes that did not resolve to a unit.
  pub fn external_includes(&self) -> &[(UnitId, String)] {
    &self.external_includes
  }

  pub fn errors(&self) -> &[GraphError] {
    &self.errors
  }

  pub fn warnings(&self) -> &[String] {
    &self.warnings
  }

  pub fn block_reason(&self, idx: usize) -> Option<&BlockReason> {
    self.blocked.get(&idx)
  }

  pub fn is_blocked(&self, idx: usize) -> bool {
    self.blocked.contains_key(&idx)
  }

  /// Blocked units in unit order.
  pub fn blocked(&self) -> impl Iterator<Item = (&UnitId, &BlockReason)> {
    self.blocked.iter().map(|(&i, reason)| (&self.units[i].id, reason))
  }
}

struct Builder<'a> {
  units: &'a [ScannedUnit],
  index: &'a HashMap<UnitId, usize>,
  policy: MixedModePolicy,
  artifacts: BTreeMap<String, usize>,
  ambiguous: HashSet<String>,
  edges: Vec<Vec<UnitEdge>>,
  external_includes: Vec<(UnitId, String)>,
  errors: Vec<GraphError>,
  warnings: Vec<String>,
  blocked: BTreeMap<usize, BlockReason>,
}

impl Builder<'_> {
  fn block(&mut self, idx: usize, reason: BlockReason) {
    self.blocked.entry(idx).or_insert(reason);
  }

  fn index_artifacts(&mut self) {
    let mut producers: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, unit) in self.units.iter().enumerate() {
      if let Some(name) = unit.declarations.exported_name() {
        producers.entry(name).or_default().push(i);
      }
    }

    for (name, list) in producers {
      if let [only] = list.as_slice() {
        self.artifacts.insert(name.to_string(), *only);
        continue;
      }

      warn!(artifact = %name, producers = list.len(), "artifact has more than one producer");
      self.errors.push(GraphError::AmbiguousProducer {
        artifact: name.to_string(),
        producers: list.iter().map(|&i| self.units[i].id.clone()).collect(),
      });
      self.ambiguous.insert(name.to_string());
      for i in list {
        self.block(i, BlockReason::AmbiguousProducer(name.to_string()));
      }
    }
  }

  fn resolve_unit(&mut self, i: usize) {
    let units = self.units;
    let unit = &units[i];
    let imported: HashSet<&str> = unit.declarations.imports().map(|d| d.name.as_str()).collect();
    let mut producers_seen = HashSet::new();

    for dep in &unit.declarations.dependencies {
      let producer = match dep.kind {
        DependencyKind::Import => self.resolve_import(i, &dep.name),
        DependencyKind::Include => self.resolve_include(i, &dep.name, &imported),
      };

      if let Some(producer) = producer
        && producers_seen.insert(producer)
      {
        self.edges[i].push(UnitEdge {
          producer,
          kind: dep.kind,
          name: dep.name.clone(),
        });
      }
    }
  }

  fn resolve_import(&mut self, i: usize, name: &str) -> Option<usize> {
    if self.ambiguous.contains(name) {
      self.block(i, BlockReason::AmbiguousProducer(name.to_string()));
      return None;
    }

    match self.artifacts.get(name) {
      Some(&producer) => Some(producer),
      None => {
        let unit = self.units[i].id.clone();
        warn!(unit = %unit, artifact = %name, "unknown dependency");
        self.errors.push(GraphError::UnknownDependency {
          unit,
          name: name.to_string(),
        });
        self.block(i, BlockReason::UnknownDependency(name.to_string()));
        None
      }
    }
  }

  fn resolve_include(&mut self, i: usize, path: &str, imported: &HashSet<&str>) -> Option<usize> {
    let unit = &self.units[i];

    let relative = join_relative(unit.id.parent(), path);
    let Some(producer) = relative
      .iter()
      .chain(join_relative("", path).iter())
      .find_map(|candidate| self.index.get(&UnitId::new(candidate.as_str())).copied())
    else {
      debug!(unit = %unit.id, include = %path, "include is external");
      self.external_includes.push((unit.id.clone(), path.to_string()));
      return None;
    };

    let target = &self.units[producer];
    let problem = if let Some(interface) = target.declarations.implements.as_deref() {
      Some(format!(
        "textually includes {} which implements artifact '{interface}'",
        target.id
      ))
    } else if let Some(export) = &target.declarations.export {
      match export.attachment {
        Attachment::Named => Some(format!(
          "textually includes {} which exports named artifact '{}'",
          target.id, export.name
        )),
        Attachment::Global if imported.contains(export.name.as_str()) => {
          let detail = format!(
            "both imports '{}' and textually includes its producer {}",
            export.name, target.id
          );
          if self.policy == MixedModePolicy::Lenient {
            warn!(unit = %unit.id, artifact = %export.name, "import and include of the same artifact");
            self.warnings.push(format!("{}: {detail}", unit.id));
            None
          } else {
            Some(detail)
          }
        }
        Attachment::Global => None,
      }
    } else {
      None
    };

    if let Some(detail) = problem {
      let unit = self.units[i].id.clone();
      warn!(unit = %unit, detail = %detail, "mixed-mode dependency");
      self.errors.push(GraphError::MixedMode { unit, detail });
      self.block(i, BlockReason::MixedMode);
      return None;
    }

    Some(producer)
  }

  fn detect_cycles(&mut self, graph: &DiGraph<usize, DependencyKind>) {
    let mut cycles = Vec::new();

    for component in tarjan_scc(graph) {
      let self_loop = component.len() == 1 && graph.contains_edge(component[0], component[0]);
      if component.len() < 2 && !self_loop {
        continue;
      }

      let members: HashSet<usize> = component.iter().map(|n| graph[*n]).collect();
      let Some(&start) = members.iter().min() else {
        continue;
      };
      cycles.push(self.cycle_from(start, &members));
      for &member in &members {
        self.block(member, BlockReason::Cycle);
      }
    }

    cycles.sort();
    for cycle in cycles {
      let cycle: Vec<UnitId> = cycle.into_iter().map(|i| self.units[i].id.clone()).collect();
      warn!(cycle = ?cycle, "dependency cycle");
      self.errors.push(GraphError::Cycle { cycle });
    }
  }

  /// Walk dependency edges inside one strongly connected component until returning to `start`.
  fn cycle_from(&self, start: usize, members: &HashSet<usize>) -> Vec<usize> {
    let mut path = vec![start];
    let mut visited = HashSet::from([start]);

    if self.extend_cycle(start, start, members, &mut path, &mut visited) {
      path.push(start);
    }
    path
  }

  fn extend_cycle(
    &self,
    current: usize,
    start: usize,
    members: &HashSet<usize>,
    path: &mut Vec<usize>,
    visited: &mut HashSet<usize>,
  ) -> bool {
    for edge in &self.edges[current] {
      let next = edge.producer;
      if next == start {
        return true;
      }
      if !members.contains(&next) || !visited.insert(next) {
        continue;
      }
      path.push(next);
      if self.extend_cycle(next, start, members, path, visited) {
        return true;
      }
      path.pop();
    }
    false
  }

  fn propagate_blocking(&mut self, graph: &DiGraph<usize, DependencyKind>) {
    let roots: Vec<usize> = self.blocked.keys().copied().collect();

    for root in roots {
      let root_id = self.units[root].id.clone();
      let mut queue = VecDeque::from([root]);

      while let Some(current) = queue.pop_front() {
        let mut consumers: Vec<usize> = graph
          .neighbors_directed(NodeIndex::new(current), Direction::Outgoing)
          .map(|n| graph[n])
          .collect();
        consumers.sort_unstable();

        for consumer in consumers {
          if self.blocked.contains_key(&consumer) {
            continue;
          }
          debug!(unit = %self.units[consumer].id, upstream = %root_id, "blocked by upstream error");
          self.blocked.insert(consumer, BlockReason::Upstream(root_id.clone()));
          queue.push_back(consumer);
        }
      }
    }
  }
}

/// Join an include path onto a directory, resolving `.` and `..`.
///
/// Returns `None` when the path escapes the project root.
fn join_relative(dir: &str, path: &str) -> Option<String> {
  let mut parts: Vec<&str> = dir.split('/').filter(|p| !p.is_empty()).collect();
  for segment in path.split(['/', '\\']) {
    match segment {
      "" | "." => {}
      ".." => {
        parts.pop()?;
      }
      other => parts.push(other),
    }
  }
  Some(parts.join("/"))
}

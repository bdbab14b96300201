//! Variant expansion.
//!
//! Expands every buildable unit of a [`ModuleGraph`] into one [`BuildInstance`] per
//! configuration it is needed under, wires instances to their producers' instances and
//! computes each instance's cache key.
//!
//! A unit's own surface is its scanned macro requirements plus the options, allowed
//! sets and pins the manifest declares for it. Its effective surface adds the
//! effective surfaces of its producers, because a producer built differently changes
//! the consumer's artifact too. The instance variant for a request `V` is `V`
//! restricted to the effective surface, overlaid with the unit's pins; producers are
//! requested with `V` overlaid with those pins.

mod types;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, info, warn};

use crate::consts::KEY_FORMAT_VERSION;
use crate::graph::ModuleGraph;
use crate::types::UnitId;
use crate::util::hash::Hashable;

pub(crate) use types::KeyInputs;
pub use types::{
  BlockedInstance, BuildInstance, ConfigVariant, InstanceId, UnitConfig, VariantError, VariantRequest,
  normalize_value,
};

/// The expanded, keyed set of instances for one invocation.
#[derive(Debug, Default)]
pub struct BuildPlan {
  pub instances: Vec<BuildInstance>,
  /// Plan indices of the instances depending on each instance.
  pub dependents: Vec<Vec<usize>>,
  pub errors: Vec<VariantError>,
  pub warnings: Vec<String>,
  pub blocked: Vec<BlockedInstance>,
  index: HashMap<InstanceId, usize>,
}

impl BuildPlan {
  pub fn len(&self) -> usize {
    self.instances.len()
  }

  pub fn is_empty(&self) -> bool {
    self.instances.is_empty()
  }

  pub fn get(&self, id: &InstanceId) -> Option<&BuildInstance> {
    self.index.get(id).map(|&i| &self.instances[i])
  }

  pub fn position(&self, id: &InstanceId) -> Option<usize> {
    self.index.get(id).copied()
  }

  /// Instances of one unit, in plan order.
  pub fn instances_of<'a>(&'a self, unit: &'a UnitId) -> impl Iterator<Item = &'a BuildInstance> + 'a {
    self.instances.iter().filter(move |i| &i.id.unit == unit)
  }
}

/// Expand `graph` under every request.
///
/// `configs` holds the manifest surface per unit; units without an entry only
/// recognize their scanned macros. `toolchain` is folded into every key.
pub fn resolve(
  graph: &ModuleGraph,
  configs: &HashMap<UnitId, UnitConfig>,
  requests: &[VariantRequest],
  toolchain: &str,
) -> BuildPlan {
  let mut resolver = Resolver::new(graph, configs, toolchain);

  for request in requests {
    resolver.resolve_request(request);
  }

  let mut plan = resolver.finish();
  plan.dependents = vec![Vec::new(); plan.instances.len()];
  for (i, instance) in plan.instances.iter().enumerate() {
    for &dep in &instance.dependencies {
      plan.dependents[dep].push(i);
    }
  }

  info!(
    instances = plan.instances.len(),
    errors = plan.errors.len(),
    blocked = plan.blocked.len(),
    "resolved build variants"
  );

  plan
}

struct Resolved {
  idx: usize,
  /// Unit index → variant for every instance in the transitive closure, self included.
  closure: BTreeMap<usize, ConfigVariant>,
}

struct Resolver<'a> {
  graph: &'a ModuleGraph,
  configs: &'a HashMap<UnitId, UnitConfig>,
  toolchain: &'a str,
  empty: UnitConfig,
  surfaces: Vec<Option<BTreeSet<String>>>,
  memo: HashMap<(usize, ConfigVariant), Option<usize>>,
  closures: Vec<BTreeMap<usize, ConfigVariant>>,
  plan: BuildPlan,
}

impl<'a> Resolver<'a> {
  fn new(graph: &'a ModuleGraph, configs: &'a HashMap<UnitId, UnitConfig>, toolchain: &'a str) -> Self {
    Self {
      graph,
      configs,
      toolchain,
      empty: UnitConfig::default(),
      surfaces: vec![None; graph.len()],
      memo: HashMap::new(),
      closures: Vec::new(),
      plan: BuildPlan::default(),
    }
  }

  fn finish(self) -> BuildPlan {
    self.plan
  }

  fn config(&self, idx: usize) -> &UnitConfig {
    self.configs.get(&self.graph.unit(idx).id).unwrap_or(&self.empty)
  }

  /// Effective surface of an unblocked unit. Producers of unblocked units are never
  /// blocked, so the recursion only sees acyclic parts of the graph.
  fn surface(&mut self, idx: usize) -> BTreeSet<String> {
    if let Some(surface) = &self.surfaces[idx] {
      return surface.clone();
    }

    let config = self.config(idx);
    let mut surface: BTreeSet<String> = self.graph.unit(idx).declarations.macro_requirements.clone();
    surface.extend(config.options.iter().cloned());
    surface.extend(config.allowed.keys().cloned());
    surface.extend(config.pins.keys().map(str::to_string));

    let producers: Vec<usize> = self.graph.edges(idx).iter().map(|e| e.producer).collect();
    for producer in producers {
      surface.extend(self.surface(producer));
    }

    self.surfaces[idx] = Some(surface.clone());
    surface
  }

  fn resolve_request(&mut self, request: &VariantRequest) {
    let consumer = format!("variant '{}'", request.name);
    let mut recognized = BTreeSet::new();

    let roots: Vec<usize> = match &request.targets {
      Some(targets) => targets
        .iter()
        .filter_map(|target| {
          let idx = self.graph.index_of(target);
          if idx.is_none() {
            warn!(variant = %request.name, target = %target, "target is not a known unit");
            self
              .plan
              .warnings
              .push(format!("{consumer}: target {target} is not a known unit"));
          }
          idx
        })
        .collect(),
      None => (0..self.graph.len()).collect(),
    };

    for root in roots {
      if self.graph.is_blocked(root) {
        continue;
      }
      recognized.extend(self.surface(root));
      self.instantiate(root, &request.options, &consumer);
    }

    for option in request.options.keys() {
      if !recognized.contains(option) {
        warn!(variant = %request.name, option = %option, "option not recognized by any unit");
        self
          .plan
          .warnings
          .push(format!("{consumer}: option '{option}' is not recognized by any unit"));
      }
    }
  }

  fn block(&mut self, instance: &InstanceId, reason: String) {
    debug!(instance = %instance, reason = %reason, "instance blocked");
    self.plan.blocked.push(BlockedInstance {
      instance: instance.to_string(),
      reason,
    });
  }

  /// Resolve one unit under a requested variant; `None` if it cannot be planned.
  fn instantiate(&mut self, idx: usize, requested: &ConfigVariant, consumer: &str) -> Option<Resolved> {
    let config = self.config(idx).clone();
    let effective = requested.overlay(&config.pins);
    let surface = self.surface(idx);
    let variant = effective.restrict(&surface);
    let graph = self.graph;
    let unit = graph.unit(idx);
    let id = InstanceId {
      unit: unit.id.clone(),
      variant: variant.clone(),
    };

    if let Some(&memo) = self.memo.get(&(idx, variant.clone())) {
      return memo.map(|i| Resolved {
        idx: i,
        closure: self.closures[i].clone(),
      });
    }

    for (option, allowed) in &config.allowed {
      if let Some(value) = effective.get(option)
        && !allowed.contains(value)
      {
        let error = VariantError::Incompatible {
          consumer: consumer.to_string(),
          producer: unit.id.clone(),
          option: option.clone(),
          value: value.to_string(),
          allowed: allowed.iter().cloned().collect(),
        };
        warn!(error = %error, "variant incompatibility");
        self.block(&id, error.to_string());
        self.plan.errors.push(error);
        self.memo.insert((idx, variant), None);
        return None;
      }
    }

    let label = id.to_string();
    let mut dependencies = Vec::new();
    let mut closure: BTreeMap<usize, ConfigVariant> = BTreeMap::new();
    let mut conflict = None;

    let producers: Vec<usize> = graph.edges(idx).iter().map(|e| e.producer).collect();
    for producer in producers {
      let Some(resolved) = self.instantiate(producer, &effective, &label) else {
        let producer_id = &graph.unit(producer).id;
        self.block(&id, format!("dependency {producer_id} could not be resolved"));
        self.memo.insert((idx, variant), None);
        return None;
      };

      dependencies.push(resolved.idx);
      for (unit_idx, dep_variant) in resolved.closure {
        match closure.get(&unit_idx) {
          Some(existing) if existing != &dep_variant && conflict.is_none() => {
            conflict = Some((unit_idx, existing.clone(), dep_variant));
          }
          Some(_) => {}
          None => {
            closure.insert(unit_idx, dep_variant);
          }
        }
      }
    }

    if let Some((unit_idx, first, second)) = conflict {
      let error = VariantError::LinkConflict {
        instance: label,
        unit: graph.unit(unit_idx).id.clone(),
        variants: vec![first.to_string(), second.to_string()],
      };
      warn!(error = %error, "link conflict");
      self.block(&id, error.to_string());
      self.plan.errors.push(error);
      self.memo.insert((idx, variant), None);
      return None;
    }

    let dep_keys: Vec<_> = dependencies.iter().map(|&d| &self.plan.instances[d].key).collect();
    let artifact = unit.declarations.exported_name();
    let inputs = KeyInputs {
      version: KEY_FORMAT_VERSION,
      unit: &unit.id,
      content: &unit.content_hash,
      dependencies: dep_keys,
      variant: &variant,
      toolchain: self.toolchain,
      artifact,
    };
    let key = match inputs.compute_hash() {
      Ok(key) => key,
      Err(e) => {
        let error = VariantError::Key {
          instance: label,
          message: e.to_string(),
        };
        self.block(&id, error.to_string());
        self.plan.errors.push(error);
        self.memo.insert((idx, variant), None);
        return None;
      }
    };

    let depth = dependencies
      .iter()
      .map(|&d| self.plan.instances[d].depth + 1)
      .max()
      .unwrap_or(0);
    let order = self.plan.instances.len();
    closure.insert(idx, variant.clone());

    debug!(instance = %id, key = %key, depth, "planned instance");
    self.plan.instances.push(BuildInstance {
      id: id.clone(),
      unit: idx,
      artifact: artifact.map(str::to_string),
      source: unit.path.clone(),
      content_hash: unit.content_hash.clone(),
      dependencies,
      key,
      depth,
      order,
    });
    self.plan.index.insert(id, order);
    self.closures.push(closure.clone());
    self.memo.insert((idx, variant), Some(order));

    Some(Resolved { idx: order, closure })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::graph::MixedModePolicy;
  use crate::scan::{LexicalScanner, UnitSource, scan_units};
  use std::path::PathBuf;

  fn graph(files: &[(&str, &str)]) -> ModuleGraph {
    let sources: Vec<UnitSource> = files
      .iter()
      .map(|(id, text)| UnitSource {
        id: UnitId::new(*id),
        path: PathBuf::from(id),
        text: text.to_string(),
      })
      .collect();
    ModuleGraph::build(scan_units(&LexicalScanner, &sources), MixedModePolicy::Strict)
  }

  fn variant(pairs: &[(&str, &str)]) -> ConfigVariant {
    pairs.iter().copied().collect()
  }

  fn default_request() -> Vec<VariantRequest> {
    vec![VariantRequest::new("default", ConfigVariant::new())]
  }

  #[test]
  fn normalization_makes_equal_variants_equal() {
    let a = variant(&[("FLAG", "on"), (" MODE ", " fast ")]);
    let b = variant(&[("MODE", "fast"), ("FLAG", "TRUE")]);

    assert_eq!(a, b);
    assert_eq!(a.to_string(), "FLAG=1,MODE=fast");
    assert_eq!(normalize_value("No"), "0");
  }

  #[test]
  fn chain_gets_depths_and_ordered_dependencies() {
    let g = graph(&[
      ("leaf.cppm", "export module m1;\n"),
      ("mid.cppm", "export module m2;\nimport m1;\n"),
      ("top.cpp", "import m2;\n"),
    ]);

    let plan = resolve(&g, &HashMap::new(), &default_request(), "tc");

    assert_eq!(plan.len(), 3);
    let depths: Vec<(String, usize)> = plan
      .instances
      .iter()
      .map(|i| (i.id.to_string(), i.depth))
      .collect();
    assert_eq!(
      depths,
      vec![
        ("leaf.cppm".to_string(), 0),
        ("mid.cppm".to_string(), 1),
        ("top.cpp".to_string(), 2)
      ]
    );
    assert_eq!(plan.dependents[0], vec![1]);
    assert_eq!(plan.instances[2].artifact, None);
    assert_eq!(plan.instances[1].artifact.as_deref(), Some("m2"));
  }

  #[test]
  fn keys_are_pure_functions_of_inputs() {
    let files = [("a.cppm", "export module a;\n"), ("b.cpp", "import a;\n")];
    let first = resolve(&graph(&files), &HashMap::new(), &default_request(), "tc");
    let second = resolve(&graph(&files), &HashMap::new(), &default_request(), "tc");
    let other_toolchain = resolve(&graph(&files), &HashMap::new(), &default_request(), "tc2");

    assert_eq!(first.instances[1].key, second.instances[1].key);
    assert_ne!(first.instances[1].key, other_toolchain.instances[1].key);
  }

  #[test]
  fn changing_a_leaf_changes_consumer_keys_only() {
    let before = resolve(
      &graph(&[
        ("leaf.cppm", "export module leaf;\n"),
        ("user.cpp", "import leaf;\n"),
        ("alone.cppm", "export module alone;\n"),
      ]),
      &HashMap::new(),
      &default_request(),
      "tc",
    );
    let after = resolve(
      &graph(&[
        ("leaf.cppm", "export module leaf;\nexport int v();\n"),
        ("user.cpp", "import leaf;\n"),
        ("alone.cppm", "export module alone;\n"),
      ]),
      &HashMap::new(),
      &default_request(),
      "tc",
    );

    assert_ne!(before.instances[0].key, after.instances[0].key);
    assert_ne!(before.instances[1].key, after.instances[1].key);
    assert_eq!(before.instances[2].key, after.instances[2].key);
  }

  #[test]
  fn variants_of_the_same_unit_get_distinct_keys() {
    let g = graph(&[
      ("x.cppm", "export module x;\n#ifdef FLAG\n#endif\n"),
      ("plain.cppm", "export module plain;\n"),
    ]);
    let requests = vec![
      VariantRequest::new("on", variant(&[("FLAG", "on")])),
      VariantRequest::new("off", variant(&[("FLAG", "off")])),
    ];

    let plan = resolve(&g, &HashMap::new(), &requests, "tc");

    let x_id = UnitId::new("x.cppm");
    let xs: Vec<&BuildInstance> = plan.instances_of(&x_id).collect();
    assert_eq!(xs.len(), 2);
    assert_ne!(xs[0].key, xs[1].key);
    assert_eq!(xs[0].id.to_string(), "x.cppm[FLAG=1]");
    // `plain` does not recognize FLAG, so both requests share one instance.
    assert_eq!(plan.instances_of(&UnitId::new("plain.cppm")).count(), 1);
    assert!(plan.warnings.is_empty());
  }

  #[test]
  fn consumers_inherit_producer_surface() {
    let g = graph(&[
      ("x.cppm", "export module x;\n#if FLAG\n#endif\n"),
      ("user.cpp", "import x;\n"),
    ]);
    let requests = vec![
      VariantRequest::new("on", variant(&[("FLAG", "1")])),
      VariantRequest::new("off", variant(&[("FLAG", "0")])),
    ];

    let plan = resolve(&g, &HashMap::new(), &requests, "tc");

    assert_eq!(plan.instances_of(&UnitId::new("user.cpp")).count(), 2);
    let on = plan
      .get(&InstanceId {
        unit: UnitId::new("user.cpp"),
        variant: variant(&[("FLAG", "1")]),
      })
      .unwrap();
    assert_eq!(plan.instances[on.dependencies[0]].id.variant.get("FLAG"), Some("1"));
  }

  #[test]
  fn disallowed_value_blocks_consumer_and_names_both_sides() {
    let g = graph(&[("io.cppm", "export module io;\n"), ("app.cpp", "import io;\n")]);
    let mut configs = HashMap::new();
    configs.insert(
      UnitId::new("io.cppm"),
      UnitConfig {
        allowed: BTreeMap::from([("BACKEND".to_string(), BTreeSet::from(["posix".to_string()]))]),
        ..Default::default()
      },
    );
    let requests = vec![VariantRequest {
      name: "win".to_string(),
      options: variant(&[("BACKEND", "win32")]),
      targets: Some(vec![UnitId::new("app.cpp")]),
    }];

    let plan = resolve(&g, &configs, &requests, "tc");

    assert!(plan.is_empty());
    assert_eq!(
      plan.errors,
      vec![VariantError::Incompatible {
        consumer: "app.cpp[BACKEND=win32]".to_string(),
        producer: UnitId::new("io.cppm"),
        option: "BACKEND".to_string(),
        value: "win32".to_string(),
        allowed: vec!["posix".to_string()],
      }]
    );
    assert_eq!(plan.blocked.len(), 2);
  }

  #[test]
  fn pins_override_requests_for_the_closure() {
    let g = graph(&[
      ("io.cppm", "export module io;\n#ifdef BACKEND\n#endif\n"),
      ("app.cpp", "import io;\n"),
    ]);
    let mut configs = HashMap::new();
    configs.insert(
      UnitId::new("app.cpp"),
      UnitConfig {
        pins: variant(&[("BACKEND", "posix")]),
        ..Default::default()
      },
    );
    let requests = vec![VariantRequest {
      name: "any".to_string(),
      options: variant(&[("BACKEND", "win32")]),
      targets: Some(vec![UnitId::new("app.cpp")]),
    }];

    let plan = resolve(&g, &configs, &requests, "tc");

    assert_eq!(plan.len(), 2);
    assert_eq!(plan.instances[0].id.to_string(), "io.cppm[BACKEND=posix]");
    assert_eq!(plan.instances[1].id.to_string(), "app.cpp[BACKEND=posix]");
  }

  #[test]
  fn two_variants_of_one_unit_in_a_closure_is_a_link_conflict() {
    let g = graph(&[
      ("p.cppm", "export module p;\n#ifdef K\n#endif\n"),
      ("q.cppm", "export module q;\nimport p;\n"),
      ("u.cpp", "import p;\nimport q;\n"),
    ]);
    let mut configs = HashMap::new();
    configs.insert(
      UnitId::new("q.cppm"),
      UnitConfig {
        pins: variant(&[("K", "1")]),
        ..Default::default()
      },
    );
    let requests = vec![VariantRequest {
      name: "default".to_string(),
      options: variant(&[("K", "0")]),
      targets: Some(vec![UnitId::new("u.cpp")]),
    }];

    let plan = resolve(&g, &configs, &requests, "tc");

    assert!(matches!(
      plan.errors.as_slice(),
      [VariantError::LinkConflict { unit, .. }] if unit.as_str() == "p.cppm"
    ));
    assert!(plan.get(&InstanceId {
      unit: UnitId::new("u.cpp"),
      variant: variant(&[("K", "0")]),
    })
    .is_none());
  }

  #[test]
  fn unrecognized_options_warn() {
    let g = graph(&[("a.cppm", "export module a;\n")]);
    let requests = vec![VariantRequest::new("dbg", variant(&[("NOPE", "1")]))];

    let plan = resolve(&g, &HashMap::new(), &requests, "tc");

    assert_eq!(plan.len(), 1);
    assert_eq!(plan.warnings, vec!["variant 'dbg': option 'NOPE' is not recognized by any unit"]);
  }

  #[test]
  fn blocked_units_produce_no_instances() {
    let g = graph(&[
      ("a.cppm", "export module a;\nimport b;\n"),
      ("b.cppm", "export module b;\nimport a;\n"),
      ("c.cppm", "export module c;\n"),
    ]);

    let plan = resolve(&g, &HashMap::new(), &default_request(), "tc");

    assert_eq!(plan.len(), 1);
    assert_eq!(plan.instances[0].id.unit.as_str(), "c.cppm");
  }
}

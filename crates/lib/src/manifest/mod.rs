//! Build manifest loading.
//!
//! A manifest (`modbuild.toml`) names the source directories to scan, the per-unit
//! configuration surface, the variants to build and the build step settings. Unit
//! identities are manifest-relative paths, so a project builds to the same keys
//! wherever it is checked out.

mod types;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::consts::DEFAULT_VARIANT_NAME;
use crate::scan::UnitSource;
use crate::types::UnitId;
use crate::variant::{ConfigVariant, UnitConfig, VariantRequest, normalize_value};

pub use types::{BuildSection, ManifestFile, OptionValue, ProjectSection, SourcesSection, UnitDecl, VariantDecl};

#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse {path}: {message}")]
  Parse { path: PathBuf, message: String },

  #[error("failed to walk source directory {path}: {message}")]
  Walk { path: PathBuf, message: String },

  #[error("path '{0}' must be relative and stay inside the project")]
  InvalidPath(String),

  #[error("unit '{0}' is declared more than once")]
  DuplicateUnit(String),

  #[error("variant '{0}' is declared more than once")]
  DuplicateVariant(String),

  #[error("declared unit '{0}' does not exist")]
  MissingUnit(String),
}

/// A loaded manifest and the directory it lives in.
#[derive(Debug, Clone)]
pub struct Manifest {
  root: PathBuf,
  file: ManifestFile,
}

impl Manifest {
  /// Load and validate the manifest at `path`.
  pub fn load(path: &Path) -> Result<Self, ManifestError> {
    let content = fs::read_to_string(path).map_err(|source| ManifestError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let root = match path.parent() {
      Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
      _ => PathBuf::from("."),
    };
    let root = dunce::canonicalize(&root).map_err(|source| ManifestError::Read {
      path: root.clone(),
      source,
    })?;

    let manifest = Self::parse(&content, root).map_err(|e| match e {
      ManifestError::Parse { message, .. } => ManifestError::Parse {
        path: path.to_path_buf(),
        message,
      },
      other => other,
    })?;
    info!(path = ?path, project = %manifest.file.project.name, "loaded manifest");
    Ok(manifest)
  }

  /// Parse manifest text for a project rooted at `root`.
  pub fn parse(content: &str, root: PathBuf) -> Result<Self, ManifestError> {
    let file: ManifestFile = toml::from_str(content).map_err(|e| ManifestError::Parse {
      path: root.clone(),
      message: e.to_string(),
    })?;

    let mut units = HashSet::new();
    for unit in &file.units {
      let id = relative_id(&unit.path)?;
      if !units.insert(id) {
        return Err(ManifestError::DuplicateUnit(unit.path.clone()));
      }
    }
    let mut variants = HashSet::new();
    for variant in &file.variants {
      if !variants.insert(variant.name.as_str()) {
        return Err(ManifestError::DuplicateVariant(variant.name.clone()));
      }
    }
    for dir in &file.sources.dirs {
      relative_id(dir)?;
    }

    Ok(Self { root, file })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn project(&self) -> &ProjectSection {
    &self.file.project
  }

  pub fn build(&self) -> &BuildSection {
    &self.file.build
  }

  pub fn file(&self) -> &ManifestFile {
    &self.file
  }

  /// Manifest-declared cache directory, resolved against the project root.
  pub fn cache_dir(&self) -> Option<PathBuf> {
    self.file.build.cache_dir.as_ref().map(|dir| self.root.join(dir))
  }

  /// Every unit of the project: files under the source directories with a known
  /// extension, plus units declared explicitly. Sorted by identity.
  pub fn discover(&self) -> Result<Vec<UnitId>, ManifestError> {
    self.discover_outside(None)
  }

  /// Like [`Manifest::discover`], but never descends into `cache_root` when it lies
  /// inside a source directory.
  pub fn discover_outside(&self, cache_root: Option<&Path>) -> Result<Vec<UnitId>, ManifestError> {
    let skip = cache_root.and_then(|dir| dunce::canonicalize(dir).ok());
    let sources = &self.file.sources;
    let extensions: HashSet<&str> = sources.extensions.iter().map(|e| e.trim_start_matches('.')).collect();
    let excluded: HashSet<&str> = sources.exclude.iter().map(String::as_str).collect();
    let mut found = BTreeSet::new();

    for dir in &sources.dirs {
      let base = self.root.join(dir);
      if !base.is_dir() {
        debug!(dir = %dir, "source directory does not exist, skipping");
        continue;
      }

      let walker = WalkDir::new(&base).sort_by_file_name().into_iter().filter_entry(|entry| {
        let name = entry.file_name().to_string_lossy();
        if entry.depth() == 0 {
          return true;
        }
        if entry.file_type().is_dir() && skip.as_deref().is_some_and(|skip| entry.path() == skip) {
          return false;
        }
        !(name.starts_with('.') || (entry.file_type().is_dir() && excluded.contains(&*name)))
      });

      for entry in walker {
        let entry = entry.map_err(|e| ManifestError::Walk {
          path: base.clone(),
          message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
          continue;
        }
        let matches = entry
          .path()
          .extension()
          .and_then(|ext| ext.to_str())
          .is_some_and(|ext| extensions.contains(ext));
        if !matches {
          continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(&self.root) {
          found.insert(UnitId::new(relative.to_string_lossy()));
        }
      }
    }

    for unit in &self.file.units {
      let id = relative_id(&unit.path)?;
      if !self.root.join(id.as_str()).is_file() {
        return Err(ManifestError::MissingUnit(unit.path.clone()));
      }
      found.insert(id);
    }

    info!(units = found.len(), "discovered units");
    Ok(found.into_iter().collect())
  }

  /// Read the text of the given units.
  pub fn read_sources(&self, ids: &[UnitId]) -> Result<Vec<UnitSource>, ManifestError> {
    ids
      .iter()
      .map(|id| {
        let path = self.root.join(id.as_str());
        let text = fs::read_to_string(&path).map_err(|source| ManifestError::Read {
          path: path.clone(),
          source,
        })?;
        Ok(UnitSource {
          id: id.clone(),
          path,
          text,
        })
      })
      .collect()
  }

  /// Configuration surface per declared unit.
  pub fn unit_configs(&self) -> Result<HashMap<UnitId, UnitConfig>, ManifestError> {
    self
      .file
      .units
      .iter()
      .map(|unit| {
        let config = UnitConfig {
          options: unit.options.iter().map(|o| o.trim().to_string()).collect(),
          allowed: unit
            .allowed
            .iter()
            .map(|(option, values)| {
              let values = values.iter().map(|v| normalize_value(&v.to_string())).collect();
              (option.trim().to_string(), values)
            })
            .collect(),
          pins: unit.pin.iter().map(|(k, v)| (k.as_str(), v.to_string())).collect(),
        };
        Ok((relative_id(&unit.path)?, config))
      })
      .collect()
  }

  /// Variant requests, optionally restricted to `only` by name. A manifest without
  /// variants requests a single empty `default` variant.
  pub fn variant_requests(&self, only: &[String]) -> Result<Vec<VariantRequest>, ManifestError> {
    let mut requests = Vec::new();
    for variant in &self.file.variants {
      let options: ConfigVariant = variant.options.iter().map(|(k, v)| (k.as_str(), v.to_string())).collect();
      let mut request = VariantRequest::new(&variant.name, options);
      if let Some(targets) = &variant.targets {
        request.targets = Some(
          targets
            .iter()
            .map(|t| relative_id(t))
            .collect::<Result<Vec<_>, _>>()?,
        );
      }
      requests.push(request);
    }

    if requests.is_empty() {
      requests.push(VariantRequest::new(DEFAULT_VARIANT_NAME, ConfigVariant::new()));
    }
    if !only.is_empty() {
      requests.retain(|r| only.contains(&r.name));
    }
    Ok(requests)
  }
}

/// Normalize a manifest-relative path into a unit identity.
fn relative_id(path: &str) -> Result<UnitId, ManifestError> {
  let candidate = Path::new(path);
  let mut parts = Vec::new();
  for component in candidate.components() {
    match component {
      Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
      Component::CurDir => {}
      _ => return Err(ManifestError::InvalidPath(path.to_string())),
    }
  }
  Ok(UnitId::new(parts.join("/")))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::execute::CompletionOrder;
  use crate::graph::MixedModePolicy;
  use tempfile::TempDir;

  const FULL: &str = r#"
[project]
name = "demo"
toolchain = "clang++-18 -std=c++23"

[build]
command = "clang++ {defines} -c {source} -o {out}/{stem}.o"
parallelism = 4
fail_fast = true
ordering = "eager"
mixed_mode = "lenient"

[sources]
dirs = ["src"]
extensions = ["cppm", "cpp"]

[[unit]]
path = "src/io.cppm"
options = ["IO_TRACE"]
allowed = { IO_TRACE = [false, true] }
pin = { IO_BACKEND = "posix" }

[[variant]]
name = "debug"
options = { IO_TRACE = "on", LEVEL = 2 }
targets = ["./src/main.cpp"]

[[variant]]
name = "release"
"#;

  fn project(manifest: &str, files: &[&str]) -> (TempDir, Manifest) {
    let temp = TempDir::new().unwrap();
    for file in files {
      let path = temp.path().join(file);
      fs::create_dir_all(path.parent().unwrap()).unwrap();
      fs::write(&path, format!("// {file}\n")).unwrap();
    }
    let manifest_path = temp.path().join("modbuild.toml");
    fs::write(&manifest_path, manifest).unwrap();
    let manifest = Manifest::load(&manifest_path).unwrap();
    (temp, manifest)
  }

  #[test]
  fn parses_full_manifest() {
    let (_temp, manifest) = project(FULL, &["src/io.cppm", "src/main.cpp"]);

    assert_eq!(manifest.project().name, "demo");
    assert_eq!(manifest.build().parallelism, Some(4));
    assert!(manifest.build().fail_fast);
    assert_eq!(manifest.build().ordering, CompletionOrder::Eager);
    assert_eq!(manifest.build().mixed_mode, MixedModePolicy::Lenient);

    let configs = manifest.unit_configs().unwrap();
    let io = &configs[&UnitId::new("src/io.cppm")];
    assert!(io.options.contains("IO_TRACE"));
    assert_eq!(
      io.allowed["IO_TRACE"],
      ["0", "1"].into_iter().map(str::to_string).collect::<BTreeSet<_>>()
    );
    assert_eq!(io.pins.get("IO_BACKEND"), Some("posix"));

    let requests = manifest.variant_requests(&[]).unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].options.to_string(), "IO_TRACE=1,LEVEL=2");
    assert_eq!(requests[0].targets, Some(vec![UnitId::new("src/main.cpp")]));
    assert!(requests[1].options.is_empty());
  }

  #[test]
  fn defaults_apply_to_empty_manifest() {
    let (_temp, manifest) = project("", &["a.cppm", "b.cpp", "notes.txt", ".hidden/x.cppm"]);

    assert_eq!(manifest.build().ordering, CompletionOrder::Deterministic);
    assert_eq!(manifest.build().mixed_mode, MixedModePolicy::Strict);
    assert_eq!(
      manifest.discover().unwrap(),
      vec![UnitId::new("a.cppm"), UnitId::new("b.cpp")]
    );

    let requests = manifest.variant_requests(&[]).unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].name, DEFAULT_VARIANT_NAME);
  }

  #[test]
  fn discovery_respects_dirs_extensions_and_excludes() {
    let manifest = "[sources]\ndirs = [\"src\"]\nextensions = [\"cppm\"]\nexclude = [\"gen\"]\n";
    let (_temp, manifest) = project(
      manifest,
      &["src/a.cppm", "src/sub/b.cppm", "src/gen/c.cppm", "src/d.cpp", "other/e.cppm"],
    );

    assert_eq!(
      manifest.discover().unwrap(),
      vec![UnitId::new("src/a.cppm"), UnitId::new("src/sub/b.cppm")]
    );
  }

  #[test]
  fn discovery_skips_cache_root_inside_project() {
    let (temp, manifest) = project("[build]\ncache_dir = \"cache\"\n", &["a.cppm", "cache/objects/a.cppm"]);

    assert_eq!(
      manifest.discover_outside(manifest.cache_dir().as_deref()).unwrap(),
      vec![UnitId::new("a.cppm")]
    );
    assert_eq!(manifest.discover().unwrap().len(), 2);
    assert!(temp.path().join("cache").is_dir());
  }

  #[test]
  fn variant_filter_selects_by_name() {
    let (_temp, manifest) = project(FULL, &["src/io.cppm", "src/main.cpp"]);

    let requests = manifest.variant_requests(&["release".to_string()]).unwrap();

    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].name, "release");
  }

  #[test]
  fn reads_sources_with_absolute_paths() {
    let (temp, manifest) = project("", &["m.cppm"]);

    let sources = manifest.read_sources(&manifest.discover().unwrap()).unwrap();

    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].text, "// m.cppm\n");
    assert_eq!(sources[0].path, dunce::canonicalize(temp.path()).unwrap().join("m.cppm"));
  }

  #[test]
  fn rejects_unknown_fields() {
    let err = Manifest::parse("[build]\njobs = 3\n", PathBuf::from(".")).unwrap_err();
    assert!(matches!(err, ManifestError::Parse { .. }));
  }

  #[test]
  fn rejects_duplicates_and_escaping_paths() {
    let dup = "[[variant]]\nname = \"a\"\n[[variant]]\nname = \"a\"\n";
    assert!(matches!(
      Manifest::parse(dup, PathBuf::from(".")),
      Err(ManifestError::DuplicateVariant(_))
    ));

    let escape = "[[unit]]\npath = \"../outside.cppm\"\n";
    assert!(matches!(
      Manifest::parse(escape, PathBuf::from(".")),
      Err(ManifestError::InvalidPath(_))
    ));
  }

  #[test]
  fn missing_declared_unit_is_an_error() {
    let (_temp, manifest) = project("[[unit]]\npath = \"gone.cppm\"\n", &[]);

    assert!(matches!(manifest.discover(), Err(ManifestError::MissingUnit(_))));
  }
}

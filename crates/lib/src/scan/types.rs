//! Types produced by the source scanner.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::UnitId;
use crate::util::hash::ContentHash;

/// How a unit consumes its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitMode {
  /// The unit declares a module or imports named artifacts.
  UsesImports,
  /// The unit only textually includes other units.
  UsesIncludes,
}

impl fmt::Display for UnitMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      UnitMode::UsesImports => write!(f, "uses-imports"),
      UnitMode::UsesIncludes => write!(f, "uses-includes"),
    }
  }
}

/// Where the declarations of an exported artifact are attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Attachment {
  /// Declarations belong exclusively to the named artifact.
  Named,
  /// Declarations live in the global module and are usable from either mode.
  Global,
}

impl fmt::Display for Attachment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Attachment::Named => write!(f, "named"),
      Attachment::Global => write!(f, "global"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyKind {
  /// `import NAME;` references an artifact by name.
  Import,
  /// `#include "path"` references another unit's raw text.
  Include,
}

/// A dependency as written in the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
  pub kind: DependencyKind,
  /// Artifact name for imports, include path for includes.
  pub name: String,
  /// 1-based line of the first occurrence.
  pub line: usize,
}

/// The artifact a unit exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportDecl {
  pub name: String,
  pub attachment: Attachment,
  pub line: usize,
}

/// Everything the scanner extracts from one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declarations {
  pub export: Option<ExportDecl>,
  /// Set for implementation units (`module NAME;`).
  pub implements: Option<String>,
  /// Ordered, deduplicated dependencies.
  pub dependencies: Vec<Dependency>,
  pub mode: UnitMode,
  /// Macros tested by top-level conditionals and not defined by the unit itself.
  pub macro_requirements: BTreeSet<String>,
}

impl Default for Declarations {
  fn default() -> Self {
    Self {
      export: None,
      implements: None,
      dependencies: Vec::new(),
      mode: UnitMode::UsesIncludes,
      macro_requirements: BTreeSet::new(),
    }
  }
}

impl Declarations {
  pub fn exported_name(&self) -> Option<&str> {
    self.export.as_ref().map(|e| e.name.as_str())
  }

  pub fn imports(&self) -> impl Iterator<Item = &Dependency> {
    self.dependencies.iter().filter(|d| d.kind == DependencyKind::Import)
  }

  pub fn includes(&self) -> impl Iterator<Item = &Dependency> {
    self.dependencies.iter().filter(|d| d.kind == DependencyKind::Include)
  }

  /// True for module interface and implementation units.
  pub fn is_module_unit(&self) -> bool {
    self.export.is_some() || self.implements.is_some()
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ScanErrorKind {
  #[error("malformed declaration: {0}")]
  Malformed(String),

  #[error("import of '{0}' appears after other declarations")]
  ImportAfterDeclarations(String),

  #[error("textual include of \"{0}\" inside the module purview")]
  IncludeInPurview(String),

  #[error("global module fragment must open the unit")]
  MisplacedGlobalFragment,

  #[error("global module fragment is not followed by a module declaration")]
  DanglingGlobalFragment,

  #[error("duplicate module declaration (first on line {first_line})")]
  DuplicateModuleDeclaration { first_line: usize },

  #[error("unit mixes textual includes with named imports")]
  MixedDeclarationStyle,

  #[error("unterminated block comment")]
  UnterminatedComment,
}

/// A scan error localized to one line of one unit.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("line {line}: {kind}")]
pub struct ScanError {
  pub line: usize,
  pub kind: ScanErrorKind,
}

impl ScanError {
  pub fn new(line: usize, kind: ScanErrorKind) -> Self {
    Self { line, kind }
  }
}

/// Result of scanning one text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutput {
  pub declarations: Declarations,
  pub errors: Vec<ScanError>,
}

/// Raw input for the scanner: a unit's identity, location and text.
#[derive(Debug, Clone)]
pub struct UnitSource {
  pub id: UnitId,
  pub path: PathBuf,
  pub text: String,
}

/// A unit after scanning.
#[derive(Debug, Clone, Serialize)]
pub struct ScannedUnit {
  pub id: UnitId,
  pub path: PathBuf,
  pub content_hash: ContentHash,
  pub declarations: Declarations,
  pub errors: Vec<ScanError>,
}

impl ScannedUnit {
  pub fn has_errors(&self) -> bool {
    !self.errors.is_empty()
  }
}

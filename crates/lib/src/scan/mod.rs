//! Lexical source scanning.
//!
//! The scanner extracts what the orchestrator needs from a unit without parsing it:
//! the exported artifact name, the ordered dependencies, the unit's mode and the
//! macros its top-level conditionals test. Problems are collected as [`ScanError`]s
//! attached to the unit; scanning never aborts.

mod types;

use std::collections::{BTreeSet, HashSet};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::util::hash::hash_bytes;

pub use types::{
  Attachment, Declarations, Dependency, DependencyKind, ExportDecl, ScanError, ScanErrorKind, ScanOutput,
  ScannedUnit, UnitMode, UnitSource,
};

/// Extracts declarations from unit text.
///
/// Implementations must be pure: the same text always yields the same output.
pub trait Scanner: Send + Sync {
  fn scan(&self, text: &str) -> ScanOutput;
}

/// Line-oriented scanner for module and preprocessor declarations.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalScanner;

impl Scanner for LexicalScanner {
  fn scan(&self, text: &str) -> ScanOutput {
    scan_text(text)
  }
}

/// Scan every source in parallel, preserving input order.
pub fn scan_units<S: Scanner>(scanner: &S, sources: &[UnitSource]) -> Vec<ScannedUnit> {
  let units: Vec<ScannedUnit> = sources
    .par_iter()
    .map(|source| {
      let output = scanner.scan(&source.text);
      ScannedUnit {
        id: source.id.clone(),
        path: source.path.clone(),
        content_hash: hash_bytes(source.text.as_bytes()),
        declarations: output.declarations,
        errors: output.errors,
      }
    })
    .collect();

  for unit in &units {
    for error in &unit.errors {
      warn!(unit = %unit.id, error = %error, "scan error");
    }
    debug!(
      unit = %unit.id,
      export = ?unit.declarations.exported_name(),
      dependencies = unit.declarations.dependencies.len(),
      mode = %unit.declarations.mode,
      "scanned unit"
    );
  }

  units
}

/// Scan a single text with the lexical rules.
pub fn scan_text(text: &str) -> ScanOutput {
  let mut state = ScanState::default();

  let (stripped, unterminated) = strip_comments(text);
  if let Some(line) = unterminated {
    state.error(line, ScanErrorKind::UnterminatedComment);
  }

  for (index, raw) in stripped.lines().enumerate() {
    let line = raw.trim();
    if line.is_empty() {
      continue;
    }
    state.line(index + 1, line);
  }

  state.finish()
}

#[derive(Default)]
struct ScanState {
  decls: Declarations,
  errors: Vec<ScanError>,
  seen: HashSet<(DependencyKind, String)>,
  defined: BTreeSet<String>,
  required: BTreeSet<String>,
  /// Anything at all has been seen (directives included).
  started: bool,
  /// An ordinary declaration has been seen since the module declaration (or file start).
  saw_declaration: bool,
  fragment_line: Option<usize>,
  module_line: Option<usize>,
  first_import_line: Option<usize>,
  first_include_line: Option<usize>,
}

impl ScanState {
  fn error(&mut self, line: usize, kind: ScanErrorKind) {
    self.errors.push(ScanError::new(line, kind));
  }

  fn depend(&mut self, kind: DependencyKind, name: &str, line: usize) {
    match kind {
      DependencyKind::Import => {
        self.first_import_line.get_or_insert(line);
      }
      DependencyKind::Include => {
        self.first_include_line.get_or_insert(line);
      }
    }
    if self.seen.insert((kind, name.to_string())) {
      self.decls.dependencies.push(Dependency {
        kind,
        name: name.to_string(),
        line,
      });
    }
  }

  fn line(&mut self, number: usize, line: &str) {
    let started = std::mem::replace(&mut self.started, true);

    if let Some(directive) = line.strip_prefix('#') {
      self.directive(number, directive.trim_start());
      return;
    }

    if is_fragment_opener(line) {
      if started {
        self.error(number, ScanErrorKind::MisplacedGlobalFragment);
      } else {
        self.fragment_line = Some(number);
      }
      return;
    }

    let (exported, rest) = match strip_keyword(line, "export") {
      Some(rest) => (true, rest),
      None => (false, line),
    };

    if let Some(rest) = strip_keyword(rest, "module") {
      self.module_declaration(number, exported, rest);
      return;
    }

    if let Some(rest) = strip_keyword(rest, "import") {
      self.import(number, rest);
      return;
    }

    if (rest.starts_with("extern \"C++\"") || rest.starts_with("extern\"C++\""))
      && self.module_line.is_some()
      && let Some(export) = self.decls.export.as_mut()
    {
      export.attachment = Attachment::Global;
    }

    self.saw_declaration = true;
  }

  fn module_declaration(&mut self, number: usize, exported: bool, rest: &str) {
    if let Some(first_line) = self.module_line {
      self.error(number, ScanErrorKind::DuplicateModuleDeclaration { first_line });
      return;
    }

    let name = match parse_statement_name(rest) {
      Ok(name) => name,
      Err(reason) => {
        self.error(number, ScanErrorKind::Malformed(format!("module declaration: {reason}")));
        return;
      }
    };

    self.module_line = Some(number);
    self.saw_declaration = false;

    if exported {
      self.decls.export = Some(ExportDecl {
        name: name.to_string(),
        attachment: Attachment::Named,
        line: number,
      });
    } else {
      self.decls.implements = Some(name.to_string());
      self.depend(DependencyKind::Import, name, number);
    }
  }

  fn import(&mut self, number: usize, rest: &str) {
    if rest.starts_with('"') || rest.starts_with('<') {
      self.error(
        number,
        ScanErrorKind::Malformed("header unit imports are not supported".to_string()),
      );
      return;
    }

    let name = match parse_statement_name(rest) {
      Ok(name) => name,
      Err(reason) => {
        self.error(number, ScanErrorKind::Malformed(format!("import: {reason}")));
        return;
      }
    };

    if self.saw_declaration {
      self.error(number, ScanErrorKind::ImportAfterDeclarations(name.to_string()));
    }
    self.depend(DependencyKind::Import, name, number);
  }

  fn directive(&mut self, number: usize, directive: &str) {
    let (keyword, rest) = split_word(directive);
    match keyword {
      "include" => self.include(number, rest),
      "ifdef" | "ifndef" => {
        let (name, _) = split_word(rest);
        if is_identifier(name) {
          self.required.insert(name.to_string());
        }
      }
      "if" | "elif" => {
        for name in condition_identifiers(rest) {
          self.required.insert(name);
        }
      }
      "define" => {
        let name: String = rest.chars().take_while(|c| c.is_ascii_alphanumeric() || *c == '_').collect();
        if is_identifier(&name) {
          self.defined.insert(name);
        }
      }
      _ => {}
    }
  }

  fn include(&mut self, number: usize, rest: &str) {
    if rest.starts_with('<') {
      if !rest.contains('>') {
        self.error(number, ScanErrorKind::Malformed("unterminated system include".to_string()));
      }
      return;
    }

    let path = match rest.strip_prefix('"').and_then(|r| r.split_once('"')) {
      Some((path, _)) if !path.trim().is_empty() => path.trim(),
      _ => {
        self.error(number, ScanErrorKind::Malformed(format!("include target `{rest}`")));
        return;
      }
    };

    if self.module_line.is_some() {
      self.error(number, ScanErrorKind::IncludeInPurview(path.to_string()));
      return;
    }
    self.depend(DependencyKind::Include, path, number);
  }

  fn finish(mut self) -> ScanOutput {
    if let Some(line) = self.fragment_line
      && self.module_line.is_none()
    {
      self.error(line, ScanErrorKind::DanglingGlobalFragment);
    }

    let is_module_unit = self.decls.is_module_unit();
    if let (false, Some(_), Some(include_line)) = (is_module_unit, self.first_import_line, self.first_include_line)
    {
      self.error(include_line, ScanErrorKind::MixedDeclarationStyle);
    }

    self.decls.mode = if is_module_unit || self.first_import_line.is_some() {
      UnitMode::UsesImports
    } else {
      UnitMode::UsesIncludes
    };

    self.decls.macro_requirements = self.required.difference(&self.defined).cloned().collect();
    self.errors.sort_by_key(|e| e.line);

    ScanOutput {
      declarations: self.decls,
      errors: self.errors,
    }
  }
}

fn is_fragment_opener(line: &str) -> bool {
  strip_keyword(line, "module").is_some_and(|rest| rest.trim() == ";")
}

/// Strip a leading keyword, requiring a word boundary after it.
fn strip_keyword<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
  let rest = line.strip_prefix(keyword)?;
  match rest.chars().next() {
    None => Some(rest),
    Some(c) if c.is_ascii_alphanumeric() || c == '_' => None,
    Some(_) => Some(rest.trim_start()),
  }
}

fn split_word(text: &str) -> (&str, &str) {
  let end = text
    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
    .unwrap_or(text.len());
  (&text[..end], text[end..].trim_start())
}

/// Parse `NAME;` where `NAME` is dotted identifiers.
fn parse_statement_name(rest: &str) -> Result<&str, String> {
  let Some(body) = rest.trim_end().strip_suffix(';') else {
    return Err("missing `;`".to_string());
  };
  let name = body.trim();
  if name.is_empty() {
    return Err("missing name".to_string());
  }
  if !is_module_name(name) {
    return Err(format!("invalid name `{name}`"));
  }
  Ok(name)
}

fn is_identifier(text: &str) -> bool {
  let mut chars = text.chars();
  match chars.next() {
    Some(c) if c.is_ascii_alphabetic() || c == '_' => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
    _ => false,
  }
}

fn is_module_name(text: &str) -> bool {
  text.split('.').all(is_identifier)
}

/// Identifiers referenced by an `#if`/`#elif` expression.
///
/// `defined` itself, boolean literals and reserved `__` names are not macros the
/// unit can be configured with.
fn condition_identifiers(expr: &str) -> Vec<String> {
  let mut names = Vec::new();
  let mut chars = expr.char_indices().peekable();

  while let Some((start, c)) = chars.next() {
    if c.is_ascii_digit() {
      while chars.peek().is_some_and(|(_, c)| c.is_ascii_alphanumeric() || *c == '_') {
        chars.next();
      }
      continue;
    }
    if !(c.is_ascii_alphabetic() || c == '_') {
      continue;
    }
    let mut end = start + c.len_utf8();
    while let Some(&(i, c)) = chars.peek() {
      if c.is_ascii_alphanumeric() || c == '_' {
        end = i + c.len_utf8();
        chars.next();
      } else {
        break;
      }
    }
    let name = &expr[start..end];
    if matches!(name, "defined" | "true" | "false") || name.starts_with("__") {
      continue;
    }
    names.push(name.to_string());
  }

  names
}

/// Remove `//` and `/* */` comments, keeping string and character literals and
/// every newline so line numbers survive. Returns the line of an unterminated
/// block comment, if any.
fn strip_comments(text: &str) -> (String, Option<usize>) {
  enum Mode {
    Code,
    Line,
    Block(usize),
    Str(char),
  }

  let mut out = String::with_capacity(text.len());
  let mut mode = Mode::Code;
  let mut line = 1;
  let mut prev = '\0';
  let mut chars = text.chars().peekable();

  while let Some(c) = chars.next() {
    if c == '\n' {
      line += 1;
    }
    match mode {
      Mode::Code => match c {
        '/' if chars.peek() == Some(&'/') => {
          chars.next();
          mode = Mode::Line;
        }
        '/' if chars.peek() == Some(&'*') => {
          chars.next();
          out.push(' ');
          mode = Mode::Block(line);
        }
        '"' => {
          out.push(c);
          mode = Mode::Str('"');
        }
        // Digit separators (`1'000`) are not character literals.
        '\'' if !prev.is_ascii_alphanumeric() => {
          out.push(c);
          mode = Mode::Str('\'');
        }
        _ => out.push(c),
      },
      Mode::Line => {
        if c == '\n' {
          out.push('\n');
          mode = Mode::Code;
        }
      }
      Mode::Block(_) => {
        if c == '\n' {
          out.push('\n');
        } else if c == '*' && chars.peek() == Some(&'/') {
          chars.next();
          mode = Mode::Code;
        }
      }
      Mode::Str(quote) => {
        out.push(c);
        if c == '\\' {
          if let Some(escaped) = chars.next() {
            if escaped == '\n' {
              line += 1;
            }
            out.push(escaped);
          }
        } else if c == quote || c == '\n' {
          mode = Mode::Code;
        }
      }
    }
    prev = c;
  }

  let unterminated = match mode {
    Mode::Block(start) => Some(start),
    _ => None,
  };
  (out, unterminated)
}

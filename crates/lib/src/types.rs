//! Identifiers shared by every phase of an invocation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a unit: its manifest-relative path with `/` separators.
///
/// Identities are stable across machines, so they are safe to fold into cache keys
/// and to persist in invocation records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub String);

impl UnitId {
  pub fn new(id: impl Into<String>) -> Self {
    UnitId(id.into().replace('\\', "/"))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Directory part of the identity (empty for units at the project root).
  pub fn parent(&self) -> &str {
    match self.0.rfind('/') {
      Some(pos) => &self.0[..pos],
      None => "",
    }
  }

  /// File name without its extension.
  pub fn stem(&self) -> &str {
    let name = match self.0.rfind('/') {
      Some(pos) => &self.0[pos + 1..],
      None => &self.0,
    };
    match name.rfind('.') {
      Some(0) | None => name,
      Some(pos) => &name[..pos],
    }
  }
}

impl fmt::Display for UnitId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<&str> for UnitId {
  fn from(value: &str) -> Self {
    UnitId::new(value)
  }
}

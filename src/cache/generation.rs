//! Release-tagged cache generations and the store names derived from them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Immutable identifier of one release's caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheGeneration(String);

impl CacheGeneration {
  pub fn new(release: impl Into<String>) -> Self {
    Self(release.into())
  }

  pub fn release(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CacheGeneration {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Which of the two per-release stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
  /// Pre-populated application shell
  Core,
  /// Opportunistically cached responses
  Dynamic,
}

impl StoreKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      StoreKind::Core => "core",
      StoreKind::Dynamic => "dynamic",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "core" => Some(StoreKind::Core),
      "dynamic" => Some(StoreKind::Dynamic),
      _ => None,
    }
  }
}

/// A named store: kind plus the generation that owns it.
///
/// Stores are compared structurally; [`StoreName::qualified`] is only the
/// storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreName {
  pub kind: StoreKind,
  pub generation: CacheGeneration,
}

impl StoreName {
  pub fn core(generation: &CacheGeneration) -> Self {
    Self {
      kind: StoreKind::Core,
      generation: generation.clone(),
    }
  }

  pub fn dynamic(generation: &CacheGeneration) -> Self {
    Self {
      kind: StoreKind::Dynamic,
      generation: generation.clone(),
    }
  }

  /// e.g. `offgrid-core-v3`
  pub fn qualified(&self) -> String {
    format!("offgrid-{}-{}", self.kind.as_str(), self.generation)
  }

  pub fn belongs_to(&self, generation: &CacheGeneration) -> bool {
    &self.generation == generation
  }
}

impl fmt::Display for StoreName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.qualified())
  }
}

//! Per-request choice of caching strategy.

use std::collections::HashSet;
use std::fmt;

use url::Url;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Application shell: serve from the core store, network only on a miss
  CacheFirst,
  /// API and auth traffic: network, cache only when offline
  NetworkFirst,
  /// Everything else: cached copy now, refreshed in the background
  StaleWhileRevalidate,
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Strategy::CacheFirst => write!(f, "cache-first"),
      Strategy::NetworkFirst => write!(f, "network-first"),
      Strategy::StaleWhileRevalidate => write!(f, "stale-while-revalidate"),
    }
  }
}

/// Maps a URL to its [`Strategy`]. Pure; holds only the route tables.
#[derive(Debug, Clone)]
pub struct StrategySelector {
  core_assets: HashSet<String>,
  api_prefix: String,
  auth_patterns: Vec<String>,
}

impl StrategySelector {
  pub fn new(core_assets: &[String], api_prefix: &str, auth_patterns: &[String]) -> Self {
    Self {
      core_assets: core_assets.iter().cloned().collect(),
      api_prefix: api_prefix.to_string(),
      auth_patterns: auth_patterns.iter().map(|p| p.to_lowercase()).collect(),
    }
  }

  pub fn from_config(config: &Config) -> Self {
    Self::new(&config.core_assets, &config.api_prefix, &config.auth_patterns)
  }

  /// The enumerated shell wins over the API/auth rules.
  pub fn select(&self, url: &Url) -> Strategy {
    let path = url.path();

    if self.core_assets.contains(path) {
      return Strategy::CacheFirst;
    }

    let lowered = path.to_lowercase();
    if path.starts_with(&self.api_prefix) || self.auth_patterns.iter().any(|p| lowered.contains(p)) {
      return Strategy::NetworkFirst;
    }

    Strategy::StaleWhileRevalidate
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn selector() -> StrategySelector {
    let config = Config::default();
    StrategySelector::from_config(&config)
  }

  fn url(path: &str) -> Url {
    Url::parse(&format!("http://app.test{}", path)).unwrap()
  }

  #[test]
  fn test_core_assets_are_cache_first() {
    let s = selector();
    for path in ["/", "/index.html", "/calculator", "/styles.css", "/app.js", "/manifest.json"] {
      assert_eq!(s.select(&url(path)), Strategy::CacheFirst, "{}", path);
    }
  }

  #[test]
  fn test_core_match_ignores_query() {
    assert_eq!(selector().select(&url("/app.js?v=3")), Strategy::CacheFirst);
  }

  #[test]
  fn test_api_and_auth_are_network_first() {
    let s = selector();
    assert_eq!(s.select(&url("/api/properties")), Strategy::NetworkFirst);
    assert_eq!(s.select(&url("/api/calculations/save")), Strategy::NetworkFirst);
    assert_eq!(s.select(&url("/Login")), Strategy::NetworkFirst);
    assert_eq!(s.select(&url("/account/session/refresh")), Strategy::NetworkFirst);
  }

  #[test]
  fn test_everything_else_is_stale_while_revalidate() {
    let s = selector();
    assert_eq!(s.select(&url("/img/house.jpg")), Strategy::StaleWhileRevalidate);
    assert_eq!(s.select(&url("/fonts/inter.woff2")), Strategy::StaleWhileRevalidate);
    assert_eq!(s.select(&url("/js/charts.js")), Strategy::StaleWhileRevalidate);
    // Prefix without the trailing slash is not the API.
    assert_eq!(s.select(&url("/apiary.png")), Strategy::StaleWhileRevalidate);
  }
}

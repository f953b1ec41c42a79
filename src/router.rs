//! Request classification.
//!
//! `classify` decides which strategy serves a request. It has no side
//! effects; checks run in a fixed order and the first match wins.

use std::fmt;

use clap::ValueEnum;
use reqwest::Method;
use serde::Deserialize;

/// What the application intends to do with a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Document,
  Image,
  Style,
  Script,
  Font,
  /// fetch()/XHR and anything else without a hint
  #[default]
  Empty,
}

/// Strategy selected for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not intercepted; goes straight to the network
  Passthrough,
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

impl fmt::Display for Route {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Route::Passthrough => "passthrough",
      Route::CacheFirst => "cache-first",
      Route::NetworkFirst => "network-first",
      Route::StaleWhileRevalidate => "stale-while-revalidate",
    };
    f.write_str(s)
  }
}

/// Routing rules taken from configuration.
#[derive(Debug, Clone)]
pub struct RouteRules {
  /// Paths under this prefix are API calls
  pub api_prefix: String,
  /// Substrings marking dev-server live-update traffic
  pub live_update_patterns: Vec<String>,
}

impl Default for RouteRules {
  fn default() -> Self {
    Self {
      api_prefix: "/api/".to_string(),
      live_update_patterns: ["hot-update", "/__vite", "/@vite", "sockjs-node"]
        .into_iter()
        .map(String::from)
        .collect(),
    }
  }
}

pub fn classify(rules: &RouteRules, method: &Method, path: &str, destination: Destination) -> Route {
  if *method != Method::GET {
    return Route::Passthrough;
  }

  if rules
    .live_update_patterns
    .iter()
    .any(|pattern| path.contains(pattern.as_str()))
  {
    return Route::Passthrough;
  }

  if path.starts_with(&rules.api_prefix) {
    return Route::NetworkFirst;
  }

  match destination {
    Destination::Image => Route::StaleWhileRevalidate,
    Destination::Style | Destination::Script | Destination::Font => Route::CacheFirst,
    Destination::Document | Destination::Empty => Route::NetworkFirst,
  }
}

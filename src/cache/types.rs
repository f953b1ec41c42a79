//! Core types for the caching system.

use std::fmt;

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Cache lookup key: method plus normalized URL.
///
/// Only plain retrievals are cacheable, so the method is always GET. The
/// fragment is dropped; scheme and host are already lowercased by `Url`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
  method: Method,
  url: Url,
}

impl RequestIdentity {
  /// Build an identity for a request, or `None` when the method is not cacheable.
  pub fn from_request(method: &Method, url: &Url) -> Option<Self> {
    if *method != Method::GET {
      return None;
    }
    Some(Self::get(url))
  }

  /// Identity of a GET for `url`.
  pub fn get(url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: Method::GET,
      url,
    }
  }

  /// Stable, fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Immutable copy of a response as it was received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  /// When the response was captured
  pub cached_at: DateTime<Utc>,
}

impl ResponseSnapshot {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers,
      body: body.into(),
      cached_at: Utc::now(),
    }
  }

  /// Only 2xx responses are ever written to a store.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup.
  #[allow(dead_code)]
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  /// Create a new cache result from a store hit.
  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from a store without waiting on the network
  Cache,
  /// Network failed, serving the last stored copy
  Offline,
}

impl fmt::Display for CacheSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      CacheSource::Network => "network",
      CacheSource::Cache => "cache",
      CacheSource::Offline => "offline",
    };
    f.write_str(s)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_identity_drops_fragment() {
    let a = RequestIdentity::get(&url("https://example.com/app.css#top"));
    let b = RequestIdentity::get(&url("https://example.com/app.css"));
    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_identity_normalizes_host_case() {
    let a = RequestIdentity::get(&url("https://EXAMPLE.com/api/patients"));
    assert_eq!(a.to_string(), "GET https://example.com/api/patients");
  }

  #[test]
  fn test_identity_keeps_query() {
    let a = RequestIdentity::get(&url("https://example.com/api/patients?page=1"));
    let b = RequestIdentity::get(&url("https://example.com/api/patients?page=2"));
    assert_ne!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_identity_rejects_mutations() {
    let u = url("https://example.com/api/patients");
    assert!(RequestIdentity::from_request(&Method::POST, &u).is_none());
    assert!(RequestIdentity::from_request(&Method::GET, &u).is_some());
  }

  #[test]
  fn test_cache_hash_is_hex_sha256() {
    let hash = RequestIdentity::get(&url("https://example.com/")).cache_hash();
    assert_eq!(hash.len(), 64);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
  }

  #[test]
  fn test_snapshot_success_range() {
    assert!(ResponseSnapshot::new(200, vec![], "").is_success());
    assert!(ResponseSnapshot::new(204, vec![], "").is_success());
    assert!(!ResponseSnapshot::new(301, vec![], "").is_success());
    assert!(!ResponseSnapshot::new(404, vec![], "").is_success());
    assert!(!ResponseSnapshot::new(503, vec![], "").is_success());
  }

  #[test]
  fn test_snapshot_header_lookup() {
    let snap = ResponseSnapshot::new(
      200,
      vec![("Content-Type".to_string(), "text/css".to_string())],
      "body",
    );
    assert_eq!(snap.header("content-type"), Some("text/css"));
    assert_eq!(snap.header("etag"), None);
  }
}

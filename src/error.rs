use thiserror::Error;

/// Failures the interception layer reports to its callers.
///
/// Everything else (SQLite plumbing, config parsing) travels as an
/// `eyre::Report` with context attached at the call site.
#[derive(Error, Debug)]
pub enum RelayError {
  #[error("Origin unreachable for {url}: {reason}")]
  Unreachable { url: String, reason: String },

  #[error("Manifest asset {path} could not be fetched: {reason}")]
  ManifestFetch { path: String, reason: String },

  #[error("Failed to open cache store {name}: {reason}")]
  StoreOpen { name: String, reason: String },

  #[error("Generation {0} has not been installed")]
  NotInstalled(String),

  #[error("Invalid request URL {0}")]
  InvalidUrl(String),
}

impl RelayError {
  pub fn unreachable(url: impl Into<String>, reason: impl ToString) -> Self {
    RelayError::Unreachable {
      url: url.into(),
      reason: reason.to_string(),
    }
  }

  /// True when the error came from the network rather than local state.
  pub fn is_unreachable(&self) -> bool {
    matches!(self, RelayError::Unreachable { .. })
  }
}

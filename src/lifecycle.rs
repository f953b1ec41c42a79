//! Install/activate state machine for store generations.
//!
//! A generation moves `New -> Installed -> Active`, and each trigger fires
//! once. Install pre-populates the static store from the shell manifest;
//! activate prunes every store that does not belong to the current
//! generation and sends every other generation back to `New`.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheStorage, GenerationStorage, RequestIdentity, ResponseSnapshot};
use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
  New,
  Installed,
  Active,
}

impl GenerationState {
  pub fn as_str(&self) -> &'static str {
    match self {
      GenerationState::New => "new",
      GenerationState::Installed => "installed",
      GenerationState::Active => "active",
    }
  }
}

impl FromStr for GenerationState {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "new" => Ok(GenerationState::New),
      "installed" => Ok(GenerationState::Installed),
      "active" => Ok(GenerationState::Active),
      other => Err(eyre!("Unknown generation state '{}'", other)),
    }
  }
}

impl fmt::Display for GenerationState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The pair of stores owned by one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNames {
  /// Pre-populated shell assets
  pub static_name: String,
  /// Responses cached at runtime
  pub dynamic_name: String,
}

impl StoreNames {
  pub fn for_generation(generation: &str) -> Self {
    Self {
      static_name: format!("static-{}", generation),
      dynamic_name: format!("dynamic-{}", generation),
    }
  }

  pub fn contains(&self, name: &str) -> bool {
    name == self.static_name || name == self.dynamic_name
  }
}

/// Outcome of an install trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
  /// Manifest fetched and stored; this many assets were written
  Installed(usize),
  /// The generation was already installed or active
  AlreadyInstalled,
}

pub struct LifecycleManager<S> {
  storage: Arc<S>,
  generation: String,
  names: StoreNames,
  origin: Url,
  manifest: Vec<String>,
}

impl<S: CacheStorage + GenerationStorage> LifecycleManager<S> {
  pub fn new(
    storage: Arc<S>,
    generation: impl Into<String>,
    origin: Url,
    manifest: Vec<String>,
  ) -> Self {
    let generation = generation.into();
    Self {
      names: StoreNames::for_generation(&generation),
      storage,
      generation,
      origin,
      manifest,
    }
  }

  pub fn generation(&self) -> &str {
    &self.generation
  }

  pub fn store_names(&self) -> &StoreNames {
    &self.names
  }

  pub fn state(&self) -> Result<GenerationState> {
    Ok(
      self
        .storage
        .generation_state(&self.generation)?
        .unwrap_or(GenerationState::New),
    )
  }

  /// Whether this generation has claimed traffic.
  pub fn is_active(&self) -> Result<bool> {
    Ok(self.state()? == GenerationState::Active)
  }

  /// Pre-populate the static store with every manifest asset.
  ///
  /// All assets are fetched before anything is written. A single failed or
  /// non-2xx fetch aborts the install and leaves the generation `New`.
  pub async fn install<F, Fut>(&self, fetch: F) -> Result<InstallOutcome>
  where
    F: Fn(Url) -> Fut,
    Fut: Future<Output = Result<ResponseSnapshot>>,
  {
    let state = self.state()?;
    if state != GenerationState::New {
      info!(generation = %self.generation, %state, "Install skipped, generation already installed");
      return Ok(InstallOutcome::AlreadyInstalled);
    }

    let urls = self
      .manifest
      .iter()
      .map(|path| {
        self
          .origin
          .join(path)
          .map_err(|_| RelayError::InvalidUrl(path.clone()))
      })
      .collect::<std::result::Result<Vec<_>, _>>()?;

    let responses = join_all(urls.iter().cloned().map(&fetch)).await;

    let mut assets = Vec::with_capacity(urls.len());
    for ((path, url), response) in self.manifest.iter().zip(urls).zip(responses) {
      let snapshot = match response {
        Ok(snapshot) if snapshot.is_success() => snapshot,
        Ok(snapshot) => {
          return Err(
            RelayError::ManifestFetch {
              path: path.clone(),
              reason: format!("status {}", snapshot.status),
            }
            .into(),
          )
        }
        Err(e) => {
          return Err(
            RelayError::ManifestFetch {
              path: path.clone(),
              reason: e.to_string(),
            }
            .into(),
          )
        }
      };
      assets.push((RequestIdentity::get(&url), snapshot));
    }

    let store = self.storage.open(&self.names.static_name)?;
    for (identity, snapshot) in &assets {
      if let Err(e) = self.storage.put(&store, identity, snapshot) {
        // Roll back so a retry starts from an empty static store
        if let Err(cleanup) = self.storage.delete(&self.names.static_name) {
          warn!(store = %self.names.static_name, error = %cleanup, "Failed to roll back static store");
        }
        return Err(e);
      }
    }

    self
      .storage
      .set_generation_state(&self.generation, GenerationState::Installed)?;

    info!(
      generation = %self.generation,
      assets = assets.len(),
      "Generation installed, ready to supersede previous generations"
    );
    Ok(InstallOutcome::Installed(assets.len()))
  }

  /// Delete every store not owned by this generation and claim traffic.
  ///
  /// Every other generation goes back to `New`: its stores are gone, so it
  /// stops serving and has to be installed again before it can return.
  /// Returns the names of the stores that were deleted.
  pub fn activate(&self) -> Result<Vec<String>> {
    match self.state()? {
      GenerationState::New => return Err(RelayError::NotInstalled(self.generation.clone()).into()),
      GenerationState::Active => {
        info!(generation = %self.generation, "Activate skipped, generation already active");
        return Ok(Vec::new());
      }
      GenerationState::Installed => {}
    }

    let mut deleted = Vec::new();
    for name in self.storage.list_store_names()? {
      if self.names.contains(&name) {
        continue;
      }
      if self.storage.delete(&name)? {
        info!(store = %name, "Deleted superseded store");
        deleted.push(name);
      }
    }

    self.storage.open(&self.names.static_name)?;
    self.storage.open(&self.names.dynamic_name)?;

    self.storage.activate_generation(&self.generation)?;

    info!(generation = %self.generation, pruned = deleted.len(), "Generation active");
    Ok(deleted)
  }
}

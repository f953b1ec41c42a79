//! Cache layer that orchestrates caching strategies with network fetching.

use std::future::Future;
use std::sync::{Arc, Mutex};

use color_eyre::{eyre::eyre, Result};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{CacheResult, CacheStorage, RequestIdentity, ResponseSnapshot, StoreHandle};
use crate::lifecycle::StoreNames;

/// Cache layer that manages caching strategies and network fetching.
///
/// Lookups search the generation's static store, then its dynamic store.
/// Responses fetched at runtime are written to the dynamic store, and only
/// when they are 2xx.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  names: StoreNames,
  /// Background revalidations started by stale-while-revalidate
  revalidations: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  /// Create a new cache layer over the stores of one generation.
  pub fn new(storage: Arc<S>, names: StoreNames) -> Self {
    Self {
      storage,
      names,
      revalidations: Arc::new(Mutex::new(Vec::new())),
    }
  }

  /// Look up an identity across the generation's stores.
  ///
  /// Failing to open a store is fatal for the request. A failed read is
  /// logged and treated as a miss.
  fn lookup(&self, identity: &RequestIdentity) -> Result<Option<ResponseSnapshot>> {
    for name in [&self.names.static_name, &self.names.dynamic_name] {
      let store = self.storage.open(name)?;
      match self.storage.get(&store, identity) {
        Ok(Some(snapshot)) => {
          debug!(store = %name, %identity, "Cache hit");
          return Ok(Some(snapshot));
        }
        Ok(None) => {}
        Err(e) => warn!(store = %name, %identity, error = %e, "Cache read failed, treating as miss"),
      }
    }
    Ok(None)
  }

  /// Cache-first strategy.
  ///
  /// 1. Return a stored entry without touching the network
  /// 2. Otherwise fetch; store the response if it is 2xx
  /// 3. Network failures propagate, there is no fallback
  pub async fn cache_first<F, Fut>(
    &self,
    identity: &RequestIdentity,
    fetcher: F,
  ) -> Result<CacheResult<ResponseSnapshot>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ResponseSnapshot>>,
  {
    if let Some(cached) = self.lookup(identity)? {
      return Ok(CacheResult::from_cache(cached));
    }

    let dynamic = self.storage.open(&self.names.dynamic_name)?;
    let response = fetcher().await?;
    store_response(self.storage.as_ref(), &dynamic, identity, &response);
    Ok(CacheResult::from_network(response))
  }

  /// Network-first strategy.
  ///
  /// 1. Fetch; store the response if it is 2xx and return it
  /// 2. On network failure, return the stored entry (offline mode)
  /// 3. With nothing stored, the original failure propagates
  pub async fn network_first<F, Fut>(
    &self,
    identity: &RequestIdentity,
    fetcher: F,
  ) -> Result<CacheResult<ResponseSnapshot>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ResponseSnapshot>>,
  {
    let dynamic = self.storage.open(&self.names.dynamic_name)?;

    match fetcher().await {
      Ok(response) => {
        store_response(self.storage.as_ref(), &dynamic, identity, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(network_err) => match self.lookup(identity) {
        Ok(Some(cached)) => {
          debug!(%identity, error = %network_err, "Network failed, serving stored copy");
          Ok(CacheResult::offline(cached))
        }
        Ok(None) => Err(network_err),
        Err(store_err) => {
          warn!(%identity, error = %store_err, "Cache unavailable for offline fallback");
          Err(network_err)
        }
      },
    }
  }

  /// Stale-while-revalidate strategy.
  ///
  /// With a stored entry, returns it immediately and refreshes the store in
  /// a background task. Without one, waits for the network.
  pub async fn stale_while_revalidate<F, Fut>(
    &self,
    identity: &RequestIdentity,
    fetcher: F,
  ) -> Result<CacheResult<ResponseSnapshot>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ResponseSnapshot>> + Send + 'static,
  {
    let cached = self.lookup(identity)?;
    let dynamic = self.storage.open(&self.names.dynamic_name)?;

    let Some(cached) = cached else {
      let response = fetcher().await?;
      store_response(self.storage.as_ref(), &dynamic, identity, &response);
      return Ok(CacheResult::from_network(response));
    };

    let storage = Arc::clone(&self.storage);
    let background_identity = identity.clone();
    let fetch = fetcher();
    let handle = tokio::spawn(async move {
      match fetch.await {
        Ok(response) => {
          store_response(storage.as_ref(), &dynamic, &background_identity, &response)
        }
        Err(e) => debug!(identity = %background_identity, error = %e, "Revalidation failed"),
      }
    });
    self.track(handle);

    Ok(CacheResult::from_cache(cached))
  }

  fn track(&self, handle: JoinHandle<()>) {
    match self.revalidations.lock() {
      Ok(mut handles) => {
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
      }
      Err(e) => warn!(error = %e, "Revalidation tracker poisoned"),
    }
  }

  /// Wait for background revalidations started so far.
  ///
  /// Callers of the strategies never need this; it exists so a short-lived
  /// process can let its pending store updates land before exiting.
  pub async fn settle(&self) -> Result<()> {
    let handles: Vec<JoinHandle<()>> = {
      let mut guard = self
        .revalidations
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      guard.drain(..).collect()
    };

    for handle in handles {
      if let Err(e) = handle.await {
        warn!(error = %e, "Revalidation task aborted");
      }
    }
    Ok(())
  }
}

/// Write a 2xx response to the store. Failures are logged, never returned.
fn store_response<S: CacheStorage + ?Sized>(
  storage: &S,
  store: &StoreHandle,
  identity: &RequestIdentity,
  response: &ResponseSnapshot,
) {
  if !response.is_success() {
    debug!(%identity, status = response.status, "Not caching unsuccessful response");
    return;
  }
  if let Err(e) = storage.put(store, identity, response) {
    warn!(store = %store.name(), %identity, error = %e, "Cache write failed");
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      names: self.names.clone(),
      revalidations: Arc::clone(&self.revalidations),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::error::RelayError;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;
  use url::Url;

  fn setup() -> (Arc<SqliteStorage>, CacheLayer<SqliteStorage>) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let layer = CacheLayer::new(Arc::clone(&storage), StoreNames::for_generation("v1"));
    (storage, layer)
  }

  fn identity(path: &str) -> RequestIdentity {
    RequestIdentity::get(&Url::parse("https://clinic.example").unwrap().join(path).unwrap())
  }

  fn stored(storage: &SqliteStorage, store: &str, path: &str) -> Option<ResponseSnapshot> {
    let handle = storage.open(store).unwrap();
    storage.get(&handle, &identity(path)).unwrap()
  }

  fn seed(storage: &SqliteStorage, store: &str, path: &str, body: &str) -> ResponseSnapshot {
    let snapshot = ResponseSnapshot::new(200, vec![], body);
    let handle = storage.open(store).unwrap();
    storage.put(&handle, &identity(path), &snapshot).unwrap();
    snapshot
  }

  /// Fetcher that counts its calls and answers with a fixed response.
  fn counting(
    calls: &Arc<AtomicUsize>,
    status: u16,
    body: &'static str,
  ) -> impl FnOnce() -> std::future::Ready<Result<ResponseSnapshot>> {
    let calls = Arc::clone(calls);
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      std::future::ready(Ok(ResponseSnapshot::new(status, vec![], body)))
    }
  }

  fn offline(
    calls: &Arc<AtomicUsize>,
  ) -> impl FnOnce() -> std::future::Ready<Result<ResponseSnapshot>> {
    let calls = Arc::clone(calls);
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      std::future::ready(Err(
        RelayError::unreachable("https://clinic.example", "offline").into(),
      ))
    }
  }

  async fn wait_for_body(storage: &SqliteStorage, store: &str, path: &str, body: &str) -> bool {
    for _ in 0..100 {
      if stored(storage, store, path).is_some_and(|s| s.body_text() == body) {
        return true;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
  }

  #[tokio::test]
  async fn test_cache_first_fetches_once() {
    let (storage, layer) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let id = identity("/static/app.css");

    let first = layer.cache_first(&id, counting(&calls, 200, "body{}")).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    for _ in 0..3 {
      let again = layer.cache_first(&id, counting(&calls, 200, "changed")).await.unwrap();
      assert_eq!(again.source, CacheSource::Cache);
      assert_eq!(again.data, first.data);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(stored(&storage, "dynamic-v1", "/static/app.css").is_some());
  }

  #[tokio::test]
  async fn test_cache_first_serves_static_store() {
    let (storage, layer) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let seeded = seed(&storage, "static-v1", "/app.js", "shell");

    let result = layer
      .cache_first(&identity("/app.js"), counting(&calls, 200, "net"))
      .await
      .unwrap();

    assert_eq!(result.data, seeded);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_errors() {
    let (storage, layer) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let id = identity("/missing.css");

    let result = layer.cache_first(&id, counting(&calls, 404, "nope")).await.unwrap();
    assert_eq!(result.data.status, 404);
    assert!(stored(&storage, "dynamic-v1", "/missing.css").is_none());

    layer.cache_first(&id, counting(&calls, 404, "nope")).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_redirects() {
    let (storage, layer) = setup();
    let calls = Arc::new(AtomicUsize::new(0));

    layer
      .cache_first(&identity("/old.css"), counting(&calls, 301, ""))
      .await
      .unwrap();
    assert!(stored(&storage, "dynamic-v1", "/old.css").is_none());
  }

  #[tokio::test]
  async fn test_cache_first_propagates_network_failure() {
    let (_storage, layer) = setup();
    let calls = Arc::new(AtomicUsize::new(0));

    let err = layer
      .cache_first(&identity("/app.css"), offline(&calls))
      .await
      .unwrap_err();
    assert!(err.downcast_ref::<RelayError>().is_some_and(|e| e.is_unreachable()));
  }

  #[tokio::test]
  async fn test_network_first_prefers_network_and_stores() {
    let (storage, layer) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    seed(&storage, "dynamic-v1", "/api/patients", "old");

    let result = layer
      .network_first(&identity("/api/patients"), counting(&calls, 200, "new"))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body_text(), "new");
    assert_eq!(
      stored(&storage, "dynamic-v1", "/api/patients").unwrap().body_text(),
      "new"
    );
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_stored_entry() {
    let (storage, layer) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let seeded = seed(&storage, "dynamic-v1", "/api/patients", "[1,2]");

    let result = layer
      .network_first(&identity("/api/patients"), offline(&calls))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data, seeded);
  }

  #[tokio::test]
  async fn test_network_first_without_entry_surfaces_failure() {
    let (_storage, layer) = setup();
    let calls = Arc::new(AtomicUsize::new(0));

    let err = layer
      .network_first(&identity("/api/patients"), offline(&calls))
      .await
      .unwrap_err();
    assert!(err.downcast_ref::<RelayError>().is_some_and(|e| e.is_unreachable()));
  }

  #[tokio::test]
  async fn test_network_first_returns_error_status_without_fallback() {
    let (storage, layer) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    seed(&storage, "dynamic-v1", "/api/alerts", "cached");

    let result = layer
      .network_first(&identity("/api/alerts"), counting(&calls, 500, "boom"))
      .await
      .unwrap();

    assert_eq!(result.data.status, 500);
    assert_eq!(
      stored(&storage, "dynamic-v1", "/api/alerts").unwrap().body_text(),
      "cached"
    );
  }

  #[tokio::test]
  async fn test_swr_returns_cached_without_waiting() {
    let (storage, layer) = setup();
    let seeded = seed(&storage, "dynamic-v1", "/img/logo.png", "old");
    let (release, gate) = tokio::sync::oneshot::channel::<()>();

    let result = layer
      .stale_while_revalidate(&identity("/img/logo.png"), move || async move {
        // Held until the caller has its answer
        let _ = gate.await;
        Ok(ResponseSnapshot::new(200, vec![], "new"))
      })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data, seeded);

    release.send(()).unwrap();
    assert!(wait_for_body(&storage, "dynamic-v1", "/img/logo.png", "new").await);
  }

  #[tokio::test]
  async fn test_swr_settle_waits_for_revalidation() {
    let (storage, layer) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    seed(&storage, "dynamic-v1", "/img/a.png", "old");

    layer
      .stale_while_revalidate(&identity("/img/a.png"), counting(&calls, 200, "fresh"))
      .await
      .unwrap();
    layer.settle().await.unwrap();

    assert_eq!(
      stored(&storage, "dynamic-v1", "/img/a.png").unwrap().body_text(),
      "fresh"
    );
  }

  #[tokio::test]
  async fn test_swr_failed_revalidation_keeps_entry() {
    let (storage, layer) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    seed(&storage, "dynamic-v1", "/img/a.png", "old");

    let result = layer
      .stale_while_revalidate(&identity("/img/a.png"), offline(&calls))
      .await
      .unwrap();
    layer.settle().await.unwrap();

    assert_eq!(result.data.body_text(), "old");
    assert_eq!(
      stored(&storage, "dynamic-v1", "/img/a.png").unwrap().body_text(),
      "old"
    );
  }

  #[tokio::test]
  async fn test_swr_miss_waits_for_network() {
    let (storage, layer) = setup();
    let calls = Arc::new(AtomicUsize::new(0));

    let result = layer
      .stale_while_revalidate(&identity("/img/b.png"), counting(&calls, 200, "img"))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body_text(), "img");
    assert!(stored(&storage, "dynamic-v1", "/img/b.png").is_some());
  }

  #[tokio::test]
  async fn test_swr_miss_offline_propagates() {
    let (_storage, layer) = setup();
    let calls = Arc::new(AtomicUsize::new(0));

    let result = layer
      .stale_while_revalidate(&identity("/img/c.png"), offline(&calls))
      .await;
    assert!(result.is_err());
  }
}

//! Request interception: routes every outgoing request through the cache.

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use tracing::{debug, info};
use url::Url;

use crate::cache::{
  CacheLayer, CacheResult, CacheStorage, GenerationStorage, RequestIdentity, ResponseSnapshot,
  TaskStorage,
};
use crate::config::Config;
use crate::error::RelayError;
use crate::lifecycle::{InstallOutcome, LifecycleManager};
use crate::origin::OriginClient;
use crate::replay::{Mutation, ReplayQueue, ReplayReport};
use crate::router::{classify, Destination, Route, RouteRules};

/// An outgoing application request as seen by the interceptor.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  /// Request headers, forwarded to the origin unchanged
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl InterceptedRequest {
  pub fn new(method: Method, url: Url, destination: Destination) -> Self {
    Self {
      method,
      url,
      destination,
      headers: Vec::new(),
      body: None,
    }
  }

  #[allow(dead_code)]
  pub fn get(url: Url, destination: Destination) -> Self {
    Self::new(Method::GET, url, destination)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }
}

/// Result of submitting a mutation.
#[derive(Debug, Clone)]
pub enum MutationOutcome {
  /// The origin answered (with any status)
  Sent(ResponseSnapshot),
  /// The origin was unreachable; queued under the reconnect tag
  Queued(i64),
}

/// Owns the generation lifecycle, the strategy engine and the replay queue,
/// and is the single entry point for outgoing traffic.
pub struct Interceptor<S: CacheStorage> {
  client: OriginClient,
  rules: RouteRules,
  lifecycle: LifecycleManager<S>,
  cache: CacheLayer<S>,
  replay: ReplayQueue<S>,
  reconnect_tag: String,
}

impl<S> Interceptor<S>
where
  S: CacheStorage + GenerationStorage + TaskStorage + 'static,
{
  pub fn new(config: &Config, storage: Arc<S>) -> Result<Self> {
    let client = OriginClient::new(config)?;
    let lifecycle = LifecycleManager::new(
      Arc::clone(&storage),
      config.generation.clone(),
      client.base().clone(),
      config.manifest.clone(),
    );
    let cache = CacheLayer::new(Arc::clone(&storage), lifecycle.store_names().clone());
    let replay = ReplayQueue::new(storage)?;

    Ok(Self {
      client,
      rules: config.route_rules(),
      lifecycle,
      cache,
      replay,
      reconnect_tag: config.reconnect_tag.clone(),
    })
  }

  pub fn client(&self) -> &OriginClient {
    &self.client
  }

  pub fn lifecycle(&self) -> &LifecycleManager<S> {
    &self.lifecycle
  }

  pub fn replay_queue(&self) -> &ReplayQueue<S> {
    &self.replay
  }

  pub fn reconnect_tag(&self) -> &str {
    &self.reconnect_tag
  }

  /// Install trigger: pre-populate the static store from the origin.
  pub async fn install(&self) -> Result<InstallOutcome> {
    self
      .lifecycle
      .install(|url| {
        let client = self.client.clone();
        async move { client.get(url).await }
      })
      .await
  }

  /// Activate trigger: prune superseded stores and start claiming traffic.
  pub fn activate(&self) -> Result<Vec<String>> {
    self.lifecycle.activate()
  }

  /// Serve a request through the strategy its classification selects.
  ///
  /// Until the generation is active every request goes straight to the
  /// network.
  pub async fn handle(&self, request: InterceptedRequest) -> Result<CacheResult<ResponseSnapshot>> {
    let route = if self.lifecycle.is_active()? {
      classify(
        &self.rules,
        &request.method,
        request.url.path(),
        request.destination,
      )
    } else {
      Route::Passthrough
    };

    debug!(method = %request.method, url = %request.url, %route, "Intercepted request");

    let client = self.client.clone();
    let url = request.url.clone();
    let headers = request.headers.clone();
    let fetcher = move || async move { client.fetch(Method::GET, url, &headers, None).await };

    match route {
      Route::Passthrough => {
        let response = self
          .client
          .fetch(request.method, request.url, &request.headers, request.body)
          .await?;
        Ok(CacheResult::from_network(response))
      }
      Route::CacheFirst => self.cache.cache_first(&identity(&request)?, fetcher).await,
      Route::NetworkFirst => self.cache.network_first(&identity(&request)?, fetcher).await,
      Route::StaleWhileRevalidate => {
        self
          .cache
          .stale_while_revalidate(&identity(&request)?, fetcher)
          .await
      }
    }
  }

  /// Send a mutation, queueing it for replay if the origin is unreachable.
  pub async fn submit_mutation(&self, mutation: Mutation) -> Result<MutationOutcome> {
    let url = self.client.resolve(&mutation.path)?;
    let body = mutation
      .body
      .as_ref()
      .map(serde_json::to_vec)
      .transpose()
      .map_err(|e| eyre!("Failed to serialize mutation body: {}", e))?;

    match self.client.fetch(mutation.method()?, url, &[], body).await {
      Ok(response) => Ok(MutationOutcome::Sent(response)),
      Err(e) if is_unreachable(&e) => {
        let id = self.replay.enqueue(&self.reconnect_tag, mutation)?;
        Ok(MutationOutcome::Queued(id))
      }
      Err(e) => Err(e),
    }
  }

  /// Reconnect signal: replay the queued mutations for `tag`.
  pub async fn on_reconnect(&self, tag: &str) -> Result<ReplayReport> {
    info!(%tag, "Reconnect signal received");
    self
      .replay
      .on_reconnect_signal(tag, |task| {
        debug!(id = task.id, tag = %task.tag, state = task.state.as_str(), "Replaying task");
        let client = self.client.clone();
        async move { client.send_mutation(&task.mutation).await }
      })
      .await
  }

  /// Let background store updates finish.
  pub async fn settle(&self) -> Result<()> {
    self.cache.settle().await
  }
}

fn identity(request: &InterceptedRequest) -> Result<RequestIdentity> {
  RequestIdentity::from_request(&request.method, &request.url)
    .ok_or_else(|| eyre!("{} requests are not cacheable", request.method))
}

fn is_unreachable(err: &color_eyre::Report) -> bool {
  err
    .downcast_ref::<RelayError>()
    .is_some_and(RelayError::is_unreachable)
}

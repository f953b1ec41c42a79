use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use tracing::debug;
use url::Url;

use crate::cache::ResponseSnapshot;
use crate::config::Config;
use crate::error::RelayError;
use crate::replay::Mutation;

/// HTTP client for the origin server
#[derive(Clone)]
pub struct OriginClient {
  client: reqwest::Client,
  base: Url,
}

impl OriginClient {
  pub fn new(config: &Config) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(config.timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base: config.origin_url()?,
    })
  }

  pub fn base(&self) -> &Url {
    &self.base
  }

  /// Resolve a path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path)
      .map_err(|_| RelayError::InvalidUrl(path.to_string()).into())
  }

  /// Perform a request and capture the whole response.
  ///
  /// `headers` are sent as given. A body without an explicit content type
  /// is sent as JSON.
  pub async fn fetch(
    &self,
    method: Method,
    url: Url,
    headers: &[(String, String)],
    body: Option<Vec<u8>>,
  ) -> Result<ResponseSnapshot> {
    let mut request = self.client.request(method.clone(), url.clone());
    for (name, value) in headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| eyre!("Invalid header name '{}': {}", name, e))?;
      let value = HeaderValue::from_str(value)
        .map_err(|e| eyre!("Invalid value for header {}: {}", name, e))?;
      request = request.header(name, value);
    }
    if let Some(body) = body {
      let has_content_type = headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
      if !has_content_type {
        request = request.header(reqwest::header::CONTENT_TYPE, "application/json");
      }
      request = request.body(body);
    }

    let response = request
      .send()
      .await
      .map_err(|e| RelayError::unreachable(url.as_str(), e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| RelayError::unreachable(url.as_str(), e))?;

    debug!(%method, %url, status, bytes = body.len(), "Origin responded");
    Ok(ResponseSnapshot::new(status, headers, body.to_vec()))
  }

  pub async fn get(&self, url: Url) -> Result<ResponseSnapshot> {
    self.fetch(Method::GET, url, &[], None).await
  }

  /// Re-issue a queued mutation. Anything but a 2xx counts as failure.
  pub async fn send_mutation(&self, mutation: &Mutation) -> Result<()> {
    let url = self.resolve(&mutation.path)?;
    let body = mutation
      .body
      .as_ref()
      .map(serde_json::to_vec)
      .transpose()
      .map_err(|e| eyre!("Failed to serialize mutation body: {}", e))?;

    let response = self.fetch(mutation.method()?, url, &[], body).await?;
    if !response.is_success() {
      return Err(eyre!(
        "{} {} rejected with status {}",
        mutation.method,
        mutation.path,
        response.status
      ));
    }
    Ok(())
  }
}

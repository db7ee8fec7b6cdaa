//! Origin seam: the engine's only path to the remote server.
//!
//! Everything that touches the network goes through the [`Origin`] trait so
//! tests can substitute scripted doubles. A transport-level failure (DNS,
//! refused connection, timeout) is the only thing that counts as the origin
//! being unreachable; any HTTP response, success or not, means it answered.

use async_trait::async_trait;
use reqwest::Method;
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::cache::ResourceClass;
use crate::config::OriginConfig;
use crate::error::{EngineError, Result};
use crate::store::PendingMutation;

/// Dedup header attached to every mutation submission. The server treats it
/// as the idempotency key for replayed submissions.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// An outbound read request routed by the cache manager.
#[derive(Debug, Clone)]
pub struct ReadRequest {
  pub method: Method,
  pub url: Url,
  /// Explicit resource class attached where the request originates. When
  /// absent the [`ResourceClass::classify`] heuristics apply.
  pub class: Option<ResourceClass>,
  /// Accept header hint, consulted only by the fallback classifier.
  pub accept: Option<String>,
}

impl ReadRequest {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      class: None,
      accept: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_class(mut self, class: ResourceClass) -> Self {
    self.class = Some(class);
    self
  }

  pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
    self.accept = Some(accept.into());
    self
  }

  pub fn resource_class(&self) -> ResourceClass {
    self
      .class
      .unwrap_or_else(|| ResourceClass::classify(&self.url, self.accept.as_deref()))
  }

  /// Stable key for the request identity within a partition.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A raw response from the origin.
#[derive(Debug, Clone)]
pub struct OriginResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl OriginResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Transport-level failure reaching the origin.
#[derive(Debug, Error)]
#[error("network error: {0}")]
pub struct FetchError(pub String);

/// Failure submitting a queued mutation.
#[derive(Debug, Error)]
pub enum SubmitError {
  /// Transport failure; always worth retrying on a later trigger.
  #[error("network error: {0}")]
  Unreachable(String),

  /// The origin answered with a non-success status.
  #[error("status {status}: {message}")]
  Rejected { status: u16, message: String },

  /// The mutation's action kind does not map to an origin endpoint.
  #[error("action does not map to an endpoint: {0}")]
  InvalidAction(String),
}

impl SubmitError {
  /// Whether a later retry may succeed. Transport failures and transient
  /// statuses (5xx, 408, 429) are retryable; everything else is terminal.
  pub fn is_retryable(&self) -> bool {
    match self {
      SubmitError::Unreachable(_) => true,
      SubmitError::Rejected { status, .. } => {
        matches!(*status, 408 | 429) || (500..600).contains(status)
      }
      SubmitError::InvalidAction(_) => false,
    }
  }
}

/// The engine's view of the remote server.
#[async_trait]
pub trait Origin: Send + Sync + 'static {
  /// Perform one read request.
  async fn fetch(&self, request: &ReadRequest) -> std::result::Result<OriginResponse, FetchError>;

  /// Submit one queued mutation to the endpoint for its action kind,
  /// attaching the client-generated identifier as the dedup key.
  async fn submit(&self, mutation: &PendingMutation) -> std::result::Result<(), SubmitError>;

  /// Cheap reachability probe used to derive connectivity transitions.
  async fn reachable(&self) -> bool;
}

/// HTTP origin over reqwest.
pub struct HttpOrigin {
  client: reqwest::Client,
  base_url: Url,
  mutations_base: Url,
}

impl HttpOrigin {
  pub fn new(config: &OriginConfig) -> Result<Self> {
    let base_url = Url::parse(&config.base_url).map_err(|e| {
      EngineError::Config(format!("invalid origin base url {}: {e}", config.base_url))
    })?;

    // Trailing slash so action kinds join as path segments
    let prefix = config.mutations_path.trim_matches('/');
    let mutations_base = base_url
      .join(&format!("{prefix}/"))
      .map_err(|e| EngineError::Config(format!("invalid mutations path {prefix}: {e}")))?;

    let client = reqwest::Client::builder()
      .user_agent(concat!("medsync/", env!("CARGO_PKG_VERSION")))
      .timeout(std::time::Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| EngineError::Config(format!("failed to build http client: {e}")))?;

    Ok(Self {
      client,
      base_url,
      mutations_base,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  fn mutation_endpoint(&self, action: &str) -> std::result::Result<Url, SubmitError> {
    if action.is_empty() || action.contains('/') {
      return Err(SubmitError::InvalidAction(action.to_string()));
    }
    self
      .mutations_base
      .join(action)
      .map_err(|e| SubmitError::InvalidAction(format!("{action}: {e}")))
  }
}

#[async_trait]
impl Origin for HttpOrigin {
  async fn fetch(&self, request: &ReadRequest) -> std::result::Result<OriginResponse, FetchError> {
    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .send()
      .await
      .map_err(|e| FetchError(e.to_string()))?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError(e.to_string()))?
      .to_vec();

    Ok(OriginResponse {
      status,
      content_type,
      body,
    })
  }

  async fn submit(&self, mutation: &PendingMutation) -> std::result::Result<(), SubmitError> {
    let endpoint = self.mutation_endpoint(&mutation.action)?;
    let response = self
      .client
      .post(endpoint)
      .header(IDEMPOTENCY_KEY_HEADER, mutation.id.to_string())
      .json(&mutation.payload)
      .send()
      .await
      .map_err(|e| SubmitError::Unreachable(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
      return Ok(());
    }

    let message = truncate_body(&response.text().await.unwrap_or_default());
    Err(SubmitError::Rejected {
      status: status.as_u16(),
      message,
    })
  }

  async fn reachable(&self) -> bool {
    // Any HTTP response counts; only transport failures mean offline
    self.client.head(self.base_url.clone()).send().await.is_ok()
  }
}

const MAX_ERROR_BODY: usize = 500;

/// Trim server error bodies before they land in logs and queue records.
fn truncate_body(body: &str) -> String {
  if body.len() <= MAX_ERROR_BODY {
    return body.to_string();
  }
  let cut: String = body.chars().take(MAX_ERROR_BODY).collect();
  format!("{cut}... ({} bytes total)", body.len())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_key_is_stable_and_distinct() {
    let a = ReadRequest::get(Url::parse("https://app/api/meds").unwrap());
    let b = ReadRequest::get(Url::parse("https://app/api/meds").unwrap());
    let c = ReadRequest::get(Url::parse("https://app/api/doses").unwrap());
    let d = ReadRequest::new(Method::POST, Url::parse("https://app/api/meds").unwrap());

    assert_eq!(a.cache_key(), b.cache_key());
    assert_ne!(a.cache_key(), c.cache_key());
    assert_ne!(a.cache_key(), d.cache_key());
    assert_eq!(a.cache_key().len(), 64);
  }

  #[test]
  fn test_explicit_class_wins_over_heuristics() {
    let request = ReadRequest::get(Url::parse("https://app/img/pill.png").unwrap())
      .with_class(ResourceClass::Api);
    assert_eq!(request.resource_class(), ResourceClass::Api);

    let untagged = ReadRequest::get(Url::parse("https://app/img/pill.png").unwrap());
    assert_eq!(untagged.resource_class(), ResourceClass::Image);
  }

  #[test]
  fn test_submit_error_classification() {
    assert!(SubmitError::Unreachable("timeout".into()).is_retryable());
    for status in [500, 502, 503, 408, 429] {
      let err = SubmitError::Rejected {
        status,
        message: String::new(),
      };
      assert!(err.is_retryable(), "status {status} should be retryable");
    }
    for status in [400, 401, 403, 404, 409, 422] {
      let err = SubmitError::Rejected {
        status,
        message: String::new(),
      };
      assert!(!err.is_retryable(), "status {status} should be terminal");
    }
  }

  #[test]
  fn test_mutation_endpoint_joins_action() {
    let origin = HttpOrigin::new(&crate::config::OriginConfig {
      base_url: "https://app.example.com".to_string(),
      mutations_path: "api/sync".to_string(),
      timeout_secs: 5,
    })
    .unwrap();

    let endpoint = origin.mutation_endpoint("dose-logged").unwrap();
    assert_eq!(endpoint.as_str(), "https://app.example.com/api/sync/dose-logged");

    assert!(origin.mutation_endpoint("").is_err());
    assert!(origin.mutation_endpoint("a/b").is_err());
  }

  #[test]
  fn test_truncate_body_keeps_short_bodies() {
    assert_eq!(truncate_body("oops"), "oops");
    let long = "x".repeat(600);
    let cut = truncate_body(&long);
    assert!(cut.starts_with(&"x".repeat(500)));
    assert!(cut.contains("600 bytes total"));
  }
}

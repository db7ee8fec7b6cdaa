//! Cache manager that routes read requests through per-class strategies.
//!
//! Three strategies, selected by resource class:
//! - network-first for `api`
//! - cache-first for `image` and `static`
//! - stale-while-revalidate for `dynamic` (everything else)
//!
//! Failure below means a transport-level error; any HTTP response is handed
//! back to the caller, but only success responses are written through. The
//! write-through always completes before the response is returned, so a
//! caller that immediately re-reads observes its own fetch.
//!
//! Untagged reads of configured shell URLs resolve as static, so they land
//! on the partition the install-time precache wrote to.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::cache::class::{http_partition_name, CachePolicy, ResourceClass};
use crate::error::{EngineError, Result};
use crate::net::{Origin, OriginResponse, ReadRequest};
use crate::store::{CachedEntry, Store};

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
  /// Live from the origin
  Network,
  /// From cache, within its partition's max-age
  CacheFresh,
  /// From cache, past its partition's max-age
  CacheStale,
}

/// Response handed back to the application.
#[derive(Debug, Clone)]
pub struct ServedResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
  pub source: ServedFrom,
  pub cached_at: Option<DateTime<Utc>>,
}

impl ServedResponse {
  fn from_network(response: OriginResponse) -> Self {
    Self {
      status: response.status,
      content_type: response.content_type,
      body: response.body,
      source: ServedFrom::Network,
      cached_at: None,
    }
  }

  fn from_cache(entry: CachedEntry, fresh: bool) -> Self {
    Self {
      status: entry.status,
      content_type: entry.content_type,
      body: entry.body,
      source: if fresh {
        ServedFrom::CacheFresh
      } else {
        ServedFrom::CacheStale
      },
      cached_at: Some(entry.cached_at),
    }
  }
}

/// Point-in-time view of one registered partition.
#[derive(Debug, Clone)]
pub struct PartitionStatus {
  pub name: String,
  pub entries: usize,
  /// Newest write in the partition; `None` when it holds no entries.
  pub newest: Option<DateTime<Utc>>,
}

/// Cache snapshot for the foreground status surface.
#[derive(Debug, Clone)]
pub struct CacheStatus {
  pub version: String,
  pub partitions: Vec<PartitionStatus>,
}

/// Cache manager bound to a store, an origin and the active cache version.
pub struct CacheManager<O: Origin> {
  store: Arc<Store>,
  origin: Arc<O>,
  policy: CachePolicy,
  version: String,
  shell: Vec<Url>,
}

impl<O: Origin> CacheManager<O> {
  pub fn new(store: Arc<Store>, origin: Arc<O>, policy: CachePolicy, version: impl Into<String>) -> Self {
    Self {
      store,
      origin,
      policy,
      version: version.into(),
      shell: Vec::new(),
    }
  }

  /// Attach the configured shell so untagged reads of those URLs resolve as
  /// static instead of falling through to the heuristics.
  pub fn with_shell(mut self, shell: Vec<Url>) -> Self {
    self.shell = shell;
    self
  }

  /// Partition name for a class under the active version.
  pub fn partition_name(&self, class: ResourceClass) -> String {
    http_partition_name(class, &self.version)
  }

  /// Snapshot of every registered partition, with entry counts and the age
  /// of the newest write.
  pub fn status(&self) -> Result<CacheStatus> {
    let mut partitions = Vec::new();
    for (name, newest) in self.store.partition_ages()? {
      partitions.push(PartitionStatus {
        entries: self.store.entry_count(&name)?,
        name,
        newest,
      });
    }
    Ok(CacheStatus {
      version: self.version.clone(),
      partitions,
    })
  }

  /// Route one outbound request through its caching strategy.
  ///
  /// Non-GET requests bypass caching entirely and go straight to the origin.
  pub async fn handle(&self, request: &ReadRequest) -> Result<ServedResponse> {
    if request.method != reqwest::Method::GET {
      let response = self.origin.fetch(request).await.map_err(|e| {
        EngineError::OriginUnavailable {
          url: request.url.to_string(),
          reason: e.to_string(),
        }
      })?;
      return Ok(ServedResponse::from_network(response));
    }

    let class = self.class_for(request);
    match class {
      ResourceClass::Api => self.network_first(request, class).await,
      ResourceClass::Image | ResourceClass::Static => self.cache_first(request, class).await,
      ResourceClass::Dynamic => self.stale_while_revalidate(request, class).await,
    }
  }

  /// Class for a request: an explicit tag wins, then shell membership, then
  /// the path and content-type heuristics.
  fn class_for(&self, request: &ReadRequest) -> ResourceClass {
    match request.class {
      Some(class) => class,
      None if self.shell.contains(&request.url) => ResourceClass::Static,
      None => request.resource_class(),
    }
  }

  /// Network-first: always try the origin for correctness-critical data.
  ///
  /// 1. Attempt network - on success, write through and return live
  /// 2. On network failure, fall back to the cached entry regardless of age
  /// 3. No cached entry either: origin unavailable
  async fn network_first(&self, request: &ReadRequest, class: ResourceClass) -> Result<ServedResponse> {
    let partition = self.partition_name(class);
    let key = request.cache_key();

    match self.origin.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.write_through(class, &partition, &key, request, &response)?;
        }
        Ok(ServedResponse::from_network(response))
      }
      Err(error) => match self.store.get_entry(&partition, &key)? {
        Some(entry) => {
          debug!(url = %request.url, "network failed, serving cached entry");
          let fresh = entry.is_fresh(self.policy.max_age(class));
          Ok(ServedResponse::from_cache(entry, fresh))
        }
        None => Err(EngineError::OriginUnavailable {
          url: request.url.to_string(),
          reason: error.to_string(),
        }),
      },
    }
  }

  /// Cache-first: immutable-ish assets skip the network while fresh.
  ///
  /// 1. Fresh cached entry: return it, no network attempt at all
  /// 2. Stale or missing: fetch, write through on success
  /// 3. Network failed with a stale entry on hand: serve it anyway
  async fn cache_first(&self, request: &ReadRequest, class: ResourceClass) -> Result<ServedResponse> {
    let partition = self.partition_name(class);
    let key = request.cache_key();
    let cached = self.store.get_entry(&partition, &key)?;

    if let Some(entry) = &cached {
      if entry.is_fresh(self.policy.max_age(class)) {
        return Ok(ServedResponse::from_cache(entry.clone(), true));
      }
    }

    match self.origin.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.write_through(class, &partition, &key, request, &response)?;
        }
        Ok(ServedResponse::from_network(response))
      }
      Err(error) => match cached {
        Some(entry) => {
          debug!(url = %request.url, "network failed, serving stale entry");
          Ok(ServedResponse::from_cache(entry, false))
        }
        None => Err(EngineError::OriginUnavailable {
          url: request.url.to_string(),
          reason: error.to_string(),
        }),
      },
    }
  }

  /// Stale-while-revalidate: serve whatever is cached immediately and
  /// refresh in the background.
  ///
  /// 1. Cached entry (fresh or stale): return it now, spawn a refresh whose
  ///    completion nobody awaits; refresh failures are swallowed
  /// 2. No cached entry: behave like network-first
  async fn stale_while_revalidate(&self, request: &ReadRequest, class: ResourceClass) -> Result<ServedResponse> {
    let partition = self.partition_name(class);
    let key = request.cache_key();

    match self.store.get_entry(&partition, &key)? {
      Some(entry) => {
        self.spawn_refresh(request.clone(), class);
        let fresh = entry.is_fresh(self.policy.max_age(class));
        Ok(ServedResponse::from_cache(entry, fresh))
      }
      None => {
        let response = self.origin.fetch(request).await.map_err(|e| {
          EngineError::OriginUnavailable {
            url: request.url.to_string(),
            reason: e.to_string(),
          }
        })?;
        if response.is_success() {
          self.write_through(class, &partition, &key, request, &response)?;
        }
        Ok(ServedResponse::from_network(response))
      }
    }
  }

  fn write_through(
    &self,
    class: ResourceClass,
    partition: &str,
    key: &str,
    request: &ReadRequest,
    response: &OriginResponse,
  ) -> Result<()> {
    store_response(
      &self.store,
      partition,
      &self.version,
      self.policy.max_age(class),
      key,
      request.url.as_str(),
      response,
    )
  }

  fn spawn_refresh(&self, request: ReadRequest, class: ResourceClass) {
    let store = Arc::clone(&self.store);
    let origin = Arc::clone(&self.origin);
    let partition = self.partition_name(class);
    let version = self.version.clone();
    let max_age = self.policy.max_age(class);
    let key = request.cache_key();

    tokio::spawn(async move {
      match origin.fetch(&request).await {
        Ok(response) if response.is_success() => {
          if let Err(error) = store_response(
            &store,
            &partition,
            &version,
            max_age,
            &key,
            request.url.as_str(),
            &response,
          ) {
            debug!(url = %request.url, %error, "background refresh could not be stored");
          }
        }
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "background refresh returned non-success");
        }
        Err(error) => {
          debug!(url = %request.url, %error, "background refresh failed");
        }
      }
    });
  }
}

impl<O: Origin> Clone for CacheManager<O> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      origin: Arc::clone(&self.origin),
      policy: self.policy.clone(),
      version: self.version.clone(),
      shell: self.shell.clone(),
    }
  }
}

fn store_response(
  store: &Store,
  partition: &str,
  version: &str,
  max_age: chrono::Duration,
  key: &str,
  url: &str,
  response: &OriginResponse,
) -> Result<()> {
  store.ensure_partition(partition, version, max_age)?;
  let entry = CachedEntry {
    status: response.status,
    content_type: response.content_type.clone(),
    body: response.body.clone(),
    cached_at: Utc::now(),
  };
  store.put_entry(partition, key, url, &entry)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::FetchError;
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Mutex;
  use url::Url;

  /// Origin double with a switchable body and failure flag.
  struct ScriptedOrigin {
    failing: AtomicBool,
    body: Mutex<Vec<u8>>,
    fetches: AtomicUsize,
  }

  impl ScriptedOrigin {
    fn serving(body: &[u8]) -> Self {
      Self {
        failing: AtomicBool::new(false),
        body: Mutex::new(body.to_vec()),
        fetches: AtomicUsize::new(0),
      }
    }

    fn failing() -> Self {
      let origin = Self::serving(b"");
      origin.failing.store(true, Ordering::SeqCst);
      origin
    }

    fn set_failing(&self, failing: bool) {
      self.failing.store(failing, Ordering::SeqCst);
    }

    fn set_body(&self, body: &[u8]) {
      *self.body.lock().unwrap() = body.to_vec();
    }

    fn fetch_count(&self) -> usize {
      self.fetches.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl Origin for ScriptedOrigin {
    async fn fetch(&self, _request: &ReadRequest) -> std::result::Result<OriginResponse, FetchError> {
      self.fetches.fetch_add(1, Ordering::SeqCst);
      if self.failing.load(Ordering::SeqCst) {
        return Err(FetchError("connection refused".to_string()));
      }
      Ok(OriginResponse {
        status: 200,
        content_type: Some("application/json".to_string()),
        body: self.body.lock().unwrap().clone(),
      })
    }

    async fn submit(
      &self,
      _mutation: &crate::store::PendingMutation,
    ) -> std::result::Result<(), crate::net::SubmitError> {
      Ok(())
    }

    async fn reachable(&self) -> bool {
      !self.failing.load(Ordering::SeqCst)
    }
  }

  fn manager(origin: Arc<ScriptedOrigin>) -> CacheManager<ScriptedOrigin> {
    let store = Arc::new(Store::open_in_memory().unwrap());
    CacheManager::new(store, origin, CachePolicy::default(), "v1")
  }

  fn aged_entry(body: &[u8], age_days: i64) -> CachedEntry {
    CachedEntry {
      status: 200,
      content_type: Some("text/html".to_string()),
      body: body.to_vec(),
      cached_at: Utc::now() - chrono::Duration::days(age_days),
    }
  }

  fn request_for(path: &str) -> ReadRequest {
    ReadRequest::get(Url::parse(&format!("https://app.example.com{path}")).unwrap())
  }

  #[tokio::test]
  async fn test_network_first_serves_live_and_writes_through() {
    let origin = Arc::new(ScriptedOrigin::serving(b"{\"doses\":[1]}"));
    let cm = manager(Arc::clone(&origin));
    let request = request_for("/api/doses");

    let served = cm.handle(&request).await.unwrap();
    assert_eq!(served.source, ServedFrom::Network);
    assert_eq!(served.body, b"{\"doses\":[1]}");

    // Write-through happened before the response was returned
    let entry = cm
      .store
      .get_entry(&cm.partition_name(ResourceClass::Api), &request.cache_key())
      .unwrap()
      .unwrap();
    assert_eq!(entry.body, b"{\"doses\":[1]}");
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache_when_offline() {
    let origin = Arc::new(ScriptedOrigin::serving(b"live"));
    let cm = manager(Arc::clone(&origin));
    let request = request_for("/api/meds");

    cm.handle(&request).await.unwrap();
    origin.set_failing(true);

    let served = cm.handle(&request).await.unwrap();
    assert_eq!(served.source, ServedFrom::CacheFresh);
    assert_eq!(served.body, b"live");
    assert!(served.cached_at.is_some());
  }

  #[tokio::test]
  async fn test_network_first_without_cache_is_origin_unavailable() {
    let origin = Arc::new(ScriptedOrigin::failing());
    let cm = manager(origin);

    let err = cm.handle(&request_for("/api/meds")).await.unwrap_err();
    assert!(matches!(err, EngineError::OriginUnavailable { .. }));
  }

  #[tokio::test]
  async fn test_cache_first_fresh_hit_skips_network() {
    let origin = Arc::new(ScriptedOrigin::serving(b"remote"));
    let cm = manager(Arc::clone(&origin));
    let request = request_for("/assets/app.css");

    let entry = aged_entry(b"body { color: red }", 0);
    cm.store
      .put_entry(
        &cm.partition_name(ResourceClass::Static),
        &request.cache_key(),
        request.url.as_str(),
        &entry,
      )
      .unwrap();

    let served = cm.handle(&request).await.unwrap();
    assert_eq!(served.source, ServedFrom::CacheFresh);
    assert_eq!(served.body, b"body { color: red }");
    // No network attempt at all
    assert_eq!(origin.fetch_count(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_stale_refetches() {
    let origin = Arc::new(ScriptedOrigin::serving(b"new-css"));
    let cm = manager(Arc::clone(&origin));
    let request = request_for("/assets/app.css");
    let partition = cm.partition_name(ResourceClass::Static);

    // Static max-age is 7 days; this entry is well past it
    cm.store
      .put_entry(&partition, &request.cache_key(), request.url.as_str(), &aged_entry(b"old-css", 30))
      .unwrap();

    let served = cm.handle(&request).await.unwrap();
    assert_eq!(served.source, ServedFrom::Network);
    assert_eq!(served.body, b"new-css");
    assert_eq!(origin.fetch_count(), 1);

    let entry = cm.store.get_entry(&partition, &request.cache_key()).unwrap().unwrap();
    assert_eq!(entry.body, b"new-css");
    assert!(entry.age() < chrono::Duration::minutes(1));
  }

  #[tokio::test]
  async fn test_cache_first_stale_survives_network_failure() {
    let origin = Arc::new(ScriptedOrigin::failing());
    let cm = manager(origin);
    let request = request_for("/img/pill.png");

    cm.store
      .put_entry(
        &cm.partition_name(ResourceClass::Image),
        &request.cache_key(),
        request.url.as_str(),
        &aged_entry(b"png-bytes", 90),
      )
      .unwrap();

    let served = cm.handle(&request).await.unwrap();
    assert_eq!(served.source, ServedFrom::CacheStale);
    assert_eq!(served.body, b"png-bytes");
  }

  #[tokio::test]
  async fn test_swr_serves_stale_then_refreshes_in_background() {
    let origin = Arc::new(ScriptedOrigin::serving(b"stale-page"));
    let cm = manager(Arc::clone(&origin));
    let request = request_for("/track/today");
    let partition = cm.partition_name(ResourceClass::Dynamic);

    // Dynamic max-age is 1 day; this entry is 10 days old
    cm.store
      .put_entry(&partition, &request.cache_key(), request.url.as_str(), &aged_entry(b"stale-page", 10))
      .unwrap();
    // The origin has moved on since the entry was cached
    origin.set_body(b"fresh-page");

    let served = cm.handle(&request).await.unwrap();
    // The stale body comes back immediately, not the refreshed one
    assert_eq!(served.source, ServedFrom::CacheStale);
    assert_eq!(served.body, b"stale-page");

    // Give the background refresh a moment to land
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let entry = cm.store.get_entry(&partition, &request.cache_key()).unwrap().unwrap();
    assert_eq!(entry.body, b"fresh-page");
    assert!(entry.age() < chrono::Duration::minutes(1));
    assert_eq!(origin.fetch_count(), 1);
  }

  #[tokio::test]
  async fn test_swr_refresh_failure_is_swallowed() {
    let origin = Arc::new(ScriptedOrigin::failing());
    let cm = manager(origin);
    let request = request_for("/track/today");
    let partition = cm.partition_name(ResourceClass::Dynamic);
    let stale = aged_entry(b"stale-page", 10);
    cm.store
      .put_entry(&partition, &request.cache_key(), request.url.as_str(), &stale)
      .unwrap();

    let served = cm.handle(&request).await.unwrap();
    assert_eq!(served.body, b"stale-page");

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let entry = cm.store.get_entry(&partition, &request.cache_key()).unwrap().unwrap();
    // Entry untouched by the failed refresh
    assert_eq!(entry.body, b"stale-page");
    assert_eq!(entry.cached_at, stale.cached_at);
  }

  #[tokio::test]
  async fn test_swr_without_cache_waits_for_network() {
    let origin = Arc::new(ScriptedOrigin::serving(b"first-page"));
    let cm = manager(Arc::clone(&origin));
    let request = request_for("/track/today");

    let served = cm.handle(&request).await.unwrap();
    assert_eq!(served.source, ServedFrom::Network);
    assert_eq!(served.body, b"first-page");

    let entry = cm
      .store
      .get_entry(&cm.partition_name(ResourceClass::Dynamic), &request.cache_key())
      .unwrap();
    assert!(entry.is_some());
  }

  #[tokio::test]
  async fn test_non_get_bypasses_cache() {
    let origin = Arc::new(ScriptedOrigin::serving(b"created"));
    let cm = manager(Arc::clone(&origin));
    let request = ReadRequest::new(
      reqwest::Method::POST,
      Url::parse("https://app.example.com/api/doses").unwrap(),
    );

    let served = cm.handle(&request).await.unwrap();
    assert_eq!(served.source, ServedFrom::Network);
    assert_eq!(origin.fetch_count(), 1);

    // Nothing was cached for the POST
    let entry = cm
      .store
      .get_entry(&cm.partition_name(ResourceClass::Api), &request.cache_key())
      .unwrap();
    assert!(entry.is_none());
  }

  #[tokio::test]
  async fn test_explicit_class_routes_to_its_partition() {
    let origin = Arc::new(ScriptedOrigin::serving(b"tagged"));
    let cm = manager(Arc::clone(&origin));
    // Looks like an image, tagged as api: network-first applies
    let request = request_for("/img/pill.png").with_class(ResourceClass::Api);

    cm.handle(&request).await.unwrap();

    let api_entry = cm
      .store
      .get_entry(&cm.partition_name(ResourceClass::Api), &request.cache_key())
      .unwrap();
    let image_entry = cm
      .store
      .get_entry(&cm.partition_name(ResourceClass::Image), &request.cache_key())
      .unwrap();
    assert!(api_entry.is_some());
    assert!(image_entry.is_none());
  }

  #[tokio::test]
  async fn test_untagged_shell_read_hits_the_precache() {
    let origin = Arc::new(ScriptedOrigin::failing());
    let shell_url = Url::parse("https://app.example.com/").unwrap();
    let cm = manager(origin).with_shell(vec![shell_url.clone()]);

    // What install writes: the shell body, keyed in the static partition
    let precached = ReadRequest::get(shell_url).with_class(ResourceClass::Static);
    cm.store
      .put_entry(
        &cm.partition_name(ResourceClass::Static),
        &precached.cache_key(),
        precached.url.as_str(),
        &aged_entry(b"<html>shell</html>", 0),
      )
      .unwrap();

    // "/" would classify as dynamic; shell membership routes it static, so
    // the offline read still finds the precache
    let served = cm.handle(&request_for("/")).await.unwrap();
    assert_eq!(served.source, ServedFrom::CacheFresh);
    assert_eq!(served.body, b"<html>shell</html>");
  }

  #[tokio::test]
  async fn test_explicit_tag_wins_over_shell_membership() {
    let origin = Arc::new(ScriptedOrigin::serving(b"page"));
    let shell_url = Url::parse("https://app.example.com/").unwrap();
    let cm = manager(Arc::clone(&origin)).with_shell(vec![shell_url]);
    let request = request_for("/").with_class(ResourceClass::Dynamic);

    cm.handle(&request).await.unwrap();

    // Routed by the tag, not the shell list
    let dynamic_entry = cm
      .store
      .get_entry(&cm.partition_name(ResourceClass::Dynamic), &request.cache_key())
      .unwrap();
    let static_entry = cm
      .store
      .get_entry(&cm.partition_name(ResourceClass::Static), &request.cache_key())
      .unwrap();
    assert!(dynamic_entry.is_some());
    assert!(static_entry.is_none());
  }

  #[tokio::test]
  async fn test_status_reports_partition_ages() {
    let origin = Arc::new(ScriptedOrigin::serving(b"{}"));
    let cm = manager(Arc::clone(&origin));

    cm.handle(&request_for("/api/meds")).await.unwrap();
    cm.store
      .ensure_partition(&cm.partition_name(ResourceClass::Image), "v1", chrono::Duration::days(30))
      .unwrap();

    let status = cm.status().unwrap();
    assert_eq!(status.version, "v1");

    let api = status
      .partitions
      .iter()
      .find(|p| p.name == cm.partition_name(ResourceClass::Api))
      .unwrap();
    assert_eq!(api.entries, 1);
    assert!(api.newest.is_some());

    let image = status
      .partitions
      .iter()
      .find(|p| p.name == cm.partition_name(ResourceClass::Image))
      .unwrap();
    assert_eq!(image.entries, 0);
    assert!(image.newest.is_none());
  }

  #[tokio::test]
  async fn test_non_success_response_not_written_through() {
    struct ErrorOrigin;

    #[async_trait]
    impl Origin for ErrorOrigin {
      async fn fetch(&self, _request: &ReadRequest) -> std::result::Result<OriginResponse, FetchError> {
        Ok(OriginResponse {
          status: 500,
          content_type: None,
          body: b"server error".to_vec(),
        })
      }

      async fn submit(
        &self,
        _mutation: &crate::store::PendingMutation,
      ) -> std::result::Result<(), crate::net::SubmitError> {
        Ok(())
      }

      async fn reachable(&self) -> bool {
        true
      }
    }

    let store = Arc::new(Store::open_in_memory().unwrap());
    let cm = CacheManager::new(store, Arc::new(ErrorOrigin), CachePolicy::default(), "v1");
    let request = request_for("/api/meds");

    // The 500 is returned to the caller but never cached
    let served = cm.handle(&request).await.unwrap();
    assert_eq!(served.status, 500);
    assert_eq!(served.source, ServedFrom::Network);
    let entry = cm
      .store
      .get_entry(&cm.partition_name(ResourceClass::Api), &request.cache_key())
      .unwrap();
    assert!(entry.is_none());
  }
}

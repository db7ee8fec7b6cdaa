//! Lifecycle manager: install/activate transitions and cache-version GC.
//!
//! A new version installs by creating its versioned partitions and precaching
//! the static shell, then skips the wait state so it can take over without
//! waiting for old clients to close. Activation adopts the version marker and
//! purges every partition whose version tag differs; unversioned partitions
//! (entities, the mutation queue, push subscriptions) are never touched. A
//! version whose install failed cannot activate, so the previously installed
//! version keeps serving.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::cache::{http_partition_name, CachePolicy, ResourceClass};
use crate::error::{EngineError, Result};
use crate::net::{Origin, ReadRequest};
use crate::store::{CachedEntry, Store};

/// Worker lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
  Installing,
  Waiting,
  Activating,
  Active,
}

/// What an activation did.
#[derive(Debug, Clone)]
pub struct ActivationReport {
  pub version: String,
  pub purged: Vec<String>,
}

pub struct LifecycleManager {
  store: Arc<Store>,
  version: String,
  shell: Vec<Url>,
  policy: CachePolicy,
  phase: LifecyclePhase,
}

impl LifecycleManager {
  pub fn new(store: Arc<Store>, version: impl Into<String>, shell: Vec<Url>, policy: CachePolicy) -> Self {
    Self {
      store,
      version: version.into(),
      shell,
      policy,
      phase: LifecyclePhase::Installing,
    }
  }

  pub fn phase(&self) -> LifecyclePhase {
    self.phase
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Whether the store's active version differs from this manager's.
  pub fn needs_install(&self) -> Result<bool> {
    Ok(self.store.current_version()?.as_deref() != Some(self.version.as_str()))
  }

  /// Version reads should be keyed to: the store marker when one is set,
  /// otherwise this manager's. They diverge while an install of a new
  /// version has not completed.
  pub fn serving_version(&self) -> Result<String> {
    Ok(self.store.current_version()?.unwrap_or_else(|| self.version.clone()))
  }

  /// Install the version: create its partitions and precache the static
  /// shell. Any shell fetch failing fails the whole install, leaving the
  /// previously active version in place. On success the manager is left in
  /// the wait state, which callers skip by activating immediately.
  pub async fn install<O: Origin>(&mut self, origin: &O) -> Result<()> {
    self.phase = LifecyclePhase::Installing;
    info!(version = %self.version, shell = self.shell.len(), "installing cache version");

    for class in ResourceClass::ALL {
      let name = http_partition_name(class, &self.version);
      self.store.ensure_partition(&name, &self.version, self.policy.max_age(class))?;
    }

    let static_partition = http_partition_name(ResourceClass::Static, &self.version);
    let fetches = self.shell.iter().map(|url| {
      let request = ReadRequest::get(url.clone()).with_class(ResourceClass::Static);
      async move {
        let result = origin.fetch(&request).await;
        (request, result)
      }
    });

    for (request, result) in join_all(fetches).await {
      match result {
        Ok(response) if response.is_success() => {
          let entry = CachedEntry {
            status: response.status,
            content_type: response.content_type,
            body: response.body,
            cached_at: chrono::Utc::now(),
          };
          self
            .store
            .put_entry(&static_partition, &request.cache_key(), request.url.as_str(), &entry)?;
          debug!(url = %request.url, "shell resource precached");
        }
        Ok(response) => {
          return Err(EngineError::OriginUnavailable {
            url: request.url.to_string(),
            reason: format!("shell precache got status {}", response.status),
          });
        }
        Err(error) => {
          return Err(EngineError::OriginUnavailable {
            url: request.url.to_string(),
            reason: error.to_string(),
          });
        }
      }
    }

    self.phase = LifecyclePhase::Waiting;
    Ok(())
  }

  /// Activate: adopt the version marker, then purge every partition whose
  /// version tag differs. Idempotent, so re-activating the current version
  /// just re-asserts it. Refused for a version whose install has not
  /// completed.
  pub fn activate(&mut self) -> Result<ActivationReport> {
    // Only an installed version may take over; the version that is already
    // current may always re-assert itself.
    if self.phase == LifecyclePhase::Installing && self.needs_install()? {
      return Err(EngineError::NotInstalled {
        version: self.version.clone(),
      });
    }

    self.phase = LifecyclePhase::Activating;
    self.store.set_current_version(&self.version)?;

    let mut purged = Vec::new();
    for name in self.store.partition_names()? {
      if let Some(tag) = version_tag(&name) {
        if tag != self.version {
          self.store.delete_partition(&name)?;
          debug!(partition = %name, "purged superseded partition");
          purged.push(name);
        }
      }
    }

    self.phase = LifecyclePhase::Active;
    info!(version = %self.version, purged = purged.len(), "cache version active");
    Ok(ActivationReport {
      version: self.version.clone(),
      purged,
    })
  }
}

/// Version tag embedded in a partition name; `None` for unversioned
/// partitions, which GC must never touch.
fn version_tag(name: &str) -> Option<&str> {
  let rest = name.strip_prefix("http-cache:")?;
  rest.split_once(':').map(|(_, version)| version)
}

//! Resource classes and per-class caching policy.

use serde::{Deserialize, Serialize};
use url::Url;

/// The class a read request belongs to, which selects its caching strategy.
///
/// Requests usually carry an explicit class attached where they originate;
/// [`ResourceClass::classify`] is the path and content-type fallback for
/// untagged requests. Anything not recognizably api, image or static is
/// dynamic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
  Api,
  Image,
  Static,
  Dynamic,
}

impl ResourceClass {
  pub const ALL: [ResourceClass; 4] = [Self::Api, Self::Image, Self::Static, Self::Dynamic];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Api => "api",
      Self::Image => "image",
      Self::Static => "static",
      Self::Dynamic => "dynamic",
    }
  }

  /// Heuristic classification by URL path and accept hint.
  pub fn classify(url: &Url, accept: Option<&str>) -> Self {
    let path = url.path();
    if path == "/api" || path.starts_with("/api/") {
      return Self::Api;
    }

    if let Some(accept) = accept {
      if accept.starts_with("image/") {
        return Self::Image;
      }
      if accept.starts_with("application/json") {
        return Self::Api;
      }
    }

    match extension(path).map(|e| e.to_ascii_lowercase()).as_deref() {
      Some("png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "ico" | "avif") => Self::Image,
      Some("css" | "js" | "mjs" | "woff" | "woff2" | "ttf" | "otf" | "map" | "webmanifest") => {
        Self::Static
      }
      _ => Self::Dynamic,
    }
  }
}

impl std::fmt::Display for ResourceClass {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

fn extension(path: &str) -> Option<&str> {
  let file = path.rsplit('/').next()?;
  let (stem, ext) = file.rsplit_once('.')?;
  (!stem.is_empty() && !ext.is_empty()).then_some(ext)
}

/// Partition name for a class under a version: `http-cache:<class>:<version>`.
pub fn http_partition_name(class: ResourceClass, version: &str) -> String {
  format!("http-cache:{}:{}", class.as_str(), version)
}

/// Per-class maximum-age policy. Staleness is advisory for every strategy
/// except cache-first, which uses it to decide whether the network is needed
/// at all.
#[derive(Debug, Clone)]
pub struct CachePolicy {
  pub api: chrono::Duration,
  pub image: chrono::Duration,
  pub static_assets: chrono::Duration,
  pub dynamic: chrono::Duration,
}

impl CachePolicy {
  pub fn max_age(&self, class: ResourceClass) -> chrono::Duration {
    match class {
      ResourceClass::Api => self.api,
      ResourceClass::Image => self.image,
      ResourceClass::Static => self.static_assets,
      ResourceClass::Dynamic => self.dynamic,
    }
  }
}

impl Default for CachePolicy {
  fn default() -> Self {
    Self {
      api: chrono::Duration::seconds(300),
      image: chrono::Duration::days(30),
      static_assets: chrono::Duration::days(7),
      dynamic: chrono::Duration::days(1),
    }
  }
}

//! Engine error taxonomy.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the cache and sync engine.
///
/// Most failure handling happens below this level: caching strategies fall
/// back to stored entries and the queue drain isolates per-item failures.
/// These variants are the cases a caller still has to handle.
#[derive(Debug, Error)]
pub enum EngineError {
  /// The network attempt failed and no usable cache entry exists.
  #[error("origin unavailable for {url}: {reason}")]
  OriginUnavailable { url: String, reason: String },

  /// The server terminally refused a queued mutation. The record stays in
  /// the queue marked rejected and is excluded from future drains.
  #[error("mutation {id} rejected by origin: {reason}")]
  MutationRejected { id: Uuid, reason: String },

  /// Activation was requested for a version whose install never completed.
  #[error("cache version {version} is not installed")]
  NotInstalled { version: String },

  /// The durable store cannot be opened at all. Fatal to the engine; the
  /// application should fall back to direct network access.
  #[error("durable store unavailable: {0}")]
  StorageUnavailable(String),

  /// A storage operation failed after the store was opened.
  #[error("storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// A persisted row could not be decoded.
  #[error("invalid stored record: {0}")]
  InvalidRecord(String),

  #[error("configuration error: {0}")]
  Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

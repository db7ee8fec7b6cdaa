//! Offline-first cache and sync engine for a mobile health tracker.
//!
//! The engine keeps the app usable without connectivity:
//!
//! - [`cache`] serves origin reads through per-class strategies backed by
//!   versioned cache partitions
//! - [`store`] is the durable SQLite layer every component shares
//! - [`lifecycle`] installs new cache versions and purges superseded ones
//! - [`sync`] drains locally queued mutations to the origin in order
//! - [`push`] turns push payloads into notifications and queued work
//! - [`worker`] is the message-driven loop that ties the pieces together
//!
//! Everything that must survive a restart lives in the store; the worker and
//! coordinator keep no authoritative state in memory.

pub mod cache;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod push;
pub mod store;
pub mod sync;
pub mod worker;

pub use error::{EngineError, Result};

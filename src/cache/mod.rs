//! Request caching layer for offline support.
//!
//! This module decides how each read request is served:
//! - Classifies requests into api / image / static / dynamic resource classes
//! - Binds each class to a strategy: network-first, cache-first, or
//!   stale-while-revalidate
//! - Writes successful responses through to the durable store under
//!   versioned partitions (`http-cache:<class>:<version>`)

mod class;
mod manager;

pub use class::{http_partition_name, CachePolicy, ResourceClass};
pub use manager::{CacheManager, CacheStatus, PartitionStatus, ServedFrom, ServedResponse};

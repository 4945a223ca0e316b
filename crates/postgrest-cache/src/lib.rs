//! Building blocks for a caching proxy in front of PostgREST.
//!
//! - [`key`]: request fingerprinting
//! - [`sink`]: the response sink capability and the capturing wrapper
//! - [`response`]: the immutable cached response and its stored form
//! - [`store`]: get/set/delete of responses against a [`KvStore`] with a TTL
//! - [`memory`], [`redis_store`]: the two [`KvStore`] backends

pub mod backend;
pub mod key;
pub mod memory;
pub mod redis_store;
pub mod response;
pub mod sink;
pub mod store;

pub use backend::{KvStore, StoreError, StoreResult};
pub use key::{cache_key, group_query, QueryParams};
pub use memory::MemoryStore;
pub use redis_store::{RedisSettings, RedisStore};
pub use response::{CachedResponse, HeaderValues};
pub use sink::{CaptureSink, ResponseSink, SinkError};
pub use store::{Lookup, ResponseStore};

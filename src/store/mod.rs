//! Capability interface over the shared backing store.
//!
//! The scheduler only ever needs four primitives: string keys with TTL, a
//! sorted set with atomic minimum-pop, publish/subscribe channels and
//! append-only streams. Everything else is built on top of those.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

use crate::error::StoreError;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Payloads delivered on a subscribed channel, in publish order.
pub type Subscription = BoxStream<'static, String>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
  async fn get(&self, key: &str) -> StoreResult<Option<String>>;

  /// Overwrites `key`. A `None` ttl clears any previous expiry.
  async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

  /// Returns how many of `keys` existed.
  async fn del(&self, keys: &[String]) -> StoreResult<usize>;

  async fn exists(&self, key: &str) -> StoreResult<bool>;

  /// Sets a time to live on an existing key of any type. Returns false when
  /// the key does not exist.
  async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

  /// Glob match where `*` is the only wildcard.
  async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

  async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

  /// Removes and returns the lowest scored member in a single operation.
  async fn zpopmin(&self, key: &str) -> StoreResult<Option<(String, f64)>>;

  async fn zcard(&self, key: &str) -> StoreResult<usize>;

  /// Returns the number of subscribers that received the payload.
  async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize>;

  async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;

  /// Appends one entry and returns its id.
  async fn xadd(&self, key: &str, payload: &str) -> StoreResult<String>;

  /// Newest entries first, optionally capped at `count`.
  async fn xrevrange(&self, key: &str, count: Option<usize>) -> StoreResult<Vec<String>>;

  async fn xlen(&self, key: &str) -> StoreResult<usize>;
}

//! Backing store abstraction for Convoy.
//!
//! The queue, the event bus, the cost tracker and the rate limiter all share
//! one distributed key/value store. Every mutation they need is a single
//! atomic store operation (counter increment, ordered-set pop-min, set
//! membership), so any number of agent processes can call them concurrently
//! without in-process locks.
//!
//! # Main types
//!
//! - [`Store`]: The trait every backend implements.
//! - [`MemoryStore`]: In-process backend for single-node deployments and tests.
//! - `RedisStore`: Redis backend (feature `redis`).

/// Degraded-mode tracking for fail-open callers.
pub mod health;
/// In-process backend.
pub mod memory;
/// Redis backend.
#[cfg(feature = "redis")]
pub mod redis_store;

pub use health::{DegradedFlag, DegradedMode};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

use async_trait::async_trait;
use convoy_core::ConvoyResult;
use futures_util::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

/// A message received from a pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw payload.
    pub payload: String,
}

/// Live pub/sub subscription. Dropping it tears the subscription down.
pub type MessageStream = Pin<Box<dyn Stream<Item = StoreMessage> + Send>>;

/// One field increment inside a [`HashBatch`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldDelta {
    /// `HINCRBY`
    Int(i64),
    /// `HINCRBYFLOAT`
    Float(f64),
}

/// Hash-field increments and expiries applied together by
/// [`Store::hincr_many`]: either every step lands or none does.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HashBatch {
    increments: Vec<(String, String, FieldDelta)>,
    expiries: Vec<(String, Duration)>,
}

impl HashBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to the integer field `field` of `key`.
    pub fn incr(mut self, key: &str, field: &str, delta: i64) -> Self {
        self.increments
            .push((key.to_string(), field.to_string(), FieldDelta::Int(delta)));
        self
    }

    /// Add `delta` to the float field `field` of `key`.
    pub fn incr_float(mut self, key: &str, field: &str, delta: f64) -> Self {
        self.increments
            .push((key.to_string(), field.to_string(), FieldDelta::Float(delta)));
        self
    }

    /// (Re)set the TTL of `key` once the increments are applied.
    pub fn expire(mut self, key: &str, ttl: Duration) -> Self {
        self.expiries.push((key.to_string(), ttl));
        self
    }

    /// `(key, field, delta)` steps in insertion order.
    pub fn increments(&self) -> &[(String, String, FieldDelta)] {
        &self.increments
    }

    /// `(key, ttl)` steps applied after every increment.
    pub fn expiries(&self) -> &[(String, Duration)] {
        &self.expiries
    }

    /// Whether the batch has no steps at all.
    pub fn is_empty(&self) -> bool {
        self.increments.is_empty() && self.expiries.is_empty()
    }
}

/// Primitives the Convoy components require from a backing store.
///
/// Each method is one round trip and atomic on its key;
/// [`hincr_many`](Store::hincr_many) is atomic across all the keys it names.
#[async_trait]
pub trait Store: Send + Sync {
    /// Short backend name for health reports.
    fn backend(&self) -> &'static str;

    /// Round trip used by health checks.
    async fn ping(&self) -> ConvoyResult<()>;

    /// Read a string value.
    async fn get(&self, key: &str) -> ConvoyResult<Option<String>>;
    /// Write a string value, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> ConvoyResult<()>;
    /// Delete a key of any kind. Returns whether it existed.
    async fn delete(&self, key: &str) -> ConvoyResult<bool>;
    /// Atomically add `delta` to an integer counter and return the new value.
    async fn incr(&self, key: &str, delta: i64) -> ConvoyResult<i64>;
    /// Set a TTL on an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> ConvoyResult<()>;

    /// Atomically add `delta` to an integer hash field.
    async fn hincr(&self, key: &str, field: &str, delta: i64) -> ConvoyResult<i64>;
    /// Atomically add `delta` to a float hash field.
    async fn hincr_float(&self, key: &str, field: &str, delta: f64) -> ConvoyResult<f64>;
    /// Apply every step of `batch` atomically. On error nothing is applied.
    async fn hincr_many(&self, batch: &HashBatch) -> ConvoyResult<()>;
    /// Read every field of a hash. Missing keys read as empty.
    async fn hgetall(&self, key: &str) -> ConvoyResult<HashMap<String, String>>;

    /// Add or re-score a member of an ordered set.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> ConvoyResult<()>;
    /// Atomically remove and return the lowest-scored member.
    async fn zpopmin(&self, key: &str) -> ConvoyResult<Option<(String, f64)>>;
    /// Lowest-scored member without removing it.
    async fn zfirst(&self, key: &str) -> ConvoyResult<Option<(String, f64)>>;
    /// Remove a member. Returns whether it was present.
    async fn zrem(&self, key: &str, member: &str) -> ConvoyResult<bool>;
    /// Number of members.
    async fn zcard(&self, key: &str) -> ConvoyResult<u64>;
    /// Remove members with `min <= score <= max`. Returns how many were removed.
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> ConvoyResult<u64>;

    /// Add a set member. Returns whether it was newly added.
    async fn sadd(&self, key: &str, member: &str) -> ConvoyResult<bool>;
    /// Remove a set member. Returns whether it was present.
    async fn srem(&self, key: &str, member: &str) -> ConvoyResult<bool>;
    /// Set cardinality.
    async fn scard(&self, key: &str) -> ConvoyResult<u64>;
    /// Every set member, in no particular order.
    async fn smembers(&self, key: &str) -> ConvoyResult<Vec<String>>;

    /// Publish on a channel. Returns the number of receivers reached.
    async fn publish(&self, channel: &str, payload: &str) -> ConvoyResult<usize>;
    /// Subscribe to a list of channels.
    async fn subscribe(&self, channels: &[String]) -> ConvoyResult<MessageStream>;

    /// Drop every key whose TTL has elapsed and return how many went.
    /// Backends that expire keys on their own keep the default no-op.
    async fn purge_expired(&self) -> ConvoyResult<usize> {
        Ok(0)
    }
}

use crate::{FieldDelta, HashBatch, MessageStream, Store, StoreMessage};
use async_trait::async_trait;
use convoy_core::{ConvoyError, ConvoyResult};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Ordering key inside an ordered set: score, then insertion sequence.
#[derive(Debug, Clone, Copy)]
struct ZKey {
    score: f64,
    seq: u64,
}

impl PartialEq for ZKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ZKey {}

impl PartialOrd for ZKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ZKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Default)]
struct ZSet {
    by_member: HashMap<String, ZKey>,
    ordered: BTreeMap<ZKey, String>,
}

impl ZSet {
    fn insert(&mut self, member: &str, key: ZKey) {
        if let Some(old) = self.by_member.insert(member.to_string(), key) {
            self.ordered.remove(&old);
        }
        self.ordered.insert(key, member.to_string());
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.by_member.remove(member) {
            Some(key) => {
                self.ordered.remove(&key);
                true
            }
            None => false,
        }
    }

    fn pop_min(&mut self) -> Option<(String, f64)> {
        let (key, member) = self.ordered.pop_first()?;
        self.by_member.remove(&member);
        Some((member, key.score))
    }

    fn first(&self) -> Option<(String, f64)> {
        self.ordered
            .first_key_value()
            .map(|(key, member)| (member.clone(), key.score))
    }

    fn len(&self) -> usize {
        self.by_member.len()
    }
}

#[derive(Debug, Default)]
struct Inner {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, ZSet>,
    sets: HashMap<String, HashSet<String>>,
    expiries: HashMap<String, Instant>,
    zseq: u64,
}

impl Inner {
    /// Drop `key` if its TTL has elapsed. Every keyed operation calls this first.
    fn purge_expired(&mut self, key: &str) {
        if let Some(deadline) = self.expiries.get(key) {
            if Instant::now() >= *deadline {
                self.remove_key(key);
            }
        }
    }

    /// Drop every key whose TTL has elapsed.
    fn purge_all_expired(&mut self) -> usize {
        let now = Instant::now();
        let due: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &due {
            self.remove_key(key);
        }
        due.len()
    }

    fn remove_key(&mut self, key: &str) -> bool {
        self.expiries.remove(key);
        let mut existed = self.strings.remove(key).is_some();
        existed |= self.hashes.remove(key).is_some();
        existed |= self.zsets.remove(key).is_some();
        existed |= self.sets.remove(key).is_some();
        existed
    }

    fn exists(&self, key: &str) -> bool {
        self.strings.contains_key(key)
            || self.hashes.contains_key(key)
            || self.zsets.contains_key(key)
            || self.sets.contains_key(key)
    }

    fn next_zseq(&mut self) -> u64 {
        self.zseq += 1;
        self.zseq
    }
}

fn add_int(
    hash: &mut HashMap<String, String>,
    key: &str,
    field: &str,
    delta: i64,
) -> ConvoyResult<i64> {
    let current = match hash.get(field) {
        Some(raw) => raw.parse::<i64>().map_err(|_| {
            ConvoyError::store(format!("field '{field}' of '{key}' is not an integer"))
        })?,
        None => 0,
    };
    let next = current + delta;
    hash.insert(field.to_string(), next.to_string());
    Ok(next)
}

fn add_float(
    hash: &mut HashMap<String, String>,
    key: &str,
    field: &str,
    delta: f64,
) -> ConvoyResult<f64> {
    let current = match hash.get(field) {
        Some(raw) => raw.parse::<f64>().map_err(|_| {
            ConvoyError::store(format!("field '{field}' of '{key}' is not a number"))
        })?,
        None => 0.0,
    };
    let next = current + delta;
    hash.insert(field.to_string(), next.to_string());
    Ok(next)
}

/// In-process [`Store`] backed by hash maps behind a single mutex.
///
/// Every operation holds the lock for its whole duration, which gives the
/// same per-key atomicity a Redis command has. Pub/sub is a tokio broadcast
/// channel filtered per subscriber.
///
/// [`MemoryStore::set_offline`] makes every call fail with
/// [`ConvoyError::Store`], which is how the degraded paths of the callers
/// are exercised without a real outage.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    bus: broadcast::Sender<StoreMessage>,
    offline: AtomicBool,
}

impl MemoryStore {
    /// New empty store with the default pub/sub buffer.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// New empty store whose pub/sub buffer holds `capacity` messages per
    /// subscriber before slow subscribers start losing messages.
    pub fn with_capacity(capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Mutex::new(Inner::default()),
            bus,
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate an outage (`true`) or recovery (`false`).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, AtomicOrdering::SeqCst);
    }

    /// Whether the store is currently simulating an outage.
    pub fn is_offline(&self) -> bool {
        self.offline.load(AtomicOrdering::SeqCst)
    }

    /// Keys currently held, expired ones included until they are purged.
    pub fn key_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.strings.len() + inner.hashes.len() + inner.zsets.len() + inner.sets.len()
    }

    fn check_online(&self) -> ConvoyResult<()> {
        if self.is_offline() {
            return Err(ConvoyError::store("memory store is offline"));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> ConvoyResult<()> {
        self.check_online()
    }

    async fn get(&self, key: &str) -> ConvoyResult<Option<String>> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        Ok(inner.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> ConvoyResult<()> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.remove_key(key);
        inner.strings.insert(key.to_string(), value.to_string());
        if let Some(ttl) = ttl {
            inner.expiries.insert(key.to_string(), Instant::now() + ttl);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> ConvoyResult<bool> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        Ok(inner.remove_key(key))
    }

    async fn incr(&self, key: &str, delta: i64) -> ConvoyResult<i64> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        let current = match inner.strings.get(key) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| ConvoyError::store(format!("value at '{key}' is not an integer")))?,
            None => 0,
        };
        let next = current + delta;
        inner.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> ConvoyResult<()> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        if inner.exists(key) {
            inner.expiries.insert(key.to_string(), Instant::now() + ttl);
        }
        Ok(())
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> ConvoyResult<i64> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        let hash = inner.hashes.entry(key.to_string()).or_default();
        add_int(hash, key, field, delta)
    }

    async fn hincr_float(&self, key: &str, field: &str, delta: f64) -> ConvoyResult<f64> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        let hash = inner.hashes.entry(key.to_string()).or_default();
        add_float(hash, key, field, delta)
    }

    async fn hincr_many(&self, batch: &HashBatch) -> ConvoyResult<()> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        // Work on copies so a bad field leaves every hash untouched.
        let mut staged: HashMap<String, HashMap<String, String>> = HashMap::new();
        for (key, field, delta) in batch.increments() {
            if !staged.contains_key(key) {
                inner.purge_expired(key);
                let current = inner.hashes.get(key).cloned().unwrap_or_default();
                staged.insert(key.clone(), current);
            }
            let hash = staged.entry(key.clone()).or_default();
            match *delta {
                FieldDelta::Int(delta) => {
                    add_int(hash, key, field, delta)?;
                }
                FieldDelta::Float(delta) => {
                    add_float(hash, key, field, delta)?;
                }
            }
        }
        inner.hashes.extend(staged);
        let now = Instant::now();
        for (key, ttl) in batch.expiries() {
            inner.purge_expired(key);
            if inner.exists(key) {
                inner.expiries.insert(key.clone(), now + *ttl);
            }
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> ConvoyResult<HashMap<String, String>> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> ConvoyResult<()> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        let seq = inner.next_zseq();
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member, ZKey { score, seq });
        Ok(())
    }

    async fn zpopmin(&self, key: &str) -> ConvoyResult<Option<(String, f64)>> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(None);
        };
        let popped = zset.pop_min();
        if zset.len() == 0 {
            inner.remove_key(key);
        }
        Ok(popped)
    }

    async fn zfirst(&self, key: &str) -> ConvoyResult<Option<(String, f64)>> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        Ok(inner.zsets.get(key).and_then(ZSet::first))
    }

    async fn zrem(&self, key: &str, member: &str) -> ConvoyResult<bool> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(false);
        };
        let removed = zset.remove(member);
        if zset.len() == 0 {
            inner.remove_key(key);
        }
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> ConvoyResult<u64> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        Ok(inner.zsets.get(key).map_or(0, |z| z.len() as u64))
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> ConvoyResult<u64> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(0);
        };
        let doomed: Vec<String> = zset
            .ordered
            .iter()
            .filter(|(k, _)| k.score >= min && k.score <= max)
            .map(|(_, member)| member.clone())
            .collect();
        for member in &doomed {
            zset.remove(member);
        }
        if zset.len() == 0 {
            inner.remove_key(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn sadd(&self, key: &str, member: &str) -> ConvoyResult<bool> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        Ok(inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> ConvoyResult<bool> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        let Some(set) = inner.sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            inner.remove_key(key);
        }
        Ok(removed)
    }

    async fn scard(&self, key: &str) -> ConvoyResult<u64> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        Ok(inner.sets.get(key).map_or(0, |s| s.len() as u64))
    }

    async fn smembers(&self, key: &str) -> ConvoyResult<Vec<String>> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> ConvoyResult<usize> {
        self.check_online()?;
        let msg = StoreMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        // No live receivers is not an error, same as PUBLISH returning 0.
        Ok(self.bus.send(msg).unwrap_or(0))
    }

    async fn subscribe(&self, channels: &[String]) -> ConvoyResult<MessageStream> {
        self.check_online()?;
        let wanted: Arc<HashSet<String>> = Arc::new(channels.iter().cloned().collect());
        let stream = BroadcastStream::new(self.bus.subscribe()).filter_map(move |item| {
            let wanted = Arc::clone(&wanted);
            async move {
                match item {
                    Ok(msg) if wanted.contains(&msg.channel) => Some(msg),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "Pub/sub subscriber lagged, messages dropped");
                        None
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn purge_expired(&self) -> ConvoyResult<usize> {
        self.check_online()?;
        Ok(self.inner.lock().purge_all_expired())
    }
}

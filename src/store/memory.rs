//! Single-process store with the same semantics as the Redis adapter.
//!
//! Used by the test suites and by `dscan_api` when no `REDIS_URL` is given.

use async_trait::async_trait;
use futures::StreamExt;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;

use super::{Store, StoreResult, Subscription};
use crate::error::StoreError;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
enum Value {
  Str(String),
  /// Kept sorted by (score, member) like a Redis sorted set.
  ZSet(Vec<(f64, String)>),
  Stream(Vec<(String, String)>),
}

#[derive(Debug)]
struct Entry {
  value: Value,
  expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
  entries: HashMap<String, Entry>,
  channels: HashMap<String, broadcast::Sender<String>>,
  stream_seq: u64,
}

impl Inner {
  fn purge_expired(&mut self, key: &str) {
    let expired = self
      .entries
      .get(key)
      .and_then(|e| e.expires_at)
      .is_some_and(|at| at <= Instant::now());
    if expired {
      self.entries.remove(key);
    }
  }

  fn live(&mut self, key: &str) -> Option<&mut Entry> {
    self.purge_expired(key);
    self.entries.get_mut(key)
  }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
  inner: Mutex<Inner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

fn wrong_type(key: &str) -> StoreError {
  StoreError::WrongType { key: key.to_string() }
}

fn zset_order(a: &(f64, String), b: &(f64, String)) -> Ordering {
  a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal).then_with(|| a.1.cmp(&b.1))
}

pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
  let parts: Vec<&str> = pattern.split('*').collect();
  if parts.len() == 1 {
    return pattern == key;
  }
  let (first, last) = (parts[0], parts[parts.len() - 1]);
  if !key.starts_with(first) || key.len() < first.len() + last.len() || !key.ends_with(last) {
    return false;
  }
  let mut rest = &key[first.len()..key.len() - last.len()];
  for part in &parts[1..parts.len() - 1] {
    match rest.find(part) {
      Some(idx) => rest = &rest[idx + part.len()..],
      None => return false,
    }
  }
  true
}

#[async_trait]
impl Store for MemoryStore {
  async fn get(&self, key: &str) -> StoreResult<Option<String>> {
    let mut inner = self.inner.lock().await;
    match inner.live(key) {
      None => Ok(None),
      Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
      Some(_) => Err(wrong_type(key)),
    }
  }

  async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
    let mut inner = self.inner.lock().await;
    inner.entries.insert(
      key.to_string(),
      Entry {
        value: Value::Str(value.to_string()),
        expires_at: ttl.map(|ttl| Instant::now() + ttl),
      },
    );
    Ok(())
  }

  async fn del(&self, keys: &[String]) -> StoreResult<usize> {
    let mut inner = self.inner.lock().await;
    let mut removed = 0;
    for key in keys {
      inner.purge_expired(key);
      if inner.entries.remove(key).is_some() {
        removed += 1;
      }
    }
    Ok(removed)
  }

  async fn exists(&self, key: &str) -> StoreResult<bool> {
    let mut inner = self.inner.lock().await;
    Ok(inner.live(key).is_some())
  }

  async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
    let mut inner = self.inner.lock().await;
    match inner.live(key) {
      Some(entry) => {
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(true)
      }
      None => Ok(false),
    }
  }

  async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
    let mut inner = self.inner.lock().await;
    let now = Instant::now();
    inner.entries.retain(|_, e| e.expires_at.is_none_or(|at| at > now));
    let mut keys: Vec<String> = inner.entries.keys().filter(|k| glob_match(pattern, k)).cloned().collect();
    keys.sort();
    Ok(keys)
  }

  async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
    let mut inner = self.inner.lock().await;
    inner.purge_expired(key);
    let entry = inner
      .entries
      .entry(key.to_string())
      .or_insert_with(|| Entry { value: Value::ZSet(Vec::new()), expires_at: None });
    let Value::ZSet(set) = &mut entry.value else {
      return Err(wrong_type(key));
    };
    set.retain(|(_, m)| m != member);
    let item = (score, member.to_string());
    let idx = set.partition_point(|probe| zset_order(probe, &item) == Ordering::Less);
    set.insert(idx, item);
    Ok(())
  }

  async fn zpopmin(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
    let mut inner = self.inner.lock().await;
    let ((score, member), drained) = {
      let Some(entry) = inner.live(key) else {
        return Ok(None);
      };
      let Value::ZSet(set) = &mut entry.value else {
        return Err(wrong_type(key));
      };
      if set.is_empty() {
        return Ok(None);
      }
      let head = set.remove(0);
      (head, set.is_empty())
    };
    if drained {
      inner.entries.remove(key);
    }
    Ok(Some((member, score)))
  }

  async fn zcard(&self, key: &str) -> StoreResult<usize> {
    let mut inner = self.inner.lock().await;
    match inner.live(key) {
      None => Ok(0),
      Some(Entry { value: Value::ZSet(set), .. }) => Ok(set.len()),
      Some(_) => Err(wrong_type(key)),
    }
  }

  async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
    let inner = self.inner.lock().await;
    let delivered = inner
      .channels
      .get(channel)
      .and_then(|tx| tx.send(payload.to_string()).ok())
      .unwrap_or(0);
    Ok(delivered)
  }

  async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
    let mut inner = self.inner.lock().await;
    let rx = inner
      .channels
      .entry(channel.to_string())
      .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
      .subscribe();
    Ok(BroadcastStream::new(rx).filter_map(|msg| async move { msg.ok() }).boxed())
  }

  async fn xadd(&self, key: &str, payload: &str) -> StoreResult<String> {
    let mut inner = self.inner.lock().await;
    inner.stream_seq += 1;
    let id = format!("{}-{}", chrono::Utc::now().timestamp_millis(), inner.stream_seq);
    inner.purge_expired(key);
    let entry = inner
      .entries
      .entry(key.to_string())
      .or_insert_with(|| Entry { value: Value::Stream(Vec::new()), expires_at: None });
    let Value::Stream(items) = &mut entry.value else {
      return Err(wrong_type(key));
    };
    items.push((id.clone(), payload.to_string()));
    Ok(id)
  }

  async fn xrevrange(&self, key: &str, count: Option<usize>) -> StoreResult<Vec<String>> {
    let mut inner = self.inner.lock().await;
    match inner.live(key) {
      None => Ok(Vec::new()),
      Some(Entry { value: Value::Stream(items), .. }) => Ok(
        items
          .iter()
          .rev()
          .take(count.unwrap_or(usize::MAX))
          .map(|(_, payload)| payload.clone())
          .collect(),
      ),
      Some(_) => Err(wrong_type(key)),
    }
  }

  async fn xlen(&self, key: &str) -> StoreResult<usize> {
    let mut inner = self.inner.lock().await;
    match inner.live(key) {
      None => Ok(0),
      Some(Entry { value: Value::Stream(items), .. }) => Ok(items.len()),
      Some(_) => Err(wrong_type(key)),
    }
  }
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use std::fmt;
use std::time::Duration;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info};

use super::{Store, StoreResult, Subscription};
use crate::error::StoreError;

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;
static STREAM_FIELD: &str = "data";

#[derive(Clone)]
pub struct RedisStore {
  client: redis::Client,
  conn: ConnectionManager,
}

impl fmt::Debug for RedisStore {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RedisStore").field("connection", &"ConnectionManager").finish()
  }
}

impl RedisStore {
  pub async fn connect(redis_url: &str) -> Result<Self> {
    let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
    let conn = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
      ConnectionManager::new(client.clone())
    })
      .await
      .context("Failed to connect to Redis")?;
    info!("Redis connection established");
    Ok(Self { client, conn })
  }
}

fn store_err(key: &str) -> impl Fn(RedisError) -> StoreError + '_ {
  move |e| {
    if e.to_string().contains("WRONGTYPE") {
      StoreError::WrongType { key: key.to_string() }
    } else {
      StoreError::from(e)
    }
  }
}

#[async_trait]
impl Store for RedisStore {
  async fn get(&self, key: &str) -> StoreResult<Option<String>> {
    let mut conn = self.conn.clone();
    conn.get(key).await.map_err(store_err(key))
  }

  async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
    let mut conn = self.conn.clone();
    match ttl {
      Some(ttl) => {
        let millis = ttl.as_millis().max(1) as u64;
        conn.pset_ex::<_, _, ()>(key, value, millis).await.map_err(store_err(key))
      }
      None => conn.set::<_, _, ()>(key, value).await.map_err(store_err(key)),
    }
  }

  async fn del(&self, keys: &[String]) -> StoreResult<usize> {
    if keys.is_empty() {
      return Ok(0);
    }
    let mut conn = self.conn.clone();
    conn.del(keys).await.map_err(StoreError::from)
  }

  async fn exists(&self, key: &str) -> StoreResult<bool> {
    let mut conn = self.conn.clone();
    conn.exists(key).await.map_err(store_err(key))
  }

  async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
    let mut conn = self.conn.clone();
    let millis = ttl.as_millis().max(1) as i64;
    conn.pexpire(key, millis).await.map_err(store_err(key))
  }

  async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
    let mut conn = self.conn.clone();
    let mut found = Vec::new();
    let mut cursor: u64 = 0;
    loop {
      let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
        .arg(cursor)
        .arg("MATCH")
        .arg(pattern)
        .arg("COUNT")
        .arg(100)
        .query_async(&mut conn)
        .await?;
      found.extend(batch);
      cursor = next;
      if cursor == 0 {
        break;
      }
    }
    found.sort();
    found.dedup();
    debug!("SCAN {} matched {} keys", pattern, found.len());
    Ok(found)
  }

  async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
    let mut conn = self.conn.clone();
    conn.zadd::<_, _, _, ()>(key, member, score).await.map_err(store_err(key))
  }

  async fn zpopmin(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
    let mut conn = self.conn.clone();
    let popped: Vec<(String, f64)> = conn.zpopmin(key, 1).await.map_err(store_err(key))?;
    Ok(popped.into_iter().next())
  }

  async fn zcard(&self, key: &str) -> StoreResult<usize> {
    let mut conn = self.conn.clone();
    conn.zcard(key).await.map_err(store_err(key))
  }

  async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
    let mut conn = self.conn.clone();
    conn.publish(channel, payload).await.map_err(StoreError::from)
  }

  async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
    let mut pubsub = self.client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    info!("Subscribed to {}", channel);
    let stream = pubsub
      .into_on_message()
      .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
    Ok(stream.boxed())
  }

  async fn xadd(&self, key: &str, payload: &str) -> StoreResult<String> {
    let mut conn = self.conn.clone();
    redis::cmd("XADD")
      .arg(key)
      .arg("*")
      .arg(STREAM_FIELD)
      .arg(payload)
      .query_async(&mut conn)
      .await
      .map_err(store_err(key))
  }

  async fn xrevrange(&self, key: &str, count: Option<usize>) -> StoreResult<Vec<String>> {
    let mut conn = self.conn.clone();
    let mut cmd = redis::cmd("XREVRANGE");
    cmd.arg(key).arg("+").arg("-");
    if let Some(count) = count {
      cmd.arg("COUNT").arg(count);
    }
    let entries: Vec<(String, Vec<String>)> = cmd.query_async(&mut conn).await.map_err(store_err(key))?;
    Ok(
      entries
        .into_iter()
        .filter_map(|(_, fields)| {
          fields
            .chunks(2)
            .find(|pair| pair.len() == 2 && pair[0] == STREAM_FIELD)
            .map(|pair| pair[1].clone())
        })
        .collect(),
    )
  }

  async fn xlen(&self, key: &str) -> StoreResult<usize> {
    let mut conn = self.conn.clone();
    redis::cmd("XLEN").arg(key).query_async(&mut conn).await.map_err(store_err(key))
  }
}

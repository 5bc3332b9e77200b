use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::registry::RegistryConfig;
use crate::worker_agent::WorkerConfig;

#[derive(Debug, Clone)]
pub struct Config {
  pub redis_url: Option<String>,
  pub server_port: u16,
  pub namespace: String,
  pub batch_size: i64,
  pub worker_name: String,
  pub worker_concurrency: usize,
  pub heartbeat_interval: Duration,
  pub liveness_window: Duration,
  pub refresh_grace: Duration,
  pub task_poll_interval: Duration,
  pub flag_poll_interval: Duration,
  pub worker_record_ttl: Option<Duration>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      redis_url: None,
      server_port: 8080,
      namespace: "cscan".into(),
      batch_size: 50,
      worker_name: default_worker_name(),
      worker_concurrency: 4,
      heartbeat_interval: Duration::from_secs(30),
      liveness_window: Duration::from_secs(60),
      refresh_grace: Duration::from_millis(500),
      task_poll_interval: Duration::from_millis(1000),
      flag_poll_interval: Duration::from_millis(1000),
      worker_record_ttl: None,
    }
  }
}

fn default_worker_name() -> String {
  let id = uuid::Uuid::new_v4().simple().to_string();
  format!("worker-{}", &id[..8])
}

fn var<T: FromStr>(name: &str) -> Result<Option<T>>
where
  T::Err: std::error::Error + Send + Sync + 'static,
{
  match env::var(name) {
    Ok(raw) if !raw.trim().is_empty() => {
      let value = raw.trim().parse::<T>().with_context(|| format!("Invalid value for {name}: {raw:?}"))?;
      Ok(Some(value))
    }
    _ => Ok(None),
  }
}

impl Config {
  pub fn from_env() -> Result<Self> {
    let defaults = Self::default();
    Ok(Self {
      redis_url: var("REDIS_URL")?,
      server_port: var("SERVER_PORT")?.unwrap_or(defaults.server_port),
      namespace: var("DSCAN_NAMESPACE")?.unwrap_or(defaults.namespace),
      batch_size: var("BATCH_SIZE")?.unwrap_or(defaults.batch_size),
      worker_name: var("WORKER_NAME")?.unwrap_or(defaults.worker_name),
      worker_concurrency: var("WORKER_CONCURRENCY")?.unwrap_or(defaults.worker_concurrency),
      heartbeat_interval: var("HEARTBEAT_INTERVAL_SECS")?.map(Duration::from_secs).unwrap_or(defaults.heartbeat_interval),
      liveness_window: var("LIVENESS_WINDOW_SECS")?.map(Duration::from_secs).unwrap_or(defaults.liveness_window),
      refresh_grace: var("REFRESH_GRACE_MS")?.map(Duration::from_millis).unwrap_or(defaults.refresh_grace),
      task_poll_interval: var("TASK_POLL_INTERVAL_MS")?
        .map(Duration::from_millis)
        .unwrap_or(defaults.task_poll_interval),
      flag_poll_interval: var("FLAG_POLL_INTERVAL_MS")?
        .map(Duration::from_millis)
        .unwrap_or(defaults.flag_poll_interval),
      worker_record_ttl: var("WORKER_RECORD_TTL_SECS")?.map(Duration::from_secs),
    })
  }

  pub fn require_redis_url(&self) -> Result<&str> {
    self.redis_url.as_deref().context("REDIS_URL must be set")
  }

  pub fn registry(&self) -> RegistryConfig {
    RegistryConfig {
      liveness_window: self.liveness_window,
      refresh_grace: self.refresh_grace,
      record_ttl: self.worker_record_ttl,
    }
  }

  pub fn worker(&self, ip: String) -> WorkerConfig {
    WorkerConfig {
      name: self.worker_name.clone(),
      ip,
      concurrency: self.worker_concurrency.max(1),
      heartbeat_interval: self.heartbeat_interval,
      task_poll_interval: self.task_poll_interval,
      flag_poll_interval: self.flag_poll_interval,
    }
  }
}

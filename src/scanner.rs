//! Scan engine capability consumed by workers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::splitter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
  pub authority: String,
  pub host: String,
  pub port: u16,
  pub category: String,
}

impl Asset {
  pub fn new(host: &str, port: u16) -> Self {
    let authority = match host.parse::<IpAddr>() {
      Ok(IpAddr::V6(_)) => format!("[{host}]:{port}"),
      _ => format!("{host}:{port}"),
    };
    Self { authority, host: host.to_string(), port, category: category(host).to_string() }
  }
}

pub fn category(host: &str) -> &'static str {
  match host.parse::<IpAddr>() {
    Ok(IpAddr::V4(_)) => "ipv4",
    Ok(IpAddr::V6(_)) => "ipv6",
    Err(_) => "domain",
  }
}

#[async_trait]
pub trait Scanner: Send + Sync {
  fn name(&self) -> &str;

  /// `config` is the task's opaque JSON, interpreted only by the scanner.
  async fn scan(&self, targets: &[String], config: &str) -> Result<Vec<Asset>>;
}

#[derive(Debug, Default)]
struct CollectorState {
  assets: Vec<Asset>,
  open_ports: HashMap<String, usize>,
  skipped: HashSet<String>,
}

/// Gathers open ports from concurrent probes. A host that reports more open
/// ports than the threshold is dropped entirely, which filters out
/// honeypots and firewalls that accept everything. A threshold of zero
/// disables the check.
#[derive(Debug, Default)]
pub struct PortThresholdCollector {
  threshold: usize,
  state: Mutex<CollectorState>,
}

impl PortThresholdCollector {
  pub fn new(threshold: usize) -> Self {
    Self { threshold, state: Mutex::new(CollectorState::default()) }
  }

  pub fn record(&self, host: &str, port: u16) {
    let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if state.skipped.contains(host) {
      return;
    }
    let count = state.open_ports.entry(host.to_string()).or_insert(0);
    *count += 1;
    if self.threshold > 0 && *count > self.threshold {
      info!("Host {} exceeded port threshold ({} > {}), dropping it", host, count, self.threshold);
      state.skipped.insert(host.to_string());
      state.assets.retain(|a| a.host != host);
      return;
    }
    debug!("Open port {}:{}", host, port);
    state.assets.push(Asset::new(host, port));
  }

  pub fn skipped_hosts(&self) -> usize {
    self.state.lock().map(|s| s.skipped.len()).unwrap_or(0)
  }

  pub fn into_assets(self) -> Vec<Asset> {
    self.state.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()).assets
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectOptions {
  pub ports: String,
  /// Per connection, in milliseconds.
  pub timeout: u64,
  pub port_threshold: usize,
  pub concurrency: usize,
}

impl Default for ConnectOptions {
  fn default() -> Self {
    Self { ports: "80,443,8080".into(), timeout: 1000, port_threshold: 0, concurrency: 64 }
  }
}

/// Accepts `22`, `80,443` and `8000-8010`; bad tokens are skipped.
pub fn parse_ports(spec: &str) -> Vec<u16> {
  let mut ports = Vec::new();
  for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
    let parsed = match token.split_once('-') {
      Some((lo, hi)) => match (lo.trim().parse::<u16>(), hi.trim().parse::<u16>()) {
        (Ok(lo), Ok(hi)) if lo <= hi => Some(lo..=hi),
        _ => None,
      },
      None => token.parse::<u16>().ok().map(|p| p..=p),
    };
    match parsed {
      Some(range) => ports.extend(range.filter(|p| *p > 0)),
      None => warn!("Ignoring invalid port token '{}'", token),
    }
  }
  ports.sort_unstable();
  ports.dedup();
  ports
}

/// Plain TCP connect check.
#[derive(Debug, Default, Clone)]
pub struct ConnectScanner;

#[async_trait]
impl Scanner for ConnectScanner {
  fn name(&self) -> &str {
    "connect"
  }

  async fn scan(&self, targets: &[String], config: &str) -> Result<Vec<Asset>> {
    let options: ConnectOptions = if config.trim().is_empty() {
      ConnectOptions::default()
    } else {
      serde_json::from_str(config).context("invalid connect scanner options")?
    };
    let ports = parse_ports(&options.ports);
    let hosts: Vec<String> = targets.iter().flat_map(|t| splitter::parse_all(t)).collect();
    info!("Connect scan over {} hosts x {} ports", hosts.len(), ports.len());

    let collector = PortThresholdCollector::new(options.port_threshold);
    let timeout = Duration::from_millis(options.timeout.max(1));
    let probes: Vec<(String, u16)> =
      hosts.iter().flat_map(|host| ports.iter().map(move |port| (host.clone(), *port))).collect();

    futures::stream::iter(probes)
      .map(|(host, port)| async move {
        let open = matches!(
          tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await,
          Ok(Ok(_))
        );
        (host, port, open)
      })
      .buffer_unordered(options.concurrency.max(1))
      .for_each(|(host, port, open)| {
        if open {
          collector.record(&host, port);
        }
        futures::future::ready(())
      })
      .await;

    if collector.skipped_hosts() > 0 {
      info!("Connect scan skipped {} hosts over the port threshold", collector.skipped_hosts());
    }
    let assets = collector.into_assets();
    info!("Connect scan found {} open ports", assets.len());
    Ok(assets)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  #[test]
  fn ports_parse_lists_and_ranges() {
    assert_eq!(parse_ports("22, 80,8000-8002,bogus,0,80"), vec![22, 80, 8000, 8001, 8002]);
    assert!(parse_ports("9-3").is_empty());
  }

  #[test]
  fn collector_drops_noisy_hosts() {
    let collector = PortThresholdCollector::new(2);
    collector.record("10.0.0.1", 22);
    collector.record("10.0.0.2", 22);
    collector.record("10.0.0.2", 80);
    collector.record("10.0.0.2", 443);
    collector.record("10.0.0.2", 8080);
    assert_eq!(collector.skipped_hosts(), 1);
    let assets = collector.into_assets();
    assert_eq!(assets, vec![Asset::new("10.0.0.1", 22)]);
  }

  #[test]
  fn assets_carry_category() {
    assert_eq!(Asset::new("::1", 22).authority, "[::1]:22");
    assert_eq!(Asset::new("example.com", 443).category, "domain");
    assert_eq!(category("10.0.0.1"), "ipv4");
  }

  #[tokio::test]
  async fn connect_scanner_finds_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = format!(r#"{{"ports":"{port}","timeout":500}}"#);
    let assets = ConnectScanner.scan(&["127.0.0.1".to_string()], &config).await.unwrap();
    assert_eq!(assets, vec![Asset::new("127.0.0.1", port)]);
  }

  #[tokio::test]
  async fn connect_scanner_rejects_bad_config() {
    assert!(ConnectScanner.scan(&["127.0.0.1".to_string()], "not json").await.is_err());
  }
}

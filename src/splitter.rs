//! Target expansion and batching.
//!
//! A target specification is newline separated text where each line is a
//! host, a domain, a CIDR block (`10.0.0.0/24`) or an inclusive address range
//! (`10.0.0.1-10.0.0.9`). Blank lines and `#` comments are ignored.

use ipnetwork::IpNetwork;
use regex::Regex;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::LazyLock;

pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Blocks or ranges wider than this stay unexpanded.
const MAX_EXPANSION_BITS: u32 = 20;

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^([a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,}$").expect("domain pattern compiles")
});

#[derive(Debug, Clone, Copy)]
pub struct TargetSplitter {
  batch_size: usize,
}

impl Default for TargetSplitter {
  fn default() -> Self {
    Self { batch_size: DEFAULT_BATCH_SIZE }
  }
}

impl TargetSplitter {
  pub fn new(batch_size: i64) -> Self {
    if batch_size <= 0 {
      return Self::default();
    }
    Self { batch_size: batch_size as usize }
  }

  pub fn batch_size(&self) -> usize {
    self.batch_size
  }

  /// Splits `spec` into newline-joined batches. A spec that fits in one batch
  /// is returned untouched so the caller's notation survives.
  pub fn split(&self, spec: &str) -> Vec<String> {
    let targets = parse_all(spec);
    if targets.len() <= self.batch_size {
      return vec![spec.to_string()];
    }
    targets.chunks(self.batch_size).map(|chunk| chunk.join("\n")).collect()
  }

  pub fn need_split(&self, spec: &str) -> bool {
    target_count(spec) > self.batch_size
  }
}

pub fn target_count(spec: &str) -> usize {
  parse_all(spec).len()
}

pub fn parse_all(spec: &str) -> Vec<String> {
  let mut targets = Vec::new();
  for line in spec.lines() {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
      continue;
    }
    if line.contains('/') {
      targets.extend(expand_cidr(line));
    } else if line.contains('-') && range_start(line).is_some() {
      targets.extend(expand_range(line));
    } else {
      targets.push(line.to_string());
    }
  }
  targets
}

/// A line is a range only when the text before the first `-` is an address
/// as written, so `10.0.0.1 - 10.0.0.3` stays a literal.
fn range_start(line: &str) -> Option<IpAddr> {
  line.split('-').next().and_then(|start| start.parse().ok())
}

fn parse_cidr(cidr: &str) -> Option<IpNetwork> {
  let (addr, prefix) = cidr.split_once('/')?;
  let addr: IpAddr = addr.trim().parse().ok()?;
  let prefix: u8 = prefix.trim().parse().ok()?;
  IpNetwork::new(addr, prefix).ok()
}

fn expand_cidr(cidr: &str) -> Vec<String> {
  let Some(network) = parse_cidr(cidr) else {
    return vec![cidr.to_string()];
  };
  let host_bits = match network {
    IpNetwork::V4(_) => 32 - network.prefix() as u32,
    IpNetwork::V6(_) => 128 - network.prefix() as u32,
  };
  if host_bits > MAX_EXPANSION_BITS {
    return vec![cidr.to_string()];
  }
  let mut ips = walk(network.network(), 1u128 << host_bits);
  if ips.len() > 2 {
    ips.pop();
    ips.remove(0);
  }
  ips
}

fn expand_range(range: &str) -> Vec<String> {
  let parts: Vec<&str> = range.split('-').collect();
  if parts.len() != 2 {
    return vec![range.to_string()];
  }
  let (Ok(start), Ok(end)) = (parts[0].parse::<IpAddr>(), parts[1].parse::<IpAddr>()) else {
    return vec![range.to_string()];
  };
  let span = match (start, end) {
    (IpAddr::V4(s), IpAddr::V4(e)) => (u32::from(e) as u128).checked_sub(u32::from(s) as u128),
    (IpAddr::V6(s), IpAddr::V6(e)) => u128::from(e).checked_sub(u128::from(s)),
    _ => None,
  };
  match span {
    Some(span) if span < (1u128 << MAX_EXPANSION_BITS) => walk(start, span + 1),
    _ => vec![range.to_string()],
  }
}

fn walk(start: IpAddr, count: u128) -> Vec<String> {
  let mut ips = Vec::with_capacity(count as usize);
  match start {
    IpAddr::V4(v4) => {
      let mut bytes = v4.octets();
      for _ in 0..count {
        ips.push(IpAddr::from(bytes).to_string());
        increment(&mut bytes);
      }
    }
    IpAddr::V6(v6) => {
      let mut bytes = v6.octets();
      for _ in 0..count {
        ips.push(IpAddr::from(bytes).to_string());
        increment(&mut bytes);
      }
    }
  }
  ips
}

/// Big-endian increment with carry.
fn increment(bytes: &mut [u8]) {
  for byte in bytes.iter_mut().rev() {
    *byte = byte.wrapping_add(1);
    if *byte != 0 {
      break;
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetError {
  pub line: usize,
  pub target: String,
  pub message: String,
}

/// Checks every non-comment line; returns one error per bad line.
pub fn validate_targets(spec: &str) -> Vec<TargetError> {
  spec
    .lines()
    .enumerate()
    .filter_map(|(idx, line)| {
      let line = line.trim();
      if line.is_empty() || line.starts_with('#') {
        return None;
      }
      validate_single(line).map(|message| TargetError { line: idx + 1, target: line.to_string(), message })
    })
    .collect()
}

pub fn format_target_errors(errors: &[TargetError]) -> String {
  let lines: Vec<String> = errors
    .iter()
    .map(|e| format!("line {} '{}': {}", e.line, e.target, e.message))
    .collect();
  match lines.len() {
    0 => String::new(),
    1 => lines[0].clone(),
    n => format!("{n} invalid targets:\n{}", lines.join("\n")),
  }
}

fn validate_single(target: &str) -> Option<String> {
  if target.parse::<IpAddr>().is_ok() {
    return None;
  }
  let host = strip_port(target);
  if host.contains('/') {
    return validate_cidr(host);
  }
  if host.contains('-') && range_start(host).is_some() {
    return validate_range(host);
  }
  if host.parse::<IpAddr>().is_ok() || DOMAIN_RE.is_match(host) {
    return None;
  }
  Some("not a valid IP, CIDR, IP range or domain".to_string())
}

/// Drops a trailing `:port`. IPv6 hosts only carry a port in brackets
/// (`[::1]:443`); any other host with more than one colon is left alone.
fn strip_port(target: &str) -> &str {
  let Some((host, port)) = target.rsplit_once(':') else {
    return target;
  };
  if !matches!(port.parse::<u32>(), Ok(1..=65535)) {
    return target;
  }
  if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
    return inner;
  }
  if host.contains(':') { target } else { host }
}

fn validate_cidr(cidr: &str) -> Option<String> {
  let Some((addr, prefix)) = cidr.split_once('/') else {
    return Some("invalid CIDR".to_string());
  };
  let Ok(addr) = addr.parse::<IpAddr>() else {
    return Some(format!("invalid network address '{addr}'"));
  };
  let max = if addr.is_ipv4() { 32 } else { 128 };
  match prefix.parse::<u8>() {
    Ok(p) if p <= max => None,
    _ => Some(format!("invalid prefix length '{prefix}'")),
  }
}

fn validate_range(range: &str) -> Option<String> {
  let parts: Vec<&str> = range.split('-').collect();
  if parts.len() != 2 {
    return Some("invalid IP range".to_string());
  }
  let Ok(end) = parts[1].parse::<IpAddr>() else {
    return Some(format!("invalid end address '{}'", parts[1]));
  };
  let Ok(start) = parts[0].parse::<IpAddr>() else {
    return Some(format!("invalid start address '{}'", parts[0]));
  };
  match (start, end) {
    (IpAddr::V4(s), IpAddr::V4(e)) if s <= e => None,
    (IpAddr::V6(s), IpAddr::V6(e)) if s <= e => None,
    (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
      Some("start address is greater than end address".to_string())
    }
    _ => Some("range mixes IPv4 and IPv6".to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cidr_drops_network_and_broadcast() {
    let hosts = parse_all("192.168.1.0/24");
    assert_eq!(hosts.len(), 254);
    assert_eq!(hosts.first().map(String::as_str), Some("192.168.1.1"));
    assert_eq!(hosts.last().map(String::as_str), Some("192.168.1.254"));
    assert_eq!(parse_all("10.0.0.0/30"), vec!["10.0.0.1", "10.0.0.2"]);
    assert_eq!(parse_all("10.0.0.0/31"), vec!["10.0.0.0", "10.0.0.1"]);
    assert_eq!(parse_all("10.0.0.7/32"), vec!["10.0.0.7"]);
  }

  #[test]
  fn cidr_with_host_bits_starts_at_network() {
    assert_eq!(parse_all("10.0.0.3/30"), vec!["10.0.0.1", "10.0.0.2"]);
  }

  #[test]
  fn range_is_inclusive_and_carries() {
    assert_eq!(parse_all("10.0.0.1-10.0.0.3"), vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    assert_eq!(parse_all("10.0.0.255-10.0.1.1"), vec!["10.0.0.255", "10.0.1.0", "10.0.1.1"]);
    assert_eq!(parse_all("fe80::ff-fe80::101").len(), 3);
  }

  #[test]
  fn hyphenated_hosts_and_malformed_lines_pass_through() {
    let spec = "# office\n\nmy-host.example.com\n10.0.0.9-\n10.0.0.0/99\nexample.org";
    assert_eq!(
      parse_all(spec),
      vec!["my-host.example.com", "10.0.0.9-", "10.0.0.0/99", "example.org"]
    );
    assert_eq!(parse_all("10.0.0.5-10.0.0.1"), vec!["10.0.0.5-10.0.0.1"]);
  }

  #[test]
  fn oversized_blocks_stay_verbatim() {
    assert_eq!(parse_all("2001:db8::/64"), vec!["2001:db8::/64"]);
  }

  #[test]
  fn split_chunks_in_order() {
    let splitter = TargetSplitter::new(50);
    let spec = "10.0.0.1-10.0.0.120";
    let batches = splitter.split(spec);
    let sizes: Vec<usize> = batches.iter().map(|b| b.lines().count()).collect();
    assert_eq!(sizes, vec![50, 50, 20]);
    let rejoined: Vec<String> = batches.iter().flat_map(|b| b.lines().map(str::to_string)).collect();
    assert_eq!(rejoined, parse_all(spec));
    assert!(splitter.need_split(spec));
  }

  #[test]
  fn small_spec_is_not_expanded() {
    let splitter = TargetSplitter::new(50);
    let spec = "10.0.0.0/28\nexample.com";
    assert_eq!(splitter.split(spec), vec![spec.to_string()]);
    assert!(!splitter.need_split(spec));
    assert_eq!(target_count(spec), 15);
  }

  #[test]
  fn non_positive_batch_size_uses_default() {
    assert_eq!(TargetSplitter::new(0).batch_size(), DEFAULT_BATCH_SIZE);
    assert_eq!(TargetSplitter::new(-3).batch_size(), DEFAULT_BATCH_SIZE);
  }

  #[test]
  fn validation_reports_bad_lines() {
    let spec = "10.0.0.1\nexample.com:8443\n10.0.0/24\n10.0.0.9-10.0.0.1\n::1\nnot a host\n10.0.0.0/33";
    let errors = validate_targets(spec);
    let lines: Vec<usize> = errors.iter().map(|e| e.line).collect();
    assert_eq!(lines, vec![3, 4, 6, 7]);
    assert!(format_target_errors(&errors).starts_with("4 invalid targets"));
  }

  #[test]
  fn ipv6_ranges_validate_like_ipv4() {
    assert!(validate_targets("fe80::1-fe80::9").is_empty());
    assert!(validate_targets("fe80::1-fe80::a").is_empty());
    assert_eq!(parse_all("fe80::1-fe80::9").len(), 9);
    assert!(validate_targets("fe80::1:443").is_empty());
    assert!(validate_targets("[fe80::1]:443\nexample.com:8443").is_empty());
    assert_eq!(validate_targets("fe80::9-fe80::1")[0].message, "start address is greater than end address");
  }

  #[test]
  fn spaced_ranges_are_literals() {
    assert_eq!(parse_all("10.0.0.1 - 10.0.0.3"), vec!["10.0.0.1 - 10.0.0.3"]);
    assert_eq!(parse_all("10.0.0.1- 10.0.0.3"), vec!["10.0.0.1- 10.0.0.3"]);
    assert_eq!(validate_targets("10.0.0.1 - 10.0.0.3").len(), 1);
  }
}

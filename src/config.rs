use std::fmt;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, info};

const DEFAULT_DNS_PORT: u16 = 53;
const MIN_UDP_SIZE: usize = 512;
const MAX_UDP_SIZE: usize = 65535;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub version: Option<String>,
    /// 上游DNS列表，顺序即优先级（host:port）。
    #[serde(default)]
    pub nameservers: Vec<String>,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// UDP/TCP 共用的监听地址，缺省0.0.0.0:8053。
    #[serde(default = "default_bind")]
    pub bind: String,
    /// 单个上游请求的超时（毫秒）。
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    /// 依次启动上游请求之间的间隔（毫秒）。
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,
    /// 监听端读超时（毫秒）。
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// 监听端写超时（毫秒）。
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// UDP 监听可接收的最大报文长度。
    #[serde(default = "default_udp_size")]
    pub udp_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            stagger_ms: default_stagger_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            udp_size: default_udp_size(),
        }
    }
}

impl Settings {
    #[inline]
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    #[inline]
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    #[inline]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    #[inline]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// 拒绝零超时，以及超出 512..=65535 的 udp_size。
    pub fn validate(&self) -> Result<()> {
        if !(MIN_UDP_SIZE..=MAX_UDP_SIZE).contains(&self.udp_size) {
            anyhow::bail!(
                "udp_size must be within {MIN_UDP_SIZE}..={MAX_UDP_SIZE}, got {}",
                self.udp_size
            );
        }
        for (field, value) in [
            ("upstream_timeout_ms", self.upstream_timeout_ms),
            ("stagger_ms", self.stagger_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
        ] {
            if value == 0 {
                anyhow::bail!("{field} must be greater than 0");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => f.write_str("udp"),
            Transport::Tcp => f.write_str("tcp"),
        }
    }
}

pub fn load_config(path: &Path) -> Result<RelayConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let mut cfg: RelayConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    cfg.settings
        .validate()
        .with_context(|| format!("invalid settings in {}", path.display()))?;
    cfg.nameservers = normalize_nameservers(&cfg.nameservers)?;
    Ok(cfg)
}

pub fn normalize_nameservers(entries: &[String]) -> Result<Vec<String>> {
    entries.iter().map(|s| normalize_nameserver(s)).collect()
}

/// Turns a nameserver entry into a `host:port` endpoint, appending port 53
/// when the entry carries none.
pub fn normalize_nameserver(entry: &str) -> Result<String> {
    let entry = entry.trim();
    if entry.is_empty() {
        anyhow::bail!("empty nameserver entry");
    }
    if let Ok(addr) = entry.parse::<SocketAddr>() {
        return Ok(addr.to_string());
    }
    if let Ok(ip) = entry.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_DNS_PORT).to_string());
    }
    match entry.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                anyhow::bail!("nameserver {entry} has no host");
            }
            port.parse::<u16>()
                .with_context(|| format!("invalid port in nameserver {entry}"))?;
            Ok(entry.to_string())
        }
        None => Ok(format!("{entry}:{DEFAULT_DNS_PORT}")),
    }
}

pub fn load_resolv_conf(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read resolv config file: {}", path.display()))?;
    Ok(parse_resolv_conf(&raw))
}

/// Collects the `nameserver` lines of a resolv.conf in file order.
pub fn parse_resolv_conf(raw: &str) -> Vec<String> {
    let mut nameservers = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut fields = line.split_whitespace();
        if fields.next() != Some("nameserver") {
            continue;
        }
        let Some(addr) = fields.next() else {
            continue;
        };
        // scoped link-local addresses (fe80::1%eth0) cannot be expressed as host:port
        let endpoint = match addr.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, DEFAULT_DNS_PORT).to_string(),
            Err(_) => continue,
        };
        debug!(target = "config", nameserver = %endpoint, "nameserver");
        nameservers.push(endpoint);
    }
    nameservers
}

fn default_bind() -> String {
    "0.0.0.0:8053".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    5000
}

fn default_stagger_ms() -> u64 {
    200
}

fn default_read_timeout_ms() -> u64 {
    5000
}

fn default_write_timeout_ms() -> u64 {
    5000
}

fn default_udp_size() -> usize {
    65535
}

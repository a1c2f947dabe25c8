use serde::{Deserialize, Serialize};

/// Upstream settings document, polled from `UPSTREAM_SETTINGS_URL`
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamSettings {
    /// Connect timeout in seconds (0 = default)
    pub dial_timeout: u64,
    /// Seconds between refreshes (0 = keep the configured interval)
    pub interval_time: u64,
    /// DNS cache lifetime in seconds (0 = no cache)
    pub dnscache_time: u64,
    pub services: Vec<UpstreamService>,
}

/// One upstream endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamService {
    /// `socks5` or `shadowsocks`
    #[serde(rename = "type")]
    pub kind: String,
    /// Cipher name, empty for none
    pub crypto: String,
    /// Cipher secret
    #[serde(skip_serializing)]
    pub password: String,
    /// `host:port` of the upstream server
    pub address: String,
}

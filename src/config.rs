use crate::error::{ProxyError, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener configuration
    pub proxy: ProxyServerConfig,
    /// Remote rules and upstream settings documents
    pub remote: RemoteConfig,
    /// Install the embedded CA into the system trust stores at startup
    pub install_ca: bool,
    /// Logging configuration
    pub log: LogConfig,
}

/// What a listener does after a fatal bind or accept failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Rebind after a growing backoff
    Restart,
    /// Raise the process exit signal
    Exit,
}

impl FromStr for FailurePolicy {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "restart" => Ok(Self::Restart),
            "exit" => Ok(Self::Exit),
            other => Err(ProxyError::InvalidConfig(format!(
                "PROXY_FAILURE_POLICY must be restart or exit, got {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Port for the plain HTTP listener (default: 8080)
    pub http_port: u16,
    /// Port for the TLS-terminating listener; 0 disables it (default: 8443)
    pub https_port: u16,
    /// Decode disguise headers on accepted connections
    pub obfuscation: bool,
    pub failure_policy: FailurePolicy,
    /// Ceiling for the listener restart backoff
    pub restart_max_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Rules document location; `None` runs with an empty rule set
    pub rules_url: Option<Url>,
    pub rules_refresh_interval: Duration,
    /// Upstream settings location; `None` keeps a direct-only pool
    pub upstream_url: Option<Url>,
    /// Used until a settings document supplies its own interval
    pub upstream_refresh_interval: Duration,
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            proxy: ProxyServerConfig {
                host: get_env_or("PROXY_HOST", "127.0.0.1"),
                http_port: parse_env("PROXY_HTTP_PORT", "8080", "a valid port number")?,
                https_port: parse_env("PROXY_HTTPS_PORT", "8443", "a valid port number")?,
                obfuscation: parse_env("PROXY_OBFUSCATION", "true", "true or false")?,
                failure_policy: get_env_or("PROXY_FAILURE_POLICY", "restart").parse()?,
                restart_max_backoff: seconds_env("PROXY_RESTART_MAX_BACKOFF", "600")?,
            },
            remote: RemoteConfig {
                rules_url: url_env("RULES_URL")?,
                rules_refresh_interval: seconds_env("RULES_REFRESH_INTERVAL", "3600")?,
                upstream_url: url_env("UPSTREAM_SETTINGS_URL")?,
                upstream_refresh_interval: seconds_env("UPSTREAM_REFRESH_INTERVAL", "3600")?,
                fetch_timeout: seconds_env("FETCH_TIMEOUT", "30")?,
            },
            install_ca: parse_env("INSTALL_CA", "false", "true or false")?,
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
        })
    }

    /// Address of the plain HTTP listener
    pub fn http_addr(&self) -> String {
        join_host_port(&self.proxy.host, self.proxy.http_port)
    }

    /// Address of the HTTPS listener, if enabled
    pub fn https_addr(&self) -> Option<String> {
        match self.proxy.https_port {
            0 => None,
            port => Some(join_host_port(&self.proxy.host, port)),
        }
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn parse_env<T: FromStr>(key: &str, default: &str, expected: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| ProxyError::InvalidConfig(format!("{} must be {}", key, expected)))
}

fn seconds_env(key: &str, default: &str) -> Result<Duration> {
    let secs: u64 = parse_env(key, default, "a number of seconds")?;
    if secs == 0 {
        return Err(ProxyError::InvalidConfig(format!("{} must be positive", key)));
    }
    Ok(Duration::from_secs(secs))
}

fn url_env(key: &str) -> Result<Option<Url>> {
    let raw = get_env_or(key, "");
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let url = Url::parse(raw)
        .map_err(|e| ProxyError::InvalidConfig(format!("{} must be a valid URL: {}", key, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(Some(url)),
        other => Err(ProxyError::InvalidConfig(format!(
            "{} has unsupported scheme: {}",
            key, other
        ))),
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

//! Outbound dial capabilities
//!
//! Every way of reaching an upstream is a [`Dialer`]. Concrete dialers wrap
//! one another: a SOCKS5 or shadowsocks dialer reaches its server through a
//! cipher-decorated direct dialer, and the [`DialerPool`] rotates over those.

mod decorate;
mod pool;
mod shadowsocks;
mod socks5;

pub use decorate::{CipherDecorator, ConnectionDecorator, DecoratedDialer};
pub use pool::DialerPool;
pub use shadowsocks::{build_address_header, ShadowsocksDialer};
pub use socks5::Socks5Dialer;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, instrument, warn};

use crate::crypto::{Cipher, CipherError};
use crate::models::{UpstreamService, UpstreamSettings};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors produced while establishing an outbound connection
#[derive(Error, Debug)]
pub enum DialError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("Connect to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Connect to {address} timed out")]
    Timeout { address: String },

    #[error("{protocol} handshake with {server} failed: {reason}")]
    Handshake {
        protocol: &'static str,
        server: String,
        reason: String,
    },

    #[error("Cipher setup failed: {0}")]
    Cipher(#[from] CipherError),

    #[error("All upstream dialers exhausted for {address}: {last}")]
    Exhausted { address: String, last: String },
}

impl DialError {
    /// Failures of the dial itself: resolution, refusal, unreachable or timeout.
    ///
    /// Only these evict an entry from the pool.
    pub fn is_dial_operation(&self) -> bool {
        matches!(
            self,
            DialError::Resolve { .. } | DialError::Connect { .. } | DialError::Timeout { .. }
        )
    }
}

/// Trait for outbound connections
pub trait ProxyConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyConnection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedConnection = Box<dyn ProxyConnection>;

/// A capability that opens a TCP connection to `host:port`
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, address: &str) -> Result<BoxedConnection, DialError>;

    /// Short label for logs
    fn describe(&self) -> String;
}

/// Plain TCP dialer with a connect timeout and an optional DNS cache
pub struct DirectDialer {
    timeout: Duration,
    dns_ttl: Duration,
    dns_cache: DashMap<String, (Vec<IpAddr>, Instant)>,
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new(DEFAULT_DIAL_TIMEOUT, Duration::ZERO)
    }
}

impl DirectDialer {
    /// A zero `dns_ttl` disables caching
    pub fn new(timeout: Duration, dns_ttl: Duration) -> Self {
        Self {
            timeout,
            dns_ttl,
            dns_cache: DashMap::new(),
        }
    }

    /// Build from the numeric fields of an upstream settings document
    pub fn from_settings(settings: &UpstreamSettings) -> Self {
        let timeout = if settings.dial_timeout == 0 {
            DEFAULT_DIAL_TIMEOUT
        } else {
            Duration::from_secs(settings.dial_timeout)
        };
        Self::new(timeout, Duration::from_secs(settings.dnscache_time))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, DialError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let key = host.to_lowercase();
        if !self.dns_ttl.is_zero() {
            let cached = self.dns_cache.get(&key).and_then(|entry| {
                let (ips, at) = entry.value();
                (at.elapsed() < self.dns_ttl).then(|| ips.clone())
            });
            if let Some(ips) = cached {
                return Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect());
            }
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|source| DialError::Resolve {
                host: host.to_string(),
                source,
            })?
            .collect();

        if addrs.is_empty() {
            return Err(DialError::Resolve {
                host: host.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            });
        }

        if !self.dns_ttl.is_zero() {
            let ips = addrs.iter().map(|a| a.ip()).collect();
            self.dns_cache.insert(key, (ips, Instant::now()));
        }
        Ok(addrs)
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    #[instrument(skip(self), level = "debug")]
    async fn dial(&self, address: &str) -> Result<BoxedConnection, DialError> {
        let (host, port) = parse_host_port(address)?;
        let candidates = self.resolve(&host, port).await?;

        let mut last_error = None;
        for addr in candidates {
            match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                    debug!(%addr, "Direct connection established");
                    return Ok(Box::new(stream));
                }
                Ok(Err(source)) => {
                    last_error = Some(DialError::Connect {
                        address: address.to_string(),
                        source,
                    });
                }
                Err(_) => {
                    last_error = Some(DialError::Timeout {
                        address: address.to_string(),
                    });
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DialError::Timeout {
            address: address.to_string(),
        }))
    }

    fn describe(&self) -> String {
        "direct".to_string()
    }
}

/// Build one pool entry from a `services[]` item
///
/// Returns `None`, after logging, for unknown types or unusable ciphers.
pub fn build_endpoint(
    service: &UpstreamService,
    base: Arc<dyn Dialer>,
) -> Option<Arc<dyn Dialer>> {
    let cipher = match Cipher::from_config(&service.crypto, &service.password) {
        Ok(cipher) => cipher,
        Err(e) => {
            warn!(address = %service.address, error = %e, "Skipping upstream with unusable cipher");
            return None;
        }
    };

    let forward: Arc<dyn Dialer> = Arc::new(DecoratedDialer::new(
        base,
        Arc::new(CipherDecorator::new(cipher)),
    ));

    match service.kind.to_lowercase().as_str() {
        "socks5" => Some(Arc::new(Socks5Dialer::new(&service.address, forward))),
        "shadowsocks" => Some(Arc::new(ShadowsocksDialer::new(&service.address, forward))),
        other => {
            warn!(kind = other, address = %service.address, "Skipping upstream of unknown type");
            None
        }
    }
}

/// Build every usable endpoint of a settings document
pub fn build_endpoints(settings: &UpstreamSettings) -> Vec<Arc<dyn Dialer>> {
    let base: Arc<dyn Dialer> = Arc::new(DirectDialer::from_settings(settings));
    settings
        .services
        .iter()
        .filter_map(|service| build_endpoint(service, base.clone()))
        .collect()
}

/// Split `host:port`, accepting bracketed IPv6 literals
pub fn parse_host_port(addr: &str) -> Result<(String, u16), DialError> {
    let invalid = |reason: &str| DialError::InvalidAddress {
        address: addr.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    Ok((host.to_string(), port))
}

/// Join host and port, bracketing IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use super::{parse_host_port, BoxedConnection, DialError, Dialer};

/// Reaches targets through a shadowsocks-style tunnel server
///
/// The target is announced with a SOCKS5 address header as the first bytes
/// of the (normally enciphered) stream; payload follows immediately.
pub struct ShadowsocksDialer {
    server: String,
    forward: Arc<dyn Dialer>,
}

impl ShadowsocksDialer {
    pub fn new(server: &str, forward: Arc<dyn Dialer>) -> Self {
        Self {
            server: server.to_string(),
            forward,
        }
    }
}

/// Encode `host:port` as `ATYP | ADDR | PORT`
pub fn build_address_header(host: &str, port: u16) -> Result<Vec<u8>, DialError> {
    let mut header = Vec::with_capacity(host.len() + 4);

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            header.push(0x01);
            header.extend_from_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            header.push(0x04);
            header.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(DialError::InvalidAddress {
                    address: host.to_string(),
                    reason: "domain name too long".to_string(),
                });
            }
            header.push(0x03);
            header.push(host.len() as u8);
            header.extend_from_slice(host.as_bytes());
        }
    }

    header.extend_from_slice(&port.to_be_bytes());
    Ok(header)
}

#[async_trait]
impl Dialer for ShadowsocksDialer {
    #[instrument(skip(self), fields(server = %self.server))]
    async fn dial(&self, address: &str) -> Result<BoxedConnection, DialError> {
        let (host, port) = parse_host_port(address)?;
        let header = build_address_header(&host, port)?;

        let mut conn = self.forward.dial(&self.server).await?;
        let handshake_error = |e: std::io::Error| DialError::Handshake {
            protocol: "shadowsocks",
            server: self.server.clone(),
            reason: e.to_string(),
        };
        conn.write_all(&header).await.map_err(handshake_error)?;
        conn.flush().await.map_err(handshake_error)?;

        debug!("Shadowsocks tunnel established");
        Ok(conn)
    }

    fn describe(&self) -> String {
        format!("shadowsocks://{}", self.server)
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, instrument};

use super::{parse_host_port, BoxedConnection, DialError, Dialer};

/// Reaches targets through a SOCKS5 server
///
/// The connection to the server itself comes from `forward`, which is
/// usually a cipher-decorated direct dialer.
pub struct Socks5Dialer {
    server: String,
    forward: Arc<dyn Dialer>,
}

impl Socks5Dialer {
    pub fn new(server: &str, forward: Arc<dyn Dialer>) -> Self {
        Self {
            server: server.to_string(),
            forward,
        }
    }
}

#[async_trait]
impl Dialer for Socks5Dialer {
    #[instrument(skip(self), fields(server = %self.server))]
    async fn dial(&self, address: &str) -> Result<BoxedConnection, DialError> {
        let (host, port) = parse_host_port(address)?;
        let socket = self.forward.dial(&self.server).await?;

        let stream = Socks5Stream::connect_with_socket(socket, (host.as_str(), port))
            .await
            .map_err(|e| DialError::Handshake {
                protocol: "socks5",
                server: self.server.clone(),
                reason: e.to_string(),
            })?;

        debug!("SOCKS5 connection established");
        Ok(Box::new(stream.into_inner()))
    }

    fn describe(&self) -> String {
        format!("socks5://{}", self.server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::DirectDialer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal no-auth SOCKS5 server that accepts one CONNECT and echoes
    async fn serve_one(listener: TcpListener) -> Vec<u8> {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut greeting = [0u8; 2];
        stream.read_exact(&mut greeting).await.unwrap();
        let mut methods = vec![0u8; greeting[1] as usize];
        stream.read_exact(&mut methods).await.unwrap();
        stream.write_all(&[0x05, 0x00]).await.unwrap();

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await.unwrap();
        assert_eq!(head[1], 0x01);
        assert_eq!(head[3], 0x03);
        let mut len = [0u8; 1];
        stream.read_exact(&mut len).await.unwrap();
        let mut target = vec![0u8; len[0] as usize + 2];
        stream.read_exact(&mut target).await.unwrap();

        stream
            .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        let mut payload = [0u8; 4];
        stream.read_exact(&mut payload).await.unwrap();
        stream.write_all(&payload).await.unwrap();
        target
    }

    #[tokio::test]
    async fn test_socks5_connect_and_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(serve_one(listener));

        let dialer = Socks5Dialer::new(&server_addr, Arc::new(DirectDialer::default()));
        let mut conn = dialer.dial("example.com:8080").await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let target = server.await.unwrap();
        assert_eq!(&target[..11], b"example.com");
        assert_eq!(&target[11..], &8080u16.to_be_bytes());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_dial_operation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let dialer = Socks5Dialer::new(&server_addr, Arc::new(DirectDialer::default()));
        let err = dialer.dial("example.com:80").await.err().unwrap();
        assert!(err.is_dial_operation());
    }

    #[tokio::test]
    async fn test_rejected_handshake_is_not_dial_operation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            let _ = stream.read(&mut greeting).await;
            // No acceptable auth method.
            let _ = stream.write_all(&[0x05, 0xFF]).await;
        });

        let dialer = Socks5Dialer::new(&server_addr, Arc::new(DirectDialer::default()));
        let err = dialer.dial("example.com:80").await.err().unwrap();
        assert!(matches!(err, DialError::Handshake { protocol: "socks5", .. }));
        server.await.unwrap();
    }
}

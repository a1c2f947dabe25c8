//! CONNECT tunnels
//!
//! Bytes are relayed untouched in both directions; rules never apply inside
//! a tunnel.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

/// Handles CONNECT tunnel relaying
pub struct TunnelHandler;

impl TunnelHandler {
    /// Copy data bidirectionally, shutting down each write half at EOF
    ///
    /// Returns the byte counts sent to and received from the server.
    #[instrument(skip(client, server))]
    pub async fn copy_bidirectional<C, S>(client: C, server: S) -> (u64, u64)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        let upstream = async {
            let result = tokio::io::copy(&mut client_read, &mut server_write).await;
            let _ = server_write.shutdown().await;
            result
        };

        let downstream = async {
            let result = tokio::io::copy(&mut server_read, &mut client_write).await;
            let _ = client_write.shutdown().await;
            result
        };

        let (sent, received) = tokio::join!(upstream, downstream);

        let sent = sent.unwrap_or_else(|e| {
            debug!("Client to server copy ended: {}", e);
            0
        });
        let received = received.unwrap_or_else(|e| {
            debug!("Server to client copy ended: {}", e);
            0
        });

        debug!(sent, received, "Tunnel closed");
        (sent, received)
    }
}

//! Remote configuration documents

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{ProxyError, Result};

/// Somewhere a JSON configuration document can be loaded from
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(&self) -> Result<Bytes>;

    /// Where the document lives, for logs
    fn location(&self) -> String;
}

/// Document served over HTTP(S)
pub struct HttpDocumentSource {
    client: reqwest::Client,
    url: Url,
}

impl HttpDocumentSource {
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::InvalidConfig(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, url })
    }

    fn fetch_error(&self, reason: impl ToString) -> ProxyError {
        ProxyError::ConfigFetch {
            url: self.url.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl DocumentSource for HttpDocumentSource {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<Bytes> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| self.fetch_error(e))?
            .error_for_status()
            .map_err(|e| self.fetch_error(e))?;

        let body = response.bytes().await.map_err(|e| self.fetch_error(e))?;
        debug!(len = body.len(), "Fetched document");
        Ok(body)
    }

    fn location(&self) -> String {
        self.url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(response: &'static str) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                if stream.read(&mut byte).await.unwrap_or(0) == 0 {
                    return;
                }
                head.push(byte[0]);
            }
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
        Url::parse(&format!("http://{}/doc.json", addr)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_returns_body() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 14\r\nConnection: close\r\n\r\n{\"local\":true}",
        )
        .await;
        let source = HttpDocumentSource::new(url, Duration::from_secs(5)).unwrap();
        assert_eq!(source.fetch().await.unwrap(), Bytes::from_static(b"{\"local\":true}"));
    }

    #[tokio::test]
    async fn test_http_error_status_is_config_fetch_error() {
        let url = serve_once("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        let source = HttpDocumentSource::new(url.clone(), Duration::from_secs(5)).unwrap();

        let err = source.fetch().await.unwrap_err();
        match err {
            ProxyError::ConfigFetch { url: failed, .. } => assert_eq!(failed, url.to_string()),
            other => panic!("unexpected error: {}", other),
        }
    }
}

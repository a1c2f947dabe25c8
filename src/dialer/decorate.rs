use std::sync::Arc;

use async_trait::async_trait;

use super::{BoxedConnection, DialError, Dialer};
use crate::crypto::{Cipher, CipherKind};

/// Transforms a freshly dialed connection before it is handed out
#[async_trait]
pub trait ConnectionDecorator: Send + Sync {
    async fn decorate(&self, conn: BoxedConnection) -> Result<BoxedConnection, DialError>;

    fn describe(&self) -> String;
}

/// Applies a stream cipher and performs its IV handshake
pub struct CipherDecorator {
    cipher: Cipher,
}

impl CipherDecorator {
    pub fn new(cipher: Cipher) -> Self {
        Self { cipher }
    }
}

#[async_trait]
impl ConnectionDecorator for CipherDecorator {
    async fn decorate(&self, conn: BoxedConnection) -> Result<BoxedConnection, DialError> {
        if self.cipher.kind() == CipherKind::None {
            return Ok(conn);
        }

        let mut stream = self.cipher.wrap(conn);
        stream.open().await.map_err(|e| DialError::Handshake {
            protocol: "cipher",
            server: self.cipher.kind().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        self.cipher.kind().to_string()
    }
}

/// A dialer whose connections pass through a decorator
///
/// Decorated dialers nest, so several decorators can be stacked.
pub struct DecoratedDialer {
    inner: Arc<dyn Dialer>,
    decorator: Arc<dyn ConnectionDecorator>,
}

impl DecoratedDialer {
    pub fn new(inner: Arc<dyn Dialer>, decorator: Arc<dyn ConnectionDecorator>) -> Self {
        Self { inner, decorator }
    }
}

#[async_trait]
impl Dialer for DecoratedDialer {
    async fn dial(&self, address: &str) -> Result<BoxedConnection, DialError> {
        let conn = self.inner.dial(address).await?;
        self.decorator.decorate(conn).await
    }

    fn describe(&self) -> String {
        format!("{}+{}", self.inner.describe(), self.decorator.describe())
    }
}

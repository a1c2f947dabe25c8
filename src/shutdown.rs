//! Process-wide exit signal

use std::sync::Arc;

use tokio::sync::watch;

/// One-shot, cloneable exit signal
///
/// The first `trigger` wins; later reasons are dropped.
#[derive(Clone)]
pub struct ExitSignal {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for ExitSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true when this call raised the signal
    pub fn trigger(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn is_triggered(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Resolves with the reason once the signal is raised
    pub async fn wait(&self) -> String {
        let mut rx = self.tx.subscribe();
        let reason = match rx.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => String::new(),
        };
        reason
    }
}

//! Upstream pool refresh service
//!
//! Polls the upstream settings document and rebuilds the dialer pool from it.
//! The document may carry its own polling interval, which then replaces the
//! configured one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::dialer::{build_endpoints, DialerPool};
use crate::error::Result;
use crate::models::UpstreamSettings;
use crate::services::fetch::DocumentSource;
use crate::shutdown::ExitSignal;

pub struct UpstreamRefreshService {
    source: Arc<dyn DocumentSource>,
    pool: Arc<DialerPool>,
    exit: ExitSignal,
    /// Current polling interval in seconds
    current_interval_secs: AtomicU64,
}

impl UpstreamRefreshService {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        pool: Arc<DialerPool>,
        exit: ExitSignal,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            pool,
            exit,
            current_interval_secs: AtomicU64::new(interval.as_secs().max(1)),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.current_interval_secs.load(Ordering::Relaxed))
    }

    /// Fetch the settings document once and replace the pool
    ///
    /// Returns the number of usable endpoints installed.
    pub async fn refresh(&self) -> Result<usize> {
        let body = self.source.fetch().await?;
        let settings: UpstreamSettings = serde_json::from_slice(&body)?;

        let endpoints = build_endpoints(&settings);
        let count = endpoints.len();
        if count == 0 {
            warn!(
                services = settings.services.len(),
                "No usable upstreams, dialing directly"
            );
        }
        self.pool.replace(endpoints);
        info!(
            upstreams = count,
            pool = ?self.pool.describe_entries(),
            "Upstream pool replaced"
        );

        if settings.interval_time > 0 {
            let current = self.current_interval_secs.load(Ordering::Relaxed);
            if settings.interval_time != current {
                info!(
                    "Upstream refresh interval changed from {}s to {}s",
                    current, settings.interval_time
                );
                self.current_interval_secs
                    .store(settings.interval_time, Ordering::Relaxed);
            }
        }

        Ok(count)
    }

    /// Initial fetch, then periodic refresh until the exit signal fires
    #[instrument(skip(self), fields(source = %self.source.location()))]
    pub async fn run(&self) {
        info!("Starting upstream refresh service");

        if let Err(e) = self.refresh().await {
            error!(error = %e, "Initial upstream fetch failed, keeping direct pool");
        }

        loop {
            let wait = self.interval();
            debug!(wait_secs = wait.as_secs(), "Next upstream refresh scheduled");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "Upstream refresh failed, keeping previous pool");
                    }
                }
                _ = self.exit.wait() => {
                    info!("Upstream refresh service shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::{Dialer, DirectDialer};
    use crate::error::ProxyError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    struct QueuedSource {
        docs: Mutex<Vec<Option<&'static str>>>,
    }

    impl QueuedSource {
        fn new(docs: Vec<Option<&'static str>>) -> Arc<Self> {
            Arc::new(Self {
                docs: Mutex::new(docs),
            })
        }
    }

    #[async_trait]
    impl DocumentSource for QueuedSource {
        async fn fetch(&self) -> Result<Bytes> {
            let mut docs = self.docs.lock();
            let next = if docs.is_empty() { None } else { docs.remove(0) };
            next.map(|d| Bytes::from_static(d.as_bytes()))
                .ok_or_else(|| ProxyError::ConfigFetch {
                    url: "memory".to_string(),
                    reason: "unavailable".to_string(),
                })
        }

        fn location(&self) -> String {
            "memory".to_string()
        }
    }

    fn pool() -> Arc<DialerPool> {
        let direct: Arc<dyn Dialer> = Arc::new(DirectDialer::default());
        Arc::new(DialerPool::new(direct))
    }

    const TWO_UPSTREAMS: &str = r#"{
        "dial_timeout": 5,
        "interval_time": 120,
        "services": [
            {"type": "socks5", "crypto": "", "password": "", "address": "10.0.0.1:1080"},
            {"type": "shadowsocks", "crypto": "aes-256-cfb", "password": "pw", "address": "10.0.0.2:8388"},
            {"type": "vmess", "address": "10.0.0.3:443"}
        ]
    }"#;

    #[tokio::test]
    async fn test_refresh_replaces_pool_and_adopts_interval() {
        let pool = pool();
        let service = UpstreamRefreshService::new(
            QueuedSource::new(vec![Some(TWO_UPSTREAMS)]),
            pool.clone(),
            ExitSignal::new(),
            Duration::from_secs(3600),
        );

        assert_eq!(service.refresh().await.unwrap(), 2);
        assert_eq!(pool.len(), 2);
        assert_eq!(service.interval(), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_pool_and_interval() {
        let pool = pool();
        let service = UpstreamRefreshService::new(
            QueuedSource::new(vec![Some(TWO_UPSTREAMS), None, Some("{broken")]),
            pool.clone(),
            ExitSignal::new(),
            Duration::from_secs(3600),
        );

        service.refresh().await.unwrap();
        let before = pool.describe_entries();

        assert!(service.refresh().await.is_err());
        assert!(service.refresh().await.is_err());
        assert_eq!(pool.describe_entries(), before);
        assert_eq!(service.interval(), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_document_without_services_means_direct() {
        let pool = pool();
        let service = UpstreamRefreshService::new(
            QueuedSource::new(vec![Some(TWO_UPSTREAMS), Some(r#"{"services": []}"#)]),
            pool.clone(),
            ExitSignal::new(),
            Duration::from_secs(60),
        );

        service.refresh().await.unwrap();
        assert_eq!(service.refresh().await.unwrap(), 0);
        assert_eq!(pool.describe_entries(), vec!["direct"]);
        // A zero interval_time keeps whatever interval was in effect.
        assert_eq!(service.interval(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_exit() {
        let exit = ExitSignal::new();
        let service = Arc::new(UpstreamRefreshService::new(
            QueuedSource::new(vec![]),
            pool(),
            exit.clone(),
            Duration::from_secs(10),
        ));

        let task = {
            let service = service.clone();
            tokio::spawn(async move { service.run().await })
        };

        tokio::time::sleep(Duration::from_secs(25)).await;
        exit.trigger("test");
        task.await.unwrap();
    }
}

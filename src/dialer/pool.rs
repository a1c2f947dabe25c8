use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use super::{BoxedConnection, DialError, Dialer};

struct PoolState {
    entries: Vec<Arc<dyn Dialer>>,
    cursor: usize,
}

/// Round-robin pool of upstream dialers with eviction on dial failures
///
/// Selection and replacement share one lock, which is never held across a
/// dial. When the last entry is evicted the pool falls back to `fallback`,
/// which is never evicted itself.
pub struct DialerPool {
    state: Mutex<PoolState>,
    fallback: Arc<dyn Dialer>,
}

fn same_dialer(a: &Arc<dyn Dialer>, b: &Arc<dyn Dialer>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl DialerPool {
    /// A pool holding only the fallback dialer
    pub fn new(fallback: Arc<dyn Dialer>) -> Self {
        Self {
            state: Mutex::new(PoolState {
                entries: vec![fallback.clone()],
                cursor: 0,
            }),
            fallback,
        }
    }

    pub fn with_entries(fallback: Arc<dyn Dialer>, entries: Vec<Arc<dyn Dialer>>) -> Self {
        let pool = Self::new(fallback);
        pool.replace(entries);
        pool
    }

    /// Swap the whole entry list and restart rotation from the first entry
    pub fn replace(&self, entries: Vec<Arc<dyn Dialer>>) {
        let entries = if entries.is_empty() {
            vec![self.fallback.clone()]
        } else {
            entries
        };

        let mut state = self.state.lock();
        state.entries = entries;
        state.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Labels of the current entries in rotation order
    pub fn describe_entries(&self) -> Vec<String> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|d| d.describe())
            .collect()
    }

    fn next(&self) -> Arc<dyn Dialer> {
        let mut state = self.state.lock();
        if state.entries.is_empty() {
            return self.fallback.clone();
        }
        let idx = state.cursor % state.entries.len();
        state.cursor = idx + 1;
        state.entries[idx].clone()
    }

    fn evict(&self, dialer: &Arc<dyn Dialer>) {
        let mut state = self.state.lock();
        let Some(pos) = state.entries.iter().position(|d| same_dialer(d, dialer)) else {
            // Already evicted by a concurrent dial, or the pool was replaced.
            return;
        };

        state.entries.remove(pos);
        if pos < state.cursor {
            state.cursor -= 1;
        }
        if state.entries.is_empty() {
            state.entries.push(self.fallback.clone());
            state.cursor = 0;
        }
    }
}

#[async_trait]
impl Dialer for DialerPool {
    #[instrument(skip(self))]
    async fn dial(&self, address: &str) -> Result<BoxedConnection, DialError> {
        loop {
            let candidate = self.next();

            match candidate.dial(address).await {
                Ok(conn) => return Ok(conn),
                Err(e) if same_dialer(&candidate, &self.fallback) => {
                    return Err(DialError::Exhausted {
                        address: address.to_string(),
                        last: e.to_string(),
                    });
                }
                Err(e) if e.is_dial_operation() => {
                    warn!(
                        upstream = %candidate.describe(),
                        error = %e,
                        "Evicting upstream after dial failure"
                    );
                    self.evict(&candidate);
                    info!(remaining = self.len(), "Upstream pool shrunk");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn describe(&self) -> String {
        format!("pool[{}]", self.describe_entries().join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::duplex;

    enum Behavior {
        Refuse,
        Reject,
        Accept,
    }

    struct MockDialer {
        name: &'static str,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl MockDialer {
        fn new(name: &'static str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn as_entries(list: &[&Arc<MockDialer>]) -> Vec<Arc<dyn Dialer>> {
        list.iter()
            .map(|d| (*d).clone() as Arc<dyn Dialer>)
            .collect()
    }

    #[async_trait]
    impl Dialer for MockDialer {
        async fn dial(&self, address: &str) -> Result<BoxedConnection, DialError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Refuse => Err(DialError::Connect {
                    address: address.to_string(),
                    source: std::io::ErrorKind::ConnectionRefused.into(),
                }),
                Behavior::Reject => Err(DialError::Handshake {
                    protocol: "socks5",
                    server: self.name.to_string(),
                    reason: "general failure".to_string(),
                }),
                Behavior::Accept => {
                    let (conn, _peer) = duplex(16);
                    Ok(Box::new(conn))
                }
            }
        }

        fn describe(&self) -> String {
            self.name.to_string()
        }
    }

    #[tokio::test]
    async fn test_dead_entry_evicted_then_skipped() {
        let direct = MockDialer::new("direct", Behavior::Accept);
        let a = MockDialer::new("a", Behavior::Refuse);
        let b = MockDialer::new("b", Behavior::Accept);
        let pool = DialerPool::with_entries(direct.clone(), as_entries(&[&a, &b]));

        assert!(pool.dial("example.com:80").await.is_ok());
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        assert_eq!(pool.describe_entries(), vec!["b"]);

        assert!(pool.dial("example.com:80").await.is_ok());
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 2);
        assert_eq!(direct.calls(), 0);
    }

    #[tokio::test]
    async fn test_round_robin_order() {
        let direct = MockDialer::new("direct", Behavior::Accept);
        let a = MockDialer::new("a", Behavior::Accept);
        let b = MockDialer::new("b", Behavior::Accept);
        let c = MockDialer::new("c", Behavior::Accept);
        let pool = DialerPool::with_entries(direct, as_entries(&[&a, &b, &c]));

        for _ in 0..7 {
            pool.dial("example.com:80").await.unwrap();
        }
        assert_eq!((a.calls(), b.calls(), c.calls()), (3, 2, 2));
    }

    #[tokio::test]
    async fn test_non_dial_errors_surface_without_eviction() {
        let direct = MockDialer::new("direct", Behavior::Accept);
        let a = MockDialer::new("a", Behavior::Reject);
        let b = MockDialer::new("b", Behavior::Accept);
        let pool = DialerPool::with_entries(direct, as_entries(&[&a, &b]));

        let err = pool.dial("example.com:80").await.err().unwrap();
        assert!(matches!(err, DialError::Handshake { .. }));
        assert_eq!(pool.len(), 2);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_repeated_failures_converge_to_fallback() {
        let direct = MockDialer::new("direct", Behavior::Accept);
        let entries: Vec<Arc<dyn Dialer>> = vec![
            MockDialer::new("a", Behavior::Refuse),
            MockDialer::new("b", Behavior::Refuse),
            MockDialer::new("c", Behavior::Refuse),
        ];
        let pool = DialerPool::with_entries(direct.clone(), entries);

        assert!(pool.dial("example.com:80").await.is_ok());
        assert_eq!(pool.describe_entries(), vec!["direct"]);
        assert_eq!(direct.calls(), 1);

        assert!(pool.dial("example.com:80").await.is_ok());
        assert_eq!(pool.len(), 1);
        assert_eq!(direct.calls(), 2);
    }

    #[tokio::test]
    async fn test_fallback_failure_is_exhausted_and_kept() {
        let direct = MockDialer::new("direct", Behavior::Refuse);
        let pool = DialerPool::new(direct.clone());

        let err = pool.dial("example.com:80").await.err().unwrap();
        assert!(matches!(err, DialError::Exhausted { .. }));
        assert_eq!(pool.describe_entries(), vec!["direct"]);
    }

    #[tokio::test]
    async fn test_replace_resets_cursor_and_empty_means_fallback() {
        let direct = MockDialer::new("direct", Behavior::Accept);
        let a = MockDialer::new("a", Behavior::Accept);
        let b = MockDialer::new("b", Behavior::Accept);
        let pool = DialerPool::with_entries(direct.clone(), as_entries(&[&a, &b]));

        pool.dial("example.com:80").await.unwrap();
        pool.replace(as_entries(&[&a, &b]));
        pool.dial("example.com:80").await.unwrap();
        assert_eq!((a.calls(), b.calls()), (2, 0));

        pool.replace(Vec::new());
        assert_eq!(pool.describe_entries(), vec!["direct"]);
        assert!(!pool.is_empty());
    }
}

// Snode clock: network time from the median of a few snodes' `info` replies
//
// Storage servers reject requests whose timestamps drift too far from their
// own clock, so signed requests use this time instead of the system clock.

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::api::snode::{SnodeRequest, SnodeRpc};
use crate::snode::SnodeDirectory;

/// Nodes sampled per resync
const SAMPLE_NODES: usize = 3;
/// Upper bound for one resync round
const RESYNC_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_MIN_RESYNC_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[async_trait]
pub trait ClockSync: Send + Sync {
    /// Re-derive network time; true only if a fresh sync succeeded
    async fn resync(&self) -> bool;

    /// Current network time in milliseconds since the epoch
    fn now_ms(&self) -> u64;
}

fn system_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy)]
struct NetworkInstant {
    at: Instant,
    network_ms: u64,
}

impl NetworkInstant {
    fn now_ms(&self) -> u64 {
        self.network_ms + self.at.elapsed().as_millis() as u64
    }
}

pub struct SnodeClock {
    pool: Arc<SnodeDirectory>,
    rpc: Arc<dyn SnodeRpc>,
    state: RwLock<Option<NetworkInstant>>,
    /// Time of the last successful resync; holding it serialises resyncs
    last_sync: tokio::sync::Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl SnodeClock {
    pub fn new(pool: Arc<SnodeDirectory>, rpc: Arc<dyn SnodeRpc>) -> Self {
        Self {
            pool,
            rpc,
            state: RwLock::new(None),
            last_sync: tokio::sync::Mutex::new(None),
            min_interval: DEFAULT_MIN_RESYNC_INTERVAL,
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    /// Network time minus system time, if synced
    pub fn offset_ms(&self) -> Option<i64> {
        let state = (*self.state.read())?;
        Some(state.now_ms() as i64 - system_now_ms() as i64)
    }

    pub fn is_synced(&self) -> bool {
        self.state.read().is_some()
    }

    async fn sample(&self) -> Option<u64> {
        let pool = match self.pool.ensure_pool().await {
            Ok(pool) => pool,
            Err(e) => {
                tracing::warn!("Clock resync has no pool: {}", e);
                return None;
            }
        };
        let nodes: Vec<_> = pool
            .choose_multiple(&mut rand::thread_rng(), SAMPLE_NODES)
            .cloned()
            .collect();

        let request = SnodeRequest::info();
        let samples = futures::future::join_all(nodes.iter().map(|node| {
            let request = &request;
            async move {
                let started = Instant::now();
                let response = self.rpc.call(node, request).await.ok()?;
                let timestamp = response.json_body().ok()?.get("timestamp").and_then(Value::as_u64)?;
                let half_rtt = started.elapsed().as_millis() as u64 / 2;
                Some((started, timestamp.saturating_sub(half_rtt)))
            }
        }))
        .await;

        let now = Instant::now();
        let mut candidates: Vec<u64> = samples
            .into_iter()
            .flatten()
            .map(|(started, adjusted)| adjusted + now.duration_since(started).as_millis() as u64)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_unstable();
        Some(candidates[candidates.len() / 2])
    }
}

#[async_trait]
impl ClockSync for SnodeClock {
    async fn resync(&self) -> bool {
        let requested = Instant::now();
        let mut last_sync = self.last_sync.lock().await;

        if let Some(last) = *last_sync {
            if last >= requested {
                // A resync finished while we were waiting for it
                return true;
            }
            if last.elapsed() < self.min_interval {
                tracing::debug!("Clock resync throttled ({}s ago)", last.elapsed().as_secs());
                return false;
            }
        }

        match tokio::time::timeout(RESYNC_TIMEOUT, self.sample()).await {
            Ok(Some(network_ms)) => {
                *self.state.write() = Some(NetworkInstant {
                    at: Instant::now(),
                    network_ms,
                });
                *last_sync = Some(Instant::now());
                tracing::info!(
                    "⏰ Clock resynced, offset {} ms",
                    network_ms as i64 - system_now_ms() as i64
                );
                true
            }
            Ok(None) => {
                tracing::warn!("Clock resync failed: no snode answered");
                false
            }
            Err(_) => {
                tracing::warn!("Clock resync timed out");
                false
            }
        }
    }

    fn now_ms(&self) -> u64 {
        match *self.state.read() {
            Some(state) => state.now_ms(),
            None => system_now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::onion::OnionResponse;
    use crate::snode::test_support::snodes;
    use crate::snode::Snode;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Each node reports `base + port offset` so the median is predictable
    struct TimeRpc {
        base: u64,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SnodeRpc for TimeRpc {
        async fn call(&self, snode: &Snode, request: &SnodeRequest) -> Result<OnionResponse, ApiError> {
            assert_eq!(request.method, "info");
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ApiError::Malformed("down".into()));
            }
            let body = json!({ "timestamp": self.base + snode.port as u64 });
            Ok(OnionResponse {
                code: 200,
                info: json!({"code": 200}),
                body: Some(serde_json::to_vec(&body).unwrap()),
            })
        }
    }

    fn clock(fail: bool) -> (SnodeClock, Arc<TimeRpc>) {
        let rpc = Arc::new(TimeRpc {
            base: 1_000_000_000_000,
            calls: AtomicUsize::new(0),
            fail,
        });
        let pool = Arc::new(SnodeDirectory::for_tests(snodes(1..13)));
        (SnodeClock::new(pool, rpc.clone()), rpc)
    }

    #[tokio::test]
    async fn test_resync_uses_median_of_samples() {
        let (clock, rpc) = clock(false);
        assert!(!clock.is_synced());

        assert!(clock.resync().await);
        assert_eq!(rpc.calls.load(Ordering::SeqCst), 3);

        let now = clock.now_ms();
        assert!(now >= 1_000_000_022_001);
        assert!(now < 1_000_000_022_012 + 1_000);
        assert!(clock.offset_ms().unwrap() < 0);
    }

    #[tokio::test]
    async fn test_resync_is_throttled() {
        let (clock, rpc) = clock(false);
        assert!(clock.resync().await);
        assert!(!clock.resync().await);
        assert_eq!(rpc.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_interval_disables_throttle() {
        let (clock, rpc) = clock(false);
        let clock = clock.with_min_interval(Duration::ZERO);
        assert!(clock.resync().await);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(clock.resync().await);
        assert_eq!(rpc.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_failed_resync_keeps_system_time() {
        let (clock, _) = clock(true);
        assert!(!clock.resync().await);
        assert!(!clock.is_synced());

        let system = system_now_ms();
        assert!(clock.now_ms().abs_diff(system) < 1_000);
    }
}

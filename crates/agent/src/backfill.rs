//! Rate-governed replay of spilled probe results.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use crate::spill::{Batch, SpillError, SpillStore};
use crate::telemetry::{BackfillRecorder, NoopBackfillRecorder};

pub const DEFAULT_RATE_PER_SEC: f64 = 50.0;
pub const DEFAULT_BURST: usize = 100;
pub const DEFAULT_MAX_BATCH: usize = 256;

/// Token bucket with an async wait. Tokens are only deducted at the
/// moment the wait succeeds, so a cancelled wait leaves the bucket
/// untouched.
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: usize) -> Self {
        let rate = if rate_per_sec <= 0.0 { 1.0 } else { rate_per_sec };
        let burst = if burst == 0 { rate.ceil() as usize } else { burst };
        Self {
            rate,
            burst: burst as f64,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Waits until `n` tokens are available, then takes them. Requests
    /// larger than the burst are clamped to it.
    pub async fn wait_n(&self, n: usize) {
        let want = (n as f64).min(self.burst);
        loop {
            let delay = {
                let mut state = self.state.lock().expect("token bucket poisoned");
                let now = Instant::now();
                let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
                state.refilled_at = now;
                if state.tokens >= want {
                    state.tokens -= want;
                    return;
                }
                Duration::from_secs_f64((want - state.tokens) / self.rate)
            };
            tokio::time::sleep(delay).await;
        }
    }

    /// Non-waiting probe used by tests.
    pub fn try_take(&self, n: usize) -> bool {
        let want = n as f64;
        let mut state = self.state.lock().expect("token bucket poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.refilled_at = now;
        if state.tokens >= want {
            state.tokens -= want;
            true
        } else {
            false
        }
    }
}

/// Reads batches from the spill store, pacing replay through a token
/// bucket so backfill cannot starve live traffic of upstream capacity.
pub struct Controller {
    store: Arc<SpillStore>,
    limiter: RwLock<Arc<TokenBucket>>,
    max_batch: usize,
    metrics: RwLock<Arc<dyn BackfillRecorder>>,
}

impl Controller {
    pub fn new(store: Arc<SpillStore>) -> Self {
        let controller = Self {
            store,
            limiter: RwLock::new(Arc::new(TokenBucket::new(
                DEFAULT_RATE_PER_SEC,
                DEFAULT_BURST,
            ))),
            max_batch: DEFAULT_MAX_BATCH,
            metrics: RwLock::new(Arc::new(NoopBackfillRecorder)),
        };
        controller.record_pending();
        controller
    }

    pub fn with_max_batch(mut self, size: usize) -> Self {
        if size > 0 {
            self.max_batch = size;
        }
        self
    }

    pub fn set_limiter(&self, rate_per_sec: f64, burst: usize) {
        let limiter = Arc::new(TokenBucket::new(rate_per_sec, burst));
        *self.limiter.write().expect("limiter lock poisoned") = limiter;
    }

    pub fn set_metrics(&self, recorder: Arc<dyn BackfillRecorder>) {
        *self.metrics.write().expect("metrics lock poisoned") = recorder;
        self.record_pending();
    }

    /// Reads up to `max` records (capped by the internal maximum) and,
    /// when nonempty, waits for one token per record before returning.
    /// The batch stays un-acked until [`Controller::ack`] succeeds, so
    /// the next call replays the same records after a failed send.
    pub async fn next(&self, max: usize) -> Result<Batch, SpillError> {
        let max = if max == 0 || max > self.max_batch {
            self.max_batch
        } else {
            max
        };

        let batch = self.store.read_batch(max)?;
        self.record_pending();
        if batch.is_empty() {
            return Ok(batch);
        }

        let limiter = self.limiter.read().expect("limiter lock poisoned").clone();
        limiter.wait_n(batch.len()).await;
        Ok(batch)
    }

    pub fn ack(&self, batch: Batch) -> Result<(), SpillError> {
        self.store.ack(batch)?;
        self.record_pending();
        Ok(())
    }

    pub fn pending_bytes(&self) -> u64 {
        self.store.size_bytes()
    }

    fn record_pending(&self) {
        self.metrics
            .read()
            .expect("metrics lock poisoned")
            .observe_pending_bytes(self.store.size_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::test_support::CountingBackfillRecorder;
    use common::api::ProbeResult;

    fn result(seq: u64) -> ProbeResult {
        ProbeResult {
            monitor_id: format!("mon-{seq}"),
            seq,
            ..ProbeResult::default()
        }
    }

    #[tokio::test]
    async fn replays_in_order_and_acks_forward() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SpillStore::open(dir.path(), 0, 0).expect("open"));
        for seq in 0..5 {
            store.append(&result(seq)).expect("append");
        }

        let controller = Controller::new(store.clone());
        let batch = controller.next(3).await.expect("next");
        assert_eq!(
            batch.results.iter().map(|r| r.seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        // Un-acked batches are replayed.
        let again = controller.next(3).await.expect("next");
        assert_eq!(
            again.results.iter().map(|r| r.seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        controller.ack(again).expect("ack");
        let rest = controller.next(10).await.expect("next");
        assert_eq!(
            rest.results.iter().map(|r| r.seq).collect::<Vec<_>>(),
            vec![3, 4]
        );
        controller.ack(rest).expect("ack");
        assert_eq!(controller.pending_bytes(), 0);

        let empty = controller.next(10).await.expect("next");
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn pending_gauge_tracks_reads_and_acks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SpillStore::open(dir.path(), 0, 0).expect("open"));
        store.append(&result(0)).expect("append");

        let recorder = Arc::new(CountingBackfillRecorder::default());
        let controller = Controller::new(store);
        controller.set_metrics(Arc::new(recorder.clone()));
        assert!(recorder.pending.load(std::sync::atomic::Ordering::SeqCst) > 0);

        let batch = controller.next(10).await.expect("next");
        controller.ack(batch).expect("ack");
        assert_eq!(recorder.pending.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn max_batch_caps_reads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SpillStore::open(dir.path(), 0, 0).expect("open"));
        for seq in 0..10 {
            store.append(&result(seq)).expect("append");
        }

        let controller = Controller::new(store).with_max_batch(4);
        let batch = controller.next(100).await.expect("next");
        assert_eq!(batch.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_paces_large_batches() {
        let bucket = TokenBucket::new(10.0, 5);
        assert!(bucket.try_take(5));
        assert!(!bucket.try_take(1));

        // Half a second refills five tokens at 10/s.
        tokio::time::advance(Duration::from_millis(500)).await;
        bucket.wait_n(5).await;
        assert!(!bucket.try_take(1));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_clamps_requests_beyond_burst() {
        let bucket = TokenBucket::new(10.0, 5);
        // A request larger than the burst must still complete.
        bucket.wait_n(50).await;
    }
}

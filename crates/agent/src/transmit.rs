//! Drains live results to the downstream sink, replaying spilled data
//! when the live queue is idle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use common::api::ProbeResult;

use crate::backfill;
use crate::queue::ResultQueue;

pub const DEFAULT_BATCH_SIZE: usize = 256;
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(100);
pub const DEFAULT_RETRY_SLEEP: Duration = Duration::from_millis(200);

/// Downstream consumer for probe results (e.g. the HTTPS uplink).
#[async_trait]
pub trait Sink: Send + Sync {
    async fn send(&self, results: &[ProbeResult]) -> anyhow::Result<()>;
}

/// Single cooperative loop: live data always takes priority; backfill
/// is serviced only when the live queue is empty. One transmitter means
/// at most one in-flight batch, which keeps requeue semantics trivial.
pub struct Transmitter {
    queue: Arc<ResultQueue>,
    backfill: Option<Arc<backfill::Controller>>,
    sink: Arc<dyn Sink>,
    batch_size: usize,
    idle_sleep: Duration,
    retry_sleep: Duration,
}

impl Transmitter {
    pub fn new(queue: Arc<ResultQueue>, sink: Arc<dyn Sink>) -> Self {
        Self {
            queue,
            backfill: None,
            sink,
            batch_size: DEFAULT_BATCH_SIZE,
            idle_sleep: DEFAULT_IDLE_SLEEP,
            retry_sleep: DEFAULT_RETRY_SLEEP,
        }
    }

    pub fn with_backfill(mut self, controller: Arc<backfill::Controller>) -> Self {
        self.backfill = Some(controller);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.batch_size = size;
        }
        self
    }

    pub fn with_idle_sleep(mut self, duration: Duration) -> Self {
        if duration > Duration::ZERO {
            self.idle_sleep = duration;
        }
        self
    }

    pub fn with_retry_sleep(mut self, duration: Duration) -> Self {
        if duration > Duration::ZERO {
            self.retry_sleep = duration;
        }
        self
    }

    /// Runs until shutdown. Live-send failures requeue and retry
    /// forever; backfill store errors surface to the caller.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            if self.flush_queue(&mut shutdown).await {
                continue;
            }

            if self.flush_backfill(&mut shutdown).await? {
                continue;
            }

            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = tokio::time::sleep(self.idle_sleep) => {}
            }
        }
    }

    async fn flush_queue(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let results = self.queue.drain(self.batch_size);
        if results.is_empty() {
            return false;
        }

        let count = results.len();
        if let Err(err) = self.sink.send(&results).await {
            warn!(count, %err, "live send failed; requeueing batch");
            for result in results {
                self.queue.enqueue(result);
            }
            self.sleep(shutdown, self.retry_sleep).await;
            return true;
        }

        debug!(count, "live batch sent");
        true
    }

    async fn flush_backfill(&self, shutdown: &mut watch::Receiver<bool>) -> anyhow::Result<bool> {
        let Some(controller) = &self.backfill else {
            return Ok(false);
        };

        let batch = tokio::select! {
            _ = shutdown.changed() => return Ok(false),
            batch = controller.next(self.batch_size) => batch?,
        };
        if batch.is_empty() {
            return Ok(false);
        }

        if let Err(err) = self.sink.send(&batch.results).await {
            // Left un-acked on purpose; the next read replays it.
            warn!(count = batch.len(), %err, "backfill send failed");
            self.sleep(shutdown, self.retry_sleep).await;
            return Ok(true);
        }

        controller.ack(batch)?;
        Ok(true)
    }

    async fn sleep(&self, shutdown: &mut watch::Receiver<bool>, duration: Duration) {
        if duration == Duration::ZERO {
            return;
        }
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::Controller;
    use crate::spill::SpillStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn result(seq: u64) -> ProbeResult {
        ProbeResult {
            monitor_id: format!("mon-{seq}"),
            seq,
            ..ProbeResult::default()
        }
    }

    /// Sink that records batches and can fail the first N sends.
    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Vec<u64>>>,
        failures_remaining: AtomicUsize,
    }

    impl RecordingSink {
        fn failing(times: usize) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                failures_remaining: AtomicUsize::new(times),
            }
        }

        fn flat(&self) -> Vec<u64> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .flatten()
                .copied()
                .collect()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn send(&self, results: &[ProbeResult]) -> anyhow::Result<()> {
            if self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("sink unavailable");
            }
            self.sent
                .lock()
                .unwrap()
                .push(results.iter().map(|r| r.seq).collect());
            Ok(())
        }
    }

    async fn run_until_drained(
        transmitter: &Transmitter,
        queue: &ResultQueue,
        controller: Option<&Controller>,
    ) {
        let (tx, rx) = watch::channel(false);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let run = transmitter.run(rx);
        tokio::pin!(run);
        loop {
            tokio::select! {
                res = &mut run => {
                    res.expect("transmitter run");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(10)) => {
                    let drained = queue.is_empty()
                        && controller.map(|c| c.pending_bytes() == 0).unwrap_or(true);
                    if drained || tokio::time::Instant::now() > deadline {
                        let _ = tx.send(true);
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn drains_live_queue_fifo() {
        let queue = Arc::new(ResultQueue::new(16));
        for seq in 0..5 {
            queue.enqueue(result(seq));
        }
        let sink = Arc::new(RecordingSink::default());
        let transmitter = Transmitter::new(queue.clone(), sink.clone())
            .with_batch_size(2)
            .with_idle_sleep(Duration::from_millis(5));

        run_until_drained(&transmitter, &queue, None).await;
        assert_eq!(sink.flat(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn requeues_on_send_failure_and_retries() {
        let queue = Arc::new(ResultQueue::new(16));
        for seq in 0..3 {
            queue.enqueue(result(seq));
        }
        let sink = Arc::new(RecordingSink::failing(2));
        let transmitter = Transmitter::new(queue.clone(), sink.clone())
            .with_retry_sleep(Duration::from_millis(5))
            .with_idle_sleep(Duration::from_millis(5));

        run_until_drained(&transmitter, &queue, None).await;
        assert_eq!(sink.flat(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn live_data_takes_priority_over_backfill() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SpillStore::open(dir.path(), 0, 0).expect("open"));
        for seq in 100..103 {
            store.append(&result(seq)).expect("append");
        }
        let controller = Arc::new(Controller::new(store));
        controller.set_limiter(10_000.0, 10_000);

        let queue = Arc::new(ResultQueue::new(16));
        for seq in 0..3 {
            queue.enqueue(result(seq));
        }

        let sink = Arc::new(RecordingSink::default());
        let transmitter = Transmitter::new(queue.clone(), sink.clone())
            .with_backfill(controller.clone())
            .with_idle_sleep(Duration::from_millis(5));

        run_until_drained(&transmitter, &queue, Some(&controller)).await;

        let sent = sink.flat();
        assert_eq!(sent[..3], [0, 1, 2], "live batch first");
        assert_eq!(sent[3..], [100, 101, 102], "backfill after");
        assert_eq!(controller.pending_bytes(), 0);
    }

    #[tokio::test]
    async fn failed_backfill_sends_are_replayed_not_lost() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SpillStore::open(dir.path(), 0, 0).expect("open"));
        for seq in 0..4 {
            store.append(&result(seq)).expect("append");
        }
        let controller = Arc::new(Controller::new(store));
        controller.set_limiter(10_000.0, 10_000);

        let queue = Arc::new(ResultQueue::new(16));
        let sink = Arc::new(RecordingSink::failing(1));
        let transmitter = Transmitter::new(queue.clone(), sink.clone())
            .with_backfill(controller.clone())
            .with_batch_size(2)
            .with_retry_sleep(Duration::from_millis(5))
            .with_idle_sleep(Duration::from_millis(5));

        run_until_drained(&transmitter, &queue, Some(&controller)).await;

        // The failed first batch is replayed in full; nothing is lost
        // or duplicated at the sink.
        assert_eq!(sink.flat(), vec![0, 1, 2, 3]);
    }
}

use crate::queue::{JobQueue, QueueError};
use crate::research::worker::{Disposition, ResearchWorker};
use crate::shutdown::Shutdown;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Receive-failure backoff: starts at `floor`, doubles, stops at `cap`.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, cap: Duration) -> Self {
        let cap = cap.max(floor);
        Self {
            floor,
            cap,
            current: floor,
        }
    }

    /// Delay to wait now; the following call returns double (up to the cap).
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub backoff_floor: Duration,
    pub backoff_cap: Duration,
    /// Log an idle line every N empty polls; 0 disables it.
    pub idle_log_every: u64,
    pub failure_pause: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            backoff_floor: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            idle_log_every: 6,
            failure_pause: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub received: u64,
    pub acknowledged: u64,
    pub released: u64,
    pub empty_polls: u64,
    pub receive_errors: u64,
}

/// Single-flight consumer: one leased message is processed to completion
/// before the next receive.
pub struct ResearchService {
    queue: Arc<dyn JobQueue>,
    worker: Arc<ResearchWorker>,
    options: ServiceOptions,
}

impl ResearchService {
    pub fn new(queue: Arc<dyn JobQueue>, worker: Arc<ResearchWorker>, options: ServiceOptions) -> Self {
        Self {
            queue,
            worker,
            options,
        }
    }

    /// One receive and, if a message arrived, its full processing.
    pub async fn poll_once(&self) -> Result<Option<Disposition>, QueueError> {
        let Some(msg) = self.queue.receive().await? else {
            return Ok(None);
        };

        let started = Instant::now();
        let disposition = self.worker.handle(&msg).await;
        let elapsed = started.elapsed();
        if elapsed > self.worker.lease() {
            warn!(
                "⚠ message {} took {}s, past the {}s lease; it may already have been redelivered",
                msg.message_id,
                elapsed.as_secs(),
                self.worker.lease().as_secs()
            );
        }

        if disposition == Disposition::Acknowledge {
            if let Err(e) = self.queue.acknowledge(&msg).await {
                // Not fatal: the job reruns idempotently on redelivery.
                error!("✗ acknowledge failed for message {}: {}", msg.message_id, e);
            }
        }
        Ok(Some(disposition))
    }

    /// Runs until `shutdown` fires. A job in flight always completes first.
    pub async fn run(&self, mut shutdown: Shutdown) -> ServiceStats {
        let mut stats = ServiceStats::default();
        let mut backoff = Backoff::new(self.options.backoff_floor, self.options.backoff_cap);
        info!("research worker loop started");

        while !shutdown.is_requested() {
            match self.poll_once().await {
                Ok(Some(disposition)) => {
                    backoff.reset();
                    stats.received += 1;
                    match disposition {
                        Disposition::Acknowledge => stats.acknowledged += 1,
                        Disposition::Release => {
                            stats.released += 1;
                            shutdown.sleep(self.options.failure_pause).await;
                        }
                    }
                }
                Ok(None) => {
                    backoff.reset();
                    stats.empty_polls += 1;
                    let every = self.options.idle_log_every;
                    if every > 0 && stats.empty_polls % every == 0 {
                        info!("idle: no messages ({} empty polls)", stats.empty_polls);
                    }
                }
                Err(e) => {
                    stats.receive_errors += 1;
                    let delay = backoff.next_delay();
                    warn!("⚠ receive failed: {}; retrying in {}s", e, delay.as_secs());
                    if let Err(e) = self.queue.reconnect().await {
                        error!("✗ queue reconnect failed: {}", e);
                    }
                    shutdown.sleep(delay).await;
                }
            }
        }

        info!(
            "research worker loop stopped: {} received, {} acknowledged, {} released",
            stats.received, stats.acknowledged, stats.released
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryQueue, QueueMessage};
    use crate::research::test_support::{fixture_without_runs, Fixture, StubEngine};
    use crate::shutdown;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn backoff_doubles_to_cap_and_resets() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let seq: Vec<u64> = (0..7).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(seq, vec![1, 2, 4, 8, 16, 30, 30]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    /// The returned temp dir must outlive the service.
    fn service(fx: Fixture, queue: Arc<dyn JobQueue>) -> (ResearchService, tempfile::TempDir) {
        let svc = ResearchService::new(queue, Arc::new(fx.worker), ServiceOptions::default());
        (svc, fx.workdir)
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_stays_on_queue_until_lease_expires() {
        let fx = fixture_without_runs(StubEngine::failing()).await;
        let queue = Arc::new(MemoryQueue::new(Duration::ZERO, Duration::from_secs(900)));
        queue.push(json!({"runId": "f1", "strategyId": "s1", "manifestKey": "strategies/s1/main.py"}).to_string());
        let (svc, _workdir) = service(fx, queue.clone());

        assert_eq!(svc.poll_once().await.unwrap(), Some(Disposition::Release));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.visible_len(), 0);
        assert_eq!(svc.poll_once().await.unwrap(), None);

        tokio::time::advance(Duration::from_secs(901)).await;
        let again = queue.receive().await.unwrap().unwrap();
        assert_eq!(again.receive_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_and_poison_messages_are_removed() {
        let fx = fixture_without_runs(StubEngine::ok(json!({"sharpe": 1.0}))).await;
        let queue = Arc::new(MemoryQueue::new(Duration::ZERO, Duration::from_secs(900)));
        queue.push("definitely not json");
        queue.push(json!({"runId": "ok1", "strategyId": "s1", "manifestKey": "strategies/s1/main.py"}).to_string());
        let (svc, _workdir) = service(fx, queue.clone());

        assert_eq!(svc.poll_once().await.unwrap(), Some(Disposition::Acknowledge));
        assert_eq!(svc.poll_once().await.unwrap(), Some(Disposition::Acknowledge));
        assert!(queue.is_empty());
    }

    /// Fails the first `failures` receives, then delegates.
    struct FlakyQueue {
        inner: MemoryQueue,
        failures: AtomicUsize,
        reconnects: AtomicUsize,
        receive_times: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl JobQueue for FlakyQueue {
        async fn receive(&self) -> Result<Option<QueueMessage>, QueueError> {
            self.receive_times.lock().unwrap().push(Instant::now());
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(QueueError::Receive("connection reset".into()));
            }
            self.inner.receive().await
        }

        async fn acknowledge(&self, msg: &QueueMessage) -> Result<(), QueueError> {
            self.inner.acknowledge(msg).await
        }

        async fn reconnect(&self) -> Result<(), QueueError> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn receive_failures_back_off_and_reconnect() {
        let fx = fixture_without_runs(StubEngine::ok(json!({}))).await;
        let queue = Arc::new(FlakyQueue {
            inner: MemoryQueue::new(Duration::from_secs(20), Duration::from_secs(900)),
            failures: AtomicUsize::new(3),
            reconnects: AtomicUsize::new(0),
            receive_times: Mutex::new(Vec::new()),
        });
        queue
            .inner
            .push(json!({"runId": "b1", "strategyId": "s1", "manifestKey": "strategies/s1/main.py"}).to_string());
        let (svc, _workdir) = service(fx, queue.clone());

        let (trigger, shutdown) = shutdown::channel();
        let handle = tokio::spawn(async move { svc.run(shutdown).await });

        tokio::time::sleep(Duration::from_secs(10)).await;
        trigger.trigger();
        let stats = handle.await.unwrap();

        assert_eq!(stats.receive_errors, 3);
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(queue.reconnects.load(Ordering::SeqCst), 3);

        let times = queue.receive_times.lock().unwrap().clone();
        let gaps: Vec<u64> = times.windows(2).take(3).map(|w| (w[1] - w[0]).as_secs()).collect();
        assert_eq!(gaps, vec![1, 2, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn job_in_flight_completes_before_the_loop_stops() {
        let fx = fixture_without_runs(
            StubEngine::ok(json!({"sharpe": 1.0})).with_delay(Duration::from_secs(30)),
        )
        .await;
        let engine = fx.engine.clone();
        let artifacts = fx.artifacts.clone();
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(20), Duration::from_secs(900)));
        queue.push(json!({"runId": "slow1", "strategyId": "s1", "manifestKey": "strategies/s1/main.py"}).to_string());
        let (svc, _workdir) = service(fx, queue.clone());

        let started = Instant::now();
        let (trigger, shutdown) = shutdown::channel();
        let handle = tokio::spawn(async move { svc.run(shutdown).await });

        // Stop while the engine is still busy with the job.
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.trigger();
        let stats = handle.await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(stats.received, 1);
        assert_eq!(stats.acknowledged, 1);
        assert!(queue.is_empty());
        assert_eq!(engine.calls().len(), 1);
        assert!(artifacts.get_opt("runs/slow1/metrics.json").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_request_ends_the_loop_between_messages() {
        let fx = fixture_without_runs(StubEngine::ok(json!({}))).await;
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(20), Duration::from_secs(900)));
        let (svc, _workdir) = service(fx, queue);

        let (trigger, shutdown) = shutdown::channel();
        trigger.trigger();
        let stats = svc.run(shutdown).await;
        assert_eq!(stats, ServiceStats::default());
    }
}

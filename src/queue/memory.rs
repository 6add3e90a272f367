use crate::queue::types::{JobQueue, QueueError, QueueMessage};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct Entry {
    id: String,
    body: String,
    receive_count: u32,
    visible_at: Instant,
    receipt: Option<String>,
}

/// In-process queue with SQS lease semantics: a received message is hidden for
/// the visibility timeout and comes back with a fresh receipt unless acknowledged.
pub struct MemoryQueue {
    entries: Mutex<Vec<Entry>>,
    notify: Notify,
    seq: AtomicU64,
    wait: Duration,
    visibility: Duration,
}

impl MemoryQueue {
    pub fn new(wait: Duration, visibility: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            wait,
            visibility,
        }
    }

    pub fn push(&self, body: impl Into<String>) -> String {
        let id = format!("m-{}", self.seq.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Entry {
            id: id.clone(),
            body: body.into(),
            receive_count: 0,
            visible_at: Instant::now(),
            receipt: None,
        });
        self.notify.notify_waiters();
        id
    }

    /// Messages not yet acknowledged, leased or not.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn visible_len(&self) -> usize {
        let now = Instant::now();
        self.lock().iter().filter(|e| e.visible_at <= now).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        // A panic while holding the lock cannot leave entries half-written.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Leases the first visible message, or returns the instant the next one becomes visible.
    fn try_lease(&self) -> Result<QueueMessage, Option<Instant>> {
        let now = Instant::now();
        let mut entries = self.lock();
        let Some(pos) = entries.iter().position(|e| e.visible_at <= now) else {
            return Err(entries.iter().map(|e| e.visible_at).min());
        };

        let entry = &mut entries[pos];
        entry.receive_count += 1;
        entry.visible_at = now + self.visibility;
        let receipt = format!(
            "{}#{}",
            entry.id,
            self.seq.fetch_add(1, Ordering::Relaxed)
        );
        entry.receipt = Some(receipt.clone());

        Ok(QueueMessage {
            message_id: entry.id.clone(),
            receipt,
            body: entry.body.clone(),
            receive_count: entry.receive_count,
        })
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn receive(&self) -> Result<Option<QueueMessage>, QueueError> {
        let deadline = Instant::now() + self.wait;
        loop {
            let next_visible = match self.try_lease() {
                Ok(msg) => return Ok(Some(msg)),
                Err(next) => next,
            };
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let until = next_visible.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(until) => {}
            }
        }
    }

    async fn acknowledge(&self, msg: &QueueMessage) -> Result<(), QueueError> {
        let mut entries = self.lock();
        let pos = entries
            .iter()
            .position(|e| e.receipt.as_deref() == Some(msg.receipt.as_str()));
        match pos {
            Some(pos) => {
                entries.remove(pos);
                Ok(())
            }
            None => Err(QueueError::StaleReceipt(msg.message_id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> MemoryQueue {
        MemoryQueue::new(Duration::from_secs(20), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn leased_message_is_hidden_until_timeout() {
        let q = queue();
        q.push("job-1");

        let first = q.receive().await.unwrap().unwrap();
        assert_eq!(first.body, "job-1");
        assert_eq!(first.receive_count, 1);
        assert_eq!(q.visible_len(), 0);

        // Long poll returns empty while the lease holds.
        let start = Instant::now();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(q.receive().await.unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_secs(25));

        tokio::time::advance(Duration::from_secs(10)).await;
        let again = q.receive().await.unwrap().unwrap();
        assert_eq!(again.message_id, first.message_id);
        assert_eq!(again.receive_count, 2);
        assert_ne!(again.receipt, first.receipt);
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledge_removes_and_stale_receipts_fail() {
        let q = queue();
        q.push("job-1");

        let first = q.receive().await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        let second = q.receive().await.unwrap().unwrap();

        assert!(matches!(
            q.acknowledge(&first).await,
            Err(QueueError::StaleReceipt(_))
        ));
        q.acknowledge(&second).await.unwrap();
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn zero_wait_returns_immediately_when_empty() {
        let q = MemoryQueue::new(Duration::ZERO, Duration::from_secs(30));
        assert!(q.receive().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_wakes_on_push() {
        let q = std::sync::Arc::new(queue());
        let producer = q.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            producer.push("late");
        });

        let msg = q.receive().await.unwrap().unwrap();
        assert_eq!(msg.body, "late");
    }
}

use async_trait::async_trait;

/// One leased delivery. `receipt` identifies this lease, not the message: a
/// redelivery carries a new receipt and the old one can no longer acknowledge.
#[derive(Clone, Debug)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt: String,
    pub body: String,
    pub receive_count: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("acknowledge failed: {0}")]
    Acknowledge(String),
    #[error("stale receipt for message {0}")]
    StaleReceipt(String),
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Long-polls for at most one message and leases it.
    async fn receive(&self) -> Result<Option<QueueMessage>, QueueError>;

    /// Deletes the message for good.
    async fn acknowledge(&self, msg: &QueueMessage) -> Result<(), QueueError>;

    /// Drops and rebuilds the transport client after a failure.
    async fn reconnect(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

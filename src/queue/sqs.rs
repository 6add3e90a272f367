use crate::queue::types::{JobQueue, QueueError, QueueMessage};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::MessageSystemAttributeName;
use aws_sdk_sqs::Client;
use log::{info, warn};
use std::time::Duration;
use tokio::sync::RwLock;

pub struct SqsJobQueue {
    client: RwLock<Client>,
    queue_url: String,
    region: String,
    wait: Duration,
    visibility: Duration,
}

impl SqsJobQueue {
    pub async fn connect(
        queue_url: &str,
        region: &str,
        wait: Duration,
        visibility: Duration,
    ) -> Self {
        let client = build_client(region).await;
        info!("SQS job queue ready: {} ({})", queue_url, region);
        Self {
            client: RwLock::new(client),
            queue_url: queue_url.to_string(),
            region: region.to_string(),
            wait,
            visibility,
        }
    }
}

async fn build_client(region: &str) -> Client {
    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await;
    Client::new(&config)
}

fn clamp_secs(d: Duration, max: u64) -> i32 {
    d.as_secs().min(max) as i32
}

#[async_trait]
impl JobQueue for SqsJobQueue {
    async fn receive(&self) -> Result<Option<QueueMessage>, QueueError> {
        let client = self.client.read().await.clone();
        let out = client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(clamp_secs(self.wait, 20))
            .visibility_timeout(clamp_secs(self.visibility, 43_200))
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| QueueError::Receive(DisplayErrorContext(&e).to_string()))?;

        let Some(msg) = out.messages().first() else {
            return Ok(None);
        };

        let receive_count = msg
            .attributes()
            .and_then(|a| a.get(&MessageSystemAttributeName::ApproximateReceiveCount))
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let message_id = msg.message_id().unwrap_or_default().to_string();
        let Some(receipt) = msg.receipt_handle().map(str::to_string) else {
            warn!("⚠ SQS message {} arrived without a receipt handle", message_id);
            return Err(QueueError::Receive(format!(
                "message {} has no receipt handle",
                message_id
            )));
        };

        Ok(Some(QueueMessage {
            message_id,
            receipt,
            body: msg.body().unwrap_or_default().to_string(),
            receive_count,
        }))
    }

    async fn acknowledge(&self, msg: &QueueMessage) -> Result<(), QueueError> {
        let client = self.client.read().await.clone();
        client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&msg.receipt)
            .send()
            .await
            .map_err(|e| QueueError::Acknowledge(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), QueueError> {
        let fresh = build_client(&self.region).await;
        *self.client.write().await = fresh;
        info!("SQS client rebuilt");
        Ok(())
    }
}

//! NATS publisher: one connection per message, no retry queue.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{BusMessage, PublishError, Publisher};

pub struct NatsPublisher {
    url: String,
    topic: String,
    timeout: Duration,
}

impl NatsPublisher {
    pub fn new(url: impl Into<String>, topic: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            topic: topic.into(),
            timeout,
        }
    }

    async fn send(&self, payload: Vec<u8>) -> Result<(), PublishError> {
        let client = async_nats::connect(self.url.as_str())
            .await
            .map_err(|e| PublishError::Connect {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;

        client
            .publish(self.topic.clone(), payload.into())
            .await
            .map_err(|e| PublishError::Publish {
                topic: self.topic.clone(),
                reason: e.to_string(),
            })?;

        client
            .flush()
            .await
            .map_err(|e| PublishError::Flush(e.to_string()))?;

        // Dropping the last handle closes the connection.
        drop(client);
        Ok(())
    }

    /// Publish and report the outcome instead of swallowing it.
    pub async fn try_publish(&self, message: &BusMessage) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(message)?;
        tokio::time::timeout(self.timeout, self.send(payload))
            .await
            .map_err(|_| PublishError::TimedOut(self.timeout))?
    }
}

#[async_trait]
impl Publisher for NatsPublisher {
    async fn publish(&self, message: &BusMessage) {
        match self.try_publish(message).await {
            Ok(()) => info!(
                topic = %self.topic,
                test_number = message.test_number,
                "published cycle result"
            ),
            Err(e) => warn!(
                topic = %self.topic,
                url = %self.url,
                test_number = message.test_number,
                error = %e,
                "publish failed; result kept in CSV only"
            ),
        }
    }
}

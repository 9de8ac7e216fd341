//! Durable job queue for one tenant.
//!
//! Thin wrapper over the broker channel: every operation re-fetches the
//! live channel from the connection manager and fails fast with
//! [`DispatchError::Connectivity`] when there is none, rather than
//! buffering silently.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::connection::ConnectionManager;
use crate::error::DispatchError;
use crate::transport::{BrokerChannel, Delivery};
use crate::types::DispatchJob;

pub struct JobQueue {
    name: String,
    connection: ConnectionManager,
}

impl JobQueue {
    pub fn new(name: impl Into<String>, connection: ConnectionManager) -> Self {
        Self {
            name: name.into(),
            connection,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, DispatchError> {
        match self.connection.channel().await {
            Some(channel) => Ok(channel),
            None if self.connection.is_shut_down().await => Err(DispatchError::Shutdown),
            None => Err(DispatchError::Connectivity),
        }
    }

    /// JSON-encode and publish one job.
    pub async fn enqueue(&self, job: &DispatchJob) -> Result<(), DispatchError> {
        let body =
            serde_json::to_vec(job).map_err(|err| DispatchError::Codec(err.to_string()))?;
        self.enqueue_raw(&body).await
    }

    /// Publish already-encoded job bytes verbatim. Used by the rate-limit
    /// retry path so the requeued copy is byte-identical to the original.
    pub async fn enqueue_raw(&self, body: &[u8]) -> Result<(), DispatchError> {
        let channel = self.channel().await?;
        channel.publish(&self.name, body).await?;
        Ok(())
    }

    /// Apply the prefetch cap and register a consumer.
    pub async fn consume(
        &self,
        prefetch: usize,
        consumer_tag: &str,
    ) -> Result<mpsc::Receiver<Delivery>, DispatchError> {
        let channel = self.channel().await?;
        channel.set_prefetch(prefetch).await?;
        let receiver = channel.consume(&self.name, consumer_tag).await?;
        Ok(receiver)
    }

    pub async fn ack(&self, delivery_tag: u64) -> Result<(), DispatchError> {
        let channel = self.channel().await?;
        channel.ack(delivery_tag).await?;
        Ok(())
    }

    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), DispatchError> {
        let channel = self.channel().await?;
        channel.cancel(consumer_tag).await?;
        Ok(())
    }

    /// Messages still owed to recipients: ready plus unacknowledged.
    pub async fn depth(&self) -> Result<usize, DispatchError> {
        let channel = self.channel().await?;
        let depth = channel.queue_depth(&self.name).await?;
        Ok(depth)
    }
}

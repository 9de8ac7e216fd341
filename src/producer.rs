//! Broadcast intake.
//!
//! Turns a broadcast request into queued jobs and hands back an identifier
//! immediately; delivery outcome is only observable through events. The
//! full-audience case enqueues a single deferred-expansion sentinel so the
//! caller never blocks on a potentially huge audience fetch.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::DispatchError;
use crate::queue::JobQueue;
use crate::types::{now_ms, BroadcastRecord, BroadcastRequest, DispatchJob, RecipientSelector};

/// Active broadcast identifiers, shared between the producer (insert) and
/// the queue monitor (completion sweep).
pub type BroadcastRegistry = Arc<Mutex<HashMap<String, BroadcastRecord>>>;

pub struct BroadcastProducer {
    queue: Arc<JobQueue>,
    audience_configured: bool,
    registry: BroadcastRegistry,
}

impl BroadcastProducer {
    pub fn new(
        queue: Arc<JobQueue>,
        audience_configured: bool,
        registry: BroadcastRegistry,
    ) -> Self {
        Self {
            queue,
            audience_configured,
            registry,
        }
    }

    /// Queue a broadcast and return its identifier.
    ///
    /// Fails synchronously on caller mistakes: a full-audience request with
    /// no audience source configured, or no live channel. Enqueue is
    /// fire-and-forget beyond that.
    pub async fn broadcast(&self, request: BroadcastRequest) -> Result<String, DispatchError> {
        if matches!(request.recipients, RecipientSelector::All) && !self.audience_configured {
            return Err(DispatchError::Configuration(
                "audience source is required for full-audience broadcasts".to_string(),
            ));
        }

        match request.recipients {
            RecipientSelector::All => {
                self.queue
                    .enqueue(&DispatchJob::fan_out(request.payload))
                    .await?;
            }
            RecipientSelector::List(recipients) => {
                for recipient_id in recipients {
                    self.queue
                        .enqueue(&DispatchJob::new(recipient_id, request.payload.clone()))
                        .await?;
                }
            }
        }

        let id = next_broadcast_id();
        let record = BroadcastRecord {
            id: id.clone(),
            created_at_ms: now_ms(),
        };
        self.registry.lock().await.insert(id.clone(), record);
        Ok(id)
    }

    /// Snapshot of broadcasts that have not completed yet.
    pub async fn active_broadcasts(&self) -> Vec<BroadcastRecord> {
        self.registry.lock().await.values().cloned().collect()
    }
}

/// Timestamp plus a random suffix. Collisions are treated as negligible,
/// not impossible.
fn next_broadcast_id() -> String {
    format!("{}-{:08x}", now_ms(), fastrand::u32(..))
}

use crate::batch::BatchPayload;
use crate::merkle::Hash;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionHandle {
    pub id: String,
    pub merkle_root: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmationKey {
    BatchId(String),
    MerkleRoot(Hash),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Confirmed { confirmation_ref: String },
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationEvent {
    pub key: ConfirmationKey,
    pub outcome: Outcome,
}

/// Opaque settlement layer. Confirmations are delivered at least once and in
/// no particular order.
#[async_trait]
pub trait SettlementChannel: Send + Sync {
    async fn submit(&self, payload: BatchPayload) -> anyhow::Result<SubmissionHandle>;
    fn subscribe_confirmations(&self) -> broadcast::Receiver<ConfirmationEvent>;
}

/// In-process settlement. A root is accepted once while its submission is
/// open; after a rejection the same root may be submitted again under a new
/// handle. Events name the batch id of the current submission, so a
/// redelivered outcome can never land on a later batch sharing the root.
#[derive(Clone)]
pub struct InMemorySettlement {
    open: Arc<Mutex<HashMap<Hash, (SubmissionHandle, BatchPayload)>>>,
    accepted: Arc<Mutex<Vec<BatchPayload>>>,
    events: broadcast::Sender<ConfirmationEvent>,
    fail_next: Arc<AtomicU32>,
    auto_confirm: bool,
}

impl InMemorySettlement {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            open: Arc::new(Mutex::new(HashMap::new())),
            accepted: Arc::new(Mutex::new(Vec::new())),
            events,
            fail_next: Arc::new(AtomicU32::new(0)),
            auto_confirm: false,
        }
    }

    /// Every accepted submission is confirmed immediately (devnet mode).
    pub fn auto_confirming(capacity: usize) -> Self {
        Self {
            auto_confirm: true,
            ..Self::new(capacity)
        }
    }

    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn deliver(&self, event: ConfirmationEvent) {
        let _ = self.events.send(event);
    }

    /// Settles the open submission for `merkle_root`.
    pub async fn confirm(&self, merkle_root: Hash) {
        let key = self.key_for(&merkle_root, false).await;
        self.deliver(ConfirmationEvent {
            key,
            outcome: Outcome::Confirmed {
                confirmation_ref: confirmation_ref(&merkle_root),
            },
        });
    }

    /// Rejects the open submission for `merkle_root` and reopens the root.
    pub async fn reject(&self, merkle_root: Hash, reason: &str) {
        let key = self.key_for(&merkle_root, true).await;
        self.deliver(ConfirmationEvent {
            key,
            outcome: Outcome::Rejected {
                reason: reason.to_string(),
            },
        });
    }

    async fn key_for(&self, merkle_root: &Hash, close: bool) -> ConfirmationKey {
        let mut open = self.open.lock().await;
        let batch_id = if close {
            open.remove(merkle_root).map(|(_, payload)| payload.batch_id)
        } else {
            open.get(merkle_root).map(|(_, payload)| payload.batch_id.clone())
        };
        match batch_id {
            Some(id) => ConfirmationKey::BatchId(id),
            None => ConfirmationKey::MerkleRoot(*merkle_root),
        }
    }

    /// Every payload ever accepted, in submission order.
    pub async fn submissions(&self) -> Vec<BatchPayload> {
        self.accepted.lock().await.clone()
    }
}

fn confirmation_ref(merkle_root: &Hash) -> String {
    format!("settle-{}", hex::encode(&merkle_root[..8]))
}

#[async_trait]
impl SettlementChannel for InMemorySettlement {
    async fn submit(&self, payload: BatchPayload) -> anyhow::Result<SubmissionHandle> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            anyhow::bail!("settlement layer unavailable");
        }
        let root = payload.merkle_root;
        let batch_id = payload.batch_id.clone();
        let handle = {
            let mut open = self.open.lock().await;
            if let Some((handle, _)) = open.get(&root) {
                debug!(root = %hex::encode(root), "resubmission of open root");
                return Ok(handle.clone());
            }
            let handle = SubmissionHandle {
                id: Uuid::new_v4().to_string(),
                merkle_root: root,
            };
            info!(batch_id = %batch_id, leaves = payload.leaves.len(), "settlement accepted batch");
            self.accepted.lock().await.push(payload.clone());
            open.insert(root, (handle.clone(), payload));
            handle
        };
        if self.auto_confirm {
            self.deliver(ConfirmationEvent {
                key: ConfirmationKey::BatchId(batch_id),
                outcome: Outcome::Confirmed {
                    confirmation_ref: confirmation_ref(&root),
                },
            });
        }
        Ok(handle)
    }

    fn subscribe_confirmations(&self) -> broadcast::Receiver<ConfirmationEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(batch_id: &str) -> BatchPayload {
        BatchPayload {
            batch_id: batch_id.to_string(),
            sequence: 0,
            merkle_root: [7u8; 32],
            leaves: Vec::new(),
        }
    }

    #[tokio::test]
    async fn rejected_root_is_accepted_again() {
        let settlement = InMemorySettlement::new(8);
        let mut events = settlement.subscribe_confirmations();
        let first = settlement.submit(payload("batch-0")).await.unwrap();
        assert_eq!(settlement.submit(payload("batch-0")).await.unwrap(), first);

        settlement.reject([7u8; 32], "bad").await;
        assert_eq!(
            events.recv().await.unwrap().key,
            ConfirmationKey::BatchId("batch-0".into())
        );

        let second = settlement.submit(payload("batch-1")).await.unwrap();
        assert_ne!(second.id, first.id);
        settlement.confirm([7u8; 32]).await;
        assert_eq!(
            events.recv().await.unwrap().key,
            ConfirmationKey::BatchId("batch-1".into())
        );
        assert_eq!(settlement.submissions().await.len(), 2);
    }
}

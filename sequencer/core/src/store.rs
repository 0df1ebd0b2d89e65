use crate::batch::Batch;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Durable batch state. `put` is called on seal and on every state
/// transition, before the transition is reported.
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn put(&self, batch: &Batch) -> anyhow::Result<()>;
    async fn get(&self, batch_id: &str) -> anyhow::Result<Option<Batch>>;
    async fn list(&self) -> anyhow::Result<Vec<Batch>>;
}

#[derive(Clone, Default)]
pub struct InMemoryBatchStore {
    inner: Arc<RwLock<HashMap<String, Batch>>>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn put(&self, batch: &Batch) -> anyhow::Result<()> {
        self.inner
            .write()
            .await
            .insert(batch.batch_id.clone(), batch.clone());
        Ok(())
    }

    async fn get(&self, batch_id: &str) -> anyhow::Result<Option<Batch>> {
        Ok(self.inner.read().await.get(batch_id).cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<Batch>> {
        let mut batches: Vec<Batch> = self.inner.read().await.values().cloned().collect();
        batches.sort_by_key(|b| b.sequence);
        Ok(batches)
    }
}

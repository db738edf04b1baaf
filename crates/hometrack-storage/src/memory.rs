use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hometrack_core::PropertyId;
use tokio::sync::RwLock;

use crate::{apply_batch, validate_batch, CommitBatch, PropertyRecord, PropertyStore, StoreError};

/// In-process store. Each commit swaps in a freshly built record, so a reader
/// holding the previous `Arc` keeps a consistent view.
#[derive(Debug, Default)]
pub struct InMemoryPropertyStore {
    records: RwLock<HashMap<PropertyId, Arc<PropertyRecord>>>,
}

impl InMemoryPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl PropertyStore for InMemoryPropertyStore {
    async fn get(&self, id: &PropertyId) -> Result<Option<Arc<PropertyRecord>>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn append_history(&self, batch: CommitBatch) -> Result<u64, StoreError> {
        let mut records = self.records.write().await;
        let current = records.get(&batch.property_id).cloned();
        validate_batch(current.as_deref(), &batch)?;
        let id = batch.property_id.clone();
        let next = apply_batch(current.as_deref(), batch);
        let version = next.version;
        records.insert(id, Arc::new(next));
        Ok(version)
    }

    async fn property_ids(&self) -> Result<Vec<PropertyId>, StoreError> {
        let mut ids: Vec<PropertyId> = self.records.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

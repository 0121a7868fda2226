use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::StoreError;
use crate::model::{ItemAttribute, NormalizedItem, SessionId};

/// Receives normalized items and attributes in batch upserts keyed by
/// `(session_id, source_id)`, and supports streamed/paginated reads for
/// the (out-of-scope) export/dashboard surface.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    async fn upsert_items(&self, items: Vec<NormalizedItem>) -> Result<(), StoreError>;

    async fn upsert_attributes(&self, attrs: Vec<ItemAttribute>) -> Result<(), StoreError>;

    async fn get_item(
        &self,
        session_id: SessionId,
        source_id: &str,
    ) -> Result<Option<NormalizedItem>, StoreError>;

    async fn list_items(
        &self,
        session_id: SessionId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<NormalizedItem>, StoreError>;

    async fn count_items(&self, session_id: SessionId) -> Result<usize, StoreError>;

    async fn clear_session(&self, session_id: SessionId) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryDestinationStore {
    items: DashMap<(SessionId, String), NormalizedItem>,
    attributes: DashMap<(SessionId, String), Vec<ItemAttribute>>,
}

impl InMemoryDestinationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DestinationStore for InMemoryDestinationStore {
    async fn upsert_items(&self, items: Vec<NormalizedItem>) -> Result<(), StoreError> {
        for item in items {
            self.items
                .insert((item.session_id, item.source_id.clone()), item);
        }
        Ok(())
    }

    async fn upsert_attributes(&self, attrs: Vec<ItemAttribute>) -> Result<(), StoreError> {
        for attr in attrs {
            self.attributes
                .entry((attr.session_id, attr.source_id.clone()))
                .or_default()
                .push(attr);
        }
        Ok(())
    }

    async fn get_item(
        &self,
        session_id: SessionId,
        source_id: &str,
    ) -> Result<Option<NormalizedItem>, StoreError> {
        Ok(self
            .items
            .get(&(session_id, source_id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn list_items(
        &self,
        session_id: SessionId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<NormalizedItem>, StoreError> {
        let mut items: Vec<NormalizedItem> = self
            .items
            .iter()
            .filter(|entry| entry.key().0 == session_id)
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(items.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_items(&self, session_id: SessionId) -> Result<usize, StoreError> {
        Ok(self
            .items
            .iter()
            .filter(|entry| entry.key().0 == session_id)
            .count())
    }

    async fn clear_session(&self, session_id: SessionId) -> Result<(), StoreError> {
        self.items.retain(|key, _| key.0 != session_id);
        self.attributes.retain(|key, _| key.0 != session_id);
        Ok(())
    }
}

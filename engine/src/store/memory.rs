use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use shared_types::ConversationState;

use super::{strip_ancillary, StateStore, StoreError};

/// In-memory state store for tests and single-process development runs.
///
/// Applies the same ancillary-payload stripping as the SQLite store so
/// tests observe production persistence semantics.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStore {
    states: Arc<Mutex<HashMap<String, ConversationState>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, id: &str) -> Result<ConversationState, StoreError> {
        self.states
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn put(&self, state: &ConversationState) -> Result<(), StoreError> {
        self.states
            .lock()
            .await
            .insert(state.id.clone(), strip_ancillary(state));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_and_not_found() {
        let store = InMemoryStateStore::new();
        let state = ConversationState::new("conv_mem", "objective");
        store.put(&state).await.unwrap();

        assert_eq!(store.get("conv_mem").await.unwrap().id, "conv_mem");
        assert!(matches!(
            store.get("missing").await,
            Err(StoreError::NotFound(_))
        ));
    }
}

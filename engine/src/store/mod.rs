//! Conversation state persistence.
//!
//! The state store is the only durable surface the engine mutates. Bulky
//! ancillary payloads (parsed upload text) are stripped from the persisted
//! copy while the in-memory working copy keeps them for the remainder of
//! the current run.
//!
//! Store failures are always surfaced to the caller - losing the ability
//! to track run ownership is unsafe to ignore.

use async_trait::async_trait;
use shared_types::ConversationState;

mod memory;
mod sqlite;

pub use memory::InMemoryStateStore;
pub use sqlite::{connect, SqliteStateStore};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conversation state not found: {0}")]
    NotFound(String),
    #[error("state store backend error: {0}")]
    Backend(String),
    #[error("state encode error: {0}")]
    Encode(String),
    #[error("state decode error: {0}")]
    Decode(String),
}

/// Durable store for [`ConversationState`] records, keyed by id.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<ConversationState, StoreError>;

    /// Upsert the state. Implementations persist a stripped copy (see
    /// [`strip_ancillary`]); the caller's working copy is not modified.
    async fn put(&self, state: &ConversationState) -> Result<(), StoreError>;
}

/// Clone the state with bulky ancillary payloads removed.
///
/// Uploaded file bodies can be megabytes of parsed text; only their ids,
/// names, and storage paths belong in the durable record.
pub fn strip_ancillary(state: &ConversationState) -> ConversationState {
    let mut stripped = state.clone();
    for file in &mut stripped.uploaded_files {
        file.text = None;
    }
    stripped
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::UploadedFile;

    #[test]
    fn test_strip_ancillary_clears_upload_text_only() {
        let mut state = ConversationState::new("conv_1", "objective");
        state.uploaded_files.push(UploadedFile {
            id: "file_1".to_string(),
            name: "cohort.csv".to_string(),
            path: "/uploads/conv_1/cohort.csv".to_string(),
            text: Some("col_a,col_b\n1,2".to_string()),
        });

        let stripped = strip_ancillary(&state);
        assert!(stripped.uploaded_files[0].text.is_none());
        assert_eq!(stripped.uploaded_files[0].path, state.uploaded_files[0].path);
        // The working copy keeps its payload.
        assert!(state.uploaded_files[0].text.is_some());
    }
}

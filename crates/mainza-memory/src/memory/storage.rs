//! ============================================================================
//! Storage Service - Validated, scored, transactional memory writes
//! ============================================================================
//! store():
//! 1. validate the request (no I/O before this passes)
//! 2. embed the content; a provider failure stores the record without one
//! 3. score importance/significance and extract concepts
//! 4. resolve the consciousness snapshot link
//! 5. persist user + memory + concepts + snapshot in one backend write
//! ============================================================================

use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use super::concepts::extract_concepts;
use super::embeddings::{check_dimensions, EmbeddingProvider};
use super::scoring;
use super::types::{normalize_user_id, MemoryRecord, StoreRequest};
use crate::backend::{MemoryBackend, MemoryWrite};
use crate::clock::Clock;
use crate::consciousness::SnapshotTracker;
use crate::error::{MemoryError, Result};

pub struct StorageService {
    backend: Arc<dyn MemoryBackend>,
    embedder: Arc<dyn EmbeddingProvider>,
    clock: Arc<dyn Clock>,
    snapshots: SnapshotTracker,
}

impl StorageService {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        embedder: Arc<dyn EmbeddingProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            embedder,
            clock,
            snapshots: SnapshotTracker::new(),
        }
    }

    /// Reject requests that must never reach the store
    pub fn validate(request: &StoreRequest) -> Result<()> {
        if normalize_user_id(&request.user_id).is_empty() {
            return Err(MemoryError::validation("user_id", "must not be empty"));
        }
        if request.agent_name.trim().is_empty() {
            return Err(MemoryError::validation("agent_name", "must not be empty"));
        }
        request.consciousness.validate()?;
        match &request.metadata {
            None | Some(Value::Object(_)) | Some(Value::Null) => Ok(()),
            Some(other) => Err(MemoryError::validation(
                "metadata",
                format!("expected a JSON object, got {}", json_kind(other)),
            )),
        }
    }

    /// Embed `content`, logging and swallowing provider failures
    async fn embed_or_skip(&self, content: &str) -> Option<Vec<f32>> {
        if content.trim().is_empty() {
            return None;
        }
        let result = match self.embedder.embed(content).await {
            Ok(v) => check_dimensions(v),
            Err(e) => Err(e),
        };
        match result {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                warn!(
                    "Embedding via {} failed, storing without vector: {}",
                    self.embedder.name(),
                    e
                );
                None
            }
        }
    }

    /// Persist one memory and return its id
    pub async fn store(&self, request: StoreRequest) -> Result<String> {
        Self::validate(&request)?;

        let now = self.clock.now();
        let embedding = self.embed_or_skip(&request.content).await;

        let mut record = MemoryRecord::new(
            normalize_user_id(&request.user_id),
            request.agent_name.trim(),
            &request.content,
            request.memory_type,
            &request.consciousness,
            now,
        );
        let concepts = extract_concepts(&record.content);
        record.importance_score =
            scoring::importance(&record.content, request.memory_type, &request.consciousness);
        record.significance_score =
            scoring::initial_significance(record.importance_score, concepts.len());
        record.concept_count = concepts.len();
        record.embedding = embedding;
        if let Some(Value::Object(map)) = request.metadata {
            record.metadata = map;
        }

        let link = self.snapshots.link_for(&request.consciousness, now);
        record.snapshot_id = Some(link.snapshot_id().to_string());
        let new_snapshot_id = link.is_new().then(|| link.snapshot_id().to_string());
        let snapshot = Some(link.into_snapshot());

        let memory_id = record.memory_id.clone();
        let user_id = record.user_id.clone();
        let importance = record.importance_score;

        if let Err(e) = self
            .backend
            .persist(MemoryWrite {
                record,
                concepts,
                snapshot,
            })
            .await
        {
            // Start a fresh snapshot rather than reuse one that may never land
            if let Some(id) = new_snapshot_id {
                self.snapshots.invalidate(&id);
            }
            warn!("Failed to store memory for user {}: {}", user_id, e);
            return Err(e.into_storage());
        }

        info!(
            "Stored memory {} for user {} (importance {:.2})",
            memory_id, user_id, importance
        );
        Ok(memory_id)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

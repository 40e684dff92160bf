//! ============================================================================
//! Memory Backends - Persistence behind one trait
//! ============================================================================
//! - `GraphBackend`: Neo4j through the resilient `GraphClient`
//! - `EmbeddedBackend`: redb, file-backed or in-memory
//! Services above this layer never see Cypher, HTTP or redb types.
//! ============================================================================

pub mod embedded;
pub mod graph;

pub use embedded::EmbeddedBackend;
pub use graph::GraphBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::consciousness::ConsciousnessSnapshot;
use crate::error::Result;
use crate::graph::{CircuitState, SchemaReport};
use crate::memory::types::{ConceptLink, LifecycleState, MemoryRecord, MemoryStats};

/// Everything persisted by one `store` call, written atomically
#[derive(Debug, Clone)]
pub struct MemoryWrite {
    pub record: MemoryRecord,
    pub concepts: Vec<ConceptLink>,
    /// Snapshot the memory was created during; upserted with the memory
    pub snapshot: Option<ConsciousnessSnapshot>,
}

/// A candidate with its raw relevance in [0, 1]
#[derive(Debug, Clone)]
pub struct Candidate {
    pub record: MemoryRecord,
    pub score: f32,
}

/// A memory reached from a seed through shared concepts
#[derive(Debug, Clone)]
pub struct ConceptNeighbor {
    pub record: MemoryRecord,
    /// 1 or 2
    pub hops: u8,
    /// Link strength from the neighbor to the concept it was reached through
    pub strength: f32,
}

/// Score and state changes produced by one lifecycle step
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleUpdate {
    pub memory_id: String,
    pub importance_score: f32,
    pub significance_score: f32,
    pub lifecycle_state: LifecycleState,
    pub last_decayed_at: DateTime<Utc>,
    pub access_count_at_sweep: u64,
}

#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Short name for logs and health output
    fn kind(&self) -> &'static str;

    /// Create or verify storage structures. Idempotent.
    async fn ensure_schema(&self) -> Result<SchemaReport>;

    /// Upsert the user, create the memory, link concepts and snapshot
    async fn persist(&self, write: MemoryWrite) -> Result<()>;

    /// Look up a hot or archived memory
    async fn get(&self, memory_id: &str) -> Result<Option<MemoryRecord>>;

    /// Nearest hot memories of `user_id` by cosine similarity
    async fn vector_candidates(
        &self,
        user_id: &str,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<Candidate>>;

    /// Hot memories of `user_id` matching the query text
    async fn keyword_candidates(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>>;

    /// Hot memories sharing concepts with `seeds`, up to `depth` hops (max 2)
    async fn concept_neighbors(
        &self,
        user_id: &str,
        seeds: &[String],
        depth: u8,
        limit: usize,
    ) -> Result<Vec<ConceptNeighbor>>;

    /// Increment `access_count` and set `last_accessed` for each id
    async fn record_access(&self, memory_ids: &[String], at: DateTime<Utc>) -> Result<()>;

    /// Hot and archived memories with `memory_id > after`, ordered by id
    async fn lifecycle_batch(&self, after: Option<&str>, limit: usize) -> Result<Vec<MemoryRecord>>;

    async fn apply_update(&self, update: &LifecycleUpdate) -> Result<()>;

    /// Move a memory out of the hot indexes. A given `update` lands in the
    /// same transaction, so the archived row never carries stale scores.
    async fn archive(&self, memory_id: &str, update: Option<&LifecycleUpdate>) -> Result<()>;

    /// Remove a memory and its relationships; false if it did not exist
    async fn delete(&self, memory_id: &str) -> Result<bool>;

    /// Stale hot memories that carry embeddings, ordered by user then id
    async fn stale_candidates(&self, limit: usize) -> Result<Vec<MemoryRecord>>;

    /// Remove the user and all of their memories; returns memories removed
    async fn delete_user(&self, user_id: &str) -> Result<u64>;

    async fn stats(&self) -> Result<MemoryStats>;

    /// Cheap liveness check
    async fn ping(&self) -> Result<()>;

    /// Breaker state for backends that sit behind one
    fn circuit_state(&self) -> Option<CircuitState> {
        None
    }
}

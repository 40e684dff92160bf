//! ============================================================================
//! Memory Module - Consciousness-aware memory for Mainza agents
//! ============================================================================
//! Stores agent memories with importance scores, concept links and the
//! consciousness state they were formed in, and retrieves them through
//! hybrid vector + keyword + concept-graph search.
//!
//! ## Features
//! - Validated, scored, transactional writes
//! - Hybrid retrieval ranked by relevance, decayed importance and alignment
//! - Bounded context blocks for prompting
//! - Background decay, archival and consolidation
//! - Per-user memory isolation
//!
//! ## Architecture
//! ```text
//! StoreRequest → Validate → Embed → Score + Concepts → Backend (one write)
//!
//! SearchRequest → Embed query ─┬─ Vector candidates ─┐
//!                              └─ Keyword candidates ┴→ Filter → Score
//!                                                         ↓
//!                                  Concept expansion → Rank → Access queue
//!
//! LifecycleManager ──(interval)──→ Decay → Stale → Archive → Delete
//!                                       └→ Consolidate similar stale memories
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use mainza_memory::{MemoryConfig, MemoryManager, SearchRequest, StoreRequest};
//!
//! let manager = MemoryManager::connect(MemoryConfig::from_env()?).await?;
//!
//! // Store a memory
//! let id = manager.store(StoreRequest::new(user_id, "mainza", "I love discussing consciousness")).await?;
//!
//! // Search memories
//! let relevant = manager.search(&SearchRequest::new(user_id, "consciousness", 5)).await?;
//! let context = manager.build_context("consciousness", user_id, 2000).await?;
//! ```
//! ============================================================================

pub mod access;
pub mod concepts;
pub mod context;
pub mod embeddings;
pub mod health;
pub mod lifecycle;
pub mod manager;
pub mod retrieval;
pub mod scoring;
pub mod storage;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export public types
pub use access::AccessRecorder;
pub use context::{build_context, ContextBuilder};
pub use embeddings::{
    create_embedding_provider, CachedEmbedder, EmbeddingProvider, HashingEmbedder,
    HttpEmbeddingService, EMBEDDING_DIM,
};
pub use health::{ComponentHealth, HealthComponents, HealthReport, HealthStatus};
pub use lifecycle::{LifecycleManager, LifecycleReport};
pub use manager::MemoryManager;
pub use retrieval::RetrievalService;
pub use storage::StorageService;
pub use types::{
    Concept, ConceptLink, LifecycleState, MatchSource, MemoryRecord, MemoryStats, MemoryType,
    RetrievedMemory, SearchRequest, StoreRequest,
};

//! ============================================================================
//! MAINZA-MEMORY: Consciousness-aware memory subsystem
//! ============================================================================
//! This crate handles persistent memory for Mainza agents:
//! - Neo4j graph backend behind a pooled, retrying, circuit-broken client
//! - Embedded redb backend for local and test use
//! - Hybrid retrieval and bounded context building
//! - Background lifecycle: decay, archival, consolidation
//! ============================================================================

pub mod backend;
pub mod clock;
pub mod config;
pub mod consciousness;
pub mod error;
pub mod graph;
pub mod memory;

// Re-export main types for convenience
pub use backend::{EmbeddedBackend, GraphBackend, MemoryBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackendKind, MemoryConfig};
pub use consciousness::{ConsciousnessContext, ConsciousnessSnapshot, EmotionalState};
pub use error::{MemoryError, Result};
pub use memory::*;

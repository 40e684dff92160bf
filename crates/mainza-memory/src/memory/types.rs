//! ============================================================================
//! Memory Types - Records, concepts and request shapes
//! ============================================================================
//! `MemoryRecord` is the strongly typed memory entity; `metadata` is the only
//! open-ended field. Requests carry the caller's consciousness context
//! explicitly.
//! ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::consciousness::{ConsciousnessContext, EmotionalState};
use crate::error::{MemoryError, Result};

/// Content longer than this is truncated on a char boundary
pub const MAX_CONTENT_CHARS: usize = 10_000;

/// Kinds of memories that can be stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// A user/agent exchange
    Interaction,
    /// Agent self-reflection
    Reflection,
    /// Derived insight
    Insight,
    /// Summary of several stale memories
    Consolidated,
    /// Explicit link between concepts
    ConceptLink,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Interaction => "interaction",
            MemoryType::Reflection => "reflection",
            MemoryType::Insight => "insight",
            MemoryType::Consolidated => "consolidated",
            MemoryType::ConceptLink => "concept_link",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "interaction" => Ok(MemoryType::Interaction),
            "reflection" => Ok(MemoryType::Reflection),
            "insight" => Ok(MemoryType::Insight),
            "consolidated" => Ok(MemoryType::Consolidated),
            "concept_link" | "conceptlink" => Ok(MemoryType::ConceptLink),
            _ => Err(MemoryError::validation(
                "memory_type",
                format!("unknown memory type '{}'", s),
            )),
        }
    }
}

/// Where a record sits in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Active,
    Stale,
    Archived,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Active => "active",
            LifecycleState::Stale => "stale",
            LifecycleState::Archived => "archived",
        }
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(LifecycleState::Active),
            "stale" => Ok(LifecycleState::Stale),
            "archived" => Ok(LifecycleState::Archived),
            other => Err(MemoryError::Storage(format!(
                "unknown lifecycle state '{}'",
                other
            ))),
        }
    }
}

/// A single persisted memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub memory_id: String,
    pub content: String,
    pub memory_type: MemoryType,
    pub user_id: String,
    /// Capability that produced the memory
    pub agent_name: String,
    pub consciousness_level: f32,
    pub emotional_state: EmotionalState,
    /// Short-horizon salience (0.0 - 1.0)
    pub importance_score: f32,
    /// Long-horizon durability (0.0 - 1.0)
    pub significance_score: f32,
    /// `None` when the embedding provider failed at write time
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub lifecycle_state: LifecycleState,
    pub last_decayed_at: DateTime<Utc>,
    pub access_count_at_sweep: u64,
    /// Concepts linked at write time
    #[serde(default)]
    pub concept_count: usize,
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

impl MemoryRecord {
    /// Create a new memory stamped at `now` with a fresh id
    pub fn new(
        user_id: impl Into<String>,
        agent_name: impl Into<String>,
        content: &str,
        memory_type: MemoryType,
        context: &ConsciousnessContext,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            memory_id: Uuid::new_v4().to_string(),
            content: truncate_chars(content, MAX_CONTENT_CHARS),
            memory_type,
            user_id: user_id.into(),
            agent_name: agent_name.into(),
            consciousness_level: context.level,
            emotional_state: context.emotional_state,
            importance_score: 0.5,
            significance_score: 0.5,
            embedding: None,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            metadata: Map::new(),
            lifecycle_state: LifecycleState::Active,
            last_decayed_at: now,
            access_count_at_sweep: 0,
            concept_count: 0,
            snapshot_id: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding.is_some()
    }

    pub fn metadata_json(&self) -> String {
        Value::Object(self.metadata.clone()).to_string()
    }
}

/// Canonical form of a user id as stored and matched
pub fn normalize_user_id(raw: &str) -> &str {
    raw.trim()
}

/// Truncate to at most `max` characters without splitting a char
pub fn truncate_chars(content: &str, max: usize) -> String {
    match content.char_indices().nth(max) {
        Some((byte_idx, _)) => content[..byte_idx].to_string(),
        None => content.to_string(),
    }
}

/// A named concept shared across memories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub concept_id: String,
    pub name: String,
    pub importance_score: f32,
    pub usage_frequency: u64,
}

/// A concept extracted from one memory, with the link strength to it
#[derive(Debug, Clone, PartialEq)]
pub struct ConceptLink {
    pub name: String,
    pub strength: f32,
}

/// Input to `MemoryManager::store`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRequest {
    pub content: String,
    pub memory_type: MemoryType,
    pub user_id: String,
    pub agent_name: String,
    #[serde(default)]
    pub consciousness: ConsciousnessContext,
    /// Must be a JSON object when present
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl StoreRequest {
    /// Create a new interaction store request with the default context
    pub fn new(
        user_id: impl Into<String>,
        agent_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            memory_type: MemoryType::Interaction,
            user_id: user_id.into(),
            agent_name: agent_name.into(),
            consciousness: ConsciousnessContext::default(),
            metadata: None,
        }
    }

    pub fn memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self
    }

    pub fn consciousness(mut self, context: ConsciousnessContext) -> Self {
        self.consciousness = context;
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Input to `MemoryManager::search`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub user_id: String,
    pub limit: usize,
    #[serde(default)]
    pub memory_types: Option<Vec<MemoryType>>,
    /// Drop records created below this consciousness level
    #[serde(default)]
    pub consciousness_threshold: Option<f32>,
    /// Overrides the configured vector similarity floor
    #[serde(default)]
    pub similarity_threshold: Option<f32>,
    #[serde(default)]
    pub consciousness: ConsciousnessContext,
    #[serde(default = "default_expand")]
    pub expand_concepts: bool,
}

fn default_expand() -> bool {
    true
}

impl SearchRequest {
    pub fn new(user_id: impl Into<String>, query: impl Into<String>, limit: usize) -> Self {
        Self {
            query: query.into(),
            user_id: user_id.into(),
            limit,
            memory_types: None,
            consciousness_threshold: None,
            similarity_threshold: None,
            consciousness: ConsciousnessContext::default(),
            expand_concepts: true,
        }
    }

    pub fn memory_types(mut self, types: Vec<MemoryType>) -> Self {
        self.memory_types = Some(types);
        self
    }

    pub fn consciousness_threshold(mut self, threshold: f32) -> Self {
        self.consciousness_threshold = Some(threshold);
        self
    }

    pub fn consciousness(mut self, context: ConsciousnessContext) -> Self {
        self.consciousness = context;
        self
    }

    pub fn without_expansion(mut self) -> Self {
        self.expand_concepts = false;
        self
    }

    /// The user id in its stored form
    pub fn user(&self) -> &str {
        normalize_user_id(&self.user_id)
    }

    /// Whether a record passes the type and consciousness filters
    pub fn admits(&self, record: &MemoryRecord) -> bool {
        if record.user_id != self.user() {
            return false;
        }
        if let Some(types) = &self.memory_types {
            if !types.contains(&record.memory_type) {
                return false;
            }
        }
        if let Some(threshold) = self.consciousness_threshold {
            if record.consciousness_level < threshold {
                return false;
            }
        }
        true
    }
}

/// How a result was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Vector,
    Keyword,
    /// Found by both vector and keyword search
    Hybrid,
    /// Reached through shared concepts from another hit
    ConceptExpansion,
}

/// A ranked search hit
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedMemory {
    pub record: MemoryRecord,
    /// Final ranking score
    pub score: f32,
    /// Query relevance before weighting
    pub relevance: f32,
    pub source: MatchSource,
}

/// Counters reported by `MemoryManager::stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub users: u64,
    pub active: u64,
    pub stale: u64,
    pub archived: u64,
    pub concepts: u64,
    pub snapshots: u64,
    pub missing_embeddings: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_type_round_trip_names() {
        for t in [
            MemoryType::Interaction,
            MemoryType::Reflection,
            MemoryType::Insight,
            MemoryType::Consolidated,
            MemoryType::ConceptLink,
        ] {
            assert_eq!(t.as_str().parse::<MemoryType>().unwrap(), t);
        }
        assert!("dream".parse::<MemoryType>().is_err());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "héllo wörld";
        assert_eq!(truncate_chars(s, 4), "héll");
        assert_eq!(truncate_chars(s, 100), s);

        let long = "é".repeat(MAX_CONTENT_CHARS + 5);
        let record = MemoryRecord::new(
            "u1",
            "agent",
            &long,
            MemoryType::Interaction,
            &ConsciousnessContext::default(),
            Utc::now(),
        );
        assert_eq!(record.content.chars().count(), MAX_CONTENT_CHARS);
    }

    #[test]
    fn test_new_record_ids_are_unique() {
        let ctx = ConsciousnessContext::default();
        let now = Utc::now();
        let a = MemoryRecord::new("u1", "agent", "a", MemoryType::Interaction, &ctx, now);
        let b = MemoryRecord::new("u1", "agent", "a", MemoryType::Interaction, &ctx, now);
        assert_ne!(a.memory_id, b.memory_id);
        assert_eq!(a.lifecycle_state, LifecycleState::Active);
        assert!(!a.has_embedding());
    }

    #[test]
    fn test_search_filters() {
        let ctx = ConsciousnessContext::new(0.4, EmotionalState::Focused, 0.5);
        let record = MemoryRecord::new("u1", "agent", "x", MemoryType::Insight, &ctx, Utc::now());

        assert!(SearchRequest::new("u1", "x", 5).admits(&record));
        assert!(!SearchRequest::new("u2", "x", 5).admits(&record));
        assert!(!SearchRequest::new("u1", "x", 5)
            .memory_types(vec![MemoryType::Reflection])
            .admits(&record));
        assert!(!SearchRequest::new("u1", "x", 5)
            .consciousness_threshold(0.5)
            .admits(&record));
    }
}

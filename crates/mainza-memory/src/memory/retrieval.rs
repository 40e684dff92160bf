//! ============================================================================
//! Retrieval Service - Hybrid, consciousness-aware memory search
//! ============================================================================
//! 1. candidates: vector (when the query embeds) + keyword, unioned
//! 2. filters: user, memory types, consciousness threshold, similarity floor
//! 3. score = w_rel * relevance + w_imp * decayed importance + w_con * alignment
//! 4. optional concept expansion from the top hits (0.5 / 0.25 per hop)
//! 5. sort, truncate, queue access write-back
//! ============================================================================

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::access::AccessRecorder;
use super::embeddings::{check_dimensions, EmbeddingProvider};
use super::scoring::{consciousness_alignment, decay_factor};
use super::types::{MatchSource, MemoryRecord, RetrievedMemory, SearchRequest};
use crate::backend::MemoryBackend;
use crate::clock::{hours_between, Clock};
use crate::config::RetrievalConfig;
use crate::consciousness::ConsciousnessContext;
use crate::error::{MemoryError, Result};

/// Largest `limit` a single search may ask for
pub const MAX_SEARCH_LIMIT: usize = 1_000;

/// Relevance multiplier for memories reached through shared concepts
fn hop_weight(hops: u8) -> f32 {
    match hops {
        1 => 0.5,
        2 => 0.25,
        _ => 0.0,
    }
}

struct Hit {
    record: MemoryRecord,
    vector: Option<f32>,
    keyword: Option<f32>,
}

impl Hit {
    fn relevance(&self) -> f32 {
        self.vector
            .unwrap_or(0.0)
            .max(self.keyword.unwrap_or(0.0))
            .clamp(0.0, 1.0)
    }

    fn source(&self) -> MatchSource {
        match (self.vector, self.keyword) {
            (Some(_), Some(_)) => MatchSource::Hybrid,
            (Some(_), None) => MatchSource::Vector,
            _ => MatchSource::Keyword,
        }
    }
}

pub struct RetrievalService {
    backend: Arc<dyn MemoryBackend>,
    embedder: Arc<dyn EmbeddingProvider>,
    clock: Arc<dyn Clock>,
    config: RetrievalConfig,
    access: Option<Arc<AccessRecorder>>,
}

impl RetrievalService {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        embedder: Arc<dyn EmbeddingProvider>,
        clock: Arc<dyn Clock>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            backend,
            embedder,
            clock,
            config,
            access: None,
        }
    }

    /// Queue access updates for returned memories
    pub fn with_access_recorder(mut self, access: Arc<AccessRecorder>) -> Self {
        self.access = Some(access);
        self
    }

    /// Final ranking score for a record with the given query relevance
    pub fn score(
        &self,
        record: &MemoryRecord,
        relevance: f32,
        context: &ConsciousnessContext,
        now: DateTime<Utc>,
    ) -> f32 {
        let age = hours_between(record.created_at, now);
        let decayed =
            record.importance_score as f64 * decay_factor(age, self.config.decay_half_life_hours);
        let alignment = consciousness_alignment(record.consciousness_level, context.level);

        self.config.relevance_weight * relevance
            + self.config.importance_weight * decayed as f32
            + self.config.consciousness_weight * alignment
    }

    fn validate(request: &SearchRequest) -> Result<()> {
        if request.user().is_empty() {
            return Err(MemoryError::validation("user_id", "must not be empty"));
        }
        if request.limit > MAX_SEARCH_LIMIT {
            return Err(MemoryError::validation(
                "limit",
                format!("{} exceeds the maximum of {}", request.limit, MAX_SEARCH_LIMIT),
            ));
        }
        if let Some(threshold) = request.consciousness_threshold {
            if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
                return Err(MemoryError::validation(
                    "consciousness_threshold",
                    format!("{} is outside [0, 1]", threshold),
                ));
            }
        }
        request.consciousness.validate()
    }

    async fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        if query.trim().is_empty() {
            return None;
        }
        let result = match self.embedder.embed(query).await {
            Ok(v) => check_dimensions(v),
            Err(e) => Err(e),
        };
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Query embedding unavailable, using keyword and graph search only: {}", e);
                None
            }
        }
    }

    /// Ranked memories with scores and match sources
    pub async fn search_scored(&self, request: &SearchRequest) -> Result<Vec<RetrievedMemory>> {
        Self::validate(request)?;
        if request.limit == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let fetch = request.limit.saturating_mul(self.config.candidate_multiplier.max(1));
        let similarity_floor = request
            .similarity_threshold
            .unwrap_or(self.config.similarity_threshold);

        let embedding = self.embed_query(&request.query).await;
        let vector_fut = async {
            match &embedding {
                Some(e) => {
                    self.backend
                        .vector_candidates(request.user(), e, fetch)
                        .await
                }
                None => Ok(Vec::new()),
            }
        };
        let keyword_fut = self
            .backend
            .keyword_candidates(request.user(), &request.query, fetch);
        let (vector, keyword) = tokio::join!(vector_fut, keyword_fut);
        let vector = vector.map_err(MemoryError::into_retrieval)?;
        let keyword = keyword.map_err(MemoryError::into_retrieval)?;

        let mut hits: HashMap<String, Hit> = HashMap::new();
        for candidate in vector {
            if candidate.score < similarity_floor || !request.admits(&candidate.record) {
                continue;
            }
            hits.insert(
                candidate.record.memory_id.clone(),
                Hit {
                    record: candidate.record,
                    vector: Some(candidate.score),
                    keyword: None,
                },
            );
        }
        for candidate in keyword {
            if !request.admits(&candidate.record) {
                continue;
            }
            hits.entry(candidate.record.memory_id.clone())
                .and_modify(|h| h.keyword = Some(candidate.score))
                .or_insert(Hit {
                    record: candidate.record,
                    vector: None,
                    keyword: Some(candidate.score),
                });
        }

        let mut results: Vec<RetrievedMemory> = hits
            .into_values()
            .map(|hit| {
                let relevance = hit.relevance();
                let source = hit.source();
                let score = self.score(&hit.record, relevance, &request.consciousness, now);
                RetrievedMemory {
                    record: hit.record,
                    score,
                    relevance,
                    source,
                }
            })
            .collect();
        sort_ranked(&mut results);

        if request.expand_concepts && self.config.expansion_depth > 0 && !results.is_empty() {
            self.expand(request, &mut results, fetch, now).await?;
            sort_ranked(&mut results);
        }

        results.truncate(request.limit);
        debug!(
            "Search for user {} returned {} memories",
            request.user(),
            results.len()
        );

        if let Some(access) = &self.access {
            access.record(
                results.iter().map(|r| r.record.memory_id.clone()).collect(),
                now,
            );
        }
        Ok(results)
    }

    /// Add memories sharing concepts with the top results
    async fn expand(
        &self,
        request: &SearchRequest,
        results: &mut Vec<RetrievedMemory>,
        fetch: usize,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let seeds: Vec<String> = results
            .iter()
            .take(self.config.expansion_seeds.max(1))
            .map(|r| r.record.memory_id.clone())
            .collect();
        let neighbors = self
            .backend
            .concept_neighbors(request.user(), &seeds, self.config.expansion_depth, fetch)
            .await
            .map_err(MemoryError::into_retrieval)?;

        let mut added = 0usize;
        for neighbor in neighbors {
            if !request.admits(&neighbor.record)
                || results
                    .iter()
                    .any(|r| r.record.memory_id == neighbor.record.memory_id)
            {
                continue;
            }
            let relevance = hop_weight(neighbor.hops) * neighbor.strength.clamp(0.0, 1.0);
            let score = self.score(&neighbor.record, relevance, &request.consciousness, now);
            results.push(RetrievedMemory {
                record: neighbor.record,
                score,
                relevance,
                source: MatchSource::ConceptExpansion,
            });
            added += 1;
        }
        if added > 0 {
            debug!("Concept expansion added {} memories", added);
        }
        Ok(())
    }

    /// Ranked records only
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<MemoryRecord>> {
        Ok(self
            .search_scored(request)
            .await?
            .into_iter()
            .map(|r| r.record)
            .collect())
    }
}

/// Score descending, newest first on ties, then id for determinism
fn sort_ranked(results: &mut [RetrievedMemory]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(b.record.created_at.cmp(&a.record.created_at))
            .then(a.record.memory_id.cmp(&b.record.memory_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consciousness::EmotionalState;
    use crate::memory::embeddings::test_support::FlakyEmbedder;
    use crate::memory::storage::StorageService;
    use crate::memory::testing::Fixture;
    use crate::memory::types::{MemoryType, StoreRequest};
    use chrono::Duration;
    use std::collections::HashSet;

    fn services(fx: &Fixture) -> (StorageService, RetrievalService) {
        let storage = StorageService::new(fx.backend_dyn(), fx.embedder.clone(), fx.clock.clone());
        let retrieval = RetrievalService::new(
            fx.backend_dyn(),
            fx.embedder.clone(),
            fx.clock.clone(),
            RetrievalConfig::default(),
        );
        (storage, retrieval)
    }

    #[tokio::test]
    async fn test_example_scenario_ranking() {
        let fx = Fixture::new().await;
        let (storage, retrieval) = services(&fx);
        let at = |level: f32| ConsciousnessContext::new(level, EmotionalState::Curious, 0.7);
        let reflection = storage
            .store(
                StoreRequest::new("u1", "router", "I love discussing consciousness")
                    .memory_type(MemoryType::Reflection)
                    .consciousness(at(0.9)),
            )
            .await
            .unwrap();
        let weather = storage
            .store(
                StoreRequest::new("u1", "router", "What's the weather?")
                    .memory_type(MemoryType::Interaction)
                    .consciousness(at(0.3)),
            )
            .await
            .unwrap();
        let insight = storage
            .store(
                StoreRequest::new("u1", "router", "I had a profound insight about memory")
                    .memory_type(MemoryType::Insight)
                    .consciousness(at(0.85)),
            )
            .await
            .unwrap();

        let results = retrieval
            .search(&SearchRequest::new("u1", "consciousness insight", 2))
            .await
            .unwrap();
        let ids: HashSet<String> = results.into_iter().map(|r| r.memory_id).collect();
        assert_eq!(ids, HashSet::from([reflection, insight]));
        assert!(!ids.contains(&weather));
    }

    #[tokio::test]
    async fn test_limit_above_maximum_is_rejected() {
        let fx = Fixture::new().await;
        let (_, retrieval) = services(&fx);
        assert!(retrieval
            .search(&SearchRequest::new("u1", "anything", MAX_SEARCH_LIMIT))
            .await
            .is_ok());
        assert!(matches!(
            retrieval.search(&SearchRequest::new("u1", "anything", usize::MAX)).await,
            Err(MemoryError::Validation { field: "limit", .. })
        ));
    }

    #[tokio::test]
    async fn test_exact_content_round_trip() {
        let fx = Fixture::new().await;
        let (storage, retrieval) = services(&fx);
        for i in 0..5 {
            storage
                .store(StoreRequest::new("u1", "agent", format!("filler note number {}", i)))
                .await
                .unwrap();
        }
        let id = storage
            .store(StoreRequest::new("u1", "agent", "the lighthouse keeper sings at dawn"))
            .await
            .unwrap();
        let results = retrieval
            .search_scored(&SearchRequest::new("u1", "the lighthouse keeper sings at dawn", 3))
            .await
            .unwrap();
        assert_eq!(results[0].record.memory_id, id);
        assert_eq!(results[0].source, MatchSource::Hybrid);
    }

    #[tokio::test]
    async fn test_users_are_isolated() {
        let fx = Fixture::new().await;
        let (storage, retrieval) = services(&fx);
        storage
            .store(StoreRequest::new("alice", "agent", "secret garden plans"))
            .await
            .unwrap();
        let results = retrieval
            .search(&SearchRequest::new("bob", "secret garden plans", 10))
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_padded_user_id_matches_stored_form() {
        let fx = Fixture::new().await;
        let (storage, retrieval) = services(&fx);
        let id = storage
            .store(StoreRequest::new("u1 ", "agent", "copper kettle whistle"))
            .await
            .unwrap();
        assert_eq!(fx.backend.get(&id).await.unwrap().unwrap().user_id, "u1");

        for user in ["u1 ", "u1", "  u1"] {
            let results = retrieval
                .search(&SearchRequest::new(user, "copper kettle whistle", 5))
                .await
                .unwrap();
            assert_eq!(results.len(), 1, "user {:?}", user);
            assert_eq!(results[0].memory_id, id);
        }
    }

    #[tokio::test]
    async fn test_filters_by_type_and_consciousness() {
        let fx = Fixture::new().await;
        let (storage, retrieval) = services(&fx);
        let low = ConsciousnessContext::new(0.2, EmotionalState::Neutral, 0.5);
        storage
            .store(StoreRequest::new("u1", "agent", "galaxy notes").consciousness(low))
            .await
            .unwrap();
        let insight = storage
            .store(
                StoreRequest::new("u1", "agent", "galaxy insight")
                    .memory_type(MemoryType::Insight),
            )
            .await
            .unwrap();

        let typed = retrieval
            .search(&SearchRequest::new("u1", "galaxy", 10).memory_types(vec![MemoryType::Insight]))
            .await
            .unwrap();
        assert_eq!(typed.len(), 1);
        assert_eq!(typed[0].memory_id, insight);

        let aware = retrieval
            .search(&SearchRequest::new("u1", "galaxy", 10).consciousness_threshold(0.5))
            .await
            .unwrap();
        assert!(aware.iter().all(|r| r.consciousness_level >= 0.5));
        assert_eq!(aware.len(), 1);
    }

    #[tokio::test]
    async fn test_degrades_to_keyword_when_embeddings_fail() {
        let embedder = Arc::new(FlakyEmbedder::default());
        let fx = Fixture::with_embedder(embedder.clone()).await;
        let (storage, retrieval) = services(&fx);
        let id = storage
            .store(StoreRequest::new("u1", "agent", "volcano expedition log"))
            .await
            .unwrap();

        embedder.failing.store(true, std::sync::atomic::Ordering::SeqCst);
        let results = retrieval
            .search_scored(&SearchRequest::new("u1", "volcano expedition", 5))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.memory_id, id);
        assert_eq!(results[0].source, MatchSource::Keyword);
    }

    #[tokio::test]
    async fn test_concept_expansion_adds_neighbors() {
        let fx = Fixture::new().await;
        let (storage, retrieval) = services(&fx);
        storage
            .store(StoreRequest::new("u1", "agent", "penguins huddle together"))
            .await
            .unwrap();
        let neighbor = storage
            .store(StoreRequest::new("u1", "agent", "antarctic penguins"))
            .await
            .unwrap();

        let request = SearchRequest::new("u1", "huddle", 5);
        let expanded = retrieval.search_scored(&request).await.unwrap();
        let via_concepts: Vec<&RetrievedMemory> = expanded
            .iter()
            .filter(|r| r.record.memory_id == neighbor)
            .collect();
        assert_eq!(via_concepts.len(), 1);
        assert_eq!(via_concepts[0].source, MatchSource::ConceptExpansion);
        // one hop through a concept with full link strength
        assert!((via_concepts[0].relevance - 0.5).abs() < 1e-6);

        let plain = retrieval
            .search_scored(&request.clone().without_expansion())
            .await
            .unwrap();
        assert!(plain.iter().all(|r| r.source != MatchSource::ConceptExpansion));
    }

    #[tokio::test]
    async fn test_empty_results_and_zero_limit() {
        let fx = Fixture::new().await;
        let (_, retrieval) = services(&fx);
        assert!(retrieval
            .search(&SearchRequest::new("u1", "anything", 5))
            .await
            .unwrap()
            .is_empty());
        assert!(retrieval
            .search(&SearchRequest::new("u1", "anything", 0))
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            retrieval.search(&SearchRequest::new(" ", "q", 5)).await,
            Err(MemoryError::Validation { field: "user_id", .. })
        ));
    }

    #[tokio::test]
    async fn test_recent_memory_outranks_decayed_twin() {
        let fx = Fixture::new().await;
        let (storage, retrieval) = services(&fx);
        let old = storage
            .store(StoreRequest::new("u1", "agent", "harbor sunrise photo"))
            .await
            .unwrap();
        fx.clock.advance(Duration::hours(24 * 30));
        let new = storage
            .store(StoreRequest::new("u1", "agent", "harbor sunrise photo"))
            .await
            .unwrap();

        let results = retrieval
            .search_scored(&SearchRequest::new("u1", "harbor sunrise photo", 2))
            .await
            .unwrap();
        assert_eq!(results[0].record.memory_id, new);
        assert_eq!(results[1].record.memory_id, old);
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn test_search_queues_access_updates() {
        let fx = Fixture::new().await;
        let access = Arc::new(AccessRecorder::spawn(fx.backend_dyn(), 16));
        let storage = StorageService::new(fx.backend_dyn(), fx.embedder.clone(), fx.clock.clone());
        let retrieval = RetrievalService::new(
            fx.backend_dyn(),
            fx.embedder.clone(),
            fx.clock.clone(),
            RetrievalConfig::default(),
        )
        .with_access_recorder(access.clone());

        let id = storage
            .store(StoreRequest::new("u1", "agent", "the orchard in autumn"))
            .await
            .unwrap();
        fx.clock.advance(Duration::hours(2));
        retrieval
            .search(&SearchRequest::new("u1", "orchard autumn", 5))
            .await
            .unwrap();
        access.flush().await;

        let record = fx.backend.get(&id).await.unwrap().unwrap();
        assert_eq!(record.access_count, 1);
        assert_eq!(record.last_accessed, fx.clock_now());
        access.shutdown().await;
    }
}

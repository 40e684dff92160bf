//! ============================================================================
//! Lifecycle Manager - Decay, staleness, archival, deletion, consolidation
//! ============================================================================
//! One sweep walks every memory in `memory_id` order, `batch_size` at a time.
//! Each record is planned by the pure `plan` function and applied in its own
//! small backend write. A failure on one record is logged and counted.
//!
//! State machine:
//!   active --(score < threshold)--> stale --(age > archive_after)--> archived
//!   stale  --(score recovered or accessed)--> active
//!   archived --(age > delete_after)--> deleted
//!
//! After the sweep, clusters of similar stale memories per user are merged
//! into one `consolidated` memory and the sources archived.
//! ============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::concepts::extract_concepts;
use super::embeddings::normalize;
use super::scoring::{
    clamp_score, cosine_similarity, decay_factor, initial_significance, recompute_significance,
};
use super::types::{truncate_chars, LifecycleState, MemoryRecord, MemoryType};
use crate::backend::{LifecycleUpdate, MemoryBackend, MemoryWrite};
use crate::clock::{hours_between, Clock};
use crate::config::LifecycleConfig;
use crate::consciousness::{ConsciousnessContext, EmotionalState};
use crate::error::{MemoryError, Result};

/// Agent name stamped on consolidated memories
pub const CONSOLIDATION_AGENT: &str = "lifecycle";

const SNIPPET_CHARS: usize = 200;

/// Upper bound on stale memories examined per consolidation pass
const CONSOLIDATION_SCAN_LIMIT: usize = 5_000;

/// Counters for one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleReport {
    pub scanned: u64,
    pub decayed: u64,
    pub resisted: u64,
    pub staled: u64,
    pub revived: u64,
    pub archived: u64,
    pub deleted: u64,
    pub consolidated: u64,
    pub failed: u64,
}

/// What a sweep does to one record
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Archived record not yet old enough to delete
    Keep,
    Update(LifecycleUpdate),
    /// Move the record out of the hot indexes with its decayed scores
    Archive(LifecycleUpdate),
    Delete,
}

/// Decide the next state of `record` at `now`
pub fn plan(record: &MemoryRecord, now: DateTime<Utc>, config: &LifecycleConfig) -> Transition {
    let age_days = hours_between(record.created_at, now) / 24.0;

    if record.lifecycle_state == LifecycleState::Archived {
        return if age_days > config.delete_after_days as f64 {
            Transition::Delete
        } else {
            Transition::Keep
        };
    }

    let accessed = record
        .access_count
        .saturating_sub(record.access_count_at_sweep)
        >= config.min_access_delta.max(1);
    if accessed {
        return Transition::Update(LifecycleUpdate {
            memory_id: record.memory_id.clone(),
            importance_score: record.importance_score,
            significance_score: record.significance_score,
            lifecycle_state: LifecycleState::Active,
            last_decayed_at: now,
            access_count_at_sweep: record.access_count,
        });
    }

    let hours = hours_between(record.last_decayed_at, now);
    let factor = decay_factor(hours, config.decay_half_life_hours);
    let importance = clamp_score((record.importance_score as f64 * factor) as f32);
    // Concept and access terms alone must not pin a record above the threshold
    let significance = recompute_significance(importance, record.access_count, record.concept_count)
        .min(clamp_score((record.significance_score as f64 * factor) as f32));
    let below = importance.max(significance) < config.stale_threshold;

    let mut update = LifecycleUpdate {
        memory_id: record.memory_id.clone(),
        importance_score: importance,
        significance_score: significance,
        lifecycle_state: if below {
            LifecycleState::Stale
        } else {
            LifecycleState::Active
        },
        last_decayed_at: now,
        access_count_at_sweep: record.access_count,
    };

    if below
        && record.lifecycle_state == LifecycleState::Stale
        && age_days > config.archive_after_days as f64
    {
        update.lifecycle_state = LifecycleState::Archived;
        return Transition::Archive(update);
    }
    Transition::Update(update)
}

/// Union-find over indices
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Lower index wins so cluster roots are deterministic
            let (low, high) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[high] = low;
        }
    }
}

/// Group stale records of one user whose embeddings are within `similarity`
pub fn cluster(records: &[&MemoryRecord], similarity: f32, min_size: usize) -> Vec<Vec<usize>> {
    let mut sets = DisjointSet::new(records.len());
    for i in 0..records.len() {
        for j in (i + 1)..records.len() {
            let (Some(a), Some(b)) = (&records[i].embedding, &records[j].embedding) else {
                continue;
            };
            if cosine_similarity(a, b) >= similarity {
                sets.union(i, j);
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..records.len() {
        let root = sets.find(i);
        groups.entry(root).or_default().push(i);
    }
    groups
        .into_values()
        .filter(|g| g.len() >= min_size.max(2))
        .collect()
}

/// Build the consolidated memory replacing `sources`
pub fn consolidate(sources: &[&MemoryRecord], now: DateTime<Utc>) -> Option<MemoryWrite> {
    let first = sources.first()?;

    let mut content = format!("Consolidated from {} memories:", sources.len());
    for source in sources {
        content.push_str("\n- ");
        content.push_str(&truncate_chars(source.content.trim(), SNIPPET_CHARS));
    }

    let level = sources.iter().map(|s| s.consciousness_level).sum::<f32>() / sources.len() as f32;
    let context = ConsciousnessContext::new(level.clamp(0.0, 1.0), EmotionalState::Neutral, 0.5);
    let mut record = MemoryRecord::new(
        first.user_id.clone(),
        CONSOLIDATION_AGENT,
        &content,
        MemoryType::Consolidated,
        &context,
        now,
    );

    let mut mean = vec![0.0f32; first.embedding.as_ref()?.len()];
    for source in sources {
        let embedding = source.embedding.as_ref()?;
        if embedding.len() != mean.len() {
            return None;
        }
        for (m, x) in mean.iter_mut().zip(embedding) {
            *m += x;
        }
    }
    if normalize(&mut mean) {
        record.embedding = Some(mean);
    }

    let concepts = extract_concepts(&record.content);
    record.importance_score = clamp_score(
        sources
            .iter()
            .map(|s| s.importance_score)
            .fold(0.0f32, f32::max),
    );
    record.significance_score = initial_significance(record.importance_score, concepts.len());
    record.concept_count = concepts.len();

    let mut metadata = Map::new();
    metadata.insert(
        "source_ids".into(),
        Value::Array(sources.iter().map(|s| json!(s.memory_id)).collect()),
    );
    record.metadata = metadata;

    Some(MemoryWrite {
        record,
        concepts,
        snapshot: None,
    })
}

/// Stops the sweep instead of counting a per-record failure
fn aborts_sweep(error: &MemoryError) -> bool {
    matches!(
        error,
        MemoryError::CircuitOpen { .. } | MemoryError::ConnectionTimeout(_)
    )
}

pub struct LifecycleManager {
    backend: Arc<dyn MemoryBackend>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            backend,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Run one full sweep plus consolidation
    pub async fn run_once(&self) -> Result<LifecycleReport> {
        let now = self.clock.now();
        let mut report = LifecycleReport::default();
        let batch_size = self.config.batch_size.max(1);
        let mut cursor: Option<String> = None;

        loop {
            let batch = self
                .backend
                .lifecycle_batch(cursor.as_deref(), batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(last.memory_id.clone());
            let full = batch.len() == batch_size;

            for record in &batch {
                report.scanned += 1;
                if let Err(e) = self.apply(record, now, &mut report).await {
                    if aborts_sweep(&e) {
                        return Err(e);
                    }
                    report.failed += 1;
                    warn!("Lifecycle step failed for memory {}: {}", record.memory_id, e);
                }
            }
            if !full {
                break;
            }
        }

        if self.config.consolidation_enabled {
            self.consolidate_stale(now, &mut report).await?;
        }

        info!(
            "Lifecycle sweep: scanned {}, decayed {}, resisted {}, staled {}, revived {}, archived {}, deleted {}, consolidated {}, failed {}",
            report.scanned,
            report.decayed,
            report.resisted,
            report.staled,
            report.revived,
            report.archived,
            report.deleted,
            report.consolidated,
            report.failed
        );
        Ok(report)
    }

    async fn apply(
        &self,
        record: &MemoryRecord,
        now: DateTime<Utc>,
        report: &mut LifecycleReport,
    ) -> Result<()> {
        match plan(record, now, &self.config) {
            Transition::Keep => {}
            Transition::Delete => {
                if self.backend.delete(&record.memory_id).await? {
                    report.deleted += 1;
                    debug!("Deleted expired memory {}", record.memory_id);
                }
            }
            Transition::Archive(update) => {
                self.backend.archive(&record.memory_id, Some(&update)).await?;
                report.decayed += 1;
                report.archived += 1;
            }
            Transition::Update(update) => {
                let resisted = update.importance_score == record.importance_score
                    && update.access_count_at_sweep > record.access_count_at_sweep;
                let was = record.lifecycle_state;
                let now_state = update.lifecycle_state;
                self.backend.apply_update(&update).await?;

                if resisted {
                    report.resisted += 1;
                } else {
                    report.decayed += 1;
                }
                match (was, now_state) {
                    (LifecycleState::Active, LifecycleState::Stale) => report.staled += 1,
                    (LifecycleState::Stale, LifecycleState::Active) => report.revived += 1,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn consolidate_stale(&self, now: DateTime<Utc>, report: &mut LifecycleReport) -> Result<()> {
        let min_cluster = self.config.consolidation_min_cluster.max(2);
        let stale = self
            .backend
            .stale_candidates(CONSOLIDATION_SCAN_LIMIT)
            .await?;

        let mut by_user: BTreeMap<&str, Vec<&MemoryRecord>> = BTreeMap::new();
        for record in &stale {
            by_user.entry(record.user_id.as_str()).or_default().push(record);
        }

        for (user_id, records) in by_user {
            if records.len() < min_cluster {
                continue;
            }
            for group in cluster(&records, self.config.consolidation_similarity, min_cluster) {
                let sources: Vec<&MemoryRecord> = group.iter().map(|&i| records[i]).collect();
                let Some(write) = consolidate(&sources, now) else {
                    continue;
                };
                let new_id = write.record.memory_id.clone();
                if let Err(e) = self.backend.persist(write).await {
                    if aborts_sweep(&e) {
                        return Err(e);
                    }
                    report.failed += 1;
                    warn!("Consolidation failed for user {}: {}", user_id, e);
                    continue;
                }
                report.consolidated += 1;

                for source in sources {
                    match self.backend.archive(&source.memory_id, None).await {
                        Ok(()) => report.archived += 1,
                        Err(e) => {
                            report.failed += 1;
                            warn!("Failed to archive consolidated source {}: {}", source.memory_id, e);
                        }
                    }
                }
                info!(
                    "Consolidated {} stale memories of user {} into {}",
                    group.len(),
                    user_id,
                    new_id
                );
            }
        }
        Ok(())
    }

    /// Run sweeps every `interval` until `shutdown` flips to true or closes
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = if self.config.interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.config.interval
        };
        tokio::spawn(async move {
            info!("Lifecycle manager started (every {:?})", period);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; wait a full period first
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.run_once().await {
                            Ok(_) => {}
                            Err(e) if aborts_sweep(&e) => {
                                warn!("Skipping lifecycle cycle, store unavailable: {}", e);
                            }
                            Err(e) => error!("Lifecycle sweep failed: {}", e),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Lifecycle manager stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::embeddings::HashingEmbedder;
    use crate::memory::storage::StorageService;
    use crate::memory::testing::Fixture;
    use crate::memory::types::StoreRequest;
    use chrono::Duration as ChronoDuration;

    fn record_at(importance: f32, created: DateTime<Utc>) -> MemoryRecord {
        let mut r = MemoryRecord::new(
            "u1",
            "agent",
            "plain",
            MemoryType::Interaction,
            &ConsciousnessContext::default(),
            created,
        );
        r.importance_score = importance;
        r.significance_score = importance;
        r
    }

    fn no_consolidation() -> LifecycleConfig {
        LifecycleConfig {
            consolidation_enabled: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_decays_by_half_life() {
        let config = LifecycleConfig::default();
        let start = Utc::now();
        let record = record_at(0.8, start);
        let later = start + ChronoDuration::hours(720);
        match plan(&record, later, &config) {
            Transition::Update(update) => {
                assert!((update.importance_score - 0.4).abs() < 1e-4);
                assert_eq!(update.lifecycle_state, LifecycleState::Active);
                assert_eq!(update.last_decayed_at, later);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_plan_access_resists_decay() {
        let config = LifecycleConfig::default();
        let start = Utc::now();
        let mut record = record_at(0.8, start);
        record.lifecycle_state = LifecycleState::Stale;
        record.access_count = 3;
        record.access_count_at_sweep = 1;
        match plan(&record, start + ChronoDuration::days(60), &config) {
            Transition::Update(update) => {
                assert_eq!(update.importance_score, 0.8);
                assert_eq!(update.lifecycle_state, LifecycleState::Active);
                assert_eq!(update.access_count_at_sweep, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_plan_state_machine() {
        let config = LifecycleConfig::default();
        let start = Utc::now();

        let weak = record_at(0.1, start);
        match plan(&weak, start + ChronoDuration::hours(1), &config) {
            Transition::Update(u) => assert_eq!(u.lifecycle_state, LifecycleState::Stale),
            other => panic!("unexpected {:?}", other),
        }

        let mut stale_old = record_at(0.1, start);
        stale_old.lifecycle_state = LifecycleState::Stale;
        assert!(matches!(
            plan(&stale_old, start + ChronoDuration::days(31), &config),
            Transition::Archive(_)
        ));

        let mut stale_recovered = record_at(0.9, start);
        stale_recovered.lifecycle_state = LifecycleState::Stale;
        match plan(&stale_recovered, start + ChronoDuration::hours(1), &config) {
            Transition::Update(u) => assert_eq!(u.lifecycle_state, LifecycleState::Active),
            other => panic!("unexpected {:?}", other),
        }

        let mut archived = record_at(0.1, start);
        archived.lifecycle_state = LifecycleState::Archived;
        assert_eq!(plan(&archived, start + ChronoDuration::days(89), &config), Transition::Keep);
        assert_eq!(plan(&archived, start + ChronoDuration::days(91), &config), Transition::Delete);
    }

    #[test]
    fn test_plan_decay_is_monotonic_without_access() {
        let config = LifecycleConfig::default();
        let start = Utc::now();
        let mut record = record_at(0.9, start);
        let mut previous = record.importance_score;
        for day in 1..40 {
            let now = start + ChronoDuration::days(day);
            if let Transition::Update(u) | Transition::Archive(u) = plan(&record, now, &config) {
                assert!(u.importance_score <= previous);
                previous = u.importance_score;
                record.importance_score = u.importance_score;
                record.significance_score = u.significance_score;
                record.lifecycle_state = u.lifecycle_state;
                record.last_decayed_at = u.last_decayed_at;
            }
        }
    }

    #[test]
    fn test_plan_retires_concept_rich_memory() {
        let config = LifecycleConfig::default();
        let start = Utc::now();
        let mut record = record_at(0.6, start);
        record.significance_score = 0.8;
        record.concept_count = 6;
        match plan(&record, start + ChronoDuration::days(90), &config) {
            Transition::Update(u) => {
                assert_eq!(u.lifecycle_state, LifecycleState::Stale);
                assert!(u.significance_score < config.stale_threshold);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cluster_groups_similar() {
        let embedder = HashingEmbedder::new();
        let mk = |content: &str| {
            let mut r = record_at(0.1, Utc::now());
            r.content = content.to_string();
            r.embedding = Some(embedder.embed_sync(content).unwrap());
            r
        };
        let records = vec![
            mk("rainy morning walk"),
            mk("unrelated quantum topic"),
            mk("rainy morning walk"),
            mk("rainy morning walk"),
        ];
        let refs: Vec<&MemoryRecord> = records.iter().collect();
        let groups = cluster(&refs, 0.75, 3);
        assert_eq!(groups, vec![vec![0, 2, 3]]);
        assert!(cluster(&refs, 0.75, 4).is_empty());
    }

    #[test]
    fn test_consolidate_builds_merged_record() {
        let embedder = HashingEmbedder::new();
        let mut a = record_at(0.1, Utc::now());
        a.embedding = Some(embedder.embed_sync("rainy walk").unwrap());
        let mut b = record_at(0.15, Utc::now());
        b.embedding = Some(embedder.embed_sync("rainy walk").unwrap());

        let write = consolidate(&[&a, &b], Utc::now()).unwrap();
        let record = write.record;
        assert_eq!(record.memory_type, MemoryType::Consolidated);
        assert_eq!(record.importance_score, 0.15);
        assert!(record.content.starts_with("Consolidated from 2 memories:"));
        assert_eq!(
            record.metadata["source_ids"],
            json!([a.memory_id, b.memory_id])
        );
        let norm: f32 = record.embedding.unwrap().iter().map(|x| x * x).sum();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    async fn store(fx: &Fixture, content: &str) -> String {
        StorageService::new(fx.backend_dyn(), fx.embedder.clone(), fx.clock.clone())
            .store(StoreRequest::new("u1", "agent", content))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sweep_walks_all_batches() {
        let fx = Fixture::new().await;
        for i in 0..7 {
            store(&fx, &format!("note {}", i)).await;
        }
        let manager = LifecycleManager::new(
            fx.backend_dyn(),
            fx.clock.clone(),
            LifecycleConfig {
                batch_size: 3,
                ..no_consolidation()
            },
        );
        fx.clock.advance(ChronoDuration::hours(1));
        let report = manager.run_once().await.unwrap();
        assert_eq!(report.scanned, 7);
        assert_eq!(report.decayed, 7);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_accessed_memory_outlives_untouched_one() {
        let fx = Fixture::new().await;
        let touched = store(&fx, "touched memory").await;
        let untouched = store(&fx, "untouched memory").await;
        let manager = LifecycleManager::new(fx.backend_dyn(), fx.clock.clone(), no_consolidation());

        for _ in 0..8 {
            fx.clock.advance(ChronoDuration::days(10));
            fx.backend
                .record_access(&[touched.clone()], fx.clock_now())
                .await
                .unwrap();
            manager.run_once().await.unwrap();
        }

        let t = fx.backend.get(&touched).await.unwrap().unwrap();
        let u = fx.backend.get(&untouched).await.unwrap().unwrap();
        assert_eq!(t.lifecycle_state, LifecycleState::Active);
        assert!(t.importance_score > u.importance_score);
        assert_ne!(u.lifecycle_state, LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_full_lifecycle_to_deletion() {
        let fx = Fixture::new().await;
        let id = store(&fx, "fading memory").await;
        let manager = LifecycleManager::new(fx.backend_dyn(), fx.clock.clone(), no_consolidation());

        // Long enough to fall below the stale threshold in one step
        fx.clock.advance(ChronoDuration::days(120));
        manager.run_once().await.unwrap();
        assert_eq!(
            fx.backend.get(&id).await.unwrap().unwrap().lifecycle_state,
            LifecycleState::Stale
        );

        fx.clock.advance(ChronoDuration::days(1));
        let report = manager.run_once().await.unwrap();
        assert_eq!(report.archived, 1);
        let archived = fx.backend.get(&id).await.unwrap().unwrap();
        assert_eq!(archived.lifecycle_state, LifecycleState::Archived);
        assert_eq!(archived.last_decayed_at, fx.clock_now());

        fx.clock.advance(ChronoDuration::days(1));
        let report = manager.run_once().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(fx.backend.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concept_rich_memory_is_eventually_deleted() {
        let fx = Fixture::new().await;
        let id = store(&fx, "gardening tomatoes peppers basil compost watering").await;
        assert!(fx.backend.get(&id).await.unwrap().unwrap().concept_count >= 5);
        let manager = LifecycleManager::new(fx.backend_dyn(), fx.clock.clone(), no_consolidation());

        fx.clock.advance(ChronoDuration::days(100));
        for _ in 0..3 {
            manager.run_once().await.unwrap();
            fx.clock.advance(ChronoDuration::days(1));
        }
        assert!(fx.backend.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_consolidation_is_idempotent() {
        let fx = Fixture::new().await;
        for _ in 0..3 {
            store(&fx, "rainy morning walk").await;
        }
        store(&fx, "quantum physics").await;
        let manager = LifecycleManager::new(
            fx.backend_dyn(),
            fx.clock.clone(),
            LifecycleConfig::default(),
        );

        fx.clock.advance(ChronoDuration::days(100));
        let first = manager.run_once().await.unwrap();
        assert_eq!(first.staled, 4);
        assert_eq!(first.consolidated, 1);
        assert_eq!(first.archived, 3);

        let stats = fx.backend.stats().await.unwrap();
        assert_eq!(stats.archived, 3);

        let second = manager.run_once().await.unwrap();
        assert_eq!(second.consolidated, 0);
    }

    #[tokio::test]
    async fn test_spawned_loop_stops_on_shutdown() {
        let fx = Fixture::new().await;
        let manager = Arc::new(LifecycleManager::new(
            fx.backend_dyn(),
            fx.clock.clone(),
            LifecycleConfig {
                interval: Duration::from_millis(20),
                ..no_consolidation()
            },
        ));
        let (tx, rx) = watch::channel(false);
        let handle = manager.spawn(rx);
        tokio::time::sleep(Duration::from_millis(70)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

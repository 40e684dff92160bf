// ============================================================================
// GraphBackend - Memory graph on Neo4j
// ============================================================================
// Nodes: User, Memory, ArchivedMemory, Concept, ConsciousnessSnapshot
// Edges: HAS_MEMORY, RELATES_TO_CONCEPT {strength}, CREATED_DURING_STATE
// Timestamps are stored as epoch milliseconds, metadata as a JSON string.
// Lifecycle and access writes run at background pool priority.
// ============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Candidate, ConceptNeighbor, LifecycleUpdate, MemoryBackend, MemoryWrite};
use crate::clock::{from_millis, to_millis};
use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::graph::{
    AccessMode, CircuitState, GraphClient, HttpConnector, Priority, QueryResult, Row, SchemaManager,
    SchemaReport, Statement, FULLTEXT_INDEX, VECTOR_INDEX,
};
use crate::memory::concepts::{keywords, tokenize};
use crate::memory::types::{LifecycleState, MemoryRecord, MemoryStats, MemoryType};

/// Scalar properties stored on every Memory node
const RECORD_COLUMNS: &[&str] = &[
    "memory_id",
    "content",
    "memory_type",
    "user_id",
    "agent_name",
    "consciousness_level",
    "emotional_state",
    "importance_score",
    "significance_score",
    "created_at",
    "last_accessed",
    "access_count",
    "metadata_json",
    "lifecycle_state",
    "last_decayed_at",
    "access_count_at_sweep",
    "concept_count",
    "snapshot_id",
];

/// ANN results are filtered by user after the index lookup
const VECTOR_OVERFETCH: usize = 4;

const PERSIST_MEMORY: &str = "\
MERGE (u:User {user_id: $user_id})
  ON CREATE SET u.created_at = $created_at
CREATE (m:Memory)
SET m = $props
CREATE (u)-[:HAS_MEMORY]->(m)";

const LINK_CONCEPTS: &str = "\
MATCH (m:Memory {memory_id: $memory_id})
UNWIND $concepts AS c
MERGE (k:Concept {name: c.name})
  ON CREATE SET k.concept_id = c.concept_id, k.importance_score = c.strength, k.usage_frequency = 0
SET k.usage_frequency = k.usage_frequency + 1,
    k.importance_score = CASE WHEN c.strength > k.importance_score THEN c.strength ELSE k.importance_score END
MERGE (m)-[r:RELATES_TO_CONCEPT]->(k)
SET r.strength = c.strength";

const LINK_SNAPSHOT: &str = "\
MATCH (m:Memory {memory_id: $memory_id})
MERGE (s:ConsciousnessSnapshot {snapshot_id: $snapshot_id})
  ON CREATE SET s += $snapshot
MERGE (m)-[:CREATED_DURING_STATE]->(s)";

const CONCEPT_HOP: &str = "\
MATCH (seed:Memory)-[:RELATES_TO_CONCEPT]->(:Concept)<-[r:RELATES_TO_CONCEPT]-(m:Memory)
WHERE seed.memory_id IN $frontier
  AND m.user_id = $user_id
  AND NOT m.memory_id IN $exclude
WITH m, max(r.strength) AS strength";

const RECORD_ACCESS: &str = "\
UNWIND $ids AS id
MATCH (m:Memory {memory_id: id})
SET m.access_count = coalesce(m.access_count, 0) + 1,
    m.last_accessed = $at";

const APPLY_UPDATE: &str = "\
MATCH (m:Memory {memory_id: $memory_id})
SET m.importance_score = $importance_score,
    m.significance_score = $significance_score,
    m.lifecycle_state = $lifecycle_state,
    m.last_decayed_at = $last_decayed_at,
    m.access_count_at_sweep = $access_count_at_sweep
RETURN count(m) AS updated";

const ARCHIVE_MEMORY: &str = "\
MATCH (m:Memory {memory_id: $memory_id})
REMOVE m:Memory
SET m:ArchivedMemory, m += $scores, m.lifecycle_state = 'archived'
RETURN count(m) AS archived";

const DELETE_MEMORY: &str = "\
MATCH (m)
WHERE m.memory_id = $memory_id AND (m:Memory OR m:ArchivedMemory)
DETACH DELETE m
RETURN count(*) AS deleted";

const DELETE_USER: &str = "\
MATCH (u:User {user_id: $user_id})
OPTIONAL MATCH (u)-[:HAS_MEMORY]->(m)
WITH u, collect(m) AS memories
FOREACH (x IN memories | DETACH DELETE x)
DETACH DELETE u
RETURN size(memories) AS removed";

const STATS: &[&str] = &[
    "MATCH (u:User) RETURN count(u) AS n",
    "MATCH (m:Memory) RETURN count(m) AS total, \
     sum(CASE WHEN m.lifecycle_state = 'stale' THEN 1 ELSE 0 END) AS stale, \
     sum(CASE WHEN m.embedding IS NULL THEN 1 ELSE 0 END) AS missing",
    "MATCH (a:ArchivedMemory) RETURN count(a) AS n",
    "MATCH (c:Concept) RETURN count(c) AS n",
    "MATCH (s:ConsciousnessSnapshot) RETURN count(s) AS n",
];

/// `RETURN` list for a memory bound to `m`
fn projection(with_embedding: bool) -> String {
    let mut parts: Vec<String> = RECORD_COLUMNS
        .iter()
        .map(|c| format!("m.{} AS {}", c, c))
        .collect();
    if with_embedding {
        parts.push("m.embedding AS embedding".to_string());
    }
    parts.join(", ")
}

/// Node properties for a new Memory
fn record_props(record: &MemoryRecord) -> Map<String, Value> {
    let mut props = Map::new();
    props.insert("memory_id".into(), json!(record.memory_id));
    props.insert("content".into(), json!(record.content));
    props.insert("memory_type".into(), json!(record.memory_type.as_str()));
    props.insert("user_id".into(), json!(record.user_id));
    props.insert("agent_name".into(), json!(record.agent_name));
    props.insert("consciousness_level".into(), json!(record.consciousness_level));
    props.insert("emotional_state".into(), json!(record.emotional_state.as_str()));
    props.insert("importance_score".into(), json!(record.importance_score));
    props.insert("significance_score".into(), json!(record.significance_score));
    props.insert("created_at".into(), json!(to_millis(record.created_at)));
    props.insert("last_accessed".into(), json!(to_millis(record.last_accessed)));
    props.insert("access_count".into(), json!(record.access_count));
    props.insert("metadata_json".into(), json!(record.metadata_json()));
    props.insert("lifecycle_state".into(), json!(record.lifecycle_state.as_str()));
    props.insert("last_decayed_at".into(), json!(to_millis(record.last_decayed_at)));
    props.insert("access_count_at_sweep".into(), json!(record.access_count_at_sweep));
    props.insert("concept_count".into(), json!(record.concept_count));
    if let Some(snapshot_id) = &record.snapshot_id {
        props.insert("snapshot_id".into(), json!(snapshot_id));
    }
    if let Some(embedding) = &record.embedding {
        props.insert("embedding".into(), json!(embedding));
    }
    props
}

fn record_from_row(row: &Row) -> Result<MemoryRecord> {
    let memory_id = row
        .get_string("memory_id")
        .ok_or_else(|| MemoryError::Storage("memory row without memory_id".to_string()))?;
    let memory_type: MemoryType = row
        .get_str("memory_type")
        .unwrap_or("interaction")
        .parse()
        .map_err(|e| MemoryError::Storage(format!("memory {}: {}", memory_id, e)))?;
    let lifecycle_state: LifecycleState = row
        .get_str("lifecycle_state")
        .unwrap_or("active")
        .parse()
        .map_err(|e| MemoryError::Storage(format!("memory {}: {}", memory_id, e)))?;
    let metadata = match row
        .get_str("metadata_json")
        .and_then(|s| serde_json::from_str::<Value>(s).ok())
    {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let created_at = from_millis(row.get_i64("created_at").unwrap_or_default());

    Ok(MemoryRecord {
        content: row.get_string("content").unwrap_or_default(),
        memory_type,
        user_id: row.get_string("user_id").unwrap_or_default(),
        agent_name: row.get_string("agent_name").unwrap_or_default(),
        consciousness_level: row.get_f32("consciousness_level").unwrap_or(0.0),
        emotional_state: row
            .get_str("emotional_state")
            .and_then(|s| s.parse().ok())
            .unwrap_or_default(),
        importance_score: row.get_f32("importance_score").unwrap_or(0.5),
        significance_score: row.get_f32("significance_score").unwrap_or(0.5),
        embedding: row.get_vec_f32("embedding"),
        created_at,
        last_accessed: row
            .get_i64("last_accessed")
            .map(from_millis)
            .unwrap_or(created_at),
        access_count: row.get_i64("access_count").unwrap_or(0).max(0) as u64,
        metadata,
        lifecycle_state,
        last_decayed_at: row
            .get_i64("last_decayed_at")
            .map(from_millis)
            .unwrap_or(created_at),
        access_count_at_sweep: row.get_i64("access_count_at_sweep").unwrap_or(0).max(0) as u64,
        concept_count: row.get_i64("concept_count").unwrap_or(0).max(0) as usize,
        snapshot_id: row.get_string("snapshot_id"),
        memory_id,
    })
}

fn records(result: &QueryResult) -> Result<Vec<MemoryRecord>> {
    result.rows.iter().map(record_from_row).collect()
}

fn count(result: &QueryResult, column: &str) -> u64 {
    result
        .first()
        .and_then(|row| row.get_i64(column))
        .unwrap_or(0)
        .max(0) as u64
}

/// Lucene query OR-ing the query's keywords, with syntax characters dropped
fn fulltext_query(query: &str) -> Option<String> {
    let mut terms = keywords(query);
    if terms.is_empty() {
        terms = tokenize(query).collect();
    }
    terms.dedup();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

pub struct GraphBackend {
    client: Arc<GraphClient>,
}

impl GraphBackend {
    pub fn new(client: Arc<GraphClient>) -> Self {
        Self { client }
    }

    /// Build the HTTP connector, pool, breaker and client from config
    pub fn from_config(config: &MemoryConfig) -> Self {
        info!("Using graph backend at {}", config.graph.uri);
        let connector = Arc::new(HttpConnector::new(config.graph.clone()));
        let client = GraphClient::with_configs(
            connector,
            config.pool.clone(),
            config.breaker.clone(),
            config.retry.clone(),
        );
        Self::new(Arc::new(client))
    }

    pub fn client(&self) -> &Arc<GraphClient> {
        &self.client
    }

    async fn read(&self, priority: Priority, statement: Statement) -> Result<QueryResult> {
        self.client
            .execute_one(AccessMode::Read, priority, statement)
            .await
    }

    async fn write(&self, priority: Priority, statement: Statement) -> Result<QueryResult> {
        self.client
            .execute_one(AccessMode::Write, priority, statement)
            .await
    }
}

#[async_trait]
impl MemoryBackend for GraphBackend {
    fn kind(&self) -> &'static str {
        "graph"
    }

    async fn ensure_schema(&self) -> Result<SchemaReport> {
        SchemaManager::new(self.client.clone()).ensure_schema().await
    }

    async fn persist(&self, write: MemoryWrite) -> Result<()> {
        let record = &write.record;
        let mut statements = vec![Statement::new(PERSIST_MEMORY)
            .param("user_id", &record.user_id)
            .param("created_at", to_millis(record.created_at))
            .param("props", record_props(record))];

        if !write.concepts.is_empty() {
            let concepts: Vec<Value> = write
                .concepts
                .iter()
                .map(|c| {
                    json!({
                        "name": c.name,
                        "strength": c.strength,
                        "concept_id": Uuid::new_v4().to_string(),
                    })
                })
                .collect();
            statements.push(
                Statement::new(LINK_CONCEPTS)
                    .param("memory_id", &record.memory_id)
                    .param("concepts", concepts),
            );
        }

        if let Some(snapshot) = &write.snapshot {
            statements.push(
                Statement::new(LINK_SNAPSHOT)
                    .param("memory_id", &record.memory_id)
                    .param("snapshot_id", &snapshot.snapshot_id)
                    .param(
                        "snapshot",
                        json!({
                            "consciousness_level": snapshot.consciousness_level,
                            "emotional_state": snapshot.emotional_state.as_str(),
                            "self_awareness_score": snapshot.self_awareness_score,
                            "learning_rate": snapshot.learning_rate,
                            "evolution_level": snapshot.evolution_level,
                            "timestamp": to_millis(snapshot.timestamp),
                        }),
                    ),
            );
        }

        self.client
            .execute_transaction(AccessMode::Write, Priority::Foreground, &statements)
            .await?;
        debug!("Stored memory {} for user {}", record.memory_id, record.user_id);
        Ok(())
    }

    async fn get(&self, memory_id: &str) -> Result<Option<MemoryRecord>> {
        let statement = Statement::new(format!(
            "MATCH (m) WHERE m.memory_id = $memory_id AND (m:Memory OR m:ArchivedMemory) RETURN {}",
            projection(true)
        ))
        .param("memory_id", memory_id);
        let result = self.read(Priority::Foreground, statement).await?;
        result.first().map(record_from_row).transpose()
    }

    async fn vector_candidates(
        &self,
        user_id: &str,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let statement = Statement::new(format!(
            "CALL db.index.vector.queryNodes($index, $k, $embedding) YIELD node AS m, score \
             WHERE m.user_id = $user_id \
             RETURN {}, score ORDER BY score DESC LIMIT $limit",
            projection(false)
        ))
        .param("index", VECTOR_INDEX)
        .param("k", limit.saturating_mul(VECTOR_OVERFETCH))
        .param("embedding", embedding)
        .param("user_id", user_id)
        .param("limit", limit);

        let result = self.read(Priority::Foreground, statement).await?;
        result
            .rows
            .iter()
            .map(|row| {
                // Cosine index scores are reported as (1 + cos) / 2
                let score = row.get_f32("score").unwrap_or(0.0) * 2.0 - 1.0;
                Ok(Candidate {
                    record: record_from_row(row)?,
                    score,
                })
            })
            .collect()
    }

    async fn keyword_candidates(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let Some(lucene) = fulltext_query(query) else {
            return Ok(Vec::new());
        };
        let statement = Statement::new(format!(
            "CALL db.index.fulltext.queryNodes($index, $query) YIELD node AS m, score \
             WHERE m.user_id = $user_id \
             RETURN {}, score ORDER BY score DESC, m.created_at DESC LIMIT $limit",
            projection(false)
        ))
        .param("index", FULLTEXT_INDEX)
        .param("query", lucene)
        .param("user_id", user_id)
        .param("limit", limit);

        let result = self.read(Priority::Foreground, statement).await?;
        // Lucene scores are unbounded; normalize to the best hit
        let max = result
            .rows
            .iter()
            .filter_map(|r| r.get_f32("score"))
            .fold(0.0f32, f32::max);
        result
            .rows
            .iter()
            .map(|row| {
                let raw = row.get_f32("score").unwrap_or(0.0);
                Ok(Candidate {
                    record: record_from_row(row)?,
                    score: if max > 0.0 { raw / max } else { 0.0 },
                })
            })
            .collect()
    }

    async fn concept_neighbors(
        &self,
        user_id: &str,
        seeds: &[String],
        depth: u8,
        limit: usize,
    ) -> Result<Vec<ConceptNeighbor>> {
        let mut exclude: Vec<String> = seeds.to_vec();
        let mut frontier: Vec<String> = seeds.to_vec();
        let mut found = Vec::new();

        for hop in 1..=depth.min(2) {
            if frontier.is_empty() {
                break;
            }
            let statement = Statement::new(format!(
                "{}\nRETURN {}, strength ORDER BY strength DESC, m.memory_id",
                CONCEPT_HOP,
                projection(false)
            ))
            .param("frontier", &frontier)
            .param("exclude", &exclude)
            .param("user_id", user_id);
            let result = self.read(Priority::Foreground, statement).await?;

            let mut next = Vec::new();
            for row in &result.rows {
                let record = record_from_row(row)?;
                next.push(record.memory_id.clone());
                found.push(ConceptNeighbor {
                    strength: row.get_f32("strength").unwrap_or(0.0),
                    hops: hop,
                    record,
                });
            }
            exclude.extend(next.iter().cloned());
            frontier = next;
        }

        found.truncate(limit);
        Ok(found)
    }

    async fn record_access(&self, memory_ids: &[String], at: DateTime<Utc>) -> Result<()> {
        if memory_ids.is_empty() {
            return Ok(());
        }
        let statement = Statement::new(RECORD_ACCESS)
            .param("ids", memory_ids)
            .param("at", to_millis(at));
        self.write(Priority::Background, statement).await?;
        Ok(())
    }

    async fn lifecycle_batch(&self, after: Option<&str>, limit: usize) -> Result<Vec<MemoryRecord>> {
        let statement = Statement::new(format!(
            "MATCH (m) WHERE (m:Memory OR m:ArchivedMemory) \
             AND ($after IS NULL OR m.memory_id > $after) \
             RETURN {} ORDER BY m.memory_id LIMIT $limit",
            projection(false)
        ))
        .param("after", after)
        .param("limit", limit);
        let result = self.read(Priority::Background, statement).await?;
        records(&result)
    }

    async fn apply_update(&self, update: &LifecycleUpdate) -> Result<()> {
        let statement = Statement::new(APPLY_UPDATE)
            .param("memory_id", &update.memory_id)
            .param("importance_score", update.importance_score)
            .param("significance_score", update.significance_score)
            .param("lifecycle_state", update.lifecycle_state.as_str())
            .param("last_decayed_at", to_millis(update.last_decayed_at))
            .param("access_count_at_sweep", update.access_count_at_sweep);
        let result = self.write(Priority::Background, statement).await?;
        if count(&result, "updated") == 0 {
            return Err(MemoryError::NotFound(update.memory_id.clone()));
        }
        Ok(())
    }

    async fn archive(&self, memory_id: &str, update: Option<&LifecycleUpdate>) -> Result<()> {
        let scores = match update {
            Some(u) => json!({
                "importance_score": u.importance_score,
                "significance_score": u.significance_score,
                "last_decayed_at": to_millis(u.last_decayed_at),
                "access_count_at_sweep": u.access_count_at_sweep,
            }),
            None => json!({}),
        };
        let statement = Statement::new(ARCHIVE_MEMORY)
            .param("memory_id", memory_id)
            .param("scores", scores);
        let result = self.write(Priority::Background, statement).await?;
        if count(&result, "archived") == 0 {
            return Err(MemoryError::NotFound(memory_id.to_string()));
        }
        debug!("Archived memory {}", memory_id);
        Ok(())
    }

    async fn delete(&self, memory_id: &str) -> Result<bool> {
        let statement = Statement::new(DELETE_MEMORY).param("memory_id", memory_id);
        let result = self.write(Priority::Background, statement).await?;
        Ok(count(&result, "deleted") > 0)
    }

    async fn stale_candidates(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        let statement = Statement::new(format!(
            "MATCH (m:Memory) WHERE m.lifecycle_state = 'stale' AND m.embedding IS NOT NULL \
             RETURN {} ORDER BY m.user_id, m.memory_id LIMIT $limit",
            projection(true)
        ))
        .param("limit", limit);
        let result = self.read(Priority::Background, statement).await?;
        records(&result)
    }

    async fn delete_user(&self, user_id: &str) -> Result<u64> {
        let statement = Statement::new(DELETE_USER).param("user_id", user_id);
        let result = self.write(Priority::Foreground, statement).await?;
        let removed = count(&result, "removed");
        info!("Deleted user {} and {} memories", user_id, removed);
        Ok(removed)
    }

    async fn stats(&self) -> Result<MemoryStats> {
        let statements: Vec<Statement> = STATS.iter().map(|s| Statement::new(*s)).collect();
        let results = self
            .client
            .execute_transaction(AccessMode::Read, Priority::Background, &statements)
            .await?;
        let get = |i: usize, column: &str| results.get(i).map(|r| count(r, column)).unwrap_or(0);

        let total = get(1, "total");
        let stale = get(1, "stale");
        Ok(MemoryStats {
            users: get(0, "n"),
            active: total.saturating_sub(stale),
            stale,
            archived: get(2, "n"),
            concepts: get(3, "n"),
            snapshots: get(4, "n"),
            missing_embeddings: get(1, "missing"),
        })
    }

    async fn ping(&self) -> Result<()> {
        self.client.ping().await
    }

    fn circuit_state(&self) -> Option<CircuitState> {
        Some(self.client.breaker().state())
    }
}

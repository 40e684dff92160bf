// ============================================================================
// EmbeddedBackend - Local memory graph on redb
// ============================================================================
// Same logical graph as the Neo4j backend, laid out as tables:
//   users, memories (hot), archive, user_memories (user␟memory),
//   concepts (by name), memory_concepts (memory␟concept),
//   concept_memories (concept␟memory), snapshots, meta.
// Values are bincode. Every call runs on the blocking pool.
// Default path: ~/.mainza/memory.redb (override via MAINZA_DB_PATH)
// ============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, Table, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Candidate, ConceptNeighbor, LifecycleUpdate, MemoryBackend, MemoryWrite};
use crate::clock::{from_millis, to_millis};
use crate::consciousness::{ConsciousnessSnapshot, EmotionalState};
use crate::error::{MemoryError, Result};
use crate::graph::SchemaReport;
use crate::memory::concepts::{keywords, tokenize};
use crate::memory::scoring::cosine_similarity;
use crate::memory::types::{
    Concept, LifecycleState, MemoryRecord, MemoryStats, MemoryType,
};

const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
const MEMORIES: TableDefinition<&str, &[u8]> = TableDefinition::new("memories");
const ARCHIVE: TableDefinition<&str, &[u8]> = TableDefinition::new("archive");
const USER_MEMORIES: TableDefinition<&str, &[u8]> = TableDefinition::new("user_memories");
const CONCEPTS: TableDefinition<&str, &[u8]> = TableDefinition::new("concepts");
const MEMORY_CONCEPTS: TableDefinition<&str, &[u8]> = TableDefinition::new("memory_concepts");
const CONCEPT_MEMORIES: TableDefinition<&str, &[u8]> = TableDefinition::new("concept_memories");
const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const TABLE_NAMES: &[&str] = &[
    "users",
    "memories",
    "archive",
    "user_memories",
    "concepts",
    "memory_concepts",
    "concept_memories",
    "snapshots",
    "meta",
];

const SCHEMA_VERSION_KEY: &str = "schema_version";
const SCHEMA_VERSION: &[u8] = b"1";

/// Separator inside composite keys; sorts below every printable char
const SEP: char = '\u{1f}';
/// First char after `SEP`, used as the exclusive upper bound of a prefix scan
const SEP_END: char = '\u{20}';

type StrTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

#[derive(Debug, Serialize, Deserialize)]
struct StoredUser {
    user_id: String,
    created_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredMemory {
    memory_id: String,
    content: String,
    memory_type: MemoryType,
    user_id: String,
    agent_name: String,
    consciousness_level: f32,
    emotional_state: EmotionalState,
    importance_score: f32,
    significance_score: f32,
    embedding: Option<Vec<f32>>,
    created_at: i64,
    last_accessed: i64,
    access_count: u64,
    metadata_json: String,
    lifecycle_state: LifecycleState,
    last_decayed_at: i64,
    access_count_at_sweep: u64,
    concept_count: u64,
    snapshot_id: Option<String>,
}

impl StoredMemory {
    fn from_record(record: &MemoryRecord) -> Self {
        Self {
            memory_id: record.memory_id.clone(),
            content: record.content.clone(),
            memory_type: record.memory_type,
            user_id: record.user_id.clone(),
            agent_name: record.agent_name.clone(),
            consciousness_level: record.consciousness_level,
            emotional_state: record.emotional_state,
            importance_score: record.importance_score,
            significance_score: record.significance_score,
            embedding: record.embedding.clone(),
            created_at: to_millis(record.created_at),
            last_accessed: to_millis(record.last_accessed),
            access_count: record.access_count,
            metadata_json: record.metadata_json(),
            lifecycle_state: record.lifecycle_state,
            last_decayed_at: to_millis(record.last_decayed_at),
            access_count_at_sweep: record.access_count_at_sweep,
            concept_count: record.concept_count as u64,
            snapshot_id: record.snapshot_id.clone(),
        }
    }

    fn into_record(self) -> MemoryRecord {
        let metadata = match serde_json::from_str::<Value>(&self.metadata_json) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        MemoryRecord {
            memory_id: self.memory_id,
            content: self.content,
            memory_type: self.memory_type,
            user_id: self.user_id,
            agent_name: self.agent_name,
            consciousness_level: self.consciousness_level,
            emotional_state: self.emotional_state,
            importance_score: self.importance_score,
            significance_score: self.significance_score,
            embedding: self.embedding,
            created_at: from_millis(self.created_at),
            last_accessed: from_millis(self.last_accessed),
            access_count: self.access_count,
            metadata,
            lifecycle_state: self.lifecycle_state,
            last_decayed_at: from_millis(self.last_decayed_at),
            access_count_at_sweep: self.access_count_at_sweep,
            concept_count: self.concept_count as usize,
            snapshot_id: self.snapshot_id,
        }
    }
}

fn storage(what: &str, e: impl std::fmt::Display) -> MemoryError {
    MemoryError::Storage(format!("{}: {}", what, e))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| storage("Failed to serialize row", e))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| storage("Failed to deserialize row", e))
}

fn pair_key(a: &str, b: &str) -> String {
    format!("{}{}{}", a, SEP, b)
}

fn second_part(key: &str) -> Option<&str> {
    key.split_once(SEP).map(|(_, b)| b)
}

/// Keys starting with `prefix␟`
fn prefixed<T>(table: &T, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let start = format!("{}{}", prefix, SEP);
    let end = format!("{}{}", prefix, SEP_END);
    let mut out = Vec::new();
    let iter = table
        .range::<&str>(start.as_str()..end.as_str())
        .map_err(|e| storage("Failed to scan table", e))?;
    for entry in iter {
        let (key, value) = entry.map_err(|e| storage("Failed to read entry", e))?;
        out.push((key.value().to_string(), value.value().to_vec()));
    }
    Ok(out)
}

fn read_row<T, R>(table: &T, key: &str) -> Result<Option<R>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
    R: DeserializeOwned,
{
    match table.get(key).map_err(|e| storage("Failed to get row", e))? {
        Some(value) => Ok(Some(decode(value.value())?)),
        None => Ok(None),
    }
}

fn read_memory<T>(table: &T, memory_id: &str) -> Result<Option<MemoryRecord>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    Ok(read_row::<T, StoredMemory>(table, memory_id)?.map(StoredMemory::into_record))
}

fn write_memory(table: &mut StrTable<'_>, record: &MemoryRecord) -> Result<()> {
    let bytes = encode(&StoredMemory::from_record(record))?;
    table
        .insert(record.memory_id.as_str(), bytes.as_slice())
        .map_err(|e| storage("Failed to insert memory", e))?;
    Ok(())
}

/// Fraction of distinct query terms present in `content`
fn keyword_score(query_terms: &HashSet<String>, content: &str) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let content_terms: HashSet<String> = tokenize(content).collect();
    let matched = query_terms.iter().filter(|t| content_terms.contains(*t)).count();
    matched as f32 / query_terms.len() as f32
}

fn query_terms(query: &str) -> HashSet<String> {
    let terms: HashSet<String> = keywords(query).into_iter().collect();
    if terms.is_empty() {
        tokenize(query).collect()
    } else {
        terms
    }
}

/// Embedded memory backend
pub struct EmbeddedBackend {
    db: Arc<Database>,
    path: Option<PathBuf>,
}

impl EmbeddedBackend {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| storage("Failed to create database directory", e))?;
        }
        info!("Opening memory database at: {}", path.display());
        let db = Database::create(path).map_err(|e| storage("Failed to open database", e))?;
        Ok(Self {
            db: Arc::new(db),
            path: Some(path.to_path_buf()),
        })
    }

    /// Volatile database for tests and local experiments
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| storage("Failed to create in-memory database", e))?;
        Ok(Self {
            db: Arc::new(db),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| storage("Blocking task failed", e))?
    }

    /// Hot memories of one user
    fn user_memories(db: &Database, user_id: &str) -> Result<Vec<MemoryRecord>> {
        let txn = db.begin_read().map_err(|e| storage("Failed to begin read", e))?;
        let index = txn
            .open_table(USER_MEMORIES)
            .map_err(|e| storage("Failed to open user index", e))?;
        let memories = txn
            .open_table(MEMORIES)
            .map_err(|e| storage("Failed to open memories table", e))?;

        let mut out = Vec::new();
        for (key, _) in prefixed(&index, user_id)? {
            if let Some(memory_id) = second_part(&key) {
                if let Some(record) = read_memory(&memories, memory_id)? {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    fn delete_in_txn(txn: &redb::WriteTransaction, memory_id: &str) -> Result<bool> {
        let mut memories = txn
            .open_table(MEMORIES)
            .map_err(|e| storage("Failed to open memories table", e))?;
        let mut archive = txn
            .open_table(ARCHIVE)
            .map_err(|e| storage("Failed to open archive table", e))?;

        let removed = match memories
            .remove(memory_id)
            .map_err(|e| storage("Failed to remove memory", e))?
        {
            Some(bytes) => Some(decode::<StoredMemory>(bytes.value())?),
            None => None,
        };
        let removed = match removed {
            Some(row) => Some(row),
            None => match archive
                .remove(memory_id)
                .map_err(|e| storage("Failed to remove archived memory", e))?
            {
                Some(bytes) => Some(decode::<StoredMemory>(bytes.value())?),
                None => None,
            },
        };
        let Some(row) = removed else {
            return Ok(false);
        };

        let mut index = txn
            .open_table(USER_MEMORIES)
            .map_err(|e| storage("Failed to open user index", e))?;
        index
            .remove(pair_key(&row.user_id, memory_id).as_str())
            .map_err(|e| storage("Failed to remove index entry", e))?;

        let mut memory_concepts = txn
            .open_table(MEMORY_CONCEPTS)
            .map_err(|e| storage("Failed to open memory_concepts", e))?;
        let mut concept_memories = txn
            .open_table(CONCEPT_MEMORIES)
            .map_err(|e| storage("Failed to open concept_memories", e))?;
        for (key, _) in prefixed(&memory_concepts, memory_id)? {
            if let Some(concept) = second_part(&key) {
                concept_memories
                    .remove(pair_key(concept, memory_id).as_str())
                    .map_err(|e| storage("Failed to unlink concept", e))?;
            }
            memory_concepts
                .remove(key.as_str())
                .map_err(|e| storage("Failed to unlink concept", e))?;
        }
        Ok(true)
    }
}

#[async_trait]
impl MemoryBackend for EmbeddedBackend {
    fn kind(&self) -> &'static str {
        "embedded"
    }

    async fn ensure_schema(&self) -> Result<SchemaReport> {
        self.blocking(|db| {
            let txn = db.begin_write().map_err(|e| storage("Failed to begin write", e))?;
            let fresh;
            {
                for def in [
                    USERS,
                    MEMORIES,
                    ARCHIVE,
                    USER_MEMORIES,
                    CONCEPTS,
                    MEMORY_CONCEPTS,
                    CONCEPT_MEMORIES,
                    SNAPSHOTS,
                ] {
                    txn.open_table(def)
                        .map_err(|e| MemoryError::Schema(format!("Failed to create table: {}", e)))?;
                }
                let mut meta = txn
                    .open_table(META)
                    .map_err(|e| MemoryError::Schema(format!("Failed to create meta table: {}", e)))?;
                let version = meta
                    .get(SCHEMA_VERSION_KEY)
                    .map_err(|e| MemoryError::Schema(e.to_string()))?
                    .map(|v| v.value().to_vec());
                fresh = version.is_none();
                match version {
                    Some(v) if v.as_slice() != SCHEMA_VERSION => {
                        return Err(MemoryError::Schema(format!(
                            "database schema version {} is not supported",
                            String::from_utf8_lossy(&v)
                        )));
                    }
                    Some(_) => {}
                    None => {
                        meta.insert(SCHEMA_VERSION_KEY, SCHEMA_VERSION)
                            .map_err(|e| MemoryError::Schema(e.to_string()))?;
                    }
                }
            }
            txn.commit()
                .map_err(|e| MemoryError::Schema(format!("Failed to commit schema: {}", e)))?;

            let names: Vec<String> = TABLE_NAMES.iter().map(|n| n.to_string()).collect();
            Ok(SchemaReport {
                created: if fresh { names.clone() } else { Vec::new() },
                verified: names,
            })
        })
        .await
    }

    async fn persist(&self, write: MemoryWrite) -> Result<()> {
        self.blocking(move |db| {
            let record = &write.record;
            let txn = db.begin_write().map_err(|e| storage("Failed to begin write", e))?;
            {
                let mut users = txn
                    .open_table(USERS)
                    .map_err(|e| storage("Failed to open users table", e))?;
                let exists = users
                    .get(record.user_id.as_str())
                    .map_err(|e| storage("Failed to get user", e))?
                    .is_some();
                if !exists {
                    let user = encode(&StoredUser {
                        user_id: record.user_id.clone(),
                        created_at: to_millis(record.created_at),
                    })?;
                    users
                        .insert(record.user_id.as_str(), user.as_slice())
                        .map_err(|e| storage("Failed to insert user", e))?;
                }

                let mut memories = txn
                    .open_table(MEMORIES)
                    .map_err(|e| storage("Failed to open memories table", e))?;
                if memories
                    .get(record.memory_id.as_str())
                    .map_err(|e| storage("Failed to get memory", e))?
                    .is_some()
                {
                    return Err(MemoryError::Storage(format!(
                        "memory id {} already exists",
                        record.memory_id
                    )));
                }
                write_memory(&mut memories, record)?;

                let mut index = txn
                    .open_table(USER_MEMORIES)
                    .map_err(|e| storage("Failed to open user index", e))?;
                index
                    .insert(pair_key(&record.user_id, &record.memory_id).as_str(), b"".as_slice())
                    .map_err(|e| storage("Failed to index memory", e))?;

                let mut concepts = txn
                    .open_table(CONCEPTS)
                    .map_err(|e| storage("Failed to open concepts table", e))?;
                let mut memory_concepts = txn
                    .open_table(MEMORY_CONCEPTS)
                    .map_err(|e| storage("Failed to open memory_concepts", e))?;
                let mut concept_memories = txn
                    .open_table(CONCEPT_MEMORIES)
                    .map_err(|e| storage("Failed to open concept_memories", e))?;
                for link in &write.concepts {
                    let concept = match read_row::<_, Concept>(&concepts, &link.name)? {
                        Some(mut existing) => {
                            existing.usage_frequency += 1;
                            existing.importance_score = existing.importance_score.max(link.strength);
                            existing
                        }
                        None => Concept {
                            concept_id: Uuid::new_v4().to_string(),
                            name: link.name.clone(),
                            importance_score: link.strength,
                            usage_frequency: 1,
                        },
                    };
                    let bytes = encode(&concept)?;
                    concepts
                        .insert(link.name.as_str(), bytes.as_slice())
                        .map_err(|e| storage("Failed to upsert concept", e))?;

                    let strength = encode(&link.strength)?;
                    memory_concepts
                        .insert(pair_key(&record.memory_id, &link.name).as_str(), strength.as_slice())
                        .map_err(|e| storage("Failed to link concept", e))?;
                    concept_memories
                        .insert(pair_key(&link.name, &record.memory_id).as_str(), strength.as_slice())
                        .map_err(|e| storage("Failed to link concept", e))?;
                }

                if let Some(snapshot) = &write.snapshot {
                    let mut snapshots = txn
                        .open_table(SNAPSHOTS)
                        .map_err(|e| storage("Failed to open snapshots table", e))?;
                    let exists = snapshots
                        .get(snapshot.snapshot_id.as_str())
                        .map_err(|e| storage("Failed to read snapshot", e))?
                        .is_some();
                    if !exists {
                        let bytes = encode(snapshot)?;
                        snapshots
                            .insert(snapshot.snapshot_id.as_str(), bytes.as_slice())
                            .map_err(|e| storage("Failed to insert snapshot", e))?;
                    }
                }
            }
            txn.commit().map_err(|e| storage("Failed to commit", e))?;

            debug!("Stored memory {} for user {}", record.memory_id, record.user_id);
            Ok(())
        })
        .await
    }

    async fn get(&self, memory_id: &str) -> Result<Option<MemoryRecord>> {
        let memory_id = memory_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(|e| storage("Failed to begin read", e))?;
            let memories = txn
                .open_table(MEMORIES)
                .map_err(|e| storage("Failed to open memories table", e))?;
            if let Some(record) = read_memory(&memories, &memory_id)? {
                return Ok(Some(record));
            }
            let archive = txn
                .open_table(ARCHIVE)
                .map_err(|e| storage("Failed to open archive table", e))?;
            read_memory(&archive, &memory_id)
        })
        .await
    }

    async fn vector_candidates(
        &self,
        user_id: &str,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let user_id = user_id.to_string();
        let query = embedding.to_vec();
        self.blocking(move |db| {
            let mut hits: Vec<Candidate> = Self::user_memories(db, &user_id)?
                .into_iter()
                .filter_map(|record| {
                    let score = cosine_similarity(record.embedding.as_deref()?, &query);
                    Some(Candidate { record, score })
                })
                .collect();
            hits.sort_by(|a, b| b.score.total_cmp(&a.score));
            hits.truncate(limit);
            Ok(hits)
        })
        .await
    }

    async fn keyword_candidates(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let user_id = user_id.to_string();
        let terms = query_terms(query);
        self.blocking(move |db| {
            let mut hits: Vec<Candidate> = Self::user_memories(db, &user_id)?
                .into_iter()
                .filter_map(|record| {
                    let score = keyword_score(&terms, &record.content);
                    (score > 0.0).then_some(Candidate { record, score })
                })
                .collect();
            hits.sort_by(|a, b| {
                b.score
                    .total_cmp(&a.score)
                    .then(b.record.created_at.cmp(&a.record.created_at))
            });
            hits.truncate(limit);
            Ok(hits)
        })
        .await
    }

    async fn concept_neighbors(
        &self,
        user_id: &str,
        seeds: &[String],
        depth: u8,
        limit: usize,
    ) -> Result<Vec<ConceptNeighbor>> {
        let user_id = user_id.to_string();
        let seeds = seeds.to_vec();
        let depth = depth.min(2);
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(|e| storage("Failed to begin read", e))?;
            let memories = txn
                .open_table(MEMORIES)
                .map_err(|e| storage("Failed to open memories table", e))?;
            let memory_concepts = txn
                .open_table(MEMORY_CONCEPTS)
                .map_err(|e| storage("Failed to open memory_concepts", e))?;
            let concept_memories = txn
                .open_table(CONCEPT_MEMORIES)
                .map_err(|e| storage("Failed to open concept_memories", e))?;

            let mut visited: HashSet<String> = seeds.iter().cloned().collect();
            let mut seen_concepts: HashSet<String> = HashSet::new();
            let mut frontier = seeds.clone();
            let mut found: Vec<ConceptNeighbor> = Vec::new();

            for hop in 1..=depth {
                let mut best: HashMap<String, f32> = HashMap::new();
                for memory_id in &frontier {
                    for (key, _) in prefixed(&memory_concepts, memory_id)? {
                        let Some(concept) = second_part(&key) else { continue };
                        if !seen_concepts.insert(concept.to_string()) {
                            continue;
                        }
                        for (link_key, strength) in prefixed(&concept_memories, concept)? {
                            let Some(other) = second_part(&link_key) else { continue };
                            if visited.contains(other) {
                                continue;
                            }
                            let strength: f32 = decode(&strength)?;
                            let entry = best.entry(other.to_string()).or_insert(0.0);
                            *entry = entry.max(strength);
                        }
                    }
                }

                let mut next = Vec::new();
                for (memory_id, strength) in best {
                    visited.insert(memory_id.clone());
                    let Some(record) = read_memory(&memories, &memory_id)? else {
                        continue;
                    };
                    if record.user_id != user_id {
                        continue;
                    }
                    next.push(memory_id);
                    found.push(ConceptNeighbor {
                        record,
                        hops: hop,
                        strength,
                    });
                }
                next.sort();
                frontier = next;
            }

            found.sort_by(|a, b| {
                a.hops
                    .cmp(&b.hops)
                    .then(b.strength.total_cmp(&a.strength))
                    .then(a.record.memory_id.cmp(&b.record.memory_id))
            });
            found.truncate(limit);
            Ok(found)
        })
        .await
    }

    async fn record_access(&self, memory_ids: &[String], at: DateTime<Utc>) -> Result<()> {
        let ids = memory_ids.to_vec();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(|e| storage("Failed to begin write", e))?;
            {
                let mut memories = txn
                    .open_table(MEMORIES)
                    .map_err(|e| storage("Failed to open memories table", e))?;
                for id in &ids {
                    let Some(mut record) = read_memory(&memories, id)? else {
                        continue;
                    };
                    record.access_count += 1;
                    record.last_accessed = at;
                    write_memory(&mut memories, &record)?;
                }
            }
            txn.commit().map_err(|e| storage("Failed to commit", e))?;
            Ok(())
        })
        .await
    }

    async fn lifecycle_batch(&self, after: Option<&str>, limit: usize) -> Result<Vec<MemoryRecord>> {
        let after = after.map(str::to_string);
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(|e| storage("Failed to begin read", e))?;
            let mut out = Vec::new();
            for def in [MEMORIES, ARCHIVE] {
                let table = txn
                    .open_table(def)
                    .map_err(|e| storage("Failed to open table", e))?;
                let lower = match &after {
                    Some(a) => Bound::Excluded(a.as_str()),
                    None => Bound::Unbounded,
                };
                let iter = table
                    .range::<&str>((lower, Bound::Unbounded))
                    .map_err(|e| storage("Failed to scan memories", e))?;
                for entry in iter.take(limit) {
                    let (_, value) = entry.map_err(|e| storage("Failed to read entry", e))?;
                    out.push(decode::<StoredMemory>(value.value())?.into_record());
                }
            }
            out.sort_by(|a, b| a.memory_id.cmp(&b.memory_id));
            out.truncate(limit);
            Ok(out)
        })
        .await
    }

    async fn apply_update(&self, update: &LifecycleUpdate) -> Result<()> {
        let update = update.clone();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(|e| storage("Failed to begin write", e))?;
            {
                let mut memories = txn
                    .open_table(MEMORIES)
                    .map_err(|e| storage("Failed to open memories table", e))?;
                let mut record = read_memory(&memories, &update.memory_id)?
                    .ok_or_else(|| MemoryError::NotFound(update.memory_id.clone()))?;
                record.importance_score = update.importance_score;
                record.significance_score = update.significance_score;
                record.lifecycle_state = update.lifecycle_state;
                record.last_decayed_at = update.last_decayed_at;
                record.access_count_at_sweep = update.access_count_at_sweep;
                write_memory(&mut memories, &record)?;
            }
            txn.commit().map_err(|e| storage("Failed to commit", e))?;
            Ok(())
        })
        .await
    }

    async fn archive(&self, memory_id: &str, update: Option<&LifecycleUpdate>) -> Result<()> {
        let memory_id = memory_id.to_string();
        let update = update.cloned();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(|e| storage("Failed to begin write", e))?;
            {
                let mut memories = txn
                    .open_table(MEMORIES)
                    .map_err(|e| storage("Failed to open memories table", e))?;
                let mut record = match memories
                    .remove(memory_id.as_str())
                    .map_err(|e| storage("Failed to remove memory", e))?
                {
                    Some(bytes) => decode::<StoredMemory>(bytes.value())?.into_record(),
                    None => return Err(MemoryError::NotFound(memory_id.clone())),
                };
                if let Some(update) = &update {
                    record.importance_score = update.importance_score;
                    record.significance_score = update.significance_score;
                    record.last_decayed_at = update.last_decayed_at;
                    record.access_count_at_sweep = update.access_count_at_sweep;
                }
                record.lifecycle_state = LifecycleState::Archived;

                let mut archive = txn
                    .open_table(ARCHIVE)
                    .map_err(|e| storage("Failed to open archive table", e))?;
                write_memory(&mut archive, &record)?;
            }
            txn.commit().map_err(|e| storage("Failed to commit", e))?;
            debug!("Archived memory {}", memory_id);
            Ok(())
        })
        .await
    }

    async fn delete(&self, memory_id: &str) -> Result<bool> {
        let memory_id = memory_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(|e| storage("Failed to begin write", e))?;
            let removed = Self::delete_in_txn(&txn, &memory_id)?;
            txn.commit().map_err(|e| storage("Failed to commit", e))?;
            if removed {
                debug!("Deleted memory {}", memory_id);
            }
            Ok(removed)
        })
        .await
    }

    async fn stale_candidates(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(|e| storage("Failed to begin read", e))?;
            let memories = txn
                .open_table(MEMORIES)
                .map_err(|e| storage("Failed to open memories table", e))?;
            let mut out = Vec::new();
            for entry in memories.iter().map_err(|e| storage("Failed to iterate memories", e))? {
                let (_, value) = entry.map_err(|e| storage("Failed to read entry", e))?;
                let record = decode::<StoredMemory>(value.value())?.into_record();
                if record.lifecycle_state == LifecycleState::Stale && record.has_embedding() {
                    out.push(record);
                }
            }
            out.sort_by(|a, b| {
                a.user_id
                    .cmp(&b.user_id)
                    .then(a.memory_id.cmp(&b.memory_id))
            });
            out.truncate(limit);
            Ok(out)
        })
        .await
    }

    async fn delete_user(&self, user_id: &str) -> Result<u64> {
        let user_id = user_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(|e| storage("Failed to begin write", e))?;
            let keys = {
                let index = txn
                    .open_table(USER_MEMORIES)
                    .map_err(|e| storage("Failed to open user index", e))?;
                prefixed(&index, &user_id)?
            };
            let mut removed = 0u64;
            for (key, _) in keys {
                if let Some(memory_id) = second_part(&key) {
                    if Self::delete_in_txn(&txn, memory_id)? {
                        removed += 1;
                    }
                }
            }
            {
                let mut users = txn
                    .open_table(USERS)
                    .map_err(|e| storage("Failed to open users table", e))?;
                users
                    .remove(user_id.as_str())
                    .map_err(|e| storage("Failed to remove user", e))?;
            }
            txn.commit().map_err(|e| storage("Failed to commit", e))?;
            info!("Deleted user {} and {} memories", user_id, removed);
            Ok(removed)
        })
        .await
    }

    async fn stats(&self) -> Result<MemoryStats> {
        self.blocking(|db| {
            let txn = db.begin_read().map_err(|e| storage("Failed to begin read", e))?;
            let count = |def: TableDefinition<&str, &[u8]>| -> Result<u64> {
                txn.open_table(def)
                    .map_err(|e| storage("Failed to open table", e))?
                    .len()
                    .map_err(|e| storage("Failed to count table", e))
            };
            let mut stats = MemoryStats {
                users: count(USERS)?,
                archived: count(ARCHIVE)?,
                concepts: count(CONCEPTS)?,
                snapshots: count(SNAPSHOTS)?,
                ..Default::default()
            };

            let memories = txn
                .open_table(MEMORIES)
                .map_err(|e| storage("Failed to open memories table", e))?;
            for entry in memories.iter().map_err(|e| storage("Failed to iterate memories", e))? {
                let (_, value) = entry.map_err(|e| storage("Failed to read entry", e))?;
                let row: StoredMemory = decode(value.value())?;
                match row.lifecycle_state {
                    LifecycleState::Stale => stats.stale += 1,
                    _ => stats.active += 1,
                }
                if row.embedding.is_none() {
                    stats.missing_embeddings += 1;
                }
            }
            Ok(stats)
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.blocking(|db| {
            db.begin_read()
                .map_err(|e| storage("Failed to begin read", e))?
                .open_table(META)
                .map_err(|e| storage("Failed to open meta table", e))?;
            Ok(())
        })
        .await
    }
}

impl EmbeddedBackend {
    /// Look up a persisted consciousness snapshot
    pub async fn snapshot(&self, snapshot_id: &str) -> Result<Option<ConsciousnessSnapshot>> {
        let snapshot_id = snapshot_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(|e| storage("Failed to begin read", e))?;
            let snapshots = txn
                .open_table(SNAPSHOTS)
                .map_err(|e| storage("Failed to open snapshots table", e))?;
            read_row(&snapshots, &snapshot_id)
        })
        .await
    }

    /// Look up a concept by name
    pub async fn concept(&self, name: &str) -> Result<Option<Concept>> {
        let name = name.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(|e| storage("Failed to begin read", e))?;
            let concepts = txn
                .open_table(CONCEPTS)
                .map_err(|e| storage("Failed to open concepts table", e))?;
            read_row(&concepts, &name)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consciousness::ConsciousnessContext;
    use crate::memory::concepts::extract_concepts;
    use crate::memory::embeddings::HashingEmbedder;
    use chrono::Duration;

    async fn backend() -> EmbeddedBackend {
        let backend = EmbeddedBackend::in_memory().unwrap();
        backend.ensure_schema().await.unwrap();
        backend
    }

    fn write_for(user: &str, content: &str) -> MemoryWrite {
        let ctx = ConsciousnessContext::default();
        let mut record = MemoryRecord::new(user, "agent", content, MemoryType::Interaction, &ctx, Utc::now());
        if let Ok(e) = HashingEmbedder::new().embed_sync(content) {
            record = record.with_embedding(e);
        }
        let concepts = extract_concepts(content);
        record.concept_count = concepts.len();
        MemoryWrite {
            record,
            concepts,
            snapshot: None,
        }
    }

    #[tokio::test]
    async fn test_ensure_schema_idempotent() {
        let backend = EmbeddedBackend::in_memory().unwrap();
        let first = backend.ensure_schema().await.unwrap();
        let second = backend.ensure_schema().await.unwrap();
        assert_eq!(first.created.len(), TABLE_NAMES.len());
        assert!(second.created.is_empty());
        assert_eq!(first.verified, second.verified);
    }

    #[tokio::test]
    async fn test_persist_and_get() {
        let backend = backend().await;
        let mut write = write_for("u1", "I love discussing consciousness");
        write.record.metadata.insert("source".into(), Value::String("chat".into()));
        let id = write.record.memory_id.clone();
        backend.persist(write).await.unwrap();

        let record = backend.get(&id).await.unwrap().unwrap();
        assert_eq!(record.user_id, "u1");
        assert_eq!(record.metadata.get("source"), Some(&Value::String("chat".into())));
        assert!(record.has_embedding());

        let concept = backend.concept("consciousness").await.unwrap().unwrap();
        assert_eq!(concept.usage_frequency, 1);

        backend.persist(write_for("u2", "consciousness again")).await.unwrap();
        let concept = backend.concept("consciousness").await.unwrap().unwrap();
        assert_eq!(concept.usage_frequency, 2);
    }

    #[tokio::test]
    async fn test_duplicate_memory_id_rejected() {
        let backend = backend().await;
        let write = write_for("u1", "only once");
        backend.persist(write.clone()).await.unwrap();
        assert!(matches!(
            backend.persist(write).await,
            Err(MemoryError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_candidates_are_scoped_to_user() {
        let backend = backend().await;
        backend.persist(write_for("u1", "consciousness research notes")).await.unwrap();
        backend.persist(write_for("u2", "consciousness research notes")).await.unwrap();

        let query = HashingEmbedder::new().embed_sync("consciousness research").unwrap();
        let vector = backend.vector_candidates("u1", &query, 10).await.unwrap();
        assert_eq!(vector.len(), 1);
        assert_eq!(vector[0].record.user_id, "u1");

        let keyword = backend.keyword_candidates("u1", "consciousness", 10).await.unwrap();
        assert_eq!(keyword.len(), 1);
        assert_eq!(keyword[0].score, 1.0);
        assert!(backend.keyword_candidates("u3", "consciousness", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concept_neighbors_by_hops() {
        let backend = backend().await;
        let seed = write_for("u1", "gardening tomatoes");
        let one_hop = write_for("u1", "tomatoes taste great with basil");
        let two_hop = write_for("u1", "basil pesto recipe");
        let other_user = write_for("u2", "tomatoes everywhere");
        let seed_id = seed.record.memory_id.clone();
        let one_id = one_hop.record.memory_id.clone();
        let two_id = two_hop.record.memory_id.clone();
        for w in [seed, one_hop, two_hop, other_user] {
            backend.persist(w).await.unwrap();
        }

        let depth1 = backend
            .concept_neighbors("u1", &[seed_id.clone()], 1, 10)
            .await
            .unwrap();
        assert_eq!(depth1.len(), 1);
        assert_eq!(depth1[0].record.memory_id, one_id);
        assert_eq!(depth1[0].hops, 1);

        let depth2 = backend.concept_neighbors("u1", &[seed_id], 2, 10).await.unwrap();
        assert_eq!(depth2.len(), 2);
        assert_eq!(depth2[1].record.memory_id, two_id);
        assert_eq!(depth2[1].hops, 2);
    }

    #[tokio::test]
    async fn test_access_archive_and_delete() {
        let backend = backend().await;
        let write = write_for("u1", "a memory to age");
        let id = write.record.memory_id.clone();
        backend.persist(write).await.unwrap();

        let at = Utc::now() + Duration::hours(1);
        backend.record_access(&[id.clone()], at).await.unwrap();
        let record = backend.get(&id).await.unwrap().unwrap();
        assert_eq!(record.access_count, 1);
        assert_eq!(to_millis(record.last_accessed), to_millis(at));

        backend.archive(&id, None).await.unwrap();
        let archived = backend.get(&id).await.unwrap().unwrap();
        assert_eq!(archived.lifecycle_state, LifecycleState::Archived);
        assert!(backend.keyword_candidates("u1", "memory", 10).await.unwrap().is_empty());
        assert_eq!(backend.stats().await.unwrap().archived, 1);

        assert!(backend.delete(&id).await.unwrap());
        assert!(backend.get(&id).await.unwrap().is_none());
        assert!(!backend.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_archive_writes_scores_with_the_move() {
        let backend = backend().await;
        let write = write_for("u1", "an old evening");
        let id = write.record.memory_id.clone();
        backend.persist(write).await.unwrap();

        let swept_at = Utc::now() + Duration::days(40);
        let update = LifecycleUpdate {
            memory_id: id.clone(),
            importance_score: 0.07,
            significance_score: 0.09,
            lifecycle_state: LifecycleState::Archived,
            last_decayed_at: swept_at,
            access_count_at_sweep: 0,
        };
        backend.archive(&id, Some(&update)).await.unwrap();

        let archived = backend.get(&id).await.unwrap().unwrap();
        assert_eq!(archived.lifecycle_state, LifecycleState::Archived);
        assert_eq!(archived.importance_score, 0.07);
        assert_eq!(archived.significance_score, 0.09);
        assert_eq!(to_millis(archived.last_decayed_at), to_millis(swept_at));

        let missing = LifecycleUpdate {
            memory_id: "missing".into(),
            ..update
        };
        assert!(matches!(
            backend.archive("missing", Some(&missing)).await,
            Err(MemoryError::NotFound(_))
        ));
        assert_eq!(backend.stats().await.unwrap().archived, 1);
    }

    #[tokio::test]
    async fn test_lifecycle_batches_cover_hot_and_archive() {
        let backend = backend().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let write = write_for("u1", &format!("memory number {}", i));
            ids.push(write.record.memory_id.clone());
            backend.persist(write).await.unwrap();
        }
        backend.archive(&ids[2], None).await.unwrap();
        ids.sort();

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let batch = backend.lifecycle_batch(cursor.as_deref(), 2).await.unwrap();
            if batch.is_empty() {
                break;
            }
            cursor = batch.last().map(|r| r.memory_id.clone());
            seen.extend(batch.into_iter().map(|r| r.memory_id));
        }
        assert_eq!(seen, ids);
    }

    #[tokio::test]
    async fn test_delete_user_cascades() {
        let backend = backend().await;
        let a = write_for("u1", "first thought");
        let b = write_for("u1", "second thought");
        let keep = write_for("u2", "unrelated thought");
        let b_id = b.record.memory_id.clone();
        let keep_id = keep.record.memory_id.clone();
        for w in [a, b, keep] {
            backend.persist(w).await.unwrap();
        }
        backend.archive(&b_id, None).await.unwrap();

        assert_eq!(backend.delete_user("u1").await.unwrap(), 2);
        assert!(backend.get(&b_id).await.unwrap().is_none());
        assert!(backend.get(&keep_id).await.unwrap().is_some());
        assert_eq!(backend.stats().await.unwrap().users, 1);
    }

    #[tokio::test]
    async fn test_file_backed_database_reopens() {
        let dir = std::env::temp_dir().join(format!("mainza-test-{}", Uuid::new_v4()));
        let path = dir.join("memory.redb");
        let id = {
            let backend = EmbeddedBackend::open(&path).unwrap();
            backend.ensure_schema().await.unwrap();
            let write = write_for("u1", "persisted across restarts");
            let id = write.record.memory_id.clone();
            backend.persist(write).await.unwrap();
            id
        };
        let backend = EmbeddedBackend::open(&path).unwrap();
        assert!(backend.ensure_schema().await.unwrap().created.is_empty());
        assert!(backend.get(&id).await.unwrap().is_some());
        drop(backend);
        let _ = std::fs::remove_dir_all(dir);
    }
}

//! ============================================================================
//! Schema Manager - Constraints and indexes for the memory graph
//! ============================================================================
//! `ensure_schema` is idempotent: it lists what exists, creates what is
//! missing with `IF NOT EXISTS`, then verifies the result. A vector index
//! with the wrong dimensionality or similarity function is a hard error.
//! ============================================================================

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::client::GraphClient;
use super::pool::Priority;
use super::statement::Statement;
use super::transport::AccessMode;
use crate::error::{MemoryError, Result};
use crate::memory::embeddings::EMBEDDING_DIM;

/// Name of the single canonical vector index
pub const VECTOR_INDEX: &str = "memory_embedding";

/// Name of the full-text index over memory content
pub const FULLTEXT_INDEX: &str = "memory_content_fulltext";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    Constraint,
    Index,
}

struct SchemaObject {
    name: &'static str,
    kind: ObjectKind,
    create: &'static str,
}

const SCHEMA: &[SchemaObject] = &[
    SchemaObject {
        name: "memory_id_unique",
        kind: ObjectKind::Constraint,
        create: "CREATE CONSTRAINT memory_id_unique IF NOT EXISTS FOR (m:Memory) REQUIRE m.memory_id IS UNIQUE",
    },
    SchemaObject {
        name: "user_id_unique",
        kind: ObjectKind::Constraint,
        create: "CREATE CONSTRAINT user_id_unique IF NOT EXISTS FOR (u:User) REQUIRE u.user_id IS UNIQUE",
    },
    SchemaObject {
        name: "concept_name_unique",
        kind: ObjectKind::Constraint,
        create: "CREATE CONSTRAINT concept_name_unique IF NOT EXISTS FOR (c:Concept) REQUIRE c.name IS UNIQUE",
    },
    SchemaObject {
        name: "concept_id_unique",
        kind: ObjectKind::Constraint,
        create: "CREATE CONSTRAINT concept_id_unique IF NOT EXISTS FOR (c:Concept) REQUIRE c.concept_id IS UNIQUE",
    },
    SchemaObject {
        name: "snapshot_id_unique",
        kind: ObjectKind::Constraint,
        create: "CREATE CONSTRAINT snapshot_id_unique IF NOT EXISTS FOR (s:ConsciousnessSnapshot) REQUIRE s.snapshot_id IS UNIQUE",
    },
    SchemaObject {
        name: "archived_memory_id_unique",
        kind: ObjectKind::Constraint,
        create: "CREATE CONSTRAINT archived_memory_id_unique IF NOT EXISTS FOR (a:ArchivedMemory) REQUIRE a.memory_id IS UNIQUE",
    },
    SchemaObject {
        name: "memory_user_level_importance",
        kind: ObjectKind::Index,
        create: "CREATE INDEX memory_user_level_importance IF NOT EXISTS FOR (m:Memory) ON (m.user_id, m.consciousness_level, m.importance_score)",
    },
    SchemaObject {
        name: "memory_user_type_created",
        kind: ObjectKind::Index,
        create: "CREATE INDEX memory_user_type_created IF NOT EXISTS FOR (m:Memory) ON (m.user_id, m.memory_type, m.created_at)",
    },
    SchemaObject {
        name: "memory_created_at",
        kind: ObjectKind::Index,
        create: "CREATE INDEX memory_created_at IF NOT EXISTS FOR (m:Memory) ON (m.created_at)",
    },
    SchemaObject {
        name: VECTOR_INDEX,
        kind: ObjectKind::Index,
        create: "CREATE VECTOR INDEX memory_embedding IF NOT EXISTS FOR (m:Memory) ON (m.embedding) OPTIONS {indexConfig: {`vector.dimensions`: 768, `vector.similarity_function`: 'cosine'}}",
    },
    SchemaObject {
        name: FULLTEXT_INDEX,
        kind: ObjectKind::Index,
        create: "CREATE FULLTEXT INDEX memory_content_fulltext IF NOT EXISTS FOR (m:Memory) ON EACH [m.content]",
    },
];

/// Outcome of a successful `ensure_schema`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaReport {
    /// Objects that were missing and have been created
    pub created: Vec<String>,
    /// Every required object confirmed present after the run
    pub verified: Vec<String>,
}

pub struct SchemaManager {
    client: Arc<GraphClient>,
}

impl SchemaManager {
    pub fn new(client: Arc<GraphClient>) -> Self {
        Self { client }
    }

    /// Create missing constraints and indexes, then verify all of them
    pub async fn ensure_schema(&self) -> Result<SchemaReport> {
        let (indexes, constraints) = self.existing().await?;
        let mut report = SchemaReport::default();

        for object in SCHEMA {
            let present = match object.kind {
                ObjectKind::Constraint => constraints.contains(object.name),
                ObjectKind::Index => indexes.contains_key(object.name),
            };
            if present {
                continue;
            }
            // Schema commands cannot share a transaction with other statements
            self.client
                .execute_one(AccessMode::Write, Priority::Foreground, Statement::new(object.create))
                .await
                .map_err(|e| MemoryError::Schema(format!("creating {}: {}", object.name, e)))?;
            debug!("Created schema object {}", object.name);
            report.created.push(object.name.to_string());
        }

        let (indexes, constraints) = self.existing().await?;
        for object in SCHEMA {
            let present = match object.kind {
                ObjectKind::Constraint => constraints.contains(object.name),
                ObjectKind::Index => indexes.contains_key(object.name),
            };
            if !present {
                return Err(MemoryError::Schema(format!(
                    "{} is missing after creation",
                    object.name
                )));
            }
            report.verified.push(object.name.to_string());
        }

        if let Some(options) = indexes.get(VECTOR_INDEX) {
            verify_vector_options(options)?;
        }

        info!(
            "Schema ready: {} created, {} verified",
            report.created.len(),
            report.verified.len()
        );
        Ok(report)
    }

    async fn existing(&self) -> Result<(HashMap<String, Value>, HashSet<String>)> {
        let to_schema_err = |e: MemoryError| MemoryError::Schema(format!("listing schema: {}", e));

        let index_rows = self
            .client
            .execute_read(Statement::new(
                "SHOW INDEXES YIELD name, type, options RETURN name, type, options",
            ))
            .await
            .map_err(to_schema_err)?;
        let constraint_rows = self
            .client
            .execute_read(Statement::new("SHOW CONSTRAINTS YIELD name RETURN name"))
            .await
            .map_err(to_schema_err)?;

        let indexes = index_rows
            .rows
            .iter()
            .filter_map(|row| {
                let name = row.get_string("name")?;
                let options = row.get("options").cloned().unwrap_or(Value::Null);
                Some((name, options))
            })
            .collect();
        let constraints = constraint_rows
            .rows
            .iter()
            .filter_map(|row| row.get_string("name"))
            .collect();

        Ok((indexes, constraints))
    }
}

fn verify_vector_options(options: &Value) -> Result<()> {
    let config = options.get("indexConfig").unwrap_or(&Value::Null);
    let dimensions = config
        .get("vector.dimensions")
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)));
    let similarity = config
        .get("vector.similarity_function")
        .and_then(|v| v.as_str())
        .map(|s| s.to_lowercase());

    if dimensions != Some(EMBEDDING_DIM as i64) {
        return Err(MemoryError::Schema(format!(
            "vector index {} has dimensions {:?}, expected {}",
            VECTOR_INDEX, dimensions, EMBEDDING_DIM
        )));
    }
    if similarity.as_deref() != Some("cosine") {
        return Err(MemoryError::Schema(format!(
            "vector index {} uses similarity {:?}, expected cosine",
            VECTOR_INDEX, similarity
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, PoolConfig, RetryConfig};
    use crate::graph::testing::ScriptedConnector;

    fn manager(connector: Arc<ScriptedConnector>) -> SchemaManager {
        SchemaManager::new(Arc::new(GraphClient::with_configs(
            connector,
            PoolConfig::default(),
            BreakerConfig::default(),
            RetryConfig {
                jitter: false,
                base_delay_ms: 1,
                ..Default::default()
            },
        )))
    }

    #[tokio::test]
    async fn test_ensure_schema_creates_everything() {
        let connector = Arc::new(ScriptedConnector::new());
        let report = manager(connector.clone()).ensure_schema().await.unwrap();

        assert_eq!(report.created.len(), SCHEMA.len());
        assert_eq!(report.verified.len(), SCHEMA.len());
        assert!(connector.index_names().contains(&VECTOR_INDEX.to_string()));
        assert!(connector.index_names().contains(&FULLTEXT_INDEX.to_string()));
        assert_eq!(connector.constraint_names().len(), 6);
    }

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let connector = Arc::new(ScriptedConnector::new());
        let schema = manager(connector.clone());

        let first = schema.ensure_schema().await.unwrap();
        let second = schema.ensure_schema().await.unwrap();

        assert!(!first.created.is_empty());
        assert!(second.created.is_empty());
        assert_eq!(first.verified, second.verified);

        let creates = connector
            .statements()
            .iter()
            .filter(|s| s.text.starts_with("CREATE"))
            .count();
        assert_eq!(creates, SCHEMA.len());
    }

    #[tokio::test]
    async fn test_wrong_vector_dimensions_refused() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.set_vector_options(384, "COSINE");
        match manager(connector).ensure_schema().await {
            Err(MemoryError::Schema(msg)) => assert!(msg.contains("384")),
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_similarity_refused() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.set_vector_options(768, "EUCLIDEAN");
        assert!(matches!(
            manager(connector).ensure_schema().await,
            Err(MemoryError::Schema(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_object_after_creation_is_error() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.ignore_create(FULLTEXT_INDEX);
        match manager(connector).ensure_schema().await {
            Err(MemoryError::Schema(msg)) => assert!(msg.contains(FULLTEXT_INDEX)),
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[tokio::test]
    #[ignore] // Requires a running Neo4j 5.x
    async fn test_live_neo4j_schema() {
        let config = crate::config::GraphConfig {
            password: std::env::var("MAINZA_NEO4J_PASSWORD").unwrap_or_default(),
            ..Default::default()
        };
        let connector = Arc::new(crate::graph::transport::HttpConnector::new(config));
        let client = Arc::new(GraphClient::with_configs(
            connector,
            PoolConfig::default(),
            BreakerConfig::default(),
            RetryConfig::default(),
        ));
        let report = SchemaManager::new(client).ensure_schema().await.unwrap();
        assert_eq!(report.verified.len(), SCHEMA.len());
    }
}

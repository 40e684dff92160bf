//! Scripted in-process stand-in for the Neo4j endpoint.
//!
//! Records every batch it receives, replays queued failures, answers
//! `SHOW INDEXES` / `SHOW CONSTRAINTS` from the `CREATE ... IF NOT EXISTS`
//! statements it has seen, and lets tests register canned results by
//! statement substring.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use super::statement::{QueryResult, Statement};
use super::transport::{AccessMode, GraphConnection, GraphConnector, TransportError};

type Responder = Box<dyn Fn(&Statement) -> QueryResult + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Executed {
    pub mode: AccessMode,
    pub statements: Vec<Statement>,
}

struct ScriptState {
    connects: usize,
    executed: Vec<Executed>,
    failures: VecDeque<TransportError>,
    connect_failures: VecDeque<TransportError>,
    latency: Duration,
    responders: Vec<(String, Responder)>,
    /// name -> type ("RANGE", "VECTOR", "FULLTEXT")
    indexes: BTreeMap<String, String>,
    constraints: Vec<String>,
    vector_dimensions: i64,
    vector_similarity: String,
    /// Index names silently ignored by CREATE (simulates a broken server)
    ignored: Vec<String>,
}

pub struct ScriptedConnector {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                connects: 0,
                executed: Vec::new(),
                failures: VecDeque::new(),
                connect_failures: VecDeque::new(),
                latency: Duration::ZERO,
                responders: Vec::new(),
                indexes: BTreeMap::new(),
                constraints: Vec::new(),
                vector_dimensions: 768,
                vector_similarity: "COSINE".to_string(),
                ignored: Vec::new(),
            })),
        }
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.state.lock().executed.clone()
    }

    /// Every statement text seen so far, in order
    pub fn statements(&self) -> Vec<Statement> {
        self.state
            .lock()
            .executed
            .iter()
            .flat_map(|e| e.statements.clone())
            .collect()
    }

    pub fn fail_next(&self, error: TransportError) {
        self.state.lock().failures.push_back(error);
    }

    pub fn fail_times(&self, n: usize, error: TransportError) {
        let mut state = self.state.lock();
        for _ in 0..n {
            state.failures.push_back(error.clone());
        }
    }

    pub fn fail_connect(&self, error: TransportError) {
        self.state.lock().connect_failures.push_back(error);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn set_vector_options(&self, dimensions: i64, similarity: &str) {
        let mut state = self.state.lock();
        state.vector_dimensions = dimensions;
        state.vector_similarity = similarity.to_string();
    }

    pub fn ignore_create(&self, name: &str) {
        self.state.lock().ignored.push(name.to_string());
    }

    pub fn index_names(&self) -> Vec<String> {
        self.state.lock().indexes.keys().cloned().collect()
    }

    pub fn constraint_names(&self) -> Vec<String> {
        self.state.lock().constraints.clone()
    }

    /// Answer statements containing `needle` with `respond`
    pub fn respond<F>(&self, needle: &str, respond: F)
    where
        F: Fn(&Statement) -> QueryResult + Send + Sync + 'static,
    {
        self.state
            .lock()
            .responders
            .push((needle.to_string(), Box::new(respond)));
    }
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphConnector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn GraphConnection>, TransportError> {
        let mut state = self.state.lock();
        if let Some(err) = state.connect_failures.pop_front() {
            return Err(err);
        }
        state.connects += 1;
        Ok(Box::new(ScriptedConnection {
            state: self.state.clone(),
        }))
    }

    fn endpoint(&self) -> String {
        "scripted://graph".to_string()
    }
}

struct ScriptedConnection {
    state: Arc<Mutex<ScriptState>>,
}

#[async_trait]
impl GraphConnection for ScriptedConnection {
    async fn run(
        &mut self,
        mode: AccessMode,
        statements: &[Statement],
    ) -> Result<Vec<QueryResult>, TransportError> {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        state.executed.push(Executed {
            mode,
            statements: statements.to_vec(),
        });

        Ok(statements.iter().map(|s| answer(&mut state, s)).collect())
    }
}

fn answer(state: &mut ScriptState, stmt: &Statement) -> QueryResult {
    if let Some((_, responder)) = state
        .responders
        .iter()
        .find(|(needle, _)| stmt.text.contains(needle.as_str()))
    {
        return responder(stmt);
    }

    let text = stmt.text.trim();
    if text.starts_with("CREATE CONSTRAINT") {
        if let Some(name) = object_name(text, "CONSTRAINT") {
            if !state.ignored.contains(&name) && !state.constraints.contains(&name) {
                state.constraints.push(name);
            }
        }
        return QueryResult::default();
    }
    if text.starts_with("CREATE") && text.contains(" INDEX ") {
        if let Some(name) = object_name(text, "INDEX") {
            if !state.ignored.contains(&name) {
                let kind = if text.starts_with("CREATE VECTOR") {
                    "VECTOR"
                } else if text.starts_with("CREATE FULLTEXT") {
                    "FULLTEXT"
                } else {
                    "RANGE"
                };
                state.indexes.entry(name).or_insert_with(|| kind.to_string());
            }
        }
        return QueryResult::default();
    }
    if text.starts_with("SHOW INDEXES") {
        let rows = state
            .indexes
            .iter()
            .map(|(name, kind)| {
                let options = if kind == "VECTOR" {
                    json!({"indexConfig": {
                        "vector.dimensions": state.vector_dimensions,
                        "vector.similarity_function": state.vector_similarity,
                    }})
                } else {
                    json!({"indexConfig": {}})
                };
                vec![json!(name), json!(kind), options]
            })
            .collect();
        return QueryResult::from_rows(&["name", "type", "options"], rows);
    }
    if text.starts_with("SHOW CONSTRAINTS") {
        let rows = state
            .constraints
            .iter()
            .map(|name| vec![Value::String(name.clone())])
            .collect();
        return QueryResult::from_rows(&["name"], rows);
    }
    QueryResult::default()
}

fn object_name(text: &str, keyword: &str) -> Option<String> {
    let mut tokens = text.split_whitespace();
    tokens.by_ref().find(|t| *t == keyword)?;
    tokens.next().map(str::to_string)
}

//! ============================================================================
//! Graph Transport - Neo4j HTTP transactional endpoint
//! ============================================================================
//! Every statement batch is sent to `POST {uri}/db/{database}/tx/commit`,
//! which runs the whole batch as one server-side transaction. Failures are
//! classified here (transient / rate limited / permanent) so the retry and
//! breaker layers never look at HTTP or Neo4j details.
//! ============================================================================

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use super::statement::{QueryResult, Row, Statement};
use crate::config::GraphConfig;
use crate::error::MemoryError;

/// Routing hint sent with each batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    fn header_value(&self) -> &'static str {
        match self {
            AccessMode::Read => "READ",
            AccessMode::Write => "WRITE",
        }
    }
}

/// Error classification for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Error is likely transient, should retry
    Transient,
    /// Server asked us to slow down, back off more aggressively
    RateLimited,
    /// Error is permanent, don't retry
    Permanent,
}

/// Failure reported by a graph connection
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    pub kind: FailureKind,
    pub code: String,
    pub message: String,
}

impl TransportError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind != FailureKind::Permanent
    }
}

impl From<TransportError> for MemoryError {
    fn from(err: TransportError) -> Self {
        match err.kind {
            FailureKind::Permanent => MemoryError::Query {
                code: err.code,
                message: err.message,
            },
            FailureKind::Transient | FailureKind::RateLimited => {
                MemoryError::Connection(format!("{}: {}", err.code, err.message))
            }
        }
    }
}

/// Classify a Neo4j status code such as `Neo.TransientError.Transaction.DeadlockDetected`
pub fn classify_neo4j_code(code: &str) -> FailureKind {
    if code.starts_with("Neo.TransientError.") || code.starts_with("Neo.DatabaseError.") {
        return FailureKind::Transient;
    }
    if code == "Neo.ClientError.Security.AuthenticationRateLimit" {
        return FailureKind::RateLimited;
    }
    FailureKind::Permanent
}

/// Classify an HTTP status returned instead of a result document
pub fn classify_status(status: StatusCode) -> FailureKind {
    if status == StatusCode::TOO_MANY_REQUESTS {
        FailureKind::RateLimited
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
    {
        FailureKind::Transient
    } else {
        FailureKind::Permanent
    }
}

/// A single live connection to the graph server
#[async_trait]
pub trait GraphConnection: Send {
    /// Run `statements` as one transaction, returning one result per statement
    async fn run(
        &mut self,
        mode: AccessMode,
        statements: &[Statement],
    ) -> Result<Vec<QueryResult>, TransportError>;
}

/// Factory for new connections, owned by the pool
#[async_trait]
pub trait GraphConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn GraphConnection>, TransportError>;

    /// Human-readable endpoint for logs and health reports
    fn endpoint(&self) -> String;
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Serialize)]
struct CommitRequest<'a> {
    statements: Vec<WireStatement<'a>>,
}

#[derive(Debug, Serialize)]
struct WireStatement<'a> {
    statement: &'a str,
    parameters: &'a Map<String, Value>,
    #[serde(rename = "resultDataContents")]
    result_data_contents: [&'static str; 1],
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    #[serde(default)]
    results: Vec<WireResult>,
    #[serde(default)]
    errors: Vec<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireResult {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    data: Vec<WireRow>,
}

#[derive(Debug, Deserialize)]
struct WireRow {
    #[serde(default)]
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    code: String,
    message: String,
}

fn build_request(statements: &[Statement]) -> CommitRequest<'_> {
    CommitRequest {
        statements: statements
            .iter()
            .map(|s| WireStatement {
                statement: &s.text,
                parameters: &s.params,
                result_data_contents: ["row"],
            })
            .collect(),
    }
}

fn parse_response(body: &str) -> Result<Vec<QueryResult>, TransportError> {
    let response: CommitResponse = serde_json::from_str(body).map_err(|e| {
        TransportError::permanent("Mainza.Protocol", format!("Malformed graph response: {}", e))
    })?;

    if let Some(error) = response.errors.into_iter().next() {
        return Err(TransportError {
            kind: classify_neo4j_code(&error.code),
            code: error.code,
            message: error.message,
        });
    }

    Ok(response
        .results
        .into_iter()
        .map(|result| {
            let columns = Arc::new(result.columns);
            QueryResult {
                columns: columns.as_ref().clone(),
                rows: result
                    .data
                    .into_iter()
                    .map(|r| Row::new(columns.clone(), r.row))
                    .collect(),
            }
        })
        .collect())
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// Connector for the Neo4j HTTP API
pub struct HttpConnector {
    config: GraphConfig,
    commit_url: String,
}

impl HttpConnector {
    /// Create a new connector for the configured server and database
    pub fn new(config: GraphConfig) -> Self {
        let commit_url = format!(
            "{}/db/{}/tx/commit",
            config.uri.trim_end_matches('/'),
            config.database
        );
        Self { config, commit_url }
    }

    pub fn commit_url(&self) -> &str {
        &self.commit_url
    }
}

#[async_trait]
impl GraphConnector for HttpConnector {
    async fn connect(&self) -> Result<Box<dyn GraphConnection>, TransportError> {
        // One keep-alive socket per pooled connection
        let client = Client::builder()
            .pool_max_idle_per_host(1)
            .timeout(self.config.request_timeout)
            .build()
            .map_err(|e| TransportError::permanent("Mainza.Client", e.to_string()))?;

        debug!("Opened graph connection to {}", self.commit_url);

        Ok(Box::new(HttpConnection {
            client,
            commit_url: self.commit_url.clone(),
            user: self.config.user.clone(),
            password: self.config.password.clone(),
        }))
    }

    fn endpoint(&self) -> String {
        self.commit_url.clone()
    }
}

struct HttpConnection {
    client: Client,
    commit_url: String,
    user: String,
    password: String,
}

#[async_trait]
impl GraphConnection for HttpConnection {
    async fn run(
        &mut self,
        mode: AccessMode,
        statements: &[Statement],
    ) -> Result<Vec<QueryResult>, TransportError> {
        let response = self
            .client
            .post(&self.commit_url)
            .basic_auth(&self.user, Some(&self.password))
            .header("access-mode", mode.header_value())
            .json(&build_request(statements))
            .send()
            .await
            .map_err(|e| {
                let code = if e.is_timeout() {
                    "Mainza.Timeout"
                } else if e.is_connect() {
                    "Mainza.Connect"
                } else {
                    "Mainza.Request"
                };
                TransportError::transient(code, e.to_string())
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::transient("Mainza.Body", e.to_string()))?;

        if !status.is_success() {
            // Neo4j sometimes puts a structured error in a non-2xx body
            if let Ok(parsed) = serde_json::from_str::<CommitResponse>(&body) {
                if let Some(error) = parsed.errors.into_iter().next() {
                    let kind = match classify_status(status) {
                        FailureKind::Permanent => classify_neo4j_code(&error.code),
                        other => other,
                    };
                    return Err(TransportError {
                        kind,
                        code: error.code,
                        message: error.message,
                    });
                }
            }
            return Err(TransportError {
                kind: classify_status(status),
                code: format!("Http.{}", status.as_u16()),
                message: body,
            });
        }

        parse_response(&body)
    }
}

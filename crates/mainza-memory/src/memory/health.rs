//! Component health for the memory subsystem.
//!
//! `store` pings the backend (and reads its circuit breaker), `embedding` embeds a
//! fixed sample text. `storage` and `retrieval` are derived: both keep working
//! without embeddings, so a failed embedding service only degrades them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use super::embeddings::{check_dimensions, EmbeddingProvider};
use crate::backend::MemoryBackend;
use crate::graph::CircuitState;

const SAMPLE_TEXT: &str = "health check";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn new(status: HealthStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            latency_ms: None,
        }
    }

    fn timed(mut self, started: Instant) -> Self {
        self.latency_ms = Some(started.elapsed().as_millis() as u64);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthComponents {
    pub storage: ComponentHealth,
    pub retrieval: ComponentHealth,
    pub store: ComponentHealth,
    pub embedding: ComponentHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub components: HealthComponents,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.overall_status == HealthStatus::Healthy
    }
}

async fn check_store(backend: &dyn MemoryBackend) -> ComponentHealth {
    let started = Instant::now();
    if let Some(CircuitState::Open) = backend.circuit_state() {
        return ComponentHealth::new(HealthStatus::Unhealthy, "circuit breaker open");
    }

    match backend.ping().await {
        Ok(()) => match backend.circuit_state() {
            Some(CircuitState::HalfOpen) => {
                ComponentHealth::new(HealthStatus::Degraded, "circuit breaker half-open")
            }
            _ => ComponentHealth::new(HealthStatus::Healthy, format!("{} backend reachable", backend.kind())),
        }
        .timed(started),
        Err(e) => {
            warn!("Health check: {} backend unreachable: {}", backend.kind(), e);
            ComponentHealth::new(HealthStatus::Unhealthy, e.to_string()).timed(started)
        }
    }
}

async fn check_embedding(embedder: &dyn EmbeddingProvider) -> ComponentHealth {
    let started = Instant::now();
    match embedder.embed(SAMPLE_TEXT).await.and_then(check_dimensions) {
        Ok(_) => ComponentHealth::new(HealthStatus::Healthy, embedder.name().to_string()).timed(started),
        Err(e) => {
            warn!("Health check: embedding provider {} failed: {}", embedder.name(), e);
            ComponentHealth::new(HealthStatus::Degraded, e.to_string()).timed(started)
        }
    }
}

/// Status of a service that needs the store and can fall back without embeddings
fn derived(store: &ComponentHealth, embedding: &ComponentHealth, fallback: &str) -> ComponentHealth {
    match (store.status, embedding.status) {
        (HealthStatus::Unhealthy, _) => ComponentHealth::new(HealthStatus::Unhealthy, "store unavailable"),
        (HealthStatus::Degraded, _) => ComponentHealth::new(HealthStatus::Degraded, "store degraded"),
        (HealthStatus::Healthy, HealthStatus::Healthy) => ComponentHealth::new(HealthStatus::Healthy, "ok"),
        (HealthStatus::Healthy, _) => ComponentHealth::new(HealthStatus::Degraded, fallback),
    }
}

/// Check the store and embedding provider and derive the rest
pub async fn check(
    backend: &Arc<dyn MemoryBackend>,
    embedder: &Arc<dyn EmbeddingProvider>,
    now: DateTime<Utc>,
) -> HealthReport {
    let (store, embedding) = tokio::join!(
        check_store(backend.as_ref()),
        check_embedding(embedder.as_ref())
    );
    let storage = derived(&store, &embedding, "storing without embeddings");
    let retrieval = derived(&store, &embedding, "keyword-only retrieval");

    let overall_status = [&storage, &retrieval, &store, &embedding]
        .iter()
        .map(|c| c.status)
        .max()
        .unwrap_or(HealthStatus::Healthy);

    HealthReport {
        overall_status,
        components: HealthComponents {
            storage,
            retrieval,
            store,
            embedding,
        },
        checked_at: now,
    }
}

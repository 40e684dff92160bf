//! ============================================================================
//! Memory Manager - Orchestrates storage, retrieval and lifecycle
//! ============================================================================
//! High-level API for storing, searching and maintaining consciousness-aware
//! memories. Every service shares one backend, one embedding provider and
//! one clock.
//! ============================================================================

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::access::AccessRecorder;
use super::context::build_context;
use super::embeddings::{create_embedding_provider, EmbeddingProvider};
use super::health::{self, HealthReport};
use super::lifecycle::{LifecycleManager, LifecycleReport};
use super::retrieval::RetrievalService;
use super::storage::StorageService;
use super::types::{
    normalize_user_id, MemoryRecord, MemoryStats, RetrievedMemory, SearchRequest, StoreRequest,
};
use crate::backend::{EmbeddedBackend, GraphBackend, MemoryBackend};
use crate::clock::{Clock, SystemClock};
use crate::config::{BackendKind, MemoryConfig};
use crate::error::{MemoryError, Result};
use crate::graph::GraphClient;

/// Memory manager combining the backend, embeddings and services
pub struct MemoryManager {
    config: MemoryConfig,
    backend: Arc<dyn MemoryBackend>,
    embedder: Arc<dyn EmbeddingProvider>,
    clock: Arc<dyn Clock>,
    storage: StorageService,
    retrieval: RetrievalService,
    access: Arc<AccessRecorder>,
    lifecycle: Arc<LifecycleManager>,
    graph: Option<Arc<GraphClient>>,
}

impl MemoryManager {
    /// Validate config, open the configured backend and set up its schema
    pub async fn connect(config: MemoryConfig) -> Result<Self> {
        config.validate()?;
        let embedder = create_embedding_provider(&config.embedding)?;

        let (backend, graph): (Arc<dyn MemoryBackend>, Option<Arc<GraphClient>>) =
            match config.backend {
                BackendKind::Graph => {
                    let backend = GraphBackend::from_config(&config);
                    let client = backend.client().clone();
                    (Arc::new(backend), Some(client))
                }
                BackendKind::Embedded => {
                    let backend = match &config.embedded_path {
                        Some(path) => {
                            if let Some(parent) = path.parent() {
                                std::fs::create_dir_all(parent).map_err(|e| {
                                    MemoryError::Config(format!(
                                        "Failed to create {}: {}",
                                        parent.display(),
                                        e
                                    ))
                                })?;
                            }
                            info!("Using embedded backend at {}", path.display());
                            EmbeddedBackend::open(path)?
                        }
                        None => {
                            info!("Using in-memory embedded backend");
                            EmbeddedBackend::in_memory()?
                        }
                    };
                    (Arc::new(backend), None)
                }
            };

        let report = backend.ensure_schema().await?;
        debug!(
            "Schema ready: {} created, {} verified",
            report.created.len(),
            report.verified.len()
        );

        let mut manager = Self::from_parts(config, backend, embedder, Arc::new(SystemClock));
        manager.graph = graph;
        info!("Memory manager ready ({} backend)", manager.backend.kind());
        Ok(manager)
    }

    /// Assemble a manager from already-built parts. Must run inside a Tokio
    /// runtime: the access write-back worker is spawned here.
    pub fn from_parts(
        config: MemoryConfig,
        backend: Arc<dyn MemoryBackend>,
        embedder: Arc<dyn EmbeddingProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let access = Arc::new(AccessRecorder::spawn(
            backend.clone(),
            config.retrieval.access_queue_capacity,
        ));
        let storage = StorageService::new(backend.clone(), embedder.clone(), clock.clone());
        let retrieval = RetrievalService::new(
            backend.clone(),
            embedder.clone(),
            clock.clone(),
            config.retrieval.clone(),
        )
        .with_access_recorder(access.clone());
        let lifecycle = Arc::new(LifecycleManager::new(
            backend.clone(),
            clock.clone(),
            config.lifecycle.clone(),
        ));

        Self {
            config,
            backend,
            embedder,
            clock,
            storage,
            retrieval,
            access,
            lifecycle,
            graph: None,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn MemoryBackend> {
        &self.backend
    }

    /// Store a memory; returns its id
    pub async fn store(&self, request: StoreRequest) -> Result<String> {
        self.storage.store(request).await
    }

    /// Ranked memories for a query
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<MemoryRecord>> {
        self.retrieval.search(request).await
    }

    /// Ranked memories with their scores and match sources
    pub async fn search_scored(&self, request: &SearchRequest) -> Result<Vec<RetrievedMemory>> {
        self.retrieval.search_scored(request).await
    }

    /// Search and render the top memories into a bounded prompt block
    pub async fn build_context(
        &self,
        query: &str,
        user_id: &str,
        max_length: usize,
    ) -> Result<String> {
        let request = SearchRequest::new(user_id, query, self.config.context.max_memories);
        let memories = self.retrieval.search(&request).await?;
        let context = build_context(&memories, max_length);
        debug!(
            "Built context of {} chars from {} memories for user {}",
            context.chars().count(),
            memories.len(),
            user_id
        );
        Ok(context)
    }

    pub async fn health_check(&self) -> HealthReport {
        health::check(&self.backend, &self.embedder, self.clock.now()).await
    }

    /// Look up a hot or archived memory
    pub async fn get(&self, memory_id: &str) -> Result<Option<MemoryRecord>> {
        self.backend.get(memory_id).await
    }

    /// Delete one memory; false when it did not exist
    pub async fn delete_memory(&self, memory_id: &str) -> Result<bool> {
        let deleted = self.backend.delete(memory_id).await?;
        if deleted {
            info!("Deleted memory {}", memory_id);
        }
        Ok(deleted)
    }

    /// Remove a user and every memory they own
    pub async fn delete_user(&self, user_id: &str) -> Result<u64> {
        let user_id = normalize_user_id(user_id);
        if user_id.is_empty() {
            return Err(MemoryError::validation("user_id", "must not be empty"));
        }
        let removed = self.backend.delete_user(user_id).await?;
        info!("Deleted user {} ({} memories)", user_id, removed);
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<MemoryStats> {
        self.backend.stats().await
    }

    /// Run one lifecycle sweep now
    pub async fn run_lifecycle(&self) -> Result<LifecycleReport> {
        self.lifecycle.run_once().await
    }

    /// Start the periodic lifecycle task
    pub fn spawn_lifecycle(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.lifecycle.clone().spawn(shutdown)
    }

    /// Wait for queued access updates to land
    pub async fn flush(&self) {
        self.access.flush().await;
    }

    /// Drain access write-back and release graph connections
    pub async fn shutdown(&self) {
        self.access.shutdown().await;
        if let Some(client) = &self.graph {
            client.close();
        }
        info!("Memory manager shut down");
    }
}

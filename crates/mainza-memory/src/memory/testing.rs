//! Fixtures shared by the service-level tests: an in-memory redb backend,
//! the offline hashing embedder and a manual clock.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

use crate::backend::{EmbeddedBackend, MemoryBackend};
use crate::clock::{Clock, ManualClock};
use crate::memory::embeddings::{EmbeddingProvider, HashingEmbedder};

pub struct Fixture {
    pub backend: Arc<EmbeddedBackend>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub clock: Arc<ManualClock>,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_embedder(Arc::new(HashingEmbedder::new())).await
    }

    pub async fn with_embedder(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        let backend = Arc::new(EmbeddedBackend::in_memory().unwrap());
        backend.ensure_schema().await.unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        Self {
            backend,
            embedder,
            clock,
        }
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn backend_dyn(&self) -> Arc<dyn MemoryBackend> {
        self.backend.clone()
    }
}

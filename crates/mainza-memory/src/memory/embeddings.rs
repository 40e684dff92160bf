//! ============================================================================
//! Embedding Service - 768-dimensional vectors for semantic search
//! ============================================================================
//! Providers:
//! - `HttpEmbeddingService`: OpenAI-compatible `/embeddings` API
//! - `HashingEmbedder`: deterministic offline hashed bag-of-words
//! `CachedEmbedder` wraps either one with a bounded content-hash cache.
//! Any vector that is not exactly 768 long is rejected.
//! ============================================================================

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::concepts::{keywords, tokenize};
use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::error::{MemoryError, Result};

/// The one embedding dimensionality used everywhere
pub const EMBEDDING_DIM: usize = 768;

/// Source of text embeddings
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed one text into exactly `EMBEDDING_DIM` floats
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn name(&self) -> &str;
}

/// Reject vectors of the wrong length or with non-finite values
pub fn check_dimensions(embedding: Vec<f32>) -> Result<Vec<f32>> {
    if embedding.len() != EMBEDDING_DIM {
        return Err(MemoryError::EmbeddingUnavailable(format!(
            "provider returned {} dimensions, expected {}",
            embedding.len(),
            EMBEDDING_DIM
        )));
    }
    if embedding.iter().any(|x| !x.is_finite()) {
        return Err(MemoryError::EmbeddingUnavailable(
            "provider returned non-finite values".into(),
        ));
    }
    Ok(embedding)
}

/// L2-normalize in place; returns false for a zero vector
pub fn normalize(vector: &mut [f32]) -> bool {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    for x in vector.iter_mut() {
        *x /= norm;
    }
    true
}

// ============================================================================
// OpenAI-compatible HTTP provider
// ============================================================================

/// Embedding service for an OpenAI-compatible API
pub struct HttpEmbeddingService {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    model: String,
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingUsage {
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

impl HttpEmbeddingService {
    /// Create a service from configuration; needs an API key
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| MemoryError::Config("embedding API key not set".into()))?;
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| MemoryError::Config(format!("embedding client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Generate embeddings for several texts, in input order
    pub async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts.to_vec(),
            dimensions: EMBEDDING_DIM,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                MemoryError::EmbeddingUnavailable(format!("Failed to send embedding request: {}", e))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            MemoryError::EmbeddingUnavailable(format!("Failed to read response body: {}", e))
        })?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ErrorResponse>(&body) {
                return Err(MemoryError::EmbeddingUnavailable(format!(
                    "Embedding API error ({}): {}",
                    status, error.error.message
                )));
            }
            return Err(MemoryError::EmbeddingUnavailable(format!(
                "Embedding API error ({}): {}",
                status, body
            )));
        }

        let parsed: EmbeddingResponse = serde_json::from_str(&body).map_err(|e| {
            MemoryError::EmbeddingUnavailable(format!("Failed to parse embedding response: {}", e))
        })?;

        if let Some(usage) = &parsed.usage {
            debug!(
                "Embedding tokens used: {} (model: {})",
                usage.total_tokens, parsed.model
            );
        }

        let mut embeddings: Vec<(usize, Vec<f32>)> = parsed
            .data
            .into_iter()
            .map(|d| (d.index, d.embedding))
            .collect();
        embeddings.sort_by_key(|(idx, _)| *idx);

        if embeddings.len() != texts.len() {
            return Err(MemoryError::EmbeddingUnavailable(format!(
                "requested {} embeddings, received {}",
                texts.len(),
                embeddings.len()
            )));
        }

        embeddings
            .into_iter()
            .map(|(_, e)| check_dimensions(e))
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MemoryError::EmbeddingUnavailable("No embedding returned".into()))
    }

    fn name(&self) -> &str {
        "http"
    }
}

// ============================================================================
// Offline hashing provider
// ============================================================================

/// Signed feature hashing of keyword tokens into 768 buckets
#[derive(Debug, Default, Clone, Copy)]
pub struct HashingEmbedder;

impl HashingEmbedder {
    pub fn new() -> Self {
        Self
    }

    pub fn embed_sync(&self, text: &str) -> Result<Vec<f32>> {
        let mut tokens = keywords(text);
        if tokens.is_empty() {
            tokens = tokenize(text).collect();
        }
        if tokens.is_empty() {
            return Err(MemoryError::EmbeddingUnavailable(
                "no tokens to embed".into(),
            ));
        }

        let mut vector = vec![0.0f32; EMBEDDING_DIM];
        for token in &tokens {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % EMBEDDING_DIM as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        if !normalize(&mut vector) {
            return Err(MemoryError::EmbeddingUnavailable(
                "hashed features cancelled out".into(),
            ));
        }
        Ok(vector)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_sync(text)
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

// ============================================================================
// Cache
// ============================================================================

struct CacheEntry {
    embedding: Vec<f32>,
    inserted: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Bounded cache keyed by SHA-256 of the content
pub struct CachedEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    capacity: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
    sequence: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn content_key(text: &str) -> String {
        hex::encode(Sha256::digest(text.as_bytes()))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }

    fn insert(&self, key: String, embedding: Vec<f32>) {
        let mut entries = self.entries.lock();
        // Evict oldest entry if cache is at capacity
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            if let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, v)| v.inserted)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest_key);
            }
        }
        let inserted = self.sequence.fetch_add(1, Ordering::Relaxed);
        entries.insert(key, CacheEntry { embedding, inserted });
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = Self::content_key(text);
        let cached = self.entries.lock().get(&key).map(|e| e.embedding.clone());
        if let Some(embedding) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(embedding);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // Failures are not cached
        let embedding = check_dimensions(self.inner.embed(text).await?)?;
        self.insert(key, embedding.clone());
        Ok(embedding)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Build the configured provider, wrapped in the cache
pub fn create_embedding_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let inner: Arc<dyn EmbeddingProvider> = match config.provider {
        EmbeddingProviderKind::Http => {
            debug!("Using {} for embeddings", config.base_url);
            Arc::new(HttpEmbeddingService::new(config)?)
        }
        EmbeddingProviderKind::Hashing => {
            debug!("Using offline hashing embedder");
            Arc::new(HashingEmbedder::new())
        }
    };
    Ok(Arc::new(CachedEmbedder::new(inner, config.cache_capacity)))
}

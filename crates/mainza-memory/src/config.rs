//! ============================================================================
//! Memory Configuration - Defaults plus MAINZA_* environment overrides
//! ============================================================================
//! Every tunable of the memory subsystem lives here. `MemoryConfig::from_env`
//! starts from `Default` and applies any `MAINZA_*` variable that is set.
//! Unparseable values are a `Config` error rather than silently ignored.
//! ============================================================================

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// Which persistence backend the manager talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Neo4j over the HTTP transactional endpoint
    Graph,
    /// Local redb database
    Embedded,
}

impl FromStr for BackendKind {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "graph" | "neo4j" => Ok(BackendKind::Graph),
            "embedded" | "redb" | "local" => Ok(BackendKind::Embedded),
            other => Err(MemoryError::Config(format!("unknown backend '{}'", other))),
        }
    }
}

/// Graph server endpoint
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// HTTP base URI of the Neo4j server
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Per-request timeout applied to every statement batch
    pub request_timeout: Duration,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: "http://localhost:7474".to_string(),
            user: "neo4j".to_string(),
            password: String::new(),
            database: "neo4j".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Bounded connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    /// Connections older than this are discarded instead of reused
    pub max_lifetime: Duration,
    pub acquire_timeout: Duration,
    /// Permits kept free for foreground traffic
    pub background_reserve: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            max_lifetime: Duration::from_secs(3600),
            acquire_timeout: Duration::from_secs(5),
            background_reserve: 2,
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// Failures older than this no longer count toward the threshold
    pub failure_window: Duration,
    /// Cooldown before half-open trial calls are allowed
    pub open_duration: Duration,
    /// Trial calls admitted per half-open window
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            failure_window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

/// Retry behavior for transient graph failures
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Base delay between retries (will be multiplied by 2^attempt)
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
            jitter: true,
        }
    }
}

/// Embedding provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProviderKind {
    /// OpenAI-compatible `/embeddings` endpoint
    Http,
    /// Deterministic offline hashing embedder
    Hashing,
}

impl FromStr for EmbeddingProviderKind {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "http" | "openai" | "api" => Ok(EmbeddingProviderKind::Http),
            "hashing" | "hash" | "offline" => Ok(EmbeddingProviderKind::Hashing),
            other => Err(MemoryError::Config(format!(
                "unknown embedding provider '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Distinct contents kept in the embedding cache
    pub cache_capacity: usize,
    pub request_timeout: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Hashing,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "text-embedding-3-small".to_string(),
            cache_capacity: 1000,
            request_timeout: Duration::from_secs(20),
        }
    }
}

/// Ranking and candidate generation
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub relevance_weight: f32,
    pub importance_weight: f32,
    pub consciousness_weight: f32,
    /// Age at which retrieval-time decay halves importance
    pub decay_half_life_hours: f64,
    /// Vector hits below this cosine similarity are dropped
    pub similarity_threshold: f32,
    /// Candidates fetched per source, as a multiple of the requested limit
    pub candidate_multiplier: usize,
    pub expansion_depth: u8,
    /// Top candidates used as seeds for concept expansion
    pub expansion_seeds: usize,
    pub default_limit: usize,
    /// Capacity of the access write-back queue
    pub access_queue_capacity: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            relevance_weight: 0.6,
            importance_weight: 0.3,
            consciousness_weight: 0.1,
            decay_half_life_hours: 168.0,
            similarity_threshold: 0.3,
            candidate_multiplier: 3,
            expansion_depth: 1,
            expansion_seeds: 3,
            default_limit: 10,
            access_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub interval: Duration,
    pub batch_size: usize,
    pub decay_half_life_hours: f64,
    pub stale_threshold: f32,
    pub archive_after_days: i64,
    pub delete_after_days: i64,
    /// New accesses since the last sweep needed to resist decay
    pub min_access_delta: u64,
    pub consolidation_enabled: bool,
    pub consolidation_similarity: f32,
    pub consolidation_min_cluster: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            batch_size: 100,
            decay_half_life_hours: 720.0,
            stale_threshold: 0.2,
            archive_after_days: 30,
            delete_after_days: 90,
            min_access_delta: 1,
            consolidation_enabled: true,
            consolidation_similarity: 0.75,
            consolidation_min_cluster: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub max_length: usize,
    /// Memories fetched before the length budget is applied
    pub max_memories: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_length: 2000,
            max_memories: 10,
        }
    }
}

/// Top-level configuration for the memory subsystem
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub backend: BackendKind,
    /// redb file for the embedded backend; `None` keeps everything in memory
    pub embedded_path: Option<PathBuf>,
    pub graph: GraphConfig,
    pub pool: PoolConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub lifecycle: LifecycleConfig,
    pub context: ContextConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Embedded,
            embedded_path: default_embedded_path(),
            graph: GraphConfig::default(),
            pool: PoolConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            lifecycle: LifecycleConfig::default(),
            context: ContextConfig::default(),
        }
    }
}

/// ~/.mainza/memory.redb
pub fn default_embedded_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".mainza").join("memory.redb"))
}

impl MemoryConfig {
    /// Fully in-memory configuration (embedded backend, offline embedder)
    pub fn in_memory() -> Self {
        Self {
            embedded_path: None,
            ..Default::default()
        }
    }

    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(kind) = env_parse::<BackendKind>("MAINZA_BACKEND")? {
            config.backend = kind;
        }
        if let Ok(val) = env::var("MAINZA_DB_PATH") {
            config.embedded_path = if val.eq_ignore_ascii_case(":memory:") {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        // Graph server
        if let Ok(val) = env::var("MAINZA_NEO4J_URI") {
            config.graph.uri = val;
        }
        if let Ok(val) = env::var("MAINZA_NEO4J_USER") {
            config.graph.user = val;
        }
        if let Ok(val) = env::var("MAINZA_NEO4J_PASSWORD") {
            config.graph.password = val;
        }
        if let Ok(val) = env::var("MAINZA_NEO4J_DATABASE") {
            config.graph.database = val;
        }
        if let Some(secs) = env_parse::<u64>("MAINZA_NEO4J_TIMEOUT_SECS")? {
            config.graph.request_timeout = Duration::from_secs(secs);
        }

        // Pool
        if let Some(n) = env_parse("MAINZA_POOL_SIZE")? {
            config.pool.max_size = n;
        }
        if let Some(secs) = env_parse::<u64>("MAINZA_POOL_MAX_LIFETIME_SECS")? {
            config.pool.max_lifetime = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("MAINZA_POOL_ACQUIRE_TIMEOUT_MS")? {
            config.pool.acquire_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse("MAINZA_POOL_BACKGROUND_RESERVE")? {
            config.pool.background_reserve = n;
        }

        // Breaker / retry
        if let Some(n) = env_parse("MAINZA_BREAKER_FAILURE_THRESHOLD")? {
            config.breaker.failure_threshold = n;
        }
        if let Some(n) = env_parse("MAINZA_BREAKER_SUCCESS_THRESHOLD")? {
            config.breaker.success_threshold = n;
        }
        if let Some(secs) = env_parse::<u64>("MAINZA_BREAKER_OPEN_SECS")? {
            config.breaker.open_duration = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse("MAINZA_BREAKER_HALF_OPEN_CALLS")? {
            config.breaker.half_open_max_calls = n;
        }
        if let Some(n) = env_parse("MAINZA_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }

        // Embeddings
        if let Some(kind) = env_parse::<EmbeddingProviderKind>("MAINZA_EMBEDDING_PROVIDER")? {
            config.embedding.provider = kind;
        }
        if let Ok(val) = env::var("MAINZA_EMBEDDING_URL") {
            config.embedding.base_url = val;
        }
        if let Ok(val) = env::var("MAINZA_EMBEDDING_MODEL") {
            config.embedding.model = val;
        }
        config.embedding.api_key = env::var("MAINZA_EMBEDDING_API_KEY")
            .or_else(|_| env::var("OPENAI_API_KEY"))
            .ok()
            .filter(|k| !k.is_empty());
        if let Some(n) = env_parse("MAINZA_EMBEDDING_CACHE")? {
            config.embedding.cache_capacity = n;
        }

        // Retrieval
        if let Some(h) = env_parse("MAINZA_RETRIEVAL_HALF_LIFE_HOURS")? {
            config.retrieval.decay_half_life_hours = h;
        }
        if let Some(t) = env_parse("MAINZA_SIMILARITY_THRESHOLD")? {
            config.retrieval.similarity_threshold = t;
        }
        if let Some(d) = env_parse("MAINZA_EXPANSION_DEPTH")? {
            config.retrieval.expansion_depth = d;
        }

        // Lifecycle
        if let Some(secs) = env_parse::<u64>("MAINZA_LIFECYCLE_INTERVAL_SECS")? {
            config.lifecycle.interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse("MAINZA_LIFECYCLE_BATCH_SIZE")? {
            config.lifecycle.batch_size = n;
        }
        if let Some(h) = env_parse("MAINZA_DECAY_HALF_LIFE_HOURS")? {
            config.lifecycle.decay_half_life_hours = h;
        }
        if let Some(t) = env_parse("MAINZA_STALE_THRESHOLD")? {
            config.lifecycle.stale_threshold = t;
        }
        if let Some(d) = env_parse("MAINZA_ARCHIVE_AFTER_DAYS")? {
            config.lifecycle.archive_after_days = d;
        }
        if let Some(d) = env_parse("MAINZA_DELETE_AFTER_DAYS")? {
            config.lifecycle.delete_after_days = d;
        }
        if let Some(b) = env_parse("MAINZA_CONSOLIDATION")? {
            config.lifecycle.consolidation_enabled = b;
        }

        // Context
        if let Some(n) = env_parse("MAINZA_CONTEXT_MAX_LENGTH")? {
            config.context.max_length = n;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would make components misbehave
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_size == 0 {
            return Err(MemoryError::Config("pool size must be at least 1".into()));
        }
        if self.pool.background_reserve >= self.pool.max_size {
            return Err(MemoryError::Config(format!(
                "background reserve {} leaves no permits in a pool of {}",
                self.pool.background_reserve, self.pool.max_size
            )));
        }
        if self.breaker.failure_threshold == 0
            || self.breaker.success_threshold == 0
            || self.breaker.half_open_max_calls == 0
        {
            return Err(MemoryError::Config(
                "breaker thresholds must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(MemoryError::Config("retry attempts must be at least 1".into()));
        }
        if self.retrieval.decay_half_life_hours <= 0.0
            || self.lifecycle.decay_half_life_hours <= 0.0
        {
            return Err(MemoryError::Config("decay half-life must be positive".into()));
        }
        if self.retrieval.expansion_depth > 2 {
            return Err(MemoryError::Config(format!(
                "expansion depth {} exceeds 2",
                self.retrieval.expansion_depth
            )));
        }
        let weights = [
            self.retrieval.relevance_weight,
            self.retrieval.importance_weight,
            self.retrieval.consciousness_weight,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(MemoryError::Config("ranking weights must be non-negative".into()));
        }
        if !(0.0..=1.0).contains(&self.lifecycle.stale_threshold) {
            return Err(MemoryError::Config("stale threshold must be in [0, 1]".into()));
        }
        if self.lifecycle.delete_after_days <= self.lifecycle.archive_after_days {
            return Err(MemoryError::Config(
                "delete_after_days must exceed archive_after_days".into(),
            ));
        }
        if self.lifecycle.batch_size == 0 {
            return Err(MemoryError::Config("lifecycle batch size must be at least 1".into()));
        }
        if self.backend == BackendKind::Graph {
            url::Url::parse(&self.graph.uri).map_err(|e| {
                MemoryError::Config(format!("invalid graph uri '{}': {}", self.graph.uri, e))
            })?;
        }
        if self.embedding.provider == EmbeddingProviderKind::Http && self.embedding.api_key.is_none() {
            return Err(MemoryError::Config(
                "http embedding provider needs MAINZA_EMBEDDING_API_KEY".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| MemoryError::Config(format!("{}='{}': {}", key, val, e))),
        Err(_) => Ok(None),
    }
}

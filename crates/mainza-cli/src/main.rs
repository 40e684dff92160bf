// ============================================================================
// mainza-mem - CLI for the Mainza memory subsystem
// ============================================================================
// Usage:
//   mainza-mem schema                                 Create or verify storage
//   mainza-mem store --user U "content" [--type T]    Store a memory
//   mainza-mem search --user U "query" [--limit N]    Ranked search
//   mainza-mem context --user U "query"               Render a context block
//   mainza-mem health                                 Component health
//   mainza-mem stats                                  Store statistics
//   mainza-mem delete --memory ID | --user U          Remove data
//   mainza-mem lifecycle [--watch]                    Run decay/archival
// ============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use mainza_memory::{
    BackendKind, ConsciousnessContext, EmotionalState, MemoryConfig, MemoryManager, MemoryRecord,
    MemoryType, SearchRequest, StoreRequest,
};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, warn};

/// Mainza memory subsystem tool
#[derive(Parser)]
#[command(name = "mainza-mem", version, about = "Store, search and maintain Mainza agent memories")]
struct Cli {
    /// Path to the embedded database (":memory:" for a throwaway store)
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Backend: graph or embedded (default: MAINZA_BACKEND or embedded)
    #[arg(long, global = true)]
    backend: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or verify indexes, constraints and tables
    Schema,

    /// Store one memory and print its id
    Store {
        #[arg(long)]
        user: String,

        content: String,

        /// interaction, reflection, insight, consolidated, concept_link
        #[arg(long = "type", default_value = "interaction")]
        memory_type: String,

        #[arg(long, default_value = "mainza")]
        agent: String,

        /// Consciousness level at storage time (0.0-1.0)
        #[arg(long, default_value = "0.7")]
        level: f32,

        /// Emotional state (curious, excited, focused, ...)
        #[arg(long, default_value = "curious")]
        emotion: String,

        /// Extra metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Search a user's memories
    Search {
        #[arg(long)]
        user: String,

        query: String,

        #[arg(long, default_value = "10")]
        limit: usize,

        /// Comma-separated memory types to keep
        #[arg(long)]
        types: Option<String>,

        /// Current consciousness level used for alignment
        #[arg(long, default_value = "0.7")]
        level: f32,

        /// Skip concept-graph expansion
        #[arg(long)]
        no_expand: bool,
    },

    /// Render the context block for a query
    Context {
        #[arg(long)]
        user: String,

        query: String,

        /// Maximum block length in characters
        #[arg(long)]
        max_length: Option<usize>,
    },

    /// Report component health
    Health,

    /// Show store statistics
    Stats,

    /// Delete one memory or every memory of a user
    Delete {
        #[arg(long, conflicts_with = "user", required_unless_present = "user")]
        memory: Option<String>,

        #[arg(long)]
        user: Option<String>,
    },

    /// Run the lifecycle sweep once, or keep running it on an interval
    Lifecycle {
        /// Keep running until Ctrl-C
        #[arg(long)]
        watch: bool,
    },
}

fn load_config(cli: &Cli) -> Result<MemoryConfig> {
    let mut config = MemoryConfig::from_env().context("Failed to load configuration")?;
    if let Some(backend) = &cli.backend {
        config.backend = backend.parse::<BackendKind>()?;
    }
    if let Some(path) = &cli.db_path {
        config.embedded_path = if path.eq_ignore_ascii_case(":memory:") {
            None
        } else {
            Some(PathBuf::from(path))
        };
    }
    Ok(config)
}

fn parse_types(raw: &str) -> Result<Vec<MemoryType>> {
    raw.split(',')
        .filter(|t| !t.trim().is_empty())
        .map(|t| t.parse::<MemoryType>().map_err(anyhow::Error::from))
        .collect()
}

/// Records are printed without their embedding vectors
fn printable(mut record: MemoryRecord) -> MemoryRecord {
    record.embedding = None;
    record
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mainza_memory=info".parse()?)
                .add_directive("mainza_cli=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let manager = MemoryManager::connect(config)
        .await
        .context("Failed to start memory manager")?;

    let outcome = run(&manager, cli.command).await;
    manager.shutdown().await;
    outcome
}

async fn run(manager: &MemoryManager, command: Commands) -> Result<()> {
    match command {
        Commands::Schema => cmd_schema(manager).await,
        Commands::Store {
            user,
            content,
            memory_type,
            agent,
            level,
            emotion,
            metadata,
        } => {
            let context = ConsciousnessContext::new(level, emotion.parse::<EmotionalState>()?, 0.8);
            let mut request = StoreRequest::new(user, agent, content)
                .memory_type(memory_type.parse()?)
                .consciousness(context);
            if let Some(raw) = metadata {
                request = request.metadata(
                    serde_json::from_str(&raw).context("--metadata must be valid JSON")?,
                );
            }
            let id = manager.store(request).await?;
            println!("{}", id);
            Ok(())
        }
        Commands::Search {
            user,
            query,
            limit,
            types,
            level,
            no_expand,
        } => {
            let mut request = SearchRequest::new(user, query, limit)
                .consciousness(ConsciousnessContext::new(level, EmotionalState::Curious, 0.8));
            if let Some(raw) = types {
                request = request.memory_types(parse_types(&raw)?);
            }
            if no_expand {
                request = request.without_expansion();
            }
            cmd_search(manager, &request).await
        }
        Commands::Context {
            user,
            query,
            max_length,
        } => {
            let max_length = max_length.unwrap_or(manager.config().context.max_length);
            let block = manager.build_context(&query, &user, max_length).await?;
            println!("{}", block);
            Ok(())
        }
        Commands::Health => {
            let report = manager.health_check().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_healthy() {
                warn!("Memory subsystem is {}", report.overall_status);
            }
            Ok(())
        }
        Commands::Stats => {
            let stats = manager.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Commands::Delete { memory, user } => cmd_delete(manager, memory, user).await,
        Commands::Lifecycle { watch } => cmd_lifecycle(manager, watch).await,
    }
}

async fn cmd_schema(manager: &MemoryManager) -> Result<()> {
    let report = manager.backend().ensure_schema().await?;
    println!("=== Mainza Memory Schema ({}) ===", manager.backend().kind());
    for name in &report.created {
        println!("  created   {}", name);
    }
    for name in &report.verified {
        println!("  verified  {}", name);
    }
    Ok(())
}

async fn cmd_search(manager: &MemoryManager, request: &SearchRequest) -> Result<()> {
    let results = manager.search_scored(request).await?;
    let rows: Vec<serde_json::Value> = results
        .into_iter()
        .map(|hit| {
            serde_json::json!({
                "score": hit.score,
                "relevance": hit.relevance,
                "source": hit.source,
                "memory": printable(hit.record),
            })
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "searched_at": Utc::now().to_rfc3339(),
            "count": rows.len(),
            "results": rows,
        }))?
    );
    Ok(())
}

async fn cmd_delete(
    manager: &MemoryManager,
    memory: Option<String>,
    user: Option<String>,
) -> Result<()> {
    match (memory, user) {
        (Some(id), _) => {
            if manager.delete_memory(&id).await? {
                println!("Deleted memory {}", id);
            } else {
                anyhow::bail!("Memory {} not found", id);
            }
        }
        (None, Some(user)) => {
            let removed = manager.delete_user(&user).await?;
            println!("Deleted user {} and {} memories", user, removed);
        }
        (None, None) => anyhow::bail!("Pass --memory or --user"),
    }
    Ok(())
}

async fn cmd_lifecycle(manager: &MemoryManager, watch_mode: bool) -> Result<()> {
    if !watch_mode {
        let report = manager.run_lifecycle().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = manager.spawn_lifecycle(shutdown_rx);
    info!(
        "Lifecycle running every {:?}, press Ctrl-C to stop",
        manager.config().lifecycle.interval
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Stopping lifecycle manager");
    shutdown_tx.send(true).ok();
    handle.await.context("Lifecycle task panicked")?;
    Ok(())
}

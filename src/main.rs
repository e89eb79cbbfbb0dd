//! ragnode CLI
//!
//! Command-line interface for running and querying a RAG node.

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ragnode::index::{self, MEMORY_INDEX_ADDRESS};
use ragnode::{
    ApiServer, AppState, Config, ContextStore, EmbeddingResolver, Error, HealthResponse, Metadata,
    OllamaRunner, Orchestrator, Query, Result, RocksDbStore,
};

#[derive(Parser)]
#[command(name = "ragnode")]
#[command(author, version, about = "Retrieval-augmented generation node", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "ragnode.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Process inputs that take precedence over the configuration file.
#[derive(Args)]
struct Overrides {
    /// HTTP listen port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Database directory
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// LLM runner address (host:port)
    #[arg(long, global = true)]
    runner_addr: Option<String>,

    /// Vector index address ("memory" for the in-process index)
    #[arg(long, global = true)]
    index_addr: Option<String>,

    /// Local embedding model directory
    #[arg(long, global = true)]
    model_path: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(port) = self.port {
            let host = config
                .server
                .listen_address
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            config.server.listen_address = format!("{}:{}", host, port);
        }
        if let Some(db_path) = self.db_path {
            config.store.db_path = db_path;
        }
        if let Some(runner_addr) = self.runner_addr {
            config.runner.address = runner_addr;
        }
        if let Some(index_addr) = self.index_addr {
            config.vector_index.address = Some(index_addr);
        }
        if let Some(model_path) = self.model_path {
            config.embedding.local_model_path = Some(model_path);
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "ragnode.toml")]
        output: String,
    },

    /// Start the node and its HTTP API
    Serve,

    /// Store and index a text file
    Ingest {
        /// Document id
        #[arg(long)]
        id: String,

        /// File holding the document text
        file: PathBuf,
    },

    /// Answer one question and print the streamed reply
    Ask {
        /// Question text
        text: String,

        /// Override the number of retrieved chunks
        #[arg(long)]
        top_k: Option<usize>,

        /// Override the generation limit
        #[arg(long)]
        max_tokens: Option<u32>,
    },

    /// Check node health
    Health {
        /// API endpoint to check
        #[arg(long, default_value = "http://localhost:8080")]
        endpoint: String,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(path: &str, overrides: Overrides) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        info!("Loading configuration from: {}", path);
        Config::load(path)?
    } else {
        info!("Using default configuration");
        Config::default()
    };
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

/// Wire the capabilities named in `config` into an orchestrator.
async fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let store = ContextStore::new(Arc::new(RocksDbStore::open(&config.store.db_path)?));
    let resolver = EmbeddingResolver::from_config(&config.embedding)?;
    index::check_dimension(&config.vector_index, resolver.dimension())?;
    let index = index::connect(&config.vector_index).await?;
    let runner = OllamaRunner::new(
        &config.runner.address,
        config.runner.model.clone(),
        Duration::from_secs(10),
    )?;
    info!("LLM runner at {} (model {})", runner.base_url(), config.runner.model);

    let orchestrator = Orchestrator::new(resolver, store, index, Arc::new(runner), config);

    if config.vector_index.address.as_deref() == Some(MEMORY_INDEX_ADDRESS) {
        orchestrator.reindex().await?;
    }
    Ok(orchestrator)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Init { output } => {
            info!("Writing default configuration to: {}", output);
            Config::default().save(&output)?;
            info!("Configuration saved successfully");
        }

        Commands::Serve => {
            info!("Starting ragnode...");
            let config = load_config(&cli.config, cli.overrides)?;

            let metrics = metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| Error::Config(format!("failed to install metrics recorder: {}", e)))?;

            let orchestrator = build_orchestrator(&config).await?;
            let state = AppState::new(orchestrator).with_metrics(metrics);
            let server = ApiServer::new(config.server.clone(), state);

            info!("Press Ctrl+C to stop");
            server
                .run(async {
                    if let Err(e) = signal::ctrl_c().await {
                        error!("Failed to listen for shutdown signal: {}", e);
                    }
                    info!("Received shutdown signal");
                })
                .await?;
            info!("Node stopped");
        }

        Commands::Ingest { id, file } => {
            let config = load_config(&cli.config, cli.overrides)?;
            let text = tokio::fs::read_to_string(&file).await?;
            let mut metadata = Metadata::new();
            metadata.insert("source".to_string(), file.display().to_string().into());

            let orchestrator = build_orchestrator(&config).await?;
            let document = orchestrator.ingest(&id, &text, metadata).await?;
            info!("Stored {} ({} chars)", document.id, document.text.chars().count());
        }

        Commands::Ask {
            text,
            top_k,
            max_tokens,
        } => {
            let config = load_config(&cli.config, cli.overrides)?;
            let orchestrator = build_orchestrator(&config).await?;

            let mut query = Query::new(text);
            if let Some(top_k) = top_k {
                query = query.with_top_k(top_k);
            }
            if let Some(max_tokens) = max_tokens {
                query = query.with_max_tokens(max_tokens);
            }

            let mut tokens = orchestrator.handle(query);
            let mut stdout = std::io::stdout();
            while let Some(item) = tokens.next().await {
                let chunk = item?;
                print!("{}", chunk.text);
                stdout.flush()?;
            }
            println!();
        }

        Commands::Health { endpoint } => {
            info!("Checking node health at: {}", endpoint);
            match check_health(&endpoint).await {
                Ok(response) => {
                    info!("Node status: {}", response.status);
                    info!("Version: {}", response.version);
                    info!("Retrieval enabled: {}", response.retrieval_enabled);
                    info!("Uptime: {} seconds", response.uptime);
                }
                Err(e) => {
                    error!("Health check failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

/// Fetch `/health` from a running node.
async fn check_health(endpoint: &str) -> Result<HealthResponse> {
    let url = format!("{}/health", endpoint.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| Error::Config(format!("failed to build client: {}", e)))?;

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::Io(std::io::Error::other(format!("connection failed: {}", e))))?;
    if !response.status().is_success() {
        return Err(Error::Io(std::io::Error::other(format!(
            "unexpected status {}",
            response.status()
        ))));
    }
    response
        .json()
        .await
        .map_err(|e| Error::Config(format!("invalid health response: {}", e)))
}

//! Advisory - hook-time advisory decision and delivery engine
//!
//! Runs the hook API server, or executes one engine operation against the
//! persisted state and exits.

use advisory::{
    advisory::{AdvisoryEngine, AdvisoryState, OutcomeRecord, Polarity},
    api::build_app,
    config::{spawn_config_reloader, AdvisoryConfig, ConfigHandle},
    history::StateStore,
    AdvisoryEngineBuilder, DecisionContext,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "advisory")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Hook-time advisory decision and delivery engine")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "ADVISORY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the hook API server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(long)]
        port: Option<u16>,

        /// Seconds between config file checks
        #[arg(long, default_value = "5")]
        reload_interval: u64,
    },

    /// Run one decision cycle and print the decision
    Decide {
        #[arg(short, long)]
        session: String,

        #[arg(short, long)]
        tool: String,

        /// Free-form intent description
        #[arg(short, long, default_value = "")]
        intent: String,

        /// File the tool is about to touch
        #[arg(short, long)]
        file: Option<PathBuf>,

        #[arg(short, long)]
        project: Option<String>,
    },

    /// Report the outcome of an advised action
    Outcome {
        /// Trace id returned by `decide`
        #[arg(long)]
        trace: String,

        #[arg(short, long)]
        tool: String,

        #[arg(short, long, value_enum)]
        polarity: OutcomePolarity,

        /// Mark the trace binding as weak
        #[arg(long)]
        weak: bool,
    },

    /// Purge cached packets matching a scope (e.g. `file:src/auth`, `project:web`)
    Invalidate {
        scope: String,
    },

    /// Show the observability snapshot
    Status,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutcomePolarity {
    Good,
    Bad,
}

impl From<OutcomePolarity> for Polarity {
    fn from(p: OutcomePolarity) -> Self {
        match p {
            OutcomePolarity::Good => Polarity::Good,
            OutcomePolarity::Bad => Polarity::Bad,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("advisory={},tower_http=info", log_level).into());
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    // Load configuration
    let config = match &cli.config {
        Some(path) => AdvisoryConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => AdvisoryConfig::default(),
    };

    match cli.command {
        Commands::Serve {
            host,
            port,
            reload_interval,
        } => {
            run_server(config, cli.config, host, port, reload_interval).await?;
        }
        Commands::Decide {
            session,
            tool,
            intent,
            file,
            project,
        } => {
            let engine = open_engine(config).await?;
            let mut context = DecisionContext::new(intent);
            context.project_id = project;
            context.file_path = file.map(|f| f.display().to_string());

            let decision = engine.decide(&session, &tool, &context).await;
            engine.save_state().await?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        Commands::Outcome {
            trace,
            tool,
            polarity,
            weak,
        } => {
            let engine = open_engine(config).await?;
            let mut record = OutcomeRecord::new(trace, tool, polarity.into());
            record.strict = !weak;

            let result = engine.process_outcome(record).await;
            engine.save_state().await?;
            println!("{:?}", result);
        }
        Commands::Invalidate { scope } => {
            let engine = open_engine(config).await?;
            let removed = engine.invalidate_packets(&scope).await;
            engine.save_state().await?;
            println!("Removed {} packet(s) matching '{}'", removed, scope);
        }
        Commands::Status => {
            let engine = open_engine(config).await?;
            println!("{}", serde_json::to_string_pretty(&engine.status().await)?);
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

/// Engine over the persisted state directory
async fn open_engine(config: AdvisoryConfig) -> Result<AdvisoryEngine> {
    let store = StateStore::open(config.storage.base_dir.clone()).await?;
    let engine = AdvisoryEngine::builder(config).state_store(store).build()?;
    engine.load_state().await?;
    Ok(engine)
}

async fn run_server(
    mut config: AdvisoryConfig,
    config_path: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    reload_interval: u64,
) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let cors_origins = config.server.cors_origins.clone();

    let store = StateStore::open(config.storage.base_dir.clone()).await?;
    let handle = Arc::new(ConfigHandle::new(config));
    let engine = Arc::new(
        AdvisoryEngineBuilder::with_handle(handle.clone())
            .state_store(store)
            .build()?,
    );
    engine.load_state().await?;
    engine.start().await?;

    let cancel = CancellationToken::new();
    let reloader = config_path
        .map(|path| spawn_config_reloader(path, handle, reload_interval, cancel.clone()));

    let app = build_app(
        AdvisoryState {
            engine: engine.clone(),
        },
        &cors_origins,
    );
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Advisory hook API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
        .context("Hook API server error")?;

    tracing::info!("Shutting down...");
    cancel.cancel();
    if let Some(reloader) = reloader {
        if let Err(e) = reloader.await {
            tracing::warn!(error = %e, "Configuration reloader ended abnormally");
        }
    }
    engine.shutdown().await?;
    Ok(())
}

fn show_config(config: Option<&AdvisoryConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}

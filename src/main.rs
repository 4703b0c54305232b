use anyhow::{Context, Result};
use clap::Parser;
use manual_rag::cache::{CacheSweeper, ModelCache};
use manual_rag::config::{Config, EncoderKind, IndexConfig};
use manual_rag::llm::OpenAiChatClient;
use manual_rag::retrieval::{HashPageEncoder, HttpPageEncoder, PageEncoder, PageIndexLoader};
use manual_rag::telemetry;
use manual_rag::web::{self, WebState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

/// Manual RAG Server - question answering over aircraft manuals
#[derive(Parser, Debug)]
#[command(name = "manual_rag_server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Server listen address (overrides config file)
    #[arg(short, long, value_name = "ADDR")]
    address: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Generate a template configuration file and exit
    #[arg(long, value_name = "FILE")]
    init: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --init flag: generate template config and exit
    if let Some(init_path) = args.init {
        let path = if init_path.as_os_str().is_empty() {
            PathBuf::from("manual_rag.toml")
        } else {
            init_path
        };

        if path.exists() {
            eprintln!("Error: Config file already exists: {}", path.display());
            eprintln!("Remove it first or choose a different path.");
            std::process::exit(1);
        }

        Config::write_template(&path)?;
        println!("✓ Generated config file: {}", path.display());
        println!("\nEdit the file to configure the server, then start it with:");
        println!(
            "  cargo run --release --bin manual_rag_server -- --config {}",
            path.display()
        );
        return Ok(());
    }

    let (config, source) = load_config(&args)?;
    config.validate()?;

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    telemetry::init_telemetry(&config.telemetry, log_level)?;

    match source {
        Some(path) => info!(path = %path.display(), "Loaded config from file"),
        None => info!("No config file found, using defaults"),
    }
    info!(
        address = %config.server.address,
        index_root = %config.index.root,
        index_name = %config.index.name,
        device = %config.index.device,
        "Configuration loaded"
    );

    let encoder = build_encoder(&config.index)?;
    info!(
        encoder = encoder.name(),
        embedding_dim = encoder.embedding_dim(),
        "Page encoder ready"
    );

    let cache = Arc::new(ModelCache::new(
        PageIndexLoader::new(encoder),
        config.cache.to_cache_config(),
    ));
    let sweeper = CacheSweeper::spawn(Arc::clone(&cache));

    let chat = OpenAiChatClient::new(&config.llm)?;
    if !chat.has_api_key() {
        warn!("No API key for the chat-completion service; set OPENAI_API_KEY or llm.api_key");
    }

    let state = WebState::new(
        cache,
        Arc::new(chat),
        config.index.clone(),
        config.llm.clone(),
    );
    let app = web::create_router(
        state,
        &config.server.allowed_origins,
        config.server.max_upload_bytes,
    )?;

    let listener = tokio::net::TcpListener::bind(&config.server.address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.address))?;
    info!(address = %config.server.address, "Manual RAG server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    sweeper.shutdown().await;
    info!("Server stopped");
    telemetry::shutdown_telemetry();
    Ok(())
}

/// Load configuration from file or defaults, then apply CLI and env overrides
fn load_config(args: &Args) -> Result<(Config, Option<PathBuf>)> {
    let (base_config, source) = if let Some(ref config_path) = args.config {
        if !config_path.exists() {
            anyhow::bail!(
                "Config file not found: {}\nUse --init {} to generate a template.",
                config_path.display(),
                config_path.display()
            );
        }
        (Config::from_file(config_path)?, Some(config_path.clone()))
    } else {
        match Config::from_default_locations()? {
            Some((config, path)) => (config, Some(path)),
            None => (Config::default(), None),
        }
    };

    let mut config = base_config.with_overrides(args.address.clone());
    config.llm = config.llm.with_env_overrides();
    config.telemetry = config.telemetry.with_env_overrides();
    Ok((config, source))
}

fn build_encoder(index: &IndexConfig) -> Result<Arc<dyn PageEncoder>> {
    match index.encoder {
        EncoderKind::Hash => Ok(Arc::new(HashPageEncoder::new())),
        EncoderKind::Http => {
            let url = index
                .encoder_url
                .clone()
                .context("index.encoder_url is required when index.encoder = \"http\"")?;
            let encoder = HttpPageEncoder::new(
                url,
                index.encoder_api_key.clone(),
                index.encoder_dim,
                Duration::from_secs(index.encoder_timeout_secs),
            )?;
            Ok(Arc::new(encoder))
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}

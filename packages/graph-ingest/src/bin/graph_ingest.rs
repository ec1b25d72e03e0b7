// Ingest a text file into a local knowledge graph

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use graph_ingest::ai::{OpenAiClient, OpenAiEmbedder, OpenAiEmbedders};
use graph_ingest::{GraphPipeline, IngestRequest, PipelineConfig, SourceType, SqliteGraphStore};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "graph-ingest")]
#[command(about = "Extract entities and facts from a text file into a knowledge graph")]
struct Cli {
    /// Text file to ingest
    #[arg(long)]
    file: PathBuf,

    /// Title of the captured item (defaults to the file name)
    #[arg(long)]
    title: Option<String>,

    /// URL the text was captured from
    #[arg(long, default_value = "")]
    url: String,

    /// Identifier of the captured item (defaults to the file path)
    #[arg(long)]
    page_id: Option<String>,

    /// page, selection, chat or note
    #[arg(long, default_value = "page")]
    source_type: SourceType,

    /// SQLite database URL (overrides GRAPH_DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,
}

/// Settings read from the environment.
struct Settings {
    openai_api_key: String,
    openai_model: Option<String>,
    openai_embedding_model: Option<String>,
    openai_base_url: Option<String>,
    database_url: String,
    max_retries: Option<usize>,
    owner_name: Option<String>,
}

impl Settings {
    fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            openai_api_key: env::var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?,
            openai_model: env::var("OPENAI_MODEL").ok(),
            openai_embedding_model: env::var("OPENAI_EMBEDDING_MODEL").ok(),
            openai_base_url: env::var("OPENAI_BASE_URL").ok(),
            database_url: env::var("GRAPH_DATABASE_URL").unwrap_or_else(|_| "sqlite://graph.db".to_string()),
            max_retries: env::var("GRAPH_MAX_RETRIES")
                .ok()
                .map(|v| v.parse())
                .transpose()
                .context("GRAPH_MAX_RETRIES must be a valid number")?,
            owner_name: env::var("GRAPH_OWNER_NAME").ok(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,graph_ingest=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env().context("Failed to load configuration")?;

    let content = tokio::fs::read_to_string(&cli.file)
        .await
        .with_context(|| format!("Failed to read {}", cli.file.display()))?;
    let title = cli.title.clone().unwrap_or_else(|| {
        cli.file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Untitled".to_string())
    });
    let page_id = cli
        .page_id
        .clone()
        .unwrap_or_else(|| cli.file.display().to_string());

    let database_url = cli.database_url.clone().unwrap_or(settings.database_url);
    tracing::info!(database_url = %database_url, "Opening graph database");
    let store = SqliteGraphStore::new(&database_url)
        .await
        .context("Failed to open graph database")?;

    let mut llm = OpenAiClient::new(settings.openai_api_key.clone());
    if let Some(model) = settings.openai_model {
        llm = llm.with_model(model);
    }
    let mut embedder = OpenAiEmbedder::new(settings.openai_api_key);
    if let Some(model) = settings.openai_embedding_model {
        embedder = embedder.with_model(model);
    }
    if let Some(base_url) = settings.openai_base_url {
        llm = llm.with_base_url(base_url.clone());
        embedder = embedder.with_base_url(base_url);
    }

    let mut config = PipelineConfig::default();
    if let Some(retries) = settings.max_retries {
        config = config.with_max_retries(retries);
    }
    if let Some(owner) = settings.owner_name {
        config = config.with_owner_entity_name(owner);
    }

    let pipeline = GraphPipeline::new(store, llm)
        .with_embedders(Arc::new(OpenAiEmbedders::new(embedder)))
        .with_config(config);

    let request = IngestRequest::new(page_id, title, content)
        .with_url(cli.url)
        .with_source_type(cli.source_type);

    // Ctrl-C stops further model calls; persistence already under way finishes
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling ingestion");
            signal.cancel();
        }
    });

    let outcome = pipeline.ingest_with_cancel(&request, cancel).await;
    tracing::info!("{}", outcome.final_message);

    println!(
        "{}",
        serde_json::to_string_pretty(&outcome).context("Failed to serialize outcome")?
    );

    Ok(())
}

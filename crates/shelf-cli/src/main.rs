mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use shelf_sync::config::FilesystemConfig;
use shelf_sync::{EngineConfig, EngineTomlConfig, OfflineEngine, SortOrder, StorageBackend};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shelf")]
#[command(version, about = "Book catalog client that keeps working offline", long_about = None)]
struct Cli {
    /// Config file
    #[arg(long, env = "SHELF_CONFIG", default_value = "shelf.toml")]
    config: PathBuf,

    /// Base URL of the books API
    #[arg(long, env = "SHELF_API_URL")]
    api_url: Option<String>,

    /// Push channel URL
    #[arg(long, env = "SHELF_WS_URL")]
    ws_url: Option<String>,

    /// Directory holding the cache and the pending queue
    #[arg(long, env = "SHELF_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Never contact the server; changes are queued
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show connectivity, sync state and queue size
    Status,

    /// List books (from the cache when offline)
    List {
        #[arg(short, long, default_value = "1")]
        page: u32,

        /// Field to sort by
        #[arg(long)]
        sort: Option<String>,

        #[arg(long, value_parser = parse_order)]
        order: Option<SortOrder>,

        /// Free text search over title, author and genre
        #[arg(short, long)]
        search: Option<String>,

        #[arg(long)]
        author: Option<String>,

        #[arg(long)]
        genre: Option<String>,

        #[arg(long)]
        min_price: Option<f64>,

        #[arg(long)]
        max_price: Option<f64>,
    },

    /// Add a book
    Add {
        title: String,

        #[arg(short, long)]
        author: String,

        #[arg(short, long)]
        price: f64,

        #[arg(short, long)]
        genre: Option<String>,

        #[arg(long)]
        rating: Option<f64>,

        #[arg(long)]
        year: Option<i32>,
    },

    /// Update a book; omitted fields keep their cached values
    Update {
        id: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(short, long)]
        author: Option<String>,

        #[arg(short, long)]
        price: Option<f64>,

        #[arg(short, long)]
        genre: Option<String>,

        #[arg(long)]
        rating: Option<f64>,
    },

    /// Delete a book
    Delete { id: String },

    /// Replay pending changes against the server
    Sync,

    /// Show queued changes
    Pending {
        /// Print the raw queue as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show catalog statistics
    Stats,

    /// Stay connected: sync automatically and apply live updates
    Watch,
}

fn parse_order(value: &str) -> Result<SortOrder, String> {
    value.parse().map_err(|e: anyhow::Error| e.to_string())
}

impl Cli {
    /// shelf.toml, then command line and environment overrides
    fn engine_config(&self) -> Result<EngineConfig> {
        let file = EngineTomlConfig::load(&self.config)?;
        let mut config = file.to_runtime_config()?;

        if let Some(url) = &self.api_url {
            config.api_base_url = url.clone();
        }
        if let Some(url) = &self.ws_url {
            config.ws_url = url.clone();
        }

        // A CLI run is short-lived, so it persists by default
        match &self.data_dir {
            Some(path) => {
                config.storage = StorageBackend::Filesystem(FilesystemConfig { path: path.clone() });
            }
            None if file.storage.backend.is_none() => {
                config.storage = StorageBackend::Filesystem(FilesystemConfig::default());
            }
            None => {}
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shelf_cli=info,shelf_sync=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.engine_config()?;
    let engine = Arc::new(OfflineEngine::from_config(config).await?);
    engine.set_online(!cli.offline).await;

    match cli.command {
        Commands::Status => commands::status::execute(&engine).await?,
        Commands::List {
            page,
            sort,
            order,
            search,
            author,
            genre,
            min_price,
            max_price,
        } => {
            let filter = shelf_sync::BookFilter {
                search,
                author,
                genre,
                min_price,
                max_price,
                ..Default::default()
            };
            commands::list::execute(&engine, page, sort, order, filter).await?
        }
        Commands::Add {
            title,
            author,
            price,
            genre,
            rating,
            year,
        } => {
            let mut draft = shelf_sync::BookDraft::new(title, author, price);
            draft.genre = genre.unwrap_or_default();
            draft.rating = rating.unwrap_or_default();
            draft.year = year;
            commands::edit::add(&engine, draft).await?
        }
        Commands::Update {
            id,
            title,
            author,
            price,
            genre,
            rating,
        } => {
            let changes = commands::edit::FieldChanges {
                title,
                author,
                price,
                genre,
                rating,
            };
            commands::edit::update(&engine, &id, changes).await?
        }
        Commands::Delete { id } => commands::edit::delete(&engine, &id).await?,
        Commands::Sync => commands::sync::execute(&engine).await?,
        Commands::Pending { json } => commands::sync::pending(&engine, json).await?,
        Commands::Stats => commands::status::stats(&engine).await?,
        Commands::Watch => commands::watch::execute(&engine).await?,
    }

    Ok(())
}

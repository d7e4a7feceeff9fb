use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use firefeed::config::Config;
use firefeed::dedup::HttpEmbedder;
use firefeed::feed::FeedValidator;
use firefeed::pipeline::Pipeline;
use firefeed::publish::{PublicationChannel, WebhookChannel};
use firefeed::storage::{Database, DatabaseError, NewFeedSource};
use firefeed::translate::HttpTranslationBackend;

#[derive(Parser, Debug)]
#[command(name = "firefeed", about = "RSS news pipeline: fetch, dedupe, translate, publish")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = "firefeed.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single pipeline pass and exit
    Run,
    /// Run pipeline passes on the configured interval until interrupted
    Watch,
    /// Check whether a URL serves a valid, reachable feed
    Validate {
        url: String,
        /// Permit loopback and private-range hosts
        #[arg(long)]
        allow_private: bool,
    },
    /// Register a feed source
    AddFeed {
        /// Display name of the source
        #[arg(long)]
        source: String,
        #[arg(long)]
        url: String,
        #[arg(long, default_value = "general")]
        category: String,
        /// Source language code, e.g. "en"
        #[arg(long)]
        language: String,
        #[arg(long, default_value_t = 10)]
        cooldown_minutes: i64,
        #[arg(long, default_value_t = 10)]
        max_news_per_hour: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    let client = reqwest::Client::builder()
        .user_agent(concat!("firefeed/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    match args.command {
        Command::Validate { url, allow_private } => {
            let mut validator = FeedValidator::new(client, &config.rss);
            if allow_private {
                validator = validator.allow_private_hosts();
            }
            let verdict = validator.validate(&url).await;
            if verdict.ok {
                println!("OK: {url}");
                Ok(())
            } else {
                println!(
                    "REJECTED: {url}: {}",
                    verdict.reason.unwrap_or_else(|| "unknown reason".to_string())
                );
                std::process::exit(1);
            }
        }
        Command::AddFeed {
            source,
            url,
            category,
            language,
            cooldown_minutes,
            max_news_per_hour,
        } => {
            let db = open_database(&config).await?;
            let feed_id = db
                .add_feed(&NewFeedSource {
                    source,
                    url: url.clone(),
                    category,
                    language,
                    cooldown_minutes,
                    max_news_per_hour,
                })
                .await?;
            println!("Registered feed {feed_id}: {url}");
            Ok(())
        }
        Command::Run => {
            let pipeline = build_pipeline(&config, client).await?;
            let stats = pipeline.run_once().await?;
            pipeline.shutdown().await;
            println!(
                "Pass complete: {} fetched, {} duplicates, {} persisted, {} translated, {} published",
                stats.fetched, stats.duplicates, stats.persisted, stats.translated, stats.published
            );
            Ok(())
        }
        Command::Watch => {
            let pipeline = build_pipeline(&config, client).await?;
            pipeline.watch().await?;
            pipeline.shutdown().await;
            Ok(())
        }
    }
}

async fn open_database(config: &Config) -> Result<Database> {
    match Database::open(&config.database.path).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("{}", DatabaseError::InstanceLocked);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

async fn build_pipeline(config: &Config, client: reqwest::Client) -> Result<Pipeline> {
    let db = open_database(config).await?;

    let embedder = Arc::new(HttpEmbedder::new(
        client.clone(),
        &config.inference,
        config.dedup.embedding_dimension,
    ));
    let backend = Arc::new(HttpTranslationBackend::new(client.clone(), &config.inference));
    let channel = WebhookChannel::from_config(client.clone(), &config.publication)
        .map(|c| Arc::new(c) as Arc<dyn PublicationChannel>);
    if channel.is_none() {
        tracing::warn!("No webhook configured; items will be persisted but not published");
    }

    Ok(Pipeline::new(db, config, client, embedder, backend, channel))
}

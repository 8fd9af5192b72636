use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use newshound_adapters::{load_fixture_renderer, Credentials, SourceKind};
use newshound_core::{Article, DateWindow};
use newshound_storage::NewsStore;
use newshound_sync::{csv, DiscoveryRunSummary, IngestSummary, NewsPipeline, PipelineConfig, SourceRegistry};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "newshound")]
#[command(about = "Discover, store and browse financial news articles")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct DiscoveryArgs {
    search_term: String,
    /// YYYY-MM-DD, inclusive
    start_date: String,
    /// YYYY-MM-DD, inclusive
    end_date: String,
    /// Write links to this CSV instead of printing them
    #[arg(long)]
    out: Option<PathBuf>,
    /// Serve pages from a JSON fixture site instead of the network
    #[arg(long)]
    fixtures: Option<PathBuf>,
    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest article links from one source
    Discover {
        source: SourceKind,
        #[command(flatten)]
        args: DiscoveryArgs,
        #[arg(long, requires = "password")]
        username: Option<String>,
        #[arg(long, requires = "username")]
        password: Option<String>,
    },
    /// Harvest article links from every source enabled in sources.yaml
    DiscoverAll {
        #[command(flatten)]
        args: DiscoveryArgs,
    },
    /// Scrape a ticker's quote page news and store the articles
    Scrape {
        ticker: String,
        #[arg(long, default_value_t = 30)]
        days: u32,
        #[arg(long)]
        json: bool,
    },
    /// Store every article linked from a CSV file
    Csv { file: PathBuf, ticker: String },
    /// List stored articles for a ticker, newest first
    List {
        ticker: String,
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Show one stored article
    View {
        #[arg(long, conflicts_with = "url", required_unless_present = "url")]
        id: Option<i64>,
        #[arg(long)]
        url: Option<String>,
    },
    /// Search stored titles and text
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Article counts and date range for a ticker
    Stats { ticker: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Discover {
            source,
            args,
            username,
            password,
        } => {
            let window = DateWindow::parse(&args.start_date, &args.end_date)?;
            let credentials = username.zip(password).map(|(user, pass)| Credentials::new(user, pass));
            if source.requires_login() && credentials.is_none() {
                bail!("{} requires --username and --password", source.display_name());
            }
            let pipeline = pipeline(config, args.fixtures.as_ref()).await?;
            let summary = pipeline.discover(source, &args.search_term, window, credentials).await;
            pipeline.close().await;
            emit_links(&summary, args.out.as_ref()).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_run_summary(&summary);
            }
        }
        Commands::DiscoverAll { args } => {
            let window = DateWindow::parse(&args.start_date, &args.end_date)?;
            let registry = SourceRegistry::load(config.registry_path()).await?;
            let pipeline = pipeline(config, args.fixtures.as_ref()).await?;
            let summary = pipeline.discover_enabled(&registry, &args.search_term, window).await;
            pipeline.close().await;
            emit_links(&summary, args.out.as_ref()).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_run_summary(&summary);
            }
        }
        Commands::Scrape { ticker, days, json } => {
            let pipeline = NewsPipeline::from_config(config).await?;
            let result = pipeline.scrape_ticker(&ticker, days).await;
            pipeline.close().await;
            let summary = result?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_run_summary(&summary.discovery);
                print_ingest_summary(&ticker, &summary.ingest);
            }
        }
        Commands::Csv { file, ticker } => {
            let pipeline = NewsPipeline::from_config(config).await?;
            let result = pipeline.ingest_csv(&file, &ticker).await;
            pipeline.close().await;
            print_ingest_summary(&ticker, &result?);
        }
        Commands::List { ticker, limit } => {
            let store = open_store(&config).await?;
            let articles = store.find_by_ticker(&ticker, Some(limit)).await?;
            if articles.is_empty() {
                println!("no articles stored for {ticker}");
            }
            for article in &articles {
                print_article_line(article);
            }
            store.close().await;
        }
        Commands::View { id, url } => {
            let store = open_store(&config).await?;
            let found = match (id, url) {
                (Some(id), _) => store.find_by_id(id).await?,
                (None, Some(url)) => store.find_by_url(&url).await?,
                (None, None) => None,
            };
            store.close().await;
            match found {
                Some(article) => print_article(&article),
                None => println!("article not found"),
            }
        }
        Commands::Search { query, limit } => {
            let store = open_store(&config).await?;
            let articles = store.search(&query, limit).await?;
            store.close().await;
            println!("{} result(s) for {query:?}", articles.len());
            for article in &articles {
                print_article_line(article);
            }
        }
        Commands::Stats { ticker } => {
            let store = open_store(&config).await?;
            let stats = store.ticker_stats(&ticker).await?;
            store.close().await;
            match stats {
                None => println!("no articles stored for {ticker}"),
                Some(stats) => {
                    println!("ticker:    {}", stats.symbol);
                    println!("articles:  {}", stats.count);
                    println!("oldest:    {}", stats.oldest_date.format("%Y-%m-%d"));
                    println!("newest:    {}", stats.newest_date.format("%Y-%m-%d"));
                    match stats.avg_sentiment {
                        Some(avg) => println!("sentiment: {avg:.3}"),
                        None => println!("sentiment: n/a"),
                    }
                }
            }
        }
    }

    Ok(())
}

async fn pipeline(config: PipelineConfig, fixtures: Option<&PathBuf>) -> Result<NewsPipeline> {
    let pipeline = NewsPipeline::from_config(config).await?;
    Ok(match fixtures {
        Some(path) => pipeline.with_renderer(Arc::new(load_fixture_renderer(path)?)),
        None => pipeline,
    })
}

async fn open_store(config: &PipelineConfig) -> Result<NewsStore> {
    NewsStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening news store {}", config.db_path.display()))
}

async fn emit_links(summary: &DiscoveryRunSummary, out: Option<&PathBuf>) -> Result<()> {
    match out {
        Some(path) => {
            csv::write_links(path, summary.all_links()).await?;
            println!("wrote {} link(s) to {}", summary.total_links(), path.display());
        }
        None => print!("{}", csv::render_links(summary.all_links())),
    }
    Ok(())
}

fn print_run_summary(summary: &DiscoveryRunSummary) {
    println!("discovery run {}", summary.run_id);
    for source in &summary.sources {
        match (&source.error, source.stop_reason) {
            (Some(error), _) => println!("  {:<20} failed: {error}", source.source_name),
            (None, Some(reason)) => println!(
                "  {:<20} {:>4} link(s), {} page(s), stopped: {reason:?}",
                source.source_name,
                source.links.len(),
                source.pages_visited
            ),
            (None, None) => println!("  {:<20} {:>4} link(s)", source.source_name, source.links.len()),
        }
    }
    println!("  total: {} link(s)", summary.total_links());
}

fn print_ingest_summary(ticker: &str, summary: &IngestSummary) {
    println!(
        "{ticker}: {} added, {} already stored, {} failed",
        summary.added, summary.skipped, summary.failed
    );
}

fn print_article_line(article: &Article) {
    println!(
        "[{}] {} {:<6} {} ({})",
        article.id,
        article.date_published.format("%Y-%m-%d"),
        article.ticker_symbol,
        article.title,
        article.source
    );
}

fn print_article(article: &Article) {
    println!("{}", article.title);
    println!("id:        {}", article.id);
    println!("ticker:    {}", article.ticker_symbol);
    println!("url:       {}", article.url);
    println!("source:    {}", article.source);
    println!("author:    {}", article.author);
    println!("published: {}", article.date_published.to_rfc3339());
    println!("fetched:   {}", article.fetch_date.to_rfc3339());
    if let Some(summary) = &article.summary {
        println!("summary:   {summary}");
    }
    println!();
    println!("{}", article.text);
}

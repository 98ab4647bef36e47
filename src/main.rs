use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use tracing::{Level, info, info_span};
use tracing_subscriber::FmtSubscriber;

use blog_archive_crawler::{
    BasicImageDecoder, Config, ContentCache, CrawlDriver, Fetcher, Period, SelectorExtractor,
    SqliteStore, config,
};

/// Walks a blog's monthly archive and records posts and images.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(long)]
    config: Option<String>,

    /// SQLite database path
    #[arg(long, env = "CRAWLER_DATABASE")]
    database: Option<PathBuf>,

    /// Cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// First archive period to walk (YYYY-MM)
    #[arg(long)]
    start: Option<Period>,

    /// Fetch archive index pages again even when cached
    #[arg(long)]
    update: bool,

    /// Process only this post
    #[arg(long)]
    post: Option<String>,

    /// Process only this image of --post
    #[arg(long, requires = "post")]
    image: Option<String>,

    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    #[arg(short, long)]
    quiet: bool,
}

fn initialize_logging(cli: &Cli) -> Result<()> {
    let level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::WARN
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    initialize_logging(&cli)?;

    let mut config = match &cli.config {
        Some(path) => config::load(path).with_context(|| format!("loading config {path}"))?,
        None => Config::default(),
    };
    if let Some(database) = &cli.database {
        config.database.clone_from(database);
    }
    if let Some(cache_dir) = &cli.cache_dir {
        config.cache_dir.clone_from(cache_dir);
    }

    let start = match cli.start {
        Some(start) => start,
        None => Period::new(config.start_year, config.start_month)?,
    };
    let end = Period::current();
    if start > end {
        bail!("start period {start} is in the future");
    }

    let span = info_span!("crawl");
    let cache = ContentCache::open(&config.cache_dir)
        .with_context(|| format!("opening cache {}", config.cache_dir.display()))?
        .with_span(span.clone());
    let fetcher = Fetcher::from_config(cache, &config)?.with_span(span.clone());
    let store = SqliteStore::open(&config.database)
        .with_context(|| format!("opening database {}", config.database.display()))?
        .with_span(span.clone());
    let extractor = SelectorExtractor::new(&config.selectors)?;

    let driver = CrawlDriver::new(
        fetcher,
        store,
        extractor,
        BasicImageDecoder,
        config.archive_url_template.clone(),
    )
    .with_span(span);

    info!("Crawler started");

    match (&cli.post, &cli.image) {
        (Some(post), Some(image)) => driver.run_single_image(post, image).await?,
        (Some(post), None) => driver.run_single_post(post).await?,
        _ => driver.run(start, end, cli.update).await?,
    };

    info!("Crawler finished");

    Ok(())
}

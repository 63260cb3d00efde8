use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use daam_core::{image_filename, RawObservation};
use daam_extract::{
    load_categories_or_fallback, parse_sitemap_categories, read_rendered_page, ListingExtractor,
};
use daam_ingest::{IngestionPipeline, PipelineConfig, SyntheticConfig};
use daam_store::{write_atomic, HttpClientConfig, HttpFetcher, ImageStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "daam-cli")]
#[command(about = "Daam Track price catalog command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest rendered category listing snapshots into the catalog.
    Ingest {
        /// Directory holding one `<category-slug>.html` per category.
        #[arg(long)]
        pages_dir: PathBuf,
        /// Observation date (YYYY-MM-DD); defaults to today.
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Skip the image cache pass.
        #[arg(long)]
        no_images: bool,
    },
    /// Fold units into product names for one year's partition and reindex.
    Repair {
        #[arg(long)]
        year: i32,
    },
    /// Seed a demo catalog with synthetic price history.
    Seed {
        #[arg(long, default_value_t = 90)]
        days: u32,
        /// RNG seed for reproducible output.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Derive the categories file from the storefront sitemap.
    Discover {
        #[arg(long, default_value = "https://chaldal.com/sitemap.xml")]
        sitemap_url: String,
        #[arg(long, default_value = "chaldal.com")]
        host: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Ingest {
            pages_dir,
            date,
            no_images,
        } => {
            let observed_date = date.unwrap_or_else(|| chrono::Local::now().date_naive());
            let observations = collect_observations(&config, &pages_dir)?;

            if !no_images {
                cache_images(&config, &observations).await?;
            }

            let pipeline = IngestionPipeline::new(&config);
            let report = pipeline.run(observations, observed_date)?;
            println!(
                "ingest complete: run_id={} date={} partition_rows={} ingested={} rejected={} duplicates_dropped={} meta_entries={}",
                report.run_id,
                report.date,
                report.partition_rows,
                report.ingested,
                report.rejected.values().sum::<usize>(),
                report.duplicates_dropped,
                report.meta_entries
            );
        }
        Commands::Repair { year } => {
            let pipeline = IngestionPipeline::new(&config);
            let report = pipeline.repair(year)?;
            println!(
                "repair complete: year={} rows_before={} rows_after={} collapsed={} meta_entries={}",
                report.year, report.rows_before, report.rows_after, report.collapsed, report.meta_entries
            );
        }
        Commands::Seed { days, seed } => {
            let pipeline = IngestionPipeline::new(&config);
            let report = pipeline.seed_synthetic(&SyntheticConfig {
                days,
                seed,
                end_date: chrono::Local::now().date_naive(),
            })?;
            println!(
                "seed complete: rows={} years={:?} meta_entries={}",
                report.rows, report.years, report.meta_entries
            );
        }
        Commands::Discover { sitemap_url, host } => {
            let fetcher = HttpFetcher::new(http_config(&config))?;
            let xml = fetcher
                .fetch_bytes(&sitemap_url)
                .await
                .with_context(|| format!("fetching sitemap {sitemap_url}"))?;
            let xml = String::from_utf8(xml).context("sitemap is not valid utf-8")?;
            let targets = parse_sitemap_categories(&xml, &host)?;
            let bytes = serde_json::to_vec_pretty(&targets).context("serializing categories")?;
            write_atomic(&config.categories_file, &bytes)?;
            println!(
                "discover complete: categories={} file={}",
                targets.len(),
                config.categories_file.display()
            );
        }
    }

    Ok(())
}

fn http_config(config: &PipelineConfig) -> HttpClientConfig {
    HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    }
}

/// Extract every configured category from its rendered snapshot. A missing or
/// unreadable snapshot costs that category its rows, nothing more.
fn collect_observations(
    config: &PipelineConfig,
    pages_dir: &std::path::Path,
) -> Result<Vec<RawObservation>> {
    let targets = load_categories_or_fallback(&config.categories_file);
    let extractor = ListingExtractor::new().context("compiling listing selectors")?;

    let mut observations = Vec::new();
    for target in &targets {
        match read_rendered_page(pages_dir, target) {
            Ok(html) => {
                let extraction = extractor.extract(&html, &target.category);
                info!(
                    category = %target.category,
                    rows = extraction.observations.len(),
                    skipped = extraction.skipped_rows,
                    "extracted category"
                );
                observations.extend(extraction.observations);
            }
            Err(err) => {
                warn!(category = %target.category, error = %err, "category snapshot unavailable, skipping");
            }
        }
    }
    Ok(observations)
}

/// Fetch any images the flat cache does not already hold. Failures are
/// per-image and tolerated; a later run will retry them.
async fn cache_images(config: &PipelineConfig, observations: &[RawObservation]) -> Result<()> {
    let store = ImageStore::new(&config.images_dir);
    let fetcher = HttpFetcher::new(http_config(config))?;

    let mut handled: HashSet<String> = HashSet::new();
    let mut fetched = 0usize;
    let mut cached = 0usize;
    let mut failed = 0usize;

    for observation in observations {
        let Some(url) = observation.image_url.as_deref() else {
            continue;
        };
        let filename = image_filename(&observation.name);
        if !handled.insert(filename.clone()) {
            continue;
        }
        if store.contains(&filename).await {
            cached += 1;
            continue;
        }
        match fetcher.fetch_bytes(url).await {
            Ok(bytes) => match store.store_bytes(&filename, &bytes).await {
                Ok(_) => fetched += 1,
                Err(err) => {
                    warn!(%filename, error = %err, "storing image failed");
                    failed += 1;
                }
            },
            Err(err) => {
                warn!(%url, error = %err, "fetching image failed");
                failed += 1;
            }
        }
    }

    info!(fetched, cached, failed, "image cache pass complete");
    Ok(())
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fdr_sync::{FilingStore, MirrorPipeline, SqliteStore, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fdr-cli")]
#[command(about = "House financial-disclosure mirror command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the metadata store schema and seed the filing-type reference table.
    Migrate,
    /// Mirror the yearly bulk archives and ingest their filing records.
    SyncArchives {
        /// First year to cover (defaults to the archive's first published year).
        #[arg(long)]
        from: Option<i64>,
        /// Last year to cover (defaults to the current year).
        #[arg(long)]
        to: Option<i64>,
    },
    /// Fetch the individual PDF for every persisted filing record.
    FetchDocuments,
    /// Run the search-form discovery flow and download the listed PDFs.
    Discover,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;
    let store = SqliteStore::connect(&config.database_url).await?;
    store.migrate().await?;

    match cli.command {
        Commands::Migrate => {
            let types = store.filing_types().await?;
            println!("metadata store ready: {} filing types seeded", types.len());
        }
        Commands::SyncArchives { from, to } => {
            let default_years = config.covered_years();
            let years = from.unwrap_or(*default_years.start())..=to.unwrap_or(*default_years.end());
            let pipeline = MirrorPipeline::new(config, store)?;
            let summary = pipeline.sync_archives(years).await?;
            println!(
                "archive sync complete: run_id={} years={} failed_years={} inserted={} duplicate={} failed={}",
                summary.run_id,
                summary.years.len(),
                summary.failed_years.len(),
                summary.totals.inserted,
                summary.totals.duplicate,
                summary.totals.failed
            );
        }
        Commands::FetchDocuments => {
            let pipeline = MirrorPipeline::new(config, store)?;
            let summary = pipeline.fetch_documents().await?;
            println!(
                "document fetch complete: run_id={} fetched={} skipped={} failed={}",
                summary.run_id, summary.counts.fetched, summary.counts.skipped, summary.counts.failed
            );
        }
        Commands::Discover => {
            let pipeline = MirrorPipeline::new(config, store)?;
            let summary = pipeline.discover().await?;
            println!(
                "discovery complete: run_id={} discovered={} downloaded={} skipped={} failed={}",
                summary.run_id,
                summary.discovered,
                summary.downloaded,
                summary.skipped,
                summary.failed
            );
        }
    }

    Ok(())
}

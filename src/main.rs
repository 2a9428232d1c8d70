//! Chain Address Intelligence CLI
//!
//! Extracts address occurrences from chain exports and enriches single addresses with
//! provider labels.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use address_intel::aggregate::HighestConfidence;
use address_intel::cache::open_cache;
use address_intel::config::PipelineConfig;
use address_intel::enrich::AddressEnricher;
use address_intel::extract::{read_occurrences_parquet, write_occurrences_parquet, Extractor};
use address_intel::providers::{build_providers, SharedHttpClient};
use address_intel::schemas::{AddressOccurrence, Chain, RunMetadata, SourceSystem};

#[derive(Parser)]
#[command(name = "address-intel")]
#[command(version)]
#[command(about = "Blockchain address discovery and label enrichment", long_about = None)]
struct Cli {
    /// Path to configuration file (optional, uses env vars if not provided)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output directory for data files
    #[arg(short, long, global = true, default_value = "data")]
    output_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enrich one address with provider labels
    Enrich {
        address: String,

        #[arg(long, default_value = "ethereum")]
        chain: Chain,

        /// Skip the cache read (the result is still cached)
        #[arg(long)]
        force_refresh: bool,
    },

    /// Extract occurrences from a block range (transactions, token transfers, logs)
    ExtractBlocks {
        #[arg(long, default_value = "ethereum")]
        chain: Chain,

        #[arg(long)]
        start_block: u64,

        #[arg(long)]
        end_block: u64,

        /// Keep export files in this directory instead of a temporary one
        #[arg(long)]
        work_dir: Option<PathBuf>,
    },

    /// Extract occurrences from a date range on a UTXO chain
    ExtractDates {
        #[arg(long, default_value = "bitcoin")]
        chain: Chain,

        /// YYYY-MM-DD
        #[arg(long)]
        start_date: NaiveDate,

        /// YYYY-MM-DD
        #[arg(long)]
        end_date: NaiveDate,

        #[arg(long)]
        work_dir: Option<PathBuf>,
    },

    /// Extract callers and recipients of one contract
    ExtractContract {
        #[arg(long, default_value = "ethereum")]
        chain: Chain,

        #[arg(long)]
        contract: String,

        #[arg(long)]
        start_block: u64,

        #[arg(long)]
        end_block: u64,

        #[arg(long)]
        work_dir: Option<PathBuf>,
    },

    /// Extract participants of one event signature
    ExtractEvent {
        #[arg(long, default_value = "ethereum")]
        chain: Chain,

        /// Event signature hash (topic0)
        #[arg(long)]
        signature: String,

        /// Only logs emitted by this contract
        #[arg(long)]
        contract: Option<String>,

        #[arg(long)]
        start_block: u64,

        #[arg(long)]
        end_block: u64,

        #[arg(long)]
        work_dir: Option<PathBuf>,
    },

    /// Show configuration and output status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => PipelineConfig::load().context("Failed to load config from environment")?,
    };

    config.paths.data_dir = cli.output_dir.clone();
    config.paths.occurrences_dir = cli.output_dir.join("occurrences");
    config.paths.metadata_dir = cli.output_dir.join("metadata");

    match cli.command {
        Commands::Enrich {
            address,
            chain,
            force_refresh,
        } => {
            cmd_enrich(&config, &address, chain, force_refresh).await?;
        }
        Commands::ExtractBlocks {
            chain,
            start_block,
            end_block,
            work_dir,
        } => {
            config.ensure_directories()?;
            let occurrences = Extractor::new(&config)
                .extract_block_range(chain, start_block, end_block, work_dir.as_deref())
                .await
                .context("Block-range extraction failed")?;
            let scope = format!("blocks {}-{}", start_block, end_block);
            save_run(&config, chain, SourceSystem::EvmBlockExport, scope, &occurrences)?;
        }
        Commands::ExtractDates {
            chain,
            start_date,
            end_date,
            work_dir,
        } => {
            config.ensure_directories()?;
            let occurrences = Extractor::new(&config)
                .extract_date_range(chain, start_date, end_date, work_dir.as_deref())
                .await
                .context("Date-range extraction failed")?;
            let scope = format!("dates {} to {}", start_date, end_date);
            save_run(&config, chain, SourceSystem::UtxoDateExport, scope, &occurrences)?;
        }
        Commands::ExtractContract {
            chain,
            contract,
            start_block,
            end_block,
            work_dir,
        } => {
            config.ensure_directories()?;
            let occurrences = Extractor::new(&config)
                .extract_contract_interactions(
                    chain,
                    &contract,
                    start_block,
                    end_block,
                    work_dir.as_deref(),
                )
                .await
                .context("Contract extraction failed")?;
            let scope = format!("contract {} blocks {}-{}", contract, start_block, end_block);
            save_run(&config, chain, SourceSystem::ContractExport, scope, &occurrences)?;
        }
        Commands::ExtractEvent {
            chain,
            signature,
            contract,
            start_block,
            end_block,
            work_dir,
        } => {
            config.ensure_directories()?;
            let occurrences = Extractor::new(&config)
                .extract_custom_event(
                    chain,
                    &signature,
                    contract.as_deref(),
                    start_block,
                    end_block,
                    work_dir.as_deref(),
                )
                .await
                .context("Event extraction failed")?;
            let scope = format!("event {} blocks {}-{}", signature, start_block, end_block);
            save_run(&config, chain, SourceSystem::EventExport, scope, &occurrences)?;
        }
        Commands::Status => {
            cmd_status(&config)?;
        }
    }

    Ok(())
}

async fn cmd_enrich(
    config: &PipelineConfig,
    address: &str,
    chain: Chain,
    force_refresh: bool,
) -> Result<()> {
    let http = SharedHttpClient::from_config(&config.providers);
    let providers = build_providers(config, &http);
    let cache = open_cache(&config.cache)
        .await
        .context("Failed to open cache store")?;

    let enricher = AddressEnricher::new(
        providers,
        Box::new(HighestConfidence),
        cache,
        config.cache.ttl_secs,
    );

    let result = enricher
        .enrich(address, chain, force_refresh)
        .await
        .with_context(|| format!("Failed to enrich {} on {}", address, chain))?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// `<chain>_<source>_<scope>_<utc timestamp>`: one file pair per run
fn run_file_stem(
    chain: Chain,
    source_system: SourceSystem,
    scope: &str,
    at: DateTime<Utc>,
) -> String {
    let mut slug = String::with_capacity(scope.len());
    for c in scope.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    format!(
        "{}_{}_{}_{}",
        chain,
        source_system,
        slug.trim_matches('_'),
        at.format("%Y%m%dT%H%M%SZ")
    )
}

fn save_run(
    config: &PipelineConfig,
    chain: Chain,
    source_system: SourceSystem,
    scope: String,
    occurrences: &[AddressOccurrence],
) -> Result<()> {
    let stem = run_file_stem(chain, source_system, &scope, Utc::now());
    let output_path = config
        .paths
        .occurrences_dir
        .join(format!("{}_occurrences.parquet", stem));
    write_occurrences_parquet(occurrences, &output_path)
        .context("Failed to write occurrences parquet")?;

    let mut metadata = RunMetadata::new(chain, source_system, scope);
    metadata.record_counts = address_intel::schemas::OccurrenceCounts::from_occurrences(occurrences);
    let metadata_path = config
        .paths
        .metadata_dir
        .join(format!("{}_metadata.json", stem));
    metadata.save(&metadata_path)?;

    info!(
        "Extracted {} occurrences ({} distinct roles)",
        metadata.record_counts.total,
        metadata.record_counts.by_role.len()
    );
    info!("Occurrences saved to {:?}", output_path);
    info!("Metadata saved to {:?}", metadata_path);
    Ok(())
}

fn cmd_status(config: &PipelineConfig) -> Result<()> {
    info!("=== Pipeline Status ===");
    info!("Data directory: {:?}", config.paths.data_dir);

    info!("Node providers:");
    for chain in Chain::ALL {
        let state = if config.node_provider(chain).is_some() {
            "configured"
        } else {
            "missing"
        };
        info!("  {}: {}", chain, state);
    }

    let http = SharedHttpClient::from_config(&config.providers);
    let providers = build_providers(config, &http);
    info!("{} label providers enabled", providers.len());
    info!(
        "Cache: {}",
        if config.cache.redis_url.is_some() {
            "redis"
        } else {
            "in-process"
        }
    );

    info!("Occurrence files:");
    list_occurrence_files(&config.paths.occurrences_dir)?;
    Ok(())
}

fn list_occurrence_files(dir: &Path) -> Result<()> {
    if !dir.exists() {
        info!("  {} {:?}: not found", "✗", dir);
        return Ok(());
    }

    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "parquet"))
        .collect();
    entries.sort();

    for path in entries {
        let size_kb = std::fs::metadata(&path)?.len() / 1024;
        let count = read_occurrences_parquet(&path)
            .map(|v| v.len())
            .unwrap_or(0);
        info!(
            "  {} {:?}: {} records ({} KB)",
            "✓",
            path.file_name().unwrap_or_default(),
            count,
            size_kb
        );
    }
    Ok(())
}

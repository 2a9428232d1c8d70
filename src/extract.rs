//! Extraction drivers.
//!
//! Each driver validates its request, runs the external export tool over a scratch
//! directory, parses the produced record files and returns every address occurrence.
//! The export step is all-or-nothing: a non-zero exit or timeout aborts the driver call.
//! Parsing is best-effort: bad rows and missing files contribute nothing.

use crate::config::{ExtractionConfig, PipelineConfig};
use crate::ethereum::{normalize_address, normalize_event_signature};
use crate::parsers::{
    BitcoinTransactionRow, LogRow, ParseMode, ParseStats, RecordParser, RowReader, TokenTransferRow,
    TransactionRow,
};
use crate::schemas::{AddressOccurrence, AddressRole, Chain, Metadata, SourceSystem};
use async_trait::async_trait;
use chrono::NaiveDate;
use polars::prelude::*;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Bytes of tool stderr kept in a failure message
const STDERR_TAIL_BYTES: usize = 2000;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to start extraction tool: {0}")]
    ToolSpawn(String),

    #[error("Extraction tool {dataset} export exited with {status}: {stderr}")]
    ToolFailed {
        dataset: ExportDataset,
        status: String,
        stderr: String,
    },

    #[error("Extraction tool {dataset} export timed out after {timeout:?}")]
    ToolTimeout {
        dataset: ExportDataset,
        timeout: Duration,
    },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),
}

impl ExtractError {
    /// Failures of the external tool itself, as opposed to configuration problems
    pub fn is_tool_failure(&self) -> bool {
        matches!(
            self,
            ExtractError::ToolSpawn(_)
                | ExtractError::ToolFailed { .. }
                | ExtractError::ToolTimeout { .. }
        )
    }
}

// ============================================================================
// Export tool contract
// ============================================================================

/// Range handed to the export tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportScope {
    Blocks { start: u64, end: u64 },
    Dates { start: NaiveDate, end: NaiveDate },
}

impl std::fmt::Display for ExportScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportScope::Blocks { start, end } => write!(f, "blocks {}-{}", start, end),
            ExportScope::Dates { start, end } => write!(f, "dates {} to {}", start, end),
        }
    }
}

/// Record category produced by one export invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportDataset {
    Transactions,
    TokenTransfers,
    Logs,
    BitcoinTransactions,
}

impl ExportDataset {
    pub fn subcommand(&self) -> &'static str {
        match self {
            ExportDataset::Transactions => "export_transactions",
            ExportDataset::TokenTransfers => "export_token_transfers",
            ExportDataset::Logs => "export_logs",
            ExportDataset::BitcoinTransactions => "export_transactions",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            ExportDataset::Transactions => "transactions.csv",
            ExportDataset::TokenTransfers => "token_transfers.csv",
            ExportDataset::Logs => "logs.csv",
            ExportDataset::BitcoinTransactions => "btc_transactions.csv",
        }
    }
}

impl std::fmt::Display for ExportDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExportDataset::Transactions => "transactions",
            ExportDataset::TokenTransfers => "token_transfers",
            ExportDataset::Logs => "logs",
            ExportDataset::BitcoinTransactions => "bitcoin_transactions",
        };
        f.write_str(s)
    }
}

/// One invocation of the export tool
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub chain: Chain,
    pub provider_uri: String,
    pub scope: ExportScope,
    pub dataset: ExportDataset,
    pub output: PathBuf,
    pub timeout: Duration,
}

/// External command-line tool that writes record files for a scope.
#[async_trait]
pub trait ExportTool: Send + Sync {
    /// Run one export; any failure is fatal for the calling driver.
    async fn run(&self, job: &ExportJob) -> Result<(), ExtractError>;
}

/// Export tool invoked as a subprocess
#[derive(Debug, Clone)]
pub struct CommandExportTool {
    evm_tool: String,
    utxo_tool: String,
    batch_size: usize,
}

impl CommandExportTool {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            evm_tool: config.evm_tool.clone(),
            utxo_tool: config.utxo_tool.clone(),
            batch_size: config.batch_size.max(1),
        }
    }

    pub fn program(&self, chain: Chain) -> &str {
        if chain.is_utxo() {
            &self.utxo_tool
        } else {
            &self.evm_tool
        }
    }

    pub fn command_args(&self, job: &ExportJob) -> Vec<String> {
        let mut args = vec![job.dataset.subcommand().to_string()];
        match job.scope {
            ExportScope::Blocks { start, end } => {
                args.extend([
                    "--start-block".to_string(),
                    start.to_string(),
                    "--end-block".to_string(),
                    end.to_string(),
                ]);
            }
            ExportScope::Dates { start, end } => {
                args.extend([
                    "--start-date".to_string(),
                    start.format("%Y-%m-%d").to_string(),
                    "--end-date".to_string(),
                    end.format("%Y-%m-%d").to_string(),
                ]);
            }
        }
        args.extend([
            "--provider-uri".to_string(),
            job.provider_uri.clone(),
            "--batch-size".to_string(),
            self.batch_size.to_string(),
            "--output".to_string(),
            job.output.display().to_string(),
        ]);
        args
    }
}

#[async_trait]
impl ExportTool for CommandExportTool {
    async fn run(&self, job: &ExportJob) -> Result<(), ExtractError> {
        let program = self.program(job.chain);
        let args = self.command_args(job);

        info!(
            "Running {} {} for {} ({}), timeout {:?}",
            program, job.dataset, job.chain, job.scope, job.timeout
        );

        let child = Command::new(program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExtractError::ToolSpawn(format!("{}: {}", program, e)))?;

        // On timeout the child is dropped, which kills it.
        let output = match tokio::time::timeout(job.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ExtractError::ToolTimeout {
                    dataset: job.dataset,
                    timeout: job.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(ExtractError::ToolFailed {
                dataset: job.dataset,
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            });
        }

        debug!("{} export finished: {:?}", job.dataset, job.output);
        Ok(())
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

// ============================================================================
// Working directory
// ============================================================================

/// Scratch directory for one driver call.
///
/// A directory the driver created is removed when this value drops, on every exit path.
/// A caller-supplied directory is left in place.
enum WorkDir {
    Owned(TempDir),
    Supplied(PathBuf),
}

impl WorkDir {
    fn acquire(supplied: Option<&Path>) -> Result<Self, ExtractError> {
        match supplied {
            Some(path) => {
                std::fs::create_dir_all(path)?;
                Ok(WorkDir::Supplied(path.to_path_buf()))
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("address-intel-")
                    .tempdir()?;
                Ok(WorkDir::Owned(dir))
            }
        }
    }

    fn path(&self) -> &Path {
        match self {
            WorkDir::Owned(dir) => dir.path(),
            WorkDir::Supplied(path) => path,
        }
    }
}

// ============================================================================
// Drivers
// ============================================================================

/// Runs export-and-parse extractions for the configured chains
pub struct Extractor {
    node_providers: BTreeMap<Chain, String>,
    settings: ExtractionConfig,
    tool: Arc<dyn ExportTool>,
}

impl Extractor {
    pub fn new(config: &PipelineConfig) -> Self {
        let tool = Arc::new(CommandExportTool::new(&config.extraction));
        Self::with_tool(config, tool)
    }

    pub fn with_tool(config: &PipelineConfig, tool: Arc<dyn ExportTool>) -> Self {
        Self {
            node_providers: config.node_providers.clone(),
            settings: config.extraction.clone(),
            tool,
        }
    }

    fn provider_uri(&self, chain: Chain) -> Result<&str, ExtractError> {
        self.node_providers
            .get(&chain)
            .map(String::as_str)
            .filter(|uri| !uri.trim().is_empty())
            .ok_or_else(|| {
                ExtractError::Configuration(format!(
                    "no node-provider endpoint configured for {}",
                    chain
                ))
            })
    }

    /// Transactions, token transfers and logs for a block range.
    pub async fn extract_block_range(
        &self,
        chain: Chain,
        start_block: u64,
        end_block: u64,
        work_dir: Option<&Path>,
    ) -> Result<Vec<AddressOccurrence>, ExtractError> {
        let parser = RecordParser::new(chain, SourceSystem::EvmBlockExport, ParseMode::Plain);
        self.run_evm(
            &parser,
            start_block,
            end_block,
            &[
                ExportDataset::Transactions,
                ExportDataset::TokenTransfers,
                ExportDataset::Logs,
            ],
            work_dir,
        )
        .await
    }

    /// Transactions and logs touching one contract.
    pub async fn extract_contract_interactions(
        &self,
        chain: Chain,
        contract: &str,
        start_block: u64,
        end_block: u64,
        work_dir: Option<&Path>,
    ) -> Result<Vec<AddressOccurrence>, ExtractError> {
        let contract = normalize_address(contract, chain)
            .map_err(|e| ExtractError::InvalidRequest(e.to_string()))?;
        let parser = RecordParser::new(
            chain,
            SourceSystem::ContractExport,
            ParseMode::contract(&contract),
        );
        self.run_evm(
            &parser,
            start_block,
            end_block,
            &[ExportDataset::Transactions, ExportDataset::Logs],
            work_dir,
        )
        .await
    }

    /// Logs carrying one event signature, optionally from one contract.
    pub async fn extract_custom_event(
        &self,
        chain: Chain,
        event_signature: &str,
        contract: Option<&str>,
        start_block: u64,
        end_block: u64,
        work_dir: Option<&Path>,
    ) -> Result<Vec<AddressOccurrence>, ExtractError> {
        let signature = normalize_event_signature(event_signature)
            .map_err(|e| ExtractError::InvalidRequest(e.to_string()))?;
        let contract = contract
            .map(|c| normalize_address(c, chain))
            .transpose()
            .map_err(|e| ExtractError::InvalidRequest(e.to_string()))?;
        let parser = RecordParser::new(
            chain,
            SourceSystem::EventExport,
            ParseMode::event(&signature, contract.as_deref()),
        );
        self.run_evm(
            &parser,
            start_block,
            end_block,
            &[ExportDataset::Logs],
            work_dir,
        )
        .await
    }

    /// Inputs and outputs of every transaction in a UTXO-chain date range.
    pub async fn extract_date_range(
        &self,
        chain: Chain,
        start_date: NaiveDate,
        end_date: NaiveDate,
        work_dir: Option<&Path>,
    ) -> Result<Vec<AddressOccurrence>, ExtractError> {
        let provider_uri = self.provider_uri(chain)?.to_string();
        if !chain.is_utxo() {
            return Err(ExtractError::InvalidRequest(format!(
                "date-range extraction needs a UTXO chain, got {}",
                chain
            )));
        }
        if start_date > end_date {
            return Err(ExtractError::InvalidRequest(format!(
                "start date {} is after end date {}",
                start_date, end_date
            )));
        }

        let days = (end_date - start_date).num_days().unsigned_abs() + 1;
        let scope = ExportScope::Dates {
            start: start_date,
            end: end_date,
        };
        let timeout = self.settings.date_timeout(days);
        let parser = RecordParser::new(chain, SourceSystem::UtxoDateExport, ParseMode::Plain);

        let dir = WorkDir::acquire(work_dir)?;
        self.run_and_parse(
            &parser,
            &provider_uri,
            scope,
            timeout,
            &[ExportDataset::BitcoinTransactions],
            dir.path(),
        )
        .await
    }

    async fn run_evm(
        &self,
        parser: &RecordParser,
        start_block: u64,
        end_block: u64,
        datasets: &[ExportDataset],
        work_dir: Option<&Path>,
    ) -> Result<Vec<AddressOccurrence>, ExtractError> {
        let chain = parser.chain();
        let provider_uri = self.provider_uri(chain)?.to_string();
        if chain.is_utxo() {
            return Err(ExtractError::InvalidRequest(format!(
                "block-range extraction needs an account-model chain, got {}",
                chain
            )));
        }
        if start_block > end_block {
            return Err(ExtractError::InvalidRequest(format!(
                "start block {} is after end block {}",
                start_block, end_block
            )));
        }

        let scope = ExportScope::Blocks {
            start: start_block,
            end: end_block,
        };
        let timeout = self.settings.block_timeout();

        let dir = WorkDir::acquire(work_dir)?;
        self.run_and_parse(parser, &provider_uri, scope, timeout, datasets, dir.path())
            .await
    }

    async fn run_and_parse(
        &self,
        parser: &RecordParser,
        provider_uri: &str,
        scope: ExportScope,
        timeout: Duration,
        datasets: &[ExportDataset],
        dir: &Path,
    ) -> Result<Vec<AddressOccurrence>, ExtractError> {
        let chain = parser.chain();
        info!(
            "Extracting {} for {} ({:?}) into {:?}",
            scope,
            chain,
            parser.mode(),
            dir
        );

        // Export everything first: a single failed export aborts the call.
        for dataset in datasets {
            let job = ExportJob {
                chain,
                provider_uri: provider_uri.to_string(),
                scope,
                dataset: *dataset,
                output: dir.join(dataset.file_name()),
                timeout,
            };
            self.tool.run(&job).await?;
        }

        let mut occurrences = Vec::new();
        for dataset in datasets {
            let path = dir.join(dataset.file_name());
            let before = occurrences.len();
            let stats = match dataset {
                ExportDataset::Transactions => {
                    parse_file::<TransactionRow, _>(&path, &mut occurrences, |rows| {
                        parser.transactions(rows).collect()
                    })
                }
                ExportDataset::TokenTransfers => {
                    parse_file::<TokenTransferRow, _>(&path, &mut occurrences, |rows| {
                        parser.token_transfers(rows).collect()
                    })
                }
                ExportDataset::Logs => parse_file::<LogRow, _>(&path, &mut occurrences, |rows| {
                    parser.logs(rows).collect()
                }),
                ExportDataset::BitcoinTransactions => {
                    parse_file::<BitcoinTransactionRow, _>(&path, &mut occurrences, |rows| {
                        parser.bitcoin_transactions(rows).collect()
                    })
                }
            };
            info!(
                "Parsed {}: {} rows, {} malformed, {} occurrences",
                dataset,
                stats.rows_parsed,
                stats.rows_malformed,
                occurrences.len() - before
            );
        }

        info!(
            "Extraction for {} ({}) produced {} occurrences",
            chain,
            scope,
            occurrences.len()
        );
        Ok(occurrences)
    }
}

/// Parse one record file, appending its occurrences.
fn parse_file<R, F>(path: &Path, out: &mut Vec<AddressOccurrence>, parse: F) -> ParseStats
where
    R: DeserializeOwned,
    F: FnOnce(&mut RowReader<R>) -> Vec<AddressOccurrence>,
{
    let mut rows = RowReader::<R>::open(path);
    out.extend(parse(&mut rows));
    let stats = rows.stats();
    if stats.rows_malformed > 0 {
        warn!(
            "{} malformed rows skipped in {:?}",
            stats.rows_malformed, path
        );
    }
    stats
}

// ============================================================================
// Occurrence output
// ============================================================================

/// Write occurrences to Parquet for downstream storage
pub fn write_occurrences_parquet(
    occurrences: &[AddressOccurrence],
    output_path: &Path,
) -> Result<(), ExtractError> {
    info!(
        "Writing {} occurrences to {:?}",
        occurrences.len(),
        output_path
    );

    let addresses: Vec<&str> = occurrences.iter().map(|o| o.address.as_str()).collect();
    let roles: Vec<String> = occurrences.iter().map(|o| o.role.to_string()).collect();
    let chains: Vec<&str> = occurrences.iter().map(|o| o.blockchain.as_str()).collect();
    let sources: Vec<String> = occurrences
        .iter()
        .map(|o| o.source_system.to_string())
        .collect();
    let metadata: Vec<String> = occurrences
        .iter()
        .map(|o| serde_json::to_string(&o.metadata).unwrap_or_else(|_| "{}".to_string()))
        .collect();

    let mut df = DataFrame::new(vec![
        Column::new("address".into(), addresses),
        Column::new("role".into(), roles),
        Column::new("blockchain".into(), chains),
        Column::new("source_system".into(), sources),
        Column::new("metadata".into(), metadata),
    ])?;

    let file = std::fs::File::create(output_path)?;
    ParquetWriter::new(file)
        .with_compression(ParquetCompression::Zstd(None))
        .finish(&mut df)?;

    info!("Successfully wrote occurrences to {:?}", output_path);
    Ok(())
}

/// Read occurrences back from Parquet
pub fn read_occurrences_parquet(path: &Path) -> Result<Vec<AddressOccurrence>, ExtractError> {
    let file = std::fs::File::open(path)?;
    let df = ParquetReader::new(file).finish()?;

    let addresses = df.column("address")?.str()?;
    let roles = df.column("role")?.str()?;
    let chains = df.column("blockchain")?.str()?;
    let sources = df.column("source_system")?.str()?;
    let metadata = df.column("metadata")?.str()?;

    let mut result = Vec::with_capacity(df.height());

    for i in 0..df.height() {
        result.push(AddressOccurrence {
            address: addresses.get(i).unwrap_or_default().to_string(),
            role: parse_label::<AddressRole>(roles.get(i).unwrap_or_default())?,
            blockchain: parse_label::<Chain>(chains.get(i).unwrap_or_default())?,
            source_system: parse_label::<SourceSystem>(sources.get(i).unwrap_or_default())?,
            metadata: serde_json::from_str::<Metadata>(metadata.get(i).unwrap_or("{}"))
                .unwrap_or_default(),
        });
    }

    Ok(result)
}

fn parse_label<T: DeserializeOwned>(value: &str) -> Result<T, ExtractError> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| ExtractError::InvalidData(format!("unrecognized value {:?}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const TX_CSV: &str = "from_address,to_address,value,block_number,hash\n\
                          0xCAFE,0xBEEF,1,10,0x01\n\
                          0xBEEF,0xD00D,2,11,0x02\n\
                          0xAAAA,,0,12,0x03\n";
    const TOKEN_CSV: &str =
        "from_address,to_address,token_address,value,block_number,transaction_hash\n\
         0xAAAA,0xBBBB,0xT0KE,5,10,0x04\n";
    const LOG_CSV: &str = "address,topic0,topic1,topic2,topic3,block_number,transaction_hash,log_index\n\
         0xBEEF,0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef,0x000000000000000000000000cafecafecafecafecafecafecafecafecafecafe,,,10,0x01,0\n\
         0xF00D,0xdead,,,,11,0x05,1\n";
    const BTC_CSV: &str = "hash,block_number,inputs,outputs\n\
         aa,1,\"[{\"\"addresses\"\":[\"\"bc1qin\"\"],\"\"value\"\":2}]\",\"[{\"\"addresses\"\":[\"\"bc1qout\"\"],\"\"value\"\":1}]\"\n";

    const TRANSFER_SIG: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

    const CONTRACT: &str = "0xbeef000000000000000000000000000000000000";
    const CALLER: &str = "0xcafe000000000000000000000000000000000000";
    const PAYEE: &str = "0xd00d000000000000000000000000000000000000";

    // call into the contract, payout from it, and one unrelated transfer
    const CONTRACT_TX_CSV: &str = "from_address,to_address,value,block_number,hash\n\
         0xCAFE000000000000000000000000000000000000,0xBEEF000000000000000000000000000000000000,1,10,0x01\n\
         0xBEEF000000000000000000000000000000000000,0xD00D000000000000000000000000000000000000,2,11,0x02\n\
         0xAAAA000000000000000000000000000000000000,0xBBBB000000000000000000000000000000000000,3,12,0x03\n";
    const CONTRACT_LOG_CSV: &str = "address,topic0,topic1,topic2,topic3,block_number,transaction_hash,log_index\n\
         0xBEEF000000000000000000000000000000000000,0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef,0x000000000000000000000000cafe000000000000000000000000000000000000,,,10,0x01,0\n\
         0xF00D000000000000000000000000000000000000,0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef,0x000000000000000000000000aaaa000000000000000000000000000000000000,,,12,0x03,1\n";

    /// Writes canned CSV for each dataset and records every job
    #[derive(Default)]
    struct FakeTool {
        jobs: Mutex<Vec<ExportJob>>,
        fail_on: Option<ExportDataset>,
        time_out_on: Option<ExportDataset>,
        skip_output: bool,
        contract_fixture: bool,
    }

    #[async_trait]
    impl ExportTool for FakeTool {
        async fn run(&self, job: &ExportJob) -> Result<(), ExtractError> {
            self.jobs.lock().unwrap().push(job.clone());
            if self.fail_on == Some(job.dataset) {
                return Err(ExtractError::ToolFailed {
                    dataset: job.dataset,
                    status: "exit status: 1".to_string(),
                    stderr: "boom".to_string(),
                });
            }
            if self.time_out_on == Some(job.dataset) {
                return Err(ExtractError::ToolTimeout {
                    dataset: job.dataset,
                    timeout: job.timeout,
                });
            }
            if self.skip_output {
                return Ok(());
            }
            let body = match job.dataset {
                ExportDataset::Transactions if self.contract_fixture => CONTRACT_TX_CSV,
                ExportDataset::Logs if self.contract_fixture => CONTRACT_LOG_CSV,
                ExportDataset::Transactions => TX_CSV,
                ExportDataset::TokenTransfers => TOKEN_CSV,
                ExportDataset::Logs => LOG_CSV,
                ExportDataset::BitcoinTransactions => BTC_CSV,
            };
            std::fs::write(&job.output, body)?;
            Ok(())
        }
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config
            .node_providers
            .insert(Chain::Ethereum, "https://eth.example".to_string());
        config
            .node_providers
            .insert(Chain::Bitcoin, "http://btc.example".to_string());
        config
    }

    fn extractor(tool: Arc<FakeTool>) -> Extractor {
        Extractor::with_tool(&config(), tool)
    }

    fn count(occ: &[AddressOccurrence], role: AddressRole) -> usize {
        occ.iter().filter(|o| o.role == role).count()
    }

    #[tokio::test]
    async fn test_block_range_runs_all_datasets() {
        let tool = Arc::new(FakeTool::default());
        let occ = extractor(tool.clone())
            .extract_block_range(Chain::Ethereum, 10, 12, None)
            .await
            .unwrap();

        // 3 senders + 2 recipients, 3 token roles, 2 emitters + 1 participant
        assert_eq!(occ.len(), 11);
        assert_eq!(count(&occ, AddressRole::Sender), 4);
        assert_eq!(count(&occ, AddressRole::TokenContract), 1);
        assert_eq!(count(&occ, AddressRole::EventIndexedParticipant), 1);
        assert!(occ.iter().all(|o| o.source_system == SourceSystem::EvmBlockExport));

        let jobs = tool.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].scope, ExportScope::Blocks { start: 10, end: 12 });
        assert_eq!(jobs[0].provider_uri, "https://eth.example");
        assert_eq!(jobs[0].timeout, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_configuration_error() {
        let tool = Arc::new(FakeTool::default());
        let err = extractor(tool.clone())
            .extract_block_range(Chain::Polygon, 1, 2, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Configuration(_)));
        assert!(tool.jobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inverted_range_is_rejected() {
        let tool = Arc::new(FakeTool::default());
        let err = extractor(tool)
            .extract_block_range(Chain::Ethereum, 20, 10, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_tool_failure_aborts_and_removes_scratch_dir() {
        let tool = Arc::new(FakeTool {
            fail_on: Some(ExportDataset::TokenTransfers),
            ..Default::default()
        });
        let err = extractor(tool.clone())
            .extract_block_range(Chain::Ethereum, 1, 2, None)
            .await
            .unwrap_err();
        assert!(err.is_tool_failure());

        let jobs = tool.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 2);
        let scratch = jobs[0].output.parent().unwrap().to_path_buf();
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn test_timeout_aborts_and_removes_scratch_dir() {
        let tool = Arc::new(FakeTool {
            time_out_on: Some(ExportDataset::Transactions),
            ..Default::default()
        });
        let err = extractor(tool.clone())
            .extract_block_range(Chain::Ethereum, 1, 2, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractError::ToolTimeout {
                dataset: ExportDataset::Transactions,
                ..
            }
        ));

        let jobs = tool.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        let scratch = jobs[0].output.parent().unwrap().to_path_buf();
        assert!(!scratch.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_export_command_times_out() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-export");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = config();
        config.extraction.evm_tool = script.display().to_string();
        config.extraction.block_timeout_secs = 1;

        let started = std::time::Instant::now();
        let err = Extractor::new(&config)
            .extract_block_range(Chain::Ethereum, 1, 2, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractError::ToolTimeout {
                dataset: ExportDataset::Transactions,
                ..
            }
        ));
        assert!(err.is_tool_failure());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_supplied_work_dir_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("run");
        let tool = Arc::new(FakeTool::default());
        extractor(tool)
            .extract_block_range(Chain::Ethereum, 1, 2, Some(&work))
            .await
            .unwrap();
        assert!(work.join("transactions.csv").exists());
    }

    #[tokio::test]
    async fn test_empty_output_is_not_an_error() {
        let tool = Arc::new(FakeTool {
            skip_output: true,
            ..Default::default()
        });
        let occ = extractor(tool)
            .extract_block_range(Chain::Ethereum, 1, 2, None)
            .await
            .unwrap();
        assert!(occ.is_empty());
    }

    #[tokio::test]
    async fn test_contract_interactions() {
        let tool = Arc::new(FakeTool {
            contract_fixture: true,
            ..Default::default()
        });
        let occ = extractor(tool.clone())
            .extract_contract_interactions(Chain::Ethereum, &CONTRACT.to_uppercase().replacen("0X", "0x", 1), 10, 12, None)
            .await
            .unwrap();

        let callers: Vec<_> = occ.iter().filter(|o| o.role == AddressRole::ContractCaller).collect();
        assert_eq!(callers.len(), 1);
        assert_eq!(callers[0].address, CALLER);

        let recipients: Vec<_> = occ
            .iter()
            .filter(|o| o.role == AddressRole::ContractRecipient)
            .collect();
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].address, PAYEE);

        // only the log emitted by the contract survives
        let emitters: Vec<_> = occ.iter().filter(|o| o.role == AddressRole::EventEmitter).collect();
        assert_eq!(emitters.len(), 1);
        assert_eq!(emitters[0].address, CONTRACT);
        let participants: Vec<_> = occ
            .iter()
            .filter(|o| o.role == AddressRole::EventIndexedParticipant)
            .collect();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].address, CALLER);

        assert_eq!(occ.len(), 4);
        assert!(occ.iter().all(|o| o.source_system == SourceSystem::ContractExport));
        assert!(occ.iter().all(|o| !o.address.starts_with("0xaaaa")));

        let datasets: Vec<_> = tool.jobs.lock().unwrap().iter().map(|j| j.dataset).collect();
        assert_eq!(datasets, vec![ExportDataset::Transactions, ExportDataset::Logs]);
    }

    #[tokio::test]
    async fn test_contract_interactions_rejects_bad_address() {
        let tool = Arc::new(FakeTool::default());
        let err = extractor(tool)
            .extract_contract_interactions(Chain::Ethereum, "0xBEEF", 10, 12, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_custom_event() {
        let tool = Arc::new(FakeTool::default());
        let occ = extractor(tool.clone())
            .extract_custom_event(Chain::Ethereum, &TRANSFER_SIG.to_uppercase().replacen("0X", "0x", 1), None, 10, 12, None)
            .await
            .unwrap();
        assert_eq!(occ.len(), 2);
        assert_eq!(occ[0].role, AddressRole::EventEmitter);
        assert_eq!(occ[0].address, "0xbeef");
        assert_eq!(occ[1].address, "0xcafecafecafecafecafecafecafecafecafecafe");
        assert!(occ.iter().all(|o| o.source_system == SourceSystem::EventExport));
        assert_eq!(tool.jobs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_date_range_bitcoin() {
        let tool = Arc::new(FakeTool::default());
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        let occ = extractor(tool.clone())
            .extract_date_range(Chain::Bitcoin, start, end, None)
            .await
            .unwrap();
        assert_eq!(occ.len(), 2);
        assert_eq!(occ[0].role, AddressRole::UtxoInput);
        assert_eq!(occ[1].role, AddressRole::UtxoOutput);

        let jobs = tool.jobs.lock().unwrap();
        assert_eq!(jobs[0].scope, ExportScope::Dates { start, end });
        assert_eq!(jobs[0].timeout, Duration::from_secs(1200));
    }

    #[tokio::test]
    async fn test_date_range_requires_utxo_chain() {
        let tool = Arc::new(FakeTool::default());
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let err = extractor(tool)
            .extract_date_range(Chain::Ethereum, day, day, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidRequest(_)));
    }

    #[test]
    fn test_command_args() {
        let tool = CommandExportTool::new(&ExtractionConfig::default());
        let job = ExportJob {
            chain: Chain::Ethereum,
            provider_uri: "https://eth.example".to_string(),
            scope: ExportScope::Blocks { start: 1, end: 5 },
            dataset: ExportDataset::Logs,
            output: PathBuf::from("/tmp/logs.csv"),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(tool.program(Chain::Ethereum), "ethereumetl");
        assert_eq!(tool.program(Chain::Bitcoin), "bitcoinetl");
        assert_eq!(
            tool.command_args(&job),
            vec![
                "export_logs",
                "--start-block",
                "1",
                "--end-block",
                "5",
                "--provider-uri",
                "https://eth.example",
                "--batch-size",
                "100",
                "--output",
                "/tmp/logs.csv",
            ]
        );
    }

    #[tokio::test]
    async fn test_command_tool_nonzero_exit() {
        let settings = ExtractionConfig {
            evm_tool: "false".to_string(),
            ..Default::default()
        };
        let tool = CommandExportTool::new(&settings);
        let job = ExportJob {
            chain: Chain::Ethereum,
            provider_uri: "x".to_string(),
            scope: ExportScope::Blocks { start: 1, end: 1 },
            dataset: ExportDataset::Transactions,
            output: PathBuf::from("/tmp/unused.csv"),
            timeout: Duration::from_secs(30),
        };
        let err = tool.run(&job).await.unwrap_err();
        assert!(matches!(err, ExtractError::ToolFailed { .. }));
    }

    #[tokio::test]
    async fn test_command_tool_missing_binary() {
        let settings = ExtractionConfig {
            evm_tool: "/nonexistent/export-tool".to_string(),
            ..Default::default()
        };
        let tool = CommandExportTool::new(&settings);
        let job = ExportJob {
            chain: Chain::Ethereum,
            provider_uri: "x".to_string(),
            scope: ExportScope::Blocks { start: 1, end: 1 },
            dataset: ExportDataset::Transactions,
            output: PathBuf::from("/tmp/unused.csv"),
            timeout: Duration::from_secs(30),
        };
        let err = tool.run(&job).await.unwrap_err();
        assert!(matches!(err, ExtractError::ToolSpawn(_)));
    }

    #[test]
    fn test_stderr_tail_truncates() {
        let long = "x".repeat(STDERR_TAIL_BYTES + 50);
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.starts_with("..."));
        assert_eq!(tail.len(), STDERR_TAIL_BYTES + 3);
    }

    #[test]
    fn test_occurrences_parquet_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("occurrences.parquet");
        let mut metadata = Metadata::new();
        metadata.insert("block_number".to_string(), serde_json::Value::from(7u64));
        let occ = vec![AddressOccurrence {
            address: "0xabc".to_string(),
            role: AddressRole::EventIndexedParticipant,
            blockchain: Chain::Arbitrum,
            source_system: SourceSystem::EventExport,
            metadata,
        }];
        write_occurrences_parquet(&occ, &path).unwrap();
        assert_eq!(read_occurrences_parquet(&path).unwrap(), occ);
    }
}

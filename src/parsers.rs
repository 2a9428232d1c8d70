//! Record parsers: tabular chain records in, address occurrences out.
//!
//! Each record category has a row type matching the extraction tool's column schema.
//! Rows are read lazily from CSV files; a row that fails to deserialize is logged and
//! skipped, and a file that cannot be opened yields no rows. Parsing never aborts an
//! extraction because of a single bad record.

use crate::ethereum::{clean_address_field, clean_hex_field, decode_topic_address, is_zero_address};
use crate::schemas::{AddressOccurrence, AddressRole, Chain, Metadata, SourceSystem};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::io::Read;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// ============================================================================
// Row types
// ============================================================================

/// `from_address, to_address, value, block_number, hash`
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionRow {
    pub from_address: String,
    /// Absent for contract-creation transactions
    #[serde(default)]
    pub to_address: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub block_number: Option<u64>,
    pub hash: String,
}

/// `from_address, to_address, token_address, value, block_number, transaction_hash`
#[derive(Debug, Clone, Deserialize)]
pub struct TokenTransferRow {
    pub from_address: String,
    pub to_address: String,
    pub token_address: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub block_number: Option<u64>,
    pub transaction_hash: String,
    #[serde(default)]
    pub log_index: Option<u64>,
}

/// `address, topic0..topic3, block_number, transaction_hash, log_index`
#[derive(Debug, Clone, Deserialize)]
pub struct LogRow {
    pub address: String,
    #[serde(default)]
    pub topic0: Option<String>,
    #[serde(default)]
    pub topic1: Option<String>,
    #[serde(default)]
    pub topic2: Option<String>,
    #[serde(default)]
    pub topic3: Option<String>,
    #[serde(default)]
    pub block_number: Option<u64>,
    pub transaction_hash: String,
    #[serde(default)]
    pub log_index: Option<u64>,
}

impl LogRow {
    /// Indexed topic slots 1..=3 with their position
    fn indexed_topics(&self) -> [(u8, Option<&str>); 3] {
        [
            (1, self.topic1.as_deref()),
            (2, self.topic2.as_deref()),
            (3, self.topic3.as_deref()),
        ]
    }
}

/// `inputs, outputs, block_number, hash`
///
/// `inputs` and `outputs` are JSON-encoded lists of `{addresses: [...], value}`.
#[derive(Debug, Clone, Deserialize)]
pub struct BitcoinTransactionRow {
    #[serde(default)]
    pub inputs: String,
    #[serde(default)]
    pub outputs: String,
    #[serde(default)]
    pub block_number: Option<u64>,
    pub hash: String,
}

/// One embedded input or output of a UTXO transaction
#[derive(Debug, Clone, Deserialize)]
struct UtxoEntry {
    #[serde(default)]
    addresses: Vec<String>,
    #[serde(default)]
    value: Option<Value>,
}

// ============================================================================
// Parsing modes
// ============================================================================

/// Row filter applied while parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseMode {
    /// Every row yields occurrences
    Plain,
    /// Only rows touching one contract
    Contract { contract: String },
    /// Only logs whose topic0 equals `signature`, optionally from one contract
    Event {
        signature: String,
        contract: Option<String>,
    },
}

impl ParseMode {
    pub fn contract(contract: &str) -> Self {
        Self::Contract {
            contract: contract.trim().to_lowercase(),
        }
    }

    pub fn event(signature: &str, contract: Option<&str>) -> Self {
        Self::Event {
            signature: signature.trim().to_lowercase(),
            contract: contract.map(|c| c.trim().to_lowercase()),
        }
    }
}

// ============================================================================
// Row reading
// ============================================================================

/// Per-file parse counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub rows_parsed: usize,
    pub rows_malformed: usize,
}

/// Lazy CSV row iterator that skips malformed rows.
pub struct RowReader<R> {
    source: PathBuf,
    records: Option<csv::StringRecordsIntoIter<Box<dyn Read>>>,
    headers: csv::StringRecord,
    rows_parsed: usize,
    rows_malformed: usize,
    _row: PhantomData<R>,
}

impl<R: DeserializeOwned> RowReader<R> {
    /// Open `path`; a missing or unreadable file yields an empty reader.
    pub fn open(path: &Path) -> Self {
        match std::fs::File::open(path) {
            Ok(file) => Self::from_reader(path.to_path_buf(), Box::new(file)),
            Err(e) => {
                warn!("Cannot open record file {:?}: {}; treating as empty", path, e);
                Self::empty(path.to_path_buf())
            }
        }
    }

    pub fn from_reader(source: PathBuf, reader: Box<dyn Read>) -> Self {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = match csv_reader.headers() {
            Ok(h) => h.clone(),
            Err(e) => {
                warn!("Cannot read header row of {:?}: {}; treating as empty", source, e);
                return Self::empty(source);
            }
        };

        Self {
            source,
            records: Some(csv_reader.into_records()),
            headers,
            rows_parsed: 0,
            rows_malformed: 0,
            _row: PhantomData,
        }
    }

    fn empty(source: PathBuf) -> Self {
        Self {
            source,
            records: None,
            headers: csv::StringRecord::new(),
            rows_parsed: 0,
            rows_malformed: 0,
            _row: PhantomData,
        }
    }

    pub fn stats(&self) -> ParseStats {
        ParseStats {
            rows_parsed: self.rows_parsed,
            rows_malformed: self.rows_malformed,
        }
    }
}

impl<R: DeserializeOwned> Iterator for RowReader<R> {
    type Item = R;

    fn next(&mut self) -> Option<R> {
        loop {
            let records = self.records.as_mut()?;
            let record = match records.next()? {
                Ok(record) => record,
                Err(e) if e.is_io_error() => {
                    warn!("I/O error reading {:?}: {}; stopping this file", self.source, e);
                    self.records = None;
                    return None;
                }
                Err(e) => {
                    self.rows_malformed += 1;
                    warn!("Skipping unreadable row in {:?}: {}", self.source, e);
                    continue;
                }
            };

            match record.deserialize::<R>(Some(&self.headers)) {
                Ok(row) => {
                    self.rows_parsed += 1;
                    return Some(row);
                }
                Err(e) => {
                    self.rows_malformed += 1;
                    let line = record.position().map(|p| p.line()).unwrap_or(0);
                    warn!(
                        "Skipping malformed row at {:?} line {}: {}",
                        self.source, line, e
                    );
                }
            }
        }
    }
}

// ============================================================================
// Parsers
// ============================================================================

/// Shared context for turning rows into occurrences
#[derive(Debug, Clone)]
pub struct RecordParser {
    chain: Chain,
    source_system: SourceSystem,
    mode: ParseMode,
}

impl RecordParser {
    pub fn new(chain: Chain, source_system: SourceSystem, mode: ParseMode) -> Self {
        Self {
            chain,
            source_system,
            mode,
        }
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn mode(&self) -> &ParseMode {
        &self.mode
    }

    fn occurrence(&self, address: String, role: AddressRole, metadata: Metadata) -> AddressOccurrence {
        AddressOccurrence {
            address,
            role,
            blockchain: self.chain,
            source_system: self.source_system,
            metadata,
        }
    }

    /// Lazily parse transaction rows.
    pub fn transactions<'a, I>(&'a self, rows: I) -> impl Iterator<Item = AddressOccurrence> + 'a
    where
        I: IntoIterator<Item = TransactionRow>,
        I::IntoIter: 'a,
    {
        rows.into_iter()
            .flat_map(move |row| self.transaction_occurrences(&row))
    }

    /// Lazily parse token transfer rows.
    pub fn token_transfers<'a, I>(&'a self, rows: I) -> impl Iterator<Item = AddressOccurrence> + 'a
    where
        I: IntoIterator<Item = TokenTransferRow>,
        I::IntoIter: 'a,
    {
        rows.into_iter()
            .flat_map(move |row| self.token_transfer_occurrences(&row))
    }

    /// Lazily parse log rows.
    pub fn logs<'a, I>(&'a self, rows: I) -> impl Iterator<Item = AddressOccurrence> + 'a
    where
        I: IntoIterator<Item = LogRow>,
        I::IntoIter: 'a,
    {
        rows.into_iter().flat_map(move |row| self.log_occurrences(&row))
    }

    /// Lazily parse UTXO transaction rows.
    pub fn bitcoin_transactions<'a, I>(&'a self, rows: I) -> impl Iterator<Item = AddressOccurrence> + 'a
    where
        I: IntoIterator<Item = BitcoinTransactionRow>,
        I::IntoIter: 'a,
    {
        rows.into_iter()
            .flat_map(move |row| self.bitcoin_occurrences(&row))
    }

    pub fn transaction_occurrences(&self, row: &TransactionRow) -> Vec<AddressOccurrence> {
        let Some(from) = clean_address_field(Some(&row.from_address)) else {
            debug!("Transaction {} has no sender, skipping", row.hash);
            return Vec::new();
        };
        let to = clean_address_field(row.to_address.as_deref());
        let metadata = tx_metadata(row.block_number, &row.hash, row.value.as_deref());

        match &self.mode {
            ParseMode::Contract { contract } => {
                let mut out = Vec::new();
                if to.as_deref() == Some(contract.as_str()) {
                    out.push(self.occurrence(from.clone(), AddressRole::ContractCaller, metadata.clone()));
                }
                if from == *contract {
                    if let Some(to) = to {
                        out.push(self.occurrence(to, AddressRole::ContractRecipient, metadata));
                    }
                }
                out
            }
            ParseMode::Plain | ParseMode::Event { .. } => {
                let mut out = vec![self.occurrence(from, AddressRole::Sender, metadata.clone())];
                if let Some(to) = to {
                    out.push(self.occurrence(to, AddressRole::Recipient, metadata));
                }
                out
            }
        }
    }

    /// Token transfers are never mode-filtered; no filtered driver reads them.
    pub fn token_transfer_occurrences(&self, row: &TokenTransferRow) -> Vec<AddressOccurrence> {
        let token = clean_address_field(Some(&row.token_address));

        let mut metadata = tx_metadata(row.block_number, &row.transaction_hash, row.value.as_deref());
        if let Some(index) = row.log_index {
            metadata.insert("log_index".to_string(), Value::from(index));
        }
        if let Some(token) = &token {
            metadata.insert("token_address".to_string(), Value::from(token.as_str()));
        }

        let mut out = Vec::with_capacity(3);
        if let Some(from) = clean_address_field(Some(&row.from_address)) {
            out.push(self.occurrence(from, AddressRole::Sender, metadata.clone()));
        }
        if let Some(to) = clean_address_field(Some(&row.to_address)) {
            out.push(self.occurrence(to, AddressRole::Recipient, metadata.clone()));
        }
        if let Some(token) = token {
            out.push(self.occurrence(token, AddressRole::TokenContract, metadata));
        }
        out
    }

    pub fn log_occurrences(&self, row: &LogRow) -> Vec<AddressOccurrence> {
        let emitter = clean_address_field(Some(&row.address));
        let signature = clean_hex_field(row.topic0.as_deref());

        let keep = match &self.mode {
            ParseMode::Plain => true,
            ParseMode::Contract { contract } => emitter.as_deref() == Some(contract.as_str()),
            ParseMode::Event {
                signature: wanted,
                contract,
            } => {
                signature.as_deref() == Some(wanted.as_str())
                    && contract
                        .as_deref()
                        .map_or(true, |c| emitter.as_deref() == Some(c))
            }
        };
        if !keep {
            return Vec::new();
        }

        let mut metadata = Metadata::new();
        if let Some(block) = row.block_number {
            metadata.insert("block_number".to_string(), Value::from(block));
        }
        metadata.insert(
            "transaction_hash".to_string(),
            Value::from(row.transaction_hash.as_str()),
        );
        if let Some(index) = row.log_index {
            metadata.insert("log_index".to_string(), Value::from(index));
        }
        if let Some(sig) = &signature {
            metadata.insert("event_signature".to_string(), Value::from(sig.as_str()));
        }

        let mut out = Vec::with_capacity(4);
        if let Some(emitter) = emitter {
            out.push(self.occurrence(emitter, AddressRole::EventEmitter, metadata.clone()));
        }

        for (position, topic) in row.indexed_topics() {
            let Some(address) = topic.map(str::trim).and_then(decode_topic_address) else {
                continue;
            };
            let mut topic_meta = metadata.clone();
            topic_meta.insert("topic_position".to_string(), Value::from(position));
            // Mints and burns put the zero address in a topic.
            if is_zero_address(&address) {
                topic_meta.insert("zero_address".to_string(), Value::Bool(true));
            }
            out.push(self.occurrence(address, AddressRole::EventIndexedParticipant, topic_meta));
        }
        out
    }

    pub fn bitcoin_occurrences(&self, row: &BitcoinTransactionRow) -> Vec<AddressOccurrence> {
        let mut out = Vec::new();
        for (column, role) in [
            (&row.inputs, AddressRole::UtxoInput),
            (&row.outputs, AddressRole::UtxoOutput),
        ] {
            for (index, entry) in parse_utxo_entries(column, &row.hash, role) {
                let mut metadata = tx_metadata(row.block_number, &row.hash, None);
                metadata.insert("index".to_string(), Value::from(index));
                if let Some(value) = &entry.value {
                    metadata.insert("value".to_string(), value.clone());
                }
                for address in &entry.addresses {
                    let address = address.trim();
                    if address.is_empty() {
                        continue;
                    }
                    out.push(self.occurrence(address.to_string(), role, metadata.clone()));
                }
            }
        }
        out
    }
}

fn tx_metadata(block_number: Option<u64>, hash: &str, value: Option<&str>) -> Metadata {
    let mut metadata = Metadata::new();
    if let Some(block) = block_number {
        metadata.insert("block_number".to_string(), Value::from(block));
    }
    metadata.insert("transaction_hash".to_string(), Value::from(hash));
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        metadata.insert("value".to_string(), Value::from(value));
    }
    metadata
}

/// Decode an embedded input/output list, dropping malformed entries.
fn parse_utxo_entries(raw: &str, hash: &str, role: AddressRole) -> Vec<(usize, UtxoEntry)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }

    let items: Vec<Value> = match serde_json::from_str(raw) {
        Ok(items) => items,
        Err(e) => {
            warn!("Malformed {} list in transaction {}: {}", role, hash, e);
            return Vec::new();
        }
    };

    items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match serde_json::from_value::<UtxoEntry>(item) {
            Ok(entry) => Some((index, entry)),
            Err(e) => {
                warn!("Malformed {} #{} in transaction {}: {}", role, index, hash, e);
                None
            }
        })
        .collect()
}

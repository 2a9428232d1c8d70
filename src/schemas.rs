//! Data schemas for the address intelligence pipeline.
//!
//! This module is the canonical definition of every record that crosses a module
//! boundary: address occurrences produced by the extraction drivers, labels produced by
//! the provider adapters, and the enriched result served through the cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

/// Schema version for tracking changes
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Confidence reported when no provider returned a label.
///
/// This is a neutral prior, not a measured score. Callers must not read it as evidence.
pub const NEUTRAL_PRIOR_CONFIDENCE: f64 = 0.5;

/// Opaque key/value bag carried on occurrences and labels.
///
/// Never interpreted by the pipeline; its fields vary by record category.
pub type Metadata = BTreeMap<String, serde_json::Value>;

// ============================================================================
// Chains
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported chain: {0}")]
pub struct UnknownChain(pub String);

/// Chains the pipeline knows how to extract from and enrich.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Polygon,
    Arbitrum,
    Optimism,
    Base,
    Bsc,
    Avalanche,
    Bitcoin,
}

impl Chain {
    pub const ALL: [Chain; 8] = [
        Chain::Ethereum,
        Chain::Polygon,
        Chain::Arbitrum,
        Chain::Optimism,
        Chain::Base,
        Chain::Bsc,
        Chain::Avalanche,
        Chain::Bitcoin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Polygon => "polygon",
            Chain::Arbitrum => "arbitrum",
            Chain::Optimism => "optimism",
            Chain::Base => "base",
            Chain::Bsc => "bsc",
            Chain::Avalanche => "avalanche",
            Chain::Bitcoin => "bitcoin",
        }
    }

    /// UTXO chains carry provider-defined address strings instead of 20-byte accounts.
    pub fn is_utxo(&self) -> bool {
        matches!(self, Chain::Bitcoin)
    }

    pub fn is_evm(&self) -> bool {
        !self.is_utxo()
    }

    /// EIP-155 chain id, `None` for non-EVM chains.
    pub fn evm_chain_id(&self) -> Option<u64> {
        match self {
            Chain::Ethereum => Some(1),
            Chain::Polygon => Some(137),
            Chain::Arbitrum => Some(42161),
            Chain::Optimism => Some(10),
            Chain::Base => Some(8453),
            Chain::Bsc => Some(56),
            Chain::Avalanche => Some(43114),
            Chain::Bitcoin => None,
        }
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = UnknownChain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        match wanted.as_str() {
            "eth" | "mainnet" => return Ok(Chain::Ethereum),
            "matic" => return Ok(Chain::Polygon),
            "btc" => return Ok(Chain::Bitcoin),
            _ => {}
        }
        Chain::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| UnknownChain(s.to_string()))
    }
}

// ============================================================================
// PART A: Occurrence Schema
// ============================================================================

/// Role an address plays in the record it was observed in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AddressRole {
    Sender,
    Recipient,
    ContractCaller,
    ContractRecipient,
    EventEmitter,
    EventIndexedParticipant,
    TokenContract,
    UtxoInput,
    UtxoOutput,
}

impl std::fmt::Display for AddressRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AddressRole::Sender => "sender",
            AddressRole::Recipient => "recipient",
            AddressRole::ContractCaller => "contract_caller",
            AddressRole::ContractRecipient => "contract_recipient",
            AddressRole::EventEmitter => "event_emitter",
            AddressRole::EventIndexedParticipant => "event_indexed_participant",
            AddressRole::TokenContract => "token_contract",
            AddressRole::UtxoInput => "utxo_input",
            AddressRole::UtxoOutput => "utxo_output",
        };
        f.write_str(s)
    }
}

/// Provenance tag naming the extraction path that produced an occurrence
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceSystem {
    /// Full block-range export (transactions, token transfers, logs)
    EvmBlockExport,
    /// Block-range export filtered to one contract
    ContractExport,
    /// Block-range log export filtered to one event signature
    EventExport,
    /// Date-range export from a UTXO chain
    UtxoDateExport,
}

impl std::fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceSystem::EvmBlockExport => "evm_block_export",
            SourceSystem::ContractExport => "contract_export",
            SourceSystem::EventExport => "event_export",
            SourceSystem::UtxoDateExport => "utxo_date_export",
        };
        f.write_str(s)
    }
}

/// One observed appearance of an address in chain data.
///
/// Occurrences are never deduplicated: the same address may show up many times
/// under different roles or records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddressOccurrence {
    /// Normalized address (lowercase for account-model chains)
    pub address: String,

    pub role: AddressRole,

    pub blockchain: Chain,

    pub source_system: SourceSystem,

    /// Block number, transaction hash, log index, topic position, value...
    pub metadata: Metadata,
}

// ============================================================================
// PART B: Label Schema
// ============================================================================

/// Identity category a provider can assign to an address
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LabelType {
    Exchange,
    Dex,
    Bridge,
    MarketMaker,
    LendingProtocol,
    Validator,
    Scammer,
    MevBot,
    Contract,
    Personal,
    Whale,
    Unknown,
}

impl std::fmt::Display for LabelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LabelType::Exchange => "exchange",
            LabelType::Dex => "dex",
            LabelType::Bridge => "bridge",
            LabelType::MarketMaker => "market_maker",
            LabelType::LendingProtocol => "lending_protocol",
            LabelType::Validator => "validator",
            LabelType::Scammer => "scammer",
            LabelType::MevBot => "mev_bot",
            LabelType::Contract => "contract",
            LabelType::Personal => "personal",
            LabelType::Whale => "whale",
            LabelType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Identity data source
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LabelSource {
    KnownAddresses,
    Arkham,
    Chainalysis,
    Etherscan,
    Unknown,
}

impl std::fmt::Display for LabelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LabelSource::KnownAddresses => "known_addresses",
            LabelSource::Arkham => "arkham",
            LabelSource::Chainalysis => "chainalysis",
            LabelSource::Etherscan => "etherscan",
            LabelSource::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One provider's opinion about an address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddressLabel {
    pub label_type: LabelType,

    pub source: LabelSource,

    /// In [0, 1]
    pub confidence: f64,

    #[serde(default)]
    pub additional_info: Metadata,
}

impl AddressLabel {
    pub fn new(label_type: LabelType, source: LabelSource, confidence: f64) -> Self {
        Self {
            label_type,
            source,
            confidence,
            additional_info: Metadata::new(),
        }
    }

    pub fn with_info(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.additional_info.insert(key.to_string(), value.into());
        self
    }

    pub fn has_valid_confidence(&self) -> bool {
        (0.0..=1.0).contains(&self.confidence)
    }
}

/// The single label decision extracted from a set of provider labels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrimaryLabel {
    pub label_type: LabelType,
    pub source: LabelSource,
    pub confidence: f64,
}

impl PrimaryLabel {
    /// Answer used when no provider could classify the address
    pub fn neutral() -> Self {
        Self {
            label_type: LabelType::Unknown,
            source: LabelSource::Unknown,
            confidence: NEUTRAL_PRIOR_CONFIDENCE,
        }
    }
}

impl From<&AddressLabel> for PrimaryLabel {
    fn from(label: &AddressLabel) -> Self {
        Self {
            label_type: label.label_type,
            source: label.source,
            confidence: label.confidence,
        }
    }
}

// ============================================================================
// PART C: Enrichment Schema
// ============================================================================

/// Aggregate answer for one `(address, chain)` pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedAddressResult {
    pub address: String,

    pub chain: Chain,

    pub primary_label_type: LabelType,

    pub primary_source: LabelSource,

    pub primary_confidence: f64,

    /// Every provider's answer, in fan-out order
    pub all_labels: Vec<AddressLabel>,

    /// Whether this answer was served from the cache store
    pub cached: bool,

    /// Time of computation (not of the cache read)
    pub last_updated: DateTime<Utc>,
}

impl EnrichedAddressResult {
    pub fn new(address: String, chain: Chain, primary: PrimaryLabel, all_labels: Vec<AddressLabel>) -> Self {
        Self {
            address,
            chain,
            primary_label_type: primary.label_type,
            primary_source: primary.source,
            primary_confidence: primary.confidence,
            all_labels,
            cached: false,
            last_updated: Utc::now(),
        }
    }
}

// ============================================================================
// Metadata Schema
// ============================================================================

/// Run metadata for extraction runs, written next to the occurrence file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Schema version used
    pub schema_version: String,

    /// Extraction run timestamp
    pub run_timestamp: DateTime<Utc>,

    pub chain: Chain,

    pub source_system: SourceSystem,

    /// Human-readable scope, e.g. "blocks 100-200"
    pub scope: String,

    /// Occurrence counts
    pub record_counts: OccurrenceCounts,

    /// Git commit hash (if available)
    pub git_commit: Option<String>,

    /// Pipeline version
    pub pipeline_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct OccurrenceCounts {
    pub total: usize,
    pub by_role: BTreeMap<AddressRole, usize>,
}

impl OccurrenceCounts {
    pub fn from_occurrences(occurrences: &[AddressOccurrence]) -> Self {
        let mut counts = Self::default();
        for occ in occurrences {
            counts.total += 1;
            *counts.by_role.entry(occ.role).or_default() += 1;
        }
        counts
    }
}

impl RunMetadata {
    pub fn new(chain: Chain, source_system: SourceSystem, scope: String) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            run_timestamp: Utc::now(),
            chain,
            source_system,
            scope,
            record_counts: OccurrenceCounts::default(),
            git_commit: get_git_commit(),
            pipeline_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn get_git_commit() -> Option<String> {
    std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .and_then(|output| {
            if output.status.success() {
                String::from_utf8(output.stdout)
                    .ok()
                    .map(|s| s.trim().to_string())
            } else {
                None
            }
        })
}

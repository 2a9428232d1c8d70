//! Configuration management for the address intelligence pipeline.
//!
//! Supports loading from environment variables (with `.env`) and TOML config files,
//! with environment variables overriding file settings.

use crate::schemas::Chain;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    /// Node-provider endpoint per chain, handed to the extraction tool
    #[serde(default)]
    pub node_providers: BTreeMap<Chain, String>,

    /// Extraction tool settings
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Enrichment cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Label provider credentials and limits
    #[serde(default)]
    pub providers: ProviderConfig,

    /// Output directory paths
    #[serde(default)]
    pub paths: PathConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Export tool for account-model chains
    #[serde(default = "default_evm_tool")]
    pub evm_tool: String,

    /// Export tool for UTXO chains
    #[serde(default = "default_utxo_tool")]
    pub utxo_tool: String,

    /// Timeout for block-range exports (seconds)
    #[serde(default = "default_block_timeout")]
    pub block_timeout_secs: u64,

    /// Base timeout for date-range exports (seconds)
    #[serde(default = "default_date_timeout")]
    pub date_timeout_secs: u64,

    /// Extra timeout per additional day in a date range (seconds)
    #[serde(default = "default_per_day_timeout")]
    pub per_day_timeout_secs: u64,

    /// Hard cap on any single export (seconds)
    #[serde(default = "default_max_timeout")]
    pub max_timeout_secs: u64,

    /// Batch size passed to the export tool
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            evm_tool: default_evm_tool(),
            utxo_tool: default_utxo_tool(),
            block_timeout_secs: default_block_timeout(),
            date_timeout_secs: default_date_timeout(),
            per_day_timeout_secs: default_per_day_timeout(),
            max_timeout_secs: default_max_timeout(),
            batch_size: default_batch_size(),
        }
    }
}

impl ExtractionConfig {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_secs(self.block_timeout_secs.min(self.max_timeout_secs))
    }

    /// Wider date ranges get proportionally longer, up to `max_timeout_secs`.
    pub fn date_timeout(&self, days: u64) -> Duration {
        let extra = self
            .per_day_timeout_secs
            .saturating_mul(days.saturating_sub(1));
        let secs = self
            .date_timeout_secs
            .saturating_add(extra)
            .min(self.max_timeout_secs);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis connection URL; in-process memory cache when absent
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Time-to-live of cached enrichment results (seconds)
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            ttl_secs: default_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Built-in directory of well-known addresses
    #[serde(default = "default_true")]
    pub known_addresses_enabled: bool,

    #[serde(default)]
    pub arkham_api_key: Option<String>,

    #[serde(default = "default_arkham_url")]
    pub arkham_base_url: String,

    #[serde(default)]
    pub chainalysis_api_key: Option<String>,

    #[serde(default = "default_chainalysis_url")]
    pub chainalysis_base_url: String,

    #[serde(default)]
    pub etherscan_api_key: Option<String>,

    #[serde(default = "default_etherscan_url")]
    pub etherscan_base_url: String,

    /// Per-request timeout (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            known_addresses_enabled: true,
            arkham_api_key: None,
            arkham_base_url: default_arkham_url(),
            chainalysis_api_key: None,
            chainalysis_base_url: default_chainalysis_url(),
            etherscan_api_key: None,
            etherscan_base_url: default_etherscan_url(),
            request_timeout_secs: default_request_timeout(),
            rate_limits: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per second, per provider
    #[serde(default = "default_rps")]
    pub requests_per_second: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_occurrences_dir")]
    pub occurrences_dir: PathBuf,

    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            occurrences_dir: default_occurrences_dir(),
            metadata_dir: default_metadata_dir(),
        }
    }
}

// Default value functions
fn default_evm_tool() -> String {
    "ethereumetl".to_string()
}

fn default_utxo_tool() -> String {
    "bitcoinetl".to_string()
}

fn default_block_timeout() -> u64 {
    300
}

fn default_date_timeout() -> u64 {
    600
}

fn default_per_day_timeout() -> u64 {
    300
}

fn default_max_timeout() -> u64 {
    3600
}

fn default_batch_size() -> usize {
    100
}

fn default_cache_ttl() -> u64 {
    24 * 60 * 60
}

fn default_true() -> bool {
    true
}

fn default_arkham_url() -> String {
    "https://api.arkhamintelligence.com".to_string()
}

fn default_chainalysis_url() -> String {
    "https://public.chainalysis.com".to_string()
}

fn default_etherscan_url() -> String {
    "https://api.etherscan.io/v2/api".to_string()
}

fn default_request_timeout() -> u64 {
    15
}

fn default_rps() -> u32 {
    5 // Conservative for free tiers
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_occurrences_dir() -> PathBuf {
    PathBuf::from("data/occurrences")
}

fn default_metadata_dir() -> PathBuf {
    PathBuf::from("data/metadata")
}

/// Environment variable naming the node-provider endpoint for `chain`
pub fn node_provider_env_var(chain: Chain) -> String {
    format!("NODE_PROVIDER_{}", chain.as_str().to_uppercase())
}

impl PipelineConfig {
    /// Load configuration from environment
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML config file with environment overrides
    pub fn load_from_file(path: &PathBuf) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = ::toml::from_str(&contents)?;

        // Environment variables override file settings
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        for chain in Chain::ALL {
            if let Ok(uri) = std::env::var(node_provider_env_var(chain)) {
                self.node_providers.insert(chain, uri);
            }
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.cache.redis_url = Some(url);
        }
        if let Ok(key) = std::env::var("ARKHAM_API_KEY") {
            self.providers.arkham_api_key = Some(key);
        }
        if let Ok(key) = std::env::var("CHAINALYSIS_API_KEY") {
            self.providers.chainalysis_api_key = Some(key);
        }
        if let Ok(key) = std::env::var("ETHERSCAN_API_KEY") {
            self.providers.etherscan_api_key = Some(key);
        }
        if let Ok(tool) = std::env::var("EVM_EXPORT_TOOL") {
            self.extraction.evm_tool = tool;
        }
        if let Ok(tool) = std::env::var("UTXO_EXPORT_TOOL") {
            self.extraction.utxo_tool = tool;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache.ttl_secs == 0 {
            anyhow::bail!("cache.ttl_secs must be > 0");
        }
        if self.extraction.block_timeout_secs == 0
            || self.extraction.date_timeout_secs == 0
            || self.extraction.max_timeout_secs == 0
        {
            anyhow::bail!("extraction timeouts must be > 0");
        }
        if self.providers.request_timeout_secs == 0 {
            anyhow::bail!("providers.request_timeout_secs must be > 0");
        }
        if let Some((chain, _)) = self
            .node_providers
            .iter()
            .find(|(_, uri)| uri.trim().is_empty())
        {
            anyhow::bail!("node provider endpoint for {} is empty", chain);
        }
        Ok(())
    }

    /// Configured node-provider endpoint for `chain`, if any
    pub fn node_provider(&self, chain: Chain) -> Option<&str> {
        self.node_providers
            .get(&chain)
            .map(String::as_str)
            .filter(|uri| !uri.trim().is_empty())
    }

    /// Ensure all output directories exist
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.paths.occurrences_dir)?;
        std::fs::create_dir_all(&self.paths.metadata_dir)?;
        Ok(())
    }
}

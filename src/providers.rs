//! Label provider adapters.
//!
//! Every adapter answers one question: what is this address? A lookup never fails to the
//! caller. Network, rate-limit and decode problems are logged and turn into `None`, and an
//! adapter asked about a chain it does not cover returns `None` without making a call.

use crate::config::{PipelineConfig, ProviderConfig};
use crate::schemas::{AddressLabel, Chain, LabelSource, LabelType};
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, LazyLock, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const KNOWN_ADDRESS_CONFIDENCE: f64 = 0.90;
pub const ARKHAM_CONFIDENCE: f64 = 0.85;
pub const CHAINALYSIS_CONFIDENCE: f64 = 0.95;
pub const ETHERSCAN_CONFIDENCE: f64 = 0.60;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limited by provider (HTTP 429)")]
    RateLimited,

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Provider API error: {0}")]
    Api(String),
}

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

fn rate_limiter(requests_per_second: u32) -> DirectRateLimiter {
    let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
    RateLimiter::direct(Quota::per_second(rps))
}

/// Identity lookup capability shared by all providers.
#[async_trait]
pub trait LabelProvider: Send + Sync {
    fn source(&self) -> LabelSource;

    fn supports(&self, chain: Chain) -> bool;

    /// Look up `address` (already normalized) on `chain`.
    async fn lookup(&self, address: &str, chain: Chain) -> Option<AddressLabel>;
}

/// Log a failed lookup and drop it.
fn recover(
    source: LabelSource,
    address: &str,
    chain: Chain,
    result: Result<Option<AddressLabel>, ProviderError>,
) -> Option<AddressLabel> {
    match result {
        Ok(label) => label,
        Err(e) => {
            warn!("{} lookup failed for {} on {}: {}", source, address, chain, e);
            None
        }
    }
}

// ============================================================================
// Shared HTTP client
// ============================================================================

/// Long-lived HTTP client, built on first use and shared by every adapter
#[derive(Clone)]
pub struct SharedHttpClient {
    client: Arc<OnceLock<reqwest::Client>>,
    timeout: Duration,
}

impl SharedHttpClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Arc::new(OnceLock::new()),
            timeout,
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(Duration::from_secs(config.request_timeout_secs))
    }

    pub fn is_initialized(&self) -> bool {
        self.client.get().is_some()
    }

    pub fn client(&self) -> &reqwest::Client {
        self.client.get_or_init(|| {
            debug!("Creating shared HTTP client (timeout {:?})", self.timeout);
            reqwest::Client::builder()
                .timeout(self.timeout)
                .pool_max_idle_per_host(10)
                .tcp_keepalive(Duration::from_secs(30))
                .user_agent(concat!("address-intel/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|e| {
                    warn!("Falling back to default HTTP client: {}", e);
                    reqwest::Client::new()
                })
        })
    }
}

async fn send(request: reqwest::RequestBuilder) -> Result<Option<reqwest::Response>, ProviderError> {
    let response = request.send().await?;
    match response.status().as_u16() {
        404 => Ok(None),
        429 => Err(ProviderError::RateLimited),
        code if !response.status().is_success() => Err(ProviderError::Status(code)),
        _ => Ok(Some(response)),
    }
}

// ============================================================================
// Known addresses
// ============================================================================

/// Well-known exchange hot wallets, DEX routers, lending pools and wrappers on Ethereum.
static KNOWN_ADDRESSES: LazyLock<HashMap<&'static str, (LabelType, &'static str)>> =
    LazyLock::new(|| {
        use LabelType::*;
        [
            ("0x28c6c06298d514db089934071355e5743bf21d60", (Exchange, "Binance")),
            ("0x21a31ee1afc51d94c2efccaa2092ad1028285549", (Exchange, "Binance")),
            ("0xdfd5293d8e347dfe59e90efd55b2956a1343963d", (Exchange, "Binance")),
            ("0x56eddb7aa87536c09ccc2793473599fd21a8b17f", (Exchange, "Binance")),
            ("0x52bc44d5378309ee2abf1539bf71de1b7d7be3b5", (Exchange, "Bitfinex")),
            ("0x1151314c646ce4e0efd76d1af4760ae66a9fe30f", (Exchange, "Bitfinex")),
            ("0x2910543af39aba0cd09dbb2d50200b3e800a63d2", (Exchange, "Kraken")),
            ("0x267be1c1d684f78cb4f6a176c4911b741e4ffdc0", (Exchange, "Kraken")),
            ("0x71660c4005ba85c37ccec55d0c4493e66fe775d3", (Exchange, "Coinbase")),
            ("0x503828976d22510aad0201ac7ec88293211d23da", (Exchange, "Coinbase")),
            ("0xddfabcdc4d8ffc6d5beaf154f18b778f892a0740", (Exchange, "Coinbase")),
            ("0x3cd751e6b0078be393132286c442345e68ff0aaa", (Exchange, "Coinbase")),
            ("0x6cc5f688a315f3dc28a7781717a9a798a59fda7b", (Exchange, "OKX")),
            ("0xd24400ae8bfebb18ca49be86258a3c749cf46853", (Exchange, "Gemini")),
            ("0xa9d1e08c7793af67e9d92fe308d5697fb81d3e43", (Exchange, "HTX")),
            ("0x46340b20830761efd32832a74d7169b29feb9758", (Exchange, "HTX")),
            ("0x9430801ebaf509ad49202aabc5f5bc6fd8a3daf8", (Exchange, "KuCoin")),
            ("0x6262998ced04146fa42253a5c0af90ca02dfd2a3", (Exchange, "Crypto.com")),
            ("0x974caa59e49682cda0ad2bbe82983419a2ecc400", (Exchange, "Gate.io")),
            ("0x4976a4a02f38326660d17bf34b431dc6e2eb2327", (Exchange, "Gate.io")),
            ("0xfbb1b73c4f0bda4f67dca266ce6ef42f520fbb98", (Exchange, "Bittrex")),
            ("0x209c4784ab1e8183cf58ca33cb740efbf3fc18ef", (Exchange, "Poloniex")),
            ("0x7a250d5630b4cf539739df2c5dacb4c659f2488d", (Dex, "Uniswap V2 Router")),
            ("0xe592427a0aece92de3edee1f18e0157c05861564", (Dex, "Uniswap V3 Router")),
            ("0x68b3465833fb72a70ecdf485e0e4c7bd8665fc45", (Dex, "Uniswap V3 Router 2")),
            ("0x1111111254eeb25477b68fb85ed929f73a960582", (Dex, "1inch Router")),
            ("0x881d40237659c251811cec9c364ef91dc08d300c", (Dex, "MetaMask Swap Router")),
            ("0x1231deb6f5749ef6ce6943a275a1d3e7486f4eae", (Bridge, "LI.FI Diamond")),
            ("0x7d2768de32b0b80b7a3454c06bdac94a69ddc7a9", (LendingProtocol, "Aave V2 Lending Pool")),
            ("0x87870bca3f3fd6335c3f4ce8392d69350b4fa4e2", (LendingProtocol, "Aave V3 Pool")),
            ("0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2", (Contract, "Wrapped Ether")),
        ]
        .into_iter()
        .collect()
    });

/// In-process directory of well-known addresses
#[derive(Debug, Default, Clone, Copy)]
pub struct KnownAddressProvider;

#[async_trait]
impl LabelProvider for KnownAddressProvider {
    fn source(&self) -> LabelSource {
        LabelSource::KnownAddresses
    }

    fn supports(&self, chain: Chain) -> bool {
        chain == Chain::Ethereum
    }

    async fn lookup(&self, address: &str, chain: Chain) -> Option<AddressLabel> {
        if !self.supports(chain) {
            return None;
        }
        let (label_type, name) = KNOWN_ADDRESSES.get(address.to_lowercase().as_str())?;
        Some(
            AddressLabel::new(*label_type, self.source(), KNOWN_ADDRESS_CONFIDENCE)
                .with_info("name", *name),
        )
    }
}

// ============================================================================
// Arkham
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArkhamAddressResponse {
    #[serde(default)]
    arkham_entity: Option<ArkhamEntity>,
    #[serde(default)]
    arkham_label: Option<ArkhamLabel>,
}

#[derive(Debug, Deserialize)]
struct ArkhamEntity {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "type")]
    entity_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArkhamLabel {
    #[serde(default)]
    name: Option<String>,
}

/// Entity lookups against the Arkham intelligence API
pub struct ArkhamProvider {
    http: SharedHttpClient,
    base_url: String,
    api_key: String,
    limiter: DirectRateLimiter,
}

impl ArkhamProvider {
    pub fn new(http: SharedHttpClient, base_url: &str, api_key: &str, requests_per_second: u32) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            limiter: rate_limiter(requests_per_second),
        }
    }

    fn chain_slug(chain: Chain) -> &'static str {
        match chain {
            Chain::Arbitrum => "arbitrum_one",
            other => other.as_str(),
        }
    }

    async fn fetch(&self, address: &str, chain: Chain) -> Result<Option<AddressLabel>, ProviderError> {
        self.limiter.until_ready().await;

        let url = format!("{}/intelligence/address/{}", self.base_url, address);
        let request = self
            .http
            .client()
            .get(&url)
            .query(&[("chain", Self::chain_slug(chain))])
            .header("API-Key", &self.api_key);

        let Some(response) = send(request).await? else {
            return Ok(None);
        };
        let body: ArkhamAddressResponse = response.json().await?;
        Ok(arkham_label(body))
    }
}

fn arkham_entity_type(raw: &str) -> LabelType {
    match raw.to_lowercase().replace('-', "_").as_str() {
        "cex" | "exchange" => LabelType::Exchange,
        "dex" | "dex_aggregator" => LabelType::Dex,
        "bridge" => LabelType::Bridge,
        "market_maker" => LabelType::MarketMaker,
        "lending" | "lending_protocol" => LabelType::LendingProtocol,
        "validator" | "staking" => LabelType::Validator,
        "scam" | "hacker" | "exploit" | "sanctioned" => LabelType::Scammer,
        "mev" | "mev_bot" => LabelType::MevBot,
        "individual" | "person" => LabelType::Personal,
        "fund" | "whale" => LabelType::Whale,
        "contract" | "defi" | "token" => LabelType::Contract,
        _ => LabelType::Unknown,
    }
}

fn arkham_label(body: ArkhamAddressResponse) -> Option<AddressLabel> {
    let entity = body.arkham_entity?;
    let label_type = entity
        .entity_type
        .as_deref()
        .map(arkham_entity_type)
        .unwrap_or(LabelType::Unknown);

    let mut label = AddressLabel::new(label_type, LabelSource::Arkham, ARKHAM_CONFIDENCE);
    if let Some(name) = entity.name {
        label = label.with_info("entity_name", name);
    }
    if let Some(raw) = entity.entity_type {
        label = label.with_info("entity_type", raw);
    }
    if let Some(name) = body.arkham_label.and_then(|l| l.name) {
        label = label.with_info("label_name", name);
    }
    Some(label)
}

#[async_trait]
impl LabelProvider for ArkhamProvider {
    fn source(&self) -> LabelSource {
        LabelSource::Arkham
    }

    fn supports(&self, chain: Chain) -> bool {
        chain.is_evm() || chain == Chain::Bitcoin
    }

    async fn lookup(&self, address: &str, chain: Chain) -> Option<AddressLabel> {
        if !self.supports(chain) {
            return None;
        }
        recover(self.source(), address, chain, self.fetch(address, chain).await)
    }
}

// ============================================================================
// Chainalysis sanctions screening
// ============================================================================

#[derive(Debug, Deserialize)]
struct SanctionsResponse {
    #[serde(default)]
    identifications: Vec<SanctionsIdentification>,
}

#[derive(Debug, Deserialize)]
struct SanctionsIdentification {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Sanctions screening via the Chainalysis public API
pub struct ChainalysisSanctionsProvider {
    http: SharedHttpClient,
    base_url: String,
    api_key: String,
    limiter: DirectRateLimiter,
}

impl ChainalysisSanctionsProvider {
    pub fn new(http: SharedHttpClient, base_url: &str, api_key: &str, requests_per_second: u32) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            limiter: rate_limiter(requests_per_second),
        }
    }

    async fn fetch(&self, address: &str) -> Result<Option<AddressLabel>, ProviderError> {
        self.limiter.until_ready().await;

        let url = format!("{}/api/v1/address/{}", self.base_url, address);
        let request = self
            .http
            .client()
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .header("Accept", "application/json");

        let Some(response) = send(request).await? else {
            return Ok(None);
        };
        let body: SanctionsResponse = response.json().await?;
        Ok(sanctions_label(body))
    }
}

fn sanctions_label(body: SanctionsResponse) -> Option<AddressLabel> {
    if body.identifications.is_empty() {
        return None;
    }
    let names: Vec<Value> = body
        .identifications
        .iter()
        .filter_map(|i| i.name.clone())
        .map(Value::from)
        .collect();
    let categories: Vec<Value> = body
        .identifications
        .iter()
        .filter_map(|i| i.category.clone())
        .map(Value::from)
        .collect();

    Some(
        AddressLabel::new(LabelType::Scammer, LabelSource::Chainalysis, CHAINALYSIS_CONFIDENCE)
            .with_info("identifications", names)
            .with_info("categories", categories),
    )
}

#[async_trait]
impl LabelProvider for ChainalysisSanctionsProvider {
    fn source(&self) -> LabelSource {
        LabelSource::Chainalysis
    }

    fn supports(&self, _chain: Chain) -> bool {
        true
    }

    async fn lookup(&self, address: &str, chain: Chain) -> Option<AddressLabel> {
        recover(self.source(), address, chain, self.fetch(address).await)
    }
}

// ============================================================================
// Etherscan contract verification
// ============================================================================

#[derive(Debug, Deserialize)]
struct EtherscanResponse {
    status: String,
    #[serde(default)]
    message: String,
    /// Array of source entries on success, an error string otherwise
    #[serde(default)]
    result: Value,
}

#[derive(Debug, Deserialize)]
struct EtherscanSourceEntry {
    #[serde(rename = "SourceCode", default)]
    source_code: String,
    #[serde(rename = "ContractName", default)]
    contract_name: String,
    #[serde(rename = "CompilerVersion", default)]
    compiler_version: String,
}

/// Verified-contract lookups via the Etherscan v2 multichain API
pub struct EtherscanProvider {
    http: SharedHttpClient,
    base_url: String,
    api_key: String,
    limiter: DirectRateLimiter,
}

impl EtherscanProvider {
    pub fn new(http: SharedHttpClient, base_url: &str, api_key: &str, requests_per_second: u32) -> Self {
        Self {
            http,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            limiter: rate_limiter(requests_per_second),
        }
    }

    async fn fetch(&self, address: &str, chain_id: u64) -> Result<Option<AddressLabel>, ProviderError> {
        self.limiter.until_ready().await;

        let request = self.http.client().get(&self.base_url).query(&[
            ("chainid", chain_id.to_string().as_str()),
            ("module", "contract"),
            ("action", "getsourcecode"),
            ("address", address),
            ("apikey", self.api_key.as_str()),
        ]);

        let Some(response) = send(request).await? else {
            return Ok(None);
        };
        let body: EtherscanResponse = response.json().await?;
        etherscan_label(body)
    }
}

fn etherscan_label(body: EtherscanResponse) -> Result<Option<AddressLabel>, ProviderError> {
    if body.status != "1" {
        let detail = body.result.as_str().unwrap_or(&body.message).to_string();
        return Err(ProviderError::Api(detail));
    }

    let entries: Vec<EtherscanSourceEntry> = serde_json::from_value(body.result)
        .map_err(|e| ProviderError::Api(format!("unexpected result shape: {}", e)))?;

    let Some(entry) = entries.into_iter().next() else {
        return Ok(None);
    };
    if entry.source_code.trim().is_empty() || entry.contract_name.trim().is_empty() {
        return Ok(None);
    }

    let mut label = AddressLabel::new(LabelType::Contract, LabelSource::Etherscan, ETHERSCAN_CONFIDENCE)
        .with_info("contract_name", entry.contract_name);
    if !entry.compiler_version.is_empty() {
        label = label.with_info("compiler_version", entry.compiler_version);
    }
    Ok(Some(label))
}

#[async_trait]
impl LabelProvider for EtherscanProvider {
    fn source(&self) -> LabelSource {
        LabelSource::Etherscan
    }

    fn supports(&self, chain: Chain) -> bool {
        chain.evm_chain_id().is_some()
    }

    async fn lookup(&self, address: &str, chain: Chain) -> Option<AddressLabel> {
        let chain_id = chain.evm_chain_id()?;
        recover(self.source(), address, chain, self.fetch(address, chain_id).await)
    }
}

// ============================================================================
// Registry
// ============================================================================

fn credential(key: &Option<String>) -> Option<&str> {
    key.as_deref().map(str::trim).filter(|k| !k.is_empty())
}

/// Build the ordered adapter list; adapters without credentials are left out.
pub fn build_providers(config: &PipelineConfig, http: &SharedHttpClient) -> Vec<Arc<dyn LabelProvider>> {
    let settings = &config.providers;
    let rps = settings.rate_limits.requests_per_second;
    let mut providers: Vec<Arc<dyn LabelProvider>> = Vec::new();

    if settings.known_addresses_enabled {
        providers.push(Arc::new(KnownAddressProvider));
    } else {
        info!("Known-address directory disabled");
    }

    match credential(&settings.arkham_api_key) {
        Some(key) => providers.push(Arc::new(ArkhamProvider::new(
            http.clone(),
            &settings.arkham_base_url,
            key,
            rps,
        ))),
        None => info!("ARKHAM_API_KEY not set, Arkham provider disabled"),
    }

    match credential(&settings.chainalysis_api_key) {
        Some(key) => providers.push(Arc::new(ChainalysisSanctionsProvider::new(
            http.clone(),
            &settings.chainalysis_base_url,
            key,
            rps,
        ))),
        None => info!("CHAINALYSIS_API_KEY not set, sanctions screening disabled"),
    }

    match credential(&settings.etherscan_api_key) {
        Some(key) => providers.push(Arc::new(EtherscanProvider::new(
            http.clone(),
            &settings.etherscan_base_url,
            key,
            rps,
        ))),
        None => info!("ETHERSCAN_API_KEY not set, Etherscan provider disabled"),
    }

    let enabled: Vec<String> = providers.iter().map(|p| p.source().to_string()).collect();
    info!("Label providers enabled: [{}]", enabled.join(", "));
    providers
}

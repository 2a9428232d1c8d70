//! Chain Address Intelligence Library
//!
//! Discovers blockchain addresses in exported chain records and answers "what is this
//! address?" by fanning out to external label providers behind a cache.
//!
//! # Components
//!
//! 1. **Topic decoding** ([`ethereum`]): address normalization and recovery of addresses
//!    stored in 32-byte log topics
//! 2. **Record parsing** ([`parsers`]): transaction, token-transfer, log and UTXO rows into
//!    [`AddressOccurrence`]s
//! 3. **Extraction** ([`extract`]): runs the external export tool over a block or date range
//!    and parses what it writes
//! 4. **Label providers** ([`providers`]): known-address directory, Arkham, Chainalysis
//!    sanctions screening and Etherscan
//! 5. **Aggregation** ([`aggregate`]): picks the primary label
//! 6. **Enrichment** ([`enrich`]): cache-aside orchestration over [`cache`]
//!
//! # Example
//!
//! ```no_run
//! use address_intel::aggregate::HighestConfidence;
//! use address_intel::cache::open_cache;
//! use address_intel::config::PipelineConfig;
//! use address_intel::enrich::AddressEnricher;
//! use address_intel::providers::{build_providers, SharedHttpClient};
//! use address_intel::schemas::Chain;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load()?;
//!     let http = SharedHttpClient::from_config(&config.providers);
//!     let enricher = AddressEnricher::new(
//!         build_providers(&config, &http),
//!         Box::new(HighestConfidence),
//!         open_cache(&config.cache).await?,
//!         config.cache.ttl_secs,
//!     );
//!     let result = enricher
//!         .enrich("0x28c6c06298d514db089934071355e5743bf21d60", Chain::Ethereum, false)
//!         .await?;
//!     println!("{} ({})", result.primary_label_type, result.primary_confidence);
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod enrich;
pub mod ethereum;
pub mod extract;
pub mod parsers;
pub mod providers;
pub mod schemas;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use schemas::{
    AddressLabel, AddressOccurrence, AddressRole, Chain, EnrichedAddressResult, RunMetadata,
};

//! Enrichment orchestrator.
//!
//! Per request: check the cache; on a hit return it. On a miss (or forced refresh) fan out to
//! every applicable provider concurrently, aggregate, write the cache and return.
//!
//! Concurrent misses for the same key share one computation through a per-key in-flight map
//! of [`Shared`] futures. The computation runs as its own task, so it finishes, caches and
//! leaves the map even if every caller waiting on it goes away.

use crate::aggregate::LabelAggregator;
use crate::cache::{cache_key, CacheStore};
use crate::ethereum::{normalize_address, AddressError};
use crate::providers::LabelProvider;
use crate::schemas::{AddressLabel, Chain, EnrichedAddressResult};
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrichError {
    #[error("{0}")]
    InvalidAddress(#[from] AddressError),

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Enrichment task failed: {0}")]
    TaskFailed(String),
}

type Computation = Shared<BoxFuture<'static, Result<EnrichedAddressResult, EnrichError>>>;

struct InFlight {
    id: u64,
    computation: Computation,
}

/// Cache-aside enrichment over an ordered set of label providers
#[derive(Clone)]
pub struct AddressEnricher {
    inner: Arc<EnricherInner>,
}

struct EnricherInner {
    providers: Vec<Arc<dyn LabelProvider>>,
    aggregator: Box<dyn LabelAggregator>,
    cache: Arc<dyn CacheStore>,
    ttl_secs: u64,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_id: AtomicU64,
}

impl EnricherInner {
    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes one computation's map entry when it ends, unless a newer one replaced it.
struct InFlightGuard {
    inner: Arc<EnricherInner>,
    key: String,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.inner.lock_in_flight();
        if in_flight.get(&self.key).is_some_and(|entry| entry.id == self.id) {
            in_flight.remove(&self.key);
        }
    }
}

impl AddressEnricher {
    pub fn new(
        providers: Vec<Arc<dyn LabelProvider>>,
        aggregator: Box<dyn LabelAggregator>,
        cache: Arc<dyn CacheStore>,
        ttl_secs: u64,
    ) -> Self {
        Self {
            inner: Arc::new(EnricherInner {
                providers,
                aggregator,
                cache,
                ttl_secs,
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn provider_count(&self) -> usize {
        self.inner.providers.len()
    }

    /// Enrich one address.
    ///
    /// Fails only for an invalid address or an unreachable cache store. Provider failures
    /// are absorbed and show up as fewer labels.
    pub async fn enrich(
        &self,
        address: &str,
        chain: Chain,
        force_refresh: bool,
    ) -> Result<EnrichedAddressResult, EnrichError> {
        let address = normalize_address(address, chain)?;
        let key = cache_key(chain, &address);

        if !force_refresh {
            if let Some(hit) = self.read_cache(&key).await? {
                debug!("Cache hit for {}", key);
                return Ok(hit);
            }
        }

        self.join_or_start(&key, address, chain).await
    }

    async fn read_cache(&self, key: &str) -> Result<Option<EnrichedAddressResult>, EnrichError> {
        let bytes = match self.inner.cache.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(e) => return Err(EnrichError::CacheUnavailable(e.to_string())),
        };

        match serde_json::from_slice::<EnrichedAddressResult>(&bytes) {
            Ok(mut hit) => {
                hit.cached = true;
                Ok(Some(hit))
            }
            Err(e) => {
                warn!("Discarding undecodable cache entry {}: {}", key, e);
                Ok(None)
            }
        }
    }

    fn join_or_start(&self, key: &str, address: String, chain: Chain) -> Computation {
        let mut in_flight = self.inner.lock_in_flight();
        if let Some(pending) = in_flight.get(key) {
            debug!("Joining in-flight enrichment for {}", key);
            return pending.computation.clone();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = InFlightGuard {
            inner: self.inner.clone(),
            key: key.to_string(),
            id,
        };
        // The guard cannot remove anything before the insert below: it needs this lock.
        let task = tokio::spawn(compute(guard, address, chain));
        let computation = task
            .map(|joined| joined.unwrap_or_else(|e| Err(EnrichError::TaskFailed(e.to_string()))))
            .boxed()
            .shared();
        in_flight.insert(
            key.to_string(),
            InFlight {
                id,
                computation: computation.clone(),
            },
        );
        computation
    }
}

async fn compute(
    guard: InFlightGuard,
    address: String,
    chain: Chain,
) -> Result<EnrichedAddressResult, EnrichError> {
    let inner = &guard.inner;
    let key = &guard.key;
    let labels = fan_out(&inner.providers, &address, chain).await;
    let primary = inner.aggregator.aggregate(&labels);

    info!(
        "Enriched {} on {}: {} ({}, {:.2}) from {} labels",
        address,
        chain,
        primary.label_type,
        primary.source,
        primary.confidence,
        labels.len()
    );

    let result = EnrichedAddressResult::new(address, chain, primary, labels);

    // Unknown results are cached too.
    match serde_json::to_vec(&result) {
        Ok(bytes) => {
            if let Err(e) = inner.cache.set_ex(key, inner.ttl_secs, &bytes).await {
                warn!("Failed to cache {}: {}", key, e);
            }
        }
        Err(e) => warn!("Failed to encode {} for caching: {}", key, e),
    }

    Ok(result)
}

/// Query every applicable provider concurrently; labels come back in provider order.
async fn fan_out(
    providers: &[Arc<dyn LabelProvider>],
    address: &str,
    chain: Chain,
) -> Vec<AddressLabel> {
    let applicable: Vec<&Arc<dyn LabelProvider>> =
        providers.iter().filter(|p| p.supports(chain)).collect();

    let tasks = applicable.iter().map(|provider| {
        let provider = Arc::clone(provider);
        let address = address.to_string();
        tokio::spawn(async move { provider.lookup(&address, chain).await })
    });
    let outcomes = join_all(tasks).await;

    let mut labels = Vec::with_capacity(applicable.len());
    for (provider, outcome) in applicable.iter().zip(outcomes) {
        match outcome {
            Ok(Some(label)) if label.has_valid_confidence() => labels.push(label),
            Ok(Some(label)) => warn!(
                "{} returned out-of-range confidence {} for {}, discarding",
                provider.source(),
                label.confidence,
                address
            ),
            Ok(None) => {}
            Err(e) => warn!("{} lookup task for {} failed: {}", provider.source(), address, e),
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::HighestConfidence;
    use crate::cache::{CacheError, MemoryCache};
    use crate::schemas::{LabelSource, LabelType, NEUTRAL_PRIOR_CONFIDENCE};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const ADDR: &str = "0x1aaa000000000000000000000000000000000001";
    const TTL: u64 = 86_400;

    struct StaticProvider {
        source: LabelSource,
        label: Option<AddressLabel>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl StaticProvider {
        fn new(label_type: LabelType, source: LabelSource, confidence: f64) -> Self {
            Self {
                source,
                label: Some(AddressLabel::new(label_type, source, confidence)),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LabelProvider for StaticProvider {
        fn source(&self) -> LabelSource {
            self.source
        }

        fn supports(&self, _chain: Chain) -> bool {
            true
        }

        async fn lookup(&self, _address: &str, _chain: Chain) -> Option<AddressLabel> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.label.clone()
        }
    }

    struct PanickingProvider;

    #[async_trait]
    impl LabelProvider for PanickingProvider {
        fn source(&self) -> LabelSource {
            LabelSource::Etherscan
        }

        fn supports(&self, _chain: Chain) -> bool {
            true
        }

        async fn lookup(&self, _address: &str, _chain: Chain) -> Option<AddressLabel> {
            panic!("provider blew up")
        }
    }

    struct BitcoinOnlyProvider(AtomicUsize);

    #[async_trait]
    impl LabelProvider for BitcoinOnlyProvider {
        fn source(&self) -> LabelSource {
            LabelSource::Arkham
        }

        fn supports(&self, chain: Chain) -> bool {
            chain == Chain::Bitcoin
        }

        async fn lookup(&self, _address: &str, _chain: Chain) -> Option<AddressLabel> {
            self.0.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    /// Store whose reads or writes always fail
    struct BrokenCache {
        fail_reads: bool,
    }

    #[async_trait]
    impl CacheStore for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            if self.fail_reads {
                Err(CacheError::Unavailable("connection refused".to_string()))
            } else {
                Ok(None)
            }
        }

        async fn set_ex(&self, _key: &str, _ttl_secs: u64, _value: &[u8]) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
    }

    fn enricher(providers: Vec<Arc<dyn LabelProvider>>, cache: Arc<dyn CacheStore>) -> AddressEnricher {
        AddressEnricher::new(providers, Box::new(HighestConfidence), cache, TTL)
    }

    #[tokio::test]
    async fn test_single_provider_scenario() {
        // Second provider is disabled, so it is simply not registered.
        let provider = Arc::new(StaticProvider::new(LabelType::Exchange, LabelSource::Arkham, 0.95));
        let enricher = enricher(vec![provider], Arc::new(MemoryCache::new()));

        let result = enricher.enrich(ADDR, Chain::Ethereum, false).await.unwrap();
        assert_eq!(result.primary_label_type, LabelType::Exchange);
        assert_eq!(result.primary_source, LabelSource::Arkham);
        assert_eq!(result.primary_confidence, 0.95);
        assert_eq!(result.all_labels.len(), 1);
        assert!(!result.cached);
    }

    #[tokio::test]
    async fn test_failing_provider_is_invisible() {
        let good = || -> Arc<dyn LabelProvider> {
            Arc::new(StaticProvider::new(LabelType::Dex, LabelSource::KnownAddresses, 0.9))
        };
        let baseline = enricher(vec![good()], Arc::new(MemoryCache::new()))
            .enrich(ADDR, Chain::Ethereum, false)
            .await
            .unwrap();
        let with_failure = enricher(vec![good(), Arc::new(PanickingProvider)], Arc::new(MemoryCache::new()))
            .enrich(ADDR, Chain::Ethereum, false)
            .await
            .unwrap();

        assert_eq!(with_failure.primary_label_type, baseline.primary_label_type);
        assert_eq!(with_failure.primary_source, baseline.primary_source);
        assert_eq!(with_failure.primary_confidence, baseline.primary_confidence);
        assert_eq!(with_failure.all_labels, baseline.all_labels);
    }

    #[tokio::test]
    async fn test_no_labels_gives_neutral_prior_and_is_cached() {
        let cache = Arc::new(MemoryCache::new());
        let enricher = enricher(Vec::new(), cache.clone());

        let first = enricher.enrich(ADDR, Chain::Ethereum, false).await.unwrap();
        assert_eq!(first.primary_label_type, LabelType::Unknown);
        assert_eq!(first.primary_source, LabelSource::Unknown);
        assert_eq!(first.primary_confidence, NEUTRAL_PRIOR_CONFIDENCE);
        assert!(first.all_labels.is_empty());
        assert_eq!(cache.len().await, 1);

        let second = enricher.enrich(ADDR, Chain::Ethereum, false).await.unwrap();
        assert!(second.cached);
    }

    #[tokio::test]
    async fn test_cache_round_trip() {
        let provider = Arc::new(StaticProvider::new(LabelType::Whale, LabelSource::Arkham, 0.7));
        let enricher = enricher(vec![provider.clone()], Arc::new(MemoryCache::new()));

        let fresh = enricher.enrich(ADDR, Chain::Ethereum, false).await.unwrap();
        let hit = enricher
            .enrich(&ADDR.to_uppercase().replacen("0X", "0x", 1), Chain::Ethereum, false)
            .await
            .unwrap();

        assert!(hit.cached);
        assert_eq!(EnrichedAddressResult { cached: false, ..hit }, fresh);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_cache_entry_is_a_miss() {
        let cache = Arc::new(MemoryCache::new());
        let key = cache_key(Chain::Ethereum, ADDR);
        cache.insert_raw(&key, b"{not json", Duration::from_secs(60)).await;

        let provider = Arc::new(StaticProvider::new(LabelType::Bridge, LabelSource::Arkham, 0.8));
        let enricher = enricher(vec![provider.clone()], cache.clone());

        let result = enricher.enrich(ADDR, Chain::Ethereum, false).await.unwrap();
        assert!(!result.cached);
        assert_eq!(result.primary_label_type, LabelType::Bridge);
        assert_eq!(provider.calls(), 1);

        let stored = cache.get(&key).await.unwrap().unwrap();
        assert!(serde_json::from_slice::<EnrichedAddressResult>(&stored).is_ok());
    }

    #[tokio::test]
    async fn test_force_refresh_skips_read_but_writes() {
        let cache = Arc::new(MemoryCache::new());
        let provider = Arc::new(StaticProvider::new(LabelType::MevBot, LabelSource::Arkham, 0.6));
        let enricher = enricher(vec![provider.clone()], cache.clone());

        let first = enricher.enrich(ADDR, Chain::Ethereum, false).await.unwrap();
        let forced = enricher.enrich(ADDR, Chain::Ethereum, true).await.unwrap();
        assert!(!forced.cached);
        assert_eq!(provider.calls(), 2);
        assert!(forced.last_updated >= first.last_updated);

        let after = enricher.enrich(ADDR, Chain::Ethereum, false).await.unwrap();
        assert!(after.cached);
        assert_eq!(after.last_updated, forced.last_updated);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_cache_read_failure_is_hard_error() {
        let provider = Arc::new(StaticProvider::new(LabelType::Dex, LabelSource::Arkham, 0.6));
        let enricher = enricher(vec![provider.clone()], Arc::new(BrokenCache { fail_reads: true }));
        let err = enricher.enrich(ADDR, Chain::Ethereum, false).await.unwrap_err();
        assert!(matches!(err, EnrichError::CacheUnavailable(_)));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_write_failure_still_returns() {
        let provider = Arc::new(StaticProvider::new(LabelType::Dex, LabelSource::Arkham, 0.6));
        let enricher = enricher(vec![provider], Arc::new(BrokenCache { fail_reads: false }));
        let result = enricher.enrich(ADDR, Chain::Ethereum, false).await.unwrap();
        assert_eq!(result.primary_label_type, LabelType::Dex);
    }

    #[tokio::test]
    async fn test_invalid_address_rejected() {
        let enricher = enricher(Vec::new(), Arc::new(MemoryCache::new()));
        let err = enricher.enrich("0x123", Chain::Ethereum, false).await.unwrap_err();
        assert!(matches!(err, EnrichError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_out_of_range_confidence_discarded() {
        let bad = Arc::new(StaticProvider::new(LabelType::Scammer, LabelSource::Chainalysis, 1.5));
        let good = Arc::new(StaticProvider::new(LabelType::Contract, LabelSource::Etherscan, 0.6));
        let enricher = enricher(vec![bad, good], Arc::new(MemoryCache::new()));
        let result = enricher.enrich(ADDR, Chain::Ethereum, false).await.unwrap();
        assert_eq!(result.all_labels.len(), 1);
        assert_eq!(result.primary_source, LabelSource::Etherscan);
    }

    #[tokio::test]
    async fn test_unsupported_chain_not_invoked() {
        let btc_only = Arc::new(BitcoinOnlyProvider(AtomicUsize::new(0)));
        let enricher = enricher(vec![btc_only.clone()], Arc::new(MemoryCache::new()));
        enricher.enrich(ADDR, Chain::Ethereum, false).await.unwrap();
        assert_eq!(btc_only.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fan_out() {
        let provider = Arc::new(StaticProvider {
            delay: Duration::from_millis(50),
            ..StaticProvider::new(LabelType::Exchange, LabelSource::Arkham, 0.85)
        });
        let enricher = enricher(vec![provider.clone()], Arc::new(MemoryCache::new()));

        let requests = (0..5).map(|_| enricher.enrich(ADDR, Chain::Ethereum, false));
        let results = join_all(requests).await;

        assert_eq!(provider.calls(), 1);
        let first = results[0].clone().unwrap();
        for result in results {
            assert_eq!(result.unwrap(), first);
        }
        assert!(enricher.inner.lock_in_flight().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_still_completes_and_clears_in_flight() {
        let cache = Arc::new(MemoryCache::new());
        let provider = Arc::new(StaticProvider {
            delay: Duration::from_millis(50),
            ..StaticProvider::new(LabelType::Exchange, LabelSource::Arkham, 0.85)
        });
        let enricher = enricher(vec![provider.clone()], cache.clone());

        let request = tokio::spawn({
            let enricher = enricher.clone();
            async move { enricher.enrich(ADDR, Chain::Ethereum, false).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(enricher.inner.lock_in_flight().len(), 1);
        request.abort();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(enricher.inner.lock_in_flight().is_empty());
        assert_eq!(cache.len().await, 1);

        let hit = enricher.enrich(ADDR, Chain::Ethereum, false).await.unwrap();
        assert!(hit.cached);
        assert_eq!(provider.calls(), 1);
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::http::build_client;

/// A suggested asking band in pence. `low <= mid <= high` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceEstimate {
    pub low_pence: i64,
    pub mid_pence: i64,
    pub high_pence: i64,
}

impl PriceEstimate {
    pub fn flat(pence: i64) -> Self {
        Self {
            low_pence: pence,
            mid_pence: pence,
            high_pence: pence,
        }
    }
}

/// Versioned pricing knobs. A new version is published whenever the learning
/// loop adjusts biases; the estimator cache keys on the version so stale
/// entries never outlive a config change.
#[derive(Debug, Clone)]
pub struct PricingConfig {
    pub version: u64,
    pub global_min_pence: i64,
    pub global_max_pence: i64,
    /// Fallback band per category id, used when comps are unavailable.
    pub default_bands: HashMap<String, PriceEstimate>,
    /// Signed shift in pence per "category|condition" bucket.
    pub bias_pence: HashMap<String, i64>,
}

impl PricingConfig {
    pub fn from_env() -> Self {
        let global_min_pence = env_i64("GLOBAL_MIN_PRICE_PENCE", 50);
        let global_max_pence = env_i64("GLOBAL_MAX_PRICE_PENCE", 50_000);
        Self {
            version: 1,
            global_min_pence,
            global_max_pence: global_max_pence.max(global_min_pence),
            default_bands: builtin_default_bands(),
            bias_pence: HashMap::new(),
        }
    }

    pub fn bucket_key(category_id: &str, condition: &str) -> String {
        format!(
            "{}|{}",
            category_id.trim().to_lowercase(),
            condition.trim().to_lowercase()
        )
    }

    fn default_band(&self, category_id: &str) -> PriceEstimate {
        if let Some(band) = self.default_bands.get(category_id) {
            return *band;
        }
        // Middle-of-the-road band when the category has no seed.
        let mid = (self.global_min_pence + self.global_max_pence) / 20;
        PriceEstimate {
            low_pence: mid / 2,
            mid_pence: mid,
            high_pence: mid * 2,
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn builtin_default_bands() -> HashMap<String, PriceEstimate> {
    let seeds: [(&str, i64, i64, i64); 6] = [
        ("1904", 1_200, 1_800, 2_600),
        ("1801", 500, 900, 1_400),
        ("2050", 1_000, 1_600, 2_400),
        ("2200", 1_500, 2_500, 4_000),
        ("1100", 800, 1_400, 2_200),
        ("3300", 1_800, 3_000, 5_000),
    ];
    seeds
        .into_iter()
        .map(|(id, low, mid, high)| {
            (
                id.to_string(),
                PriceEstimate {
                    low_pence: low,
                    mid_pence: mid,
                    high_pence: high,
                },
            )
        })
        .collect()
}

/// Shared, swappable pricing config. Readers take a cheap snapshot; the
/// learning loop publishes replacements with a bumped version.
#[derive(Clone)]
pub struct PricingConfigHandle {
    inner: Arc<RwLock<Arc<PricingConfig>>>,
}

impl PricingConfigHandle {
    pub fn new(config: PricingConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn current(&self) -> Arc<PricingConfig> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn publish(&self, config: PricingConfig) {
        match self.inner.write() {
            Ok(mut guard) => *guard = Arc::new(config),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(config),
        }
    }
}

#[derive(Debug, Error)]
pub enum CompsError {
    #[error("comps source not configured")]
    NotConfigured,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompsQuery {
    pub brand: String,
    pub category_id: String,
    pub size: String,
    pub condition: String,
}

impl CompsQuery {
    /// Normalizes free-text inputs so "Nike " and "nike" hit the same cache slot.
    pub fn new(brand: &str, category_id: &str, size: &str, condition: &str) -> Self {
        Self {
            brand: brand.trim().to_lowercase(),
            category_id: category_id.trim().to_lowercase(),
            size: size.trim().to_lowercase(),
            condition: condition.trim().to_lowercase(),
        }
    }
}

/// Sold-comparable lookup. Returns recent sold prices in pence, most recent
/// first; order does not matter to the estimator.
#[async_trait]
pub trait CompsSource: Send + Sync {
    async fn lookup(&self, query: &CompsQuery) -> Result<Vec<i64>, CompsError>;
}

#[derive(Debug, Deserialize)]
struct CompsExample {
    price_gbp: f64,
}

#[derive(Debug, Deserialize)]
struct CompsResponse {
    #[serde(default)]
    examples: Vec<CompsExample>,
}

/// Comps over HTTP. Tries `/api/price` first and falls back to `/price` for
/// older gateway deployments.
pub struct HttpCompsSource {
    http: reqwest::Client,
    base_url: String,
}

impl HttpCompsSource {
    pub fn from_env() -> Self {
        Self {
            http: build_client(),
            base_url: std::env::var("COMPS_BASE_URL").unwrap_or_default(),
        }
    }

    async fn fetch(&self, url: &str, query: &CompsQuery) -> Result<Vec<i64>, CompsError> {
        let response = self
            .http
            .get(url)
            .query(&[
                ("brand", query.brand.as_str()),
                ("category", query.category_id.as_str()),
                ("size", query.size.as_str()),
                ("condition", query.condition.as_str()),
            ])
            .send()
            .await
            .map_err(|e| CompsError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CompsError::Http(format!("status {}", response.status())));
        }
        let body: CompsResponse = response
            .json()
            .await
            .map_err(|e| CompsError::InvalidResponse(e.to_string()))?;
        Ok(body
            .examples
            .iter()
            .map(|ex| (ex.price_gbp * 100.0).round() as i64)
            .filter(|p| *p > 0)
            .collect())
    }
}

#[async_trait]
impl CompsSource for HttpCompsSource {
    async fn lookup(&self, query: &CompsQuery) -> Result<Vec<i64>, CompsError> {
        if self.base_url.is_empty() {
            return Err(CompsError::NotConfigured);
        }
        let primary = format!("{}/api/price", self.base_url.trim_end_matches('/'));
        match self.fetch(&primary, query).await {
            Ok(prices) => Ok(prices),
            Err(primary_err) => {
                let legacy = format!("{}/price", self.base_url.trim_end_matches('/'));
                self.fetch(&legacy, query).await.map_err(|_| primary_err)
            }
        }
    }
}

type CacheSlot = (u64, Arc<OnceCell<PriceEstimate>>);

/// Price suggestion with a versioned single-flight cache: concurrent requests
/// for the same normalized key share one comps lookup, and a published config
/// version invalidates every cached band.
pub struct PriceEstimator {
    source: Arc<dyn CompsSource>,
    config: PricingConfigHandle,
    cache: Mutex<HashMap<CompsQuery, CacheSlot>>,
}

impl PriceEstimator {
    pub fn new(source: Arc<dyn CompsSource>, config: PricingConfigHandle) -> Self {
        Self {
            source,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PricingConfigHandle {
        &self.config
    }

    pub async fn estimate(&self, query: &CompsQuery) -> PriceEstimate {
        let config = self.config.current();
        let cell = self.cache_slot(query, config.version);
        if let Some(estimate) = cell.get() {
            crate::metrics::price_cache("hit");
            return *estimate;
        }
        crate::metrics::price_cache("miss");
        *cell
            .get_or_init(|| async { self.compute(query, &config).await })
            .await
    }

    fn cache_slot(&self, query: &CompsQuery, version: u64) -> Arc<OnceCell<PriceEstimate>> {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match cache.get(query) {
            Some((cached_version, cell)) if *cached_version == version => Arc::clone(cell),
            _ => {
                let cell = Arc::new(OnceCell::new());
                cache.insert(query.clone(), (version, Arc::clone(&cell)));
                cell
            }
        }
    }

    async fn compute(&self, query: &CompsQuery, config: &PricingConfig) -> PriceEstimate {
        let band = match self.source.lookup(query).await {
            Ok(comps) if !comps.is_empty() => percentile_band(&comps),
            Ok(_) => {
                debug!(
                    target = "magpie.pricing",
                    category = %query.category_id,
                    "no comps returned, using default band"
                );
                crate::metrics::price_cache("fallback");
                config.default_band(&query.category_id)
            }
            Err(err) => {
                warn!(
                    target = "magpie.pricing",
                    category = %query.category_id,
                    error = %err,
                    "comps lookup failed, using default band"
                );
                crate::metrics::price_cache("fallback");
                config.default_band(&query.category_id)
            }
        };
        let shifted = apply_bias(band, query, config);
        clamp_band(shifted, config.global_min_pence, config.global_max_pence)
    }
}

/// 25th/50th/75th percentiles with linear interpolation between order
/// statistics, matching the common statistical convention.
pub fn percentile_band(comps: &[i64]) -> PriceEstimate {
    let mut sorted = comps.to_vec();
    sorted.sort_unstable();
    PriceEstimate {
        low_pence: percentile(&sorted, 0.25),
        mid_pence: percentile(&sorted, 0.50),
        high_pence: percentile(&sorted, 0.75),
    }
}

fn percentile(sorted: &[i64], p: f64) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let fraction = rank - lower as f64;
    let interpolated = sorted[lower] as f64 + fraction * (sorted[upper] - sorted[lower]) as f64;
    interpolated.round() as i64
}

fn apply_bias(band: PriceEstimate, query: &CompsQuery, config: &PricingConfig) -> PriceEstimate {
    let key = PricingConfig::bucket_key(&query.category_id, &query.condition);
    let shift = config.bias_pence.get(&key).copied().unwrap_or(0);
    if shift == 0 {
        return band;
    }
    debug!(
        target = "magpie.pricing",
        bucket = %key,
        shift_pence = shift,
        "applying learned bias"
    );
    PriceEstimate {
        low_pence: band.low_pence + shift,
        mid_pence: band.mid_pence + shift,
        high_pence: band.high_pence + shift,
    }
}

/// Clamps a band into the global bounds. When clamping would break the
/// low <= mid <= high ordering, the whole band collapses to the clamped mid.
fn clamp_band(band: PriceEstimate, min_pence: i64, max_pence: i64) -> PriceEstimate {
    let clamped = PriceEstimate {
        low_pence: band.low_pence.clamp(min_pence, max_pence),
        mid_pence: band.mid_pence.clamp(min_pence, max_pence),
        high_pence: band.high_pence.clamp(min_pence, max_pence),
    };
    if clamped.low_pence <= clamped.mid_pence && clamped.mid_pence <= clamped.high_pence {
        clamped
    } else {
        PriceEstimate::flat(band.mid_pence.clamp(min_pence, max_pence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedComps {
        prices: Vec<i64>,
        calls: AtomicUsize,
    }

    impl FixedComps {
        fn new(prices: Vec<i64>) -> Self {
            Self {
                prices,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CompsSource for FixedComps {
        async fn lookup(&self, _query: &CompsQuery) -> Result<Vec<i64>, CompsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Small delay so concurrent callers overlap inside the cell init.
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(self.prices.clone())
        }
    }

    struct FailingComps;

    #[async_trait]
    impl CompsSource for FailingComps {
        async fn lookup(&self, _query: &CompsQuery) -> Result<Vec<i64>, CompsError> {
            Err(CompsError::Http("gateway unreachable".into()))
        }
    }

    fn test_config() -> PricingConfig {
        PricingConfig {
            version: 1,
            global_min_pence: 50,
            global_max_pence: 50_000,
            default_bands: builtin_default_bands(),
            bias_pence: HashMap::new(),
        }
    }

    #[test]
    fn percentiles_interpolate_between_comps() {
        let band = percentile_band(&[2_000, 2_200, 2_500, 3_000]);
        assert_eq!(band.low_pence, 2_150);
        assert_eq!(band.mid_pence, 2_350);
        assert_eq!(band.high_pence, 2_625);
    }

    #[test]
    fn percentile_of_single_comp_is_that_comp() {
        let band = percentile_band(&[1_500]);
        assert_eq!(band, PriceEstimate::flat(1_500));
    }

    #[test]
    fn malformed_band_collapses_to_clamped_mid() {
        // An inverted band (bad seed data) must not leak through the clamp.
        let band = PriceEstimate {
            low_pence: 4_000,
            mid_pence: 3_000,
            high_pence: 2_000,
        };
        let clamped = clamp_band(band, 50, 50_000);
        assert_eq!(clamped, PriceEstimate::flat(3_000));
    }

    #[test]
    fn clamp_keeps_ordered_band_intact() {
        let band = PriceEstimate {
            low_pence: 100,
            mid_pence: 200,
            high_pence: 90_000,
        };
        let clamped = clamp_band(band, 50, 50_000);
        assert_eq!(clamped.low_pence, 100);
        assert_eq!(clamped.mid_pence, 200);
        assert_eq!(clamped.high_pence, 50_000);
    }

    #[tokio::test]
    async fn concurrent_same_key_requests_share_one_lookup() {
        let source = Arc::new(FixedComps::new(vec![2_000, 2_200, 2_500, 3_000]));
        let estimator = Arc::new(PriceEstimator::new(
            source.clone(),
            PricingConfigHandle::new(test_config()),
        ));
        let query = CompsQuery::new("Nike", "1904", "L", "good");

        let a = estimator.clone();
        let b = estimator.clone();
        let qa = query.clone();
        let qb = query.clone();
        let (first, second) = tokio::join!(
            async move { a.estimate(&qa).await },
            async move { b.estimate(&qb).await },
        );

        assert_eq!(first, second);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn normalized_keys_hit_the_same_slot() {
        let source = Arc::new(FixedComps::new(vec![2_000, 2_200, 2_500, 3_000]));
        let estimator = PriceEstimator::new(source.clone(), PricingConfigHandle::new(test_config()));

        estimator
            .estimate(&CompsQuery::new("Nike", "1904", "L", "Good"))
            .await;
        estimator
            .estimate(&CompsQuery::new("  nike ", "1904", "l", "good"))
            .await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publishing_a_new_version_invalidates_the_cache() {
        let source = Arc::new(FixedComps::new(vec![2_000, 2_200, 2_500, 3_000]));
        let handle = PricingConfigHandle::new(test_config());
        let estimator = PriceEstimator::new(source.clone(), handle.clone());
        let query = CompsQuery::new("Nike", "1904", "L", "good");

        let before = estimator.estimate(&query).await;

        let mut next = test_config();
        next.version = 2;
        next.bias_pence
            .insert(PricingConfig::bucket_key("1904", "good"), 300);
        handle.publish(next);

        let after = estimator.estimate(&query).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(after.mid_pence, before.mid_pence + 300);
    }

    #[tokio::test]
    async fn comps_failure_falls_back_to_default_band() {
        let estimator = PriceEstimator::new(
            Arc::new(FailingComps),
            PricingConfigHandle::new(test_config()),
        );
        let query = CompsQuery::new("Nike", "1904", "L", "good");

        let band = estimator.estimate(&query).await;
        assert_eq!(band.mid_pence, 1_800);
        assert_eq!(band.low_pence, 1_200);
        assert_eq!(band.high_pence, 2_600);
    }

    #[tokio::test]
    async fn bias_shifts_the_whole_band() {
        let mut config = test_config();
        config
            .bias_pence
            .insert(PricingConfig::bucket_key("1904", "good"), -200);
        let estimator = PriceEstimator::new(
            Arc::new(FixedComps::new(vec![2_000, 2_200, 2_500, 3_000])),
            PricingConfigHandle::new(config),
        );

        let band = estimator
            .estimate(&CompsQuery::new("Nike", "1904", "L", "good"))
            .await;
        assert_eq!(band.low_pence, 1_950);
        assert_eq!(band.mid_pence, 2_150);
        assert_eq!(band.high_pence, 2_425);
    }
}

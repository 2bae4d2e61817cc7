//! Token pricing against a bulk oracle, with a TTL-bounded cache and a
//! fallback chain for the ledger's native coin.
//!
//! The cache is one explicit object refreshed wholesale from a single list
//! call. Entries are deliberately retained past their TTL: when a refresh
//! attempt fails and the cache still holds a prior snapshot, callers keep
//! getting stale prices instead of nothing. Only a failed refresh over an
//! empty cache surfaces as unavailable.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::types::PriceSource;

/// Oracle price entries must carry decimals in this range to be accepted.
const MAX_PRICE_ENTRY_DECIMALS: i64 = 50;

/// One validated price cache entry.
#[derive(Debug, Clone)]
pub struct PriceCacheEntry {
    pub symbol: String,
    pub decimals: u32,
    pub price_usd: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Explicit bulk price cache with a TTL field. Constructed once and shared
/// by reference; there is no process-wide singleton.
#[derive(Debug)]
pub struct PriceCache {
    entries: HashMap<String, PriceCacheEntry>,
    ttl: Duration,
    last_refresh: Option<DateTime<Utc>>,
}

impl PriceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            last_refresh: None,
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.last_refresh {
            Some(at) => {
                now.signed_duration_since(at).to_std().map_or(false, |age| age < self.ttl)
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, token_id: &str) -> Option<&PriceCacheEntry> {
        self.entries.get(token_id)
    }

    fn replace(&mut self, entries: HashMap<String, PriceCacheEntry>, now: DateTime<Utc>) {
        self.entries = entries;
        self.last_refresh = Some(now);
    }
}

/// Outcome of one cache refresh, surfaced into the audit trail.
#[derive(Debug, Clone)]
pub struct PriceCacheStatus {
    pub entries: usize,
    /// False when a failed refresh fell back to serving stale data.
    pub refreshed: bool,
    pub native_source: Option<PriceSource>,
}

#[async_trait]
pub trait PricingService: Send + Sync {
    /// Current USD price for a token, or `None` when unavailable.
    async fn price_usd(&self, token_id: &str) -> Option<Decimal>;

    /// Token amount (display units) equivalent to `usd_amount`.
    async fn tokens_for_usd(&self, token_id: &str, usd_amount: Decimal) -> Option<Decimal>;

    /// Replaces the bulk cache from the oracle. Fails only when the fetch
    /// failed *and* there is no prior cache to keep serving.
    async fn refresh_cache(&self) -> Result<PriceCacheStatus>;

    /// Cached entry lookup without triggering a refresh.
    async fn cached_entry(&self, token_id: &str) -> Option<PriceCacheEntry>;
}

/// Raw oracle list entry before validation.
#[derive(Debug, Deserialize)]
struct RawOracleToken {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    decimals: Option<i64>,
    #[serde(default, rename = "priceUsd")]
    price_usd: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ExchangeRateResponse {
    current_rate: ExchangeRate,
}

#[derive(Debug, Deserialize)]
struct ExchangeRate {
    hbar_equivalent: i64,
    cent_equivalent: i64,
}

/// Bulk pricing service backed by the oracle `/tokens` list, with the
/// native coin special-cased through the mirror node exchange-rate record.
pub struct OraclePricingService {
    http: Client,
    oracle_base_url: String,
    mirror_base_url: String,
    api_key: Option<String>,
    /// Cache key (and listing symbol) of the native coin.
    native_key: String,
    native_fallback_price: Decimal,
    cache: RwLock<PriceCache>,
}

impl OraclePricingService {
    pub fn new(
        http: Client,
        oracle_base_url: String,
        mirror_base_url: String,
        api_key: Option<String>,
        native_key: String,
        native_fallback_price: Decimal,
        ttl: Duration,
    ) -> Self {
        Self {
            http,
            oracle_base_url,
            mirror_base_url,
            api_key,
            native_key,
            native_fallback_price,
            cache: RwLock::new(PriceCache::new(ttl)),
        }
    }

    async fn fetch_oracle_list(&self) -> Result<Vec<RawOracleToken>> {
        let url = format!("{}/tokens", self.oracle_base_url.trim_end_matches('/'));
        let mut request = self.http.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let response = request.send().await.context("price oracle request failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("price oracle returned {status}");
        }
        response
            .json::<Vec<RawOracleToken>>()
            .await
            .context("malformed price oracle response")
    }

    /// Native coin price, walking the fallback chain. The winning tier is
    /// returned so it lands in the audit trail.
    async fn resolve_native_price(
        &self,
        entries: &mut HashMap<String, PriceCacheEntry>,
        now: DateTime<Utc>,
    ) -> PriceSource {
        match self.fetch_exchange_rate().await {
            Ok(rate) => {
                if let Some(price) = native_price_from_rate(&rate) {
                    entries.insert(
                        self.native_key.clone(),
                        PriceCacheEntry {
                            symbol: self.native_key.clone(),
                            decimals: 8,
                            price_usd: price,
                            updated_at: now,
                        },
                    );
                    debug!("native price {price} from exchange rate record");
                    return PriceSource::ExchangeRate;
                }
                warn!("exchange rate record had non-positive equivalents, falling back");
            }
            Err(e) => warn!("exchange rate endpoint unavailable: {e:#}"),
        }

        // Second tier: the oracle list itself may carry the native coin.
        let from_oracle = entries
            .values()
            .find(|e| e.symbol.eq_ignore_ascii_case(&self.native_key))
            .cloned();
        if let Some(entry) = from_oracle {
            debug!("native price {} from oracle list", entry.price_usd);
            entries.insert(self.native_key.clone(), entry);
            return PriceSource::Oracle;
        }

        warn!(
            "no live source for native price, using hardcoded estimate {}",
            self.native_fallback_price
        );
        entries.insert(
            self.native_key.clone(),
            PriceCacheEntry {
                symbol: self.native_key.clone(),
                decimals: 8,
                price_usd: self.native_fallback_price,
                updated_at: now,
            },
        );
        PriceSource::HardcodedEstimate
    }

    async fn fetch_exchange_rate(&self) -> Result<ExchangeRate> {
        let url = format!(
            "{}/api/v1/network/exchangerate",
            self.mirror_base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("exchange rate request failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("exchange rate endpoint returned {status}");
        }
        let parsed: ExchangeRateResponse = response
            .json()
            .await
            .context("malformed exchange rate response")?;
        Ok(parsed.current_rate)
    }

    /// Ensures the cache is usable, refreshing it when stale. Returns false
    /// when no price data is available at all.
    async fn ensure_cache(&self) -> bool {
        {
            let cache = self.cache.read().await;
            if cache.is_fresh(Utc::now()) {
                return true;
            }
        }
        match self.refresh_cache().await {
            Ok(_) => true,
            Err(e) => {
                warn!("price cache unavailable: {e:#}");
                false
            }
        }
    }
}

#[async_trait]
impl PricingService for OraclePricingService {
    async fn price_usd(&self, token_id: &str) -> Option<Decimal> {
        if !self.ensure_cache().await {
            return None;
        }
        let cache = self.cache.read().await;
        match cache.get(token_id) {
            Some(entry) => Some(entry.price_usd),
            None => {
                warn!("token {token_id} not found in price data");
                None
            }
        }
    }

    async fn tokens_for_usd(&self, token_id: &str, usd_amount: Decimal) -> Option<Decimal> {
        let price = self.price_usd(token_id).await?;
        if price <= Decimal::ZERO {
            warn!("no positive price for token {token_id}");
            return None;
        }
        Some(usd_amount / price)
    }

    #[instrument(skip(self))]
    async fn refresh_cache(&self) -> Result<PriceCacheStatus> {
        let now = Utc::now();
        match self.fetch_oracle_list().await {
            Ok(raw_tokens) => {
                let total = raw_tokens.len();
                let mut entries = HashMap::with_capacity(total);
                let mut skipped = 0usize;
                for raw in raw_tokens {
                    match validate_oracle_entry(raw, now) {
                        Some((id, entry)) => {
                            entries.insert(id, entry);
                        }
                        None => skipped += 1,
                    }
                }
                let native_source = self.resolve_native_price(&mut entries, now).await;
                let count = entries.len();
                let mut cache = self.cache.write().await;
                cache.replace(entries, now);
                info!(
                    "price cache refreshed: {count} entries ({skipped} skipped), native via {}",
                    native_source.as_str()
                );
                Ok(PriceCacheStatus {
                    entries: count,
                    refreshed: true,
                    native_source: Some(native_source),
                })
            }
            Err(e) => {
                let cache = self.cache.read().await;
                if cache.is_empty() {
                    Err(e.context("price cache refresh failed with no prior data"))
                } else {
                    warn!(
                        "price cache refresh failed, serving {} stale entries: {e:#}",
                        cache.len()
                    );
                    Ok(PriceCacheStatus {
                        entries: cache.len(),
                        refreshed: false,
                        native_source: None,
                    })
                }
            }
        }
    }

    async fn cached_entry(&self, token_id: &str) -> Option<PriceCacheEntry> {
        self.cache.read().await.get(token_id).cloned()
    }
}

/// `price = cent_equivalent / (100 × hbar_equivalent)`.
fn native_price_from_rate(rate: &ExchangeRate) -> Option<Decimal> {
    if rate.hbar_equivalent <= 0 || rate.cent_equivalent < 0 {
        return None;
    }
    Some(
        Decimal::from(rate.cent_equivalent)
            / (Decimal::from(100) * Decimal::from(rate.hbar_equivalent)),
    )
}

/// Validates one raw oracle entry: non-empty id, parseable non-negative
/// price, decimals in range. Anything else is skipped with a warning.
fn validate_oracle_entry(
    raw: RawOracleToken,
    now: DateTime<Utc>,
) -> Option<(String, PriceCacheEntry)> {
    let id = match raw.id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            warn!("skipping price entry with empty id");
            return None;
        }
    };
    let decimals = raw.decimals.unwrap_or(0);
    if !(0..=MAX_PRICE_ENTRY_DECIMALS).contains(&decimals) {
        warn!("skipping price entry {id}: decimals {decimals} out of range");
        return None;
    }
    let price_usd = match raw.price_usd.as_ref().and_then(parse_price) {
        Some(price) if !price.is_sign_negative() => price,
        Some(price) => {
            warn!("skipping price entry {id}: negative price {price}");
            return None;
        }
        None => {
            warn!("skipping price entry {id}: unparseable price {:?}", raw.price_usd);
            return None;
        }
    };
    Some((
        id,
        PriceCacheEntry {
            symbol: raw.symbol.unwrap_or_default(),
            decimals: decimals as u32,
            price_usd,
            updated_at: now,
        },
    ))
}

fn parse_price(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn raw(id: Option<&str>, price: Value, decimals: i64) -> RawOracleToken {
        RawOracleToken {
            id: id.map(str::to_string),
            symbol: Some("TOK".to_string()),
            decimals: Some(decimals),
            price_usd: Some(price),
        }
    }

    #[test]
    fn exchange_rate_price_formula() {
        // 1 hbar worth 12 cents -> $0.12
        let rate = ExchangeRate {
            hbar_equivalent: 1,
            cent_equivalent: 12,
        };
        assert_eq!(native_price_from_rate(&rate), Some(dec!(0.12)));

        // 30000 hbar worth 153000 cents -> $0.051
        let rate = ExchangeRate {
            hbar_equivalent: 30_000,
            cent_equivalent: 153_000,
        };
        assert_eq!(native_price_from_rate(&rate), Some(dec!(0.051)));

        let rate = ExchangeRate {
            hbar_equivalent: 0,
            cent_equivalent: 100,
        };
        assert_eq!(native_price_from_rate(&rate), None);
    }

    #[test]
    fn accepts_string_and_numeric_prices() {
        let now = Utc::now();
        let (_, entry) = validate_oracle_entry(raw(Some("0.0.1"), json!("0.0176"), 6), now).unwrap();
        assert_eq!(entry.price_usd, dec!(0.0176));

        let (_, entry) = validate_oracle_entry(raw(Some("0.0.2"), json!(0.005), 8), now).unwrap();
        assert_eq!(entry.price_usd, dec!(0.005));
    }

    #[test]
    fn rejects_invalid_entries() {
        let now = Utc::now();
        assert!(validate_oracle_entry(raw(None, json!("1"), 6), now).is_none());
        assert!(validate_oracle_entry(raw(Some("  "), json!("1"), 6), now).is_none());
        assert!(validate_oracle_entry(raw(Some("0.0.1"), json!("oops"), 6), now).is_none());
        assert!(validate_oracle_entry(raw(Some("0.0.1"), json!("-1"), 6), now).is_none());
        assert!(validate_oracle_entry(raw(Some("0.0.1"), json!("1"), 51), now).is_none());
        assert!(validate_oracle_entry(raw(Some("0.0.1"), json!("1"), -1), now).is_none());
    }

    #[test]
    fn cache_freshness_tracks_ttl() {
        let mut cache = PriceCache::new(Duration::from_secs(300));
        let now = Utc::now();
        assert!(!cache.is_fresh(now));

        cache.replace(HashMap::new(), now);
        assert!(cache.is_fresh(now + chrono::Duration::seconds(299)));
        assert!(!cache.is_fresh(now + chrono::Duration::seconds(301)));
    }
}

//! Paginated holder listing fetcher.
//!
//! Walks the mirror node's cursor chain strictly sequentially: each page
//! carries an opaque `links.next` path and upstream cursors are short-lived,
//! so a failed fetch restarts from page one rather than resuming. Every page
//! request runs inside an explicit bounded retry loop with exponential
//! backoff and jitter, and a governor rate limiter enforces minimum
//! inter-request spacing regardless of retry state.

use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rand::Rng;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info, instrument, warn};

use crate::config::{is_entity_id, AppConfig, TokenEntry};

use super::capture::RawPageCapture;
use super::types::{HolderBalance, RefreshError};

/// Result of walking the complete cursor chain for one token.
#[derive(Debug)]
pub struct FetchedHolders {
    pub holders: Vec<HolderBalance>,
    pub pages: u32,
    /// HTTP requests issued, including retries.
    pub requests: u32,
    /// Entries rejected by per-record validation.
    pub dropped_entries: u32,
}

/// Seam between the orchestrator and the listing API.
#[async_trait]
pub trait HolderSource: Send + Sync {
    /// Fetches the complete holder set for `token`, restricted server-side
    /// to accounts with raw balance strictly above `min_balance_raw`
    /// (smallest unit).
    async fn fetch_holders(
        &self,
        token: &TokenEntry,
        decimals: u32,
        min_balance_raw: u64,
        capture: &mut RawPageCapture,
    ) -> Result<FetchedHolders, RefreshError>;
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub base_url: String,
    pub page_size: u32,
    pub request_timeout: Duration,
    pub request_spacing: Duration,
    pub max_rate_limit_retries: u32,
    pub max_server_error_retries: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    pub max_accounts: u64,
}

impl FetcherConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            base_url: config.mirror_base_url.trim_end_matches('/').to_string(),
            page_size: config.page_size,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            request_spacing: Duration::from_millis(config.request_spacing_ms),
            max_rate_limit_retries: config.max_rate_limit_retries,
            max_server_error_retries: config.max_server_error_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
            max_accounts: config.max_accounts,
        }
    }
}

pub struct MirrorNodeFetcher {
    http: Client,
    limiter: DefaultDirectRateLimiter,
    config: FetcherConfig,
}

impl MirrorNodeFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let spacing = config.request_spacing.max(Duration::from_millis(1));
        let quota = Quota::with_period(spacing)
            .ok_or_else(|| anyhow::anyhow!("invalid request spacing {spacing:?}"))?;
        Ok(Self {
            http,
            limiter: RateLimiter::direct(quota),
            config,
        })
    }

    fn first_page_url(&self, token: &TokenEntry, min_balance_raw: u64) -> String {
        if token.native {
            format!(
                "{}/api/v1/accounts?account.balance=gt:{}&limit={}",
                self.config.base_url, min_balance_raw, self.config.page_size
            )
        } else {
            format!(
                "{}/api/v1/tokens/{}/balances?account.balance=gt:{}&limit={}",
                self.config.base_url, token.token_id, min_balance_raw, self.config.page_size
            )
        }
    }

    /// One page GET inside an explicit bounded retry loop. 429 responses
    /// honor `Retry-After` when present and have their own attempt budget;
    /// 5xx and transport errors (timeout, reset) share a smaller one.
    /// Returns the raw body and the number of requests issued.
    async fn get_page(&self, url: &str) -> Result<(String, u32), RefreshError> {
        let mut backoff = ExponentialBackoff::from_millis(2)
            .factor(self.config.backoff_base.as_millis().max(2) as u64 / 2)
            .max_delay(self.config.max_backoff);
        let mut rate_limit_attempts = 0u32;
        let mut transient_attempts = 0u32;
        let mut requests = 0u32;

        loop {
            self.limiter.until_ready().await;
            requests += 1;

            let wait = match self.http.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body = response.text().await.map_err(|e| {
                            RefreshError::Network(format!("reading page body: {e}"))
                        })?;
                        return Ok((body, requests));
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        rate_limit_attempts += 1;
                        if rate_limit_attempts > self.config.max_rate_limit_retries {
                            return Err(RefreshError::Network(format!(
                                "rate limited after {rate_limit_attempts} attempts on {url}"
                            )));
                        }
                        let retry_after = response
                            .headers()
                            .get(reqwest::header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.trim().parse::<u64>().ok())
                            .map(Duration::from_secs);
                        let delay = match retry_after {
                            Some(given) => given,
                            None => self.next_delay(&mut backoff),
                        };
                        warn!(
                            "rate limited (429), waiting {delay:?} before attempt {}",
                            rate_limit_attempts + 1
                        );
                        delay
                    } else if status.is_server_error() {
                        transient_attempts += 1;
                        if transient_attempts > self.config.max_server_error_retries {
                            return Err(RefreshError::Network(format!(
                                "{status} after {transient_attempts} attempts on {url}"
                            )));
                        }
                        let delay = self.next_delay(&mut backoff);
                        warn!("server error {status}, retrying in {delay:?}");
                        delay
                    } else {
                        return Err(RefreshError::Network(format!(
                            "unexpected status {status} on {url}"
                        )));
                    }
                }
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                    transient_attempts += 1;
                    if transient_attempts > self.config.max_server_error_retries {
                        return Err(RefreshError::Network(format!(
                            "transport failure after {transient_attempts} attempts: {e}"
                        )));
                    }
                    let delay = self.next_delay(&mut backoff);
                    warn!("transport error ({e}), retrying in {delay:?}");
                    delay
                }
                Err(e) => return Err(RefreshError::Network(e.to_string())),
            };

            tokio::time::sleep(wait).await;
        }
    }

    /// Next backoff step (`base × 2^attempt`, capped) plus additive jitter.
    fn next_delay(&self, backoff: &mut impl Iterator<Item = Duration>) -> Duration {
        let base = backoff.next().unwrap_or(self.config.max_backoff);
        let jitter_cap = (self.config.backoff_base.as_millis() as u64 / 2).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_cap));
        (base + jitter).min(self.config.max_backoff)
    }
}

#[async_trait]
impl HolderSource for MirrorNodeFetcher {
    #[instrument(skip(self, capture), fields(token = %token.symbol))]
    async fn fetch_holders(
        &self,
        token: &TokenEntry,
        decimals: u32,
        min_balance_raw: u64,
        capture: &mut RawPageCapture,
    ) -> Result<FetchedHolders, RefreshError> {
        let mut url = self.first_page_url(token, min_balance_raw);
        let mut holders: Vec<HolderBalance> = Vec::new();
        let mut pages = 0u32;
        let mut requests = 0u32;
        let mut dropped = 0u32;

        loop {
            let (body, page_requests) = self.get_page(&url).await?;
            requests += page_requests;
            capture.append(&body).await;

            let page: ListingPage = serde_json::from_str(&body)
                .map_err(|e| RefreshError::Network(format!("malformed page body: {e}")))?;
            pages += 1;

            let entries = if token.native { &page.accounts } else { &page.balances };
            for value in entries {
                match parse_entry(value, decimals) {
                    Some(holder) => holders.push(holder),
                    None => dropped += 1,
                }
            }

            if pages % 10 == 0 {
                debug!("{} holders after {pages} pages", holders.len());
            }
            if holders.len() as u64 >= self.config.max_accounts {
                info!(
                    "account cap {} reached for {}, stopping pagination",
                    self.config.max_accounts, token.symbol
                );
                break;
            }
            match page.links.next {
                Some(next) if !next.is_empty() => {
                    url = format!("{}{}", self.config.base_url, next);
                }
                _ => break,
            }
        }

        info!(
            token = %token.symbol,
            holders = holders.len(),
            pages,
            requests,
            dropped,
            "holder fetch complete"
        );
        Ok(FetchedHolders {
            holders,
            pages,
            requests,
            dropped_entries: dropped,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ListingPage {
    #[serde(default)]
    balances: Vec<Value>,
    #[serde(default)]
    accounts: Vec<Value>,
    #[serde(default)]
    links: ListingLinks,
}

#[derive(Debug, Default, Deserialize)]
struct ListingLinks {
    next: Option<String>,
}

/// Validates one listing entry into a `HolderBalance`, scaling the raw
/// smallest-unit balance by the token's decimals. Malformed entries are
/// dropped with a warning, never fatal to the page.
fn parse_entry(value: &Value, decimals: u32) -> Option<HolderBalance> {
    let account = match value.get("account").and_then(Value::as_str) {
        Some(account) if is_entity_id(account) => account.to_string(),
        other => {
            warn!("skipping entry with invalid account {other:?}");
            return None;
        }
    };
    let raw = match value.get("balance").and_then(raw_balance) {
        Some(raw) => raw,
        None => {
            warn!(
                "skipping entry for {account}: invalid balance {:?}",
                value.get("balance")
            );
            return None;
        }
    };
    Some(HolderBalance {
        account_id: account,
        balance: Decimal::from_i128_with_scale(raw as i128, decimals),
    })
}

/// Raw balance may arrive as an integer, a numeric string, or (for the
/// accounts endpoint) an object wrapping the tinybar amount.
fn raw_balance(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        Value::Object(map) => map
            .get("balance")
            .or_else(|| map.get("tinybars"))
            .and_then(raw_balance),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn parses_integer_and_string_balances() {
        let entry = json!({"account": "0.0.123", "balance": 1_500_000});
        let holder = parse_entry(&entry, 6).unwrap();
        assert_eq!(holder.account_id, "0.0.123");
        assert_eq!(holder.balance, dec!(1.500000));

        let entry = json!({"account": "0.0.124", "balance": "250"});
        let holder = parse_entry(&entry, 2).unwrap();
        assert_eq!(holder.balance, dec!(2.50));
    }

    #[test]
    fn parses_nested_account_balances() {
        let entry = json!({"account": "0.0.2", "balance": {"balance": 100_000_000, "timestamp": "0.0"}});
        let holder = parse_entry(&entry, 8).unwrap();
        assert_eq!(holder.balance, dec!(1.00000000));
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(parse_entry(&json!({"balance": 10}), 6).is_none());
        assert!(parse_entry(&json!({"account": "nope", "balance": 10}), 6).is_none());
        assert!(parse_entry(&json!({"account": "0.0.1", "balance": "12.5"}), 6).is_none());
        assert!(parse_entry(&json!({"account": "0.0.1", "balance": -5}), 6).is_none());
        assert!(parse_entry(&json!({"account": "0.0.1"}), 6).is_none());
    }

    #[test]
    fn first_page_url_shapes() {
        let config = FetcherConfig {
            base_url: "https://mirror.example".to_string(),
            page_size: 100,
            request_timeout: Duration::from_secs(30),
            request_spacing: Duration::from_millis(40),
            max_rate_limit_retries: 5,
            max_server_error_retries: 3,
            backoff_base: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_accounts: 1_000_000,
        };
        let fetcher = MirrorNodeFetcher::new(config).unwrap();

        let token = TokenEntry {
            symbol: "SAUCE".to_string(),
            token_id: "0.0.731861".to_string(),
            decimals: Some(6),
            min_balance_raw: 1,
            native: false,
        };
        assert_eq!(
            fetcher.first_page_url(&token, 56),
            "https://mirror.example/api/v1/tokens/0.0.731861/balances?account.balance=gt:56&limit=100"
        );

        let native = TokenEntry {
            symbol: "HBAR".to_string(),
            token_id: String::new(),
            decimals: Some(8),
            min_balance_raw: 100_000_000,
            native: true,
        };
        assert_eq!(
            fetcher.first_page_url(&native, 100_000_000),
            "https://mirror.example/api/v1/accounts?account.balance=gt:100000000&limit=100"
        );
    }
}

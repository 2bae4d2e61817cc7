//! Configuration loading and validation.
//!
//! The enabled-token list and all tuning knobs live in a single JSON file,
//! with a couple of environment overrides for deployment secrets. Validation
//! is strict and happens before any network call: a broken token entry is a
//! fatal configuration error, not something to discover mid-refresh.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::warn;

use crate::holdings::types::RefreshError;

pub const DEFAULT_CONFIG_PATH: &str = "holderscope.json";

const ENV_DB_PATH: &str = "HOLDERSCOPE_DB_PATH";
const ENV_PRICING_API_KEY: &str = "HOLDERSCOPE_PRICING_API_KEY";

/// Decimal scale cap: balances are stored as `Decimal`, whose scale is
/// limited to 28 fractional digits.
const MAX_TOKEN_DECIMALS: u32 = 28;

/// One enabled token.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub symbol: String,
    /// Ledger entity id, dotted triple (e.g. `0.0.731861`). Ignored for the
    /// native coin, which is listed through the accounts endpoint.
    #[serde(default)]
    pub token_id: String,
    /// Display decimals. When absent, resolved from the price oracle at
    /// refresh time.
    #[serde(default)]
    pub decimals: Option<u32>,
    /// Raw smallest-unit floor used when no USD-derived floor is available.
    #[serde(default = "default_min_balance_raw")]
    pub min_balance_raw: u64,
    /// Marks the ledger's native coin.
    #[serde(default)]
    pub native: bool,
}

fn default_min_balance_raw() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub db_path: String,
    /// Mirror node origin; listing paths and cursor links are appended to it.
    pub mirror_base_url: String,
    /// Bulk price oracle origin.
    pub pricing_base_url: String,
    pub pricing_api_key: Option<String>,
    /// Directory for raw page capture files; capture is skipped when unset.
    pub capture_dir: Option<PathBuf>,
    pub page_size: u32,
    pub request_timeout_secs: u64,
    /// Minimum spacing between page requests, enforced regardless of retry
    /// state.
    pub request_spacing_ms: u64,
    pub max_rate_limit_retries: u32,
    pub max_server_error_retries: u32,
    pub backoff_base_ms: u64,
    pub max_backoff_secs: u64,
    pub price_ttl_secs: u64,
    /// Dust floor: holders below this USD value are excluded server-side
    /// where a price is available.
    pub min_usd_floor: Decimal,
    pub max_accounts: u64,
    pub max_concurrent_refreshes: usize,
    pub stale_after_hours: i64,
    /// Last-resort native coin price when both the exchange-rate endpoint
    /// and the oracle are unavailable.
    pub native_fallback_price_usd: Decimal,
    pub tokens: Vec<TokenEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: "holderscope.db".to_string(),
            mirror_base_url: "https://mainnet-public.mirrornode.hedera.com".to_string(),
            pricing_base_url: "https://api.saucerswap.finance".to_string(),
            pricing_api_key: None,
            capture_dir: Some(PathBuf::from("capture")),
            page_size: 100,
            request_timeout_secs: 30,
            request_spacing_ms: 40,
            max_rate_limit_retries: 5,
            max_server_error_retries: 3,
            backoff_base_ms: 500,
            max_backoff_secs: 30,
            price_ttl_secs: 300,
            min_usd_floor: Decimal::ONE,
            max_accounts: 1_000_000,
            max_concurrent_refreshes: 2,
            stale_after_hours: 24,
            native_fallback_price_usd: Decimal::new(5, 2),
            tokens: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from `path` (or the default location), applies
    /// environment overrides and validates every token entry.
    ///
    /// A missing explicit path is fatal; a missing default file yields the
    /// built-in defaults with an empty token list.
    pub fn load(path: Option<&Path>) -> Result<Self, RefreshError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    warn!(
                        "no config file at {}, using built-in defaults",
                        default.display()
                    );
                    Self::default()
                }
            }
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, RefreshError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            RefreshError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            RefreshError::Config(format!("cannot parse config {}: {e}", path.display()))
        })
    }

    fn apply_env(&mut self) {
        if let Ok(db) = env::var(ENV_DB_PATH) {
            self.db_path = db;
        }
        if let Ok(key) = env::var(ENV_PRICING_API_KEY) {
            if !key.trim().is_empty() {
                self.pricing_api_key = Some(key);
            }
        }
    }

    pub fn validate(&self) -> Result<(), RefreshError> {
        if self.page_size == 0 {
            return Err(RefreshError::Config("page_size must be positive".into()));
        }
        if self.max_concurrent_refreshes == 0 {
            return Err(RefreshError::Config(
                "max_concurrent_refreshes must be positive".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for token in &self.tokens {
            let symbol = token.symbol.trim();
            if symbol.is_empty() {
                return Err(RefreshError::Config("token with empty symbol".into()));
            }
            if !seen.insert(symbol.to_ascii_uppercase()) {
                return Err(RefreshError::Config(format!(
                    "duplicate token symbol {symbol}"
                )));
            }
            if !token.native && !is_entity_id(&token.token_id) {
                return Err(RefreshError::Config(format!(
                    "token {symbol}: invalid token id {:?}",
                    token.token_id
                )));
            }
            if let Some(decimals) = token.decimals {
                if decimals > MAX_TOKEN_DECIMALS {
                    return Err(RefreshError::Config(format!(
                        "token {symbol}: decimals {decimals} out of range (max {MAX_TOKEN_DECIMALS})"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Looks up an enabled token by symbol, case-insensitively.
    pub fn token(&self, symbol: &str) -> Option<&TokenEntry> {
        self.tokens
            .iter()
            .find(|t| t.symbol.eq_ignore_ascii_case(symbol))
    }
}

/// True for dotted-triple ledger entity ids like `0.0.731861`.
pub fn is_entity_id(s: &str) -> bool {
    let mut parts = 0;
    for part in s.split('.') {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        parts += 1;
    }
    parts == 3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(symbol: &str, id: &str) -> TokenEntry {
        TokenEntry {
            symbol: symbol.to_string(),
            token_id: id.to_string(),
            decimals: Some(6),
            min_balance_raw: 1,
            native: false,
        }
    }

    #[test]
    fn entity_id_format() {
        assert!(is_entity_id("0.0.731861"));
        assert!(is_entity_id("1.2.3"));
        assert!(!is_entity_id("0.0"));
        assert!(!is_entity_id("0.0.731861.4"));
        assert!(!is_entity_id("0.0.abc"));
        assert!(!is_entity_id(""));
    }

    #[test]
    fn rejects_duplicate_symbols() {
        let config = AppConfig {
            tokens: vec![token("SAUCE", "0.0.731861"), token("sauce", "0.0.731862")],
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_token_id() {
        let config = AppConfig {
            tokens: vec![token("SAUCE", "not-an-id")],
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversized_decimals() {
        let mut bad = token("SAUCE", "0.0.731861");
        bad.decimals = Some(40);
        let config = AppConfig {
            tokens: vec![bad],
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn native_token_skips_entity_id_check() {
        let config = AppConfig {
            tokens: vec![TokenEntry {
                symbol: "HBAR".to_string(),
                token_id: String::new(),
                decimals: Some(8),
                min_balance_raw: 100_000_000,
                native: true,
            }],
            ..AppConfig::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.token("hbar").is_some());
    }
}

//! Value objects shared across the holder distribution pipeline.
//!
//! Everything that crosses a component boundary is a validated struct or
//! enum; raw API payloads are converted at the fetch/pricing edges and
//! malformed fields are rejected there, record by record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single holder as validated from one listing page entry.
///
/// `balance` is in display units, scaled from the raw smallest-unit integer
/// by the token's decimals, and is exact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderBalance {
    /// Ledger account identifier, dotted triple (e.g. `0.0.12345`).
    pub account_id: String,
    pub balance: Decimal,
}

/// A holder after USD annotation.
///
/// When no price was available both USD fields are `None` and the holder is
/// otherwise carried through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrichedHolder {
    pub account_id: String,
    pub balance: Decimal,
    pub usd_value: Option<Decimal>,
    pub price_usd: Option<Decimal>,
}

/// One persisted holder row, as stored in and read back from `token_holdings`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HolderRecord {
    pub token_symbol: String,
    pub account_id: String,
    pub balance: Decimal,
    /// 1 = largest balance in the batch.
    pub balance_rank: i64,
    /// Set only on percentile marker rows, 1..=99.
    pub percentile_rank: Option<u8>,
    pub is_top_holder: bool,
    pub is_percentile_marker: bool,
    pub usd_value: Option<Decimal>,
    pub price_usd_at_refresh: Option<Decimal>,
    pub refresh_batch_id: String,
}

/// A complete snapshot ready for the atomic swap: every row is built in
/// memory before any storage mutation happens.
#[derive(Debug, Clone)]
pub struct SnapshotBatch {
    pub token_symbol: String,
    pub refresh_batch_id: String,
    pub rows: Vec<HolderRecord>,
    /// Total accounts fetched, before the USD floor filter.
    pub total_accounts_fetched: i64,
    pub price_usd: Option<Decimal>,
    pub price_updated_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
}

/// Per-token refresh status as exposed to status/summary readers.
#[derive(Debug, Clone, Serialize)]
pub struct TokenSummary {
    pub token_symbol: String,
    pub token_id: String,
    pub decimals: i64,
    pub last_refresh_started: Option<DateTime<Utc>>,
    pub last_refresh_completed: Option<DateTime<Utc>>,
    pub last_refresh_success: bool,
    pub refresh_in_progress: bool,
    pub total_accounts_fetched: i64,
    pub price_usd: Option<Decimal>,
    pub price_updated_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub top_holder_rows: i64,
    pub percentile_rows: i64,
}

/// Which tier of the price fallback chain produced the native coin price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    ExchangeRate,
    Oracle,
    HardcodedEstimate,
}

impl PriceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSource::ExchangeRate => "exchange_rate",
            PriceSource::Oracle => "oracle",
            PriceSource::HardcodedEstimate => "hardcoded_estimate",
        }
    }
}

/// Operation tag for append-only refresh log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOperation {
    FetchStarted,
    FetchCompleted,
    PriceCache,
    RefreshRejected,
    Error,
}

impl LogOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogOperation::FetchStarted => "fetch_started",
            LogOperation::FetchCompleted => "fetch_completed",
            LogOperation::PriceCache => "price_cache",
            LogOperation::RefreshRejected => "refresh_rejected",
            LogOperation::Error => "error",
        }
    }
}

/// One append-only audit log entry. `created_at` is assigned by the store
/// and populated when reading entries back.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshLogEntry {
    pub token_symbol: String,
    pub operation: String,
    pub message: Option<String>,
    pub refresh_batch_id: Option<String>,
    pub request_count: Option<i64>,
    pub accounts_processed: Option<i64>,
    pub processing_time_seconds: Option<f64>,
    pub min_usd_filter: Option<Decimal>,
    pub price_source: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl RefreshLogEntry {
    pub fn new(token_symbol: &str, operation: LogOperation) -> Self {
        Self {
            token_symbol: token_symbol.to_string(),
            operation: operation.as_str().to_string(),
            message: None,
            refresh_batch_id: None,
            request_count: None,
            accounts_processed: None,
            processing_time_seconds: None,
            min_usd_filter: None,
            price_source: None,
            created_at: None,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn batch(mut self, batch_id: &str) -> Self {
        self.refresh_batch_id = Some(batch_id.to_string());
        self
    }
}

/// Phase of one refresh invocation. The persisted `refresh_in_progress`
/// flag is the cross-process guard; this enum tracks the in-process state
/// machine and is logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Starting,
    Fetching,
    Computing,
    Swapping,
    Completed,
    Failed,
}

impl RefreshPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshPhase::Idle => "idle",
            RefreshPhase::Starting => "starting",
            RefreshPhase::Fetching => "fetching",
            RefreshPhase::Computing => "computing",
            RefreshPhase::Swapping => "swapping",
            RefreshPhase::Completed => "completed",
            RefreshPhase::Failed => "failed",
        }
    }
}

/// Failure taxonomy for one refresh invocation.
#[derive(Debug, Error)]
pub enum RefreshError {
    /// Missing or invalid token entry or decimals; raised before any
    /// network call.
    #[error("configuration error: {0}")]
    Config(String),

    /// Another refresh holds the per-token single-flight claim.
    #[error("refresh already in progress for {0}")]
    AlreadyInProgress(String),

    /// Transient network failure that exhausted its retry budget, or a
    /// non-retryable HTTP status.
    #[error("network failure: {0}")]
    Network(String),

    /// The listing API returned zero holders; treated as failure because
    /// enabled tokens are known to have circulation.
    #[error("no holders returned for token {0}")]
    EmptySnapshot(String),

    /// Storage failure; the swap transaction was rolled back and the prior
    /// snapshot is intact.
    #[error("storage failure: {0}")]
    Storage(String),
}

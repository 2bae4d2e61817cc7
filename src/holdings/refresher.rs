//! Refresh orchestration.
//!
//! One refresh invocation is a state machine:
//! `Idle → Starting → Fetching → Computing → Swapping → Completed | Failed`.
//! The persisted `refresh_in_progress` flag is the cross-invocation
//! single-flight guard per token; distinct tokens refresh concurrently
//! through a bounded worker pool.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{AppConfig, TokenEntry};

use super::capture::RawPageCapture;
use super::enrich::annotate_usd;
use super::fetcher::HolderSource;
use super::pricing::PricingService;
use super::stats::{rank_and_mark, RankedHolder};
use super::storage::HoldingsStore;
use super::types::{
    HolderRecord, LogOperation, RefreshError, RefreshLogEntry, RefreshPhase, SnapshotBatch,
};

/// Per-invocation knobs; anything unset falls back to the configuration.
#[derive(Debug, Clone, Default)]
pub struct RefreshOptions {
    /// USD dust floor override. An explicit zero disables USD filtering.
    pub min_usd: Option<Decimal>,
}

/// Outcome of one completed refresh.
#[derive(Debug, Clone)]
pub struct RefreshSummary {
    pub token_symbol: String,
    pub refresh_batch_id: String,
    pub total_accounts: usize,
    pub top_holders: usize,
    pub percentile_markers: usize,
    pub pages: u32,
    pub requests: u32,
    pub dropped_entries: u32,
    pub price_usd: Option<Decimal>,
    pub duration_seconds: f64,
}

/// Per-token staleness assessment for the refresh scheduler and CLI.
#[derive(Debug, Clone)]
pub struct StalenessReport {
    pub token_symbol: String,
    pub token_id: String,
    pub needs_refresh: bool,
    pub reason: String,
    pub last_refresh_completed: Option<DateTime<Utc>>,
    pub refresh_in_progress: bool,
}

pub struct RefreshOrchestrator {
    config: Arc<AppConfig>,
    store: Arc<dyn HoldingsStore>,
    pricing: Arc<dyn PricingService>,
    source: Arc<dyn HolderSource>,
}

impl RefreshOrchestrator {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn HoldingsStore>,
        pricing: Arc<dyn PricingService>,
        source: Arc<dyn HolderSource>,
    ) -> Self {
        Self {
            config,
            store,
            pricing,
            source,
        }
    }

    /// Runs one full refresh for `symbol`.
    ///
    /// Rejection because another refresh is in flight leaves no trace in the
    /// metadata; every other failure releases the claim, records the error
    /// and leaves the prior snapshot queryable.
    #[instrument(skip(self, options), fields(token = %symbol))]
    pub async fn refresh_token(
        &self,
        symbol: &str,
        options: &RefreshOptions,
    ) -> Result<RefreshSummary, RefreshError> {
        let token = self
            .config
            .token(symbol)
            .ok_or_else(|| RefreshError::Config(format!("token {symbol} is not enabled")))?
            .clone();

        let started = Instant::now();
        let started_at = Utc::now();
        let mut phase = RefreshPhase::Idle;
        self.transition(&token.symbol, &mut phase, RefreshPhase::Starting);

        // Single-flight claim, checked-and-set under the store's own
        // transaction isolation.
        let claimed = self
            .store
            .try_begin_refresh(&token, started_at)
            .await
            .map_err(|e| RefreshError::Storage(format!("{e:#}")))?;
        if !claimed {
            self.append_log(
                RefreshLogEntry::new(&token.symbol, LogOperation::RefreshRejected)
                    .message("refresh already in progress"),
            )
            .await;
            return Err(RefreshError::AlreadyInProgress(token.symbol.clone()));
        }

        let batch_id = Uuid::new_v4().to_string();
        info!("starting refresh for {} (batch {batch_id})", token.symbol);

        match self
            .run_claimed(&token, &batch_id, options, started, &mut phase)
            .await
        {
            Ok(summary) => {
                self.transition(&token.symbol, &mut phase, RefreshPhase::Completed);
                info!(
                    "{} refresh completed: {} accounts, {} top, {} markers in {:.1}s",
                    token.symbol,
                    summary.total_accounts,
                    summary.top_holders,
                    summary.percentile_markers,
                    summary.duration_seconds
                );
                Ok(summary)
            }
            Err(err) => {
                self.transition(&token.symbol, &mut phase, RefreshPhase::Failed);
                self.record_failure(&token.symbol, &batch_id, &err).await;
                Err(err)
            }
        }
    }

    /// Everything between a successful claim and the snapshot swap. Any
    /// error here is turned into a Failed transition by the caller.
    async fn run_claimed(
        &self,
        token: &TokenEntry,
        batch_id: &str,
        options: &RefreshOptions,
        started: Instant,
        phase: &mut RefreshPhase,
    ) -> Result<RefreshSummary, RefreshError> {
        // One price cache refresh per invocation: the whole batch filters
        // and annotates against a single consistent price.
        let cache_status = match self.pricing.refresh_cache().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("price cache unavailable for this batch: {e:#}");
                None
            }
        };
        let price_key = price_key(token).to_string();
        let price_entry = self.pricing.cached_entry(&price_key).await;

        self.append_log({
            let mut entry = RefreshLogEntry::new(&token.symbol, LogOperation::PriceCache)
                .batch(batch_id);
            entry.message = Some(match &cache_status {
                Some(status) if status.refreshed => {
                    format!("cache refreshed with {} entries", status.entries)
                }
                Some(status) => format!("serving {} stale entries", status.entries),
                None => "price data unavailable".to_string(),
            });
            entry.price_source = cache_status
                .as_ref()
                .and_then(|s| s.native_source)
                .map(|s| s.as_str().to_string());
            entry
        })
        .await;

        let decimals = match token.decimals.or(price_entry.as_ref().map(|e| e.decimals)) {
            Some(decimals) => decimals,
            None => {
                return Err(RefreshError::Config(format!(
                    "no decimals configured or resolvable for {}",
                    token.symbol
                )))
            }
        };

        let min_usd = options.min_usd.unwrap_or(self.config.min_usd_floor);
        let min_usd = (min_usd > Decimal::ZERO).then_some(min_usd);
        let floor_raw = self.derive_floor(token, decimals, min_usd).await;

        self.transition(&token.symbol, phase, RefreshPhase::Fetching);
        self.append_log({
            let mut entry = RefreshLogEntry::new(&token.symbol, LogOperation::FetchStarted)
                .batch(batch_id)
                .message(format!("fetching holders above raw balance {floor_raw}"));
            entry.min_usd_filter = min_usd;
            entry
        })
        .await;

        let mut capture = match &self.config.capture_dir {
            Some(dir) => RawPageCapture::create(dir, &token.symbol).await,
            None => RawPageCapture::inactive(),
        };
        let fetched = self
            .source
            .fetch_holders(token, decimals, floor_raw, &mut capture)
            .await?;
        if fetched.holders.is_empty() {
            // Enabled tokens are known to have circulation; an empty page
            // set means the listing went wrong, not that nobody holds it.
            return Err(RefreshError::EmptySnapshot(token.symbol.clone()));
        }

        self.transition(&token.symbol, phase, RefreshPhase::Computing);
        let total_accounts = fetched.holders.len();
        let price_usd = price_entry.as_ref().map(|e| e.price_usd);
        let enriched = annotate_usd(fetched.holders, price_usd, min_usd);
        if enriched.is_empty() {
            return Err(RefreshError::EmptySnapshot(token.symbol.clone()));
        }
        let (top, markers) = rank_and_mark(&enriched);

        // All rows are in memory before the first storage mutation.
        let completed_at = Utc::now();
        let rows: Vec<HolderRecord> = top
            .iter()
            .chain(markers.iter())
            .map(|ranked| to_record(&token.symbol, batch_id, ranked))
            .collect();
        let batch = SnapshotBatch {
            token_symbol: token.symbol.clone(),
            refresh_batch_id: batch_id.to_string(),
            rows,
            total_accounts_fetched: total_accounts as i64,
            price_usd,
            price_updated_at: price_entry.as_ref().map(|e| e.updated_at),
            completed_at,
        };

        self.transition(&token.symbol, phase, RefreshPhase::Swapping);
        self.store
            .commit_snapshot(&batch)
            .await
            .map_err(|e| RefreshError::Storage(format!("{e:#}")))?;

        let duration_seconds = started.elapsed().as_secs_f64();
        self.append_log({
            let mut entry = RefreshLogEntry::new(&token.symbol, LogOperation::FetchCompleted)
                .batch(batch_id)
                .message(format!(
                    "refreshed {total_accounts} accounts ({} dropped as malformed)",
                    fetched.dropped_entries
                ));
            entry.request_count = Some(fetched.requests as i64);
            entry.accounts_processed = Some(total_accounts as i64);
            entry.processing_time_seconds = Some(duration_seconds);
            entry.min_usd_filter = min_usd;
            entry.price_source = cache_status
                .as_ref()
                .and_then(|s| s.native_source)
                .map(|s| s.as_str().to_string());
            entry
        })
        .await;

        Ok(RefreshSummary {
            token_symbol: token.symbol.clone(),
            refresh_batch_id: batch_id.to_string(),
            total_accounts,
            top_holders: top.len(),
            percentile_markers: markers.len(),
            pages: fetched.pages,
            requests: fetched.requests,
            dropped_entries: fetched.dropped_entries,
            price_usd,
            duration_seconds,
        })
    }

    /// Refreshes several tokens through the bounded worker pool. Results
    /// come back sorted by symbol.
    pub async fn refresh_many(
        self: Arc<Self>,
        symbols: Vec<String>,
        options: &RefreshOptions,
    ) -> Vec<(String, Result<RefreshSummary, RefreshError>)> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_refreshes));
        let mut tasks = JoinSet::new();
        for symbol in symbols {
            let orchestrator = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            let options = options.clone();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            symbol.clone(),
                            Err(RefreshError::Storage("worker pool closed".to_string())),
                        )
                    }
                };
                let result = orchestrator.refresh_token(&symbol, &options).await;
                (symbol, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => results.push(outcome),
                Err(e) => error!("refresh task panicked: {e}"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Refreshes every enabled token.
    pub async fn refresh_all(
        self: Arc<Self>,
        options: &RefreshOptions,
    ) -> Vec<(String, Result<RefreshSummary, RefreshError>)> {
        let symbols = self
            .config
            .tokens
            .iter()
            .map(|t| t.symbol.clone())
            .collect();
        self.refresh_many(symbols, options).await
    }

    /// Refreshes only the tokens whose snapshots are stale.
    pub async fn refresh_stale(
        self: Arc<Self>,
        options: &RefreshOptions,
    ) -> Result<Vec<(String, Result<RefreshSummary, RefreshError>)>, RefreshError> {
        let stale: Vec<String> = self
            .staleness_report()
            .await?
            .into_iter()
            .filter(|report| report.needs_refresh && !report.refresh_in_progress)
            .map(|report| report.token_symbol)
            .collect();
        if stale.is_empty() {
            info!("no stale tokens, nothing to refresh");
            return Ok(Vec::new());
        }
        Ok(self.refresh_many(stale, options).await)
    }

    /// Assesses, per enabled token, whether its snapshot needs a refresh.
    pub async fn staleness_report(&self) -> Result<Vec<StalenessReport>, RefreshError> {
        let summaries = self
            .store
            .token_summaries(None)
            .await
            .map_err(|e| RefreshError::Storage(format!("{e:#}")))?;
        let cutoff = Utc::now() - ChronoDuration::hours(self.config.stale_after_hours);

        let mut reports = Vec::with_capacity(self.config.tokens.len());
        for token in &self.config.tokens {
            let summary = summaries
                .iter()
                .find(|s| s.token_symbol.eq_ignore_ascii_case(&token.symbol));
            let report = match summary {
                None => StalenessReport {
                    token_symbol: token.symbol.clone(),
                    token_id: token.token_id.clone(),
                    needs_refresh: true,
                    reason: "never refreshed".to_string(),
                    last_refresh_completed: None,
                    refresh_in_progress: false,
                },
                Some(summary) => {
                    let (needs_refresh, reason) = if summary.refresh_in_progress {
                        (false, "refresh currently in progress".to_string())
                    } else if !summary.last_refresh_success {
                        (true, "last refresh failed".to_string())
                    } else {
                        match summary.last_refresh_completed {
                            None => (true, "no successful refresh".to_string()),
                            Some(completed) if completed < cutoff => {
                                let age_hours = (Utc::now() - completed).num_minutes() as f64 / 60.0;
                                (true, format!("data is {age_hours:.1} hours old"))
                            }
                            Some(completed) => {
                                let age_hours = (Utc::now() - completed).num_minutes() as f64 / 60.0;
                                (false, format!("data is {age_hours:.1} hours old (fresh)"))
                            }
                        }
                    };
                    StalenessReport {
                        token_symbol: token.symbol.clone(),
                        token_id: token.token_id.clone(),
                        needs_refresh,
                        reason,
                        last_refresh_completed: summary.last_refresh_completed,
                        refresh_in_progress: summary.refresh_in_progress,
                    }
                }
            };
            reports.push(report);
        }
        Ok(reports)
    }

    /// Resets metadata rows left in progress by an interrupted run.
    pub async fn reconcile_stuck_refreshes(&self) -> Result<u64, RefreshError> {
        self.store
            .reconcile_stuck_refreshes()
            .await
            .map_err(|e| RefreshError::Storage(format!("{e:#}")))
    }

    /// Smallest-unit dust floor: the configured raw fallback, raised to the
    /// USD-derived floor when a price is available.
    async fn derive_floor(
        &self,
        token: &TokenEntry,
        decimals: u32,
        min_usd: Option<Decimal>,
    ) -> u64 {
        let mut floor = token.min_balance_raw;
        if let Some(usd) = min_usd {
            match self.pricing.tokens_for_usd(price_key(token), usd).await {
                Some(display_amount) => {
                    let scale = Decimal::from(10u128.pow(decimals));
                    if let Some(raw) = (display_amount * scale).trunc().to_u64() {
                        floor = floor.max(raw);
                    }
                }
                None => {
                    debug!(
                        "no price for {}, using raw floor {floor}",
                        token.symbol
                    );
                }
            }
        }
        floor
    }

    async fn record_failure(&self, symbol: &str, batch_id: &str, err: &RefreshError) {
        if let Err(e) = self
            .store
            .mark_refresh_failed(symbol, &err.to_string(), Utc::now())
            .await
        {
            error!("failed to record refresh failure for {symbol}: {e:#}");
        }
        self.append_log(
            RefreshLogEntry::new(symbol, LogOperation::Error)
                .batch(batch_id)
                .message(err.to_string()),
        )
        .await;
    }

    /// Audit logging is best-effort: a broken log write must not change the
    /// outcome of a refresh.
    async fn append_log(&self, entry: RefreshLogEntry) {
        if let Err(e) = self.store.append_log(&entry).await {
            error!("failed to append refresh log entry: {e:#}");
        }
    }

    fn transition(&self, symbol: &str, phase: &mut RefreshPhase, next: RefreshPhase) {
        debug!(
            "refresh {symbol}: {} -> {}",
            phase.as_str(),
            next.as_str()
        );
        *phase = next;
    }
}

/// Cache key for a token's price: native coins are keyed by symbol, tokens
/// by their ledger entity id.
fn price_key(token: &TokenEntry) -> &str {
    if token.native {
        &token.symbol
    } else {
        &token.token_id
    }
}

fn to_record(token_symbol: &str, batch_id: &str, ranked: &RankedHolder) -> HolderRecord {
    HolderRecord {
        token_symbol: token_symbol.to_string(),
        account_id: ranked.account_id.clone(),
        balance: ranked.balance,
        balance_rank: ranked.rank as i64,
        percentile_rank: ranked.percentile,
        is_top_holder: ranked.is_top_holder,
        is_percentile_marker: ranked.is_percentile_marker,
        usd_value: ranked.usd_value,
        price_usd_at_refresh: ranked.price_usd,
        refresh_batch_id: batch_id.to_string(),
    }
}

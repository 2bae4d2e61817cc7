//! Storage abstraction for holder snapshots, refresh metadata and the
//! append-only refresh log.
//!
//! The contract keeps business logic independent of the database engine.
//! Two operations carry the concurrency weight: `try_begin_refresh` is the
//! cross-process single-flight claim (a conditional update under SQLite's
//! transaction isolation), and `commit_snapshot` is the atomic swap that
//! replaces a token's entire row set in one transaction.

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, FromRow, Pool, Sqlite};
use tracing::{debug, info, warn};

use crate::config::TokenEntry;

use super::types::{HolderRecord, RefreshLogEntry, SnapshotBatch, TokenSummary};

/// Formal contract for holder snapshot persistence.
#[async_trait]
pub trait HoldingsStore: Send + Sync {
    /// Claims the per-token refresh slot. Creates the metadata row on first
    /// use, then flips `refresh_in_progress` to true only if it was false,
    /// all inside one transaction. Returns false when another refresh holds
    /// the claim; nothing is changed in that case.
    async fn try_begin_refresh(
        &self,
        token: &TokenEntry,
        started_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Atomic swap: deletes the token's previous holder rows, inserts the
    /// new batch and marks the metadata successful, in one transaction.
    /// Any failure rolls back entirely, leaving the prior snapshot intact.
    async fn commit_snapshot(&self, batch: &SnapshotBatch) -> Result<()>;

    /// Marks the refresh failed and releases the single-flight claim. The
    /// previously committed snapshot (if any) stays untouched.
    async fn mark_refresh_failed(
        &self,
        token_symbol: &str,
        error: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Appends one audit log entry. Entries are never mutated.
    async fn append_log(&self, entry: &RefreshLogEntry) -> Result<()>;

    /// Refresh status summaries, for one token or all of them.
    async fn token_summaries(&self, token_symbol: Option<&str>) -> Result<Vec<TokenSummary>>;

    async fn top_holders(&self, token_symbol: &str, limit: i64) -> Result<Vec<HolderRecord>>;

    /// Percentile marker rows; an empty `percentiles` slice means all 99.
    async fn percentile_markers(
        &self,
        token_symbol: &str,
        percentiles: &[u8],
    ) -> Result<Vec<HolderRecord>>;

    async fn recent_logs(
        &self,
        token_symbol: Option<&str>,
        limit: i64,
    ) -> Result<Vec<RefreshLogEntry>>;

    /// Resets every metadata row left `refresh_in_progress = true` by an
    /// interrupted run. Idempotent; returns the number of rows reset.
    async fn reconcile_stuck_refreshes(&self) -> Result<u64>;

    /// Deletes holder rows of all but the newest `keep_latest` batches per
    /// token. Returns the number of rows deleted.
    async fn cleanup_old_batches(
        &self,
        token_symbol: Option<&str>,
        keep_latest: u32,
    ) -> Result<u64>;

    async fn health_check(&self) -> Result<bool>;
}

/// SQLite implementation of the `HoldingsStore` contract.
pub struct SqliteHoldingsStore {
    pool: Pool<Sqlite>,
}

impl SqliteHoldingsStore {
    /// Opens (creating if needed) the database at `path` and bootstraps the
    /// schema.
    pub async fn connect(path: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{path}?mode=rwc"))
            .await
            .with_context(|| format!("failed to open sqlite database {path}"))?;
        let store = Self { pool };
        store.init_schema().await?;
        info!("holdings store connected to {path}");
        Ok(store)
    }

    /// In-memory database for tests. A single pooled connection is required:
    /// every new `:memory:` connection would otherwise see its own empty
    /// database.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory sqlite database")?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS token_metadata (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token_symbol TEXT NOT NULL UNIQUE,
                token_id TEXT NOT NULL,
                decimals INTEGER NOT NULL DEFAULT 0,
                last_refresh_started TEXT,
                last_refresh_completed TEXT,
                last_refresh_success BOOLEAN NOT NULL DEFAULT FALSE,
                refresh_in_progress BOOLEAN NOT NULL DEFAULT FALSE,
                total_accounts_fetched INTEGER NOT NULL DEFAULT 0,
                price_usd TEXT,
                price_updated_at TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create token_metadata table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS token_holdings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token_symbol TEXT NOT NULL,
                account_id TEXT NOT NULL,
                balance TEXT NOT NULL,
                balance_rank INTEGER NOT NULL,
                percentile_rank INTEGER,
                is_top_holder BOOLEAN NOT NULL DEFAULT FALSE,
                is_percentile_marker BOOLEAN NOT NULL DEFAULT FALSE,
                usd_value TEXT,
                price_usd_at_refresh TEXT,
                refresh_batch_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (token_symbol, account_id, refresh_batch_id, is_top_holder, percentile_rank)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create token_holdings table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_holdings_rank
             ON token_holdings (token_symbol, balance_rank);",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_holdings_percentile
             ON token_holdings (token_symbol, percentile_rank);",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_holdings_batch
             ON token_holdings (token_symbol, refresh_batch_id);",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS refresh_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token_symbol TEXT NOT NULL,
                operation TEXT NOT NULL,
                message TEXT,
                refresh_batch_id TEXT,
                request_count INTEGER,
                accounts_processed INTEGER,
                processing_time_seconds REAL,
                min_usd_filter TEXT,
                price_source TEXT,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create refresh_log table")?;

        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl HoldingsStore for SqliteHoldingsStore {
    async fn try_begin_refresh(
        &self,
        token: &TokenEntry,
        started_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        sqlx::query(
            r#"
            INSERT INTO token_metadata (token_symbol, token_id, decimals, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (token_symbol) DO UPDATE SET
                token_id = excluded.token_id,
                decimals = excluded.decimals
            "#,
        )
        .bind(&token.symbol)
        .bind(&token.token_id)
        .bind(token.decimals.unwrap_or(0) as i64)
        .bind(started_at)
        .bind(started_at)
        .execute(&mut *tx)
        .await
        .context("failed to upsert token metadata")?;

        let claimed = sqlx::query(
            r#"
            UPDATE token_metadata
            SET refresh_in_progress = TRUE,
                last_refresh_started = ?,
                error_message = NULL,
                updated_at = ?
            WHERE token_symbol = ? AND refresh_in_progress = FALSE
            "#,
        )
        .bind(started_at)
        .bind(started_at)
        .bind(&token.symbol)
        .execute(&mut *tx)
        .await
        .context("failed to claim refresh slot")?
        .rows_affected()
            == 1;

        tx.commit().await.context("failed to commit refresh claim")?;

        if claimed {
            debug!("claimed refresh slot for {}", token.symbol);
        }
        Ok(claimed)
    }

    async fn commit_snapshot(&self, batch: &SnapshotBatch) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to begin swap transaction")?;

        sqlx::query("DELETE FROM token_holdings WHERE token_symbol = ?")
            .bind(&batch.token_symbol)
            .execute(&mut *tx)
            .await
            .context("failed to delete previous snapshot")?;

        for row in &batch.rows {
            sqlx::query(
                r#"
                INSERT INTO token_holdings (
                    token_symbol, account_id, balance, balance_rank,
                    percentile_rank, is_top_holder, is_percentile_marker,
                    usd_value, price_usd_at_refresh, refresh_batch_id, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.token_symbol)
            .bind(&row.account_id)
            .bind(row.balance.to_string())
            .bind(row.balance_rank)
            .bind(row.percentile_rank.map(|p| p as i64))
            .bind(row.is_top_holder)
            .bind(row.is_percentile_marker)
            .bind(row.usd_value.map(|v| v.to_string()))
            .bind(row.price_usd_at_refresh.map(|v| v.to_string()))
            .bind(&row.refresh_batch_id)
            .bind(batch.completed_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to insert holder row {}", row.account_id))?;
        }

        sqlx::query(
            r#"
            UPDATE token_metadata
            SET refresh_in_progress = FALSE,
                last_refresh_completed = ?,
                last_refresh_success = TRUE,
                total_accounts_fetched = ?,
                price_usd = ?,
                price_updated_at = ?,
                error_message = NULL,
                updated_at = ?
            WHERE token_symbol = ?
            "#,
        )
        .bind(batch.completed_at)
        .bind(batch.total_accounts_fetched)
        .bind(batch.price_usd.map(|p| p.to_string()))
        .bind(batch.price_updated_at)
        .bind(batch.completed_at)
        .bind(&batch.token_symbol)
        .execute(&mut *tx)
        .await
        .context("failed to update metadata for completed refresh")?;

        tx.commit().await.context("failed to commit snapshot swap")?;

        debug!(
            "swapped snapshot for {}: {} rows (batch {})",
            batch.token_symbol,
            batch.rows.len(),
            batch.refresh_batch_id
        );
        Ok(())
    }

    async fn mark_refresh_failed(
        &self,
        token_symbol: &str,
        error: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE token_metadata
            SET refresh_in_progress = FALSE,
                last_refresh_success = FALSE,
                error_message = ?,
                updated_at = ?
            WHERE token_symbol = ?
            "#,
        )
        .bind(error)
        .bind(failed_at)
        .bind(token_symbol)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to record refresh failure for {token_symbol}"))?;
        Ok(())
    }

    async fn append_log(&self, entry: &RefreshLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO refresh_log (
                token_symbol, operation, message, refresh_batch_id,
                request_count, accounts_processed, processing_time_seconds,
                min_usd_filter, price_source, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.token_symbol)
        .bind(&entry.operation)
        .bind(&entry.message)
        .bind(&entry.refresh_batch_id)
        .bind(entry.request_count)
        .bind(entry.accounts_processed)
        .bind(entry.processing_time_seconds)
        .bind(entry.min_usd_filter.map(|v| v.to_string()))
        .bind(&entry.price_source)
        .bind(entry.created_at.unwrap_or_else(Utc::now))
        .execute(&self.pool)
        .await
        .context("failed to append refresh log entry")?;
        Ok(())
    }

    async fn token_summaries(&self, token_symbol: Option<&str>) -> Result<Vec<TokenSummary>> {
        let base = r#"
            SELECT m.token_symbol, m.token_id, m.decimals,
                   m.last_refresh_started, m.last_refresh_completed,
                   m.last_refresh_success, m.refresh_in_progress,
                   m.total_accounts_fetched, m.price_usd, m.price_updated_at,
                   m.error_message,
                   (SELECT COUNT(*) FROM token_holdings h
                    WHERE h.token_symbol = m.token_symbol AND h.is_top_holder = TRUE)
                       AS top_holder_rows,
                   (SELECT COUNT(*) FROM token_holdings h
                    WHERE h.token_symbol = m.token_symbol AND h.is_percentile_marker = TRUE)
                       AS percentile_rows
            FROM token_metadata m
        "#;
        let rows: Vec<MetadataRow> = match token_symbol {
            Some(symbol) => {
                sqlx::query_as(&format!("{base} WHERE m.token_symbol = ?"))
                    .bind(symbol)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query_as(&format!("{base} ORDER BY m.token_symbol"))
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("failed to fetch token summaries")?;

        rows.into_iter().map(MetadataRow::into_summary).collect()
    }

    async fn top_holders(&self, token_symbol: &str, limit: i64) -> Result<Vec<HolderRecord>> {
        let rows: Vec<HolderRow> = sqlx::query_as(
            r#"
            SELECT token_symbol, account_id, balance, balance_rank,
                   percentile_rank, is_top_holder, is_percentile_marker,
                   usd_value, price_usd_at_refresh, refresh_batch_id
            FROM token_holdings
            WHERE token_symbol = ? AND is_top_holder = TRUE
            ORDER BY balance_rank
            LIMIT ?
            "#,
        )
        .bind(token_symbol)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch top holders")?;

        rows.into_iter().map(HolderRow::into_record).collect()
    }

    async fn percentile_markers(
        &self,
        token_symbol: &str,
        percentiles: &[u8],
    ) -> Result<Vec<HolderRecord>> {
        let rows: Vec<HolderRow> = if percentiles.is_empty() {
            sqlx::query_as(
                r#"
                SELECT token_symbol, account_id, balance, balance_rank,
                       percentile_rank, is_top_holder, is_percentile_marker,
                       usd_value, price_usd_at_refresh, refresh_batch_id
                FROM token_holdings
                WHERE token_symbol = ? AND is_percentile_marker = TRUE
                ORDER BY percentile_rank DESC
                "#,
            )
            .bind(token_symbol)
            .fetch_all(&self.pool)
            .await
        } else {
            let placeholders = vec!["?"; percentiles.len()].join(", ");
            let sql = format!(
                r#"
                SELECT token_symbol, account_id, balance, balance_rank,
                       percentile_rank, is_top_holder, is_percentile_marker,
                       usd_value, price_usd_at_refresh, refresh_batch_id
                FROM token_holdings
                WHERE token_symbol = ? AND is_percentile_marker = TRUE
                  AND percentile_rank IN ({placeholders})
                ORDER BY percentile_rank DESC
                "#
            );
            let mut query = sqlx::query_as(&sql).bind(token_symbol);
            for p in percentiles {
                query = query.bind(*p as i64);
            }
            query.fetch_all(&self.pool).await
        }
        .context("failed to fetch percentile markers")?;

        rows.into_iter().map(HolderRow::into_record).collect()
    }

    async fn recent_logs(
        &self,
        token_symbol: Option<&str>,
        limit: i64,
    ) -> Result<Vec<RefreshLogEntry>> {
        let base = r#"
            SELECT token_symbol, operation, message, refresh_batch_id,
                   request_count, accounts_processed, processing_time_seconds,
                   min_usd_filter, price_source, created_at
            FROM refresh_log
        "#;
        let rows: Vec<LogRow> = match token_symbol {
            Some(symbol) => {
                sqlx::query_as(&format!(
                    "{base} WHERE token_symbol = ? ORDER BY id DESC LIMIT ?"
                ))
                .bind(symbol)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as(&format!("{base} ORDER BY id DESC LIMIT ?"))
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("failed to fetch refresh log")?;

        rows.into_iter().map(LogRow::into_entry).collect()
    }

    async fn reconcile_stuck_refreshes(&self) -> Result<u64> {
        let reset = sqlx::query(
            r#"
            UPDATE token_metadata
            SET refresh_in_progress = FALSE,
                last_refresh_success = FALSE,
                error_message = 'interrupted refresh reconciled',
                updated_at = ?
            WHERE refresh_in_progress = TRUE
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to reconcile stuck refreshes")?
        .rows_affected();

        if reset > 0 {
            warn!("reconciled {reset} stuck refresh flag(s)");
        }
        Ok(reset)
    }

    async fn cleanup_old_batches(
        &self,
        token_symbol: Option<&str>,
        keep_latest: u32,
    ) -> Result<u64> {
        let tokens: Vec<(String,)> = match token_symbol {
            Some(symbol) => vec![(symbol.to_string(),)],
            None => sqlx::query_as("SELECT DISTINCT token_symbol FROM token_holdings")
                .fetch_all(&self.pool)
                .await
                .context("failed to list tokens for cleanup")?,
        };

        let mut deleted = 0u64;
        for (token,) in tokens {
            deleted += sqlx::query(
                r#"
                DELETE FROM token_holdings
                WHERE token_symbol = ?
                  AND refresh_batch_id NOT IN (
                      SELECT refresh_batch_id FROM (
                          SELECT refresh_batch_id, MAX(created_at) AS newest
                          FROM token_holdings
                          WHERE token_symbol = ?
                          GROUP BY refresh_batch_id
                          ORDER BY newest DESC
                          LIMIT ?
                      )
                  )
                "#,
            )
            .bind(&token)
            .bind(&token)
            .bind(keep_latest as i64)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to clean up old batches for {token}"))?
            .rows_affected();
        }
        Ok(deleted)
    }

    async fn health_check(&self) -> Result<bool> {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

/// Helper type for deserializing holder rows; balances come back as TEXT
/// and are re-validated into `Decimal` here.
#[derive(FromRow)]
struct HolderRow {
    token_symbol: String,
    account_id: String,
    balance: String,
    balance_rank: i64,
    percentile_rank: Option<i64>,
    is_top_holder: bool,
    is_percentile_marker: bool,
    usd_value: Option<String>,
    price_usd_at_refresh: Option<String>,
    refresh_batch_id: String,
}

impl HolderRow {
    fn into_record(self) -> Result<HolderRecord> {
        Ok(HolderRecord {
            balance: Decimal::from_str(&self.balance)
                .with_context(|| format!("corrupt balance for {}", self.account_id))?,
            usd_value: parse_optional_decimal(self.usd_value.as_deref())?,
            price_usd_at_refresh: parse_optional_decimal(self.price_usd_at_refresh.as_deref())?,
            token_symbol: self.token_symbol,
            account_id: self.account_id,
            balance_rank: self.balance_rank,
            percentile_rank: self.percentile_rank.map(|p| p as u8),
            is_top_holder: self.is_top_holder,
            is_percentile_marker: self.is_percentile_marker,
            refresh_batch_id: self.refresh_batch_id,
        })
    }
}

#[derive(FromRow)]
struct MetadataRow {
    token_symbol: String,
    token_id: String,
    decimals: i64,
    last_refresh_started: Option<DateTime<Utc>>,
    last_refresh_completed: Option<DateTime<Utc>>,
    last_refresh_success: bool,
    refresh_in_progress: bool,
    total_accounts_fetched: i64,
    price_usd: Option<String>,
    price_updated_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    top_holder_rows: i64,
    percentile_rows: i64,
}

impl MetadataRow {
    fn into_summary(self) -> Result<TokenSummary> {
        Ok(TokenSummary {
            price_usd: parse_optional_decimal(self.price_usd.as_deref())?,
            token_symbol: self.token_symbol,
            token_id: self.token_id,
            decimals: self.decimals,
            last_refresh_started: self.last_refresh_started,
            last_refresh_completed: self.last_refresh_completed,
            last_refresh_success: self.last_refresh_success,
            refresh_in_progress: self.refresh_in_progress,
            total_accounts_fetched: self.total_accounts_fetched,
            price_updated_at: self.price_updated_at,
            error_message: self.error_message,
            top_holder_rows: self.top_holder_rows,
            percentile_rows: self.percentile_rows,
        })
    }
}

#[derive(FromRow)]
struct LogRow {
    token_symbol: String,
    operation: String,
    message: Option<String>,
    refresh_batch_id: Option<String>,
    request_count: Option<i64>,
    accounts_processed: Option<i64>,
    processing_time_seconds: Option<f64>,
    min_usd_filter: Option<String>,
    price_source: Option<String>,
    created_at: DateTime<Utc>,
}

impl LogRow {
    fn into_entry(self) -> Result<RefreshLogEntry> {
        Ok(RefreshLogEntry {
            min_usd_filter: parse_optional_decimal(self.min_usd_filter.as_deref())?,
            token_symbol: self.token_symbol,
            operation: self.operation,
            message: self.message,
            refresh_batch_id: self.refresh_batch_id,
            request_count: self.request_count,
            accounts_processed: self.accounts_processed,
            processing_time_seconds: self.processing_time_seconds,
            price_source: self.price_source,
            created_at: Some(self.created_at),
        })
    }
}

fn parse_optional_decimal(value: Option<&str>) -> Result<Option<Decimal>> {
    value
        .map(|v| Decimal::from_str(v).with_context(|| format!("corrupt decimal value {v:?}")))
        .transpose()
}

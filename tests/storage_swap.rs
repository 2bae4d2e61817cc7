//! Store-level tests: single-flight claim, atomic snapshot swap, reconcile
//! and batch cleanup.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use holderscope::config::TokenEntry;
use holderscope::holdings::storage::{HoldingsStore, SqliteHoldingsStore};
use holderscope::holdings::types::{HolderRecord, RefreshLogEntry, SnapshotBatch};
use holderscope::holdings::types::LogOperation;

fn token(symbol: &str) -> TokenEntry {
    token_with_id(symbol, "0.0.731861")
}

fn token_with_id(symbol: &str, token_id: &str) -> TokenEntry {
    TokenEntry {
        symbol: symbol.to_string(),
        token_id: token_id.to_string(),
        decimals: Some(6),
        min_balance_raw: 1,
        native: false,
    }
}

fn row(symbol: &str, account: &str, rank: i64, percentile: Option<u8>, batch: &str) -> HolderRecord {
    HolderRecord {
        token_symbol: symbol.to_string(),
        account_id: account.to_string(),
        balance: Decimal::from(1000 - rank),
        balance_rank: rank,
        percentile_rank: percentile,
        is_top_holder: percentile.is_none(),
        is_percentile_marker: percentile.is_some(),
        usd_value: Some(dec!(12.34)),
        price_usd_at_refresh: Some(dec!(0.0176)),
        refresh_batch_id: batch.to_string(),
    }
}

fn batch(symbol: &str, batch_id: &str, rows: Vec<HolderRecord>) -> SnapshotBatch {
    SnapshotBatch {
        token_symbol: symbol.to_string(),
        refresh_batch_id: batch_id.to_string(),
        total_accounts_fetched: rows.len() as i64,
        rows,
        price_usd: Some(dec!(0.0176)),
        price_updated_at: Some(Utc::now()),
        completed_at: Utc::now(),
    }
}

#[tokio::test]
async fn claim_is_single_flight_per_token() {
    let store = SqliteHoldingsStore::connect_in_memory()
        .await
        .expect("store");
    let sauce = token("SAUCE");

    assert!(store.try_begin_refresh(&sauce, Utc::now()).await.unwrap());
    // Second claim while the first is outstanding is rejected.
    assert!(!store.try_begin_refresh(&sauce, Utc::now()).await.unwrap());

    // A different token claims independently.
    let karate = token_with_id("KARATE", "0.0.2283230");
    assert!(store.try_begin_refresh(&karate, Utc::now()).await.unwrap());

    // Completing the refresh releases the claim.
    store
        .commit_snapshot(&batch("SAUCE", "b1", vec![row("SAUCE", "0.0.1", 1, None, "b1")]))
        .await
        .unwrap();
    assert!(store.try_begin_refresh(&sauce, Utc::now()).await.unwrap());
}

#[tokio::test]
async fn swap_replaces_previous_snapshot_wholesale() {
    let store = SqliteHoldingsStore::connect_in_memory()
        .await
        .expect("store");
    let sauce = token("SAUCE");

    store.try_begin_refresh(&sauce, Utc::now()).await.unwrap();
    store
        .commit_snapshot(&batch(
            "SAUCE",
            "b1",
            vec![
                row("SAUCE", "0.0.1", 1, None, "b1"),
                row("SAUCE", "0.0.2", 2, None, "b1"),
                row("SAUCE", "0.0.9", 9, Some(99), "b1"),
            ],
        ))
        .await
        .unwrap();

    store.try_begin_refresh(&sauce, Utc::now()).await.unwrap();
    store
        .commit_snapshot(&batch(
            "SAUCE",
            "b2",
            vec![row("SAUCE", "0.0.7", 1, None, "b2")],
        ))
        .await
        .unwrap();

    let top = store.top_holders("SAUCE", 10).await.unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].account_id, "0.0.7");
    assert_eq!(top[0].refresh_batch_id, "b2");

    // No markers survive from the old batch either.
    let markers = store.percentile_markers("SAUCE", &[]).await.unwrap();
    assert!(markers.is_empty());

    let summary = &store.token_summaries(Some("SAUCE")).await.unwrap()[0];
    assert!(summary.last_refresh_success);
    assert!(!summary.refresh_in_progress);
    assert_eq!(summary.total_accounts_fetched, 1);
}

#[tokio::test]
async fn failed_swap_rolls_back_and_keeps_prior_snapshot() {
    let store = SqliteHoldingsStore::connect_in_memory()
        .await
        .expect("store");
    let sauce = token("SAUCE");

    store.try_begin_refresh(&sauce, Utc::now()).await.unwrap();
    store
        .commit_snapshot(&batch(
            "SAUCE",
            "good",
            vec![
                row("SAUCE", "0.0.1", 1, None, "good"),
                row("SAUCE", "0.0.2", 2, None, "good"),
            ],
        ))
        .await
        .unwrap();

    // A batch with a duplicate (account, percentile) row violates the
    // uniqueness constraint partway through the insert loop.
    store.try_begin_refresh(&sauce, Utc::now()).await.unwrap();
    let poisoned = batch(
        "SAUCE",
        "bad",
        vec![
            row("SAUCE", "0.0.50", 1, None, "bad"),
            row("SAUCE", "0.0.51", 5, Some(42), "bad"),
            row("SAUCE", "0.0.51", 5, Some(42), "bad"),
        ],
    );
    let err = store.commit_snapshot(&poisoned).await;
    assert!(err.is_err(), "duplicate rows must fail the swap");

    store
        .mark_refresh_failed("SAUCE", "storage failure: duplicate rows", Utc::now())
        .await
        .unwrap();

    // The prior snapshot is fully intact: no mixed old/new row set.
    let top = store.top_holders("SAUCE", 10).await.unwrap();
    assert_eq!(top.len(), 2);
    assert!(top.iter().all(|r| r.refresh_batch_id == "good"));

    let summary = &store.token_summaries(Some("SAUCE")).await.unwrap()[0];
    assert!(!summary.refresh_in_progress);
    assert!(!summary.last_refresh_success);
    assert_eq!(
        summary.error_message.as_deref(),
        Some("storage failure: duplicate rows")
    );
}

#[tokio::test]
async fn reconcile_resets_stuck_flags_idempotently() {
    let store = SqliteHoldingsStore::connect_in_memory()
        .await
        .expect("store");

    store.try_begin_refresh(&token("SAUCE"), Utc::now()).await.unwrap();
    store
        .try_begin_refresh(&token_with_id("KARATE", "0.0.2283230"), Utc::now())
        .await
        .unwrap();

    assert_eq!(store.reconcile_stuck_refreshes().await.unwrap(), 2);
    assert_eq!(store.reconcile_stuck_refreshes().await.unwrap(), 0);

    // The claim is free again after reconciliation.
    assert!(store.try_begin_refresh(&token("SAUCE"), Utc::now()).await.unwrap());
}

#[tokio::test]
async fn cleanup_keeps_newest_batches() {
    let store = SqliteHoldingsStore::connect_in_memory()
        .await
        .expect("store");

    // Simulate leftover rows from several old runs by writing directly;
    // the swap path itself never leaves more than one batch behind.
    let now = Utc::now();
    for (i, batch_id) in ["b1", "b2", "b3"].iter().enumerate() {
        sqlx::query(
            "INSERT INTO token_holdings (
                token_symbol, account_id, balance, balance_rank,
                percentile_rank, is_top_holder, is_percentile_marker,
                usd_value, price_usd_at_refresh, refresh_batch_id, created_at
            ) VALUES ('SAUCE', '0.0.1', '10', 1, NULL, TRUE, FALSE, NULL, NULL, ?, ?)",
        )
        .bind(*batch_id)
        .bind(now + Duration::seconds(i as i64))
        .execute(store.pool())
        .await
        .unwrap();
    }

    let deleted = store.cleanup_old_batches(Some("SAUCE"), 2).await.unwrap();
    assert_eq!(deleted, 1);

    let remaining: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT refresh_batch_id FROM token_holdings ORDER BY refresh_batch_id")
            .fetch_all(store.pool())
            .await
            .unwrap();
    let ids: Vec<&str> = remaining.iter().map(|(id,)| id.as_str()).collect();
    assert_eq!(ids, vec!["b2", "b3"]);
}

#[tokio::test]
async fn refresh_log_is_append_only_and_readable() {
    let store = SqliteHoldingsStore::connect_in_memory()
        .await
        .expect("store");

    store
        .append_log(&RefreshLogEntry::new("SAUCE", LogOperation::FetchStarted).batch("b1"))
        .await
        .unwrap();
    let mut completed = RefreshLogEntry::new("SAUCE", LogOperation::FetchCompleted).batch("b1");
    completed.accounts_processed = Some(1234);
    completed.request_count = Some(13);
    completed.min_usd_filter = Some(dec!(1));
    completed.price_source = Some("exchange_rate".to_string());
    store.append_log(&completed).await.unwrap();

    let entries = store.recent_logs(Some("SAUCE"), 10).await.unwrap();
    assert_eq!(entries.len(), 2);
    // Newest first.
    assert_eq!(entries[0].operation, "fetch_completed");
    assert_eq!(entries[0].accounts_processed, Some(1234));
    assert_eq!(entries[0].min_usd_filter, Some(dec!(1)));
    assert_eq!(entries[0].price_source.as_deref(), Some("exchange_rate"));
    assert_eq!(entries[1].operation, "fetch_started");
    assert!(entries[1].created_at.is_some());
}

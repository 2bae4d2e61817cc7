//! Command-line interface for the holder distribution tracker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};

use holderscope::config::AppConfig;
use holderscope::holdings::{
    FetcherConfig, HoldingsStore, MirrorNodeFetcher, OraclePricingService, RefreshOptions,
    RefreshOrchestrator, SqliteHoldingsStore,
};

#[derive(Parser)]
#[command(name = "holderscope", version, about = "Track token holder distributions")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the database schema.
    Init,
    /// Refresh holder data for one token, or all enabled tokens.
    Refresh {
        /// Token symbol to refresh; omit with --all or --stale-only.
        token: Option<String>,
        /// Refresh every enabled token.
        #[arg(long)]
        all: bool,
        /// Refresh only tokens with stale or failed snapshots.
        #[arg(long)]
        stale_only: bool,
        /// USD dust floor override; 0 disables USD filtering.
        #[arg(long)]
        min_usd: Option<Decimal>,
    },
    /// Show refresh status for all tracked tokens.
    Status,
    /// Show top holders for a token.
    Top {
        #[arg(short, long)]
        token: String,
        #[arg(short, long, default_value_t = 10)]
        limit: i64,
    },
    /// Show percentile markers for a token.
    Percentiles {
        #[arg(short, long)]
        token: String,
        /// Comma-separated percentiles (1-99); empty means all.
        #[arg(short, long, default_value = "99,95,90,75,50,25,10,5,1")]
        percentiles: String,
    },
    /// Show recent refresh log entries.
    Logs {
        #[arg(short, long)]
        token: Option<String>,
        #[arg(short, long, default_value_t = 50)]
        limit: i64,
    },
    /// Delete holder rows of all but the newest N batches per token.
    Cleanup {
        #[arg(short, long)]
        token: Option<String>,
        #[arg(short, long, default_value_t = 5)]
        keep: u32,
    },
    /// Reset refresh flags left in progress by an interrupted run.
    Reconcile,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();
    let config = Arc::new(AppConfig::load(cli.config.as_deref())?);
    let store: Arc<dyn HoldingsStore> =
        Arc::new(SqliteHoldingsStore::connect(&config.db_path).await?);

    match cli.command {
        Command::Init => {
            // Schema bootstrap already ran while connecting.
            info!("database initialized at {}", config.db_path);
        }
        Command::Refresh {
            token,
            all,
            stale_only,
            min_usd,
        } => {
            let orchestrator = build_orchestrator(&config, Arc::clone(&store))?;
            let options = RefreshOptions { min_usd };
            let results = if stale_only {
                orchestrator.refresh_stale(&options).await?
            } else if all {
                orchestrator.refresh_all(&options).await
            } else {
                let Some(symbol) = token else {
                    bail!("specify a token symbol, --all or --stale-only");
                };
                let result = orchestrator.refresh_token(&symbol, &options).await;
                vec![(symbol, result)]
            };

            let mut failures = 0;
            for (symbol, result) in &results {
                match result {
                    Ok(summary) => println!(
                        "{symbol}: {} accounts, {} top holders, {} percentile markers, \
                         {} requests, {:.1}s",
                        summary.total_accounts,
                        summary.top_holders,
                        summary.percentile_markers,
                        summary.requests,
                        summary.duration_seconds
                    ),
                    Err(e) => {
                        failures += 1;
                        println!("{symbol}: FAILED - {e}");
                    }
                }
            }
            if failures > 0 {
                bail!("{failures} refresh(es) failed");
            }
        }
        Command::Status => {
            let summaries = store.token_summaries(None).await?;
            if summaries.is_empty() {
                println!("no token data yet; run 'refresh' first");
                return Ok(());
            }
            println!(
                "{:<10} {:<12} {:<20} {:<8} {:>10} {:>5} {:>6}  {}",
                "TOKEN", "TOKEN ID", "LAST REFRESH", "OK", "ACCOUNTS", "TOP", "PCTLS", "ERROR"
            );
            for s in summaries {
                println!(
                    "{:<10} {:<12} {:<20} {:<8} {:>10} {:>5} {:>6}  {}",
                    s.token_symbol,
                    s.token_id,
                    s.last_refresh_completed
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "never".to_string()),
                    if s.refresh_in_progress {
                        "running"
                    } else if s.last_refresh_success {
                        "yes"
                    } else {
                        "no"
                    },
                    s.total_accounts_fetched,
                    s.top_holder_rows,
                    s.percentile_rows,
                    s.error_message.unwrap_or_default()
                );
            }
        }
        Command::Top { token, limit } => {
            let holders = store.top_holders(&token, limit).await?;
            if holders.is_empty() {
                println!("no top holder data for {token}");
                return Ok(());
            }
            println!("{:<6} {:<16} {:>24} {:>16}", "RANK", "ACCOUNT", "BALANCE", "USD");
            for h in holders {
                println!(
                    "{:<6} {:<16} {:>24} {:>16}",
                    h.balance_rank,
                    h.account_id,
                    h.balance.to_string(),
                    h.usd_value.map(|v| v.round_dp(2).to_string()).unwrap_or_default()
                );
            }
        }
        Command::Percentiles { token, percentiles } => {
            let requested = parse_percentiles(&percentiles)?;
            let markers = store.percentile_markers(&token, &requested).await?;
            if markers.is_empty() {
                println!("no percentile data for {token}");
                return Ok(());
            }
            println!(
                "{:<6} {:<8} {:<16} {:>24} {:>16}",
                "PCTL", "RANK", "ACCOUNT", "BALANCE", "USD"
            );
            for m in markers {
                println!(
                    "{:<6} {:<8} {:<16} {:>24} {:>16}",
                    m.percentile_rank.map(|p| p.to_string()).unwrap_or_default(),
                    m.balance_rank,
                    m.account_id,
                    m.balance.to_string(),
                    m.usd_value.map(|v| v.round_dp(2).to_string()).unwrap_or_default()
                );
            }
        }
        Command::Logs { token, limit } => {
            let entries = store.recent_logs(token.as_deref(), limit).await?;
            for e in entries {
                println!(
                    "{} {:<10} {:<16} {}",
                    e.created_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default(),
                    e.token_symbol,
                    e.operation,
                    e.message.unwrap_or_default()
                );
            }
        }
        Command::Cleanup { token, keep } => {
            let deleted = store.cleanup_old_batches(token.as_deref(), keep).await?;
            println!("deleted {deleted} old holder rows");
        }
        Command::Reconcile => {
            let orchestrator = build_orchestrator(&config, Arc::clone(&store))?;
            let reset = orchestrator.reconcile_stuck_refreshes().await?;
            println!("reset {reset} stuck refresh flag(s)");
        }
    }

    Ok(())
}

fn build_orchestrator(
    config: &Arc<AppConfig>,
    store: Arc<dyn HoldingsStore>,
) -> Result<Arc<RefreshOrchestrator>> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()?;
    let native_key = config
        .tokens
        .iter()
        .find(|t| t.native)
        .map(|t| t.symbol.clone())
        .unwrap_or_else(|| "HBAR".to_string());
    let pricing = Arc::new(OraclePricingService::new(
        http,
        config.pricing_base_url.clone(),
        config.mirror_base_url.clone(),
        config.pricing_api_key.clone(),
        native_key,
        config.native_fallback_price_usd,
        Duration::from_secs(config.price_ttl_secs),
    ));
    let fetcher = Arc::new(MirrorNodeFetcher::new(FetcherConfig::from_app(config))?);
    Ok(Arc::new(RefreshOrchestrator::new(
        Arc::clone(config),
        store,
        pricing,
        fetcher,
    )))
}

fn parse_percentiles(raw: &str) -> Result<Vec<u8>> {
    let mut percentiles = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let p: u8 = part.parse()?;
        if !(1..=99).contains(&p) {
            bail!("percentile {p} out of range (1-99)");
        }
        percentiles.push(p);
    }
    Ok(percentiles)
}

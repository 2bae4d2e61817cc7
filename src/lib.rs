//! holderscope - token holder distribution tracking engine
//!
//! For each enabled ledger token this crate fetches the complete holder set
//! from a paginated mirror-node listing API, computes rank and percentile
//! statistics with exact decimal arithmetic, enriches records with live USD
//! pricing, and atomically replaces the persisted snapshot so readers never
//! observe a partial mix of old and new rows.

pub mod config;
pub mod holdings;

// Re-export main types for convenience
pub use config::{AppConfig, TokenEntry};
pub use holdings::{RefreshError, RefreshOptions, RefreshOrchestrator, RefreshSummary};

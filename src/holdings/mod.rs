//! Holder distribution pipeline: pricing, paginated fetching, rank and
//! percentile statistics, persistence and the refresh orchestrator.

pub mod capture;
pub mod enrich;
pub mod fetcher;
pub mod pricing;
pub mod refresher;
pub mod stats;
pub mod storage;
pub mod types;

// Re-export the main surface
pub use fetcher::{FetchedHolders, FetcherConfig, HolderSource, MirrorNodeFetcher};
pub use pricing::{OraclePricingService, PriceCache, PriceCacheEntry, PricingService};
pub use refresher::{RefreshOptions, RefreshOrchestrator, RefreshSummary, StalenessReport};
pub use storage::{HoldingsStore, SqliteHoldingsStore};
pub use types::{
    HolderBalance, HolderRecord, RefreshError, RefreshLogEntry, RefreshPhase, SnapshotBatch,
    TokenSummary,
};

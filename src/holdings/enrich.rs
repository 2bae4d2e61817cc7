//! USD annotation and dust filtering.

use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::types::{EnrichedHolder, HolderBalance};

/// Attaches `usd_value = balance × price` (exact multiply, no rounding) to
/// every holder and, when `min_usd` is given, drops holders below it before
/// any ranking happens.
///
/// With no price available this degrades to a pass-through: every holder is
/// returned unchanged with empty USD fields and nothing is dropped.
pub fn annotate_usd(
    holders: Vec<HolderBalance>,
    price_usd: Option<Decimal>,
    min_usd: Option<Decimal>,
) -> Vec<EnrichedHolder> {
    let Some(price) = price_usd else {
        if min_usd.is_some() {
            warn!("no price available, skipping USD floor filter");
        }
        return holders
            .into_iter()
            .map(|h| EnrichedHolder {
                account_id: h.account_id,
                balance: h.balance,
                usd_value: None,
                price_usd: None,
            })
            .collect();
    };

    let before = holders.len();
    let enriched: Vec<EnrichedHolder> = holders
        .into_iter()
        .filter_map(|h| {
            let usd_value = h.balance * price;
            if let Some(floor) = min_usd {
                if usd_value < floor {
                    return None;
                }
            }
            Some(EnrichedHolder {
                account_id: h.account_id,
                balance: h.balance,
                usd_value: Some(usd_value),
                price_usd: Some(price),
            })
        })
        .collect();

    if enriched.len() != before {
        debug!(
            "USD floor dropped {} of {before} holders",
            before - enriched.len()
        );
    }
    enriched
}

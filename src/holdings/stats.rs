//! Rank and percentile placement over a complete holder set.
//!
//! This is one in-memory batch computation with no suspension points. For
//! multi-million-holder tokens it is CPU and memory bound and may run for
//! seconds; callers treat it as a single non-cancellable unit.

use rust_decimal::Decimal;

use super::types::EnrichedHolder;

pub const TOP_HOLDER_LIMIT: usize = 10;

/// A holder annotated with its placement in the distribution.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedHolder {
    pub account_id: String,
    pub balance: Decimal,
    pub usd_value: Option<Decimal>,
    pub price_usd: Option<Decimal>,
    /// 1 = largest balance.
    pub rank: usize,
    /// Set only on percentile markers, 1..=99.
    pub percentile: Option<u8>,
    pub is_top_holder: bool,
    pub is_percentile_marker: bool,
}

/// 0-based index of the marker for `percentile` in a population of `total`
/// holders ordered by descending balance:
/// `clamp(floor(percentile × total / 100) − 1, 0, total − 1)`.
///
/// Pure integer arithmetic; placement cannot drift at large N the way a
/// float product would.
pub fn percentile_position(percentile: u8, total: usize) -> usize {
    debug_assert!((1..=99).contains(&percentile));
    debug_assert!(total > 0);
    let floor = (percentile as u128 * total as u128) / 100;
    let position = floor.saturating_sub(1) as usize;
    position.min(total - 1)
}

/// Computes the top holders (min(N, 10), ranks 1..) and the 99 percentile
/// markers (99 down to 1) for an unsorted holder set.
///
/// Ordering uses a stable descending sort, so equal balances keep their
/// input order and re-running on identical input yields identical output.
/// With fewer than 100 holders several percentiles map to the same holder;
/// all 99 markers are still emitted. An empty input yields two empty lists.
pub fn rank_and_mark(holders: &[EnrichedHolder]) -> (Vec<RankedHolder>, Vec<RankedHolder>) {
    if holders.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let total = holders.len();
    let mut order: Vec<usize> = (0..total).collect();
    order.sort_by(|&a, &b| holders[b].balance.cmp(&holders[a].balance));

    let top_holders: Vec<RankedHolder> = order
        .iter()
        .take(TOP_HOLDER_LIMIT)
        .enumerate()
        .map(|(i, &idx)| ranked(&holders[idx], i + 1, None))
        .collect();

    let percentile_markers: Vec<RankedHolder> = (1..=99u8)
        .rev()
        .map(|percentile| {
            let position = percentile_position(percentile, total);
            ranked(&holders[order[position]], position + 1, Some(percentile))
        })
        .collect();

    (top_holders, percentile_markers)
}

fn ranked(holder: &EnrichedHolder, rank: usize, percentile: Option<u8>) -> RankedHolder {
    RankedHolder {
        account_id: holder.account_id.clone(),
        balance: holder.balance,
        usd_value: holder.usd_value,
        price_usd: holder.price_usd,
        rank,
        percentile,
        is_top_holder: percentile.is_none(),
        is_percentile_marker: percentile.is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn holders(balances: &[i64]) -> Vec<EnrichedHolder> {
        balances
            .iter()
            .enumerate()
            .map(|(i, &b)| EnrichedHolder {
                account_id: format!("0.0.{i}"),
                balance: Decimal::from(b),
                usd_value: None,
                price_usd: None,
            })
            .collect()
    }

    fn descending(n: i64) -> Vec<EnrichedHolder> {
        holders(&(1..=n).rev().collect::<Vec<_>>())
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let (top, markers) = rank_and_mark(&[]);
        assert!(top.is_empty());
        assert!(markers.is_empty());
    }

    #[test]
    fn counts_for_all_population_sizes() {
        for n in [1usize, 3, 9, 10, 11, 99, 100, 250, 1000] {
            let input = descending(n as i64);
            let (top, markers) = rank_and_mark(&input);
            assert_eq!(top.len(), n.min(10), "top count for N={n}");
            assert_eq!(markers.len(), 99, "marker count for N={n}");
            for row in top.iter().chain(markers.iter()) {
                assert!(
                    (1..=n).contains(&row.rank),
                    "rank {} out of [1,{n}]",
                    row.rank
                );
            }
        }
    }

    #[test]
    fn position_formula_worked_examples() {
        // N=1000: p=50 -> 499 (rank 500), p=99 -> 989 (rank 990),
        // p=1 -> 9 (rank 10).
        assert_eq!(percentile_position(50, 1000), 499);
        assert_eq!(percentile_position(99, 1000), 989);
        assert_eq!(percentile_position(1, 1000), 9);

        // Small populations clamp into range.
        assert_eq!(percentile_position(1, 1), 0);
        assert_eq!(percentile_position(99, 1), 0);
        assert_eq!(percentile_position(99, 3), 1);
    }

    #[test]
    fn position_is_monotonic_in_percentile() {
        for n in [1usize, 7, 50, 100, 999, 1000, 123_457] {
            let mut last = 0usize;
            for p in 1..=99u8 {
                let position = percentile_position(p, n);
                assert!(position >= last, "N={n} p={p}");
                assert!(position < n);
                last = position;
            }
        }
    }

    #[test]
    fn thousand_holders_ranks_match_formula() {
        let input = descending(1000);
        let (top, markers) = rank_and_mark(&input);
        assert_eq!(top[0].rank, 1);
        assert_eq!(top[0].balance, dec!(1000));
        assert_eq!(top[9].rank, 10);

        let p99 = markers.iter().find(|m| m.percentile == Some(99)).unwrap();
        assert_eq!(p99.rank, 990);
        // Balances are 1000..1 descending, so rank r holds 1001 - r.
        assert_eq!(p99.balance, dec!(11));

        let p50 = markers.iter().find(|m| m.percentile == Some(50)).unwrap();
        assert_eq!(p50.rank, 500);

        let p1 = markers.iter().find(|m| m.percentile == Some(1)).unwrap();
        assert_eq!(p1.rank, 10);
    }

    #[test]
    fn markers_ordered_descending_by_percentile() {
        let input = descending(500);
        let (_, markers) = rank_and_mark(&input);
        let percentiles: Vec<u8> = markers.iter().filter_map(|m| m.percentile).collect();
        assert_eq!(percentiles, (1..=99u8).rev().collect::<Vec<_>>());
    }

    #[test]
    fn small_population_duplicates_markers() {
        let input = descending(3);
        let (top, markers) = rank_and_mark(&input);
        assert_eq!(top.len(), 3);
        assert_eq!(markers.len(), 99);
        // Only three distinct holders exist; every marker maps to one of them.
        let distinct: std::collections::HashSet<_> =
            markers.iter().map(|m| m.account_id.clone()).collect();
        assert!(distinct.len() <= 3);
    }

    #[test]
    fn ties_keep_input_order_and_rerun_is_identical() {
        let input = holders(&[50, 100, 50, 100, 25]);
        let (top_a, markers_a) = rank_and_mark(&input);
        let (top_b, markers_b) = rank_and_mark(&input);
        assert_eq!(top_a, top_b);
        assert_eq!(markers_a, markers_b);

        // The two 100-balances keep input order: index 1 before index 3.
        assert_eq!(top_a[0].account_id, "0.0.1");
        assert_eq!(top_a[1].account_id, "0.0.3");
        assert_eq!(top_a[2].account_id, "0.0.0");
        assert_eq!(top_a[3].account_id, "0.0.2");
        assert_eq!(top_a[4].account_id, "0.0.4");
    }
}

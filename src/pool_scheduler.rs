//! Chooses pool accounts and the randomized shuffle plan for one mix
//! request: split amounts, per-minute transfer rates, and jittered
//! timing across the mixing duration.

use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;

use crate::accounts_client::LeasedAccount;

pub const MIN_MIXING_TX_PER_MINUTE: u32 = 5;
pub const MAX_MIXING_TX_PER_MINUTE: u32 = 20;

/// Maximum attempts at drawing a split before falling back to an equal
/// split with the remainder folded into the last part.
const MAX_SPLIT_ATTEMPTS: u32 = 20;

/// A single planned transfer within the shuffle.
#[derive(Debug, Clone)]
pub struct PlannedTransfer {
    pub from_account: String,
    pub to_account: String,
    pub amount: u128,
    pub at: Duration,
}

#[derive(Debug, Clone)]
pub struct MixPlan {
    pub transfers: Vec<PlannedTransfer>,
}

/// Produces `n` positive integers summing exactly to `total`, drawn so
/// each partition is nearly but not identically equal.
///
/// `n == 1` returns `[total]`. If any drawn partition falls outside
/// `[min_tx_amount, max_tx_amount]`, the draw is retried up to
/// `MAX_SPLIT_ATTEMPTS` times; on final failure, falls back to an equal
/// split with the remainder folded into the last part (which may itself
/// exceed `max_tx_amount` for a pathologically small `n`). Always
/// satisfies `sum == total` and `all parts > 0`.
pub fn random_split(total: u128, n: u32, min_tx_amount: u128, max_tx_amount: u128) -> Vec<u128> {
    if n <= 1 || total <= 1 {
        return vec![total];
    }
    let n = n as usize;

    for _ in 0..MAX_SPLIT_ATTEMPTS {
        if let Some(parts) = try_random_split(total, n, min_tx_amount, max_tx_amount) {
            return parts;
        }
    }
    equal_split_with_remainder(total, n)
}

fn try_random_split(total: u128, n: usize, min_tx_amount: u128, max_tx_amount: u128) -> Option<Vec<u128>> {
    let mut rng = rand::thread_rng();
    // n-1 distinct cut points in [1, total-1].
    let mut cuts: Vec<u128> = Vec::with_capacity(n - 1);
    let mut seen = std::collections::HashSet::new();
    let mut guard = 0;
    while cuts.len() < n - 1 {
        guard += 1;
        if guard > 10_000 {
            return None;
        }
        let c = rng.gen_range(1..total);
        if seen.insert(c) {
            cuts.push(c);
        }
    }
    cuts.sort_unstable();

    let mut parts = Vec::with_capacity(n);
    let mut prev = 0u128;
    for &c in &cuts {
        parts.push(c - prev);
        prev = c;
    }
    parts.push(total - prev);

    let lo = min_tx_amount.max(1);
    let hi = max_tx_amount.max(lo);
    if parts.iter().all(|&p| p >= lo && p <= hi) {
        Some(parts)
    } else {
        None
    }
}

fn equal_split_with_remainder(total: u128, n: usize) -> Vec<u128> {
    let base = total / n as u128;
    let remainder = total % n as u128;
    let mut parts = vec![base; n];
    if let Some(last) = parts.last_mut() {
        *last += remainder;
    }
    parts
}

/// Reduces `n` toward `floor(total / min_tx_amount)` when the request is
/// too small to support the requested split count, per spec §4.2 tie-breaks.
pub fn effective_split_count(total: u128, requested_n: u32, min_tx_amount: u128) -> u32 {
    if min_tx_amount == 0 {
        return requested_n.max(1);
    }
    let max_supported = (total / min_tx_amount).max(1) as u32;
    requested_n.min(max_supported).max(1)
}

/// Plans a shuffle across the leased pool accounts: each split amount
/// hops through a chain of accounts before arriving at the final account
/// that will fund deliveries, timed so the per-minute transfer rate stays
/// within `[MIN_MIXING_TX_PER_MINUTE, MAX_MIXING_TX_PER_MINUTE]`. Destination
/// accounts already at or above `max_pool_balance` in `wire_token` are
/// skipped where an alternative is available; this is advisory only, since
/// the Accounts service is the authoritative enforcer of the cap.
pub fn plan_shuffle(
    accounts: &[LeasedAccount],
    splits: &[u128],
    mixing_duration: Duration,
    wire_token: &str,
    max_pool_balance: u128,
) -> MixPlan {
    if accounts.len() < 2 || splits.is_empty() {
        return MixPlan { transfers: vec![] };
    }

    let mut rng = rand::thread_rng();
    let mut order: Vec<usize> = (0..accounts.len()).collect();
    order.shuffle(&mut rng);

    let pick_to_idx = |from_idx: usize, amount: u128| -> usize {
        order
            .iter()
            .copied()
            .find(|&idx| {
                idx != from_idx
                    && accounts[idx].balance_of(wire_token) + amount <= max_pool_balance
            })
            .unwrap_or_else(|| order[(from_idx + 1) % order.len()])
    };

    // Give every split amount at least one hop between two pool accounts.
    let mut transfers = Vec::with_capacity(splits.len());
    let minutes = (mixing_duration.as_secs_f64() / 60.0).max(1.0);
    let max_by_rate = (minutes * MAX_MIXING_TX_PER_MINUTE as f64).floor().max(1.0) as usize;
    let min_by_rate = (minutes * MIN_MIXING_TX_PER_MINUTE as f64).ceil().max(1.0) as usize;
    let jitter_span = mixing_duration;

    let random_at = |rng: &mut rand::rngs::ThreadRng| {
        let jitter_frac: f64 = rng.gen_range(0.0..1.0);
        Duration::from_secs_f64(jitter_frac * jitter_span.as_secs_f64())
    };

    for (i, &amount) in splits.iter().enumerate() {
        let from_idx = order[i % order.len()];
        let to_idx = pick_to_idx(from_idx, amount);
        let at = random_at(&mut rng);
        transfers.push(PlannedTransfer {
            from_account: accounts[from_idx].id.clone(),
            to_account: accounts[to_idx].id.clone(),
            amount,
            at,
        });
        if transfers.len() >= max_by_rate {
            break;
        }
    }

    // If the one-hop-per-split plan falls short of the minimum observable
    // transfer rate, add extra re-hops that carry an already-planned split
    // through one more pool account, up to the rate ceiling.
    let mut extra_hop = 0usize;
    while transfers.len() < min_by_rate && transfers.len() < max_by_rate {
        let amount = splits[extra_hop % splits.len()];
        let from_idx = order[extra_hop % order.len()];
        let to_idx = pick_to_idx(from_idx, amount);
        let at = random_at(&mut rng);
        transfers.push(PlannedTransfer {
            from_account: accounts[from_idx].id.clone(),
            to_account: accounts[to_idx].id.clone(),
            amount,
            at,
        });
        extra_hop += 1;
    }

    transfers.sort_by_key(|t| t.at);

    MixPlan { transfers }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_sums_match_total_for_many_n() {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let total: u128 = rng.gen_range(1..=1_000_000_000_000u128);
            let n: u32 = rng.gen_range(1..=20);
            let min_tx = 1u128;
            let parts = random_split(total, n, min_tx, total);
            let sum: u128 = parts.iter().sum();
            assert_eq!(sum, total);
            assert!(parts.iter().all(|&p| p > 0));
        }
    }

    #[test]
    fn n_equal_one_returns_total() {
        assert_eq!(random_split(500, 1, 10, 1_000), vec![500]);
    }

    #[test]
    fn respects_max_tx_amount() {
        for _ in 0..1_000 {
            let parts = random_split(1_000_000, 10, 1, 200_000);
            assert_eq!(parts.iter().sum::<u128>(), 1_000_000);
            assert!(parts.iter().all(|&p| p <= 200_000));
        }
    }

    #[test]
    fn effective_split_count_shrinks_for_small_totals() {
        assert_eq!(effective_split_count(100, 10, 50), 2);
        assert_eq!(effective_split_count(10, 10, 50), 1);
        assert_eq!(effective_split_count(1000, 3, 50), 3);
    }

    #[test]
    fn plan_shuffle_respects_rate_bound() {
        let accounts: Vec<LeasedAccount> = (0..3)
            .map(|i| LeasedAccount {
                id: format!("acct-{i}"),
                address: format!("N{i}"),
                balances: vec![],
                tx_count: 0,
                is_retiring: false,
            })
            .collect();
        let splits = vec![100u128; 500];
        let plan = plan_shuffle(&accounts, &splits, Duration::from_secs(60), "GAS", u128::MAX);
        let max_allowed = MAX_MIXING_TX_PER_MINUTE as usize;
        assert!(plan.transfers.len() <= max_allowed);
    }

    #[test]
    fn plan_shuffle_empty_with_single_account() {
        let accounts = vec![LeasedAccount {
            id: "a".into(),
            address: "NA".into(),
            balances: vec![],
            tx_count: 0,
            is_retiring: false,
        }];
        let plan = plan_shuffle(&accounts, &[100], Duration::from_secs(60), "GAS", u128::MAX);
        assert!(plan.transfers.is_empty());
    }

    #[test]
    fn plan_shuffle_avoids_destinations_over_pool_cap() {
        // Two near-full accounts and one empty one: whenever the shuffle
        // doesn't pick the empty account as the source, the only
        // cap-respecting destination is the empty account.
        let accounts = vec![
            LeasedAccount {
                id: "a".into(),
                address: "NA".into(),
                balances: vec![("GAS".into(), 950)],
                tx_count: 0,
                is_retiring: false,
            },
            LeasedAccount {
                id: "b".into(),
                address: "NB".into(),
                balances: vec![("GAS".into(), 950)],
                tx_count: 0,
                is_retiring: false,
            },
            LeasedAccount {
                id: "empty".into(),
                address: "NEmpty".into(),
                balances: vec![("GAS".into(), 0)],
                tx_count: 0,
                is_retiring: false,
            },
        ];
        for _ in 0..50 {
            let plan = plan_shuffle(&accounts, &[100], Duration::from_secs(60), "GAS", 1_000);
            let transfer = &plan.transfers[0];
            if transfer.from_account != "empty" {
                assert_eq!(transfer.to_account, "empty");
            }
        }
    }
}

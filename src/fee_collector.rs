//! At most once per delivered request, transfers the accumulated service
//! fee from a pseudo-randomly chosen pool account to the fixed master fee
//! address. Failure is logged but never affects request status.

use std::sync::Arc;

use rand::Rng;
use tracing::{info, warn};

use crate::accounts_client::{AccountsClient, LeasedAccount};
use crate::config::MixerConfig;
use crate::store::MixRequest;

pub struct FeeCollector {
    accounts: AccountsClient,
    fee_address: String,
    config: Arc<MixerConfig>,
}

impl FeeCollector {
    pub fn new(accounts: AccountsClient, fee_address: String, config: Arc<MixerConfig>) -> Self {
        Self {
            accounts,
            fee_address,
            config,
        }
    }

    /// Fire-and-forget: spawns a task that selects a pool account with
    /// sufficient balance and transfers the fee, logging but never
    /// propagating failure.
    pub fn collect_in_background(self: std::sync::Arc<Self>, request: MixRequest) {
        tokio::spawn(async move {
            if let Err(e) = self.collect(&request).await {
                warn!(request_id = %request.id, error = %e, "fee collection failed (non-fatal)");
            }
        });
    }

    async fn collect(&self, request: &MixRequest) -> Result<(), FeeCollectError> {
        if request.service_fee == 0 {
            return Ok(());
        }

        let wire_token = self
            .config
            .token(&request.token_type)
            .map(|t| t.script_hash.as_str())
            .unwrap_or(&request.token_type);

        let candidates = self
            .accounts
            .get_locked_accounts(wire_token, Some(request.service_fee))
            .await
            .map_err(|e| FeeCollectError(e.to_string()))?;

        let chosen = pick_weighted(&candidates, wire_token, request.service_fee)
            .ok_or_else(|| FeeCollectError("no pool account holds the service fee balance".into()))?;

        let tx_id = self
            .accounts
            .transfer(&chosen.id, &self.fee_address, request.service_fee, wire_token)
            .await
            .map_err(|e| FeeCollectError(e.to_string()))?;

        info!(
            request_id = %request.id,
            account_id = %chosen.id,
            amount = request.service_fee,
            tx_id = %tx_id,
            "service fee collected"
        );
        Ok(())
    }
}

/// Weighted pseudo-random pick among accounts whose balance in
/// `token_type` is at least `min_balance`, weighted by that balance.
fn pick_weighted<'a>(
    candidates: &'a [LeasedAccount],
    token_type: &str,
    min_balance: u128,
) -> Option<&'a LeasedAccount> {
    let eligible: Vec<&LeasedAccount> = candidates
        .iter()
        .filter(|a| a.balance_of(token_type) >= min_balance)
        .collect();
    if eligible.is_empty() {
        return None;
    }
    let total_weight: u128 = eligible.iter().map(|a| a.balance_of(token_type)).sum();
    if total_weight == 0 {
        return None;
    }
    let mut pick = rand::thread_rng().gen_range(0..total_weight);
    for account in &eligible {
        let weight = account.balance_of(token_type);
        if pick < weight {
            return Some(account);
        }
        pick -= weight;
    }
    eligible.last().copied()
}

#[derive(Debug)]
struct FeeCollectError(String);

impl std::fmt::Display for FeeCollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fee collection error: {}", self.0)
    }
}

impl std::error::Error for FeeCollectError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn acct(id: &str, balance: u128) -> LeasedAccount {
        LeasedAccount {
            id: id.to_string(),
            address: format!("N{id}"),
            balances: vec![("GAS".into(), balance)],
            tx_count: 0,
            is_retiring: false,
        }
    }

    #[test]
    fn pick_weighted_excludes_below_min_balance() {
        let accounts = vec![acct("a", 10), acct("b", 1000)];
        for _ in 0..50 {
            let chosen = pick_weighted(&accounts, "GAS", 500).unwrap();
            assert_eq!(chosen.id, "b");
        }
    }

    #[test]
    fn pick_weighted_none_when_no_eligible_account() {
        let accounts = vec![acct("a", 10)];
        assert!(pick_weighted(&accounts, "GAS", 500).is_none());
    }
}

//! Executes the shuffle plan for one in-flight request, then delivers to
//! user-supplied targets and produces the completion proof.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::accounts_client::{AccountsClient, AccountsError, LeasedAccount};
use crate::pool_scheduler::MixPlan;
use crate::proof::{outputs_hash, CompletionProof, ProofSigner};
use crate::store::{DeliveryRecord, MixRequest, RequestStore, StoreError};

#[derive(Debug)]
pub enum MixingError {
    Accounts(AccountsError),
    Store(StoreError),
    Timeout,
    NoCapableAccount,
}

impl std::fmt::Display for MixingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MixingError::Accounts(e) => write!(f, "accounts client error: {e}"),
            MixingError::Store(e) => write!(f, "store error: {e}"),
            MixingError::Timeout => write!(f, "mixing engine whole-request timeout exceeded"),
            MixingError::NoCapableAccount => {
                write!(f, "no pool account holds sufficient balance for delivery")
            }
        }
    }
}

impl std::error::Error for MixingError {}

impl From<AccountsError> for MixingError {
    fn from(e: AccountsError) -> Self {
        MixingError::Accounts(e)
    }
}

impl From<StoreError> for MixingError {
    fn from(e: StoreError) -> Self {
        MixingError::Store(e)
    }
}

pub struct MixingEngine<S: RequestStore> {
    accounts: std::sync::Arc<AccountsClient>,
    signer: std::sync::Arc<ProofSigner>,
    store: std::sync::Arc<S>,
}

impl<S: RequestStore> MixingEngine<S> {
    pub fn new(
        accounts: std::sync::Arc<AccountsClient>,
        signer: std::sync::Arc<ProofSigner>,
        store: std::sync::Arc<S>,
    ) -> Self {
        Self {
            accounts,
            signer,
            store,
        }
    }

    /// Drives shuffle transfers, then delivery, honoring a whole-request
    /// timeout of `2 * mixing_duration` (spec §4.3). `wire_token` is the
    /// identifier the Accounts service expects on the wire (the token's
    /// on-chain script hash), which may differ from the request's
    /// human-readable `token_type` ticker.
    pub async fn run(
        &self,
        request: &MixRequest,
        plan: MixPlan,
        mixing_duration: Duration,
        wire_token: &str,
    ) -> Result<CompletionProof, MixingError> {
        let budget = mixing_duration * 2;
        tokio::time::timeout(budget, self.run_inner(request, plan, wire_token))
            .await
            .map_err(|_| MixingError::Timeout)?
    }

    async fn run_inner(
        &self,
        request: &MixRequest,
        plan: MixPlan,
        wire_token: &str,
    ) -> Result<CompletionProof, MixingError> {
        let mut ledger: HashMap<String, i128> = HashMap::new();
        let started = tokio::time::Instant::now();

        // Snapshot pool balances before any shuffle transfer lands. The
        // shuffle's effects are tracked purely in `ledger` and applied to
        // this snapshot afterward; the snapshot is never re-fetched, since
        // a post-shuffle fetch would already reflect these same transfers
        // and double-count them once `apply_ledger` ran.
        let mut candidates = self.accounts.get_locked_accounts(wire_token, None).await?;

        for transfer in &plan.transfers {
            tokio::time::sleep_until(started + transfer.at).await;
            let tx_id = self
                .accounts
                .transfer(
                    &transfer.from_account,
                    &transfer.to_account,
                    transfer.amount,
                    wire_token,
                )
                .await?;
            info!(
                request_id = %request.id,
                from = %transfer.from_account,
                to = %transfer.to_account,
                amount = transfer.amount,
                tx_id = %tx_id,
                "shuffle transfer complete"
            );
            *ledger.entry(transfer.from_account.clone()).or_insert(0) -= transfer.amount as i128;
            *ledger.entry(transfer.to_account.clone()).or_insert(0) += transfer.amount as i128;
        }

        apply_ledger(&mut candidates, &ledger, wire_token);
        candidates.sort_by_key(|a| std::cmp::Reverse(a.balance_of(wire_token)));

        let mut tx_ids: Vec<String> = Vec::with_capacity(request.targets.len());

        for (idx, target) in request.targets.iter().enumerate() {
            // Checkpointed restart: a target already delivered before a
            // restart is not redelivered, just re-reported.
            if let Some(existing) = request.deliveries.iter().find(|d| d.target_index == idx) {
                tx_ids.push(existing.tx_id.clone());
                continue;
            }

            let chosen = candidates
                .iter_mut()
                .find(|a| a.balance_of(wire_token) >= target.amount)
                .ok_or(MixingError::NoCapableAccount)?;

            let tx_id = self
                .accounts
                .transfer(&chosen.id, &target.address, target.amount, wire_token)
                .await?;

            for b in chosen.balances.iter_mut() {
                if b.0 == wire_token {
                    b.1 -= target.amount;
                }
            }

            self.store
                .append_delivery(
                    &request.id,
                    DeliveryRecord {
                        target_index: idx,
                        tx_id: tx_id.clone(),
                    },
                )
                .await?;

            info!(request_id = %request.id, target = %target.address, tx_id = %tx_id, "delivery complete");
            tx_ids.push(tx_id);
        }

        let completed_at = now_epoch();
        let out_hash = outputs_hash(&request.targets, &tx_ids);
        let tee_signature = self
            .signer
            .sign_completion(&request.request_hash, &out_hash, completed_at)
            .map_err(|e| {
                warn!(request_id = %request.id, error = %e, "completion signing failed");
                MixingError::NoCapableAccount
            })?;

        Ok(CompletionProof {
            request_id: request.id.clone(),
            request_hash: request.request_hash,
            outputs_hash: out_hash,
            output_tx_ids: tx_ids,
            completed_at,
            tee_signature,
        })
    }
}

fn apply_ledger(accounts: &mut [LeasedAccount], ledger: &HashMap<String, i128>, token_type: &str) {
    for account in accounts.iter_mut() {
        if let Some(delta) = ledger.get(&account.id) {
            for b in account.balances.iter_mut() {
                if b.0 == token_type {
                    b.1 = (b.1 as i128 + delta).max(0) as u128;
                }
            }
        }
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TargetAddress;

    #[test]
    fn apply_ledger_clamps_at_zero() {
        let mut accounts = vec![LeasedAccount {
            id: "a".into(),
            address: "NA".into(),
            balances: vec![("GAS".into(), 10)],
            tx_count: 0,
            is_retiring: false,
        }];
        let mut ledger = HashMap::new();
        ledger.insert("a".to_string(), -100i128);
        apply_ledger(&mut accounts, &ledger, "GAS");
        assert_eq!(accounts[0].balance_of("GAS"), 0);
    }

    #[test]
    fn target_conservation_matches_net_amount() {
        let targets = [
            TargetAddress {
                address: "A".into(),
                amount: 500_000,
            },
            TargetAddress {
                address: "B".into(),
                amount: 497_500,
            },
        ];
        let net_amount: u128 = targets.iter().map(|t| t.amount).sum();
        assert_eq!(net_amount, 997_500);
    }
}

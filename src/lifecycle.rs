//! Owns the per-request state machine. The sole writer of `MixRequest`
//! status; schedules the Mixing Engine, resumes in-flight work on
//! startup, and drives the deadline sweep.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::accounts_client::AccountsClient;
use crate::config::{MixerConfig, TokenConfig};
use crate::fee_collector::FeeCollector;
use crate::mixing_engine::MixingEngine;
use crate::pool_scheduler::{effective_split_count, plan_shuffle, random_split};
use crate::proof::{request_hash, ProofSigner, RequestHashInput};
use crate::store::{
    MixRequest, MixRequestStatus, RequestStore, StatusUpdate, TargetAddress,
};

#[derive(Debug)]
pub enum LifecycleError {
    InvalidInput(String),
    TokenUnsupported(String),
    LimitExceeded(String),
    PoolUnavailable(String),
    NotFound(String),
    Internal(String),
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::InvalidInput(m) => write!(f, "invalid input: {m}"),
            LifecycleError::TokenUnsupported(t) => write!(f, "token unsupported: {t}"),
            LifecycleError::LimitExceeded(m) => write!(f, "limit exceeded: {m}"),
            LifecycleError::PoolUnavailable(m) => write!(f, "pool unavailable: {m}"),
            LifecycleError::NotFound(id) => write!(f, "request not found: {id}"),
            LifecycleError::Internal(m) => write!(f, "internal error: {m}"),
        }
    }
}

impl std::error::Error for LifecycleError {}

pub struct AcceptInput {
    pub user_id: String,
    pub token_type: String,
    pub total_amount: u128,
    pub targets: Vec<TargetAddress>,
    pub initial_splits: Option<u32>,
    pub mixing_duration_secs: Option<u64>,
}

pub struct AcceptResult {
    pub request_id: String,
    pub request_proof: crate::proof::RequestProof,
    pub deposit_address: String,
}

pub struct LifecycleManager<S: RequestStore> {
    store: Arc<S>,
    accounts: Arc<AccountsClient>,
    signer: Arc<ProofSigner>,
    fee_collector: Arc<FeeCollector>,
    config: Arc<MixerConfig>,
    // Guards against a second `admit_to_mixing` task running for the same
    // request (spec §5: one logical task per request). `confirm_deposit`,
    // `resume_request`, and `resume_in_flight` can all race to spawn one for
    // the same id; `DashSet::insert`'s return value is the atomic
    // check-and-insert.
    in_flight: dashmap::DashSet<String>,
}

// Methods that spawn follow-up work on `self` take `self: Arc<Self>` by
// value; callers pass `Arc::clone(&manager)`. The rest take plain `&self`.

impl<S: RequestStore> LifecycleManager<S> {
    pub fn new(
        store: Arc<S>,
        accounts: Arc<AccountsClient>,
        signer: Arc<ProofSigner>,
        fee_collector: Arc<FeeCollector>,
        config: Arc<MixerConfig>,
    ) -> Self {
        Self {
            store,
            accounts,
            signer,
            fee_collector,
            config,
            in_flight: dashmap::DashSet::new(),
        }
    }

    fn token_config(&self, token_type: &str) -> Result<&TokenConfig, LifecycleError> {
        self.config
            .token(token_type)
            .ok_or_else(|| LifecycleError::TokenUnsupported(token_type.to_string()))
    }

    /// Validates input, leases a deposit account, signs the request proof,
    /// and persists the record in `Pending`.
    pub async fn accept(&self, input: AcceptInput) -> Result<AcceptResult, LifecycleError> {
        if input.targets.is_empty() {
            return Err(LifecycleError::InvalidInput("targets must be non-empty".into()));
        }

        let token = self.token_config(&input.token_type)?;

        if input
            .targets
            .iter()
            .any(|t| crate::config::addresses_match(&t.address, &self.config.fee_address))
        {
            return Err(LifecycleError::InvalidInput(
                "targets may not include the service fee address".into(),
            ));
        }

        let min_required = token.min_tx_amount * input.targets.len() as u128;
        if input.total_amount < min_required || input.total_amount > token.max_request_amount {
            return Err(LifecycleError::LimitExceeded(format!(
                "total_amount must be within [{min_required}, {}]",
                token.max_request_amount
            )));
        }

        let service_fee = token.service_fee(input.total_amount);
        let net_amount = input.total_amount - service_fee;
        let targets_sum: u128 = input.targets.iter().map(|t| t.amount).sum();
        if targets_sum != net_amount {
            return Err(LifecycleError::InvalidInput(format!(
                "targets must sum to net amount {net_amount}, got {targets_sum}"
            )));
        }

        let leased = self
            .accounts
            .request_accounts(1, "deposit")
            .await
            .map_err(|e| LifecycleError::PoolUnavailable(e.to_string()))?;
        let deposit_account = leased
            .into_iter()
            .next()
            .ok_or_else(|| LifecycleError::PoolUnavailable("no account returned".into()))?;

        let request_id = Uuid::new_v4().to_string();
        let created_at = now_epoch();
        let deadline = created_at + self.config.dispute_grace_period_secs;
        let initial_splits = input.initial_splits.unwrap_or(3).max(1);
        let mixing_duration_ms =
            input.mixing_duration_secs.unwrap_or(self.config.default_mixing_duration_secs) * 1000;

        let hash_input = RequestHashInput {
            user_id: &input.user_id,
            token_type: &input.token_type,
            total_amount: input.total_amount,
            targets: &input.targets,
            initial_splits,
            mixing_duration_ms,
            deadline,
            created_at,
        };
        let req_hash = request_hash(&hash_input);
        let tee_signature = self
            .signer
            .sign_request(&req_hash)
            .map_err(|e| LifecycleError::Internal(e.to_string()))?;

        let record = MixRequest {
            id: request_id.clone(),
            user_id: input.user_id,
            token_type: input.token_type,
            total_amount: input.total_amount,
            service_fee,
            net_amount,
            targets: input.targets,
            initial_splits,
            mixing_duration_ms,
            deposit_address: deposit_account.address.clone(),
            deposit_account_id: deposit_account.id.clone(),
            deadline,
            status: MixRequestStatus::Pending,
            request_hash: req_hash,
            tee_signature,
            completion_proof: None,
            pool_account_ids: vec![deposit_account.id.clone()],
            deliveries: vec![],
            dispute_tx_hash: None,
            failure_reason: None,
            created_at,
        };

        self.store
            .create(&record)
            .await
            .map_err(|e| LifecycleError::Internal(e.to_string()))?;

        info!(request_id = %request_id, total_amount = record.total_amount, "mix request accepted");

        Ok(AcceptResult {
            request_id,
            request_proof: record.request_proof(),
            deposit_address: record.deposit_address,
        })
    }

    /// Transitions `pending -> deposited` and enqueues the request for
    /// mixing. Idempotent: repeating on an already-deposited request is a
    /// no-op.
    pub async fn confirm_deposit(self: Arc<Self>, request_id: &str) -> Result<(), LifecycleError> {
        let request = self
            .store
            .get(request_id)
            .await
            .map_err(|e| LifecycleError::Internal(e.to_string()))?
            .ok_or_else(|| LifecycleError::NotFound(request_id.to_string()))?;

        match request.status {
            MixRequestStatus::Pending => {}
            MixRequestStatus::Deposited | MixRequestStatus::Mixing => return Ok(()),
            _ => {
                return Err(LifecycleError::InvalidInput(format!(
                    "request {request_id} is not pending"
                )))
            }
        }

        self.store
            .update_status(request_id, MixRequestStatus::Deposited, StatusUpdate::default())
            .await
            .map_err(|e| LifecycleError::Internal(e.to_string()))?;

        let manager = Arc::clone(&self);
        let id = request_id.to_string();
        tokio::spawn(async move {
            manager.admit_to_mixing(&id).await;
        });

        Ok(())
    }

    /// Re-admits a single stuck request (e.g. after a client-observed
    /// timeout) rather than sweeping the whole store. A no-op for requests
    /// already in a terminal state.
    pub async fn resume_request(self: Arc<Self>, request_id: &str) -> Result<(), LifecycleError> {
        let request = self
            .store
            .get(request_id)
            .await
            .map_err(|e| LifecycleError::Internal(e.to_string()))?
            .ok_or_else(|| LifecycleError::NotFound(request_id.to_string()))?;

        match request.status {
            MixRequestStatus::Deposited | MixRequestStatus::Mixing => {}
            _ => {
                return Err(LifecycleError::InvalidInput(format!(
                    "request {request_id} is not resumable from its current state"
                )))
            }
        }

        let manager = Arc::clone(&self);
        let id = request_id.to_string();
        tokio::spawn(async move {
            manager.admit_to_mixing(&id).await;
        });

        Ok(())
    }

    /// Entry point for admitting a request into mixing. Ensures at most one
    /// admission task runs per request at a time: a second caller (e.g.
    /// `resume_request` racing `confirm_deposit`'s spawned task) observes
    /// the insert fail and returns immediately instead of running a second
    /// engine pass over the same request.
    async fn admit_to_mixing(self: Arc<Self>, request_id: &str) {
        if !self.in_flight.insert(request_id.to_string()) {
            info!(request_id, "admit_to_mixing already running for this request, skipping");
            return;
        }
        self.clone().admit_to_mixing_inner(request_id).await;
        self.in_flight.remove(request_id);
    }

    /// Runs the Pool Scheduler and Mixing Engine for one request, then
    /// drives the terminal transition. Never returns an error to the
    /// caller: failures are absorbed and recorded on the request itself,
    /// per spec §7's fatal-failure disposition.
    async fn admit_to_mixing_inner(self: Arc<Self>, request_id: &str) {
        let request = match self.store.get(request_id).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                error!(request_id, "admit_to_mixing: request vanished from store");
                return;
            }
            Err(e) => {
                error!(request_id, error = %e, "admit_to_mixing: store read failed");
                return;
            }
        };

        if request.status == MixRequestStatus::Delivered {
            return;
        }

        if request.status == MixRequestStatus::Deposited {
            if let Err(e) = self
                .store
                .update_status(request_id, MixRequestStatus::Mixing, StatusUpdate::default())
                .await
            {
                error!(request_id, error = %e, "failed to transition to mixing");
                return;
            }
        }

        let token = match self.token_config(&request.token_type) {
            Ok(t) => t.clone(),
            Err(e) => {
                self.fail_request(request_id, e.to_string()).await;
                return;
            }
        };

        let n = effective_split_count(request.total_amount, request.initial_splits, token.min_tx_amount);
        let leased = match self.accounts.request_accounts(n, "mixing-hop").await {
            Ok(accts) if !accts.is_empty() => accts,
            Ok(_) => {
                self.fail_request(request_id, "pool scheduler produced an empty plan".into())
                    .await;
                return;
            }
            Err(e) => {
                self.fail_request(request_id, format!("pool unavailable: {e}")).await;
                return;
            }
        };

        let mut pool_ids: Vec<String> = request.pool_account_ids.clone();
        for acct in &leased {
            if !pool_ids.contains(&acct.id) {
                pool_ids.push(acct.id.clone());
            }
        }
        let _ = self
            .store
            .update_status(
                request_id,
                MixRequestStatus::Mixing,
                StatusUpdate {
                    pool_account_ids: Some(pool_ids.clone()),
                    ..Default::default()
                },
            )
            .await;

        let splits = random_split(
            request.net_amount,
            leased.len() as u32,
            token.min_tx_amount,
            token.max_tx_amount,
        );
        let mixing_duration = Duration::from_millis(request.mixing_duration_ms);
        let plan = plan_shuffle(
            &leased,
            &splits,
            mixing_duration,
            &token.script_hash,
            token.max_pool_balance,
        );

        let engine = MixingEngine::new(
            Arc::clone(&self.accounts),
            Arc::clone(&self.signer),
            Arc::clone(&self.store),
        );

        match engine.run(&request, plan, mixing_duration, &token.script_hash).await {
            Ok(proof) => self.mark_delivered(request_id, proof).await,
            Err(e) => self.fail_request(request_id, e.to_string()).await,
        }
    }

    /// Persists the completion proof, transitions to `delivered`, and
    /// fires fee collection. Releases pool accounts exactly once here.
    pub async fn mark_delivered(
        &self,
        request_id: &str,
        completion_proof: crate::proof::CompletionProof,
    ) {
        let update = self
            .store
            .update_status(
                request_id,
                MixRequestStatus::Delivered,
                StatusUpdate {
                    completion_proof: Some(completion_proof),
                    ..Default::default()
                },
            )
            .await;

        if let Err(e) = update {
            error!(request_id, error = %e, "failed to persist delivered status");
            return;
        }

        info!(request_id, "mix request delivered");

        if let Ok(Some(request)) = self.store.get(request_id).await {
            self.release_pool_accounts(&request.pool_account_ids).await;
            Arc::clone(&self.fee_collector).collect_in_background(request);
        }
    }

    async fn fail_request(&self, request_id: &str, reason: String) {
        warn!(request_id, reason = %reason, "mix request failed");
        let _ = self
            .store
            .update_status(
                request_id,
                MixRequestStatus::Failed,
                StatusUpdate {
                    failure_reason: Some(reason),
                    ..Default::default()
                },
            )
            .await;
        if let Ok(Some(request)) = self.store.get(request_id).await {
            self.release_pool_accounts(&request.pool_account_ids).await;
        }
    }

    async fn release_pool_accounts(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.accounts.release_accounts(ids).await {
            warn!(error = %e, "pool account release failed (best-effort)");
        }
    }

    /// On startup, re-queues `deposited` requests and resumes `mixing`
    /// requests from their last persisted checkpoint.
    pub async fn resume_in_flight(self: Arc<Self>) {
        for status in [MixRequestStatus::Deposited, MixRequestStatus::Mixing] {
            let requests = match self.store.list_by_status(status.clone()).await {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "resume_in_flight: failed to list requests");
                    continue;
                }
            };
            for request in requests {
                info!(request_id = %request.id, status = ?status, "resuming in-flight request");
                let manager = Arc::clone(&self);
                let id = request.id.clone();
                tokio::spawn(async move {
                    manager.admit_to_mixing(&id).await;
                });
            }
        }
    }

    /// Periodic task: transitions `pending` requests past their deadline
    /// to `failed` and releases the deposit account.
    pub async fn expire_pending_sweep(&self) {
        let pending = match self.store.list_by_status(MixRequestStatus::Pending).await {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "expire_pending_sweep: failed to list pending requests");
                return;
            }
        };
        let now = now_epoch();
        for request in pending {
            if now <= request.deadline {
                continue;
            }
            self.fail_request(&request.id, "deposit deadline elapsed".into()).await;
        }
    }

    /// Spawns the periodic deadline sweep, matching the cadence of the
    /// store's own eviction loop.
    pub fn spawn_expire_pending_sweep(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                self.expire_pending_sweep().await;
            }
        });
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

    #[test]
    fn fee_identity_holds() {
        let token = TokenConfig {
            token_type: "GAS".into(),
            script_hash: "0x0".into(),
            min_tx_amount: 1,
            max_tx_amount: 1_000_000,
            max_request_amount: 1_000_000,
            max_pool_balance: 1_000_000,
            service_fee_bps: 50,
        };
        let total = 1_000_000u128;
        let fee = token.service_fee(total);
        let net = total - fee;
        assert_eq!(fee + net, total);
    }
}

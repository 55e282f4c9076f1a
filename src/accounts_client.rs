//! Adapter to the external Accounts service, which owns the pool's key
//! material and authoritative balances. The mixer core never signs or
//! holds keys directly — every lease, balance update, sign, and transfer
//! crosses this authenticated HTTP boundary.

use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// Maximum retries for transient failures against the Accounts service.
const MAX_RETRIES: u32 = 3;
/// Base backoff between retries; doubled on each attempt.
const RETRY_BACKOFF_MS: u64 = 500;
/// Per-call deadline, per spec §4.3/§5.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasedAccount {
    pub id: String,
    pub address: String,
    pub balances: Vec<(String, u128)>,
    pub tx_count: u64,
    pub is_retiring: bool,
}

impl LeasedAccount {
    pub fn balance_of(&self, token_type: &str) -> u128 {
        self.balances
            .iter()
            .find(|(t, _)| t == token_type)
            .map(|(_, b)| *b)
            .unwrap_or(0)
    }
}

#[derive(Debug)]
pub enum AccountsError {
    InsufficientPool,
    AuthFailed,
    UnknownLock,
    NotLeasedByService,
    InsufficientBalance,
    Transport(String),
}

impl std::fmt::Display for AccountsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountsError::InsufficientPool => write!(f, "insufficient pool accounts available"),
            AccountsError::AuthFailed => write!(f, "accounts service authentication failed"),
            AccountsError::UnknownLock => write!(f, "unknown lock id"),
            AccountsError::NotLeasedByService => write!(f, "account not leased by this service"),
            AccountsError::InsufficientBalance => write!(f, "insufficient balance for transfer"),
            AccountsError::Transport(msg) => write!(f, "accounts service transport error: {msg}"),
        }
    }
}

impl std::error::Error for AccountsError {}

/// Adapter over the Accounts service's JSON/HTTP contract (spec §6):
/// `POST /request`, `POST /release`, `GET /accounts`, `POST /balance`,
/// `POST /sign`, `POST /transfer`.
pub struct AccountsClient {
    http: reqwest::Client,
    base_url: String,
    service_id: String,
}

impl AccountsClient {
    /// Builds a client. `strict_identity` requires the caller to have
    /// configured the underlying `reqwest::Client` with a client
    /// certificate (mTLS); this constructor itself only refuses to start
    /// without a base URL, since TLS identity material is assembled in
    /// `config.rs` where the rest of startup validation lives.
    pub fn new(http: reqwest::Client, base_url: String, service_id: String) -> Self {
        Self {
            http,
            base_url,
            service_id,
        }
    }

    async fn post_with_retry<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, AccountsError> {
        let url = format!("{}{}", self.base_url, path);
        for attempt in 0..MAX_RETRIES {
            match self.try_post(&url, body).await {
                Ok(resp) => return Ok(resp),
                Err(e @ (AccountsError::AuthFailed
                | AccountsError::UnknownLock
                | AccountsError::NotLeasedByService
                | AccountsError::InsufficientBalance
                | AccountsError::InsufficientPool)) => {
                    // Not retryable: these are semantic rejections, not
                    // transient transport failures.
                    return Err(e);
                }
                Err(e) if attempt < MAX_RETRIES - 1 => {
                    let backoff = RETRY_BACKOFF_MS * 2u64.pow(attempt);
                    warn!(path, attempt = attempt + 1, backoff_ms = backoff, error = %e, "accounts client call failed, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => {
                    error!(path, attempts = MAX_RETRIES, error = %e, "accounts client call failed after all retries");
                    return Err(e);
                }
            }
        }
        unreachable!()
    }

    async fn try_post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &Req,
    ) -> Result<Resp, AccountsError> {
        let resp = self
            .http
            .post(url)
            .timeout(CALL_TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(|e| AccountsError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() >= 400 {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_error(status.as_u16(), &text));
        }

        resp.json::<Resp>()
            .await
            .map_err(|e| AccountsError::Transport(format!("decode response: {e}")))
    }

    /// Leases `count` fresh accounts for `purpose` (e.g. "deposit",
    /// "mixing-hop"). Each leased account is locked to this service until
    /// released.
    pub async fn request_accounts(
        &self,
        count: u32,
        purpose: &str,
    ) -> Result<Vec<LeasedAccount>, AccountsError> {
        #[derive(Serialize)]
        struct Req<'a> {
            service_id: &'a str,
            count: u32,
            purpose: &'a str,
        }
        #[derive(Deserialize)]
        struct Resp {
            accounts: Vec<LeasedAccount>,
        }
        let resp: Resp = self
            .post_with_retry(
                "/request",
                &Req {
                    service_id: &self.service_id,
                    count,
                    purpose,
                },
            )
            .await?;
        debug!(count = resp.accounts.len(), purpose, "leased pool accounts");
        Ok(resp.accounts)
    }

    /// Releases previously leased accounts. Best-effort: callers treat a
    /// failure here as logged-and-swallowed per spec §5 cancellation rules,
    /// since release is idempotent on the Accounts service side.
    pub async fn release_accounts(&self, ids: &[String]) -> Result<(), AccountsError> {
        #[derive(Serialize)]
        struct Req<'a> {
            service_id: &'a str,
            account_ids: &'a [String],
        }
        #[derive(Deserialize)]
        struct Resp {
            #[allow(dead_code)]
            ack: bool,
        }
        let _: Resp = self
            .post_with_retry(
                "/release",
                &Req {
                    service_id: &self.service_id,
                    account_ids: ids,
                },
            )
            .await?;
        Ok(())
    }

    /// Returns currently-leased accounts, optionally filtered by a minimum
    /// balance in the given token.
    pub async fn get_locked_accounts(
        &self,
        token_type: &str,
        min_balance: Option<u128>,
    ) -> Result<Vec<LeasedAccount>, AccountsError> {
        let url = match min_balance {
            Some(min) => format!(
                "{}/accounts?service_id={}&token={}&min_balance={}",
                self.base_url, self.service_id, token_type, min
            ),
            None => format!(
                "{}/accounts?service_id={}&token={}",
                self.base_url, self.service_id, token_type
            ),
        };
        let resp = self
            .http
            .get(&url)
            .timeout(CALL_TIMEOUT)
            .send()
            .await
            .map_err(|e| AccountsError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.as_u16() >= 400 {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_error(status.as_u16(), &text));
        }
        #[derive(Deserialize)]
        struct Resp {
            accounts: Vec<LeasedAccount>,
        }
        let parsed: Resp = resp
            .json()
            .await
            .map_err(|e| AccountsError::Transport(format!("decode response: {e}")))?;
        Ok(parsed.accounts)
    }

    /// Applies a signed delta to an account's per-token balance. Part of
    /// the wire contract (spec §6); the Mixing Engine derives its ledger
    /// from `transfer` responses instead of calling this directly, so it
    /// is currently reached only by reconciliation tooling outside this
    /// crate.
    #[allow(dead_code)]
    pub async fn update_balance(
        &self,
        id: &str,
        token_type: &str,
        delta: i128,
    ) -> Result<(), AccountsError> {
        #[derive(Serialize)]
        struct Req<'a> {
            service_id: &'a str,
            account_id: &'a str,
            token_type: &'a str,
            delta: i128,
        }
        #[derive(Deserialize)]
        struct Resp {
            #[allow(dead_code)]
            ack: bool,
        }
        let _: Resp = self
            .post_with_retry(
                "/balance",
                &Req {
                    service_id: &self.service_id,
                    account_id: id,
                    token_type,
                    delta,
                },
            )
            .await?;
        Ok(())
    }

    /// Requests a signature over a 32-byte hash from a leased account. Part
    /// of the wire contract (spec §6); the mixer's own transfers are signed
    /// server-side by the Accounts service, so this is exposed for callers
    /// that need a raw account signature outside a transfer (e.g. chain-side
    /// verification tooling).
    #[allow(dead_code)]
    pub async fn sign(&self, id: &str, tx_hash: &[u8; 32]) -> Result<(Vec<u8>, Vec<u8>), AccountsError> {
        #[derive(Serialize)]
        struct Req<'a> {
            service_id: &'a str,
            account_id: &'a str,
            tx_hash: String,
        }
        #[derive(Deserialize)]
        struct Resp {
            signature: String,
            public_key: String,
        }
        let resp: Resp = self
            .post_with_retry(
                "/sign",
                &Req {
                    service_id: &self.service_id,
                    account_id: id,
                    tx_hash: base64::engine::general_purpose::STANDARD.encode(tx_hash),
                },
            )
            .await?;
        let signature = base64::engine::general_purpose::STANDARD
            .decode(resp.signature)
            .map_err(|e| AccountsError::Transport(format!("bad signature encoding: {e}")))?;
        let public_key = base64::engine::general_purpose::STANDARD
            .decode(resp.public_key)
            .map_err(|e| AccountsError::Transport(format!("bad public key encoding: {e}")))?;
        Ok((signature, public_key))
    }

    /// Transfers `amount` of `token_type` from a leased account to
    /// `to_address`, returning the resulting transaction id.
    pub async fn transfer(
        &self,
        id: &str,
        to_address: &str,
        amount: u128,
        token_type: &str,
    ) -> Result<String, AccountsError> {
        #[derive(Serialize)]
        struct Req<'a> {
            service_id: &'a str,
            account_id: &'a str,
            to_address: &'a str,
            amount: u128,
            token_type: &'a str,
        }
        #[derive(Deserialize)]
        struct Resp {
            tx_id: String,
        }
        let resp: Resp = self
            .post_with_retry(
                "/transfer",
                &Req {
                    service_id: &self.service_id,
                    account_id: id,
                    to_address,
                    amount,
                    token_type,
                },
            )
            .await?;
        Ok(resp.tx_id)
    }
}

fn classify_error(status: u16, body: &str) -> AccountsError {
    let lower = body.to_lowercase();
    match status {
        401 | 403 => AccountsError::AuthFailed,
        _ if lower.contains("insufficient_pool") => AccountsError::InsufficientPool,
        _ if lower.contains("unknown_lock") => AccountsError::UnknownLock,
        _ if lower.contains("not_leased") => AccountsError::NotLeasedByService,
        _ if lower.contains("insufficient_balance") => AccountsError::InsufficientBalance,
        _ => AccountsError::Transport(format!("http {status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_of_missing_token_is_zero() {
        let acct = LeasedAccount {
            id: "a1".into(),
            address: "NA".into(),
            balances: vec![("GAS".into(), 100)],
            tx_count: 0,
            is_retiring: false,
        };
        assert_eq!(acct.balance_of("GAS"), 100);
        assert_eq!(acct.balance_of("NEO"), 0);
    }

    #[test]
    fn classify_error_maps_known_bodies() {
        assert!(matches!(classify_error(401, ""), AccountsError::AuthFailed));
        assert!(matches!(
            classify_error(400, "insufficient_pool: none left"),
            AccountsError::InsufficientPool
        ));
        assert!(matches!(
            classify_error(409, "NOT_LEASED_BY_SERVICE"),
            AccountsError::NotLeasedByService
        ));
    }
}

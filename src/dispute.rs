//! On a user dispute, decides whether the completion proof needs to be
//! submitted on-chain as evidence, and submits it at most once.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::hasher::sha256;
use crate::proof::{CompletionProof, ProofSigner};
use crate::store::{MixRequestStatus, RequestStore, StatusUpdate, StoreError};

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DisputeOutcome {
    ResolvedOffChain,
    SubmittedOnChain { tx_hash: String },
}

#[derive(Debug)]
pub enum DisputeError {
    NotApplicable,
    Expired,
    Store(StoreError),
    Fulfiller(String),
}

impl std::fmt::Display for DisputeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisputeError::NotApplicable => write!(f, "dispute not applicable"),
            DisputeError::Expired => write!(f, "dispute grace period expired"),
            DisputeError::Store(e) => write!(f, "store error: {e}"),
            DisputeError::Fulfiller(msg) => write!(f, "on-chain fulfiller error: {msg}"),
        }
    }
}

impl std::error::Error for DisputeError {}

impl From<StoreError> for DisputeError {
    fn from(e: StoreError) -> Self {
        DisputeError::Store(e)
    }
}

/// The numeric request id used on-chain: the first 8 bytes (big-endian)
/// of `SHA256(request_id)`.
pub fn numeric_request_id(request_id: &str) -> u64 {
    let digest = sha256(request_id.as_bytes());
    u64::from_be_bytes(digest[0..8].try_into().unwrap())
}

/// Adapter to the external on-chain fulfiller: a single operation that
/// submits proof bytes bound to a numeric request id.
pub struct OnChainFulfiller {
    http: reqwest::Client,
    base_url: String,
}

impl OnChainFulfiller {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    pub async fn fulfill(&self, numeric_request_id: u64, proof_bytes: &[u8]) -> Result<String, DisputeError> {
        #[derive(Serialize)]
        struct Req<'a> {
            numeric_request_id: u64,
            proof_bytes: &'a [u8],
        }
        #[derive(Deserialize)]
        struct Resp {
            tx_hash: String,
        }
        let resp = self
            .http
            .post(format!("{}/fulfill", self.base_url))
            .timeout(CALL_TIMEOUT)
            .json(&Req {
                numeric_request_id,
                proof_bytes,
            })
            .send()
            .await
            .map_err(|e| DisputeError::Fulfiller(e.to_string()))?;

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(DisputeError::Fulfiller(format!("http error: {text}")));
        }

        let parsed: Resp = resp
            .json()
            .await
            .map_err(|e| DisputeError::Fulfiller(format!("decode response: {e}")))?;
        Ok(parsed.tx_hash)
    }
}

/// Canonical serialization of a `CompletionProof` for on-chain submission,
/// using the same length-prefixed encoding as the request/outputs hash.
pub fn canonical_completion_proof_bytes(proof: &CompletionProof) -> Vec<u8> {
    use crate::hasher::{put_list, put_str, put_u64};
    let mut buf = Vec::new();
    put_str(&mut buf, &proof.request_id);
    buf.extend_from_slice(&proof.request_hash);
    buf.extend_from_slice(&proof.outputs_hash);
    put_list(&mut buf, &proof.output_tx_ids, |b, id| put_str(b, id));
    put_u64(&mut buf, proof.completed_at);
    put_list(&mut buf, &proof.tee_signature, |b, byte| b.push(*byte));
    buf
}

pub struct DisputeResolver<S: RequestStore> {
    store: std::sync::Arc<S>,
    fulfiller: OnChainFulfiller,
    signer: std::sync::Arc<ProofSigner>,
    dispute_grace_period_secs: u64,
}

impl<S: RequestStore> DisputeResolver<S> {
    pub fn new(
        store: std::sync::Arc<S>,
        fulfiller: OnChainFulfiller,
        signer: std::sync::Arc<ProofSigner>,
        dispute_grace_period_secs: u64,
    ) -> Self {
        Self {
            store,
            fulfiller,
            signer,
            dispute_grace_period_secs,
        }
    }

    /// Idempotent: a second call for the same request returns the same
    /// on-chain tx hash without submitting again.
    pub async fn handle_dispute(&self, request_id: &str) -> Result<DisputeOutcome, DisputeError> {
        let request = self
            .store
            .get(request_id)
            .await?
            .ok_or(DisputeError::NotApplicable)?;

        if request.status != MixRequestStatus::Delivered {
            return Err(DisputeError::NotApplicable);
        }

        let now = now_epoch();
        if now > request.created_at + self.dispute_grace_period_secs {
            return Err(DisputeError::Expired);
        }

        if let Some(tx_hash) = request.dispute_tx_hash.clone() {
            return Ok(DisputeOutcome::SubmittedOnChain { tx_hash });
        }

        let proof_intact = self
            .signer
            .verify_request(&request.request_hash, &request.tee_signature)
            .map_err(|e| DisputeError::Fulfiller(e.to_string()))?;
        if !proof_intact {
            return Err(DisputeError::Fulfiller(
                "stored request proof failed signature verification".into(),
            ));
        }

        let proof = match &request.completion_proof {
            Some(p) => p.clone(),
            None => return Ok(DisputeOutcome::ResolvedOffChain),
        };

        let numeric_id = numeric_request_id(&request.id);
        let proof_bytes = canonical_completion_proof_bytes(&proof);
        let tx_hash = self.fulfiller.fulfill(numeric_id, &proof_bytes).await?;

        self.store
            .update_status(
                &request.id,
                MixRequestStatus::Delivered,
                StatusUpdate {
                    dispute_tx_hash: Some(tx_hash.clone()),
                    ..Default::default()
                },
            )
            .await?;

        info!(request_id = %request.id, tx_hash = %tx_hash, "completion proof submitted on-chain");
        Ok(DisputeOutcome::SubmittedOnChain { tx_hash })
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
    fn numeric_id_is_first_eight_bytes_of_sha256() {
        let id = "req-abc-123";
        let digest = sha256(id.as_bytes());
        let expected = u64::from_be_bytes(digest[0..8].try_into().unwrap());
        assert_eq!(numeric_request_id(id), expected);
    }

    #[test]
    fn canonical_proof_bytes_are_deterministic() {
        let proof = CompletionProof {
            request_id: "req-1".into(),
            request_hash: [1u8; 32],
            outputs_hash: [2u8; 32],
            output_tx_ids: vec!["tx1".into(), "tx2".into()],
            completed_at: 1000,
            tee_signature: vec![9, 9, 9],
        };
        let a = canonical_completion_proof_bytes(&proof);
        let b = canonical_completion_proof_bytes(&proof);
        assert_eq!(a, b);
    }
}

//! TEE-sealed proof construction: request-intake commitments and
//! delivery-completion commitments, both bound by HMAC-SHA256 over a
//! master key that is never written to disk or formatted in debug output.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::hasher::{put_amount, put_list, put_str, put_u64, sha256};
use crate::store::TargetAddress;

type HmacSha256 = Hmac<Sha256>;

/// TEE commitment to a request's parameters, returned to the user at
/// intake so they can later dispute non-delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestProof {
    pub request_id: String,
    pub request_hash: [u8; 32],
    pub tee_signature: Vec<u8>,
    pub deadline: u64,
}

/// TEE commitment to the set of delivery transactions for a completed
/// request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionProof {
    pub request_id: String,
    pub request_hash: [u8; 32],
    pub outputs_hash: [u8; 32],
    pub output_tx_ids: Vec<String>,
    pub completed_at: u64,
    pub tee_signature: Vec<u8>,
}

/// The fields that go into a request hash, gathered here so the Lifecycle
/// Manager doesn't have to know the encoding order.
pub struct RequestHashInput<'a> {
    pub user_id: &'a str,
    pub token_type: &'a str,
    pub total_amount: u128,
    pub targets: &'a [TargetAddress],
    pub initial_splits: u32,
    pub mixing_duration_ms: u64,
    pub deadline: u64,
    pub created_at: u64,
}

/// Canonical encoding of the request-intake fields, independent of map or
/// struct field iteration order.
pub fn canonical_request_bytes(input: &RequestHashInput) -> Vec<u8> {
    let mut buf = Vec::new();
    put_str(&mut buf, input.user_id);
    put_str(&mut buf, input.token_type);
    put_amount(&mut buf, input.total_amount);
    put_list(&mut buf, input.targets, |b, t| {
        put_str(b, &t.address);
        put_amount(b, t.amount);
    });
    put_u64(&mut buf, input.initial_splits as u64);
    put_u64(&mut buf, input.mixing_duration_ms);
    put_u64(&mut buf, input.deadline);
    put_u64(&mut buf, input.created_at);
    buf
}

pub fn request_hash(input: &RequestHashInput) -> [u8; 32] {
    sha256(&canonical_request_bytes(input))
}

/// Canonical encoding of `(target_address, delivered_amount, tx_id)` for
/// every target, in target order.
pub fn canonical_outputs_bytes(targets: &[TargetAddress], tx_ids: &[String]) -> Vec<u8> {
    let mut buf = Vec::new();
    let count = targets.len().min(tx_ids.len());
    put_list(&mut buf, &(0..count).collect::<Vec<_>>(), |b, &i| {
        put_str(b, &targets[i].address);
        put_amount(b, targets[i].amount);
        put_str(b, &tx_ids[i]);
    });
    buf
}

pub fn outputs_hash(targets: &[TargetAddress], tx_ids: &[String]) -> [u8; 32] {
    sha256(&canonical_outputs_bytes(targets, tx_ids))
}

/// Signs canonical hashes with the enclave-injected master key. The key is
/// held in memory only: no `Debug` impl exposes it, and it is never
/// serialized.
pub struct ProofSigner {
    master_key: Vec<u8>,
}

#[derive(Debug)]
pub struct SignerError(pub String);

impl std::fmt::Display for SignerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proof signer error: {}", self.0)
    }
}

impl std::error::Error for SignerError {}

impl ProofSigner {
    pub fn new(master_key: Vec<u8>) -> Self {
        Self { master_key }
    }

    fn mac(&self) -> Result<HmacSha256, SignerError> {
        HmacSha256::new_from_slice(&self.master_key)
            .map_err(|e| SignerError(format!("invalid key length: {e}")))
    }

    /// `tee_signature = HMAC-SHA256(master_key, request_hash)`.
    pub fn sign_request(&self, request_hash: &[u8; 32]) -> Result<Vec<u8>, SignerError> {
        let mut mac = self.mac()?;
        mac.update(request_hash);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// `tee_signature = HMAC-SHA256(master_key, request_hash ∥ outputs_hash ∥ completed_at_be)`.
    pub fn sign_completion(
        &self,
        request_hash: &[u8; 32],
        outputs_hash: &[u8; 32],
        completed_at: u64,
    ) -> Result<Vec<u8>, SignerError> {
        let mut mac = self.mac()?;
        mac.update(request_hash);
        mac.update(outputs_hash);
        mac.update(&completed_at.to_be_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Constant-time verification via the `hmac` crate's own comparison,
    /// used when re-checking a stored signature (e.g. before a dispute
    /// submission) rather than trusting the stored bytes blindly.
    pub fn verify_request(
        &self,
        request_hash: &[u8; 32],
        signature: &[u8],
    ) -> Result<bool, SignerError> {
        let mut mac = self.mac()?;
        mac.update(request_hash);
        Ok(mac.verify_slice(signature).is_ok())
    }
}

impl std::fmt::Debug for ProofSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofSigner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_hash_is_deterministic() {
        let targets = vec![TargetAddress {
            address: "NA".into(),
            amount: 100,
        }];
        let input = RequestHashInput {
            user_id: "u1",
            token_type: "GAS",
            total_amount: 200,
            targets: &targets,
            initial_splits: 2,
            mixing_duration_ms: 1000,
            deadline: 999,
            created_at: 1,
        };
        let h1 = request_hash(&input);
        let h2 = request_hash(&input);
        assert_eq!(h1, h2);
    }

    #[test]
    fn signature_is_32_bytes_and_verifiable() {
        let signer = ProofSigner::new(b"test-master-key-0123456789abcdef".to_vec());
        let hash = [7u8; 32];
        let sig = signer.sign_request(&hash).unwrap();
        assert_eq!(sig.len(), 32);
        assert!(signer.verify_request(&hash, &sig).unwrap());

        let other_hash = [8u8; 32];
        assert!(!signer.verify_request(&other_hash, &sig).unwrap());
    }

    #[test]
    fn completion_signature_binds_all_three_fields() {
        let signer = ProofSigner::new(b"another-master-key-fedcba9876543".to_vec());
        let req_hash = [1u8; 32];
        let out_hash = [2u8; 32];
        let sig_a = signer.sign_completion(&req_hash, &out_hash, 1000).unwrap();
        let sig_b = signer.sign_completion(&req_hash, &out_hash, 1001).unwrap();
        assert_ne!(sig_a, sig_b);
    }

    #[test]
    fn outputs_hash_covers_address_amount_and_tx_id() {
        let targets = vec![
            TargetAddress {
                address: "A".into(),
                amount: 10,
            },
            TargetAddress {
                address: "B".into(),
                amount: 20,
            },
        ];
        let tx_ids = vec!["tx1".to_string(), "tx2".to_string()];
        let h1 = outputs_hash(&targets, &tx_ids);
        let tx_ids_swapped = vec!["tx2".to_string(), "tx1".to_string()];
        let h2 = outputs_hash(&targets, &tx_ids_swapped);
        assert_ne!(h1, h2);
    }
}

//! Mix-request domain model and the repository that persists it.
//!
//! Mirrors the shape of a batch-record store: a small set of entities,
//! a narrow trait per concern, an in-memory `DashMap` implementation used
//! by default, and an optional Redis-backed implementation behind the
//! `redis` feature.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::proof::{CompletionProof, RequestProof};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MixRequestStatus {
    Pending,
    Deposited,
    Mixing,
    Delivered,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetAddress {
    pub address: String,
    pub amount: u128,
}

/// A single completed delivery, recorded for the completion proof and for
/// restart checkpointing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub target_index: usize,
    pub tx_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixRequest {
    pub id: String,
    pub user_id: String,
    pub token_type: String,
    pub total_amount: u128,
    pub service_fee: u128,
    pub net_amount: u128,
    pub targets: Vec<TargetAddress>,
    pub initial_splits: u32,
    pub mixing_duration_ms: u64,
    pub deposit_address: String,
    pub deposit_account_id: String,
    pub deadline: u64,
    pub status: MixRequestStatus,
    pub request_hash: [u8; 32],
    pub tee_signature: Vec<u8>,
    pub completion_proof: Option<CompletionProof>,
    pub pool_account_ids: Vec<String>,
    pub deliveries: Vec<DeliveryRecord>,
    pub dispute_tx_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: u64,
}

impl MixRequest {
    /// Reconstructs the `RequestProof` handed to the user at intake.
    pub fn request_proof(&self) -> RequestProof {
        RequestProof {
            request_id: self.id.clone(),
            request_hash: self.request_hash,
            tee_signature: self.tee_signature.clone(),
            deadline: self.deadline,
        }
    }
}

/// Fields that may change on a partial update, so callers never have to
/// re-supply the rest of the record.
#[derive(Default)]
pub struct StatusUpdate {
    pub completion_proof: Option<CompletionProof>,
    pub dispute_tx_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub pool_account_ids: Option<Vec<String>>,
}

#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "mix request not found: {id}"),
            StoreError::Backend(msg) => write!(f, "store backend error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

// ---------------------------------------------------------------------------
// Trait definitions
// ---------------------------------------------------------------------------

pub trait RequestStore: Send + Sync + 'static {
    fn create(
        &self,
        request: &MixRequest,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn get(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<MixRequest>, StoreError>> + Send;

    fn list_by_user(
        &self,
        user_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<MixRequest>, StoreError>> + Send;

    fn list_by_status(
        &self,
        status: MixRequestStatus,
    ) -> impl std::future::Future<Output = Result<Vec<MixRequest>, StoreError>> + Send;

    fn update_status(
        &self,
        id: &str,
        status: MixRequestStatus,
        extra: StatusUpdate,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn append_delivery(
        &self,
        id: &str,
        delivery: DeliveryRecord,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Terminal records older than this are evicted from memory; their durable
/// copy is assumed to live in the external persistence layer (spec §6).
const TERMINAL_RETENTION_SECS: u64 = 86_400;

pub struct InMemoryRequestStore {
    requests: DashMap<String, MixRequest>,
    eviction_counter: AtomicU64,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self {
            requests: DashMap::new(),
            eviction_counter: AtomicU64::new(0),
        }
    }

    /// Spawns a background task that periodically evicts old terminal
    /// records, mirroring the store's own retention policy.
    pub fn spawn_eviction_task(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                store.evict_expired();
            }
        });
    }

    fn evict_expired(&self) {
        let now = now_epoch();
        let before = self.requests.len();
        self.requests.retain(|_, rec| {
            !matches!(
                rec.status,
                MixRequestStatus::Delivered | MixRequestStatus::Failed | MixRequestStatus::Refunded
            ) || now.saturating_sub(rec.created_at) < TERMINAL_RETENTION_SECS
        });
        let evicted = before - self.requests.len();
        if evicted > 0 {
            debug!(evicted, "request store eviction complete");
        }
        self.eviction_counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for InMemoryRequestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestStore for InMemoryRequestStore {
    async fn create(&self, request: &MixRequest) -> Result<(), StoreError> {
        self.requests.insert(request.id.clone(), request.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<MixRequest>, StoreError> {
        Ok(self.requests.get(id).map(|r| r.value().clone()))
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<MixRequest>, StoreError> {
        Ok(self
            .requests
            .iter()
            .filter(|e| e.value().user_id == user_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn list_by_status(&self, status: MixRequestStatus) -> Result<Vec<MixRequest>, StoreError> {
        Ok(self
            .requests
            .iter()
            .filter(|e| e.value().status == status)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn update_status(
        &self,
        id: &str,
        status: MixRequestStatus,
        extra: StatusUpdate,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .requests
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.into()))?;
        let rec = entry.value_mut();
        rec.status = status;
        if let Some(v) = extra.completion_proof {
            rec.completion_proof = Some(v);
        }
        if let Some(v) = extra.dispute_tx_hash {
            rec.dispute_tx_hash = Some(v);
        }
        if let Some(v) = extra.failure_reason {
            rec.failure_reason = Some(v);
        }
        if let Some(v) = extra.pool_account_ids {
            rec.pool_account_ids = v;
        }
        Ok(())
    }

    async fn append_delivery(&self, id: &str, delivery: DeliveryRecord) -> Result<(), StoreError> {
        let mut entry = self
            .requests
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.into()))?;
        entry.value_mut().deliveries.push(delivery);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Redis implementation (feature-gated)
// ---------------------------------------------------------------------------

#[cfg(feature = "redis")]
pub struct RedisRequestStore {
    client: redis::Client,
}

#[cfg(feature = "redis")]
impl RedisRequestStore {
    pub fn new(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

#[cfg(feature = "redis")]
impl RequestStore for RedisRequestStore {
    async fn create(&self, request: &MixRequest) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(request).map_err(|e| StoreError::Backend(e.to_string()))?;
        let _: () = redis::cmd("SET")
            .arg(format!("mixreq:{}", request.id))
            .arg(&json)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let _: () = redis::cmd("SADD")
            .arg(format!("mixreq:by_user:{}", request.user_id))
            .arg(&request.id)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<MixRequest>, StoreError> {
        let mut conn = self.conn().await?;
        let val: Option<String> = redis::cmd("GET")
            .arg(format!("mixreq:{id}"))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        match val {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).map_err(|e| StoreError::Backend(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<MixRequest>, StoreError> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(format!("mixreq:by_user:{user_id}"))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut out = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(rec) = self.get(id).await? {
                out.push(rec);
            }
        }
        Ok(out)
    }

    async fn list_by_status(&self, status: MixRequestStatus) -> Result<Vec<MixRequest>, StoreError> {
        // No secondary index by status in the Redis backend; this scans all
        // known request keys instead. Acceptable for the modest request
        // volumes this service handles; a higher-throughput deployment would
        // add a status-keyed set maintained alongside `update_status`.
        let mut conn = self.conn().await?;
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg("mixreq:*")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut out = Vec::new();
        for key in keys {
            if key.starts_with("mixreq:by_user:") {
                continue;
            }
            let id = key.trim_start_matches("mixreq:");
            if let Some(rec) = self.get(id).await? {
                if rec.status == status {
                    out.push(rec);
                }
            }
        }
        Ok(out)
    }

    async fn update_status(
        &self,
        id: &str,
        status: MixRequestStatus,
        extra: StatusUpdate,
    ) -> Result<(), StoreError> {
        let mut rec = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.into()))?;
        rec.status = status;
        if let Some(v) = extra.completion_proof {
            rec.completion_proof = Some(v);
        }
        if let Some(v) = extra.dispute_tx_hash {
            rec.dispute_tx_hash = Some(v);
        }
        if let Some(v) = extra.failure_reason {
            rec.failure_reason = Some(v);
        }
        if let Some(v) = extra.pool_account_ids {
            rec.pool_account_ids = v;
        }
        self.create(&rec).await
    }

    async fn append_delivery(&self, id: &str, delivery: DeliveryRecord) -> Result<(), StoreError> {
        let mut rec = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.into()))?;
        rec.deliveries.push(delivery);
        self.create(&rec).await
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Builds the in-memory store. Trait objects would require boxing every
/// async method, so the rest of the crate takes the concrete type instead;
/// a deployment that enables the `redis` feature builds `RedisRequestStore`
/// directly rather than through this factory.
pub fn build_store() -> Arc<InMemoryRequestStore> {
    Arc::new(InMemoryRequestStore::new())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> MixRequest {
        MixRequest {
            id: id.to_string(),
            user_id: "user-1".into(),
            token_type: "GAS".into(),
            total_amount: 1_000_000,
            service_fee: 5_000,
            net_amount: 995_000,
            targets: vec![TargetAddress {
                address: "NXYZ".into(),
                amount: 995_000,
            }],
            initial_splits: 3,
            mixing_duration_ms: 1_800_000,
            deposit_address: "NDEP".into(),
            deposit_account_id: "acct-1".into(),
            deadline: now_epoch() + 3600,
            status: MixRequestStatus::Pending,
            request_hash: [0u8; 32],
            tee_signature: vec![1, 2, 3],
            completion_proof: None,
            pool_account_ids: vec!["acct-1".into()],
            deliveries: vec![],
            dispute_tx_hash: None,
            failure_reason: None,
            created_at: now_epoch(),
        }
    }

    #[tokio::test]
    async fn lifecycle_through_store() {
        let store = InMemoryRequestStore::new();
        let req = sample("req-1");
        store.create(&req).await.unwrap();

        let fetched = store.get("req-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, MixRequestStatus::Pending);

        store
            .update_status(
                "req-1",
                MixRequestStatus::Deposited,
                StatusUpdate::default(),
            )
            .await
            .unwrap();
        let fetched = store.get("req-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, MixRequestStatus::Deposited);

        store
            .append_delivery(
                "req-1",
                DeliveryRecord {
                    target_index: 0,
                    tx_id: "0xabc".into(),
                },
            )
            .await
            .unwrap();
        let fetched = store.get("req-1").await.unwrap().unwrap();
        assert_eq!(fetched.deliveries.len(), 1);
    }

    #[tokio::test]
    async fn list_by_status_filters() {
        let store = InMemoryRequestStore::new();
        store.create(&sample("req-1")).await.unwrap();
        let mut req2 = sample("req-2");
        req2.status = MixRequestStatus::Delivered;
        store.create(&req2).await.unwrap();

        let pending = store.list_by_status(MixRequestStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "req-1");
    }

    #[tokio::test]
    async fn list_by_user_filters() {
        let store = InMemoryRequestStore::new();
        store.create(&sample("req-1")).await.unwrap();
        let mut other = sample("req-2");
        other.user_id = "user-2".into();
        store.create(&other).await.unwrap();

        let mine = store.list_by_user("user-1").await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, "req-1");
    }

    #[tokio::test]
    async fn update_unknown_request_errors() {
        let store = InMemoryRequestStore::new();
        let err = store
            .update_status("missing", MixRequestStatus::Failed, StatusUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::config::MixerConfig;
use crate::dispute::{DisputeOutcome, DisputeResolver};
use crate::error::AppError;
use crate::lifecycle::{AcceptInput, LifecycleManager};
use crate::ratelimit::RateLimiter;
use crate::store::{InMemoryRequestStore, MixRequestStatus, RequestStore, TargetAddress};

pub struct AppState {
    pub lifecycle: Arc<LifecycleManager<InMemoryRequestStore>>,
    pub dispute: Arc<DisputeResolver<InMemoryRequestStore>>,
    pub store: Arc<InMemoryRequestStore>,
    pub config: Arc<MixerConfig>,
    pub rate_limiter: Arc<RateLimiter>,
}

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "mixer-service",
    }))
}

/// Identifies the caller for per-user rate limiting and request ownership.
/// The identity provider itself is an external collaborator; this only
/// reads the header it is expected to set.
fn require_user(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(AppError::Unauthorized)
}

fn check_rate(state: &AppState, user_id: &str) -> Result<(), AppError> {
    if state
        .rate_limiter
        .check(user_id, state.config.rate_limit_per_min, 60)
    {
        Ok(())
    } else {
        Err(AppError::RateLimited)
    }
}

#[derive(Debug, Deserialize)]
pub struct TargetAddressBody {
    pub address: String,
    pub amount: u128,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequestBody {
    pub token_type: String,
    pub total_amount: u128,
    pub targets: Vec<TargetAddressBody>,
    pub initial_splits: Option<u32>,
    pub mixing_duration_secs: Option<u64>,
}

pub async fn create_request(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateRequestBody>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = require_user(&headers)?;
    check_rate(&state, &user_id)?;

    let targets: Vec<TargetAddress> = body
        .targets
        .into_iter()
        .map(|t| TargetAddress {
            address: t.address,
            amount: t.amount,
        })
        .collect();

    let result = state
        .lifecycle
        .accept(AcceptInput {
            user_id,
            token_type: body.token_type,
            total_amount: body.total_amount,
            targets,
            initial_splits: body.initial_splits,
            mixing_duration_secs: body.mixing_duration_secs,
        })
        .await?;

    Ok(Json(json!({
        "request_id": result.request_id,
        "deposit_address": result.deposit_address,
        "request_proof": {
            "request_hash": hex::encode(result.request_proof.request_hash),
            "tee_signature": hex::encode(&result.request_proof.tee_signature),
            "deadline": result.request_proof.deadline,
        },
    })))
}

pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let request = state
        .store
        .get(&id)
        .await
        .map_err(|e| AppError::StoreError(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("unknown request: {id}")))?;

    Ok(Json(json!({
        "request_id": request.id,
        "status": request.status,
        "failure_reason": request.failure_reason,
    })))
}

pub async fn get_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let request = state
        .store
        .get(&id)
        .await
        .map_err(|e| AppError::StoreError(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("unknown request: {id}")))?;

    Ok(Json(json!({
        "request_id": request.id,
        "user_id": request.user_id,
        "token_type": request.token_type,
        "total_amount": request.total_amount,
        "service_fee": request.service_fee,
        "net_amount": request.net_amount,
        "targets": request.targets,
        "status": request.status,
        "deposit_address": request.deposit_address,
        "deadline": request.deadline,
        "created_at": request.created_at,
        "failure_reason": request.failure_reason,
        "dispute_tx_hash": request.dispute_tx_hash,
    })))
}

pub async fn confirm_deposit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Arc::clone(&state.lifecycle).confirm_deposit(&id).await?;
    Ok(Json(json!({ "status": "accepted" })))
}

pub async fn resume_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Arc::clone(&state.lifecycle).resume_request(&id).await?;
    Ok(Json(json!({ "status": "accepted" })))
}

pub async fn dispute_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.dispute.handle_dispute(&id).await?;
    let body = match outcome {
        DisputeOutcome::ResolvedOffChain => json!({ "outcome": "resolved_off_chain" }),
        DisputeOutcome::SubmittedOnChain { tx_hash } => {
            json!({ "outcome": "submitted_on_chain", "tx_hash": tx_hash })
        }
    };
    Ok(Json(body))
}

pub async fn get_proof(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let request = state
        .store
        .get(&id)
        .await
        .map_err(|e| AppError::StoreError(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("unknown request: {id}")))?;

    let request_proof = request.request_proof();
    Ok(Json(json!({
        "request_proof": {
            "request_hash": hex::encode(request_proof.request_hash),
            "tee_signature": hex::encode(&request_proof.tee_signature),
            "deadline": request_proof.deadline,
        },
        "completion_proof": request.completion_proof.map(|p| json!({
            "request_hash": hex::encode(p.request_hash),
            "outputs_hash": hex::encode(p.outputs_hash),
            "output_tx_ids": p.output_tx_ids,
            "completed_at": p.completed_at,
            "tee_signature": hex::encode(&p.tee_signature),
        })),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListRequestsQuery {
    pub status: Option<MixRequestStatus>,
}

pub async fn list_requests(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListRequestsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = require_user(&headers)?;
    let mut requests = state
        .store
        .list_by_user(&user_id)
        .await
        .map_err(|e| AppError::StoreError(e.to_string()))?;

    if let Some(status) = query.status {
        requests.retain(|r| r.status == status);
    }

    let summaries: Vec<_> = requests
        .into_iter()
        .map(|r| {
            json!({
                "request_id": r.id,
                "status": r.status,
                "total_amount": r.total_amount,
                "created_at": r.created_at,
            })
        })
        .collect();

    Ok(Json(json!({ "requests": summaries })))
}

mod accounts_client;
mod config;
mod dispute;
mod error;
mod fee_collector;
mod hasher;
mod lifecycle;
mod mixing_engine;
mod pool_scheduler;
mod proof;
mod ratelimit;
mod routes;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderValue};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::accounts_client::AccountsClient;
use crate::config::MixerConfig;
use crate::dispute::{DisputeResolver, OnChainFulfiller};
use crate::fee_collector::FeeCollector;
use crate::lifecycle::LifecycleManager;
use crate::proof::ProofSigner;
use crate::ratelimit::RateLimiter;
use crate::routes::AppState;
use crate::store::build_store;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mixer_service=info,tower_http=info".into()),
        )
        .init();

    let config = match MixerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[mixer-service] configuration error: {e}");
            std::process::exit(1);
        }
    };

    if config.allowed_origins.is_empty() {
        if cfg!(debug_assertions) {
            warn!("MIXER_ALLOWED_ORIGINS not set — using permissive CORS (dev mode only)");
        } else {
            eprintln!("[mixer-service] FATAL: MIXER_ALLOWED_ORIGINS must be set in production builds");
            std::process::exit(1);
        }
    }

    let master_key = match load_master_key() {
        Ok(k) => k,
        Err(e) => {
            eprintln!("[mixer-service] {e}");
            std::process::exit(1);
        }
    };

    info!(
        host = %config.host,
        port = config.port,
        strict_identity = config.strict_identity,
        redis = config.redis_url.is_some(),
        origins = config.allowed_origins.len(),
        tokens = config.tokens.len(),
        "starting mixer-service"
    );

    let http_client = match build_http_client(&config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[mixer-service] FATAL: failed to build accounts HTTP client: {e}");
            std::process::exit(1);
        }
    };

    let config = Arc::new(config);
    let store = build_store();
    store.spawn_eviction_task();

    let accounts = Arc::new(AccountsClient::new(
        http_client.clone(),
        config.accounts_base_url.clone(),
        config.service_id.clone(),
    ));
    let signer = Arc::new(ProofSigner::new(master_key));
    let fee_collector = Arc::new(FeeCollector::new(
        AccountsClient::new(
            http_client.clone(),
            config.accounts_base_url.clone(),
            config.service_id.clone(),
        ),
        config.fee_address.clone(),
        config.clone(),
    ));
    let fulfiller = OnChainFulfiller::new(http_client.clone(), config.fulfiller_base_url.clone());
    let dispute = Arc::new(DisputeResolver::new(
        store.clone(),
        fulfiller,
        signer.clone(),
        config.dispute_grace_period_secs,
    ));

    let lifecycle = Arc::new(LifecycleManager::new(
        store.clone(),
        accounts,
        signer,
        fee_collector,
        config.clone(),
    ));

    Arc::clone(&lifecycle).resume_in_flight().await;
    Arc::clone(&lifecycle).spawn_expire_pending_sweep();

    let cors = if config.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                header::CONTENT_TYPE,
                "x-user-id".parse().unwrap(),
            ])
    };

    let state = Arc::new(AppState {
        lifecycle,
        dispute,
        store,
        config: config.clone(),
        rate_limiter: Arc::new(RateLimiter::new()),
    });

    let app = Router::new()
        .route("/health", axum::routing::get(routes::health))
        .route("/request", axum::routing::post(routes::create_request))
        .route("/status/{id}", axum::routing::get(routes::get_status))
        .route("/request/{id}", axum::routing::get(routes::get_request))
        .route(
            "/request/{id}/deposit",
            axum::routing::post(routes::confirm_deposit),
        )
        .route(
            "/request/{id}/resume",
            axum::routing::post(routes::resume_request),
        )
        .route(
            "/request/{id}/dispute",
            axum::routing::post(routes::dispute_request),
        )
        .route("/request/{id}/proof", axum::routing::get(routes::get_proof))
        .route("/requests", axum::routing::get(routes::list_requests))
        .layer(RequestBodyLimitLayer::new(64 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            "Referrer-Policy".parse::<header::HeaderName>().unwrap(),
            HeaderValue::from_static("no-referrer"),
        ))
        .with_state(state.clone());

    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port)
        .parse()
        .expect("invalid listen address");

    info!(addr = %addr, "mixer-service listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    info!("mixer-service shut down");
}

/// Loads the TEE-sealed master key used to sign request and completion
/// proofs. In a real deployment this is injected by the enclave runtime;
/// here it is read from an environment variable set by that runtime.
fn load_master_key() -> Result<Vec<u8>, String> {
    let hex_key = std::env::var("MIXER_TEE_MASTER_KEY")
        .map_err(|_| "MIXER_TEE_MASTER_KEY must be set (hex-encoded enclave master key)".to_string())?;
    let key = hex::decode(hex_key.trim())
        .map_err(|e| format!("MIXER_TEE_MASTER_KEY is not valid hex: {e}"))?;
    if key.len() < 16 {
        return Err("MIXER_TEE_MASTER_KEY must be at least 16 bytes".into());
    }
    Ok(key)
}

/// Builds the HTTP client used for every outbound call (Accounts service,
/// on-chain fulfiller). In strict identity mode, the client presents an
/// mTLS certificate and refuses to start without one.
fn build_http_client(config: &MixerConfig) -> Result<reqwest::Client, String> {
    let mut builder = reqwest::Client::builder().timeout(std::time::Duration::from_secs(30));
    if config.strict_identity {
        let cert_path = config
            .mtls_cert_path
            .as_ref()
            .expect("validated present by MixerConfig::from_env");
        let key_path = config
            .mtls_key_path
            .as_ref()
            .expect("validated present by MixerConfig::from_env");
        let mut pem = std::fs::read(cert_path).map_err(|e| format!("reading {cert_path}: {e}"))?;
        let mut key_pem = std::fs::read(key_path).map_err(|e| format!("reading {key_path}: {e}"))?;
        pem.append(&mut key_pem);
        let identity = reqwest::Identity::from_pem(&pem).map_err(|e| format!("invalid mTLS identity: {e}"))?;
        builder = builder.identity(identity);
    }
    builder.build().map_err(|e| e.to_string())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

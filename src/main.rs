//! Upto facilitator HTTP entrypoint.
//!
//! Launches an Axum-based HTTP server exposing the upto protocol interface
//! for payment verification and settlement on an EVM network.
//!
//! Endpoints:
//! - `GET /` – Health probe
//! - `GET /verify` – Verification request schema
//! - `POST /verify` – Verify a payment payload against requirements
//! - `GET /settle` – Settlement request schema
//! - `POST /settle` – Settle an accepted payment payload on-chain
//! - `GET /supported` – Supported scheme/network and signer address
//! - `GET /stats` – Aggregate audit statistics
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `FACILITATOR_PRIVATE_KEY`, `RPC_URL`, `NETWORK` configure chain access
//! - `HOST`, `PORT` control the binding address
//! - `AUDIT_DB_PATH` locates the SQLite audit database
//! - `OTEL_*` variables enable tracing export

use axum::http::Method;
use axum::routing::get;
use axum::{Extension, Router};
use dotenvy::dotenv;
use opentelemetry::trace::Status;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;
use tower_http::trace::TraceLayer;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use upto_rs::audit::AuditStore;
use upto_rs::chain::eip155::Eip155Provider;
use upto_rs::config::Config;
use upto_rs::facilitator_local::FacilitatorLocal;
use upto_rs::handlers;
use upto_rs::telemetry::Telemetry;

type AppFacilitator = FacilitatorLocal<Eip155Provider>;

/// Initializes the upto facilitator server.
///
/// Loads `.env`, installs telemetry, opens the audit database, connects the
/// chain provider, and serves the protocol endpoints. Exits with a nonzero
/// status when any of the startup steps fail; a facilitator without its chain
/// or its audit store must not accept traffic.
#[tokio::main]
async fn main() {
    dotenv().ok();

    let _telemetry = Telemetry::new();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    let audit = match AuditStore::open(&config.audit_db_path) {
        Ok(audit) => Arc::new(audit),
        Err(e) => {
            tracing::error!("Failed to open audit store at {}: {e}", config.audit_db_path);
            std::process::exit(1);
        }
    };

    let provider =
        match Eip155Provider::try_new(&config.private_key, config.rpc_url.clone(), config.network) {
            Ok(provider) => provider,
            Err(e) => {
                tracing::error!("Failed to create chain provider: {e}");
                std::process::exit(1);
            }
        };
    tracing::info!(
        "Settling on {} via {} as {}",
        config.network,
        config.rpc_url,
        upto_rs::chain::ChainOps::signer_address(&provider),
    );

    let facilitator = FacilitatorLocal::new(provider, audit.clone(), config.network.chain_id());

    let app = Router::new()
        .route("/", get(handlers::health))
        .route(
            "/verify",
            get(handlers::get_verify_info).post(handlers::post_verify::<AppFacilitator>),
        )
        .route(
            "/settle",
            get(handlers::get_settle_info).post(handlers::post_settle::<AppFacilitator>),
        )
        .route("/supported", get(handlers::get_supported::<AppFacilitator>))
        .route("/stats", get(handlers::get_stats))
        .layer(Extension(facilitator))
        .layer(Extension(audit))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        otel.kind = "server",
                        otel.name = %format!("{} {}", request.method(), request.uri()),
                        method = %request.method(),
                        uri = %request.uri(),
                        version = ?request.version(),
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record("status", tracing::field::display(response.status()));
                        span.record(
                            "http.status_code",
                            tracing::field::display(response.status().as_u16()),
                        );
                        if response.status().is_success() {
                            span.set_status(Status::Ok);
                        } else {
                            span.set_status(Status::error(
                                response
                                    .status()
                                    .canonical_reason()
                                    .unwrap_or("unknown")
                                    .to_string(),
                            ));
                        }
                        tracing::info!(
                            "status={} elapsed={}ms",
                            response.status().as_u16(),
                            latency.as_millis()
                        );
                    },
                ),
        )
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let ip = match config.host.parse::<std::net::IpAddr>() {
        Ok(ip) => ip,
        Err(e) => {
            tracing::error!("Invalid HOST {}: {e}", config.host);
            std::process::exit(1);
        }
    };
    let addr = SocketAddr::from((ip, config.port));
    tracing::info!("Starting facilitator at http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {e}", addr);
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {e}");
    }
}

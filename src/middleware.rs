//! Tower middleware enforcing upto payments on protected axum routes.
//!
//! The layer is the sequencer that makes the protocol observable as an HTTP
//! exchange. Per gated request: advertise (402 when unpaid), verify with the
//! facilitator, run the downstream handler, meter the produced response,
//! settle the metered amount, and attach the settlement headers. The order is
//! load-bearing: verification strictly precedes the handler, metering strictly
//! follows it, and settlement is best-effort. A settlement failure is logged
//! and the handler's committed response goes out untouched, so client latency
//! is never coupled to block time.
//!
//! ## Example
//!
//! ```rust,ignore
//! use upto_rs::middleware::{UptoMiddleware, usdc_price_tag};
//!
//! let upto = UptoMiddleware::try_new("http://localhost:4402")?;
//! let price = usdc_price_tag(&"eip155:84532".parse()?, pay_to, "$1.00")?;
//!
//! let app = Router::new().route(
//!     "/chat",
//!     post(chat_handler).layer(
//!         upto.with_price_tag(price)
//!             .with_description("LLM completion".into())
//!             .with_meter(|usage| async move { per_token_cost(&usage) }),
//!     ),
//! );
//! ```

use axum::body::{Body, Bytes, to_bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};

use crate::facilitator::Facilitator;
use crate::facilitator_client::{FacilitatorClient, FacilitatorClientError};
use crate::networks::{Network, UnknownNetworkError};
use crate::chain::ChainId;
use crate::types::{
    DEFAULT_MAX_TIMEOUT_SECONDS, ErrorResponse, EvmAddress, PaymentRequiredResponse,
    PaymentRequirements, SettleRequest, SettlementHeader, TokenAmount, UptoPayload, UptoScheme,
    VerificationReason, VerifyRequest, VerifyResponse,
};
use crate::util::{MoneyAmountError, parse_usdc_amount};

/// Request header carrying the base64-encoded payment payload.
pub const PAYMENT_HEADER: &str = "X-Payment";
/// Accepted alias for [`PAYMENT_HEADER`], input only.
pub const PAYMENT_HEADER_ALIAS: &str = "Payment-Signature";

/// Response header: base64 of the [`SettlementHeader`] JSON.
pub const PAYMENT_RESPONSE_HEADER: &str = "X-Payment-Response";
/// Response header: settled amount in decimal smallest units.
pub const PAYMENT_SETTLED_HEADER: &str = "X-Payment-Settled";
/// Response header: 0x-prefixed settlement transaction hash, empty when no
/// transaction was needed.
pub const PAYMENT_TX_HASH_HEADER: &str = "X-Payment-TxHash";

/// Error constructing a route's price tag.
#[derive(Debug, thiserror::Error)]
pub enum PriceTagError {
    #[error(transparent)]
    UnknownNetwork(#[from] UnknownNetworkError),
    #[error(transparent)]
    Price(#[from] MoneyAmountError),
}

/// Builds the payment requirements for a route priced in USD against the
/// network's default USDC deployment.
///
/// Fails at route setup for unknown networks or unparseable prices, so
/// misconfiguration never reaches request time.
pub fn usdc_price_tag(
    network: &ChainId,
    pay_to: EvmAddress,
    price: &str,
) -> Result<PaymentRequirements, PriceTagError> {
    let known = Network::try_from(network)?;
    let usdc = known.usdc();
    let max_amount = parse_usdc_amount(price, usdc.decimals)?;
    Ok(PaymentRequirements {
        scheme: UptoScheme,
        network: network.clone(),
        asset: usdc.address,
        max_amount,
        pay_to,
        max_timeout_seconds: DEFAULT_MAX_TIMEOUT_SECONDS,
    })
}

/// Everything a meter may inspect about a completed request/response pair.
///
/// The response body is handed over as buffered bytes; the middleware rebuilds
/// the response from the same buffer afterwards, so metering is always
/// non-destructive.
pub struct MeterContext {
    pub method: Method,
    pub uri: Uri,
    pub request_headers: HeaderMap,
    pub status: StatusCode,
    pub response_headers: HeaderMap,
    pub body: Bytes,
    /// The ceiling the payer signed.
    pub authorized_amount: TokenAmount,
    /// The verified payer.
    pub payer: EvmAddress,
}

type BoxMeterFuture = Pin<Box<dyn Future<Output = TokenAmount> + Send>>;
type MeterFn = dyn Fn(MeterContext) -> BoxMeterFuture + Send + Sync;

/// The entry point for gating routes on upto payments.
///
/// Create one instance per application and derive per-route layers from it
/// with [`UptoMiddleware::with_price_tag`].
#[derive(Clone)]
pub struct UptoMiddleware<F> {
    facilitator: F,
}

impl UptoMiddleware<Arc<FacilitatorClient>> {
    /// Creates a middleware instance talking to a remote facilitator.
    pub fn try_new(url: &str) -> Result<Self, FacilitatorClientError> {
        let facilitator = FacilitatorClient::try_from(url)?;
        Ok(Self {
            facilitator: Arc::new(facilitator),
        })
    }
}

impl<F> UptoMiddleware<F>
where
    F: Clone,
{
    /// Creates a middleware instance over any [`Facilitator`] implementation,
    /// e.g. an in-process one.
    pub fn with_facilitator(facilitator: F) -> Self {
        Self { facilitator }
    }

    /// Starts a layer builder for a route priced by `requirements`.
    pub fn with_price_tag(&self, requirements: PaymentRequirements) -> UptoLayerBuilder<F> {
        UptoLayerBuilder {
            facilitator: self.facilitator.clone(),
            requirements: Arc::new(requirements),
            description: None,
            mime_type: None,
            meter: default_meter(),
        }
    }
}

fn default_meter() -> Arc<MeterFn> {
    // Unmetered routes consume the full ceiling
    Arc::new(|usage: MeterContext| {
        let amount = usage.authorized_amount;
        Box::pin(async move { amount })
    })
}

/// Per-route configuration for the payment gate.
#[derive(Clone)]
pub struct UptoLayerBuilder<F> {
    facilitator: F,
    requirements: Arc<PaymentRequirements>,
    description: Option<String>,
    mime_type: Option<String>,
    meter: Arc<MeterFn>,
}

impl<F> UptoLayerBuilder<F> {
    /// Sets a description of what the payment grants access to, included in
    /// 402 responses.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the MIME type of the protected resource, included in 402
    /// responses.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Sets the route's meter: a callback computing the smallest-unit
    /// consumption of a completed request. Without one, the route settles the
    /// full authorized ceiling.
    pub fn with_meter<M, Fut>(mut self, meter: M) -> Self
    where
        M: Fn(MeterContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TokenAmount> + Send + 'static,
    {
        self.meter = Arc::new(move |usage| Box::pin(meter(usage)));
        self
    }
}

impl<S, F> Layer<S> for UptoLayerBuilder<F>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    F: Facilitator + Clone + Send + Sync + 'static,
{
    type Service = UptoGateService<F>;

    fn layer(&self, inner: S) -> Self::Service {
        UptoGateService {
            facilitator: self.facilitator.clone(),
            requirements: self.requirements.clone(),
            description: self.description.clone(),
            mime_type: self.mime_type.clone(),
            meter: self.meter.clone(),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

/// The service wrapping a gated route.
#[derive(Clone)]
pub struct UptoGateService<F> {
    facilitator: F,
    requirements: Arc<PaymentRequirements>,
    description: Option<String>,
    mime_type: Option<String>,
    meter: Arc<MeterFn>,
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl<F> Service<Request> for UptoGateService<F>
where
    F: Facilitator + Clone + Send + Sync + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let gate = self.clone();
        Box::pin(async move { Ok(gate.handle_request(req).await) })
    }
}

impl<F> UptoGateService<F>
where
    F: Facilitator + Clone + Send + Sync + 'static,
{
    async fn handle_request(mut self, req: Request) -> Response {
        // 1. Advertise: no payment header means 402 with the requirements.
        let header = req
            .headers()
            .get(PAYMENT_HEADER)
            .or_else(|| req.headers().get(PAYMENT_HEADER_ALIAS));
        let Some(header) = header else {
            return self.payment_required("Payment Required", None);
        };

        // 2. Decode the payload.
        let payload = match UptoPayload::from_header(header.as_bytes()) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(error = %e, "undecodable payment header");
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ErrorResponse {
                        error: "Invalid payment payload".to_string(),
                    }),
                )
                    .into_response();
            }
        };

        // 3. Verify before any handler work runs.
        let verify_request = VerifyRequest {
            payload: payload.clone(),
            requirements: (*self.requirements).clone(),
        };
        let verify_response = match self.facilitator.verify(&verify_request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "facilitator verify unreachable");
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(ErrorResponse {
                        error: "Facilitator unavailable".to_string(),
                    }),
                )
                    .into_response();
            }
        };
        let payer = match verify_response {
            VerifyResponse::Valid { payer } => payer,
            VerifyResponse::Invalid { reason } => {
                // An absent Permit2 approval is client configuration the payer
                // can fix without re-authorizing, hence 412 over 402.
                let status = if reason == VerificationReason::AllowanceRequired {
                    StatusCode::PRECONDITION_FAILED
                } else {
                    StatusCode::PAYMENT_REQUIRED
                };
                return self.verification_failed(status, reason);
            }
        };

        // 4. Run the handler; keep request metadata for the meter.
        let method = req.method().clone();
        let uri = req.uri().clone();
        let request_headers = req.headers().clone();
        let response = match self.inner.call(req).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        // 5. Buffer the body so the meter can read it non-destructively.
        let (mut parts, body) = response.into_parts();
        let body_bytes = match to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "failed to buffer response body for metering");
                Bytes::new()
            }
        };

        // 6. Meter the consumption and write it into the payload.
        let authorized_amount = payload.permit_2_authorization.permitted.amount;
        let metered = (self.meter)(MeterContext {
            method,
            uri,
            request_headers,
            status: parts.status,
            response_headers: parts.headers.clone(),
            body: body_bytes.clone(),
            authorized_amount,
            payer,
        })
        .await;

        let mut settle_payload = payload;
        settle_payload.settlement_amount = Some(metered);
        let settle_request = SettleRequest {
            payload: settle_payload,
            requirements: (*self.requirements).clone(),
        };

        // 7. Settle. The response is already committed; settlement outcome
        // only decides whether the settlement headers appear.
        match self.facilitator.settle(&settle_request).await {
            Ok(settlement) if settlement.success => {
                apply_settlement_headers(&mut parts.headers, &settlement, authorized_amount);
            }
            Ok(settlement) => {
                tracing::warn!(
                    error = settlement.error.as_deref().unwrap_or("unknown"),
                    payer = %payer,
                    "settlement failed after response was produced"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, payer = %payer, "settle call failed");
            }
        }

        Response::from_parts(parts, Body::from(body_bytes))
    }

    fn accepts(&self) -> Vec<PaymentRequirements> {
        vec![(*self.requirements).clone()]
    }

    fn payment_required(&self, error: &str, reason: Option<VerificationReason>) -> Response {
        (
            StatusCode::PAYMENT_REQUIRED,
            Json(PaymentRequiredResponse {
                error: error.to_string(),
                accepts: self.accepts(),
                reason,
                description: self.description.clone(),
                mime_type: self.mime_type.clone(),
            }),
        )
            .into_response()
    }

    fn verification_failed(&self, status: StatusCode, reason: VerificationReason) -> Response {
        (
            status,
            Json(PaymentRequiredResponse {
                error: "Payment verification failed".to_string(),
                accepts: self.accepts(),
                reason: Some(reason),
                description: self.description.clone(),
                mime_type: self.mime_type.clone(),
            }),
        )
            .into_response()
    }
}

fn apply_settlement_headers(
    headers: &mut HeaderMap,
    settlement: &crate::types::SettleResponse,
    authorized_amount: TokenAmount,
) {
    let settled_amount = settlement.settled_amount.unwrap_or(TokenAmount::ZERO);
    let tx_hash = settlement
        .tx_hash
        .map(|hash| hash.to_string())
        .unwrap_or_default();

    let response_header = SettlementHeader {
        success: true,
        tx_hash: tx_hash.clone(),
        settled_amount,
        authorized_amount,
    };
    match response_header.to_header() {
        Ok(encoded) => match HeaderValue::from_str(&encoded) {
            Ok(value) => {
                headers.insert(PAYMENT_RESPONSE_HEADER, value);
            }
            Err(e) => tracing::error!(error = %e, "settlement header not header-safe"),
        },
        Err(e) => tracing::error!(error = %e, "settlement header serialization failed"),
    }
    if let Ok(value) = HeaderValue::from_str(&settled_amount.to_string()) {
        headers.insert(PAYMENT_SETTLED_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&tx_hash) {
        headers.insert(PAYMENT_TX_HASH_HEADER, value);
    }
}

//! Rust implementation of the **upto** payment scheme for HTTP-native
//! micropayments.
//!
//! Under upto, a payer signs a *ceiling* authorization (a Permit2 witness
//! transfer), the resource server meters actual consumption after servicing
//! the request, and the facilitator settles only the consumed amount on-chain.
//! The upto proxy contract enforces `settled <= authorized`, so the signed
//! ceiling is a cap, never the price.
//!
//! # Roles
//!
//! The crate covers all three parties of the protocol:
//!
//! - **Facilitator**: a server that verifies and settles payments on-chain.
//!   See [`facilitator`] for the trait and [`facilitator_local`] for the
//!   implementation behind the shipped binary.
//!
//! - **Resource server**: a payment-gated service. See [`middleware`] for the
//!   tower layer that advertises prices over HTTP 402, verifies payments,
//!   meters responses, and settles the metered amount.
//!
//! - **Payer/client**: see [`scheme::upto::client`] for building and signing
//!   authorization payloads from a 402 response.
//!
//! # Modules
//!
//! - [`audit`] — SQLite audit trail of authorizations and their disposition.
//! - [`chain`] — contract constants, ABI bindings, EIP-712 message
//!   construction, and the chain capability trait.
//! - [`config`] — facilitator configuration from environment variables.
//! - [`facilitator`] — the [`Facilitator`](facilitator::Facilitator) trait.
//! - [`facilitator_client`] — remote facilitator access over HTTP.
//! - [`facilitator_local`] — verification and settlement against a chain
//!   provider plus audit recording.
//! - [`handlers`] — HTTP endpoint handlers for the facilitator server.
//! - [`middleware`] — axum/tower payment gate with metering.
//! - [`networks`] — known networks and USDC deployments.
//! - [`scheme`] — the upto verifier, settler, and client builder.
//! - [`telemetry`] — tracing and OpenTelemetry bootstrap.
//! - [`types`] — wire types shared by all parties.

pub mod audit;
pub mod chain;
pub mod config;
pub mod facilitator;
pub mod facilitator_client;
pub mod facilitator_local;
pub mod handlers;
pub mod middleware;
pub mod networks;
pub mod scheme;
pub mod telemetry;
pub mod timestamp;
pub mod types;
pub mod util;

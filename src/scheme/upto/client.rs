//! Client-side payload construction for upto payments.
//!
//! Given the requirements from a 402 response and a signing capability, builds
//! a fully populated [`UptoPayload`] with the settlement amount unset. Also
//! provides the one-time ERC-20 approval transaction a payer needs before
//! Permit2 can move their tokens.

use alloy::primitives::{B256, Bytes, U256};
use alloy::signers::Signer;
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;

use crate::chain::{
    EIP155_NAMESPACE, IERC20, PERMIT2_ADDRESS, UPTO_PROXY_ADDRESS, permit_witness_signing_hash,
};
use crate::timestamp::UnixTimestamp;
use crate::types::{
    EvmAddress, Nonce, PaymentRequirements, Permit2Authorization, Permit2Witness, TokenPermissions,
    UptoPayload,
};

/// Clock-skew buffer subtracted from `now` for the witness `validAfter`.
const VALID_AFTER_SKEW_SECONDS: u64 = 60;

/// Client nonces carry 48 bits of randomness; the chain enforces uniqueness.
const NONCE_BITS: u32 = 48;

/// Signing failure reported by a [`ClientSigner`].
#[derive(Debug, thiserror::Error)]
#[error("signing failed: {0}")]
pub struct ClientSignerError(pub String);

/// The payer-side capability set: an address and typed-data signing.
#[async_trait]
pub trait ClientSigner: Send + Sync {
    /// The payer address the authorization will be issued from.
    fn address(&self) -> EvmAddress;

    /// Signs an EIP-712 digest, returning the 65-byte signature.
    async fn sign_digest(&self, digest: B256) -> Result<Bytes, ClientSignerError>;
}

/// A [`ClientSigner`] backed by any Alloy [`Signer`], e.g. a
/// `PrivateKeySigner`.
#[derive(Clone)]
pub struct PayerWallet {
    signer: Arc<dyn Signer + Send + Sync>,
}

impl PayerWallet {
    pub fn new(signer: impl Signer + Send + Sync + 'static) -> Self {
        Self {
            signer: Arc::new(signer),
        }
    }
}

impl<S> From<S> for PayerWallet
where
    S: Signer + Send + Sync + 'static,
{
    fn from(signer: S) -> Self {
        Self::new(signer)
    }
}

#[async_trait]
impl ClientSigner for PayerWallet {
    fn address(&self) -> EvmAddress {
        EvmAddress(self.signer.address())
    }

    async fn sign_digest(&self, digest: B256) -> Result<Bytes, ClientSignerError> {
        let signature = self
            .signer
            .sign_hash(&digest)
            .await
            .map_err(|e| ClientSignerError(format!("{e}")))?;
        Ok(Bytes::from(signature.as_bytes().to_vec()))
    }
}

/// Errors raised while building a payment payload.
#[derive(Debug, thiserror::Error)]
pub enum PaymentBuildError {
    #[error("unsupported network format: {0}")]
    UnsupportedNetwork(String),
    #[error(transparent)]
    Signing(#[from] ClientSignerError),
}

/// Builds and signs an upto authorization for the given requirements.
///
/// The authorization ceiling equals `requirements.max_amount`, the deadline is
/// `now + max_timeout_seconds`, and `validAfter` sits 60 seconds in the past
/// to absorb clock skew between payer and verifier. `settlement_amount` is
/// left unset; the resource server writes it after metering.
pub async fn build_payment_payload<S: ClientSigner + ?Sized>(
    signer: &S,
    requirements: &PaymentRequirements,
) -> Result<UptoPayload, PaymentBuildError> {
    let network = &requirements.network;
    if network.namespace != EIP155_NAMESPACE {
        return Err(PaymentBuildError::UnsupportedNetwork(network.to_string()));
    }
    let chain_reference = network
        .eip155_reference()
        .map_err(|_| PaymentBuildError::UnsupportedNetwork(network.to_string()))?;

    let now = UnixTimestamp::now();
    let deadline = now + requirements.max_timeout_seconds;
    let valid_after = now.saturating_sub(VALID_AFTER_SKEW_SECONDS);
    let nonce: u64 = rand::rng().random_range(0..(1u64 << NONCE_BITS));

    let authorization = Permit2Authorization {
        from: signer.address(),
        permitted: TokenPermissions {
            token: requirements.asset,
            amount: requirements.max_amount,
        },
        spender: EvmAddress(UPTO_PROXY_ADDRESS),
        nonce: Nonce::from(nonce),
        deadline,
        witness: Permit2Witness {
            to: requirements.pay_to,
            valid_after,
            extra: Bytes::new(),
        },
    };

    let digest = permit_witness_signing_hash(chain_reference, &authorization);
    let signature = signer.sign_digest(digest).await?;

    Ok(UptoPayload {
        signature,
        permit_2_authorization: authorization,
        settlement_amount: None,
    })
}

/// A raw transaction request: target contract and calldata.
#[derive(Debug, Clone)]
pub struct ApprovalTransaction {
    pub to: EvmAddress,
    pub data: Bytes,
}

/// Builds the one-time `approve(Permit2, 2^160 - 1)` call for `token`.
///
/// Permit2 treats any allowance at or above `2^160 - 1` as unlimited, so this
/// is done once per token per payer.
pub fn build_approval_transaction(token: EvmAddress) -> ApprovalTransaction {
    let unlimited = (U256::from(1u8) << 160) - U256::from(1u8);
    let call = IERC20::approveCall {
        spender: PERMIT2_ADDRESS,
        value: unlimited,
    };
    ApprovalTransaction {
        to: token,
        data: Bytes::from(call.abi_encode()),
    }
}

//! Type definitions for the upto payment protocol.
//!
//! The key objects are [`UptoPayload`], [`PaymentRequirements`],
//! [`VerifyResponse`], and [`SettleResponse`], which encode payment intent,
//! authorization, and the result of verification/settlement.
//!
//! Integer-valued fields (amounts, nonces, timestamps) travel as decimal
//! strings in JSON and live as arbitrary-precision integers in memory. The
//! conversion happens exactly once, at the serde boundary; anything past that
//! compares `U256` values, so hex-casing or formatting of the inputs can never
//! affect protocol decisions.

use alloy::hex;
use alloy::primitives::{Address, B256, Bytes, U256};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::{Debug, Display};
use std::str::FromStr;

use crate::chain::ChainId;
use crate::timestamp::UnixTimestamp;

/// Default upper bound a resource server grants for authorization deadlines.
pub const DEFAULT_MAX_TIMEOUT_SECONDS: u64 = 300;

/// Marker for the `"upto"` scheme discriminator field.
///
/// A facilitator hosting several schemes dispatches on this field before the
/// payload reaches this crate; here it only guards against mis-routed
/// requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UptoScheme;

impl UptoScheme {
    pub const NAME: &'static str = "upto";
}

impl Display for UptoScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Self::NAME)
    }
}

impl Serialize for UptoScheme {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(Self::NAME)
    }
}

impl<'de> Deserialize<'de> for UptoScheme {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == Self::NAME {
            Ok(UptoScheme)
        } else {
            Err(serde::de::Error::custom(format!(
                "unsupported scheme {s:?}, expected \"upto\""
            )))
        }
    }
}

/// Represents an EVM address.
///
/// Wrapper around [`alloy::primitives::Address`] providing display and
/// serialization support. Serializes as an EIP-55 checksummed hex string;
/// accepts any casing on input. Equality is over the parsed 20 bytes, so two
/// casings of the same address always compare equal.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub struct EvmAddress(pub Address);

impl Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_checksum(None))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to decode EVM address")]
pub struct EvmAddressDecodingError;

impl FromStr for EvmAddress {
    type Err = EvmAddressDecodingError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Address::from_str(s).map_err(|_| EvmAddressDecodingError)?;
        Ok(Self(address))
    }
}

impl From<Address> for EvmAddress {
    fn from(address: Address) -> Self {
        EvmAddress(address)
    }
}

impl From<EvmAddress> for Address {
    fn from(address: EvmAddress) -> Self {
        address.0
    }
}

impl PartialEq<Address> for EvmAddress {
    fn eq(&self, other: &Address) -> bool {
        self.0 == *other
    }
}

impl Serialize for EvmAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_checksum(None))
    }
}

impl<'de> Deserialize<'de> for EvmAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A precise on-chain token amount in smallest units (e.g., USDC with 6 decimals).
///
/// Represented as a stringified decimal integer in JSON to prevent precision
/// loss; unbounded nonnegative (`U256`) in memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenAmount(pub U256);

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(U256::ZERO);

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid decimal token amount")]
pub struct TokenAmountParseError;

impl FromStr for TokenAmount {
    type Err = TokenAmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = U256::from_str_radix(s, 10).map_err(|_| TokenAmountParseError)?;
        Ok(TokenAmount(value))
    }
}

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        TokenAmount(U256::from(value))
    }
}

impl From<TokenAmount> for U256 {
    fn from(value: TokenAmount) -> Self {
        value.0
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A Permit2 signature-transfer nonce.
///
/// Clients draw 48 bits of randomness; the Permit2 contract enforces
/// uniqueness over the full 256-bit space. Decimal string on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Nonce(pub U256);

impl Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Nonce {
    fn from(value: u64) -> Self {
        Nonce(U256::from(value))
    }
}

impl Serialize for Nonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Nonce {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let value =
            U256::from_str_radix(&s, 10).map_err(|_| serde::de::Error::custom("invalid nonce"))?;
        Ok(Nonce(value))
    }
}

/// A 32-byte EVM transaction hash, encoded as 0x-prefixed hex string.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionHash(pub B256);

impl Display for TransactionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// The `(token, amount)` pair a Permit2 authorization permits to move.
/// `amount` is the ceiling; settlement may move any amount up to it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPermissions {
    pub token: EvmAddress,
    pub amount: TokenAmount,
}

/// Witness data bound into the Permit2 signature.
///
/// `to` pins the authorization to one recipient, `valid_after` is the earliest
/// usable time, and `extra` is opaque bytes reserved for scheme extensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permit2Witness {
    pub to: EvmAddress,
    pub valid_after: UnixTimestamp,
    pub extra: Bytes,
}

/// The EIP-712 message the payer signs: who may move which token up to which
/// ceiling, through which spender, until when, and for whom.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permit2Authorization {
    pub from: EvmAddress,
    pub permitted: TokenPermissions,
    pub spender: EvmAddress,
    pub nonce: Nonce,
    pub deadline: UnixTimestamp,
    pub witness: Permit2Witness,
}

/// Full payload transmitted in the `X-Payment` header (base64 of JSON).
///
/// `settlement_amount` is absent on the wire; the resource middleware writes
/// it after metering, before invoking settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UptoPayload {
    pub signature: Bytes,
    pub permit_2_authorization: Permit2Authorization,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement_amount: Option<TokenAmount>,
}

/// Error decoding a payment header that could not be read back into its JSON
/// form.
///
/// Raised by a payment-gated endpoint when the client-supplied `X-Payment`
/// value is garbage, and by clients on a corrupt `X-Payment-Response`.
#[derive(Debug, thiserror::Error)]
pub enum PaymentHeaderError {
    /// The header bytes were not valid base64.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    /// The decoded JSON did not match the expected structure.
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl UptoPayload {
    /// Reads a payload out of an `X-Payment` (or `Payment-Signature`) header
    /// value: standard base64 over the payload's JSON form.
    pub fn from_header(header: &[u8]) -> Result<Self, PaymentHeaderError> {
        let json = B64.decode(header)?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Renders the payload into an `X-Payment` header value.
    pub fn to_header(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(B64.encode(json))
    }
}

/// Requirements advertised by the payment-gated endpoint in the 402 body.
///
/// `max_amount` is the server-side ceiling in smallest units; the payer must
/// authorize at least this much, and settlement can never exceed what was
/// authorized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: UptoScheme,
    pub network: ChainId,
    pub asset: EvmAddress,
    pub max_amount: TokenAmount,
    pub pay_to: EvmAddress,
    #[serde(default = "default_max_timeout_seconds")]
    pub max_timeout_seconds: u64,
}

fn default_max_timeout_seconds() -> u64 {
    DEFAULT_MAX_TIMEOUT_SECONDS
}

/// Wrapper for a payment payload and requirements sent to the facilitator's
/// `/verify` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub payload: UptoPayload,
    pub requirements: PaymentRequirements,
}

/// Wrapper for a payment payload and requirements sent to the facilitator's
/// `/settle` endpoint. Identical shape to [`VerifyRequest`].
pub type SettleRequest = VerifyRequest;

/// Why a payment payload failed verification.
///
/// The serialized tags are the wire-level error taxonomy clients remediate
/// against: `permit2_allowance_required` means "approve Permit2 and retry",
/// most others mean "request a fresh 402 and re-authorize".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum VerificationReason {
    #[error("invalid_spender")]
    #[serde(rename = "invalid_spender")]
    InvalidSpender,
    #[error("invalid_recipient")]
    #[serde(rename = "invalid_recipient")]
    InvalidRecipient,
    #[error("permit2_deadline_expired")]
    #[serde(rename = "permit2_deadline_expired")]
    DeadlineExpired,
    #[error("permit2_not_yet_valid")]
    #[serde(rename = "permit2_not_yet_valid")]
    NotYetValid,
    #[error("insufficient_authorized_amount")]
    #[serde(rename = "insufficient_authorized_amount")]
    InsufficientAuthorizedAmount,
    #[error("invalid_permit2_signature")]
    #[serde(rename = "invalid_permit2_signature")]
    InvalidSignature,
    #[error("signature_verification_failed")]
    #[serde(rename = "signature_verification_failed")]
    SignatureVerificationFailed,
    #[error("permit2_allowance_required")]
    #[serde(rename = "permit2_allowance_required")]
    AllowanceRequired,
    #[error("allowance_check_failed")]
    #[serde(rename = "allowance_check_failed")]
    AllowanceCheckFailed,
    #[error("insufficient_balance")]
    #[serde(rename = "insufficient_balance")]
    InsufficientBalance,
    #[error("balance_check_failed")]
    #[serde(rename = "balance_check_failed")]
    BalanceCheckFailed,
}

/// Result returned by a facilitator after verifying an [`UptoPayload`] against
/// [`PaymentRequirements`].
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyResponse {
    /// The payload matches the requirements and passes all checks.
    Valid { payer: EvmAddress },
    /// The payload was well-formed but failed one of the ordered checks.
    Invalid { reason: VerificationReason },
}

impl VerifyResponse {
    pub fn valid(payer: EvmAddress) -> Self {
        VerifyResponse::Valid { payer }
    }

    pub fn invalid(reason: VerificationReason) -> Self {
        VerifyResponse::Invalid { reason }
    }
}

impl Serialize for VerifyResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut s = serializer.serialize_struct("VerifyResponse", 2)?;
        match self {
            VerifyResponse::Valid { payer } => {
                s.serialize_field("isValid", &true)?;
                s.serialize_field("payer", payer)?;
            }
            VerifyResponse::Invalid { reason } => {
                s.serialize_field("isValid", &false)?;
                s.serialize_field("invalidReason", reason)?;
            }
        }
        s.end()
    }
}

impl<'de> Deserialize<'de> for VerifyResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            is_valid: bool,
            #[serde(default)]
            payer: Option<EvmAddress>,
            #[serde(default)]
            invalid_reason: Option<VerificationReason>,
        }

        let raw = Raw::deserialize(deserializer)?;
        match (raw.is_valid, raw.payer, raw.invalid_reason) {
            (true, Some(payer), None) => Ok(VerifyResponse::Valid { payer }),
            (false, _, Some(reason)) => Ok(VerifyResponse::Invalid { reason }),
            (true, None, _) => Err(serde::de::Error::custom(
                "`payer` must be present when `isValid` is true",
            )),
            (true, _, Some(_)) => Err(serde::de::Error::custom(
                "`invalidReason` must be absent when `isValid` is true",
            )),
            (false, _, None) => Err(serde::de::Error::custom(
                "`invalidReason` must be present when `isValid` is false",
            )),
        }
    }
}

/// Returned from a facilitator after attempting to settle a payment on-chain.
///
/// `settled_amount` is the clamped, metered amount that actually moved (or
/// `"0"` for elided no-op settlements). `error` carries a verification tag,
/// `settlement_exceeds_authorization`, `transaction_reverted`, or a
/// signer-supplied message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<TransactionHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_amount: Option<TokenAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SettleResponse {
    pub fn failure<E: Display>(error: E) -> Self {
        SettleResponse {
            success: false,
            tx_hash: None,
            settled_amount: None,
            error: Some(error.to_string()),
        }
    }
}

/// Body of a 402 response: what the endpoint costs and how to pay.
///
/// Doubles as the verification-failure body, in which case `reason` names the
/// failed check and the client is expected to remediate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredResponse {
    pub error: String,
    pub accepts: Vec<PaymentRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<VerificationReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Contents of the `X-Payment-Response` header (base64 of JSON), set by the
/// middleware after successful settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementHeader {
    pub success: bool,
    /// 0x-prefixed hash, or empty when settlement needed no transaction.
    pub tx_hash: String,
    pub settled_amount: TokenAmount,
    pub authorized_amount: TokenAmount,
}

impl SettlementHeader {
    /// Renders the settlement result into an `X-Payment-Response` header
    /// value: standard base64 over the JSON form.
    pub fn to_header(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(B64.encode(json))
    }

    /// Reads a settlement result out of an `X-Payment-Response` header value.
    pub fn from_header(header: &[u8]) -> Result<Self, PaymentHeaderError> {
        let json = B64.decode(header)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// Response of `GET /supported`: schemes and networks this facilitator serves,
/// plus the settlement signer address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedResponse {
    pub schemes: Vec<String>,
    pub networks: Vec<ChainId>,
    pub facilitator: EvmAddress,
}

/// A simple error structure returned on unexpected or fatal server errors.
/// Used when no structured protocol-level response is appropriate.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
}

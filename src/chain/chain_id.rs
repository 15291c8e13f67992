//! CAIP-2 chain identifier type.
//!
//! Networks are addressed by a [CAIP-2](https://standards.chainagnostic.org/CAIPs/caip-2)
//! identifier of the form `namespace:reference`, e.g. `eip155:8453` for Base
//! mainnet. The upto scheme only settles on EVM chains, so every accepted chain
//! id uses the `eip155` namespace, but the type itself stays format-agnostic:
//! requirements received over the wire may name any network, and rejection
//! happens at lookup time rather than parse time.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt;
use std::str::FromStr;

/// The CAIP-2 namespace for EVM-compatible chains.
pub const EIP155_NAMESPACE: &str = "eip155";

/// A CAIP-2 compliant blockchain identifier.
///
/// # Serialization
///
/// Serializes to/from a colon-separated string: `"eip155:8453"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainId {
    /// The blockchain namespace (e.g., `eip155` for EVM chains).
    pub namespace: String,
    /// The chain-specific reference (e.g., `8453` for Base).
    pub reference: String,
}

impl ChainId {
    pub fn new<N: Into<String>, R: Into<String>>(namespace: N, reference: R) -> Self {
        Self {
            namespace: namespace.into(),
            reference: reference.into(),
        }
    }

    /// Creates an `eip155` chain id from a numeric chain reference.
    pub fn eip155(reference: u64) -> Self {
        Self::new(EIP155_NAMESPACE, reference.to_string())
    }

    /// Returns the numeric chain reference for `eip155` chain ids.
    ///
    /// Fails for non-EVM namespaces and non-numeric references; this is the
    /// gate every EVM-specific operation (EIP-712 domains, providers) goes
    /// through.
    pub fn eip155_reference(&self) -> Result<u64, ChainIdFormatError> {
        if self.namespace != EIP155_NAMESPACE {
            return Err(ChainIdFormatError(self.to_string()));
        }
        self.reference
            .parse::<u64>()
            .map_err(|_| ChainIdFormatError(self.to_string()))
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.reference)
    }
}

/// Error returned when parsing an invalid chain id string.
///
/// A valid chain id must be in the format `namespace:reference` where both
/// components are non-empty strings.
#[derive(Debug, thiserror::Error)]
#[error("Invalid chain id format {0}")]
pub struct ChainIdFormatError(String);

impl FromStr for ChainId {
    type Err = ChainIdFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, reference) = s.split_once(':').ok_or(ChainIdFormatError(s.into()))?;
        if namespace.is_empty() || reference.is_empty() {
            return Err(ChainIdFormatError(s.into()));
        }
        Ok(ChainId {
            namespace: namespace.into(),
            reference: reference.into(),
        })
    }
}

impl Serialize for ChainId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChainId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ChainId::from_str(&s).map_err(de::Error::custom)
    }
}

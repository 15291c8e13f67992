//! Network definitions and known token deployments.
//!
//! This module defines the networks the facilitator can settle on,
//! and provides statically known USDC deployments per network.

use alloy::primitives::address;
use once_cell::sync::Lazy;
use std::fmt::{Display, Formatter};

use crate::chain::ChainId;
use crate::types::EvmAddress;

/// Networks with a known USDC deployment.
///
/// Used to resolve a route's default asset and to configure the facilitator's
/// chain provider. Chain ids outside this set still parse as [`ChainId`], but
/// cannot be used without an explicit asset.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// Base mainnet (chain ID 8453).
    Base,
    /// Base Sepolia testnet (chain ID 84532).
    BaseSepolia,
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.chain_id())
    }
}

impl Network {
    /// Return the numeric chain reference associated with the network.
    pub fn chain_reference(&self) -> u64 {
        match self {
            Network::Base => 8453,
            Network::BaseSepolia => 84532,
        }
    }

    /// Return the CAIP-2 chain id associated with the network.
    pub fn chain_id(&self) -> ChainId {
        ChainId::eip155(self.chain_reference())
    }

    /// Return all known [`Network`] variants.
    pub fn variants() -> &'static [Network] {
        &[Network::Base, Network::BaseSepolia]
    }

    /// Return the known USDC deployment for this network.
    pub fn usdc(&self) -> &'static UsdcDeployment {
        match self {
            Network::Base => &USDC_BASE,
            Network::BaseSepolia => &USDC_BASE_SEPOLIA,
        }
    }
}

/// Error returned when a chain id does not name a known network.
#[derive(Debug, thiserror::Error)]
#[error("Unknown network {0}")]
pub struct UnknownNetworkError(pub ChainId);

impl TryFrom<&ChainId> for Network {
    type Error = UnknownNetworkError;

    fn try_from(value: &ChainId) -> Result<Self, Self::Error> {
        let reference = value
            .eip155_reference()
            .map_err(|_| UnknownNetworkError(value.clone()))?;
        match reference {
            8453 => Ok(Network::Base),
            84532 => Ok(Network::BaseSepolia),
            _ => Err(UnknownNetworkError(value.clone())),
        }
    }
}

/// A known USDC deployment: token contract address and decimal precision.
#[derive(Clone, Debug)]
pub struct UsdcDeployment {
    pub address: EvmAddress,
    pub decimals: u32,
}

/// Lazily initialized known USDC deployment on Base mainnet.
static USDC_BASE: Lazy<UsdcDeployment> = Lazy::new(|| UsdcDeployment {
    address: EvmAddress(address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913")),
    decimals: 6,
});

/// Lazily initialized known USDC deployment on Base Sepolia.
static USDC_BASE_SEPOLIA: Lazy<UsdcDeployment> = Lazy::new(|| UsdcDeployment {
    address: EvmAddress(address!("0x036CbD53842c5426634e7929541eC2318f3dCF7e")),
    decimals: 6,
});

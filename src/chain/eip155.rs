//! Alloy-backed [`ChainOps`] implementation for EIP-155 chains.
//!
//! Wraps a JSON-RPC provider with signing capabilities, constructed from the
//! facilitator's private key and RPC endpoint.

use alloy::network::EthereumWallet;
use alloy::primitives::U256;
use alloy::providers::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
};
use alloy::providers::{Identity, ProviderBuilder, RootProvider};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use tracing::instrument;
use url::Url;

use crate::chain::{
    ChainError, ChainOps, IERC20, IUptoPermit2Proxy, PermitTransferFrom, SettleOutcome,
    TokenPermissions, UPTO_PROXY_ADDRESS, UptoSettleCall, x402Witness,
};
use crate::networks::Network;
use crate::types::{EvmAddress, TransactionHash};

/// The fully composed Ethereum provider type used in this project.
///
/// Combines the filler layers for gas, nonce, chain ID, blob gas, and wallet
/// signing, and wraps a [`RootProvider`] for actual JSON-RPC communication.
pub type InnerProvider = FillProvider<
    JoinFill<
        JoinFill<
            Identity,
            JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
        >,
        WalletFiller<EthereumWallet>,
    >,
    RootProvider,
>;

/// Error constructing an [`Eip155Provider`].
#[derive(Debug, thiserror::Error)]
pub enum Eip155ProviderError {
    #[error("Invalid facilitator private key: {0}")]
    InvalidPrivateKey(String),
}

/// A signing JSON-RPC provider bound to one EIP-155 network.
#[derive(Clone)]
pub struct Eip155Provider {
    inner: InnerProvider,
    signer_address: EvmAddress,
    network: Network,
}

impl Eip155Provider {
    /// Connects a signing provider for `network` at `rpc_url`.
    ///
    /// `private_key` is the facilitator's 0x-prefixed settlement key.
    pub fn try_new(
        private_key: &str,
        rpc_url: Url,
        network: Network,
    ) -> Result<Self, Eip155ProviderError> {
        let signer: PrivateKeySigner = private_key
            .parse()
            .map_err(|e| Eip155ProviderError::InvalidPrivateKey(format!("{e}")))?;
        let signer_address = EvmAddress(signer.address());
        let wallet = EthereumWallet::from(signer);
        let inner = ProviderBuilder::new().wallet(wallet).connect_http(rpc_url);
        Ok(Self {
            inner,
            signer_address,
            network,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }
}

#[async_trait]
impl ChainOps for Eip155Provider {
    fn signer_address(&self) -> EvmAddress {
        self.signer_address
    }

    fn chain_reference(&self) -> u64 {
        self.network.chain_reference()
    }

    #[instrument(skip_all, err, fields(token = %token, owner = %owner))]
    async fn allowance(
        &self,
        token: EvmAddress,
        owner: EvmAddress,
        spender: EvmAddress,
    ) -> Result<U256, ChainError> {
        let contract = IERC20::new(token.into(), &self.inner);
        contract
            .allowance(owner.into(), spender.into())
            .call()
            .await
            .map_err(|e| ChainError::ContractCall(format!("{e}")))
    }

    #[instrument(skip_all, err, fields(token = %token, owner = %owner))]
    async fn balance_of(&self, token: EvmAddress, owner: EvmAddress) -> Result<U256, ChainError> {
        let contract = IERC20::new(token.into(), &self.inner);
        contract
            .balanceOf(owner.into())
            .call()
            .await
            .map_err(|e| ChainError::ContractCall(format!("{e}")))
    }

    #[instrument(skip_all, err, fields(
        owner = %call.authorization.from,
        amount = %call.amount,
        nonce = %call.authorization.nonce,
    ))]
    async fn settle(&self, call: &UptoSettleCall) -> Result<SettleOutcome, ChainError> {
        let authorization = &call.authorization;
        let proxy = IUptoPermit2Proxy::new(UPTO_PROXY_ADDRESS, &self.inner);
        let permit = PermitTransferFrom {
            permitted: TokenPermissions {
                token: authorization.permitted.token.into(),
                amount: authorization.permitted.amount.into(),
            },
            nonce: authorization.nonce.0,
            deadline: U256::from(authorization.deadline.as_secs()),
        };
        let witness = x402Witness {
            to: authorization.witness.to.into(),
            validAfter: U256::from(authorization.witness.valid_after.as_secs()),
            extra: authorization.witness.extra.clone(),
        };
        let pending = proxy
            .settle(
                permit,
                call.amount.into(),
                authorization.from.into(),
                witness,
                call.signature.clone(),
            )
            .send()
            .await
            .map_err(|e| ChainError::ContractCall(format!("{e}")))?;
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| ChainError::Transport(format!("{e}")))?;
        Ok(SettleOutcome {
            tx_hash: TransactionHash(receipt.transaction_hash),
            reverted: !receipt.status(),
        })
    }
}

//! Chain-facing types: contract constants, ABI bindings, the EIP-712 message
//! construction, and the [`ChainOps`] capability trait.
//!
//! All chain I/O the verifier and settler need is expressed through
//! [`ChainOps`]. Production wires it to an Alloy provider
//! ([`eip155::Eip155Provider`]); tests wire it to an in-memory fake. Signature
//! recovery is local computation and stays out of the trait.

pub mod chain_id;
pub mod eip155;

pub use chain_id::{ChainId, ChainIdFormatError, EIP155_NAMESPACE};

use alloy::primitives::{Address, B256, Bytes, U256, address};
use alloy::sol;
use alloy::sol_types::{SolStruct, eip712_domain};
use async_trait::async_trait;

use crate::types::{EvmAddress, Permit2Authorization, TokenAmount, TransactionHash};

/// Canonical Permit2 contract address (Uniswap Permit2).
/// Deployed at the same address on every EVM chain.
pub const PERMIT2_ADDRESS: Address = address!("0x000000000022D473030F116dDEE9F6B43aC78BA3");

/// The upto proxy contract: wraps Permit2 and accepts a separate
/// `amount <= permitted.amount` at settle time.
pub const UPTO_PROXY_ADDRESS: Address = address!("0x4020633461b2895a48930Ff97eE8fCdE8E520002");

sol! {
    /// Token and ceiling a Permit2 authorization permits to move.
    #[derive(Debug)]
    struct TokenPermissions {
        address token;
        uint256 amount;
    }

    /// The permit tuple passed to the proxy's `settle`.
    #[derive(Debug)]
    struct PermitTransferFrom {
        TokenPermissions permitted;
        uint256 nonce;
        uint256 deadline;
    }

    /// Witness bound into the Permit2 signature.
    #[allow(non_camel_case_types)]
    #[derive(Debug)]
    struct x402Witness {
        address to;
        uint256 validAfter;
        bytes extra;
    }

    /// The EIP-712 message the payer signs.
    #[derive(Debug)]
    struct PermitWitnessTransferFrom {
        TokenPermissions permitted;
        address spender;
        uint256 nonce;
        uint256 deadline;
        x402Witness witness;
    }

    #[allow(missing_docs)]
    #[sol(rpc)]
    interface IERC20 {
        function allowance(address owner, address spender) external view returns (uint256);
        function balanceOf(address account) external view returns (uint256);
        function approve(address spender, uint256 value) external returns (bool);
    }

    #[allow(missing_docs)]
    #[sol(rpc)]
    interface IUptoPermit2Proxy {
        function settle(
            PermitTransferFrom calldata permit,
            uint256 amount,
            address owner,
            x402Witness calldata witness,
            bytes calldata signature
        ) external;
    }
}

/// Computes the EIP-712 signing hash for a [`Permit2Authorization`].
///
/// Both the client builder and the verifier construct the message through this
/// single function; the domain is `{ name: "Permit2", chainId,
/// verifyingContract: PERMIT2_ADDRESS }` with no version field.
pub fn permit_witness_signing_hash(
    chain_reference: u64,
    authorization: &Permit2Authorization,
) -> B256 {
    let domain = eip712_domain! {
        name: "Permit2",
        chain_id: chain_reference,
        verifying_contract: PERMIT2_ADDRESS,
    };
    let message = PermitWitnessTransferFrom {
        permitted: TokenPermissions {
            token: authorization.permitted.token.into(),
            amount: authorization.permitted.amount.into(),
        },
        spender: authorization.spender.into(),
        nonce: authorization.nonce.0,
        deadline: U256::from(authorization.deadline.as_secs()),
        witness: x402Witness {
            to: authorization.witness.to.into(),
            validAfter: U256::from(authorization.witness.valid_after.as_secs()),
            extra: authorization.witness.extra.clone(),
        },
    };
    message.eip712_signing_hash(&domain)
}

/// Errors surfaced by chain reads and writes.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// An `eth_call` or transaction failed at the RPC or contract layer.
    #[error("contract call failed: {0}")]
    ContractCall(String),
    /// The transport to the RPC endpoint failed.
    #[error("transport error: {0}")]
    Transport(String),
}

/// All parameters of an on-chain upto settlement.
///
/// `amount` is the clamped settlement amount; the authorization and signature
/// travel unmodified from the payer's original payload.
#[derive(Debug, Clone)]
pub struct UptoSettleCall {
    pub authorization: Permit2Authorization,
    pub amount: TokenAmount,
    pub signature: Bytes,
}

/// Outcome of a mined settlement transaction.
#[derive(Debug, Clone, Copy)]
pub struct SettleOutcome {
    pub tx_hash: TransactionHash,
    pub reverted: bool,
}

/// Capability set the facilitator needs from a chain: read allowance and
/// balance, and execute the proxy settlement.
#[async_trait]
pub trait ChainOps: Send + Sync {
    /// Address of the transaction-signing account.
    fn signer_address(&self) -> EvmAddress;

    /// Numeric chain reference used in EIP-712 domains.
    fn chain_reference(&self) -> u64;

    /// `ERC20.allowance(owner, spender)` on the given token.
    async fn allowance(
        &self,
        token: EvmAddress,
        owner: EvmAddress,
        spender: EvmAddress,
    ) -> Result<U256, ChainError>;

    /// `ERC20.balanceOf(owner)` on the given token.
    async fn balance_of(&self, token: EvmAddress, owner: EvmAddress) -> Result<U256, ChainError>;

    /// Broadcasts `settle(permit, amount, owner, witness, signature)` on the
    /// upto proxy and waits for the receipt.
    async fn settle(&self, call: &UptoSettleCall) -> Result<SettleOutcome, ChainError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory [`ChainOps`] fake shared by verifier, settler, facilitator
    //! and handler tests.

    use super::*;
    use alloy::primitives::B256;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    pub(crate) struct MockChain {
        inner: Arc<Inner>,
    }

    struct Inner {
        signer: Address,
        chain_reference: u64,
        allowance: Mutex<Result<U256, String>>,
        balance: Mutex<Result<U256, String>>,
        settle_outcome: Mutex<Result<SettleOutcome, String>>,
        settle_calls: Mutex<Vec<UptoSettleCall>>,
    }

    pub(crate) const MOCK_TX_HASH: B256 = B256::repeat_byte(0xab);

    impl MockChain {
        /// A chain where the payer is fully funded and settlement succeeds.
        pub fn funded(chain_reference: u64) -> Self {
            MockChain {
                inner: Arc::new(Inner {
                    signer: address!("0xFacFacFacFacFacFacFacFacFacFacFacFacFac0"),
                    chain_reference,
                    allowance: Mutex::new(Ok(U256::MAX)),
                    balance: Mutex::new(Ok(U256::MAX)),
                    settle_outcome: Mutex::new(Ok(SettleOutcome {
                        tx_hash: TransactionHash(MOCK_TX_HASH),
                        reverted: false,
                    })),
                    settle_calls: Mutex::new(Vec::new()),
                }),
            }
        }

        pub fn set_allowance(&self, allowance: U256) {
            *self.inner.allowance.lock().unwrap() = Ok(allowance);
        }

        pub fn fail_allowance(&self, message: &str) {
            *self.inner.allowance.lock().unwrap() = Err(message.to_string());
        }

        pub fn set_balance(&self, balance: U256) {
            *self.inner.balance.lock().unwrap() = Ok(balance);
        }

        pub fn fail_balance(&self, message: &str) {
            *self.inner.balance.lock().unwrap() = Err(message.to_string());
        }

        pub fn set_settle_reverted(&self) {
            *self.inner.settle_outcome.lock().unwrap() = Ok(SettleOutcome {
                tx_hash: TransactionHash(MOCK_TX_HASH),
                reverted: true,
            });
        }

        pub fn fail_settle(&self, message: &str) {
            *self.inner.settle_outcome.lock().unwrap() = Err(message.to_string());
        }

        pub fn settle_call_count(&self) -> usize {
            self.inner.settle_calls.lock().unwrap().len()
        }

        pub fn last_settle_call(&self) -> Option<UptoSettleCall> {
            self.inner.settle_calls.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl ChainOps for MockChain {
        fn signer_address(&self) -> EvmAddress {
            EvmAddress(self.inner.signer)
        }

        fn chain_reference(&self) -> u64 {
            self.inner.chain_reference
        }

        async fn allowance(
            &self,
            _token: EvmAddress,
            _owner: EvmAddress,
            _spender: EvmAddress,
        ) -> Result<U256, ChainError> {
            self.inner
                .allowance
                .lock()
                .unwrap()
                .clone()
                .map_err(ChainError::Transport)
        }

        async fn balance_of(
            &self,
            _token: EvmAddress,
            _owner: EvmAddress,
        ) -> Result<U256, ChainError> {
            self.inner
                .balance
                .lock()
                .unwrap()
                .clone()
                .map_err(ChainError::Transport)
        }

        async fn settle(&self, call: &UptoSettleCall) -> Result<SettleOutcome, ChainError> {
            self.inner.settle_calls.lock().unwrap().push(call.clone());
            self.inner
                .settle_outcome
                .lock()
                .unwrap()
                .clone()
                .map_err(ChainError::Transport)
        }
    }
}

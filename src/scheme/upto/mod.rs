//! Verification and settlement for upto payments.
//!
//! The verifier is a total-validity predicate over (payload, requirements,
//! on-chain state): eight ordered checks where the first failure wins and
//! cheap local checks precede network I/O. The settler clamps the metered
//! amount against the signed ceiling, elides zero-amount settlements, re-runs
//! the verifier to close the verify-to-settle window, and interprets the
//! transaction receipt.
//!
//! Neither function touches the audit store; recording is the facilitator's
//! concern and never gates a payment decision.

pub mod client;

use alloy::primitives::Signature;
use tracing::instrument;

use crate::chain::{ChainOps, UPTO_PROXY_ADDRESS, UptoSettleCall, permit_witness_signing_hash};
use crate::timestamp::UnixTimestamp;
use crate::types::{
    EvmAddress, PaymentRequirements, SettleResponse, TokenAmount, UptoPayload, VerificationReason,
};

/// Settlement error tag: the middleware asked for more than was authorized.
/// A programming error on the metering side, caught before any chain call.
pub const SETTLEMENT_EXCEEDS_AUTHORIZATION: &str = "settlement_exceeds_authorization";

/// Settlement error tag: the proxy transaction mined but reverted.
pub const TRANSACTION_REVERTED: &str = "transaction_reverted";

/// Verifies an upto payment payload against requirements and chain state.
///
/// Returns the payer address on success, or the first failing check's reason.
/// Checks 1-6 are local; checks 7 (allowance) and 8 (balance) read the chain
/// through the [`ChainOps`] capability.
#[instrument(skip_all, fields(payer = %payload.permit_2_authorization.from))]
pub async fn verify_payment<C: ChainOps + ?Sized>(
    chain: &C,
    payload: &UptoPayload,
    requirements: &PaymentRequirements,
) -> Result<EvmAddress, VerificationReason> {
    let authorization = &payload.permit_2_authorization;

    // 1. Spender must be the upto proxy; Permit2 releases funds to no one else.
    if authorization.spender != UPTO_PROXY_ADDRESS {
        return Err(VerificationReason::InvalidSpender);
    }

    // 2. Witness must bind the payment to the advertised recipient.
    if authorization.witness.to != requirements.pay_to {
        return Err(VerificationReason::InvalidRecipient);
    }

    // 3./4. Time window: deadline strictly in the future, validAfter reached.
    let now = UnixTimestamp::now();
    if authorization.deadline <= now {
        return Err(VerificationReason::DeadlineExpired);
    }
    if authorization.witness.valid_after > now {
        return Err(VerificationReason::NotYetValid);
    }

    // 5. Ceiling must cover the server-side maximum.
    if authorization.permitted.amount < requirements.max_amount {
        return Err(VerificationReason::InsufficientAuthorizedAmount);
    }

    // 6. EIP-712 signature must recover to the declared payer.
    let signing_hash = permit_witness_signing_hash(chain.chain_reference(), authorization);
    let signature = Signature::try_from(payload.signature.as_ref())
        .map_err(|_| VerificationReason::SignatureVerificationFailed)?;
    let recovered = signature
        .recover_address_from_prehash(&signing_hash)
        .map_err(|_| VerificationReason::SignatureVerificationFailed)?;
    if recovered != authorization.from.0 {
        return Err(VerificationReason::InvalidSignature);
    }

    // 7. Payer must have approved Permit2 for at least the ceiling.
    let allowance = chain
        .allowance(
            authorization.permitted.token,
            authorization.from,
            EvmAddress(crate::chain::PERMIT2_ADDRESS),
        )
        .await
        .map_err(|_| VerificationReason::AllowanceCheckFailed)?;
    if allowance < authorization.permitted.amount.0 {
        return Err(VerificationReason::AllowanceRequired);
    }

    // 8. Payer must hold at least the ceiling.
    let balance = chain
        .balance_of(authorization.permitted.token, authorization.from)
        .await
        .map_err(|_| VerificationReason::BalanceCheckFailed)?;
    if balance < authorization.permitted.amount.0 {
        return Err(VerificationReason::InsufficientBalance);
    }

    Ok(authorization.from)
}

/// Settles an upto payment on-chain for the metered amount.
///
/// Falls back to the signed ceiling when the payload was never metered.
/// Never calls the chain for amounts that exceed the authorization or equal
/// zero, and re-verifies immediately before the write so balance or allowance
/// changes since the middleware's verify cannot slip through.
#[instrument(skip_all, fields(payer = %payload.permit_2_authorization.from))]
pub async fn settle_payment<C: ChainOps + ?Sized>(
    chain: &C,
    payload: &UptoPayload,
    requirements: &PaymentRequirements,
) -> SettleResponse {
    let authorized = payload.permit_2_authorization.permitted.amount;
    let amount = payload.settlement_amount.unwrap_or(authorized);

    if amount > authorized {
        tracing::error!(
            amount = %amount,
            authorized = %authorized,
            "settlement amount exceeds authorization"
        );
        return SettleResponse::failure(SETTLEMENT_EXCEEDS_AUTHORIZATION);
    }

    if amount.is_zero() {
        return SettleResponse {
            success: true,
            tx_hash: None,
            settled_amount: Some(TokenAmount::ZERO),
            error: None,
        };
    }

    if let Err(reason) = verify_payment(chain, payload, requirements).await {
        return SettleResponse::failure(reason);
    }

    let call = UptoSettleCall {
        authorization: payload.permit_2_authorization.clone(),
        amount,
        signature: payload.signature.clone(),
    };
    let outcome = match chain.settle(&call).await {
        Ok(outcome) => outcome,
        Err(e) => return SettleResponse::failure(e),
    };

    if outcome.reverted {
        tracing::warn!(tx = %outcome.tx_hash, "settle transaction reverted");
        return SettleResponse {
            success: false,
            tx_hash: Some(outcome.tx_hash),
            settled_amount: None,
            error: Some(TRANSACTION_REVERTED.to_string()),
        };
    }

    tracing::info!(tx = %outcome.tx_hash, amount = %amount, "settled");
    SettleResponse {
        success: true,
        tx_hash: Some(outcome.tx_hash),
        settled_amount: Some(amount),
        error: None,
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;
    use crate::chain::testing::{MOCK_TX_HASH, MockChain};
    use alloy::primitives::U256;
    use alloy::signers::local::PrivateKeySigner;

    fn setup() -> (PrivateKeySigner, MockChain, PaymentRequirements) {
        let signer = PrivateKeySigner::random();
        let chain = MockChain::funded(CHAIN_REFERENCE);
        let requirements = requirements(pay_to());
        (signer, chain, requirements)
    }

    #[tokio::test]
    async fn accepts_client_built_payload() {
        let (_, chain, requirements) = setup();
        let wallet = client::PayerWallet::new(PrivateKeySigner::random());
        let payload = client::build_payment_payload(&wallet, &requirements)
            .await
            .unwrap();
        let payer = verify_payment(&chain, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(payer, client::ClientSigner::address(&wallet));
    }

    #[tokio::test]
    async fn accepts_valid_payload() {
        let (signer, chain, requirements) = setup();
        let payload = signed_payload(&signer, authorization(&signer, &requirements));
        let payer = verify_payment(&chain, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(payer, EvmAddress(signer.address()));
    }

    #[tokio::test]
    async fn rejects_foreign_spender() {
        let (signer, chain, requirements) = setup();
        let mut authorization = authorization(&signer, &requirements);
        authorization.spender = "0x9999999999999999999999999999999999999999"
            .parse()
            .unwrap();
        let payload = signed_payload(&signer, authorization);
        assert_eq!(
            verify_payment(&chain, &payload, &requirements).await,
            Err(VerificationReason::InvalidSpender)
        );
    }

    #[tokio::test]
    async fn rejects_recipient_mismatch() {
        let (signer, chain, requirements) = setup();
        let mut authorization = authorization(&signer, &requirements);
        authorization.witness.to = "0x9999999999999999999999999999999999999999"
            .parse()
            .unwrap();
        let payload = signed_payload(&signer, authorization);
        assert_eq!(
            verify_payment(&chain, &payload, &requirements).await,
            Err(VerificationReason::InvalidRecipient)
        );
    }

    #[tokio::test]
    async fn rejects_expired_deadline() {
        let (signer, chain, requirements) = setup();
        let mut authorization = authorization(&signer, &requirements);
        authorization.deadline = UnixTimestamp::from_secs(1000);
        let payload = signed_payload(&signer, authorization);
        assert_eq!(
            verify_payment(&chain, &payload, &requirements).await,
            Err(VerificationReason::DeadlineExpired)
        );
    }

    #[tokio::test]
    async fn deadline_equal_to_now_is_expired() {
        let (signer, chain, requirements) = setup();
        let mut authorization = authorization(&signer, &requirements);
        authorization.deadline = UnixTimestamp::now();
        let payload = signed_payload(&signer, authorization);
        assert_eq!(
            verify_payment(&chain, &payload, &requirements).await,
            Err(VerificationReason::DeadlineExpired)
        );
    }

    #[tokio::test]
    async fn rejects_not_yet_valid() {
        let (signer, chain, requirements) = setup();
        let mut authorization = authorization(&signer, &requirements);
        authorization.witness.valid_after = UnixTimestamp::now() + 3600;
        let payload = signed_payload(&signer, authorization);
        assert_eq!(
            verify_payment(&chain, &payload, &requirements).await,
            Err(VerificationReason::NotYetValid)
        );
    }

    #[tokio::test]
    async fn valid_after_equal_to_now_passes() {
        let (signer, chain, requirements) = setup();
        let mut authorization = authorization(&signer, &requirements);
        authorization.witness.valid_after = UnixTimestamp::now();
        let payload = signed_payload(&signer, authorization);
        assert!(
            verify_payment(&chain, &payload, &requirements)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn rejects_ceiling_below_required_maximum() {
        let (signer, chain, requirements) = setup();
        let mut authorization = authorization(&signer, &requirements);
        authorization.permitted.amount = TokenAmount::from(999_999u64);
        let payload = signed_payload(&signer, authorization);
        assert_eq!(
            verify_payment(&chain, &payload, &requirements).await,
            Err(VerificationReason::InsufficientAuthorizedAmount)
        );
    }

    #[tokio::test]
    async fn ceiling_equal_to_required_maximum_passes() {
        let (signer, chain, requirements) = setup();
        let authorization = authorization(&signer, &requirements);
        assert_eq!(authorization.permitted.amount, requirements.max_amount);
        let payload = signed_payload(&signer, authorization);
        assert!(
            verify_payment(&chain, &payload, &requirements)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn rejects_tampered_authorization() {
        let (signer, chain, requirements) = setup();
        let mut payload = signed_payload(&signer, authorization(&signer, &requirements));
        // Raise the ceiling after signing; recovery now yields a different address
        payload.permit_2_authorization.permitted.amount = TokenAmount::from(2_000_000u64);
        assert_eq!(
            verify_payment(&chain, &payload, &requirements).await,
            Err(VerificationReason::InvalidSignature)
        );
    }

    #[tokio::test]
    async fn rejects_malformed_signature() {
        let (signer, chain, requirements) = setup();
        let mut payload = signed_payload(&signer, authorization(&signer, &requirements));
        payload.signature = vec![0u8; 10].into();
        assert_eq!(
            verify_payment(&chain, &payload, &requirements).await,
            Err(VerificationReason::SignatureVerificationFailed)
        );
    }

    #[tokio::test]
    async fn rejects_missing_allowance() {
        let (signer, chain, requirements) = setup();
        chain.set_allowance(U256::ZERO);
        let payload = signed_payload(&signer, authorization(&signer, &requirements));
        assert_eq!(
            verify_payment(&chain, &payload, &requirements).await,
            Err(VerificationReason::AllowanceRequired)
        );
    }

    #[tokio::test]
    async fn maps_allowance_rpc_failure() {
        let (signer, chain, requirements) = setup();
        chain.fail_allowance("connection refused");
        let payload = signed_payload(&signer, authorization(&signer, &requirements));
        assert_eq!(
            verify_payment(&chain, &payload, &requirements).await,
            Err(VerificationReason::AllowanceCheckFailed)
        );
    }

    #[tokio::test]
    async fn rejects_insufficient_balance() {
        let (signer, chain, requirements) = setup();
        chain.set_balance(U256::from(1u64));
        let payload = signed_payload(&signer, authorization(&signer, &requirements));
        assert_eq!(
            verify_payment(&chain, &payload, &requirements).await,
            Err(VerificationReason::InsufficientBalance)
        );
    }

    #[tokio::test]
    async fn maps_balance_rpc_failure() {
        let (signer, chain, requirements) = setup();
        chain.fail_balance("connection refused");
        let payload = signed_payload(&signer, authorization(&signer, &requirements));
        assert_eq!(
            verify_payment(&chain, &payload, &requirements).await,
            Err(VerificationReason::BalanceCheckFailed)
        );
    }

    #[tokio::test]
    async fn local_checks_win_over_rpc_failures() {
        let (signer, chain, requirements) = setup();
        chain.fail_allowance("down");
        chain.fail_balance("down");
        let mut authorization = authorization(&signer, &requirements);
        authorization.deadline = UnixTimestamp::from_secs(1000);
        let payload = signed_payload(&signer, authorization);
        assert_eq!(
            verify_payment(&chain, &payload, &requirements).await,
            Err(VerificationReason::DeadlineExpired)
        );
    }

    #[tokio::test]
    async fn settles_metered_amount() {
        let (signer, chain, requirements) = setup();
        let mut payload = signed_payload(&signer, authorization(&signer, &requirements));
        payload.settlement_amount = Some(TokenAmount::from(43_700u64));
        let response = settle_payment(&chain, &payload, &requirements).await;
        assert!(response.success);
        assert_eq!(response.settled_amount, Some(TokenAmount::from(43_700u64)));
        assert_eq!(response.tx_hash.unwrap().0, MOCK_TX_HASH);
        let call = chain.last_settle_call().unwrap();
        assert_eq!(call.amount, TokenAmount::from(43_700u64));
    }

    #[tokio::test]
    async fn unmetered_payload_settles_the_ceiling() {
        let (signer, chain, requirements) = setup();
        let payload = signed_payload(&signer, authorization(&signer, &requirements));
        let response = settle_payment(&chain, &payload, &requirements).await;
        assert!(response.success);
        assert_eq!(response.settled_amount, Some(requirements.max_amount));
        assert_eq!(
            chain.last_settle_call().unwrap().amount,
            requirements.max_amount
        );
    }

    #[tokio::test]
    async fn clamps_settlement_to_authorization() {
        let (signer, chain, requirements) = setup();
        let mut payload = signed_payload(&signer, authorization(&signer, &requirements));
        payload.settlement_amount = Some(TokenAmount::from(1_000_001u64));
        let response = settle_payment(&chain, &payload, &requirements).await;
        assert!(!response.success);
        assert_eq!(
            response.error.as_deref(),
            Some(SETTLEMENT_EXCEEDS_AUTHORIZATION)
        );
        assert_eq!(chain.settle_call_count(), 0);
    }

    #[tokio::test]
    async fn settlement_equal_to_ceiling_passes_the_clamp() {
        let (signer, chain, requirements) = setup();
        let mut payload = signed_payload(&signer, authorization(&signer, &requirements));
        payload.settlement_amount = Some(TokenAmount::from(1_000_000u64));
        let response = settle_payment(&chain, &payload, &requirements).await;
        assert!(response.success);
        assert_eq!(chain.settle_call_count(), 1);
    }

    #[tokio::test]
    async fn elides_zero_amount_settlement() {
        let (signer, chain, requirements) = setup();
        let mut payload = signed_payload(&signer, authorization(&signer, &requirements));
        payload.settlement_amount = Some(TokenAmount::ZERO);
        let response = settle_payment(&chain, &payload, &requirements).await;
        assert!(response.success);
        assert_eq!(response.settled_amount, Some(TokenAmount::ZERO));
        assert!(response.tx_hash.is_none());
        assert_eq!(chain.settle_call_count(), 0);
    }

    #[tokio::test]
    async fn reverifies_before_settling() {
        let (signer, chain, requirements) = setup();
        // Balance drained between middleware verify and facilitator settle
        chain.set_balance(U256::ZERO);
        let mut payload = signed_payload(&signer, authorization(&signer, &requirements));
        payload.settlement_amount = Some(TokenAmount::from(100u64));
        let response = settle_payment(&chain, &payload, &requirements).await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("insufficient_balance"));
        assert_eq!(chain.settle_call_count(), 0);
    }

    #[tokio::test]
    async fn reports_reverted_transaction() {
        let (signer, chain, requirements) = setup();
        chain.set_settle_reverted();
        let payload = signed_payload(&signer, authorization(&signer, &requirements));
        let response = settle_payment(&chain, &payload, &requirements).await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some(TRANSACTION_REVERTED));
        assert!(response.tx_hash.is_some());
    }

    #[tokio::test]
    async fn maps_chain_write_failure_to_error_message() {
        let (signer, chain, requirements) = setup();
        chain.fail_settle("nonce too low");
        let payload = signed_payload(&signer, authorization(&signer, &requirements));
        let response = settle_payment(&chain, &payload, &requirements).await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("nonce too low"));
    }
}

//! Facilitator implementation backed by direct chain access and the audit
//! store.
//!
//! [`FacilitatorLocal`] runs the verifier and settler against a [`ChainOps`]
//! provider and records dispositions in the [`AuditStore`]. Audit writes never
//! gate the payment path: a failed insert or update is logged and the protocol
//! response goes out unchanged.

use std::convert::Infallible;
use std::sync::Arc;
use tracing::instrument;

use crate::audit::{AuditStore, PaymentRecord};
use crate::chain::{ChainId, ChainOps};
use crate::facilitator::Facilitator;
use crate::scheme::upto;
use crate::types::{
    SettleRequest, SettleResponse, SupportedResponse, UptoScheme, VerifyRequest, VerifyResponse,
};

/// A concrete [`Facilitator`] verifying and settling upto payments on one
/// network.
///
/// Generic over the [`ChainOps`] implementation, which enables testing against
/// in-memory chains beyond the default Alloy provider.
#[derive(Clone)]
pub struct FacilitatorLocal<C> {
    chain: C,
    audit: Arc<AuditStore>,
    network: ChainId,
}

impl<C> FacilitatorLocal<C> {
    pub fn new(chain: C, audit: Arc<AuditStore>, network: ChainId) -> Self {
        FacilitatorLocal {
            chain,
            audit,
            network,
        }
    }
}

impl<C: ChainOps + Sync> Facilitator for FacilitatorLocal<C> {
    type Error = Infallible;

    /// Runs the eight verification checks and, on success, inserts the audit
    /// row keyed by nonce (idempotent, so repeated verifies do not duplicate).
    #[instrument(skip_all, fields(payer = %request.payload.permit_2_authorization.from))]
    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, Self::Error> {
        match upto::verify_payment(&self.chain, &request.payload, &request.requirements).await {
            Ok(payer) => {
                let record = PaymentRecord::from_payment(&request.payload, &request.requirements);
                if let Err(e) = self.audit.record_verified(&record) {
                    tracing::error!(error = %e, nonce = %record.nonce, "audit insert failed");
                }
                Ok(VerifyResponse::valid(payer))
            }
            Err(reason) => Ok(VerifyResponse::invalid(reason)),
        }
    }

    /// Settles the metered amount and moves the audit row to its terminal
    /// status. Zero-amount elisions succeed without a transaction and leave
    /// the row in `verified`.
    #[instrument(skip_all, fields(payer = %request.payload.permit_2_authorization.from))]
    async fn settle(&self, request: &SettleRequest) -> Result<SettleResponse, Self::Error> {
        let response =
            upto::settle_payment(&self.chain, &request.payload, &request.requirements).await;
        let nonce = request.payload.permit_2_authorization.nonce;
        if response.success {
            if let (Some(tx_hash), Some(amount)) = (&response.tx_hash, &response.settled_amount) {
                if let Err(e) = self.audit.mark_settled(&nonce, amount, tx_hash) {
                    tracing::error!(error = %e, nonce = %nonce, "audit settle update failed");
                }
            }
        } else if let Some(error) = &response.error {
            if let Err(e) = self.audit.mark_failed(&nonce, error) {
                tracing::error!(error = %e, nonce = %nonce, "audit failure update failed");
            }
        }
        Ok(response)
    }

    async fn supported(&self) -> Result<SupportedResponse, Self::Error> {
        Ok(SupportedResponse {
            schemes: vec![UptoScheme::NAME.to_string()],
            networks: vec![self.network.clone()],
            facilitator: self.chain.signer_address(),
        })
    }
}

//! Core trait defining the verification and settlement interface for upto
//! facilitators.
//!
//! Implementors validate incoming payment payloads against requirements
//! ([`Facilitator::verify`]) and execute on-chain transfers
//! ([`Facilitator::settle`]). The resource middleware is generic over this
//! trait, so it works identically against the in-process implementation and
//! the remote HTTP client.

use std::fmt::{Debug, Display};
use std::future::Future;
use std::sync::Arc;

use crate::types::{SettleRequest, SettleResponse, SupportedResponse, VerifyRequest,
    VerifyResponse};

/// Asynchronous interface for upto payment facilitators.
pub trait Facilitator {
    /// The error type returned by this facilitator.
    ///
    /// Verification failures are not errors: they travel inside
    /// [`VerifyResponse::Invalid`]. Errors are reserved for the transport or
    /// infrastructure layer, which callers treat as "facilitator unavailable".
    type Error: Debug + Display;

    /// Verifies a proposed payment payload against its requirements.
    fn verify(
        &self,
        request: &VerifyRequest,
    ) -> impl Future<Output = Result<VerifyResponse, Self::Error>> + Send;

    /// Settles an accepted payment payload on-chain for its metered amount.
    fn settle(
        &self,
        request: &SettleRequest,
    ) -> impl Future<Output = Result<SettleResponse, Self::Error>> + Send;

    /// Describes the schemes and networks this facilitator serves.
    fn supported(&self) -> impl Future<Output = Result<SupportedResponse, Self::Error>> + Send;
}

impl<T: Facilitator + Sync> Facilitator for Arc<T> {
    type Error = T::Error;

    fn verify(
        &self,
        request: &VerifyRequest,
    ) -> impl Future<Output = Result<VerifyResponse, Self::Error>> + Send {
        self.as_ref().verify(request)
    }

    fn settle(
        &self,
        request: &SettleRequest,
    ) -> impl Future<Output = Result<SettleResponse, Self::Error>> + Send {
        self.as_ref().settle(request)
    }

    fn supported(&self) -> impl Future<Output = Result<SupportedResponse, Self::Error>> + Send {
        self.as_ref().supported()
    }
}

//! Payment scheme implementations.
//!
//! Only the `upto` scheme lives here: the payer signs a ceiling authorization
//! and the facilitator settles the metered amount, at most the ceiling. A
//! multi-scheme facilitator would dispatch on the requirements' `scheme` field
//! before reaching this module.

pub mod upto;

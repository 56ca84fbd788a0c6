//! Credential Rotator Library
//!
//! Keeps short-lived, federated cloud credentials for AI gateway backend
//! security policies fresh. Each reconciliation tick decides whether the
//! stored credential is due, rotates it when needed, and reports when the
//! policy should be looked at again.

pub mod driver;
pub mod rotation;

pub use rotation::{
    CredentialPolicy, RotationConfig, RotationError, RotationScheduler, RotatorFactory, TickAction,
    TickOutcome,
};

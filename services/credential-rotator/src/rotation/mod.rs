//! Federated Credential Rotation
//!
//! Turns a backend security policy into a fresh, short-lived cloud credential
//! stored in a Kubernetes Secret.
//!
//! ## Architecture
//!
//! - **Token providers**: obtain a bearer token and its expiry from an OIDC
//!   issuer, Azure Entra ID, or a GCP service account key
//! - **Identity exchangers**: trade a federated token for cloud-native
//!   credentials (AWS STS, Azure federated credentials, GCP STS)
//! - **Credential store**: one Secret per policy key, upserted with a single
//!   expiration annotation
//! - **Rotators**: one per cloud, selected by the policy's auth type
//! - **Scheduler**: the per-tick decision function that returns the next
//!   check interval
//!
//! ## Ticks
//!
//! There is no background timer. All state is re-derived from the stored
//! credential on every tick, so restarts and multiple replicas need no
//! coordination. Ticks for the same policy must be serialized by the caller.

mod clock;
mod config;
mod exchange;
mod policy;
mod rotators;
mod scheduler;
mod service_account;
mod store;
mod token_provider;
mod types;

pub use clock::{Clock, SystemClock};
pub use config::{Endpoints, ProxySettings, RotationConfig, DEFAULT_PRE_ROTATION_WINDOW};
pub use exchange::{
    AwsStsExchanger, AzureFederatedExchanger, GcpWorkloadIdentityExchanger, IdentityExchanger,
};
pub use policy::*;
pub use rotators::{AwsOidcRotator, AzureTokenRotator, GcpTokenRotator, Rotator, RotatorCore};
pub use scheduler::{RotationScheduler, RotatorFactory, TickAction, TickOutcome};
pub use service_account::{GcpServiceAccountTokenProvider, ServiceAccountKey, SERVICE_ACCOUNT_KEY};
pub use store::{
    format_expiration, CredentialKey, CredentialStore, KubeSecretStore, SecretSource,
    StoredCredential, EXPIRATION_ANNOTATION_KEY,
};
pub use token_provider::{
    AzureClientSecretTokenProvider, ClientSecretRef, OidcTokenProvider, TokenProvider,
    CLIENT_SECRET_KEY,
};
pub use types::*;

#[cfg(test)]
pub(crate) mod testing {
    pub use super::clock::ManualClock;
    pub use super::store::InMemoryStore;
}

//! Per-cloud Rotators
//!
//! A closed set of rotator implementations sharing one contract:
//! `get_pre_rotation_time`, `is_expired` and `rotate`. All state lives in the
//! credential store and is re-read on every call.

mod aws;
mod azure;
mod gcp;

pub use aws::AwsOidcRotator;
pub use azure::AzureTokenRotator;
pub use gcp::GcpTokenRotator;

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use super::clock::Clock;
use super::store::{CredentialKey, CredentialStore};
use super::types::{CloudProvider, RotatedCredential, RotationError};

/// `expires_at - window`, saturating at the earliest representable instant.
pub fn rotation_time_for(expires_at: DateTime<Utc>, window: TimeDelta) -> DateTime<Utc> {
    expires_at
        .checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Store access and expiry bookkeeping shared by every rotator
#[derive(Clone)]
pub struct RotatorCore {
    store: Arc<dyn CredentialStore>,
    key: CredentialKey,
    window: TimeDelta,
    clock: Arc<dyn Clock>,
}

impl RotatorCore {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        key: CredentialKey,
        window: TimeDelta,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            key,
            window,
            clock,
        }
    }

    pub fn key(&self) -> &CredentialKey {
        &self.key
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn pre_rotation_time(&self) -> Result<DateTime<Utc>, RotationError> {
        let stored = self
            .store
            .lookup(&self.key)
            .await?
            .ok_or_else(|| RotationError::NotFound {
                namespace: self.key.namespace.clone(),
                name: self.key.name.clone(),
            })?;

        Ok(rotation_time_for(stored.expires_at()?, self.window))
    }

    fn is_expired(&self, rotation_time: DateTime<Utc>) -> bool {
        self.clock.now() >= rotation_time
    }

    /// Upsert a freshly minted credential and hand back its expiry.
    async fn persist(
        &self,
        provider: CloudProvider,
        credential: RotatedCredential,
    ) -> Result<DateTime<Utc>, RotationError> {
        if credential.payload.provider() != provider {
            return Err(RotationError::Exchange(format!(
                "{} rotator received a {} credential",
                provider,
                credential.payload.provider()
            )));
        }

        let now = self.clock.now();
        if credential.expires_at <= now {
            warn!(
                provider = %provider,
                namespace = %self.key.namespace,
                name = %self.key.name,
                expires_at = %credential.expires_at,
                now = %now,
                "Rotated credential expiration is not after the current time"
            );
        }

        self.store
            .upsert(&self.key, &credential.payload, credential.expires_at)
            .await?;

        info!(
            provider = %provider,
            namespace = %self.key.namespace,
            name = %self.key.name,
            expires_at = %credential.expires_at,
            "Credential rotated"
        );
        Ok(credential.expires_at)
    }
}

/// Rotator selected for a policy
pub enum Rotator {
    Aws(AwsOidcRotator),
    Azure(AzureTokenRotator),
    Gcp(GcpTokenRotator),
}

impl Rotator {
    fn core(&self) -> &RotatorCore {
        match self {
            Rotator::Aws(r) => &r.core,
            Rotator::Azure(r) => &r.core,
            Rotator::Gcp(r) => &r.core,
        }
    }

    pub fn provider(&self) -> CloudProvider {
        match self {
            Rotator::Aws(_) => CloudProvider::Aws,
            Rotator::Azure(_) => CloudProvider::Azure,
            Rotator::Gcp(_) => CloudProvider::Gcp,
        }
    }

    pub fn key(&self) -> &CredentialKey {
        self.core().key()
    }

    /// Stored expiration minus the pre-rotation window.
    ///
    /// Fails with `NotFound` when nothing has been stored yet and with
    /// `MalformedExpiration` when the marker cannot be parsed.
    pub async fn get_pre_rotation_time(&self) -> Result<DateTime<Utc>, RotationError> {
        self.core().pre_rotation_time().await
    }

    /// True once now is at or past `rotation_time`.
    pub fn is_expired(&self, rotation_time: DateTime<Utc>) -> bool {
        self.core().is_expired(rotation_time)
    }

    /// When a credential expiring at `expires_at` becomes due.
    pub fn rotation_time_for(&self, expires_at: DateTime<Utc>) -> DateTime<Utc> {
        rotation_time_for(expires_at, self.core().window)
    }

    /// Mint and persist a new credential, returning its expiration.
    pub async fn rotate(&self) -> Result<DateTime<Utc>, RotationError> {
        match self {
            Rotator::Aws(r) => r.rotate().await,
            Rotator::Azure(r) => r.rotate().await,
            Rotator::Gcp(r) => r.rotate().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::clock::ManualClock;
    use crate::rotation::store::InMemoryStore;
    use crate::rotation::token_provider::FixedTokenProvider;
    use crate::rotation::types::CredentialPayload;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn azure_rotator(
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        expires_at: DateTime<Utc>,
    ) -> Rotator {
        let key = CredentialKey::for_policy("openai", "ai", false);
        let core = RotatorCore::new(store, key, TimeDelta::minutes(5), clock);
        Rotator::Azure(AzureTokenRotator::new(
            core,
            Arc::new(FixedTokenProvider::new("azure-token", expires_at)),
            None,
        ))
    }

    #[test]
    fn test_rotation_time_saturates() {
        assert_eq!(
            rotation_time_for(t0(), TimeDelta::minutes(5)),
            t0() - TimeDelta::minutes(5)
        );
        assert_eq!(
            rotation_time_for(t0(), TimeDelta::MAX),
            DateTime::<Utc>::MIN_UTC
        );
    }

    #[tokio::test]
    async fn test_pre_rotation_time_is_marker_minus_window() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let rotator = azure_rotator(store.clone(), clock, t0() + TimeDelta::hours(1));

        let marker = Utc.with_ymd_and_hms(2025, 6, 1, 13, 17, 42).unwrap();
        store.put(
            rotator.key(),
            &CredentialPayload::Azure {
                access_token: "t".to_string(),
            },
            marker,
        );

        assert_eq!(
            rotator.get_pre_rotation_time().await.unwrap(),
            marker - TimeDelta::minutes(5)
        );
        assert_eq!(rotator.provider(), CloudProvider::Azure);
    }

    #[tokio::test]
    async fn test_pre_rotation_time_without_credential() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let rotator = azure_rotator(store, clock, t0());

        let err = rotator.get_pre_rotation_time().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_pre_rotation_time_malformed_marker() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let rotator = azure_rotator(store.clone(), clock, t0());

        store.put(
            rotator.key(),
            &CredentialPayload::Azure {
                access_token: "t".to_string(),
            },
            t0(),
        );
        store.set_expiration_marker(rotator.key(), Some("yesterday"));

        assert!(matches!(
            rotator.get_pre_rotation_time().await,
            Err(RotationError::MalformedExpiration { .. })
        ));
    }

    #[test]
    fn test_is_expired_boundary_inclusive() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let rotator = azure_rotator(store, clock.clone(), t0());

        assert!(rotator.is_expired(t0()));
        assert!(rotator.is_expired(t0() - TimeDelta::seconds(1)));
        assert!(!rotator.is_expired(t0() + TimeDelta::seconds(1)));

        clock.advance(TimeDelta::seconds(1));
        assert!(rotator.is_expired(t0() + TimeDelta::seconds(1)));
    }

    #[tokio::test]
    async fn test_rotate_with_past_expiry_is_not_fatal() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let rotator = azure_rotator(store.clone(), clock, t0() - TimeDelta::seconds(30));

        let expires_at = rotator.rotate().await.unwrap();
        assert_eq!(expires_at, t0() - TimeDelta::seconds(30));
        assert_eq!(store.len(), 1);
    }
}

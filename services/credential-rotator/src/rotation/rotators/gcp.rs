//! GCP Token Rotator
//!
//! A service account key mints the access token directly. Workload identity
//! federation exchanges an OIDC token at GCP STS, optionally impersonating a
//! service account.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use super::RotatorCore;
use crate::rotation::exchange::IdentityExchanger;
use crate::rotation::token_provider::TokenProvider;
use crate::rotation::types::{CloudProvider, CredentialPayload, RotatedCredential, RotationError};

pub struct GcpTokenRotator {
    pub(super) core: RotatorCore,
    token_provider: Arc<dyn TokenProvider>,
    exchanger: Option<Arc<dyn IdentityExchanger>>,
    project_name: String,
    region: String,
}

impl GcpTokenRotator {
    pub fn new(
        core: RotatorCore,
        token_provider: Arc<dyn TokenProvider>,
        exchanger: Option<Arc<dyn IdentityExchanger>>,
        project_name: &str,
        region: &str,
    ) -> Self {
        Self {
            core,
            token_provider,
            exchanger,
            project_name: project_name.to_string(),
            region: region.to_string(),
        }
    }

    pub(super) async fn rotate(&self) -> Result<DateTime<Utc>, RotationError> {
        let key = self.core.key();
        info!(
            namespace = %key.namespace,
            name = %key.name,
            project = %self.project_name,
            federated = self.exchanger.is_some(),
            "Rotating GCP access token"
        );

        let token = self.token_provider.get_token().await?;
        let credential = match &self.exchanger {
            Some(exchanger) => exchanger.exchange(&token).await?,
            None => RotatedCredential {
                expires_at: token.expires_at,
                payload: CredentialPayload::Gcp {
                    access_token: token.token,
                    project_name: self.project_name.clone(),
                    region: self.region.clone(),
                },
            },
        };

        self.core.persist(CloudProvider::Gcp, credential).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::clock::ManualClock;
    use crate::rotation::exchange::MockIdentityExchanger;
    use crate::rotation::rotators::Rotator;
    use crate::rotation::store::{CredentialKey, InMemoryStore};
    use crate::rotation::token_provider::FixedTokenProvider;
    use crate::rotation::types::{GCP_ACCESS_TOKEN_KEY, GCP_PROJECT_NAME_KEY, GCP_REGION_KEY};
    use chrono::{TimeDelta, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn core(store: Arc<InMemoryStore>, key: CredentialKey) -> RotatorCore {
        RotatorCore::new(
            store,
            key,
            TimeDelta::minutes(5),
            Arc::new(ManualClock::new(t0())),
        )
    }

    #[tokio::test]
    async fn test_service_account_token_is_stored_with_project() {
        let store = Arc::new(InMemoryStore::new());
        let key = CredentialKey::for_policy("vertex", "ai", false);
        let rotator = Rotator::Gcp(GcpTokenRotator::new(
            core(store.clone(), key.clone()),
            Arc::new(FixedTokenProvider::new("ya29.sa", t0() + TimeDelta::hours(1))),
            None,
            "my-project",
            "us-central1",
        ));

        let expires_at = rotator.rotate().await.unwrap();
        assert_eq!(expires_at, t0() + TimeDelta::hours(1));

        let stored = store.get(&key).unwrap();
        assert_eq!(stored.fields[GCP_ACCESS_TOKEN_KEY], "ya29.sa");
        assert_eq!(stored.fields[GCP_PROJECT_NAME_KEY], "my-project");
        assert_eq!(stored.fields[GCP_REGION_KEY], "us-central1");
    }

    #[tokio::test]
    async fn test_federated_rotation_uses_exchanger_output() {
        let store = Arc::new(InMemoryStore::new());
        let key = CredentialKey::for_policy("vertex", "ai", true);

        let mut exchanger = MockIdentityExchanger::new();
        exchanger.expect_exchange().times(1).returning(|_| {
            Ok(RotatedCredential {
                payload: CredentialPayload::Gcp {
                    access_token: "ya29.federated".to_string(),
                    project_name: "my-project".to_string(),
                    region: "europe-west4".to_string(),
                },
                expires_at: t0() + TimeDelta::minutes(45),
            })
        });

        let rotator = Rotator::Gcp(GcpTokenRotator::new(
            core(store.clone(), key.clone()),
            Arc::new(FixedTokenProvider::new("oidc-jwt", t0() + TimeDelta::minutes(5))),
            Some(Arc::new(exchanger) as Arc<dyn IdentityExchanger>),
            "my-project",
            "europe-west4",
        ));

        rotator.rotate().await.unwrap();
        assert_eq!(
            rotator.get_pre_rotation_time().await.unwrap(),
            t0() + TimeDelta::minutes(40)
        );
        assert_eq!(store.get(&key).unwrap().fields[GCP_ACCESS_TOKEN_KEY], "ya29.federated");
    }

    #[tokio::test]
    async fn test_exchange_failure_propagates() {
        let store = Arc::new(InMemoryStore::new());
        let key = CredentialKey::for_policy("vertex", "ai", true);

        let mut exchanger = MockIdentityExchanger::new();
        exchanger
            .expect_exchange()
            .returning(|_| Err(RotationError::Exchange("GCP STS failed with 400".to_string())));

        let rotator = Rotator::Gcp(GcpTokenRotator::new(
            core(store.clone(), key),
            Arc::new(FixedTokenProvider::new("oidc-jwt", t0() + TimeDelta::minutes(5))),
            Some(Arc::new(exchanger) as Arc<dyn IdentityExchanger>),
            "my-project",
            "europe-west4",
        ));

        let err = rotator.rotate().await.unwrap_err();
        assert!(err.to_string().contains("GCP STS failed"));
        assert_eq!(store.len(), 0);
    }
}

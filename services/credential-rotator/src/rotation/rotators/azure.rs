//! Azure Token Rotator
//!
//! With a client secret the token provider's output is the credential. With
//! OIDC federation the token is exchanged at Entra ID first.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use super::RotatorCore;
use crate::rotation::exchange::IdentityExchanger;
use crate::rotation::token_provider::TokenProvider;
use crate::rotation::types::{CloudProvider, CredentialPayload, RotatedCredential, RotationError};

pub struct AzureTokenRotator {
    pub(super) core: RotatorCore,
    token_provider: Arc<dyn TokenProvider>,
    exchanger: Option<Arc<dyn IdentityExchanger>>,
}

impl AzureTokenRotator {
    pub fn new(
        core: RotatorCore,
        token_provider: Arc<dyn TokenProvider>,
        exchanger: Option<Arc<dyn IdentityExchanger>>,
    ) -> Self {
        Self {
            core,
            token_provider,
            exchanger,
        }
    }

    pub(super) async fn rotate(&self) -> Result<DateTime<Utc>, RotationError> {
        let key = self.core.key();
        info!(
            namespace = %key.namespace,
            name = %key.name,
            federated = self.exchanger.is_some(),
            "Rotating Azure access token"
        );

        let token = self.token_provider.get_token().await?;
        let credential = match &self.exchanger {
            Some(exchanger) => exchanger.exchange(&token).await?,
            None => RotatedCredential {
                expires_at: token.expires_at,
                payload: CredentialPayload::Azure {
                    access_token: token.token,
                },
            },
        };

        self.core.persist(CloudProvider::Azure, credential).await
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
    use crate::rotation::types::AZURE_ACCESS_TOKEN_KEY;
    use chrono::{TimeDelta, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_client_secret_token_is_stored_directly() {
        let store = Arc::new(InMemoryStore::new());
        let key = CredentialKey::for_policy("openai", "ai", false);
        let core = RotatorCore::new(
            store.clone(),
            key.clone(),
            TimeDelta::minutes(5),
            Arc::new(ManualClock::new(t0())),
        );
        let rotator = Rotator::Azure(AzureTokenRotator::new(
            core,
            Arc::new(FixedTokenProvider::new("direct-token", t0() + TimeDelta::minutes(90))),
            None,
        ));

        let expires_at = rotator.rotate().await.unwrap();
        assert_eq!(expires_at, t0() + TimeDelta::minutes(90));

        let stored = store.get(&key).unwrap();
        assert_eq!(stored.fields.len(), 1);
        assert_eq!(stored.fields[AZURE_ACCESS_TOKEN_KEY], "direct-token");
        assert_eq!(
            rotator.get_pre_rotation_time().await.unwrap(),
            t0() + TimeDelta::minutes(85)
        );
    }

    #[tokio::test]
    async fn test_federated_token_is_exchanged() {
        let store = Arc::new(InMemoryStore::new());
        let key = CredentialKey::for_policy("openai", "ai", true);
        let core = RotatorCore::new(
            store.clone(),
            key.clone(),
            TimeDelta::minutes(5),
            Arc::new(ManualClock::new(t0())),
        );

        let mut exchanger = MockIdentityExchanger::new();
        exchanger
            .expect_exchange()
            .withf(|token| token.token == "oidc-jwt")
            .times(1)
            .returning(|_| {
                Ok(RotatedCredential {
                    payload: CredentialPayload::Azure {
                        access_token: "entra-token".to_string(),
                    },
                    expires_at: t0() + TimeDelta::hours(1),
                })
            });

        let rotator = Rotator::Azure(AzureTokenRotator::new(
            core,
            Arc::new(FixedTokenProvider::new("oidc-jwt", t0() + TimeDelta::minutes(10))),
            Some(Arc::new(exchanger) as Arc<dyn IdentityExchanger>),
        ));

        let expires_at = rotator.rotate().await.unwrap();
        assert_eq!(expires_at, t0() + TimeDelta::hours(1));
        assert_eq!(store.get(&key).unwrap().fields[AZURE_ACCESS_TOKEN_KEY], "entra-token");
    }

    #[tokio::test]
    async fn test_token_provider_failure_leaves_store_untouched() {
        let store = Arc::new(InMemoryStore::new());
        let key = CredentialKey::for_policy("openai", "ai", false);
        let core = RotatorCore::new(
            store.clone(),
            key,
            TimeDelta::minutes(5),
            Arc::new(ManualClock::new(t0())),
        );
        let rotator = Rotator::Azure(AzureTokenRotator::new(
            core,
            Arc::new(FixedTokenProvider::failing("invalid_client")),
            None,
        ));

        assert!(rotator.rotate().await.is_err());
        assert_eq!(store.writes(), 0);
    }
}

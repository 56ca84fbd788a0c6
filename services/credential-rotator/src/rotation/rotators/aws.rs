//! AWS OIDC Rotator
//!
//! OIDC token, then STS AssumeRoleWithWebIdentity, then a shared credentials
//! file in the store.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use super::RotatorCore;
use crate::rotation::exchange::IdentityExchanger;
use crate::rotation::token_provider::TokenProvider;
use crate::rotation::types::{CloudProvider, RotationError};

pub struct AwsOidcRotator {
    pub(super) core: RotatorCore,
    token_provider: Arc<dyn TokenProvider>,
    exchanger: Arc<dyn IdentityExchanger>,
}

impl AwsOidcRotator {
    pub fn new(
        core: RotatorCore,
        token_provider: Arc<dyn TokenProvider>,
        exchanger: Arc<dyn IdentityExchanger>,
    ) -> Self {
        Self {
            core,
            token_provider,
            exchanger,
        }
    }

    pub(super) async fn rotate(&self) -> Result<DateTime<Utc>, RotationError> {
        let key = self.core.key();
        info!(namespace = %key.namespace, name = %key.name, "Rotating AWS credentials");

        let token = self.token_provider.get_token().await?;
        let credential = self.exchanger.exchange(&token).await?;

        self.core.persist(CloudProvider::Aws, credential).await
    }
}

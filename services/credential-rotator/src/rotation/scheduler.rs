//! Rotation Scheduler
//!
//! The per-tick decision function. A tick selects the rotator for a policy,
//! decides whether to rotate, and always returns the delay before the next
//! tick.
//!
//! Ticks for the same policy must not run concurrently. Nothing here guards
//! against it; the driver calling [`RotationScheduler::tick`] is responsible
//! for serializing ticks per policy. Ticks for different policies are
//! independent.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::config::RotationConfig;
use super::exchange::{
    AwsStsExchanger, AzureFederatedExchanger, GcpWorkloadIdentityExchanger, IdentityExchanger,
};
use super::policy::{CredentialPolicy, OidcExchangeToken, PolicyType};
use super::rotators::{AwsOidcRotator, AzureTokenRotator, GcpTokenRotator, Rotator, RotatorCore};
use super::service_account::GcpServiceAccountTokenProvider;
use super::store::{CredentialKey, CredentialStore, SecretSource};
use super::token_provider::{
    AzureClientSecretTokenProvider, ClientSecretRef, OidcTokenProvider, TokenProvider,
};
use super::types::RotationError;

/// Builds the rotator matching a policy's auth type
pub struct RotatorFactory {
    config: RotationConfig,
    store: Arc<dyn CredentialStore>,
    secrets: Arc<dyn SecretSource>,
    clock: Arc<dyn Clock>,
    oidc_http: reqwest::Client,
    aws_http: reqwest::Client,
    azure_http: reqwest::Client,
    gcp_http: reqwest::Client,
}

impl RotatorFactory {
    pub fn new(
        config: RotationConfig,
        store: Arc<dyn CredentialStore>,
        secrets: Arc<dyn SecretSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RotationError> {
        config.validate()?;

        let oidc_http = config.http_client(None)?;
        let aws_http = config.http_client(config.proxies.aws_sts.as_deref())?;
        let azure_http = config.http_client(config.proxies.azure.as_deref())?;
        let gcp_http = config.http_client(config.proxies.gcp.as_deref())?;

        Ok(Self {
            config,
            store,
            secrets,
            clock,
            oidc_http,
            aws_http,
            azure_http,
            gcp_http,
        })
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// Select the rotator for a policy.
    ///
    /// `Ok(None)` means the policy does not need rotation. Configuration
    /// errors are returned before any network call is made.
    pub fn rotator_for(&self, policy: &CredentialPolicy) -> Result<Option<Rotator>, RotationError> {
        match policy.policy_type() {
            PolicyType::ApiKey | PolicyType::AzureApiKey | PolicyType::AnthropicApiKey => Ok(None),
            PolicyType::AwsCredentials => self.aws_rotator(policy),
            PolicyType::AzureCredentials => self.azure_rotator(policy).map(Some),
            PolicyType::GcpCredentials => self.gcp_rotator(policy).map(Some),
            PolicyType::Other(other) => Err(RotationError::config(format!(
                "backend security type {} does not support credential rotation",
                other
            ))),
        }
    }

    fn core(&self, policy: &CredentialPolicy, federated: bool) -> RotatorCore {
        RotatorCore::new(
            self.store.clone(),
            CredentialKey::for_policy(policy.name(), policy.namespace(), federated),
            self.config.window_delta(),
            self.clock.clone(),
        )
    }

    fn oidc_provider(
        &self,
        policy: &CredentialPolicy,
        exchange: &OidcExchangeToken,
    ) -> Result<Arc<dyn TokenProvider>, RotationError> {
        validate_oidc(policy, exchange)?;
        Ok(Arc::new(OidcTokenProvider::new(
            self.oidc_http.clone(),
            exchange.clone(),
            policy.namespace(),
            self.secrets.clone(),
            self.clock.clone(),
        )))
    }

    fn aws_rotator(&self, policy: &CredentialPolicy) -> Result<Option<Rotator>, RotationError> {
        let aws = policy
            .spec
            .aws_credentials
            .as_ref()
            .ok_or_else(|| missing_field(policy, "awsCredentials"))?;

        // Static credentials file or the default credential chain
        let Some(oidc) = aws.oidc_exchange_token.as_ref() else {
            return Ok(None);
        };

        if oidc.aws_role_arn.trim().is_empty() {
            return Err(missing_field(policy, "awsCredentials.oidcExchangeToken.awsRoleArn"));
        }
        if aws.region.trim().is_empty() {
            return Err(missing_field(policy, "awsCredentials.region"));
        }

        let token_provider = self.oidc_provider(policy, &oidc.exchange)?;
        let exchanger = Arc::new(AwsStsExchanger::new(
            self.aws_http.clone(),
            &self.config.endpoints,
            &oidc.aws_role_arn,
            &aws.region,
            policy.name(),
        ));

        Ok(Some(Rotator::Aws(AwsOidcRotator::new(
            self.core(policy, true),
            token_provider,
            exchanger,
        ))))
    }

    fn azure_rotator(&self, policy: &CredentialPolicy) -> Result<Rotator, RotationError> {
        let azure = policy
            .spec
            .azure_credentials
            .as_ref()
            .ok_or_else(|| missing_field(policy, "azureCredentials"))?;

        if azure.tenant_id.trim().is_empty() {
            return Err(missing_field(policy, "azureCredentials.tenantID"));
        }
        if azure.client_id.trim().is_empty() {
            return Err(missing_field(policy, "azureCredentials.clientID"));
        }

        match (&azure.client_secret_ref, &azure.oidc_exchange_token) {
            (Some(secret_ref), None) => {
                let token_provider = Arc::new(AzureClientSecretTokenProvider::new(
                    self.azure_http.clone(),
                    &self.config.endpoints.azure_authority,
                    &azure.tenant_id,
                    &azure.client_id,
                    ClientSecretRef::resolve(secret_ref, policy.namespace()),
                    self.secrets.clone(),
                    self.clock.clone(),
                ));
                Ok(Rotator::Azure(AzureTokenRotator::new(
                    self.core(policy, false),
                    token_provider,
                    None,
                )))
            }
            (None, Some(oidc)) => {
                let token_provider = self.oidc_provider(policy, oidc)?;
                let exchanger: Arc<dyn IdentityExchanger> = Arc::new(AzureFederatedExchanger::new(
                    self.azure_http.clone(),
                    &self.config.endpoints,
                    &azure.tenant_id,
                    &azure.client_id,
                    self.clock.clone(),
                ));
                Ok(Rotator::Azure(AzureTokenRotator::new(
                    self.core(policy, true),
                    token_provider,
                    Some(exchanger),
                )))
            }
            _ => Err(RotationError::config(format!(
                "policy {}/{}: exactly one of azureCredentials.clientSecretRef or azureCredentials.oidcExchangeToken must be set",
                policy.namespace(),
                policy.name()
            ))),
        }
    }

    fn gcp_rotator(&self, policy: &CredentialPolicy) -> Result<Rotator, RotationError> {
        let gcp = policy
            .spec
            .gcp_credentials
            .as_ref()
            .ok_or_else(|| missing_field(policy, "gcpCredentials"))?;

        if gcp.project_name.trim().is_empty() {
            return Err(missing_field(policy, "gcpCredentials.projectName"));
        }
        if gcp.region.trim().is_empty() {
            return Err(missing_field(policy, "gcpCredentials.region"));
        }

        match (&gcp.credentials_file, &gcp.workload_identity_federation_config) {
            (Some(file), None) => {
                let token_provider = Arc::new(GcpServiceAccountTokenProvider::new(
                    self.gcp_http.clone(),
                    file.secret_ref.namespace_or(policy.namespace()),
                    &file.secret_ref.name,
                    self.secrets.clone(),
                    self.clock.clone(),
                ));
                Ok(Rotator::Gcp(GcpTokenRotator::new(
                    self.core(policy, false),
                    token_provider,
                    None,
                    &gcp.project_name,
                    &gcp.region,
                )))
            }
            (None, Some(federation)) => {
                for (field, value) in [
                    ("projectID", &federation.project_id),
                    ("workloadIdentityPoolName", &federation.workload_identity_pool_name),
                    ("workloadIdentityProviderName", &federation.workload_identity_provider_name),
                ] {
                    if value.trim().is_empty() {
                        return Err(missing_field(
                            policy,
                            &format!("gcpCredentials.workloadIdentityFederationConfig.{}", field),
                        ));
                    }
                }

                let token_provider = self.oidc_provider(policy, &federation.oidc_exchange_token)?;
                let exchanger: Arc<dyn IdentityExchanger> =
                    Arc::new(GcpWorkloadIdentityExchanger::new(
                        self.gcp_http.clone(),
                        &self.config.endpoints,
                        gcp,
                        federation,
                        self.clock.clone(),
                    ));
                Ok(Rotator::Gcp(GcpTokenRotator::new(
                    self.core(policy, true),
                    token_provider,
                    Some(exchanger),
                    &gcp.project_name,
                    &gcp.region,
                )))
            }
            _ => Err(RotationError::config(format!(
                "policy {}/{}: exactly one of gcpCredentials.credentialsFile or gcpCredentials.workloadIdentityFederationConfig must be set",
                policy.namespace(),
                policy.name()
            ))),
        }
    }
}

fn missing_field(policy: &CredentialPolicy, field: &str) -> RotationError {
    RotationError::config(format!(
        "{} policy {}/{} is missing {}",
        policy.policy_type(),
        policy.namespace(),
        policy.name(),
        field
    ))
}

fn validate_oidc(policy: &CredentialPolicy, exchange: &OidcExchangeToken) -> Result<(), RotationError> {
    let oidc = &exchange.oidc;
    if oidc.provider.issuer.trim().is_empty() {
        return Err(missing_field(policy, "oidc.provider.issuer"));
    }
    if oidc.client_id.trim().is_empty() {
        return Err(missing_field(policy, "oidc.clientID"));
    }
    if oidc.client_secret.name.trim().is_empty() {
        return Err(missing_field(policy, "oidc.clientSecret.name"));
    }
    Ok(())
}

/// What a tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// The policy type needs no rotation
    Unsupported,
    /// The policy cannot be rotated as written
    Invalid,
    /// The stored credential is still fresh
    NotDue,
    /// A new credential was stored
    Rotated,
    /// Something failed; try again after the retry interval
    RetryScheduled,
}

/// Result of one tick: the action taken, when to tick again, and the error
/// to surface, if any.
#[derive(Debug)]
pub struct TickOutcome {
    pub action: TickAction,
    pub requeue_after: Duration,
    pub error: Option<RotationError>,
}

impl TickOutcome {
    fn new(action: TickAction, requeue_after: Duration, error: Option<RotationError>) -> Self {
        Self {
            action,
            requeue_after,
            error,
        }
    }

    pub fn into_result(self) -> Result<Duration, RotationError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.requeue_after),
        }
    }
}

/// Stateless tick evaluator
pub struct RotationScheduler {
    factory: RotatorFactory,
}

impl RotationScheduler {
    pub fn new(factory: RotatorFactory) -> Self {
        Self { factory }
    }

    pub fn retry_interval(&self) -> Duration {
        self.factory.config.retry_interval
    }

    fn until(&self, when: DateTime<Utc>) -> Option<Duration> {
        (when - self.factory.clock.now())
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
    }

    /// Evaluate one policy.
    pub async fn tick(&self, policy: &CredentialPolicy) -> TickOutcome {
        let retry = self.retry_interval();

        let rotator = match self.factory.rotator_for(policy) {
            Ok(Some(rotator)) => rotator,
            Ok(None) => {
                debug!(
                    namespace = %policy.namespace(),
                    name = %policy.name(),
                    policy_type = %policy.policy_type(),
                    "Policy does not need credential rotation"
                );
                return TickOutcome::new(TickAction::Unsupported, Duration::ZERO, None);
            }
            Err(err) => {
                error!(
                    namespace = %policy.namespace(),
                    name = %policy.name(),
                    policy_type = %policy.policy_type(),
                    error = %err,
                    "Invalid credential rotation configuration"
                );
                return TickOutcome::new(TickAction::Invalid, Duration::ZERO, Some(err));
            }
        };

        let key = rotator.key().clone();
        let rotation_time = match rotator.get_pre_rotation_time().await {
            Ok(time) => time,
            Err(err) if err.is_not_found() => {
                info!(
                    namespace = %key.namespace,
                    name = %key.name,
                    provider = %rotator.provider(),
                    "No stored credential, rotating now"
                );
                return self.forced_rotation(&rotator, retry).await;
            }
            Err(err) => {
                error!(
                    namespace = %key.namespace,
                    name = %key.name,
                    error = %err,
                    requeue_after_secs = retry.as_secs(),
                    "failed to get rotation time, retry in one minute"
                );
                return TickOutcome::new(TickAction::RetryScheduled, retry, Some(err));
            }
        };

        if !rotator.is_expired(rotation_time) {
            let requeue_after = self.until(rotation_time).unwrap_or(retry);
            info!(
                namespace = %key.namespace,
                name = %key.name,
                minutes_until_renewal = requeue_after.as_secs() / 60,
                requeue_after_secs = requeue_after.as_secs(),
                "credential has not yet expired"
            );
            return TickOutcome::new(TickAction::NotDue, requeue_after, None);
        }

        match rotator.rotate().await {
            Ok(expires_at) => {
                let new_rotation_time = rotator.rotation_time_for(expires_at);
                match self.until(new_rotation_time) {
                    Some(requeue_after) => {
                        info!(
                            namespace = %key.namespace,
                            name = %key.name,
                            expires_at = %expires_at,
                            requeue_after_secs = requeue_after.as_secs(),
                            "Credential rotation complete"
                        );
                        TickOutcome::new(TickAction::Rotated, requeue_after, None)
                    }
                    None => {
                        warn!(
                            namespace = %key.namespace,
                            name = %key.name,
                            expires_at = %expires_at,
                            requeue_after_secs = retry.as_secs(),
                            "newly rotated credential is already expired"
                        );
                        TickOutcome::new(TickAction::Rotated, retry, None)
                    }
                }
            }
            Err(err) => {
                error!(
                    namespace = %key.namespace,
                    name = %key.name,
                    error = %err,
                    requeue_after_secs = retry.as_secs(),
                    "failed to rotate credential, retry in one minute"
                );
                TickOutcome::new(TickAction::RetryScheduled, retry, Some(err))
            }
        }
    }

    /// First tick for a policy: rotate, then look again after the retry
    /// interval so the real schedule is derived from the stored marker.
    async fn forced_rotation(&self, rotator: &Rotator, retry: Duration) -> TickOutcome {
        let key = rotator.key();
        match rotator.rotate().await {
            Ok(expires_at) => {
                info!(
                    namespace = %key.namespace,
                    name = %key.name,
                    expires_at = %expires_at,
                    requeue_after_secs = retry.as_secs(),
                    "Initial credential stored"
                );
                TickOutcome::new(TickAction::Rotated, retry, None)
            }
            Err(err) => {
                error!(
                    namespace = %key.namespace,
                    name = %key.name,
                    error = %err,
                    requeue_after_secs = retry.as_secs(),
                    "failed to rotate credential, retry in one minute"
                );
                TickOutcome::new(TickAction::RetryScheduled, retry, Some(err))
            }
        }
    }
}

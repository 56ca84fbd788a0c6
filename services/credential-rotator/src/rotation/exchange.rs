//! Identity Exchangers
//!
//! Trade a federated OIDC token for cloud-native short-lived credentials
//! through each cloud's federation API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use super::clock::Clock;
use super::config::Endpoints;
use super::policy::{GcpCredentials, GcpWorkloadIdentityFederation};
use super::service_account::CLOUD_PLATFORM_SCOPE;
use super::token_provider::{
    azure_token_url, request_token, TokenResponse, AZURE_COGNITIVE_SERVICES_SCOPE,
};
use super::types::{CredentialPayload, FederatedToken, RotatedCredential, RotationError};

const STS_API_VERSION: &str = "2011-06-15";
const SESSION_NAME_PREFIX: &str = "ai-gateway-";
const MAX_SESSION_NAME_LEN: usize = 64;

const JWT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const JWT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";
const IAM_SCOPE: &str = "https://www.googleapis.com/auth/iam";

/// Trades a federated token for a cloud credential
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityExchanger: Send + Sync {
    async fn exchange(&self, token: &FederatedToken) -> Result<RotatedCredential, RotationError>;
}

/// AWS STS AssumeRoleWithWebIdentity response
///
/// The root element is `AssumeRoleWithWebIdentityResponse`.
#[derive(Debug, Deserialize)]
struct AssumeRoleWithWebIdentityResponse {
    #[serde(rename = "AssumeRoleWithWebIdentityResult")]
    result: AssumeRoleWithWebIdentityResult,
}

#[derive(Debug, Deserialize)]
struct AssumeRoleWithWebIdentityResult {
    #[serde(rename = "Credentials")]
    credentials: StsCredentials,
}

#[derive(Deserialize)]
struct StsCredentials {
    #[serde(rename = "AccessKeyId")]
    access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    secret_access_key: String,
    #[serde(rename = "SessionToken")]
    session_token: String,
    #[serde(rename = "Expiration")]
    expiration: String,
}

impl std::fmt::Debug for StsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

/// Role session name for a policy, capped at the STS limit.
pub fn role_session_name(policy_name: &str) -> String {
    format!("{}{}", SESSION_NAME_PREFIX, policy_name)
        .chars()
        .take(MAX_SESSION_NAME_LEN)
        .collect()
}

fn parse_timestamp(value: &str, what: &str) -> Result<DateTime<Utc>, RotationError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RotationError::Exchange(format!("invalid {} {:?}: {}", what, value, e)))
}

/// AWS STS web identity federation
pub struct AwsStsExchanger {
    http: reqwest::Client,
    sts_endpoint: String,
    role_arn: String,
    region: String,
    session_name: String,
}

impl AwsStsExchanger {
    pub fn new(
        http: reqwest::Client,
        endpoints: &Endpoints,
        role_arn: &str,
        region: &str,
        policy_name: &str,
    ) -> Self {
        Self {
            http,
            sts_endpoint: endpoints.aws_sts_for(region),
            role_arn: role_arn.to_string(),
            region: region.to_string(),
            session_name: role_session_name(policy_name),
        }
    }
}

#[async_trait]
impl IdentityExchanger for AwsStsExchanger {
    async fn exchange(&self, token: &FederatedToken) -> Result<RotatedCredential, RotationError> {
        let sts_url = format!(
            "{}/?Action=AssumeRoleWithWebIdentity&Version={}&RoleArn={}&RoleSessionName={}&WebIdentityToken={}",
            self.sts_endpoint,
            STS_API_VERSION,
            urlencoding::encode(&self.role_arn),
            urlencoding::encode(&self.session_name),
            urlencoding::encode(&token.token)
        );

        let response = self.http.get(&sts_url).send().await.map_err(|e| {
            RotationError::Exchange(format!("failed to call AWS STS: {}", e))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RotationError::Exchange(format!(
                "AWS STS failed with {}: {}",
                status, body
            )));
        }

        let body = response.text().await?;
        let parsed: AssumeRoleWithWebIdentityResponse = quick_xml::de::from_str(&body)
            .map_err(|e| {
                RotationError::Exchange(format!("failed to parse AWS STS XML response: {}", e))
            })?;
        let creds = parsed.result.credentials;
        let expires_at = parse_timestamp(&creds.expiration, "AWS STS expiration")?;

        info!(role_arn = %self.role_arn, expires_at = %expires_at, "AWS credentials obtained via web identity");

        Ok(RotatedCredential {
            payload: CredentialPayload::Aws {
                access_key_id: creds.access_key_id,
                secret_access_key: creds.secret_access_key,
                session_token: creds.session_token,
                region: self.region.clone(),
            },
            expires_at,
        })
    }
}

/// Microsoft Entra ID federated identity credential
pub struct AzureFederatedExchanger {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    clock: Arc<dyn Clock>,
}

impl AzureFederatedExchanger {
    pub fn new(
        http: reqwest::Client,
        endpoints: &Endpoints,
        tenant_id: &str,
        client_id: &str,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http,
            token_url: azure_token_url(&endpoints.azure_authority, tenant_id),
            client_id: client_id.to_string(),
            clock,
        }
    }
}

#[async_trait]
impl IdentityExchanger for AzureFederatedExchanger {
    async fn exchange(&self, token: &FederatedToken) -> Result<RotatedCredential, RotationError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_assertion_type", JWT_ASSERTION_TYPE),
            ("client_assertion", token.token.as_str()),
            ("scope", AZURE_COGNITIVE_SERVICES_SCOPE),
        ];

        let response =
            request_token(&self.http, &self.token_url, &form, RotationError::Exchange).await?;
        let expires_at = response.expires_at(self.clock.now(), RotationError::Exchange)?;

        info!(client_id = %self.client_id, expires_at = %expires_at, "Azure credentials obtained via federated identity");

        Ok(RotatedCredential {
            payload: CredentialPayload::Azure {
                access_token: response.access_token,
            },
            expires_at,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
    access_token: String,
    expire_time: String,
}

/// GCP workload identity federation, optionally impersonating a service account
pub struct GcpWorkloadIdentityExchanger {
    http: reqwest::Client,
    sts_url: String,
    iam_credentials_url: String,
    audience: String,
    impersonated_account: Option<String>,
    project_name: String,
    region: String,
    clock: Arc<dyn Clock>,
}

impl GcpWorkloadIdentityExchanger {
    pub fn new(
        http: reqwest::Client,
        endpoints: &Endpoints,
        gcp: &GcpCredentials,
        federation: &GcpWorkloadIdentityFederation,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http,
            sts_url: endpoints.gcp_sts.clone(),
            iam_credentials_url: endpoints.gcp_iam_credentials.trim_end_matches('/').to_string(),
            audience: federation.sts_audience(),
            impersonated_account: federation
                .service_account_impersonation
                .as_ref()
                .map(|sa| sa.email()),
            project_name: gcp.project_name.clone(),
            region: gcp.region.clone(),
            clock,
        }
    }

    /// Exchange the subject token at GCP STS for a federated access token.
    async fn sts_exchange(&self, subject_token: &str) -> Result<TokenResponse, RotationError> {
        let scope = if self.impersonated_account.is_some() {
            IAM_SCOPE
        } else {
            CLOUD_PLATFORM_SCOPE
        };
        let request = serde_json::json!({
            "grant_type": TOKEN_EXCHANGE_GRANT,
            "subject_token_type": JWT_TOKEN_TYPE,
            "requested_token_type": ACCESS_TOKEN_TYPE,
            "audience": self.audience,
            "subject_token": subject_token,
            "scope": scope,
        });

        let response = self
            .http
            .post(&self.sts_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RotationError::Exchange(format!("failed to call GCP STS: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RotationError::Exchange(format!(
                "GCP STS failed with {}: {}",
                status, body
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| RotationError::Exchange(format!("invalid GCP STS response: {}", e)))
    }

    /// Mint an access token for the impersonated service account.
    async fn impersonate(
        &self,
        email: &str,
        sts_token: &str,
    ) -> Result<(String, DateTime<Utc>), RotationError> {
        let url = format!(
            "{}/v1/projects/-/serviceAccounts/{}:generateAccessToken",
            self.iam_credentials_url, email
        );
        debug!(service_account = %email, "Impersonating service account");

        let response = self
            .http
            .post(&url)
            .bearer_auth(sts_token)
            .json(&serde_json::json!({ "scope": [CLOUD_PLATFORM_SCOPE] }))
            .send()
            .await
            .map_err(|e| {
                RotationError::Exchange(format!("failed to call IAM credentials API: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RotationError::Exchange(format!(
                "service account impersonation of {} failed with {}: {}",
                email, status, body
            )));
        }

        let parsed: GenerateAccessTokenResponse = response.json().await.map_err(|e| {
            RotationError::Exchange(format!("invalid generateAccessToken response: {}", e))
        })?;
        let expires_at = parse_timestamp(&parsed.expire_time, "generateAccessToken expireTime")?;
        Ok((parsed.access_token, expires_at))
    }
}

#[async_trait]
impl IdentityExchanger for GcpWorkloadIdentityExchanger {
    async fn exchange(&self, token: &FederatedToken) -> Result<RotatedCredential, RotationError> {
        let now = self.clock.now();
        let sts = self.sts_exchange(&token.token).await?;

        let (access_token, expires_at) = match &self.impersonated_account {
            Some(email) => self.impersonate(email, &sts.access_token).await?,
            None => {
                let expires_at = sts.expires_at(now, RotationError::Exchange)?;
                (sts.access_token, expires_at)
            }
        };

        info!(project = %self.project_name, expires_at = %expires_at, "GCP credentials obtained via workload identity federation");

        Ok(RotatedCredential {
            payload: CredentialPayload::Gcp {
                access_token,
                project_name: self.project_name.clone(),
                region: self.region.clone(),
            },
            expires_at,
        })
    }
}

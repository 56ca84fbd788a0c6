//! Token Providers
//!
//! Obtain a bearer token and its expiry from an identity source. Providers
//! never retry; the scheduler owns retry. Dropping the returned future
//! cancels any in-flight request.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeDelta, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use super::clock::Clock;
use super::policy::{OidcExchangeToken, SecretReference};
use super::store::SecretSource;
use super::types::{FederatedToken, RotationError};

/// Key of the client secret inside a referenced secret.
pub const CLIENT_SECRET_KEY: &str = "client-secret";

pub(crate) const AZURE_COGNITIVE_SERVICES_SCOPE: &str =
    "https://cognitiveservices.azure.com/.default";

const CLIENT_CREDENTIALS_GRANT: &str = "client_credentials";
const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";
const MAX_EXPIRATION_YEAR: i32 = 9999;

/// Source of federated bearer tokens
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self) -> Result<FederatedToken, RotationError>;
}

/// A secret reference with its namespace resolved against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSecretRef {
    pub namespace: String,
    pub name: String,
}

impl ClientSecretRef {
    pub fn resolve(reference: &SecretReference, policy_namespace: &str) -> Self {
        Self {
            namespace: reference.namespace_or(policy_namespace).to_string(),
            name: reference.name.clone(),
        }
    }

    async fn read(&self, secrets: &dyn SecretSource) -> Result<String, RotationError> {
        secrets
            .secret_value(&self.namespace, &self.name, CLIENT_SECRET_KEY)
            .await
    }
}

/// OAuth2 token endpoint response
#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    /// Absolute expiry; a missing or non-positive lifetime expires immediately.
    ///
    /// The result must stay writable as an RFC 3339 marker, so a lifetime
    /// that overflows or lands past year 9999 is rejected through `wrap`.
    pub fn expires_at(
        &self,
        now: DateTime<Utc>,
        wrap: fn(String) -> RotationError,
    ) -> Result<DateTime<Utc>, RotationError> {
        let secs = match self.expires_in {
            Some(secs) if secs > 0 => secs,
            _ => return Ok(now),
        };
        TimeDelta::try_seconds(secs)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .filter(|expires_at| expires_at.year() <= MAX_EXPIRATION_YEAR)
            .ok_or_else(|| wrap(format!("token lifetime of {}s is out of range", secs)))
    }
}

/// POST a form to an OAuth2 token endpoint and decode the token response.
///
/// `wrap` picks the error variant so exchangers and providers report under
/// their own category.
pub(crate) async fn request_token(
    http: &reqwest::Client,
    url: &str,
    form: &[(&str, &str)],
    wrap: fn(String) -> RotationError,
) -> Result<TokenResponse, RotationError> {
    let response = http
        .post(url)
        .form(form)
        .send()
        .await
        .map_err(|e| wrap(format!("token request to {} failed: {}", url, e)))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(wrap(format!(
            "token request to {} failed with {}: {}",
            url, status, body
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| wrap(format!("invalid token response from {}: {}", url, e)))
}

/// OpenID provider metadata, the subset the exchange needs
#[derive(Debug, Deserialize)]
struct ProviderMetadata {
    #[serde(default)]
    issuer: String,
    #[serde(default)]
    token_endpoint: String,
    #[serde(default)]
    scopes_supported: Vec<String>,
}

/// Client-credentials token from an OIDC issuer
pub struct OidcTokenProvider {
    http: reqwest::Client,
    exchange: OidcExchangeToken,
    client_secret: ClientSecretRef,
    secrets: Arc<dyn SecretSource>,
    clock: Arc<dyn Clock>,
}

impl OidcTokenProvider {
    pub fn new(
        http: reqwest::Client,
        exchange: OidcExchangeToken,
        policy_namespace: &str,
        secrets: Arc<dyn SecretSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let client_secret = ClientSecretRef::resolve(&exchange.oidc.client_secret, policy_namespace);
        Self {
            http,
            exchange,
            client_secret,
            secrets,
            clock,
        }
    }

    fn issuer(&self) -> &str {
        &self.exchange.oidc.provider.issuer
    }

    /// Resolve the token endpoint and the scopes to request.
    async fn discover(&self) -> Result<(String, Vec<String>), RotationError> {
        let issuer = self.issuer();
        let metadata = self
            .fetch_metadata()
            .await
            .map_err(|cause| {
                RotationError::TokenProvider(format!(
                    "failed to create oidc config: {:?}, {}",
                    issuer, cause
                ))
            })?;

        let token_endpoint = match &self.exchange.oidc.provider.token_endpoint {
            Some(endpoint) if !endpoint.is_empty() => endpoint.clone(),
            _ => metadata.token_endpoint,
        };

        let mut scopes = self.exchange.oidc.scopes.clone();
        for scope in metadata.scopes_supported {
            if !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }

        Ok((token_endpoint, scopes))
    }

    async fn fetch_metadata(&self) -> Result<ProviderMetadata, String> {
        let issuer = self.issuer();
        let url = format!("{}{}", issuer.trim_end_matches('/'), DISCOVERY_PATH);
        debug!(url = %url, "Fetching OIDC provider metadata");

        let response = self.http.get(&url).send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("discovery returned {}: {}", status, body));
        }

        let metadata: ProviderMetadata = response.json().await.map_err(|e| e.to_string())?;
        if metadata.issuer.is_empty() {
            return Err("provider metadata has no issuer".to_string());
        }
        if metadata.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
            return Err(format!(
                "issuer did not match the issuer returned by provider, expected {:?} got {:?}",
                issuer, metadata.issuer
            ));
        }
        let has_override = self
            .exchange
            .oidc
            .provider
            .token_endpoint
            .as_deref()
            .is_some_and(|e| !e.is_empty());
        if metadata.token_endpoint.is_empty() && !has_override {
            return Err("provider metadata has no token_endpoint".to_string());
        }
        Ok(metadata)
    }
}

#[async_trait]
impl TokenProvider for OidcTokenProvider {
    async fn get_token(&self) -> Result<FederatedToken, RotationError> {
        let (token_endpoint, scopes) = self.discover().await?;
        let client_secret = self.client_secret.read(self.secrets.as_ref()).await?;

        let grant_type = self
            .exchange
            .grant_type
            .as_deref()
            .filter(|g| !g.is_empty())
            .unwrap_or(CLIENT_CREDENTIALS_GRANT);
        let scope = scopes.join(" ");

        let mut form = vec![
            ("grant_type", grant_type),
            ("client_id", self.exchange.oidc.client_id.as_str()),
            ("client_secret", client_secret.as_str()),
        ];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }
        if let Some(aud) = self.exchange.aud.as_deref().filter(|a| !a.is_empty()) {
            form.push(("audience", aud));
        }

        let response =
            request_token(&self.http, &token_endpoint, &form, RotationError::TokenProvider).await?;
        let expires_at = response.expires_at(self.clock.now(), RotationError::TokenProvider)?;
        debug!(issuer = %self.issuer(), expires_at = %expires_at, "Obtained OIDC token");

        Ok(FederatedToken::new(response.access_token, expires_at))
    }
}

/// Azure access token from a client secret, no federation hop
pub struct AzureClientSecretTokenProvider {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: ClientSecretRef,
    secrets: Arc<dyn SecretSource>,
    clock: Arc<dyn Clock>,
}

impl AzureClientSecretTokenProvider {
    pub fn new(
        http: reqwest::Client,
        authority: &str,
        tenant_id: &str,
        client_id: &str,
        client_secret: ClientSecretRef,
        secrets: Arc<dyn SecretSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http,
            token_url: azure_token_url(authority, tenant_id),
            client_id: client_id.to_string(),
            client_secret,
            secrets,
            clock,
        }
    }
}

#[async_trait]
impl TokenProvider for AzureClientSecretTokenProvider {
    async fn get_token(&self) -> Result<FederatedToken, RotationError> {
        let client_secret = self.client_secret.read(self.secrets.as_ref()).await?;
        let form = [
            ("grant_type", CLIENT_CREDENTIALS_GRANT),
            ("client_id", self.client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("scope", AZURE_COGNITIVE_SERVICES_SCOPE),
        ];

        let response =
            request_token(&self.http, &self.token_url, &form, RotationError::TokenProvider).await?;
        let expires_at = response.expires_at(self.clock.now(), RotationError::TokenProvider)?;
        Ok(FederatedToken::new(response.access_token, expires_at))
    }
}

/// Microsoft Entra ID v2 token endpoint for a tenant.
pub(crate) fn azure_token_url(authority: &str, tenant_id: &str) -> String {
    format!(
        "{}/{}/oauth2/v2.0/token",
        authority.trim_end_matches('/'),
        tenant_id
    )
}

/// Returns a preset token or error.
#[cfg(test)]
pub struct FixedTokenProvider {
    result: Result<FederatedToken, String>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FixedTokenProvider {
    pub fn new(token: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            result: Ok(FederatedToken::new(token, expires_at)),
            calls: Default::default(),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
            calls: Default::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl TokenProvider for FixedTokenProvider {
    async fn get_token(&self) -> Result<FederatedToken, RotationError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.result.clone().map_err(RotationError::TokenProvider)
    }
}

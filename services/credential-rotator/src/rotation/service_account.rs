//! GCP Service Account Key Token Source
//!
//! Mints a GCP access token directly from service account key material using
//! the OAuth2 JWT bearer grant. No OIDC hop and no exchange step.

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::clock::Clock;
use super::store::SecretSource;
use super::token_provider::{request_token, TokenProvider};
use super::types::{FederatedToken, RotationError};

/// Key of the service account JSON inside the referenced secret.
pub const SERVICE_ACCOUNT_KEY: &str = "service_account.json";

pub(crate) const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// A GCP service account key file
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    pub fn from_json(json: &str) -> Result<Self, RotationError> {
        serde_json::from_str(json).map_err(|e| {
            RotationError::TokenProvider(format!("invalid service account key: {}", e))
        })
    }

    /// Sign a JWT bearer assertion for the token endpoint.
    pub fn assertion(&self, issued_at: i64) -> Result<String, RotationError> {
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: &self.token_uri,
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.private_key_id.clone();

        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes()).map_err(|e| {
            RotationError::TokenProvider(format!(
                "failed to parse private key of {}: {}",
                self.client_email, e
            ))
        })?;

        encode(&header, &claims, &key).map_err(|e| {
            RotationError::TokenProvider(format!("failed to sign assertion: {}", e))
        })
    }
}

/// JWT claims of a service account assertion
#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Access tokens minted from a service account key stored in a secret
pub struct GcpServiceAccountTokenProvider {
    http: reqwest::Client,
    secret_namespace: String,
    secret_name: String,
    secrets: Arc<dyn SecretSource>,
    clock: Arc<dyn Clock>,
}

impl GcpServiceAccountTokenProvider {
    pub fn new(
        http: reqwest::Client,
        secret_namespace: &str,
        secret_name: &str,
        secrets: Arc<dyn SecretSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http,
            secret_namespace: secret_namespace.to_string(),
            secret_name: secret_name.to_string(),
            secrets,
            clock,
        }
    }
}

#[async_trait]
impl TokenProvider for GcpServiceAccountTokenProvider {
    async fn get_token(&self) -> Result<FederatedToken, RotationError> {
        let raw = self
            .secrets
            .secret_value(&self.secret_namespace, &self.secret_name, SERVICE_ACCOUNT_KEY)
            .await?;
        let key = ServiceAccountKey::from_json(&raw)?;

        let now = self.clock.now();
        let assertion = key.assertion(now.timestamp())?;
        let form = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];

        debug!(client_email = %key.client_email, "Requesting service account access token");
        let response =
            request_token(&self.http, &key.token_uri, &form, RotationError::TokenProvider).await?;
        let expires_at = response.expires_at(now, RotationError::TokenProvider)?;

        Ok(FederatedToken::new(response.access_token, expires_at))
    }
}

//! Shared types for credential rotation
//!
//! Tokens, rotated credential material, and the error taxonomy used by every
//! rotator.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

/// Data key holding the AWS shared credentials file.
pub const AWS_CREDENTIALS_KEY: &str = "credentials";
/// Data key holding an Azure access token.
pub const AZURE_ACCESS_TOKEN_KEY: &str = "azureAccessToken";
/// Data key holding a GCP access token.
pub const GCP_ACCESS_TOKEN_KEY: &str = "gcpAccessToken";
/// Data key holding the GCP project name.
pub const GCP_PROJECT_NAME_KEY: &str = "projectName";
/// Data key holding the GCP region.
pub const GCP_REGION_KEY: &str = "region";

const AWS_DEFAULT_PROFILE: &str = "default";

/// Cloud a credential is minted for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudProvider {
    Aws,
    Azure,
    Gcp,
}

impl std::fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloudProvider::Aws => write!(f, "aws"),
            CloudProvider::Azure => write!(f, "azure"),
            CloudProvider::Gcp => write!(f, "gcp"),
        }
    }
}

/// A bearer token and the instant it stops being valid.
///
/// Only lives for the duration of one rotation attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct FederatedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl FederatedToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }
}

impl std::fmt::Debug for FederatedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederatedToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Cloud-native credential material as it is persisted
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialPayload {
    /// Temporary AWS keys, persisted as a shared credentials file
    Aws {
        access_key_id: String,
        secret_access_key: String,
        session_token: String,
        region: String,
    },
    /// Azure bearer token
    Azure { access_token: String },
    /// GCP bearer token plus the project/region the gateway needs to build URLs
    Gcp {
        access_token: String,
        project_name: String,
        region: String,
    },
}

impl CredentialPayload {
    pub fn provider(&self) -> CloudProvider {
        match self {
            CredentialPayload::Aws { .. } => CloudProvider::Aws,
            CredentialPayload::Azure { .. } => CloudProvider::Azure,
            CredentialPayload::Gcp { .. } => CloudProvider::Gcp,
        }
    }

    /// Render the payload into the secret data fields.
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        match self {
            CredentialPayload::Aws {
                access_key_id,
                secret_access_key,
                session_token,
                region,
            } => {
                fields.insert(
                    AWS_CREDENTIALS_KEY.to_string(),
                    format!(
                        "[{}]\naws_access_key_id = {}\naws_secret_access_key = {}\naws_session_token = {}\nregion = {}\n",
                        AWS_DEFAULT_PROFILE, access_key_id, secret_access_key, session_token, region
                    ),
                );
            }
            CredentialPayload::Azure { access_token } => {
                fields.insert(AZURE_ACCESS_TOKEN_KEY.to_string(), access_token.clone());
            }
            CredentialPayload::Gcp {
                access_token,
                project_name,
                region,
            } => {
                fields.insert(GCP_ACCESS_TOKEN_KEY.to_string(), access_token.clone());
                fields.insert(GCP_PROJECT_NAME_KEY.to_string(), project_name.clone());
                fields.insert(GCP_REGION_KEY.to_string(), region.clone());
            }
        }
        fields
    }
}

impl std::fmt::Debug for CredentialPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialPayload::Aws {
                access_key_id,
                region,
                ..
            } => f
                .debug_struct("Aws")
                .field("access_key_id", access_key_id)
                .field("region", region)
                .finish_non_exhaustive(),
            CredentialPayload::Azure { .. } => f.debug_struct("Azure").finish_non_exhaustive(),
            CredentialPayload::Gcp {
                project_name,
                region,
                ..
            } => f
                .debug_struct("Gcp")
                .field("project_name", project_name)
                .field("region", region)
                .finish_non_exhaustive(),
        }
    }
}

/// A short-lived credential plus its absolute expiration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatedCredential {
    pub payload: CredentialPayload,
    pub expires_at: DateTime<Utc>,
}

/// Errors that can occur while rotating credentials
#[derive(Debug, Error)]
pub enum RotationError {
    /// The policy cannot be rotated as written; not retried until it changes
    #[error("invalid rotation configuration: {0}")]
    Config(String),

    /// No credential has been stored for the policy yet
    #[error("credential secret {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    /// The stored expiration marker is missing or unparsable
    #[error("malformed expiration annotation on {key}: {value:?}: {reason}")]
    MalformedExpiration {
        key: String,
        value: Option<String>,
        reason: String,
    },

    /// Identity provider discovery or token request failed
    #[error("{0}")]
    TokenProvider(String),

    /// Cloud federation exchange failed
    #[error("{0}")]
    Exchange(String),

    /// Credential store read or write failed
    #[error("credential store error: {0}")]
    Store(String),

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RotationError {
    pub fn config(msg: impl Into<String>) -> Self {
        RotationError::Config(msg.into())
    }

    pub fn is_config(&self) -> bool {
        matches!(self, RotationError::Config(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RotationError::NotFound { .. })
    }

    /// Everything except a configuration error is recovered by the fixed retry.
    pub fn is_transient(&self) -> bool {
        !self.is_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aws_payload_renders_credentials_file() {
        let payload = CredentialPayload::Aws {
            access_key_id: "AKIA123".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: "session".to_string(),
            region: "us-east-1".to_string(),
        };

        let fields = payload.to_fields();
        assert_eq!(fields.len(), 1);
        assert_eq!(
            fields.get(AWS_CREDENTIALS_KEY).map(String::as_str),
            Some("[default]\naws_access_key_id = AKIA123\naws_secret_access_key = secret\naws_session_token = session\nregion = us-east-1\n")
        );
    }

    #[test]
    fn test_gcp_payload_fields() {
        let payload = CredentialPayload::Gcp {
            access_token: "ya29.token".to_string(),
            project_name: "my-project".to_string(),
            region: "us-central1".to_string(),
        };

        let fields = payload.to_fields();
        assert_eq!(fields.get(GCP_ACCESS_TOKEN_KEY).map(String::as_str), Some("ya29.token"));
        assert_eq!(fields.get(GCP_PROJECT_NAME_KEY).map(String::as_str), Some("my-project"));
        assert_eq!(fields.get(GCP_REGION_KEY).map(String::as_str), Some("us-central1"));
        assert_eq!(payload.provider(), CloudProvider::Gcp);
    }

    #[test]
    fn test_debug_output_redacts_secrets() {
        let payload = CredentialPayload::Azure {
            access_token: "super-secret-token".to_string(),
        };
        let token = FederatedToken::new("another-secret", Utc::now());

        assert!(!format!("{:?}", payload).contains("super-secret-token"));
        assert!(!format!("{:?}", token).contains("another-secret"));
    }

    #[test]
    fn test_error_classification() {
        assert!(RotationError::config("missing role").is_config());
        assert!(!RotationError::config("missing role").is_transient());

        let not_found = RotationError::NotFound {
            namespace: "default".to_string(),
            name: "ai-eg-bsp-test".to_string(),
        };
        assert!(not_found.is_not_found());
        assert!(not_found.is_transient());
        assert!(RotationError::Exchange("sts down".to_string()).is_transient());
    }
}

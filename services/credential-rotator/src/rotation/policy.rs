//! Backend security policy descriptors
//!
//! The externally managed input of the rotation engine. Field names follow
//! the `BackendSecurityPolicy` custom resource so a policy can be read
//! straight from the cluster or from a JSON file.

use serde::{Deserialize, Serialize};

/// Auth mechanism tag of a policy.
///
/// Unknown tags are kept verbatim so the scheduler can report them instead of
/// failing at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PolicyType {
    ApiKey,
    AwsCredentials,
    AzureApiKey,
    AnthropicApiKey,
    AzureCredentials,
    GcpCredentials,
    Other(String),
}

impl PolicyType {
    pub fn as_str(&self) -> &str {
        match self {
            PolicyType::ApiKey => "APIKey",
            PolicyType::AwsCredentials => "AWSCredentials",
            PolicyType::AzureApiKey => "AzureAPIKey",
            PolicyType::AnthropicApiKey => "AnthropicAPIKey",
            PolicyType::AzureCredentials => "AzureCredentials",
            PolicyType::GcpCredentials => "GCPCredentials",
            PolicyType::Other(other) => other,
        }
    }
}

impl From<String> for PolicyType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "APIKey" => PolicyType::ApiKey,
            "AWSCredentials" => PolicyType::AwsCredentials,
            "AzureAPIKey" => PolicyType::AzureApiKey,
            "AnthropicAPIKey" => PolicyType::AnthropicApiKey,
            "AzureCredentials" => PolicyType::AzureCredentials,
            "GCPCredentials" => PolicyType::GcpCredentials,
            _ => PolicyType::Other(value),
        }
    }
}

impl From<&str> for PolicyType {
    fn from(value: &str) -> Self {
        PolicyType::from(value.to_string())
    }
}

impl From<PolicyType> for String {
    fn from(value: PolicyType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for PolicyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a Kubernetes Secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    /// Defaults to the namespace of the policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl SecretReference {
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcProvider {
    pub issuer: String,
    /// Overrides the discovered token endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
}

/// Client credentials used against an OIDC issuer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcConfig {
    pub provider: OidcProvider,
    #[serde(rename = "clientID")]
    pub client_id: String,
    /// Secret holding the client secret under the `client-secret` key
    pub client_secret: SecretReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcExchangeToken {
    pub oidc: OidcConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsOidcExchangeToken {
    #[serde(flatten)]
    pub exchange: OidcExchangeToken,
    pub aws_role_arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsCredentialsFile {
    pub secret_ref: SecretReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsCredentials {
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<AwsCredentialsFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc_exchange_token: Option<AwsOidcExchangeToken>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureCredentials {
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "tenantID")]
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_ref: Option<SecretReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc_exchange_token: Option<OidcExchangeToken>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpCredentialsFile {
    /// Secret holding the key under `service_account.json`
    pub secret_ref: SecretReference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpServiceAccountImpersonation {
    pub service_account_name: String,
    pub service_account_project_name: String,
}

impl GcpServiceAccountImpersonation {
    pub fn email(&self) -> String {
        format!(
            "{}@{}.iam.gserviceaccount.com",
            self.service_account_name, self.service_account_project_name
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpWorkloadIdentityFederation {
    #[serde(rename = "projectID")]
    pub project_id: String,
    pub workload_identity_pool_name: String,
    pub workload_identity_provider_name: String,
    pub oidc_exchange_token: OidcExchangeToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_impersonation: Option<GcpServiceAccountImpersonation>,
}

impl GcpWorkloadIdentityFederation {
    /// STS audience identifying the workload identity provider.
    pub fn sts_audience(&self) -> String {
        format!(
            "//iam.googleapis.com/projects/{}/locations/global/workloadIdentityPools/{}/providers/{}",
            self.project_id, self.workload_identity_pool_name, self.workload_identity_provider_name
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpCredentials {
    pub project_name: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<GcpCredentialsFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_identity_federation_config: Option<GcpWorkloadIdentityFederation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(rename = "type")]
    pub policy_type: PolicyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_credentials: Option<AwsCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_credentials: Option<AzureCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp_credentials: Option<GcpCredentials>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMetadata {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

/// A backend security policy, immutable for the duration of one tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPolicy {
    pub metadata: PolicyMetadata,
    pub spec: PolicySpec,
}

impl CredentialPolicy {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, spec: PolicySpec) -> Self {
        Self {
            metadata: PolicyMetadata {
                name: name.into(),
                namespace: namespace.into(),
            },
            spec,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn policy_type(&self) -> &PolicyType {
        &self.spec.policy_type
    }

    /// The OIDC exchange configuration of the policy, if it is federated.
    pub fn oidc_exchange(&self) -> Option<&OidcExchangeToken> {
        match self.spec.policy_type {
            PolicyType::AwsCredentials => self
                .spec
                .aws_credentials
                .as_ref()
                .and_then(|aws| aws.oidc_exchange_token.as_ref())
                .map(|token| &token.exchange),
            PolicyType::AzureCredentials => self
                .spec
                .azure_credentials
                .as_ref()
                .and_then(|azure| azure.oidc_exchange_token.as_ref()),
            PolicyType::GcpCredentials => self
                .spec
                .gcp_credentials
                .as_ref()
                .and_then(|gcp| gcp.workload_identity_federation_config.as_ref())
                .map(|wif| &wif.oidc_exchange_token),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_policy_type_round_trips() {
        let spec: PolicySpec = serde_json::from_str(r#"{"type": "Kerberos"}"#).unwrap();
        assert_eq!(spec.policy_type, PolicyType::Other("Kerberos".to_string()));
        assert_eq!(spec.policy_type.to_string(), "Kerberos");

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "Kerberos");
    }

    #[test]
    fn test_parse_aws_oidc_policy() {
        let policy: CredentialPolicy = serde_json::from_str(
            r#"{
                "metadata": {"name": "bedrock", "namespace": "ai"},
                "spec": {
                    "type": "AWSCredentials",
                    "awsCredentials": {
                        "region": "us-east-1",
                        "oidcExchangeToken": {
                            "oidc": {
                                "provider": {"issuer": "https://issuer.example.com"},
                                "clientID": "client",
                                "clientSecret": {"name": "oidc-secret"}
                            },
                            "aud": "sts.amazonaws.com",
                            "awsRoleArn": "arn:aws:iam::123456789012:role/bedrock"
                        }
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(policy.name(), "bedrock");
        assert_eq!(policy.namespace(), "ai");
        assert_eq!(policy.policy_type(), &PolicyType::AwsCredentials);

        let aws = policy.spec.aws_credentials.as_ref().unwrap();
        let token = aws.oidc_exchange_token.as_ref().unwrap();
        assert_eq!(token.aws_role_arn, "arn:aws:iam::123456789012:role/bedrock");
        assert_eq!(token.exchange.aud.as_deref(), Some("sts.amazonaws.com"));
        assert_eq!(token.exchange.oidc.client_secret.namespace_or("ai"), "ai");
        assert!(policy.oidc_exchange().is_some());
    }

    #[test]
    fn test_namespace_defaults() {
        let policy: CredentialPolicy =
            serde_json::from_str(r#"{"metadata": {"name": "k"}, "spec": {"type": "APIKey"}}"#)
                .unwrap();
        assert_eq!(policy.namespace(), "default");
        assert!(policy.oidc_exchange().is_none());
    }

    #[test]
    fn test_gcp_sts_audience_and_service_account_email() {
        let wif = GcpWorkloadIdentityFederation {
            project_id: "123456".to_string(),
            workload_identity_pool_name: "pool".to_string(),
            workload_identity_provider_name: "provider".to_string(),
            oidc_exchange_token: OidcExchangeToken {
                oidc: OidcConfig {
                    provider: OidcProvider {
                        issuer: "https://issuer".to_string(),
                        token_endpoint: None,
                    },
                    client_id: "id".to_string(),
                    client_secret: SecretReference {
                        name: "s".to_string(),
                        namespace: None,
                    },
                    scopes: vec![],
                },
                grant_type: None,
                aud: None,
            },
            service_account_impersonation: Some(GcpServiceAccountImpersonation {
                service_account_name: "gateway".to_string(),
                service_account_project_name: "my-project".to_string(),
            }),
        };

        assert_eq!(
            wif.sts_audience(),
            "//iam.googleapis.com/projects/123456/locations/global/workloadIdentityPools/pool/providers/provider"
        );
        assert_eq!(
            wif.service_account_impersonation.unwrap().email(),
            "gateway@my-project.iam.gserviceaccount.com"
        );
    }
}

//! Credential Store
//!
//! Persists rotated credentials as Kubernetes Secrets. Each policy owns at
//! most one Secret; writes are upserts stamped with a single RFC 3339
//! expiration annotation.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::types::{CredentialPayload, RotationError};

/// Annotation carrying the absolute expiration of the stored credential.
pub const EXPIRATION_ANNOTATION_KEY: &str = "aigateway.envoyproxy.io/credential-expiration-time";

const SECRET_NAME_PREFIX: &str = "ai-eg-bsp-";
const OIDC_SECRET_SUFFIX: &str = "-oidc";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY_VALUE: &str = "credential-rotator";

/// Namespaced name of the record holding a policy's rotated credential
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CredentialKey {
    pub namespace: String,
    pub name: String,
}

impl CredentialKey {
    /// Derive the key for a policy. Federated credentials get their own
    /// suffix so they never collide with a static credential of the same
    /// policy name.
    pub fn for_policy(policy_name: &str, namespace: &str, federated: bool) -> Self {
        let suffix = if federated { OIDC_SECRET_SUFFIX } else { "" };
        Self {
            namespace: namespace.to_string(),
            name: format!("{}{}{}", SECRET_NAME_PREFIX, policy_name, suffix),
        }
    }
}

impl std::fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Format an expiration timestamp the way it is stored.
pub fn format_expiration(expires_at: DateTime<Utc>) -> String {
    expires_at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A credential record as read back from the store
#[derive(Clone, PartialEq, Eq)]
pub struct StoredCredential {
    pub key: CredentialKey,
    pub fields: BTreeMap<String, String>,
    /// Raw expiration annotation, if present
    pub expiration: Option<String>,
}

impl StoredCredential {
    /// Parse the expiration marker.
    pub fn expires_at(&self) -> Result<DateTime<Utc>, RotationError> {
        let raw = self
            .expiration
            .as_deref()
            .ok_or_else(|| RotationError::MalformedExpiration {
                key: self.key.to_string(),
                value: None,
                reason: format!("annotation {} is missing", EXPIRATION_ANNOTATION_KEY),
            })?;

        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| RotationError::MalformedExpiration {
                key: self.key.to_string(),
                value: Some(raw.to_string()),
                reason: e.to_string(),
            })
    }
}

impl std::fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredential")
            .field("key", &self.key)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Read and upsert rotated credentials.
///
/// A failed upsert must leave the previously stored credential authoritative.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn lookup(&self, key: &CredentialKey) -> Result<Option<StoredCredential>, RotationError>;

    async fn upsert(
        &self,
        key: &CredentialKey,
        payload: &CredentialPayload,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RotationError>;
}

/// Read individual values out of user-provided secrets (client secrets,
/// service account keys).
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn secret_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<String, RotationError>;
}

/// Kubernetes Secret backed store
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl CredentialStore for KubeSecretStore {
    async fn lookup(&self, key: &CredentialKey) -> Result<Option<StoredCredential>, RotationError> {
        debug!(namespace = %key.namespace, name = %key.name, "Looking up credential secret");

        match self.api(&key.namespace).get_opt(&key.name).await? {
            Some(secret) => Ok(Some(stored_from_secret(key, &secret)?)),
            None => Ok(None),
        }
    }

    async fn upsert(
        &self,
        key: &CredentialKey,
        payload: &CredentialPayload,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RotationError> {
        let api = self.api(&key.namespace);

        match api.get_opt(&key.name).await? {
            Some(existing) => {
                info!(namespace = %key.namespace, name = %key.name, "Updating credential secret");
                // Carries the observed resourceVersion, so a concurrent writer
                // turns this into a conflict instead of a silent overwrite.
                let secret = apply_payload(existing, payload, expires_at);
                api.replace(&key.name, &PostParams::default(), &secret)
                    .await
                    .map_err(|e| {
                        RotationError::Store(format!("failed to update secret {}: {}", key, e))
                    })?;
            }
            None => {
                info!(namespace = %key.namespace, name = %key.name, "Creating credential secret");
                let secret = new_credential_secret(key, payload, expires_at);
                api.create(&PostParams::default(), &secret)
                    .await
                    .map_err(|e| {
                        RotationError::Store(format!("failed to create secret {}: {}", key, e))
                    })?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl SecretSource for KubeSecretStore {
    async fn secret_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<String, RotationError> {
        let secret = self.api(namespace).get_opt(name).await?.ok_or_else(|| {
            RotationError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        })?;

        let fields = decode_data(&secret)
            .map_err(|e| RotationError::Store(format!("secret {}/{}: {}", namespace, name, e)))?;
        fields.get(key).cloned().ok_or_else(|| {
            RotationError::Store(format!(
                "secret {}/{} has no {:?} key",
                namespace, name, key
            ))
        })
    }
}

fn new_credential_secret(
    key: &CredentialKey,
    payload: &CredentialPayload,
    expires_at: DateTime<Utc>,
) -> Secret {
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };
    apply_payload(secret, payload, expires_at)
}

/// Replace the data wholesale and restamp the expiration annotation.
fn apply_payload(mut secret: Secret, payload: &CredentialPayload, expires_at: DateTime<Utc>) -> Secret {
    secret
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(
            EXPIRATION_ANNOTATION_KEY.to_string(),
            format_expiration(expires_at),
        );
    secret.data = Some(
        payload
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k, ByteString(v.into_bytes())))
            .collect(),
    );
    secret.string_data = None;
    secret
}

fn decode_data(secret: &Secret) -> Result<BTreeMap<String, String>, String> {
    let mut fields = BTreeMap::new();
    for (k, v) in secret.data.iter().flatten() {
        let value = String::from_utf8(v.0.clone())
            .map_err(|_| format!("data key {:?} is not valid UTF-8", k))?;
        fields.insert(k.clone(), value);
    }
    Ok(fields)
}

fn stored_from_secret(key: &CredentialKey, secret: &Secret) -> Result<StoredCredential, RotationError> {
    let fields = decode_data(secret)
        .map_err(|e| RotationError::Store(format!("secret {}: {}", key, e)))?;
    let expiration = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(EXPIRATION_ANNOTATION_KEY))
        .cloned();

    Ok(StoredCredential {
        key: key.clone(),
        fields,
        expiration,
    })
}

/// In-memory store for tests
#[cfg(test)]
#[derive(Default)]
pub struct InMemoryStore {
    credentials: std::sync::Mutex<std::collections::HashMap<CredentialKey, StoredCredential>>,
    secrets: std::sync::Mutex<std::collections::HashMap<(String, String), BTreeMap<String, String>>>,
    fail_writes: std::sync::atomic::AtomicBool,
    writes: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user-provided secret value.
    pub fn insert_secret(&self, namespace: &str, name: &str, key: &str, value: &str) {
        self.secrets
            .lock()
            .unwrap()
            .entry((namespace.to_string(), name.to_string()))
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &CredentialKey) -> Option<StoredCredential> {
        self.credentials.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.credentials.lock().unwrap().len()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Overwrite the raw expiration marker of a stored credential.
    pub fn set_expiration_marker(&self, key: &CredentialKey, marker: Option<&str>) {
        if let Some(stored) = self.credentials.lock().unwrap().get_mut(key) {
            stored.expiration = marker.map(str::to_string);
        }
    }

    pub fn put(&self, key: &CredentialKey, payload: &CredentialPayload, expires_at: DateTime<Utc>) {
        self.credentials.lock().unwrap().insert(
            key.clone(),
            StoredCredential {
                key: key.clone(),
                fields: payload.to_fields(),
                expiration: Some(format_expiration(expires_at)),
            },
        );
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl CredentialStore for InMemoryStore {
    async fn lookup(&self, key: &CredentialKey) -> Result<Option<StoredCredential>, RotationError> {
        Ok(self.get(key))
    }

    async fn upsert(
        &self,
        key: &CredentialKey,
        payload: &CredentialPayload,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RotationError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RotationError::Store(format!("write to {} rejected", key)));
        }
        self.writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.put(key, payload, expires_at);
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl SecretSource for InMemoryStore {
    async fn secret_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<String, RotationError> {
        let secrets = self.secrets.lock().unwrap();
        let data = secrets
            .get(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| RotationError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        data.get(key).cloned().ok_or_else(|| {
            RotationError::Store(format!("secret {}/{} has no {:?} key", namespace, name, key))
        })
    }
}

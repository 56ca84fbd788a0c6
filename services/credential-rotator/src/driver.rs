//! Reconciliation Driver
//!
//! Feeds one policy into the scheduler, tick after tick. The policy is
//! re-read before every tick so spec changes are picked up, and ticks run
//! one at a time.

use anyhow::{anyhow, Context, Result};
use kube::api::{Api, DynamicObject};
use kube::discovery::ApiResource;
use kube::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::rotation::{CredentialPolicy, PolicyMetadata, PolicySpec, RotationScheduler, TickOutcome};

const POLICY_GROUP: &str = "aigateway.envoyproxy.io";
const POLICY_VERSION: &str = "v1alpha1";
const POLICY_KIND: &str = "BackendSecurityPolicy";
const POLICY_PLURAL: &str = "backendsecuritypolicies";

/// `ApiResource` of the `BackendSecurityPolicy` custom resource
pub fn policy_api_resource() -> ApiResource {
    ApiResource {
        group: POLICY_GROUP.to_string(),
        version: POLICY_VERSION.to_string(),
        api_version: format!("{}/{}", POLICY_GROUP, POLICY_VERSION),
        kind: POLICY_KIND.to_string(),
        plural: POLICY_PLURAL.to_string(),
    }
}

/// Where the policy comes from
pub enum PolicySource {
    /// A JSON document on disk
    File(PathBuf),
    /// A `BackendSecurityPolicy` in the cluster
    Cluster {
        client: Client,
        namespace: String,
        name: String,
    },
}

impl PolicySource {
    pub async fn load(&self) -> Result<CredentialPolicy> {
        match self {
            PolicySource::File(path) => load_policy_file(path),
            PolicySource::Cluster {
                client,
                namespace,
                name,
            } => {
                let api: Api<DynamicObject> =
                    Api::namespaced_with(client.clone(), namespace, &policy_api_resource());
                let object = api
                    .get_opt(name)
                    .await
                    .with_context(|| format!("Failed to get policy {}/{}", namespace, name))?
                    .ok_or_else(|| anyhow!("policy {}/{} not found", namespace, name))?;
                policy_from_object(object, namespace)
            }
        }
    }
}

/// Read a policy from a JSON file.
pub fn load_policy_file(path: &Path) -> Result<CredentialPolicy> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read policy file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse policy file {}", path.display()))
}

/// Convert a dynamic `BackendSecurityPolicy` object.
pub fn policy_from_object(object: DynamicObject, default_namespace: &str) -> Result<CredentialPolicy> {
    let name = object
        .metadata
        .name
        .clone()
        .context("policy object has no name")?;
    let namespace = object
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| default_namespace.to_string());

    let spec = object
        .data
        .get("spec")
        .cloned()
        .context("policy object has no spec")?;
    let spec: PolicySpec = serde_json::from_value(spec)
        .with_context(|| format!("Failed to parse spec of policy {}/{}", namespace, name))?;

    Ok(CredentialPolicy {
        metadata: PolicyMetadata { name, namespace },
        spec,
    })
}

/// Delay before the next tick. A zero requeue (nothing to rotate, or an
/// invalid policy) waits the retry interval before the policy is re-read.
pub fn next_delay(outcome: &TickOutcome, retry_interval: Duration) -> Duration {
    if outcome.requeue_after.is_zero() {
        retry_interval
    } else {
        outcome.requeue_after
    }
}

pub struct Driver {
    scheduler: RotationScheduler,
    source: PolicySource,
}

impl Driver {
    pub fn new(scheduler: RotationScheduler, source: PolicySource) -> Self {
        Self { scheduler, source }
    }

    /// Load the policy and run a single tick.
    pub async fn run_once(&self) -> Result<TickOutcome> {
        let policy = self.source.load().await?;
        let outcome = self.scheduler.tick(&policy).await;

        info!(
            namespace = %policy.namespace(),
            name = %policy.name(),
            action = ?outcome.action,
            requeue_after_secs = outcome.requeue_after.as_secs(),
            failed = outcome.error.is_some(),
            "Tick complete"
        );
        Ok(outcome)
    }

    /// Tick forever.
    pub async fn run(&self) -> Result<()> {
        let retry = self.scheduler.retry_interval();

        loop {
            let delay = match self.run_once().await {
                Ok(outcome) => {
                    if let Some(err) = &outcome.error {
                        warn!(
                            error = %err,
                            transient = err.is_transient(),
                            "Tick reported an error"
                        );
                    }
                    next_delay(&outcome, retry)
                }
                Err(e) => {
                    error!(error = %e, "Failed to load policy");
                    retry
                }
            };

            info!(delay_secs = delay.as_secs(), "Sleeping until next tick");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::testing::{InMemoryStore, ManualClock};
    use crate::rotation::{PolicyType, RotationConfig, RotationError, RotatorFactory, TickAction};
    use chrono::{TimeZone, Utc};
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    const API_KEY_POLICY: &str = r#"{
        "metadata": {"name": "openai", "namespace": "ai"},
        "spec": {"type": "APIKey"}
    }"#;

    fn scheduler() -> RotationScheduler {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        ));
        let factory =
            RotatorFactory::new(RotationConfig::default(), store.clone(), store, clock).unwrap();
        RotationScheduler::new(factory)
    }

    fn policy_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_policy_file() {
        let file = policy_file(API_KEY_POLICY);
        let policy = load_policy_file(file.path()).unwrap();

        assert_eq!(policy.name(), "openai");
        assert_eq!(policy.namespace(), "ai");
        assert_eq!(policy.policy_type(), &PolicyType::ApiKey);
    }

    #[test]
    fn test_load_policy_file_errors() {
        let err = load_policy_file(Path::new("/nonexistent/policy.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read policy file"));

        let file = policy_file("{not json");
        let err = load_policy_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse policy file"));
    }

    #[test]
    fn test_policy_from_object() {
        let object: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "aigateway.envoyproxy.io/v1alpha1",
            "kind": "BackendSecurityPolicy",
            "metadata": {"name": "vertex"},
            "spec": {
                "type": "GCPCredentials",
                "gcpCredentials": {
                    "projectName": "my-project",
                    "region": "us-central1",
                    "credentialsFile": {"secretRef": {"name": "gcp-sa"}}
                }
            }
        }))
        .unwrap();

        let policy = policy_from_object(object, "ai").unwrap();
        assert_eq!(policy.name(), "vertex");
        assert_eq!(policy.namespace(), "ai");
        assert_eq!(policy.policy_type(), &PolicyType::GcpCredentials);
        assert_eq!(
            policy.spec.gcp_credentials.unwrap().project_name,
            "my-project"
        );
    }

    #[test]
    fn test_policy_from_object_without_spec() {
        let object: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "aigateway.envoyproxy.io/v1alpha1",
            "kind": "BackendSecurityPolicy",
            "metadata": {"name": "empty", "namespace": "ai"}
        }))
        .unwrap();
        assert!(policy_from_object(object, "ai").is_err());
    }

    #[test]
    fn test_api_resource() {
        let resource = policy_api_resource();
        assert_eq!(resource.api_version, "aigateway.envoyproxy.io/v1alpha1");
        assert_eq!(resource.plural, "backendsecuritypolicies");
    }

    #[test]
    fn test_next_delay() {
        let retry = Duration::from_secs(60);
        let unsupported = TickOutcome {
            action: TickAction::Unsupported,
            requeue_after: Duration::ZERO,
            error: None,
        };
        assert_eq!(next_delay(&unsupported, retry), retry);

        let invalid = TickOutcome {
            action: TickAction::Invalid,
            requeue_after: Duration::ZERO,
            error: Some(RotationError::config("bad")),
        };
        assert_eq!(next_delay(&invalid, retry), retry);

        let not_due = TickOutcome {
            action: TickAction::NotDue,
            requeue_after: Duration::from_secs(3300),
            error: None,
        };
        assert_eq!(next_delay(&not_due, retry), Duration::from_secs(3300));
    }

    #[tokio::test]
    async fn test_run_once_from_file() {
        let file = policy_file(API_KEY_POLICY);
        let driver = Driver::new(scheduler(), PolicySource::File(file.path().to_path_buf()));

        let outcome = driver.run_once().await.unwrap();
        assert_eq!(outcome.action, TickAction::Unsupported);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_run_once_reports_invalid_policy() {
        let file = policy_file(
            r#"{"metadata": {"name": "kerb"}, "spec": {"type": "Kerberos"}}"#,
        );
        let driver = Driver::new(scheduler(), PolicySource::File(file.path().to_path_buf()));

        let outcome = driver.run_once().await.unwrap();
        assert_eq!(outcome.action, TickAction::Invalid);
        let err = outcome.error.unwrap();
        assert!(err.is_config());
        assert!(!err.is_transient());
    }
}

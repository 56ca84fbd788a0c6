//! Credential Rotator - Standalone Binary
//!
//! Keeps the federated cloud credential of one backend security policy fresh.
//! The policy is read from a JSON file or from the cluster; the rotated
//! credential is written to a Kubernetes Secret.

use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use credential_rotator::driver::{Driver, PolicySource};
use credential_rotator::rotation::{KubeSecretStore, ProxySettings, SystemClock};
use credential_rotator::{RotationConfig, RotationScheduler, RotatorFactory};

/// Credential Rotator - rotates federated AWS/Azure/GCP credentials
#[derive(Parser, Debug)]
#[command(name = "credential-rotator", version, about)]
struct Args {
    /// Read the policy from this JSON file instead of the cluster
    #[arg(long, env = "POLICY_FILE", conflicts_with = "name")]
    policy_file: Option<PathBuf>,

    /// Name of the BackendSecurityPolicy to rotate
    #[arg(long, env = "POLICY_NAME")]
    name: Option<String>,

    /// Namespace of the policy
    #[arg(long, default_value = "default", env = "POLICY_NAMESPACE")]
    namespace: String,

    /// Run a single tick and exit
    #[arg(long, default_value = "false")]
    once: bool,

    /// Enable debug logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Delay before retrying a failed tick
    #[arg(long, default_value = "60", env = "RETRY_INTERVAL_SECS")]
    retry_interval_secs: u64,

    /// Timeout for identity provider and cloud token requests
    #[arg(long, default_value = "60", env = "HTTP_TIMEOUT_SECS")]
    http_timeout_secs: u64,

    /// HTTPS proxy for AWS STS
    #[arg(long, env = "AI_GATEWAY_STS_PROXY_URL")]
    aws_sts_proxy_url: Option<String>,

    /// HTTPS proxy for Azure Entra ID
    #[arg(long, env = "AI_GATEWAY_AZURE_PROXY_URL")]
    azure_proxy_url: Option<String>,

    /// HTTPS proxy for GCP STS and IAM Credentials
    #[arg(long, env = "AI_GATEWAY_GCP_AUTH_PROXY_URL")]
    gcp_proxy_url: Option<String>,
}

impl Args {
    fn rotation_config(&self) -> RotationConfig {
        RotationConfig::default()
            .retry_interval(Duration::from_secs(self.retry_interval_secs))
            .http_timeout(Duration::from_secs(self.http_timeout_secs))
            .proxies(ProxySettings {
                aws_sts: non_empty(&self.aws_sts_proxy_url),
                azure: non_empty(&self.azure_proxy_url),
                gcp: non_empty(&self.gcp_proxy_url),
            })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.trim().is_empty())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .json()
        .init();

    info!(
        namespace = %args.namespace,
        name = ?args.name,
        policy_file = ?args.policy_file,
        once = args.once,
        retry_interval_secs = args.retry_interval_secs,
        "Starting credential rotator"
    );

    let client = Client::try_default()
        .await
        .context("Failed to create K8s client")?;

    let source = match (&args.policy_file, &args.name) {
        (Some(path), _) => PolicySource::File(path.clone()),
        (None, Some(name)) => PolicySource::Cluster {
            client: client.clone(),
            namespace: args.namespace.clone(),
            name: name.clone(),
        },
        (None, None) => bail!("either --policy-file or --name must be given"),
    };

    let store = Arc::new(KubeSecretStore::new(client));
    let factory = RotatorFactory::new(
        args.rotation_config(),
        store.clone(),
        store,
        Arc::new(SystemClock),
    )
    .context("Invalid rotation configuration")?;
    let driver = Driver::new(RotationScheduler::new(factory), source);

    if args.once {
        let outcome = driver.run_once().await?;
        if let Some(err) = outcome.error {
            bail!("tick failed: {}", err);
        }
        info!(
            action = ?outcome.action,
            requeue_after_secs = outcome.requeue_after.as_secs(),
            "Single tick complete"
        );
        return Ok(());
    }

    driver.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use credential_rotator::rotation::DEFAULT_PRE_ROTATION_WINDOW;

    #[test]
    fn test_pre_rotation_window_is_fixed() {
        let args = Args::try_parse_from(["credential-rotator", "--name", "bedrock"]).unwrap();
        let config = args.rotation_config();
        assert_eq!(config.pre_rotation_window, DEFAULT_PRE_ROTATION_WINDOW);
        assert_eq!(config.pre_rotation_window, Duration::from_secs(300));

        let overridden = Args::try_parse_from([
            "credential-rotator",
            "--name",
            "bedrock",
            "--pre-rotation-window-secs",
            "10",
        ]);
        assert!(overridden.is_err());
    }

    #[test]
    fn test_rotation_config_from_args() {
        let args = Args::try_parse_from([
            "credential-rotator",
            "--policy-file",
            "policy.json",
            "--retry-interval-secs",
            "30",
            "--azure-proxy-url",
            "http://proxy:3128",
            "--gcp-proxy-url",
            " ",
        ])
        .unwrap();
        let config = args.rotation_config();

        assert_eq!(config.retry_interval, Duration::from_secs(30));
        assert_eq!(config.proxies.azure.as_deref(), Some("http://proxy:3128"));
        assert_eq!(config.proxies.gcp, None);
    }
}

//! Rotation configuration
//!
//! Every interval and endpoint the engine uses is carried here and passed
//! into constructors, so tests can compress timers and point clients at
//! local mock servers.

use chrono::TimeDelta;
use std::time::Duration;

use super::types::RotationError;

/// How long before expiry a credential is rotated.
pub const DEFAULT_PRE_ROTATION_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Fixed retry interval after any failed tick.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);
/// Timeout applied to every identity provider and federation call.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Remote endpoints used by token providers and exchangers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// AWS STS base URL; `None` means the regional `https://sts.<region>.amazonaws.com`
    pub aws_sts: Option<String>,
    /// GCP STS token exchange URL
    pub gcp_sts: String,
    /// GCP IAM Credentials base URL
    pub gcp_iam_credentials: String,
    /// Microsoft Entra ID authority host
    pub azure_authority: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            aws_sts: None,
            gcp_sts: "https://sts.googleapis.com/v1/token".to_string(),
            gcp_iam_credentials: "https://iamcredentials.googleapis.com".to_string(),
            azure_authority: "https://login.microsoftonline.com".to_string(),
        }
    }
}

impl Endpoints {
    /// STS endpoint for the given region.
    pub fn aws_sts_for(&self, region: &str) -> String {
        match &self.aws_sts {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://sts.{}.amazonaws.com", region),
        }
    }
}

/// Optional HTTPS proxies per cloud
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    pub aws_sts: Option<String>,
    pub azure: Option<String>,
    pub gcp: Option<String>,
}

/// Rotation engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationConfig {
    pub pre_rotation_window: Duration,
    pub retry_interval: Duration,
    pub http_timeout: Duration,
    pub endpoints: Endpoints,
    pub proxies: ProxySettings,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            pre_rotation_window: DEFAULT_PRE_ROTATION_WINDOW,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            endpoints: Endpoints::default(),
            proxies: ProxySettings::default(),
        }
    }
}

impl RotationConfig {
    pub fn pre_rotation_window(mut self, window: Duration) -> Self {
        self.pre_rotation_window = window;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn proxies(mut self, proxies: ProxySettings) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn validate(&self) -> Result<(), RotationError> {
        if self.retry_interval.is_zero() {
            return Err(RotationError::config("retry interval must be greater than zero"));
        }
        Ok(())
    }

    /// The pre-rotation window as a signed delta for timestamp arithmetic.
    pub(crate) fn window_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.pre_rotation_window).unwrap_or(TimeDelta::MAX)
    }

    /// Build an HTTP client with the configured timeout and an optional proxy.
    pub(crate) fn http_client(&self, proxy: Option<&str>) -> Result<reqwest::Client, RotationError> {
        let mut builder = reqwest::Client::builder().timeout(self.http_timeout);
        if let Some(url) = proxy {
            let proxy = reqwest::Proxy::all(url)
                .map_err(|e| RotationError::config(format!("invalid proxy URL {}: {}", url, e)))?;
            builder = builder.proxy(proxy);
        }
        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RotationConfig::default();
        assert_eq!(config.pre_rotation_window, Duration::from_secs(300));
        assert_eq!(config.retry_interval, Duration::from_secs(60));
        assert_eq!(config.window_delta(), TimeDelta::minutes(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_retry_interval_rejected() {
        let config = RotationConfig::default().retry_interval(Duration::ZERO);
        assert!(config.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_aws_sts_endpoint() {
        let endpoints = Endpoints::default();
        assert_eq!(
            endpoints.aws_sts_for("eu-west-1"),
            "https://sts.eu-west-1.amazonaws.com"
        );

        let overridden = Endpoints {
            aws_sts: Some("http://127.0.0.1:9000/".to_string()),
            ..Endpoints::default()
        };
        assert_eq!(overridden.aws_sts_for("eu-west-1"), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_invalid_proxy_is_config_error() {
        let config = RotationConfig::default();
        assert!(config.http_client(None).is_ok());
        assert!(config.http_client(Some("not a url")).unwrap_err().is_config());
    }
}

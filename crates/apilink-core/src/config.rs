//! Environment-backed configuration for the API link layer.
//!
//! Every tunable lives here so deployments can move the backend (host, port,
//! path prefix) without touching code.

use std::{env, error::Error, fmt, path::PathBuf, time::Duration};

use crate::retry::RetryPolicy;

const DEFAULT_BASE_URL: &str = "http://localhost:5000";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_UPLOAD_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_RETRY_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 300;
const DEFAULT_RETRY_MULTIPLIER: u32 = 2;
const DEFAULT_PROBE_INTERVAL_MS: u64 = 30_000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_PROBE_PATH: &str = "/api/test-connection";
const DEFAULT_LOGIN_PATH: &str = "/api/login";
const DEFAULT_REGISTER_PATH: &str = "/api/register";
const DEFAULT_PROFILE_PATH: &str = "/api/profile";
const DEFAULT_MAX_TOKEN_AGE_MS: u64 = 24 * 60 * 60 * 1_000;
const DEFAULT_UNREACHABLE_THRESHOLD: u32 = 1;
const DEFAULT_STORAGE_DIR: &str = "./.apilink-store";

/// Runtime configuration shared by every component of the link layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Backend origin, without a trailing slash.
    pub base_url: String,
    /// Timeout applied to ordinary requests.
    pub request_timeout_ms: u64,
    /// Timeout applied to multipart uploads.
    pub upload_timeout_ms: u64,
    /// Retries after the initial attempt for retryable failures.
    pub retry_max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_multiplier: u32,
    /// Interval between background reachability probes.
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub probe_path: String,
    pub login_path: String,
    pub register_path: String,
    pub profile_path: String,
    /// Hard ceiling on token age regardless of any embedded expiry.
    pub max_token_age_ms: u64,
    /// Consecutive failures needed before the backend is declared unreachable.
    pub unreachable_threshold: u32,
    /// Accept `test-` prefixed opaque tokens as never expiring.
    pub allow_test_credentials: bool,
    /// Directory for durable credential/flag storage.
    pub storage_dir: PathBuf,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            upload_timeout_ms: DEFAULT_UPLOAD_TIMEOUT_MS,
            retry_max_retries: DEFAULT_RETRY_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_multiplier: DEFAULT_RETRY_MULTIPLIER,
            probe_interval_ms: DEFAULT_PROBE_INTERVAL_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            probe_path: DEFAULT_PROBE_PATH.to_owned(),
            login_path: DEFAULT_LOGIN_PATH.to_owned(),
            register_path: DEFAULT_REGISTER_PATH.to_owned(),
            profile_path: DEFAULT_PROFILE_PATH.to_owned(),
            max_token_age_ms: DEFAULT_MAX_TOKEN_AGE_MS,
            unreachable_threshold: DEFAULT_UNREACHABLE_THRESHOLD,
            allow_test_credentials: false,
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
        }
    }
}

impl LinkConfig {
    /// Defaults pointed at a specific backend origin.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(&base_url.into()),
            ..Self::default()
        }
    }

    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let base_url = optional_trimmed_env("APILINK_BASE_URL", &mut lookup)
            .map(|value| normalize_base_url(&value))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                key: "APILINK_BASE_URL",
                value: base_url,
                reason: "must start with http:// or https://".to_owned(),
            });
        }

        let request_timeout_ms = positive_u64(
            "APILINK_REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT_MS,
            &mut lookup,
        )?;
        let upload_timeout_ms = positive_u64(
            "APILINK_UPLOAD_TIMEOUT_MS",
            DEFAULT_UPLOAD_TIMEOUT_MS,
            &mut lookup,
        )?;
        let retry_max_retries = parse_with_default(
            "APILINK_RETRY_MAX_RETRIES",
            DEFAULT_RETRY_MAX_RETRIES,
            &mut lookup,
        )?;
        let retry_base_delay_ms = parse_with_default(
            "APILINK_RETRY_BASE_DELAY_MS",
            DEFAULT_RETRY_BASE_DELAY_MS,
            &mut lookup,
        )?;
        let retry_multiplier = parse_with_default(
            "APILINK_RETRY_MULTIPLIER",
            DEFAULT_RETRY_MULTIPLIER,
            &mut lookup,
        )?;
        if retry_multiplier == 0 {
            return Err(ConfigError::InvalidValue {
                key: "APILINK_RETRY_MULTIPLIER",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        let probe_interval_ms = positive_u64(
            "APILINK_PROBE_INTERVAL_MS",
            DEFAULT_PROBE_INTERVAL_MS,
            &mut lookup,
        )?;
        let probe_timeout_ms = positive_u64(
            "APILINK_PROBE_TIMEOUT_MS",
            DEFAULT_PROBE_TIMEOUT_MS,
            &mut lookup,
        )?;
        let max_token_age_ms = positive_u64(
            "APILINK_MAX_TOKEN_AGE_MS",
            DEFAULT_MAX_TOKEN_AGE_MS,
            &mut lookup,
        )?;
        let unreachable_threshold = parse_with_default(
            "APILINK_UNREACHABLE_THRESHOLD",
            DEFAULT_UNREACHABLE_THRESHOLD,
            &mut lookup,
        )?;
        if unreachable_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                key: "APILINK_UNREACHABLE_THRESHOLD",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        let allow_test_credentials = parse_bool(
            "APILINK_ALLOW_TEST_CREDENTIALS",
            false,
            &mut lookup,
        )?;

        Ok(Self {
            base_url,
            request_timeout_ms,
            upload_timeout_ms,
            retry_max_retries,
            retry_base_delay_ms,
            retry_multiplier,
            probe_interval_ms,
            probe_timeout_ms,
            probe_path: path_env("APILINK_PROBE_PATH", DEFAULT_PROBE_PATH, &mut lookup),
            login_path: path_env("APILINK_LOGIN_PATH", DEFAULT_LOGIN_PATH, &mut lookup),
            register_path: path_env("APILINK_REGISTER_PATH", DEFAULT_REGISTER_PATH, &mut lookup),
            profile_path: path_env("APILINK_PROFILE_PATH", DEFAULT_PROFILE_PATH, &mut lookup),
            max_token_age_ms,
            unreachable_threshold,
            allow_test_credentials,
            storage_dir: optional_trimmed_env("APILINK_STORAGE_DIR", &mut lookup)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR)),
        })
    }

    /// Retry policy built from the configured retry values.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_retries,
            self.retry_base_delay_ms,
            self.retry_multiplier,
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Join a request path onto the base URL.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_owned();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// Errors produced while parsing configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn normalize_base_url(value: &str) -> String {
    value.trim().trim_end_matches('/').to_owned()
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn path_env<F>(key: &'static str, default: &str, lookup: &mut F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let value = optional_trimmed_env(key, lookup).unwrap_or_else(|| default.to_owned());
    if value.starts_with('/') {
        value
    } else {
        format!("/{value}")
    }
}

fn parse_with_default<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<T>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn positive_u64<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let value = parse_with_default(key, default, lookup)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be greater than 0".to_owned(),
        });
    }
    Ok(value)
}

fn parse_bool<F>(key: &'static str, default: bool, lookup: &mut F) -> Result<bool, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected true/false".to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<LinkConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        LinkConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let cfg = config_from_pairs(&[]).expect("defaults should parse");
        assert_eq!(cfg, LinkConfig::default());
        assert_eq!(cfg.request_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.upload_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.probe_interval(), Duration::from_secs(30));

        let policy = cfg.retry_policy();
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.base_delay_ms(), 300);
        assert_eq!(policy.multiplier(), 2);
    }

    #[test]
    fn overrides_every_tunable() {
        let cfg = config_from_pairs(&[
            ("APILINK_BASE_URL", " http://localhost:3002/ "),
            ("APILINK_REQUEST_TIMEOUT_MS", "2000"),
            ("APILINK_UPLOAD_TIMEOUT_MS", "9000"),
            ("APILINK_RETRY_MAX_RETRIES", "5"),
            ("APILINK_RETRY_BASE_DELAY_MS", "50"),
            ("APILINK_RETRY_MULTIPLIER", "3"),
            ("APILINK_PROBE_INTERVAL_MS", "1000"),
            ("APILINK_PROBE_PATH", "api/health"),
            ("APILINK_LOGIN_PATH", "/api/auth/login"),
            ("APILINK_MAX_TOKEN_AGE_MS", "3600000"),
            ("APILINK_UNREACHABLE_THRESHOLD", "2"),
            ("APILINK_ALLOW_TEST_CREDENTIALS", "yes"),
            ("APILINK_STORAGE_DIR", "/tmp/apilink"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.base_url, "http://localhost:3002");
        assert_eq!(cfg.request_timeout_ms, 2_000);
        assert_eq!(cfg.upload_timeout_ms, 9_000);
        assert_eq!(cfg.retry_policy().max_retries(), 5);
        assert_eq!(cfg.retry_policy().delay_for_attempt(2), Duration::from_millis(150));
        assert_eq!(cfg.probe_interval_ms, 1_000);
        assert_eq!(cfg.probe_path, "/api/health");
        assert_eq!(cfg.login_path, "/api/auth/login");
        assert_eq!(cfg.max_token_age_ms, 3_600_000);
        assert_eq!(cfg.unreachable_threshold, 2);
        assert!(cfg.allow_test_credentials);
        assert_eq!(cfg.storage_dir, PathBuf::from("/tmp/apilink"));
    }

    #[test]
    fn joins_paths_onto_base_url() {
        let cfg = LinkConfig::with_base_url("http://localhost:5001/");
        assert_eq!(cfg.url_for("/api/login"), "http://localhost:5001/api/login");
        assert_eq!(cfg.url_for("api/login"), "http://localhost:5001/api/login");
        assert_eq!(
            cfg.url_for("https://elsewhere.example/x"),
            "https://elsewhere.example/x"
        );
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let err = config_from_pairs(&[("APILINK_REQUEST_TIMEOUT_MS", "soon")])
            .expect_err("invalid timeout should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "APILINK_REQUEST_TIMEOUT_MS",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_where_positive_required() {
        for key in [
            "APILINK_PROBE_INTERVAL_MS",
            "APILINK_RETRY_MULTIPLIER",
            "APILINK_UNREACHABLE_THRESHOLD",
            "APILINK_MAX_TOKEN_AGE_MS",
        ] {
            let err = config_from_pairs(&[(key, "0")]).expect_err("zero must be rejected");
            assert!(err.to_string().contains(key), "{err}");
        }
    }

    #[test]
    fn rejects_non_http_base_url_and_bad_bool() {
        assert!(config_from_pairs(&[("APILINK_BASE_URL", "ftp://x")]).is_err());
        assert!(config_from_pairs(&[("APILINK_ALLOW_TEST_CREDENTIALS", "maybe")]).is_err());
    }
}

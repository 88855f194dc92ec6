use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

const DEFAULT_FILE_EXTENSIONS: &[&str] = &[
    "js", "css", "map", "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "woff", "woff2",
    "ttf", "eot", "pdf", "zip", "gz", "tar", "mp3", "mp4", "csv", "txt",
];

/// Client options, loaded once at startup and injected into [`crate::HttpClientBuilder`].
///
/// Durations are carried as integers in the unit their name implies (`*_ms` in milliseconds,
/// `client_cache_duration` in seconds) so the struct round-trips through TOML and JSON.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
    #[serde(rename = "retryTimeout")]
    pub retry_timeout_ms: u64,
    pub ignore_tls_errors: bool,
    pub use_retry_policy: bool,
    pub throw_on_unsuccessful: bool,
    pub use_circuit_breaker_policy: bool,
    /// Seconds a pooled transport handle stays cached; `0` disables pooling.
    pub client_cache_duration: u64,
    #[serde(rename = "retryDelay")]
    pub retry_delay_ms: u64,
    pub breaker_failure_threshold: usize,
    #[serde(rename = "breakerCoolDown")]
    pub breaker_cool_down_ms: u64,
    pub breaker_counts_too_many_requests: bool,
    pub file_extensions: Vec<String>,
    pub max_response_body_bytes: usize,
    pub metrics_enabled: bool,
    pub metrics_label_includes_path: bool,
    #[serde(rename = "disposalMargin")]
    pub disposal_margin_ms: u64,
    #[serde(rename = "disposalSweepInterval")]
    pub disposal_sweep_interval_ms: u64,
    #[serde(rename = "regenerateAfter")]
    pub regenerate_after_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 40_000,
            retry_timeout_ms: 10_000,
            ignore_tls_errors: true,
            use_retry_policy: true,
            throw_on_unsuccessful: true,
            use_circuit_breaker_policy: false,
            client_cache_duration: 1_200,
            retry_delay_ms: 200,
            breaker_failure_threshold: 25,
            breaker_cool_down_ms: 7_000,
            breaker_counts_too_many_requests: true,
            file_extensions: DEFAULT_FILE_EXTENSIONS
                .iter()
                .map(|extension| (*extension).to_owned())
                .collect(),
            max_response_body_bytes: 8 * 1024 * 1024,
            metrics_enabled: false,
            metrics_label_includes_path: true,
            disposal_margin_ms: 10_000,
            disposal_sweep_interval_ms: 10_000,
            regenerate_after_ms: 1_000,
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(text).map_err(|source| Error::InvalidConfig {
            message: source.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::InvalidConfig {
            message: format!("failed to read {}: {source}", path.display()),
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.timeout_ms == 0 {
            return Err(invalid_config("timeout must be > 0"));
        }
        if self.retry_timeout_ms == 0 {
            return Err(invalid_config("retryTimeout must be > 0"));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(invalid_config("breakerFailureThreshold must be >= 1"));
        }
        if self.max_response_body_bytes == 0 {
            return Err(invalid_config("maxResponseBodyBytes must be >= 1"));
        }
        if self.disposal_sweep_interval_ms == 0 {
            return Err(invalid_config("disposalSweepInterval must be > 0"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    pub fn client_cache_lifetime(&self) -> Duration {
        Duration::from_secs(self.client_cache_duration)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn breaker_cool_down(&self) -> Duration {
        Duration::from_millis(self.breaker_cool_down_ms)
    }

    pub fn disposal_margin(&self) -> Duration {
        Duration::from_millis(self.disposal_margin_ms)
    }

    pub fn disposal_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.disposal_sweep_interval_ms)
    }

    pub fn regenerate_after(&self) -> Duration {
        Duration::from_millis(self.regenerate_after_ms)
    }
}

fn invalid_config(message: &str) -> Error {
    Error::InvalidConfig {
        message: message.to_owned(),
    }
}

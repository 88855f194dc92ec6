use std::collections::BTreeSet;
use std::time::Duration;

use http::{Method, StatusCode, Uri};

use crate::error::FailureCause;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);
const DEFAULT_MINIMUM_FINAL_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_ATTEMPTS_WITH_POLICY: usize = 3;
const MAX_ATTEMPTS_WITHOUT_POLICY: usize = 2;

/// Outcome of one finished attempt, as seen by the retry engine.
#[derive(Clone, Debug)]
pub struct RetryDecision {
    /// Zero-based index of the attempt that just finished.
    pub attempt_index: usize,
    pub method: Method,
    pub file_like: bool,
    pub use_retry_policy: bool,
    pub status: Option<StatusCode>,
    pub cause: Option<FailureCause>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    retry_delay: Duration,
    minimum_final_timeout: Duration,
    file_extensions: BTreeSet<String>,
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            minimum_final_timeout: DEFAULT_MINIMUM_FINAL_TIMEOUT,
            file_extensions: BTreeSet::new(),
        }
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn minimum_final_timeout(mut self, minimum_final_timeout: Duration) -> Self {
        self.minimum_final_timeout = minimum_final_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn file_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.file_extensions = extensions
            .into_iter()
            .map(|extension| {
                extension
                    .as_ref()
                    .trim()
                    .trim_start_matches('.')
                    .to_ascii_lowercase()
            })
            .filter(|extension| !extension.is_empty())
            .collect();
        self
    }

    pub const fn max_attempts(use_retry_policy: bool) -> usize {
        if use_retry_policy {
            MAX_ATTEMPTS_WITH_POLICY
        } else {
            MAX_ATTEMPTS_WITHOUT_POLICY
        }
    }

    pub fn backoff(&self) -> Duration {
        self.retry_delay
    }

    /// Every retry gets a fresh transport handle so a poisoned connection is never reused.
    pub const fn forces_new_handle(attempt_index: usize) -> bool {
        attempt_index >= 1
    }

    pub fn timeout_for_attempt(
        &self,
        timeout: Duration,
        retry_timeout: Duration,
        attempt_index: usize,
    ) -> Duration {
        match attempt_index {
            0 => timeout,
            1 => retry_timeout,
            _ => (retry_timeout / 2)
                .max(self.minimum_final_timeout)
                .min(retry_timeout),
        }
    }

    /// Suffix heuristic: the last path segment ends with a configured extension.
    pub fn is_file_like(&self, uri: &Uri) -> bool {
        if self.file_extensions.is_empty() {
            return false;
        }
        let Some(last_segment) = uri.path().rsplit('/').next() else {
            return false;
        };
        let Some((_, extension)) = last_segment.rsplit_once('.') else {
            return false;
        };
        self.file_extensions
            .contains(&extension.to_ascii_lowercase())
    }

    pub fn should_retry(&self, decision: &RetryDecision) -> bool {
        if decision.attempt_index + 1 >= Self::max_attempts(decision.use_retry_policy) {
            return false;
        }
        match decision.cause {
            Some(FailureCause::NonRetryable) => return false,
            Some(cause) if cause.is_connection_reset() => return true,
            _ => {}
        }
        if !decision.use_retry_policy {
            return decision.attempt_index == 0 && legacy_retry_applies(decision);
        }
        decision.attempt_index < retries_allowed(decision)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn legacy_retry_applies(decision: &RetryDecision) -> bool {
    let Some(status) = decision.status else {
        return false;
    };
    let gateway_failure =
        status == StatusCode::BAD_GATEWAY || status == StatusCode::GATEWAY_TIMEOUT;
    gateway_failure
        && (decision.file_like || matches!(decision.method, Method::GET | Method::POST))
}

fn retries_allowed(decision: &RetryDecision) -> usize {
    let Some(status) = decision.status else {
        return 2;
    };
    if status.is_success() {
        return 0;
    }
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        if decision.file_like {
            return 0;
        }
        if matches!(decision.method, Method::GET | Method::POST) {
            return 1;
        }
    }
    if decision.file_like {
        return 1;
    }
    match decision.method {
        Method::DELETE | Method::PUT => 0,
        Method::GET if status == StatusCode::NOT_FOUND => 1,
        Method::GET => 2,
        _ => 1,
    }
}

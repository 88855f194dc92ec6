use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Response, Uri};
use hyper::body::Incoming;
use serde::de::DeserializeOwned;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::breaker::{BreakerOutcome, BreakerRegistry, CircuitBreakerPolicy, endpoint_signature};
use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::handle_cache::{HandleCache, HandleCacheOptions, HandleKey};
use crate::media_type::MediaType;
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::request::{AttemptView, RequestBuilder, RequestSpec};
use crate::response::{AssemblyContext, BodyDecoder, ResponseEnvelope};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::transport::classify_transport_error;
use crate::util::{
    endpoint_label, parse_header_name, parse_header_value, redact_uri_for_logs, resolve_uri,
};

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub struct HttpClientBuilder {
    config: ClientConfig,
    default_headers: HeaderMap,
    handle_cache: Option<Arc<HandleCache>>,
    breaker_registry: Option<Arc<BreakerRegistry>>,
    clock: Option<Arc<dyn Clock>>,
}

impl HttpClientBuilder {
    pub fn new() -> Self {
        Self::from_config(ClientConfig::default())
    }

    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config,
            default_headers: HeaderMap::new(),
            handle_cache: None,
            breaker_registry: None,
            clock: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = duration_millis(timeout);
        self
    }

    pub fn retry_timeout(mut self, retry_timeout: Duration) -> Self {
        self.config.retry_timeout_ms = duration_millis(retry_timeout);
        self
    }

    pub fn ignore_tls_errors(mut self, ignore_tls_errors: bool) -> Self {
        self.config.ignore_tls_errors = ignore_tls_errors;
        self
    }

    pub fn use_retry_policy(mut self, use_retry_policy: bool) -> Self {
        self.config.use_retry_policy = use_retry_policy;
        self
    }

    pub fn throw_on_unsuccessful(mut self, throw_on_unsuccessful: bool) -> Self {
        self.config.throw_on_unsuccessful = throw_on_unsuccessful;
        self
    }

    pub fn use_circuit_breaker(mut self, use_circuit_breaker: bool) -> Self {
        self.config.use_circuit_breaker_policy = use_circuit_breaker;
        self
    }

    /// Whole seconds; zero disables handle caching.
    pub fn client_cache_duration(mut self, duration: Duration) -> Self {
        self.config.client_cache_duration = duration.as_secs();
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.config.retry_delay_ms = duration_millis(retry_delay);
        self
    }

    pub fn breaker_failure_threshold(mut self, threshold: usize) -> Self {
        self.config.breaker_failure_threshold = threshold;
        self
    }

    pub fn breaker_cool_down(mut self, cool_down: Duration) -> Self {
        self.config.breaker_cool_down_ms = duration_millis(cool_down);
        self
    }

    pub fn breaker_counts_too_many_requests(mut self, counts: bool) -> Self {
        self.config.breaker_counts_too_many_requests = counts;
        self
    }

    pub fn file_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.file_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.config.max_response_body_bytes = max_response_body_bytes;
        self
    }

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.config.metrics_enabled = enabled;
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn handle_cache(mut self, handle_cache: Arc<HandleCache>) -> Self {
        self.handle_cache = Some(handle_cache);
        self
    }

    pub fn breaker_registry(mut self, breaker_registry: Arc<BreakerRegistry>) -> Self {
        self.breaker_registry = Some(breaker_registry);
        self
    }

    /// Time source for breaker cool-downs and handle expiry of privately created caches.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn try_build(self) -> crate::Result<HttpClient> {
        self.config.validate()?;

        let cache_options = HandleCacheOptions::from_config(&self.config);
        let handle_cache = match (self.handle_cache, &self.clock) {
            (Some(handle_cache), _) => handle_cache,
            (None, None) if cache_options == HandleCacheOptions::default() => {
                HandleCache::global()
            }
            (None, None) => Arc::new(HandleCache::new(cache_options)),
            (None, Some(clock)) => {
                Arc::new(HandleCache::with_clock(cache_options, Arc::clone(clock)))
            }
        };
        let breaker_registry = match (self.breaker_registry, &self.clock) {
            (Some(registry), _) => registry,
            (None, None) => BreakerRegistry::global(),
            (None, Some(clock)) => Arc::new(BreakerRegistry::with_clock(Arc::clone(clock))),
        };

        let retry_policy = RetryPolicy::standard()
            .retry_delay(self.config.retry_delay())
            .file_extensions(&self.config.file_extensions);
        let breaker_policy = CircuitBreakerPolicy::standard()
            .failure_threshold(self.config.breaker_failure_threshold)
            .cool_down(self.config.breaker_cool_down())
            .counts_too_many_requests(self.config.breaker_counts_too_many_requests);
        let metrics = if self.config.metrics_enabled {
            ClientMetrics::enabled()
        } else {
            ClientMetrics::disabled()
        };

        Ok(HttpClient {
            config: Arc::new(self.config),
            default_headers: self.default_headers,
            retry_policy,
            breaker_policy,
            handle_cache,
            breaker_registry,
            metrics,
        })
    }

    pub fn build(self) -> HttpClient {
        self.try_build().unwrap_or_else(|error| {
            panic!("failed to build outbound http client: {error}; use try_build() to handle configuration errors")
        })
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct DispatchStats {
    attempts: usize,
    final_timeout: Duration,
}

#[derive(Clone)]
pub struct HttpClient {
    config: Arc<ClientConfig>,
    default_headers: HeaderMap,
    retry_policy: RetryPolicy,
    breaker_policy: CircuitBreakerPolicy,
    handle_cache: Arc<HandleCache>,
    breaker_registry: Arc<BreakerRegistry>,
    metrics: ClientMetrics,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpClient")
            .field("config", &self.config)
            .field("retry_policy", &self.retry_policy)
            .field("breaker_policy", &self.breaker_policy)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn handle_cache(&self) -> &Arc<HandleCache> {
        &self.handle_cache
    }

    pub fn breaker_registry(&self) -> &Arc<BreakerRegistry> {
        &self.breaker_registry
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// A request description carrying this client's defaults.
    pub fn spec(&self, method: Method, url: impl Into<String>) -> RequestSpec {
        RequestSpec {
            method,
            url: url.into(),
            media_type: MediaType::default(),
            headers: self.default_headers.clone(),
            body: None,
            timeout: self.config.timeout(),
            retry_timeout: self.config.retry_timeout(),
            ignore_tls_errors: self.config.ignore_tls_errors,
            use_retry_policy: self.config.use_retry_policy,
            throw_on_failure: self.config.throw_on_unsuccessful,
            use_circuit_breaker: self.config.use_circuit_breaker_policy,
            targets_file: false,
            caller_authenticated: false,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, self.spec(method, url))
    }

    pub fn get(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, url)
    }

    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, url)
    }

    pub fn head(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::HEAD, url)
    }

    pub async fn execute<T>(&self, spec: RequestSpec) -> crate::Result<ResponseEnvelope<T>>
    where
        T: DeserializeOwned + Default + 'static,
    {
        self.execute_decoded(spec, BodyDecoder::structured()).await
    }

    pub async fn execute_decoded<T>(
        &self,
        spec: RequestSpec,
        decoder: BodyDecoder<T>,
    ) -> crate::Result<ResponseEnvelope<T>>
    where
        T: Default,
    {
        let redacted_uri = redact_uri_for_logs(&spec.url);
        let span = info_span!(
            "outbound.request",
            method = %spec.method,
            uri = %redacted_uri,
            media_type = %spec.media_type
        );
        async move {
            let (outcome, stats) = self.dispatch(&spec, &redacted_uri).await;
            let context = self.assembly_context(&spec, redacted_uri, &stats);
            match outcome {
                Ok(response) => context.assemble(response, &decoder).await,
                Err(error) => context.from_error(error),
            }
        }
        .instrument(span)
        .await
    }

    pub async fn execute_raw(&self, spec: RequestSpec) -> crate::Result<ResponseEnvelope<()>> {
        let redacted_uri = redact_uri_for_logs(&spec.url);
        let span = info_span!(
            "outbound.request",
            method = %spec.method,
            uri = %redacted_uri,
            media_type = %spec.media_type
        );
        async move {
            let (outcome, stats) = self.dispatch(&spec, &redacted_uri).await;
            let context = self.assembly_context(&spec, redacted_uri, &stats);
            match outcome {
                Ok(response) => context.assemble_raw(response).await,
                Err(error) => context.from_error(error),
            }
        }
        .instrument(span)
        .await
    }

    /// Disposes every handle held by this client's cache.
    pub fn shutdown(&self) -> usize {
        self.handle_cache.shutdown()
    }

    fn assembly_context(
        &self,
        spec: &RequestSpec,
        redacted_uri: String,
        stats: &DispatchStats,
    ) -> AssemblyContext {
        AssemblyContext {
            method: spec.method.clone(),
            uri: redacted_uri,
            media_type: spec.media_type.clone(),
            timeout: stats.final_timeout,
            throw_on_failure: spec.throw_on_failure,
            max_body_bytes: self.config.max_response_body_bytes,
            cancellation: spec.cancellation.clone(),
            attempts: stats.attempts,
        }
    }

    async fn dispatch(
        &self,
        spec: &RequestSpec,
        redacted_uri: &str,
    ) -> (Result<Response<Incoming>, Error>, DispatchStats) {
        let mut stats = DispatchStats {
            attempts: 0,
            final_timeout: spec.timeout,
        };
        let uri = match resolve_uri(&spec.url) {
            Ok(uri) => uri,
            Err(error) => return (Err(error), stats),
        };
        let label = endpoint_label(&uri, self.config.metrics_label_includes_path);
        let file_like = spec.targets_file || self.retry_policy.is_file_like(&uri);
        let breaker_applies =
            spec.use_circuit_breaker && !spec.targets_file && !spec.media_type.is_static_asset();

        let mut circuit_attempt = None;
        let mut signature = String::new();
        if breaker_applies {
            signature = endpoint_signature(&spec.method, &uri, spec.caller_authenticated);
            let breaker = self.breaker_registry.get_or_create(&signature);
            match breaker.begin(&self.breaker_policy) {
                Ok(attempt) => circuit_attempt = Some(attempt),
                Err(error) => {
                    warn!(signature = %signature, error = %error, "circuit breaker rejected request");
                    self.metrics.record_failure(&label);
                    return (Err(error), stats);
                }
            }
        }

        let outcome = self
            .retry_loop(spec, &uri, redacted_uri, file_like, &label, &mut stats)
            .await;

        if let Some(attempt) = circuit_attempt {
            let breaker_outcome = match &outcome {
                Ok(response) if self.breaker_policy.is_failure_status(response.status()) => {
                    BreakerOutcome::Failure
                }
                Ok(_) => BreakerOutcome::Success,
                Err(Error::CallerCancelled { .. }) => BreakerOutcome::Neutral,
                Err(error) if error.is_non_retryable() => BreakerOutcome::Neutral,
                Err(_) => BreakerOutcome::Failure,
            };
            if attempt.complete(breaker_outcome) {
                self.metrics.record_circuit_trip(&label);
                warn!(
                    signature = %signature,
                    cool_down_ms = self.breaker_policy.configured_cool_down().as_millis() as u64,
                    "circuit breaker opened"
                );
            }
        }

        match &outcome {
            Ok(response) if response.status().is_success() => {
                self.metrics.record_success(&label, stats.attempts > 1);
            }
            Err(Error::CallerCancelled { .. }) => {}
            _ => self.metrics.record_failure(&label),
        }
        (outcome, stats)
    }

    async fn retry_loop(
        &self,
        spec: &RequestSpec,
        uri: &Uri,
        redacted_uri: &str,
        file_like: bool,
        label: &str,
        stats: &mut DispatchStats,
    ) -> Result<Response<Incoming>, Error> {
        let mut attempt_index = 0;
        loop {
            let view = AttemptView::for_attempt(spec, &self.retry_policy, attempt_index);
            stats.attempts = attempt_index + 1;
            stats.final_timeout = view.timeout;

            let outcome = self.attempt(spec, uri, redacted_uri, &view).await;
            let succeeded = outcome
                .as_ref()
                .is_ok_and(|response| response.status().is_success());
            if succeeded || matches!(outcome, Err(Error::CallerCancelled { .. })) {
                return outcome;
            }
            if spec.cancellation.is_cancelled() {
                return Err(caller_cancelled(spec, redacted_uri));
            }

            let decision = RetryDecision {
                attempt_index,
                method: spec.method.clone(),
                file_like,
                use_retry_policy: spec.use_retry_policy,
                status: outcome.as_ref().ok().map(Response::status),
                cause: outcome.as_ref().err().and_then(Error::failure_cause),
            };
            if !self.retry_policy.should_retry(&decision) {
                return outcome;
            }

            match &outcome {
                Ok(response) => warn!(
                    attempt = view.index + 1,
                    status = response.status().as_u16(),
                    delay_ms = self.retry_policy.backoff().as_millis() as u64,
                    "retrying request after unsuccessful status"
                ),
                Err(error) => warn!(
                    attempt = view.index + 1,
                    error = %error,
                    delay_ms = self.retry_policy.backoff().as_millis() as u64,
                    "retrying request after failure"
                ),
            }
            drop(outcome);
            self.metrics.record_retry(label);

            tokio::select! {
                biased;
                _ = spec.cancellation.cancelled() => {
                    return Err(caller_cancelled(spec, redacted_uri));
                }
                _ = sleep(self.retry_policy.backoff()) => {}
            }
            attempt_index += 1;
        }
    }

    async fn attempt(
        &self,
        spec: &RequestSpec,
        uri: &Uri,
        redacted_uri: &str,
        view: &AttemptView,
    ) -> Result<Response<Incoming>, Error> {
        let key = HandleKey::for_uri(uri, view.timeout, spec.ignore_tls_errors)?;
        let lease = self.handle_cache.acquire(&key, view.force_new_handle)?;
        let request = spec.wire_request()?;
        debug!(
            attempt = view.index + 1,
            handle = lease.handle_id(),
            timeout_ms = view.timeout.as_millis() as u64,
            "sending request"
        );

        let send = timeout(view.timeout, lease.client().request(request));
        tokio::select! {
            biased;
            _ = spec.cancellation.cancelled() => Err(caller_cancelled(spec, redacted_uri)),
            result = send => match result {
                Err(_) if spec.cancellation.is_cancelled() => {
                    Err(caller_cancelled(spec, redacted_uri))
                }
                Err(_) => Err(Error::Timeout {
                    method: spec.method.clone(),
                    uri: redacted_uri.to_owned(),
                    media_type: spec.media_type.clone(),
                    timeout_ms: view.timeout.as_millis(),
                }),
                Ok(Err(source)) => {
                    let kind = classify_transport_error(&source);
                    Err(Error::Transport {
                        kind,
                        method: spec.method.clone(),
                        uri: redacted_uri.to_owned(),
                        media_type: spec.media_type.clone(),
                        timeout_ms: view.timeout.as_millis(),
                        source: Box::new(source),
                    })
                }
                Ok(Ok(response)) => Ok(response),
            },
        }
    }
}

fn caller_cancelled(spec: &RequestSpec, redacted_uri: &str) -> Error {
    Error::CallerCancelled {
        method: spec.method.clone(),
        uri: redacted_uri.to_owned(),
    }
}

use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request};
use http_body_util::Full;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::client::HttpClient;
use crate::error::Error;
use crate::media_type::MediaType;
use crate::response::{BodyDecoder, ResponseEnvelope};
use crate::retry::RetryPolicy;
use crate::util::{append_query_pairs, parse_header_name, parse_header_value};

const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Everything one logical send needs. Fixed once the retry loop starts.
#[derive(Clone, Debug)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub media_type: MediaType,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Duration,
    pub retry_timeout: Duration,
    pub ignore_tls_errors: bool,
    pub use_retry_policy: bool,
    pub throw_on_failure: bool,
    pub use_circuit_breaker: bool,
    /// Caller already knows the target is a file download; skips the breaker.
    pub targets_file: bool,
    pub caller_authenticated: bool,
    pub cancellation: CancellationToken,
}

impl RequestSpec {
    pub(crate) fn wire_request(&self) -> Result<Request<Full<Bytes>>, Error> {
        let mut headers = self.headers.clone();
        let media_value = HeaderValue::from_str(self.media_type.as_str()).map_err(|source| {
            Error::InvalidHeaderValue {
                name: CONTENT_TYPE.as_str().to_owned(),
                source,
            }
        })?;
        if !headers.contains_key(ACCEPT) {
            headers.insert(ACCEPT, media_value.clone());
        }
        if self.body.is_some() && !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, media_value);
        }

        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(self.url.as_str())
            .body(Full::new(self.body.clone().unwrap_or_default()))
            .map_err(|source| Error::RequestBuild { source })?;
        *request.headers_mut() = headers;
        Ok(request)
    }
}

/// Per-attempt view of a [`RequestSpec`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttemptView {
    pub index: usize,
    pub timeout: Duration,
    pub force_new_handle: bool,
}

impl AttemptView {
    pub fn for_attempt(spec: &RequestSpec, policy: &RetryPolicy, index: usize) -> Self {
        Self {
            index,
            timeout: policy.timeout_for_attempt(spec.timeout, spec.retry_timeout, index),
            force_new_handle: RetryPolicy::forces_new_handle(index),
        }
    }
}

pub struct RequestBuilder<'a> {
    client: &'a HttpClient,
    spec: RequestSpec,
    query_pairs: Vec<(String, String)>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a HttpClient, spec: RequestSpec) -> Self {
        Self {
            client,
            spec,
            query_pairs: Vec::new(),
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.spec.headers.append(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn headers<'h, I>(self, headers: I) -> crate::Result<Self>
    where
        I: IntoIterator<Item = (&'h str, &'h str)>,
    {
        headers
            .into_iter()
            .try_fold(self, |builder, (name, value)| builder.try_header(name, value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query<T>(mut self, params: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params)
            .map_err(|source| Error::SerializeForm { source })?;
        self.query_pairs.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.spec.body = Some(body.into());
        self
    }

    pub fn json<T>(mut self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::SerializeJson { source })?;
        self.spec.media_type = MediaType::Json;
        Ok(self.body(body))
    }

    pub fn xml<T>(mut self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = quick_xml::se::to_string(payload)
            .map_err(|source| Error::SerializeXml { source })?;
        self.spec.media_type = MediaType::Xml;
        Ok(self.body(body))
    }

    pub fn form<T>(mut self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(payload)
            .map_err(|source| Error::SerializeForm { source })?;
        self.spec.media_type = MediaType::FormUrlEncoded;
        Ok(self.body(encoded))
    }

    pub fn media_type(mut self, media_type: MediaType) -> Self {
        self.spec.media_type = media_type;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = timeout.max(MIN_TIMEOUT);
        self
    }

    pub fn retry_timeout(mut self, retry_timeout: Duration) -> Self {
        self.spec.retry_timeout = retry_timeout.max(MIN_TIMEOUT);
        self
    }

    pub fn ignore_tls_errors(mut self, ignore_tls_errors: bool) -> Self {
        self.spec.ignore_tls_errors = ignore_tls_errors;
        self
    }

    pub fn use_retry_policy(mut self, use_retry_policy: bool) -> Self {
        self.spec.use_retry_policy = use_retry_policy;
        self
    }

    pub fn throw_on_failure(mut self, throw_on_failure: bool) -> Self {
        self.spec.throw_on_failure = throw_on_failure;
        self
    }

    pub fn use_circuit_breaker(mut self, use_circuit_breaker: bool) -> Self {
        self.spec.use_circuit_breaker = use_circuit_breaker;
        self
    }

    pub fn targets_file(mut self, targets_file: bool) -> Self {
        self.spec.targets_file = targets_file;
        self
    }

    pub fn caller_authenticated(mut self, caller_authenticated: bool) -> Self {
        self.spec.caller_authenticated = caller_authenticated;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.spec.cancellation = token;
        self
    }

    pub fn into_spec(mut self) -> RequestSpec {
        self.spec.url = append_query_pairs(&self.spec.url, &self.query_pairs);
        self.spec
    }

    pub async fn send<T>(self) -> crate::Result<ResponseEnvelope<T>>
    where
        T: DeserializeOwned + Default + 'static,
    {
        self.send_with(BodyDecoder::structured()).await
    }

    pub async fn send_text(self) -> crate::Result<ResponseEnvelope<String>> {
        self.send_with(BodyDecoder::text()).await
    }

    /// Decodes the trimmed body text with `FromStr`, for primitive payloads.
    pub async fn send_parsed<T>(self) -> crate::Result<ResponseEnvelope<T>>
    where
        T: FromStr + Default + 'static,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.send_with(BodyDecoder::parsed()).await
    }

    pub async fn send_with<T>(self, decoder: BodyDecoder<T>) -> crate::Result<ResponseEnvelope<T>>
    where
        T: Default,
    {
        let client = self.client;
        client.execute_decoded(self.into_spec(), decoder).await
    }

    /// Leaves the body unread; the caller owns the raw response in the envelope.
    pub async fn send_raw(self) -> crate::Result<ResponseEnvelope<()>> {
        let client = self.client;
        client.execute_raw(self.into_spec()).await
    }
}

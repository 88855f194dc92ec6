use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Response, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{BoxError, Error};
use crate::media_type::{MediaType, is_xml_content};
use crate::util::truncate_body;

type DecodeFn<T> = dyn Fn(&HeaderMap, &Bytes) -> Result<T, BoxError> + Send + Sync;

/// Turns a fully buffered body into the caller's type.
pub struct BodyDecoder<T> {
    decode: Arc<DecodeFn<T>>,
}

impl<T> Clone for BodyDecoder<T> {
    fn clone(&self) -> Self {
        Self {
            decode: Arc::clone(&self.decode),
        }
    }
}

impl<T> std::fmt::Debug for BodyDecoder<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("BodyDecoder").finish_non_exhaustive()
    }
}

impl<T> BodyDecoder<T> {
    /// JSON, or XML when the response content type says so.
    pub fn structured() -> Self
    where
        T: DeserializeOwned + 'static,
    {
        Self {
            decode: Arc::new(|headers, body| {
                if is_xml_content(headers) {
                    quick_xml::de::from_reader(body.as_ref()).map_err(BoxError::from)
                } else {
                    serde_json::from_slice(body).map_err(BoxError::from)
                }
            }),
        }
    }

    /// Parses the trimmed body text with [`FromStr`].
    pub fn parsed() -> Self
    where
        T: FromStr + 'static,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        Self {
            decode: Arc::new(|_, body| {
                let text = std::str::from_utf8(body).map_err(BoxError::from)?;
                text.trim().parse::<T>().map_err(BoxError::from)
            }),
        }
    }

    pub fn custom<F, E>(decode: F) -> Self
    where
        F: Fn(&str) -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self {
            decode: Arc::new(move |_, body| {
                let text = String::from_utf8_lossy(body);
                decode(&text).map_err(Into::into)
            }),
        }
    }

    fn decode(&self, headers: &HeaderMap, body: &Bytes) -> Result<T, Error> {
        (self.decode)(headers, body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(body),
        })
    }
}

impl BodyDecoder<String> {
    pub fn text() -> Self {
        Self {
            decode: Arc::new(|_, body| Ok(String::from_utf8_lossy(body).into_owned())),
        }
    }
}

/// Uniform result of one logical send.
#[derive(Debug)]
pub struct ResponseEnvelope<T> {
    status: Option<StatusCode>,
    data: T,
    reason: String,
    headers: HeaderMap,
    error: Option<Error>,
    attempts: usize,
    raw: Option<Response<Incoming>>,
}

impl<T> ResponseEnvelope<T> {
    /// `None` when no response was received.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status.is_some_and(|status| status.is_success()) && self.error.is_none()
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The failure that was logged instead of returned, when the client does not throw.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn is_dns_failure(&self) -> bool {
        self.error.as_ref().is_some_and(Error::is_dns_failure)
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn raw(&self) -> Option<&Response<Incoming>> {
        self.raw.as_ref()
    }

    pub fn take_raw(&mut self) -> Option<Response<Incoming>> {
        self.raw.take()
    }
}

/// Inputs the assembler needs besides the orchestrator's outcome.
#[derive(Clone, Debug)]
pub(crate) struct AssemblyContext {
    pub(crate) method: Method,
    pub(crate) uri: String,
    pub(crate) media_type: MediaType,
    pub(crate) timeout: Duration,
    pub(crate) throw_on_failure: bool,
    pub(crate) max_body_bytes: usize,
    pub(crate) cancellation: CancellationToken,
    pub(crate) attempts: usize,
}

impl AssemblyContext {
    fn suppressed<T: Default>(
        &self,
        status: Option<StatusCode>,
        headers: HeaderMap,
        data: T,
        error: Error,
    ) -> ResponseEnvelope<T> {
        warn!(
            method = %self.method,
            uri = %self.uri,
            status = status.map(|status| status.as_u16()),
            attempts = self.attempts,
            error = %error,
            "outbound request failed; returning envelope"
        );
        ResponseEnvelope {
            status,
            data,
            reason: error.to_string(),
            headers,
            error: Some(error),
            attempts: self.attempts,
            raw: None,
        }
    }

    pub(crate) fn from_error<T: Default>(&self, error: Error) -> crate::Result<ResponseEnvelope<T>> {
        if self.throw_on_failure || error.is_always_surfaced() {
            return Err(error);
        }
        Ok(self.suppressed(None, HeaderMap::new(), T::default(), error))
    }

    async fn read_body(&self, body: Incoming) -> Result<Bytes, Error> {
        let limited = Limited::new(body, self.max_body_bytes);
        let collected = tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => {
                return Err(Error::CallerCancelled {
                    method: self.method.clone(),
                    uri: self.uri.clone(),
                });
            }
            collected = tokio::time::timeout(self.timeout, limited.collect()) => collected,
        };
        match collected {
            Err(_) => Err(Error::Timeout {
                method: self.method.clone(),
                uri: self.uri.clone(),
                media_type: self.media_type.clone(),
                timeout_ms: self.timeout.as_millis(),
            }),
            Ok(Err(source)) if source.downcast_ref::<LengthLimitError>().is_some() => {
                Err(Error::ResponseBodyTooLarge {
                    limit_bytes: self.max_body_bytes,
                    method: self.method.clone(),
                    uri: self.uri.clone(),
                })
            }
            Ok(Err(source)) => Err(Error::ReadBody {
                method: self.method.clone(),
                uri: self.uri.clone(),
                source,
            }),
            Ok(Ok(collected)) => Ok(collected.to_bytes()),
        }
    }

    fn status_error(&self, status: StatusCode, body: &[u8]) -> Error {
        Error::HttpStatus {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("unknown").to_owned(),
            method: self.method.clone(),
            uri: self.uri.clone(),
            media_type: self.media_type.clone(),
            timeout_ms: self.timeout.as_millis(),
            body: truncate_body(body),
        }
    }

    pub(crate) async fn assemble<T: Default>(
        &self,
        response: Response<Incoming>,
        decoder: &BodyDecoder<T>,
    ) -> crate::Result<ResponseEnvelope<T>> {
        let (parts, body) = response.into_parts();
        let status = parts.status;
        let headers = parts.headers;

        let bytes = match self.read_body(body).await {
            Ok(bytes) => bytes,
            Err(error) if status.is_success() => {
                if self.throw_on_failure || error.is_always_surfaced() {
                    return Err(error);
                }
                return Ok(self.suppressed(Some(status), headers, T::default(), error));
            }
            Err(Error::CallerCancelled { method, uri }) => {
                return Err(Error::CallerCancelled { method, uri });
            }
            Err(_) => Bytes::new(),
        };

        if !status.is_success() {
            let error = self.status_error(status, &bytes);
            if self.throw_on_failure {
                return Err(error);
            }
            let data = if bytes.is_empty() {
                T::default()
            } else {
                decoder.decode(&headers, &bytes).unwrap_or_default()
            };
            return Ok(self.suppressed(Some(status), headers, data, error));
        }

        if bytes.is_empty() {
            return Ok(self.envelope(status, headers, T::default()));
        }
        match decoder.decode(&headers, &bytes) {
            Ok(data) => Ok(self.envelope(status, headers, data)),
            Err(error) if self.throw_on_failure => Err(error),
            Err(error) => Ok(self.suppressed(Some(status), headers, T::default(), error)),
        }
    }

    pub(crate) async fn assemble_raw(
        &self,
        response: Response<Incoming>,
    ) -> crate::Result<ResponseEnvelope<()>> {
        let status = response.status();
        if !status.is_success() && self.throw_on_failure {
            let body = response.into_body();
            let bytes = match self.read_body(body).await {
                Ok(bytes) => bytes,
                Err(Error::CallerCancelled { method, uri }) => {
                    return Err(Error::CallerCancelled { method, uri });
                }
                Err(_) => Bytes::new(),
            };
            return Err(self.status_error(status, &bytes));
        }

        let headers = response.headers().clone();
        let mut envelope = self.envelope(status, headers, ());
        if !status.is_success() {
            let error = self.status_error(status, &[]);
            envelope = self.suppressed(Some(status), envelope.headers, (), error);
        }
        envelope.raw = Some(response);
        Ok(envelope)
    }

    fn envelope<T>(&self, status: StatusCode, headers: HeaderMap, data: T) -> ResponseEnvelope<T> {
        ResponseEnvelope {
            status: Some(status),
            data,
            reason: status.canonical_reason().unwrap_or_default().to_owned(),
            headers,
            error: None,
            attempts: self.attempts,
            raw: None,
        }
    }
}

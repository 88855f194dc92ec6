//! `outbound` is a resilient HTTP(S) client for calling downstream services from server code.
//!
//! Transport clients are pooled per (scheme, host, port, timeout, TLS mode) and retired with a
//! delayed disposal. Retries follow a method/status matrix and per-endpoint circuit breakers
//! stop traffic to endpoints that keep failing.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use outbound::prelude::HttpClient;
//! use serde::Deserialize;
//!
//! #[derive(Debug, Default, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HttpClient::builder()
//!         .timeout(Duration::from_secs(5))
//!         .retry_timeout(Duration::from_secs(2))
//!         .use_circuit_breaker(true)
//!         .try_build()?;
//!
//!     let envelope = client
//!         .get("https://api.example.com/v1/items/42")
//!         .send::<Item>()
//!         .await?;
//!
//!     println!("status={:?} id={}", envelope.status(), envelope.data().id);
//!     Ok(())
//! }
//! ```

mod breaker;
mod client;
mod clock;
mod config;
mod error;
mod handle_cache;
mod media_type;
mod metrics;
mod request;
mod response;
mod retry;
mod transport;
mod util;

pub use crate::breaker::{
    BreakerRegistry, BreakerState, CircuitBreaker, CircuitBreakerPolicy, endpoint_signature,
};
pub use crate::client::{HttpClient, HttpClientBuilder};
pub use crate::clock::{Clock, SystemClock};
pub use crate::config::ClientConfig;
pub use crate::error::{Error, ErrorCode, FailureCause, TransportErrorKind};
pub use crate::handle_cache::{
    HandleCache, HandleCacheOptions, HandleKey, HandleLease, TransportHandle,
};
pub use crate::media_type::MediaType;
pub use crate::metrics::{ClientMetricsSnapshot, EndpointCounts};
pub use crate::request::{AttemptView, RequestBuilder, RequestSpec};
pub use crate::response::{BodyDecoder, ResponseEnvelope};
pub use crate::retry::{RetryDecision, RetryPolicy};
pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        BodyDecoder, CancellationToken, ClientConfig, Error, ErrorCode, HttpClient, MediaType,
        ResponseEnvelope, Result, RetryPolicy,
    };
}

#[cfg(test)]
mod tests;

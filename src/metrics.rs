use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndpointCounts {
    pub succeeded: u64,
    /// Successes that needed at least one retry; also counted in `succeeded`.
    pub retry_succeeded: u64,
    pub failed: u64,
    pub circuit_trips: u64,
    pub retries: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientMetricsSnapshot {
    pub requests_succeeded: u64,
    pub retry_succeeded: u64,
    pub requests_failed: u64,
    pub circuit_trips: u64,
    pub retries: u64,
    pub endpoints: BTreeMap<String, EndpointCounts>,
}

#[derive(Debug, Default)]
struct EndpointCounters {
    succeeded: AtomicU64,
    retry_succeeded: AtomicU64,
    failed: AtomicU64,
    circuit_trips: AtomicU64,
    retries: AtomicU64,
}

impl EndpointCounters {
    fn snapshot(&self) -> EndpointCounts {
        EndpointCounts {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retry_succeeded: self.retry_succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            circuit_trips: self.circuit_trips.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ClientMetrics {
    inner: Option<Arc<DashMap<String, EndpointCounters>>>,
}

impl ClientMetrics {
    pub(crate) fn enabled() -> Self {
        Self {
            inner: Some(Arc::new(DashMap::new())),
        }
    }

    pub(crate) fn disabled() -> Self {
        Self::default()
    }

    fn bump(&self, label: &str, counter: impl Fn(&EndpointCounters) -> &AtomicU64) {
        let Some(inner) = &self.inner else {
            return;
        };
        if let Some(counters) = inner.get(label) {
            counter(counters.value()).fetch_add(1, Ordering::Relaxed);
            return;
        }
        let counters = inner.entry(label.to_owned()).or_default();
        counter(counters.value()).fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self, label: &str, retried: bool) {
        self.bump(label, |counters| &counters.succeeded);
        if retried {
            self.bump(label, |counters| &counters.retry_succeeded);
        }
    }

    pub(crate) fn record_failure(&self, label: &str) {
        self.bump(label, |counters| &counters.failed);
    }

    pub(crate) fn record_retry(&self, label: &str) {
        self.bump(label, |counters| &counters.retries);
    }

    pub(crate) fn record_circuit_trip(&self, label: &str) {
        self.bump(label, |counters| &counters.circuit_trips);
    }

    pub(crate) fn snapshot(&self) -> ClientMetricsSnapshot {
        let mut snapshot = ClientMetricsSnapshot::default();
        let Some(inner) = &self.inner else {
            return snapshot;
        };
        for entry in inner.iter() {
            let counts = entry.value().snapshot();
            snapshot.requests_succeeded += counts.succeeded;
            snapshot.retry_succeeded += counts.retry_succeeded;
            snapshot.requests_failed += counts.failed;
            snapshot.circuit_trips += counts.circuit_trips;
            snapshot.retries += counts.retries;
            snapshot.endpoints.insert(entry.key().clone(), counts);
        }
        snapshot
    }
}

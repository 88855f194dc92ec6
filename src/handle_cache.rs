use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use http::Uri;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::error::Error;
use crate::transport::{HyperClient, build_transport};
use crate::util::{default_port, lock_unpoisoned, redact_uri_for_logs};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HandleKey {
    scheme: String,
    host: String,
    port: u16,
    timeout: Duration,
    ignore_tls_errors: bool,
}

impl HandleKey {
    pub fn for_uri(uri: &Uri, timeout: Duration, ignore_tls_errors: bool) -> Result<Self, Error> {
        let invalid = || Error::InvalidUri {
            uri: redact_uri_for_logs(&uri.to_string()),
        };
        let scheme = uri.scheme_str().ok_or_else(invalid)?.to_ascii_lowercase();
        let host = uri.host().ok_or_else(invalid)?.to_ascii_lowercase();
        let port = default_port(uri).ok_or_else(invalid)?;
        Ok(Self {
            scheme,
            host,
            port,
            timeout,
            ignore_tls_errors,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// A pooled transport client shared by every in-flight request on one key.
pub struct TransportHandle {
    id: u64,
    client: Mutex<Option<HyperClient>>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TransportHandle")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl TransportHandle {
    fn create(key: &HandleKey) -> Result<Self, Error> {
        let client = build_transport(key.timeout, key.ignore_tls_errors)?;
        Ok(Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            client: Mutex::new(Some(client)),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn client(&self) -> Option<HyperClient> {
        lock_unpoisoned(&self.client).clone()
    }

    /// Returns `false` when the handle was already disposed.
    fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        lock_unpoisoned(&self.client).take();
        debug!(handle = self.id, "transport handle disposed");
        true
    }
}

/// What an attempt gets from the cache: the shared handle plus its own clone of the client.
#[derive(Clone, Debug)]
pub struct HandleLease {
    handle: Arc<TransportHandle>,
    client: HyperClient,
    cached: bool,
}

impl HandleLease {
    pub fn handle(&self) -> &Arc<TransportHandle> {
        &self.handle
    }

    pub fn handle_id(&self) -> u64 {
        self.handle.id
    }

    /// `false` for one-shot handles created while caching is disabled.
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    pub(crate) fn client(&self) -> &HyperClient {
        &self.client
    }
}

#[derive(Clone, Debug)]
struct HandleEntry {
    handle: Arc<TransportHandle>,
    created_at: Instant,
    expires_at: Instant,
}

impl HandleEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at && !self.handle.is_disposed()
    }
}

#[derive(Debug)]
struct DisposalEntry {
    handle: Arc<TransportHandle>,
    dispose_at: Instant,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandleCacheOptions {
    pub lifetime: Duration,
    pub regenerate_after: Duration,
    pub disposal_margin: Duration,
    pub sweep_interval: Duration,
}

impl HandleCacheOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            lifetime: config.client_cache_lifetime(),
            regenerate_after: config.regenerate_after(),
            disposal_margin: config.disposal_margin(),
            sweep_interval: config.disposal_sweep_interval(),
        }
    }
}

impl Default for HandleCacheOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

pub struct HandleCache {
    entries: DashMap<HandleKey, HandleEntry>,
    disposal: DashMap<u64, DisposalEntry>,
    last_sweep: Mutex<Instant>,
    options: HandleCacheOptions,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for HandleCache {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HandleCache")
            .field("entries", &self.entries.len())
            .field("disposal", &self.disposal.len())
            .field("options", &self.options)
            .finish()
    }
}

impl HandleCache {
    pub fn new(options: HandleCacheOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    pub fn with_clock(options: HandleCacheOptions, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            entries: DashMap::new(),
            disposal: DashMap::new(),
            last_sweep: Mutex::new(now),
            options,
            clock,
        }
    }

    /// Process-wide cache with default options, created on first use.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<HandleCache>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(HandleCache::new(HandleCacheOptions::default()))))
    }

    pub fn options(&self) -> &HandleCacheOptions {
        &self.options
    }

    pub fn acquire(&self, key: &HandleKey, force_new: bool) -> Result<HandleLease, Error> {
        let now = self.clock.now();
        let observed = self.entries.get(key).map(|entry| entry.value().clone());

        if let Some(entry) = &observed
            && entry.is_live(now)
        {
            let fresh_enough =
                now.saturating_duration_since(entry.created_at) < self.options.regenerate_after;
            if (!force_new || fresh_enough)
                && let Some(client) = entry.handle.client()
            {
                return Ok(HandleLease {
                    handle: Arc::clone(&entry.handle),
                    client,
                    cached: true,
                });
            }
        }

        let created = Arc::new(TransportHandle::create(key)?);
        let Some(client) = created.client() else {
            return Err(Error::InvalidRequest {
                message: "transport handle was disposed before use".to_owned(),
            });
        };

        if self.options.lifetime.is_zero() {
            debug!(handle = created.id, host = %key.host, "one-shot transport handle created");
            return Ok(HandleLease {
                handle: created,
                client,
                cached: false,
            });
        }

        let observed_id = observed.as_ref().map(|entry| entry.handle.id);
        if let Some((winner, winner_client)) = self.install(key, &created, observed_id) {
            created.dispose();
            self.maybe_sweep();
            return Ok(HandleLease {
                handle: winner,
                client: winner_client,
                cached: true,
            });
        }

        debug!(
            handle = created.id,
            host = %key.host,
            port = key.port,
            force_new,
            "transport handle created"
        );
        self.maybe_sweep();

        Ok(HandleLease {
            handle: created,
            client,
            cached: true,
        })
    }

    /// Puts `created` into the cache unless another caller installed a live handle for the
    /// key since `observed_id` was read, in which case that winner is returned instead.
    fn install(
        &self,
        key: &HandleKey,
        created: &Arc<TransportHandle>,
        mut observed_id: Option<u64>,
    ) -> Option<(Arc<TransportHandle>, HyperClient)> {
        loop {
            let now = self.clock.now();
            let fresh_entry = HandleEntry {
                handle: Arc::clone(created),
                created_at: now,
                expires_at: now + self.options.lifetime,
            };

            let mut retired = None;
            let mut adopted = None;
            match self.entries.entry(key.clone()) {
                Entry::Occupied(mut occupied) => {
                    let current = occupied.get();
                    if Some(current.handle.id) != observed_id && current.is_live(now) {
                        adopted = Some(Arc::clone(&current.handle));
                    } else {
                        retired = Some(occupied.insert(fresh_entry));
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(fresh_entry);
                }
            }

            if let Some(winner) = adopted {
                if let Some(winner_client) = winner.client() {
                    return Some((winner, winner_client));
                }
                // Disposed between the liveness check and the clone; replace it.
                observed_id = Some(winner.id);
                continue;
            }

            if let Some(old) = retired {
                self.retire(key, old.handle, now);
            }
            return None;
        }
    }

    fn retire(&self, key: &HandleKey, handle: Arc<TransportHandle>, now: Instant) {
        if handle.is_disposed() {
            return;
        }
        let dispose_at = now + key.timeout + self.options.disposal_margin;
        debug!(handle = handle.id, "transport handle retired");
        self.disposal
            .insert(handle.id, DisposalEntry { handle, dispose_at });
    }

    fn maybe_sweep(&self) {
        let now = self.clock.now();
        {
            let Ok(mut last_sweep) = self.last_sweep.try_lock() else {
                return;
            };
            if now.saturating_duration_since(*last_sweep) < self.options.sweep_interval {
                return;
            }
            *last_sweep = now;
        }
        self.sweep_due(now);
    }

    /// Disposes every retired handle whose deadline has passed. Returns how many were disposed.
    pub fn sweep(&self) -> usize {
        self.sweep_due(self.clock.now())
    }

    fn sweep_due(&self, now: Instant) -> usize {
        let due: Vec<u64> = self
            .disposal
            .iter()
            .filter(|entry| entry.dispose_at <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut disposed = 0;
        for id in due {
            if let Some((_, entry)) = self.disposal.remove(&id)
                && entry.handle.dispose()
            {
                disposed += 1;
            }
        }
        disposed
    }

    /// Drains the cache and the disposal queue, disposing every handle immediately.
    pub fn shutdown(&self) -> usize {
        let mut disposed = 0;
        let keys: Vec<HandleKey> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key)
                && entry.handle.dispose()
            {
                disposed += 1;
            }
        }
        let ids: Vec<u64> = self.disposal.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.disposal.remove(&id)
                && entry.handle.dispose()
            {
                disposed += 1;
            }
        }
        disposed
    }

    pub fn cached_len(&self) -> usize {
        self.entries.len()
    }

    pub fn disposal_len(&self) -> usize {
        self.disposal.len()
    }

    pub fn is_pending_disposal(&self, handle_id: u64) -> bool {
        self.disposal.contains_key(&handle_id)
    }
}

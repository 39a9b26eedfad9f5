//! Deduplication of concurrent requests for the same resource.
//!
//! The [`FetchCoordinator`] is the entry point for callers. A request for a [`ResourceId`] moves
//! through these states:
//!
//! - *Idle*: nobody is waiting, no fetch is running.
//! - *Lookup*: the memory tier is consulted inline. A hit is delivered to the caller right away
//!   and the resource stays idle.
//! - *Fetching*: on a miss, the caller is registered as a waiter of the single active fetch for
//!   that resource, starting it if needed. The fetch first tries the persistent tier, then opens
//!   a [`StreamSource`], persists the raw bytes, and decodes them exactly once.
//! - Back to *Idle*: the outcome is fanned out to every waiter still registered at that moment.
//!
//! Waiters are held weakly and may cancel at any time. Removing the last waiter of a fetch aborts
//! it. Every waiter that is not canceled receives exactly one outcome.
//!
//! Outcomes of running fetches are delivered in order from a single dispatch task. Outcomes that
//! are known right away (memory hits, short-circuited failures) are delivered inline, before
//! [`resolve`](FetchCoordinator::resolve) returns.
//!
//! ### Metrics
//!
//! - `fetch.started`: A new fetch was started, tagged by `source`.
//! - `fetch.coalesced`: A request joined an already running fetch.
//! - `fetch.failure`: A fetch failed, tagged by `error`.
//! - `fetch.canceled`: A fetch was aborted because its last waiter went away.
//! - `fetch.short_circuited`: A request was refused because of a recorded failure.
//! - `fetch.duration`: Time from starting a fetch until its outcome is fanned out.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use sentry::SentryFutureExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::caching::{CacheContents, CacheCoordinator, CacheError, CacheKey, MemoryPressure};
use crate::decode::Decoder;
use crate::download::{DownloadService, StreamSource};
use crate::types::{Dimensions, ResourceId};

mod failures;
mod listener;

pub use self::failures::{FailureRecord, RetryPolicy};
pub use self::listener::{ChannelListener, Listener, Outcome};

/// How a call to [`FetchCoordinator::resolve`] was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The payload was found in memory and delivered inline.
    Found,
    /// The request failed right away, and the failure was delivered inline.
    Failed,
    /// The caller is waiting for a running fetch.
    Pending,
}

struct Waiter<T> {
    listener: Weak<dyn Listener<T>>,
    size_hint: Option<Dimensions>,
}

impl<T> Waiter<T> {
    fn is<L: ?Sized>(&self, listener: &Arc<L>) -> bool {
        std::ptr::addr_eq(self.listener.as_ptr(), Arc::as_ptr(listener))
    }

    fn is_alive(&self) -> bool {
        self.listener.strong_count() > 0
    }
}

struct ActiveFetch<T> {
    /// Distinguishes this fetch from later fetches of the same resource.
    serial: u64,
    waiters: Vec<Waiter<T>>,
    task: AbortHandle,
    started: Instant,
}

struct Registry<T> {
    fetches: HashMap<ResourceId, ActiveFetch<T>>,
    next_serial: u64,
}

/// One outcome, on its way to one waiter.
struct Delivery<T> {
    listener: Weak<dyn Listener<T>>,
    id: ResourceId,
    result: CacheContents<Arc<T>>,
}

impl<T: 'static> Delivery<T> {
    fn deliver(self) {
        let Some(listener) = self.listener.upgrade() else {
            tracing::trace!(id = %self.id, "Dropping outcome of a released listener");
            return;
        };

        let id = &self.id;
        let result = self.result;
        let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| match result {
            Ok(payload) => listener.on_success(id, payload),
            Err(error) => listener.on_failure(id, error),
        }));
        if delivered.is_err() {
            tracing::error!(%id, "Listener panicked while handling an outcome");
        }
    }
}

/// Drains the delivery queue, so all outcomes of running fetches land on one task.
async fn dispatch<T: 'static>(mut deliveries: mpsc::UnboundedReceiver<Delivery<T>>) {
    while let Some(delivery) = deliveries.recv().await {
        delivery.deliver();
    }
}

struct Inner<D: Decoder> {
    cache: CacheCoordinator<D>,
    downloader: Arc<DownloadService>,
    failures: FailureRecord,
    registry: Mutex<Registry<D::Item>>,
    deliveries: mpsc::UnboundedSender<Delivery<D::Item>>,
    runtime: Handle,
}

impl<D: Decoder> Inner<D> {
    /// Registers `waiter` with the running fetch for `id`, or starts a new one.
    fn join_or_start(self: &Arc<Self>, id: &ResourceId, waiter: Waiter<D::Item>) -> CacheContents {
        let mut registry = self.registry.lock().unwrap();

        if let Some(fetch) = registry.fetches.get_mut(id) {
            fetch.waiters.retain(Waiter::is_alive);
            fetch.waiters.push(waiter);
            metric!(counter("fetch.coalesced") += 1);
            tracing::trace!(%id, waiters = fetch.waiters.len(), "Joined running fetch");
            return Ok(());
        }

        // a fetch that completed since the first check might have recorded a failure
        self.failures.check(id)?;

        let source = match StreamSource::from_resource_id(id) {
            Ok(source) => source,
            Err(error) => {
                self.failures.record(id, &error);
                return Err(error);
            }
        };

        registry.next_serial += 1;
        let serial = registry.next_serial;

        metric!(counter("fetch.started") += 1, "source" => source.source_metric_key());
        tracing::debug!(%id, %source, "Starting fetch");

        let job = self
            .clone()
            .run_fetch(id.clone(), serial, source, waiter.size_hint);
        let task = self.runtime.spawn(job.bind_hub(sentry::Hub::current()));

        registry.fetches.insert(
            id.clone(),
            ActiveFetch {
                serial,
                waiters: vec![waiter],
                task: task.abort_handle(),
                started: Instant::now(),
            },
        );
        Ok(())
    }

    async fn run_fetch(
        self: Arc<Self>,
        id: ResourceId,
        serial: u64,
        source: StreamSource,
        size_hint: Option<Dimensions>,
    ) {
        let result = self.produce(&id, serial, source, size_hint).await;
        self.complete(&id, serial, result);
    }

    /// Loads the raw bytes from disk or the source, then decodes them once.
    ///
    /// A disk entry that fails to decode is discarded and the source is fetched instead.
    async fn produce(
        &self,
        id: &ResourceId,
        serial: u64,
        source: StreamSource,
        size_hint: Option<Dimensions>,
    ) -> CacheContents<Arc<D::Item>> {
        if let Some(data) = self.cache.load_from_disk(id, size_hint).await {
            let decode_hint = self.decode_hint(id, serial);
            match self.cache.decode(data, decode_hint).await {
                Ok(payload) => {
                    if self.cache.repopulates_memory() {
                        self.cache.store(id, decode_hint, payload.clone());
                    }
                    return Ok(payload);
                }
                Err(error) => {
                    tracing::warn!(%id, %error, "Discarding undecodable cache entry");
                    self.cache.discard_from_disk(id, size_hint).await;
                }
            }
        }

        let persistable = source.is_persistable();
        // dropping this future along with the download cancels it
        let data = self.downloader.start(source).outcome().await?;

        // persist first, so a crash while decoding loses no work
        if persistable {
            self.cache
                .persist(CacheKey::for_resource(id), data.clone())
                .await;
        }

        let decode_hint = self.decode_hint(id, serial);
        let payload = self.cache.decode(data, decode_hint).await?;
        self.cache.store(id, decode_hint, payload.clone());
        Ok(payload)
    }

    /// The size hint shared by all current waiters, or `None` if they disagree.
    fn decode_hint(&self, id: &ResourceId, serial: u64) -> Option<Dimensions> {
        let registry = self.registry.lock().unwrap();
        let fetch = registry.fetches.get(id).filter(|f| f.serial == serial)?;

        let mut hints = fetch.waiters.iter().map(|waiter| waiter.size_hint);
        let first = hints.next()?;
        hints.all(|hint| hint == first).then_some(first).flatten()
    }

    /// Fans the outcome of fetch `serial` out to all of its waiters.
    fn complete(&self, id: &ResourceId, serial: u64, result: CacheContents<Arc<D::Item>>) {
        let fetch = {
            let mut registry = self.registry.lock().unwrap();
            if !matches!(registry.fetches.get(id), Some(fetch) if fetch.serial == serial) {
                // canceled while finishing up
                return;
            }

            // record before removing the fetch, so later requests see the failure
            match &result {
                Ok(_) => self.failures.clear(id),
                Err(error) => self.failures.record(id, error),
            }
            registry.fetches.remove(id)
        };
        let Some(fetch) = fetch else {
            return;
        };

        metric!(timer("fetch.duration") = fetch.started.elapsed());
        match &result {
            Ok(_) => tracing::debug!(%id, waiters = fetch.waiters.len(), "Fetch succeeded"),
            Err(error) => {
                metric!(counter("fetch.failure") += 1, "error" => error.as_tag());
                tracing::debug!(%id, %error, waiters = fetch.waiters.len(), "Fetch failed");
            }
        }

        for waiter in fetch.waiters {
            let delivery = Delivery {
                listener: waiter.listener,
                id: id.clone(),
                result: result.clone(),
            };
            if self.deliveries.send(delivery).is_err() {
                tracing::error!(%id, "Outcome dispatcher is gone");
            }
        }
    }
}

/// Resolves resources to decoded payloads, sharing one fetch among all concurrent requests for
/// the same resource.
pub struct FetchCoordinator<D: Decoder> {
    inner: Arc<Inner<D>>,
}

impl<D: Decoder> Clone for FetchCoordinator<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Decoder> fmt::Debug for FetchCoordinator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self.inner.registry.lock().unwrap().fetches.len();
        f.debug_struct("FetchCoordinator")
            .field("cache", &self.inner.cache)
            .field("failures", &self.inner.failures)
            .field("active_fetches", &active)
            .finish()
    }
}

impl<D: Decoder> FetchCoordinator<D> {
    /// Creates a new coordinator, spawning its dispatch task on `runtime`.
    pub fn new(
        cache: CacheCoordinator<D>,
        downloader: Arc<DownloadService>,
        failures: FailureRecord,
        runtime: Handle,
    ) -> Self {
        let (deliveries, receiver) = mpsc::unbounded_channel();
        runtime.spawn(dispatch(receiver));

        Self {
            inner: Arc::new(Inner {
                cache,
                downloader,
                failures,
                registry: Mutex::new(Registry {
                    fetches: HashMap::new(),
                    next_serial: 0,
                }),
                deliveries,
                runtime,
            }),
        }
    }

    pub fn cache(&self) -> &CacheCoordinator<D> {
        &self.inner.cache
    }

    pub fn failures(&self) -> &FailureRecord {
        &self.inner.failures
    }

    /// Resolves `id` and reports the outcome to `listener`.
    ///
    /// This never blocks. A memory hit or an immediate failure is reported before this returns,
    /// everything else is reported later from the dispatch task. The coordinator only holds a
    /// weak reference to `listener`.
    pub fn resolve<L: Listener<D::Item>>(
        &self,
        id: &ResourceId,
        listener: &Arc<L>,
        size_hint: Option<Dimensions>,
    ) -> Resolution {
        if id.is_empty() {
            listener.on_failure(id, CacheError::Unsupported("empty resource id".into()));
            return Resolution::Failed;
        }

        if let Err(error) = self.inner.failures.check(id) {
            metric!(counter("fetch.short_circuited") += 1);
            tracing::debug!(%id, "Refusing to fetch a recently failed resource");
            listener.on_failure(id, error);
            return Resolution::Failed;
        }

        if let Some(payload) = self.inner.cache.lookup_memory(id, size_hint) {
            listener.on_success(id, payload);
            return Resolution::Found;
        }

        let weak: Weak<L> = Arc::downgrade(listener);
        let weak: Weak<dyn Listener<D::Item>> = weak;
        let waiter = Waiter {
            listener: weak,
            size_hint,
        };
        match self.inner.join_or_start(id, waiter) {
            Ok(()) => Resolution::Pending,
            Err(error) => {
                listener.on_failure(id, error);
                Resolution::Failed
            }
        }
    }

    /// Resolves `id`, waiting for the outcome.
    ///
    /// Dropping the returned future cancels the request.
    pub async fn fetch(
        &self,
        id: &ResourceId,
        size_hint: Option<Dimensions>,
    ) -> CacheContents<Arc<D::Item>> {
        let (listener, mut outcomes) = ChannelListener::channel();
        let _guard = CancelGuard {
            coordinator: self,
            listener: &listener,
            id,
        };

        self.resolve(id, &listener, size_hint);
        match outcomes.recv().await {
            Some((_, result)) => result,
            None => Err(CacheError::InternalError),
        }
    }

    /// Removes one registration of `listener` for `id`.
    ///
    /// If that leaves the fetch for `id` without waiters, the fetch is aborted. Returns whether a
    /// registration was removed.
    pub fn cancel<L: ?Sized>(&self, listener: &Arc<L>, id: &ResourceId) -> bool {
        let mut registry = self.inner.registry.lock().unwrap();
        let Some(fetch) = registry.fetches.get_mut(id) else {
            return false;
        };
        let Some(position) = fetch.waiters.iter().position(|w| w.is(listener)) else {
            return false;
        };

        fetch.waiters.remove(position);
        fetch.waiters.retain(Waiter::is_alive);
        if fetch.waiters.is_empty()
            && let Some(fetch) = registry.fetches.remove(id)
        {
            abort_fetch(id, fetch);
        }
        true
    }

    /// Removes every registration of `listener`, returning how many were removed.
    pub fn cancel_all<L: ?Sized>(&self, listener: &Arc<L>) -> usize {
        let mut registry = self.inner.registry.lock().unwrap();
        let mut removed = 0;
        let mut orphaned = Vec::new();

        for (id, fetch) in registry.fetches.iter_mut() {
            let before = fetch.waiters.len();
            fetch.waiters.retain(|w| !w.is(listener));
            removed += before - fetch.waiters.len();
            if fetch.waiters.len() < before {
                fetch.waiters.retain(Waiter::is_alive);
                if fetch.waiters.is_empty() {
                    orphaned.push(id.clone());
                }
            }
        }

        for id in orphaned {
            if let Some(fetch) = registry.fetches.remove(&id) {
                abort_fetch(&id, fetch);
            }
        }
        removed
    }

    /// Whether a fetch for `id` is currently running.
    pub fn is_fetching(&self, id: &ResourceId) -> bool {
        self.inner
            .registry
            .lock()
            .unwrap()
            .fetches
            .contains_key(id)
    }

    /// The number of waiters registered with the running fetch for `id`.
    pub fn waiter_count(&self, id: &ResourceId) -> usize {
        let registry = self.inner.registry.lock().unwrap();
        registry.fetches.get(id).map_or(0, |fetch| fetch.waiters.len())
    }

    /// Drops all cached renditions and the recorded failure of `id`.
    pub async fn invalidate(&self, id: &ResourceId) {
        self.inner.failures.clear(id);
        self.inner.cache.remove(id).await;
    }

    /// Reacts to a memory-pressure signal.
    pub fn on_pressure(&self, pressure: MemoryPressure) {
        self.inner.cache.on_pressure(pressure);
    }

    /// Reacts to the system running low on memory.
    pub fn on_low_memory(&self) {
        self.inner.cache.on_low_memory();
    }
}

fn abort_fetch<T>(id: &ResourceId, fetch: ActiveFetch<T>) {
    fetch.task.abort();
    metric!(counter("fetch.canceled") += 1);
    tracing::debug!(%id, "Aborted fetch without waiters");
}

/// Cancels the registration of a [`FetchCoordinator::fetch`] call when it is dropped early.
struct CancelGuard<'a, D: Decoder> {
    coordinator: &'a FetchCoordinator<D>,
    listener: &'a Arc<ChannelListener<D::Item>>,
    id: &'a ResourceId,
}

impl<D: Decoder> Drop for CancelGuard<'_, D> {
    fn drop(&mut self) {
        self.coordinator.cancel(self.listener, self.id);
    }
}

#[cfg(test)]
mod tests;

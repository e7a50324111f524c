use std::any::Any;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared, TryFutureExt};
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};

use crate::error::{LoadError, LoadResult};
use crate::loader::Loader;
use crate::types::{Loaded, Options, ResourceKey};
use crate::utils::defer::CallOnDrop;

type LoadChannel = Shared<oneshot::Receiver<LoadResult<Loaded>>>;
type DiscardFn = Box<dyn FnOnce(Loaded) + Send + 'static>;

/// The outcome of [`MemoizingLoader::evict`].
pub(crate) enum Eviction {
    /// The key was cached, this is the value that was removed.
    Cached(Loaded),
    /// A load for the key is still running. Its value will not be cached.
    Loading,
    /// There was nothing to evict.
    Missing,
}

#[derive(Default)]
struct CacheState {
    /// Successfully loaded resources.
    resolved: BTreeMap<ResourceKey, Loaded>,
    /// Loads that are currently running, used for deduplicating concurrent requests.
    in_flight: BTreeMap<ResourceKey, LoadChannel>,
    /// Running loads whose value was evicted before it arrived.
    ///
    /// The value is handed to the callback instead of being cached, unless somebody requests
    /// the key again while it is still loading.
    discarded: BTreeMap<ResourceKey, DiscardFn>,
}

/// Wraps a [`Loader`] and memoizes its results.
///
/// At most one underlying load runs per key at any time. Concurrent requests for the same
/// key attach to that load and all observe its outcome. Successful results are kept until
/// they are explicitly evicted, failures are never cached.
///
/// Loads are spawned onto the current Tokio runtime, which means [`load`](Self::load) has to
/// be called from within a runtime. A spawned load keeps running even when everybody waiting
/// for it has gone away.
pub struct MemoizingLoader<L> {
    inner: Arc<L>,
    state: Arc<Mutex<CacheState>>,
    timeout: Option<Duration>,
}

impl<L> Clone for MemoizingLoader<L> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        MemoizingLoader {
            inner: Arc::clone(&self.inner),
            state: Arc::clone(&self.state),
            timeout: self.timeout,
        }
    }
}

impl<L> fmt::Debug for MemoizingLoader<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (resolved, in_flight) = self
            .state
            .try_lock()
            .map(|state| (state.resolved.len(), state.in_flight.len()))
            .unwrap_or_default();
        f.debug_struct("MemoizingLoader")
            .field("resolved", &resolved)
            .field("in_flight", &in_flight)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<L: Loader> MemoizingLoader<L> {
    pub fn new(inner: L) -> Self {
        MemoizingLoader {
            inner: Arc::new(inner),
            state: Default::default(),
            timeout: None,
        }
    }

    /// Fails underlying loads that take longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The wrapped loader.
    pub fn inner(&self) -> &L {
        &self.inner
    }

    /// Whether the wrapped loader is able to load `key`.
    pub fn supports(&self, key: &ResourceKey) -> bool {
        self.inner.supports(key)
    }

    /// Loads the resource at `key` as a value of type `T`.
    ///
    /// Cached values are returned right away. If a load for `key` is already running, the
    /// returned future waits for it instead of starting another one.
    ///
    /// # Errors
    ///
    /// Fails with whatever error the underlying load produced, shared between all concurrent
    /// callers. If the loaded value is not a `T`, this fails with
    /// [`LoadError::TypeMismatch`].
    pub fn load<T>(&self, key: &ResourceKey, options: &Options) -> BoxFuture<'static, LoadResult<Arc<T>>>
    where
        T: Any + Send + Sync,
    {
        let key = key.clone();
        let shared = self.load_shared(&key, options);

        Box::pin(async move {
            let loaded = shared.await?;
            loaded.downcast::<T>(&key).inspect_err(|err| {
                tracing::error!(
                    error = err as &dyn Error,
                    key = %key,
                    "Resource requested with an incompatible type",
                );
            })
        })
    }

    /// Drops all cached resources.
    ///
    /// Loads that are currently running are not affected and will be cached once they
    /// complete.
    pub fn clear_cache(&self) {
        self.state.lock().resolved.clear();
    }

    /// Whether a successfully loaded value for `key` is cached.
    pub fn is_cached(&self, key: &ResourceKey) -> bool {
        self.state.lock().resolved.contains_key(key)
    }

    /// Whether a load for `key` is currently running.
    pub fn is_loading(&self, key: &ResourceKey) -> bool {
        self.state.lock().in_flight.contains_key(key)
    }

    /// Evicts the cached value for `key`.
    ///
    /// If a load for `key` is still running, its value is not cached once it completes.
    /// `on_discard` receives that value instead, unless the key is requested again before
    /// the load completes.
    pub(crate) fn evict<F>(&self, key: &ResourceKey, on_discard: F) -> Eviction
    where
        F: FnOnce(Loaded) + Send + 'static,
    {
        let mut state = self.state.lock();
        if let Some(loaded) = state.resolved.remove(key) {
            return Eviction::Cached(loaded);
        }
        if !state.in_flight.contains_key(key) {
            return Eviction::Missing;
        }

        tracing::trace!(%key, "Discarding running load");
        state.discarded.insert(key.clone(), Box::new(on_discard));
        Eviction::Loading
    }

    /// Returns the raw loaded value, joining or starting a shared load if needed.
    fn load_shared(&self, key: &ResourceKey, options: &Options) -> BoxFuture<'static, LoadResult<Loaded>> {
        metric!(counter("loader.access") += 1);

        let (channel, sender) = {
            let mut state = self.state.lock();
            if let Some(loaded) = state.resolved.get(key) {
                metric!(counter("loader.memory.hit") += 1);
                tracing::trace!(%key, "Serving resource from memory");
                return Box::pin(future::ready(Ok(loaded.clone())));
            }

            if let Some(channel) = state.in_flight.get(key).cloned() {
                // A concurrent load was deduplicated.
                metric!(counter("loader.channel.hit") += 1);
                tracing::trace!(%key, "Joining running load");
                // The value is wanted again after all.
                state.discarded.remove(key);
                (channel, None)
            } else {
                metric!(counter("loader.channel.miss") += 1);
                let (sender, receiver) = oneshot::channel();
                let channel = receiver.shared();
                let evicted = state.in_flight.insert(key.clone(), channel.clone());
                debug_assert!(evicted.is_none());
                (channel, Some(sender))
            }
        };

        if let Some(sender) = sender {
            self.spawn_load(key.clone(), options, sender);
        }

        let key = key.clone();
        Box::pin(channel.unwrap_or_else(move |_cancelled| Err(LoadError::Interrupted(key))))
    }

    /// Runs the underlying load on the runtime and publishes its result to `sender`.
    fn spawn_load(
        &self,
        key: ResourceKey,
        options: &Options,
        sender: oneshot::Sender<LoadResult<Loaded>>,
    ) {
        tracing::trace!(%key, "Spawning deduplicated load");

        // Only runs when the task goes away without completing, for example during runtime
        // shutdown. Waiters then see a cancelled channel.
        let remove_in_flight = {
            let state = Arc::clone(&self.state);
            let key = key.clone();
            CallOnDrop::new(move || {
                let mut state = state.lock();
                state.in_flight.remove(&key);
                state.discarded.remove(&key);
            })
        };

        let computation = self.inner.load(&key, options);
        let timeout = self.timeout;
        let state = Arc::clone(&self.state);

        let task = async move {
            let start = Instant::now();
            let result = match timeout {
                Some(timeout) => tokio::time::timeout(timeout, computation)
                    .await
                    .unwrap_or(Err(LoadError::Timeout(timeout))),
                None => computation.await,
            };

            metric!(
                timer("loader.computation") = start.elapsed(),
                "status" => match &result {
                    Ok(_) => "ok",
                    Err(err) => err.metrics_tag(),
                },
            );

            let on_discard = {
                let mut state = state.lock();
                // Evict while still holding the lock. Callers either see the resolved value
                // or start a new load, but never join a channel that already fired.
                state.in_flight.remove(&key);
                let on_discard = state.discarded.remove(&key);
                if let (None, Ok(loaded)) = (&on_discard, &result) {
                    state.resolved.insert(key.clone(), loaded.clone());
                }
                on_discard
            };
            remove_in_flight.disarm();

            if let (Some(on_discard), Ok(loaded)) = (on_discard, &result) {
                tracing::trace!(%key, "Load completed after its value was evicted");
                on_discard(loaded.clone());
            }

            if let Err(err) = &result {
                tracing::debug!(error = err as &dyn Error, %key, "Failed to load resource");
            }
            sender.send(result).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        tokio::spawn(task);
    }
}

impl<L: Loader> Loader for MemoizingLoader<L> {
    fn supports(&self, key: &ResourceKey) -> bool {
        self.inner.supports(key)
    }

    fn load(&self, key: &ResourceKey, options: &Options) -> BoxFuture<'static, LoadResult<Loaded>> {
        Box::pin(
            self.load_shared(key, options)
                .map_ok(|loaded| Loaded::Shared(loaded.instance())),
        )
    }
}

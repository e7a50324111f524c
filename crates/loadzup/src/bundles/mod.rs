//! Reference-counted loading of asset bundles.
//!
//! A bundle stays loaded as long as anybody holds a reference on it. There are three kinds
//! of references, tracked independently:
//!
//! - a *root* reference, taken by [`BundleLoader::load`] and released by
//!   [`BundleLoader::unload`]. Taking it multiple times has no additional effect.
//! - *dependency* references, one per dependent bundle, taken by
//!   [`BundleLoader::load_dependency`] and released by [`BundleLoader::unload_dependency`].
//! - *loading* references, one per call to either load method, held by the returned future
//!   and then by the [`BundleHandle`] it resolves to.
//!
//! Once all of them are gone, the bundle is [unloaded](Bundle::unload) and evicted from the
//! cache.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::config::BundlesConfig;
use crate::error::LoadResult;
use crate::loader::Loader;
use crate::memoized::{Eviction, MemoizingLoader};
use crate::types::{Loaded, Options, ResourceKey};
use crate::utils::defer::CallOnDrop;

mod handle;
mod locator;
mod refcount;

pub use handle::{Bundle, BundleHandle, SharedBundle};
pub use locator::{BundleLocator, PlatformProvider};
pub use refcount::RefCountSnapshot;

use refcount::{RefCount, Reference};

struct Inner<L> {
    memoized: MemoizingLoader<L>,
    locator: BundleLocator,
    refs: Mutex<BTreeMap<String, RefCount>>,
}

/// Loads bundles through a [`MemoizingLoader`] and unloads them once unreferenced.
///
/// See the [module documentation](self) for the reference model.
pub struct BundleLoader<L> {
    inner: Arc<Inner<L>>,
}

impl<L> Clone for BundleLoader<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L> fmt::Debug for BundleLoader<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracked = self.inner.refs.try_lock().map(|refs| refs.len());
        f.debug_struct("BundleLoader")
            .field("locator", &self.inner.locator)
            .field("tracked", &tracked)
            .field("memoized", &self.inner.memoized)
            .finish()
    }
}

impl<L: Loader> BundleLoader<L> {
    pub fn new(loader: L, locator: BundleLocator) -> Self {
        Self::with_memoized(MemoizingLoader::new(loader), locator)
    }

    pub fn from_config(loader: L, config: &BundlesConfig) -> Self {
        let memoized = MemoizingLoader::new(loader).with_timeout(config.load_timeout);
        Self::with_memoized(memoized, BundleLocator::from_config(config))
    }

    /// Loads bundles through an already configured [`MemoizingLoader`].
    ///
    /// The memoizing loader should not be shared with anybody else, since releasing a
    /// bundle evicts it from that cache.
    pub fn with_memoized(memoized: MemoizingLoader<L>, locator: BundleLocator) -> Self {
        Self {
            inner: Arc::new(Inner {
                memoized,
                locator,
                refs: Default::default(),
            }),
        }
    }

    /// The cache this loader loads through.
    pub fn memoized(&self) -> &MemoizingLoader<L> {
        &self.inner.memoized
    }

    pub fn locator(&self) -> &BundleLocator {
        &self.inner.locator
    }

    /// Whether the underlying loader is able to load the named bundle.
    pub fn supports(&self, name: &str) -> bool {
        self.inner.memoized.supports(&self.inner.locator.key_for(name))
    }

    /// Loads a bundle and takes a root reference on it.
    ///
    /// The root reference is taken immediately, before the returned future is polled. It
    /// stays in place until [`unload`](Self::unload) is called, or until the load fails.
    pub fn load(&self, name: &str, options: &Options) -> BoxFuture<'static, LoadResult<BundleHandle>> {
        self.load_with(name, options, Reference::Root)
    }

    /// Loads a bundle on behalf of the bundle named `dependent`.
    ///
    /// Every dependent holds at most one reference, no matter how often it loads the bundle.
    pub fn load_dependency(
        &self,
        name: &str,
        options: &Options,
        dependent: &str,
    ) -> BoxFuture<'static, LoadResult<BundleHandle>> {
        self.load_with(name, options, Reference::Dependency(dependent.to_owned()))
    }

    /// Releases the root reference on a bundle.
    ///
    /// Returns `true` if this released the last reference on the bundle. It is then unloaded
    /// right away, or as soon as its load completes if that is still running. A load that
    /// failed leaves nothing to unload. Bundles that are unknown, or that are only held as a
    /// dependency, are left alone and `false` is returned.
    pub fn unload(&self, name: &str) -> bool {
        self.inner.release(name, &Reference::Root)
    }

    /// Releases the reference `dependent` holds on a bundle.
    pub fn unload_dependency(&self, name: &str, dependent: &str) {
        self.inner
            .release(name, &Reference::Dependency(dependent.to_owned()));
    }

    /// The references currently held on a bundle, or `None` if it is not tracked.
    pub fn ref_count(&self, name: &str) -> Option<RefCountSnapshot> {
        self.inner.refs.lock().get(name).map(RefCount::snapshot)
    }

    /// The number of bundles currently tracked.
    pub fn tracked(&self) -> usize {
        self.inner.refs.lock().len()
    }

    /// Drops all cached values of the underlying loader.
    ///
    /// Tracked references are kept, bundles that are still referenced are not unloaded.
    pub fn clear_cache(&self) {
        self.inner.memoized.clear_cache();
    }

    fn load_with(
        &self,
        name: &str,
        options: &Options,
        reference: Reference,
    ) -> BoxFuture<'static, LoadResult<BundleHandle>> {
        // References have to be in place before the load starts, otherwise a concurrent
        // unload could release the bundle while it is still loading.
        self.inner.add(name, &reference);

        let loading = {
            let inner = Arc::clone(&self.inner);
            let name = name.to_owned();
            CallOnDrop::new(move || {
                inner.release(&name, &Reference::Loading);
            })
        };

        let key = self.inner.locator.key_for(name);
        let load = self.inner.memoized.load::<SharedBundle>(&key, options);
        let inner = Arc::clone(&self.inner);
        let name = name.to_owned();

        Box::pin(async move {
            match load.await {
                Ok(bundle) => {
                    let bundle = SharedBundle::clone(&bundle);
                    inner.set_bundle(&name, &bundle);
                    Ok(BundleHandle::new(bundle, loading))
                }
                Err(err) => {
                    tracing::debug!(
                        error = &err as &dyn Error,
                        bundle = %name,
                        "Failed to load bundle, releasing its references",
                    );
                    inner.release(&name, &reference);
                    drop(loading);
                    Err(err)
                }
            }
        })
    }
}

impl<L: Loader> Inner<L> {
    /// Adds `reference` together with a loading reference.
    fn add(&self, name: &str, reference: &Reference) {
        let mut refs = self.refs.lock();
        let record = refs.entry(name.to_owned()).or_default();
        record.add(reference);
        record.add_loading();
        metric!(gauge("bundles.tracked") = refs.len() as u64);
    }

    fn set_bundle(&self, name: &str, bundle: &SharedBundle) {
        // The caller still holds a loading reference, so the record is there.
        if let Some(record) = self.refs.lock().get_mut(name) {
            record.set_bundle(Arc::clone(bundle));
        }
    }

    /// Releases a reference and unloads the bundle if it was the last one.
    ///
    /// Returns `true` if the last reference was released.
    fn release(&self, name: &str, reference: &Reference) -> bool {
        let key = self.locator.key_for(name);

        let (bundle, eviction) = {
            let mut refs = self.refs.lock();

            let unreferenced = match refs.get_mut(name) {
                None => {
                    tracing::debug!(bundle = name, "Cannot release bundle, it is not loaded");
                    return false;
                }
                Some(record) if *reference == Reference::Root && !record.is_root_loaded() => {
                    tracing::debug!(
                        bundle = name,
                        "Bundle is only loaded as a dependency, keeping it"
                    );
                    return false;
                }
                Some(record) => record.release(reference),
            };
            if !unreferenced {
                return false;
            }

            let record = refs.remove(name);
            metric!(gauge("bundles.tracked") = refs.len() as u64);

            // A load that is still running was abandoned by everybody waiting for it. Its
            // bundle has to be unloaded as soon as it arrives.
            let eviction = self.memoized.evict(&key, {
                let name = name.to_owned();
                let key = key.clone();
                move |loaded| unload_loaded(&name, &key, &loaded)
            });

            (record.and_then(|mut record| record.take_bundle()), eviction)
        };

        match (bundle, eviction) {
            (Some(bundle), _) => unload_bundle(name, &bundle),
            // The record misses its bundle if the handle was never produced, for example
            // because the load future was dropped right after the load completed.
            (None, Eviction::Cached(loaded)) => unload_loaded(name, &key, &loaded),
            (None, Eviction::Loading) => {
                tracing::debug!(bundle = name, "Bundle is still loading, unloading it once done");
            }
            (None, Eviction::Missing) => {
                tracing::debug!(bundle = name, "Released bundle that never finished loading");
            }
        }
        true
    }
}

fn unload_bundle(name: &str, bundle: &SharedBundle) {
    tracing::debug!(bundle = name, "Unloading bundle");
    bundle.unload();
    metric!(counter("bundles.unloaded") += 1);
}

fn unload_loaded(name: &str, key: &ResourceKey, loaded: &Loaded) {
    match loaded.downcast::<SharedBundle>(key) {
        Ok(bundle) => unload_bundle(name, &bundle),
        Err(err) => {
            tracing::error!(
                error = &err as &dyn Error,
                bundle = name,
                "Cannot unload a value that is not a bundle",
            );
        }
    }
}

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::LoadResult;
use crate::types::{Loaded, ResourceKey};
use crate::utils::defer::CallOnDrop;

/// A loaded bundle of assets.
///
/// Bundles are shared between everybody holding a reference on them. Only the
/// [`BundleLoader`](super::BundleLoader) calls [`unload`](Self::unload), exactly once, when
/// the last reference is gone.
pub trait Bundle: Send + Sync + 'static {
    /// The name this bundle was built with.
    fn name(&self) -> &str;

    /// Loads a single asset out of this bundle.
    fn load_asset(&self, asset: &str) -> BoxFuture<'static, LoadResult<Loaded>>;

    /// Releases everything this bundle holds.
    fn unload(&self);
}

pub type SharedBundle = Arc<dyn Bundle>;

impl Loaded {
    /// Wraps a bundle so that a [`Loader`](crate::Loader) can return it.
    pub fn bundle<B: Bundle>(bundle: B) -> Self {
        Loaded::shared::<SharedBundle>(Arc::new(bundle))
    }
}

/// A bundle handed out by the [`BundleLoader`](super::BundleLoader).
///
/// Holding the handle keeps the load that produced it alive in the reference count.
/// Dropping it releases that loading reference, but does not unload the bundle by itself:
/// use [`BundleLoader::unload`](super::BundleLoader::unload) for that.
pub struct BundleHandle {
    bundle: SharedBundle,
    _loading: CallOnDrop,
}

impl BundleHandle {
    pub(super) fn new(bundle: SharedBundle, loading: CallOnDrop) -> Self {
        Self {
            bundle,
            _loading: loading,
        }
    }

    pub fn bundle(&self) -> &SharedBundle {
        &self.bundle
    }

    /// Loads an asset from the bundle as a value of type `T`.
    pub async fn load_asset_as<T: Any + Send + Sync>(&self, asset: &str) -> LoadResult<Arc<T>> {
        let loaded = self.bundle.load_asset(asset).await?;
        let key = ResourceKey::new(format!("{}/{}", self.bundle.name(), asset));
        loaded.downcast::<T>(&key)
    }
}

impl Deref for BundleHandle {
    type Target = dyn Bundle;

    fn deref(&self) -> &Self::Target {
        &*self.bundle
    }
}

impl fmt::Debug for BundleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleHandle")
            .field("name", &self.bundle.name())
            .finish()
    }
}

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::LoadResult;
use crate::types::{Loaded, Options, ResourceKey};

/// The transport that actually fetches and converts resources.
///
/// Implementations must be safe to call concurrently for distinct keys. They do not need
/// to deduplicate requests themselves, wrap them in a
/// [`MemoizingLoader`](crate::MemoizingLoader) for that.
pub trait Loader: Send + Sync + 'static {
    /// Whether this loader is able to load the given resource at all.
    fn supports(&self, key: &ResourceKey) -> bool;

    /// Loads the resource identified by `key`.
    ///
    /// The returned future must not borrow from `self`; clone whatever state is needed.
    fn load(&self, key: &ResourceKey, options: &Options) -> BoxFuture<'static, LoadResult<Loaded>>;
}

impl<L: Loader + ?Sized> Loader for Arc<L> {
    fn supports(&self, key: &ResourceKey) -> bool {
        (**self).supports(key)
    }

    fn load(&self, key: &ResourceKey, options: &Options) -> BoxFuture<'static, LoadResult<Loaded>> {
        (**self).load(key, options)
    }
}

impl<L: Loader + ?Sized> Loader for Box<L> {
    fn supports(&self, key: &ResourceKey) -> bool {
        (**self).supports(key)
    }

    fn load(&self, key: &ResourceKey, options: &Options) -> BoxFuture<'static, LoadResult<Loaded>> {
        (**self).load(key, options)
    }
}

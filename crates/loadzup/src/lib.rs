//! Memoizing, reference-counted resource loading.
//!
//! The [`MemoizingLoader`] wraps any [`Loader`] and makes sure every resource is loaded at
//! most once at a time, caching successful results. The [`BundleLoader`] builds on top of
//! it and unloads bundles once nobody references them anymore.

#[macro_use]
pub mod metrics;

pub mod bundles;
pub mod config;
pub mod error;
pub mod loader;
pub mod logging;
pub mod memoized;
pub mod types;
pub mod utils;

pub use bundles::{Bundle, BundleHandle, BundleLoader, BundleLocator, SharedBundle};
pub use error::{LoadError, LoadResult};
pub use loader::Loader;
pub use memoized::MemoizingLoader;
pub use types::{AnyValue, Loaded, Options, Prototype, ResourceKey};

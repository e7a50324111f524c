//! Core value types shared by all loaders.

use std::any::{Any, type_name};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{LoadError, LoadResult};

/// The identifier of a loadable resource.
///
/// This is usually a resolved address, like `https://cdn.example.com/bundles/ios/hero`.
/// Keys are opaque to the loaders and only compared for equality and ordering.
#[derive(Debug, Clone, Deserialize, Serialize, Eq, Ord, PartialEq, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ResourceKey(Arc<str>);

impl ResourceKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ResourceKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

/// Options passed through, untouched, to the underlying [`Loader`](crate::Loader).
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Options {
    /// The content type the caller expects, if it differs from what the source reports.
    pub content_type: Option<String>,
    /// Additional headers to send with the request.
    pub headers: BTreeMap<String, String>,
}

impl Options {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// A type-erased value that can be shared across threads.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// A resource that hands out a fresh instance to every consumer instead of being shared.
pub trait Prototype: Send + Sync + 'static {
    /// Creates a new, independent instance of this resource.
    fn instantiate(&self) -> AnyValue;
}

/// A value produced by a [`Loader`](crate::Loader).
#[derive(Clone)]
pub enum Loaded {
    /// A value shared by everybody requesting it.
    Shared(AnyValue),
    /// A prototype, which is instantiated once per request.
    Prototype(Arc<dyn Prototype>),
}

impl Loaded {
    pub fn shared<T: Any + Send + Sync>(value: T) -> Self {
        Self::Shared(Arc::new(value))
    }

    pub fn prototype<P: Prototype>(prototype: P) -> Self {
        Self::Prototype(Arc::new(prototype))
    }

    /// Returns the value that should be handed to a single consumer.
    ///
    /// Shared values are returned as is, prototypes are instantiated anew.
    pub fn instance(&self) -> AnyValue {
        match self {
            Loaded::Shared(value) => Arc::clone(value),
            Loaded::Prototype(prototype) => prototype.instantiate(),
        }
    }

    /// Returns an instance of this value as the concrete type `T`.
    pub fn downcast<T: Any + Send + Sync>(&self, key: &ResourceKey) -> LoadResult<Arc<T>> {
        self.instance()
            .downcast::<T>()
            .map_err(|_| LoadError::TypeMismatch {
                key: key.clone(),
                expected: type_name::<T>(),
            })
    }
}

impl fmt::Debug for Loaded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Loaded::Shared(_) => f.write_str("Loaded::Shared(..)"),
            Loaded::Prototype(_) => f.write_str("Loaded::Prototype(..)"),
        }
    }
}

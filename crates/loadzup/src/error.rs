use std::time::Duration;

use thiserror::Error;

use crate::types::ResourceKey;

/// An error that happens when loading a resource.
///
/// Errors are broadcast to every waiter of a shared load, which is why this type is
/// [`Clone`]. None of the variants are ever cached: the next request for the same key
/// starts a fresh load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The resource does not exist at the underlying source.
    #[error("not found: {0}")]
    NotFound(ResourceKey),
    /// The underlying loader does not know how to load this resource.
    #[error("unsupported: {0}")]
    Unsupported(ResourceKey),
    /// The request for the resource failed.
    ///
    /// `status` holds the status code of the response, if there was one.
    #[error("request failed: {message}")]
    Request {
        status: Option<u16>,
        message: String,
    },
    /// The resource was fetched, but could not be converted into the requested value.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The underlying load did not complete within the configured timeout.
    #[error("load timed out after {0:?}")]
    Timeout(Duration),
    /// A loaded value was requested as a type it does not have.
    ///
    /// This means the same key was used for two incompatible result types, which is a
    /// programming error on the caller side.
    #[error("{key} does not hold a value of type `{expected}`")]
    TypeMismatch {
        key: ResourceKey,
        expected: &'static str,
    },
    /// The shared load was dropped before it produced a result.
    #[error("load of {0} was interrupted")]
    Interrupted(ResourceKey),
}

impl LoadError {
    /// Creates a [`Request`](Self::Request) error without a response.
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request {
            status: None,
            message: message.into(),
        }
    }

    /// Creates a [`Request`](Self::Request) error for a response with the given status code.
    pub fn status(status: u16) -> Self {
        Self::Request {
            status: Some(status),
            message: format!("status {status}"),
        }
    }

    /// A short, static name of the error kind, used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            LoadError::NotFound(_) => "notfound",
            LoadError::Unsupported(_) => "unsupported",
            LoadError::Request { .. } => "request",
            LoadError::Malformed(_) => "malformed",
            LoadError::Timeout(_) => "timeout",
            LoadError::TypeMismatch { .. } => "typemismatch",
            LoadError::Interrupted(_) => "interrupted",
        }
    }
}

/// The result of loading a resource.
pub type LoadResult<T> = Result<T, LoadError>;

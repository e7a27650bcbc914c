//! Error types for recache.
//!
//! Two families of errors exist. [`CacheError`] covers caller-facing failures
//! (schema misconfiguration, malformed payloads, bad filters, internal faults).
//! [`TransportError`] is the recoverable failure reported by the remote data
//! source; it never escapes to callers directly and is instead recorded in the
//! store or index as status.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::CollectionName;

/// Field-level validation messages, keyed by field name.
pub type ValidationErrors = BTreeMap<String, Vec<String>>;

/// Schema registry configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("Association '{collection}.{field}' targets unknown collection '{target}'")]
    UnknownAssociationTarget {
        collection: CollectionName,
        field: String,
        target: CollectionName,
    },

    #[error("Collection '{collection}' has an empty id field name")]
    EmptyIdField {
        collection: CollectionName,
    },

    #[error("Collection '{collection}' is registered twice")]
    DuplicateCollection {
        collection: CollectionName,
    },

    #[error("Invalid schema JSON: {message}")]
    InvalidJson {
        message: String,
    },
}

/// Errors raised while flattening an entity graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("Unknown collection: {collection}")]
    UnknownCollection {
        collection: CollectionName,
    },

    #[error("Expected an entity object in '{collection}', found {found}")]
    NotAnEntity {
        collection: CollectionName,
        found: &'static str,
    },

    #[error("Entity in '{collection}' has no usable '{id_field}' identity")]
    MissingId {
        collection: CollectionName,
        id_field: String,
    },

    #[error("Association '{field}' in '{collection}' must be a list")]
    ExpectedList {
        collection: CollectionName,
        field: String,
    },

    #[error("Received dictionary does not contain requested entity {collection}/{id}")]
    RequestedEntityAbsent {
        collection: CollectionName,
        id: String,
    },
}

/// Errors raised while canonicalizing a query filter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("Page must be a positive integer, got {found}")]
    InvalidPage {
        found: String,
    },

    #[error("'{field}' must be a non-negative integer, got {found}")]
    InvalidWindow {
        field: &'static str,
        found: String,
    },
}

/// Failure reported by the remote data source.
///
/// These are recoverable: the store clears the in-progress flag, keeps the
/// `transient` marker and records this value so the caller can retry.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportError {
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        message: String,
    },

    #[error("Request timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Server error (code {code}): {message}")]
    ServerError {
        code: u32,
        message: String,
    },

    #[error("Not found: {message}")]
    NotFound {
        message: String,
    },

    #[error("Validation failed for {} field(s)", .errors.len())]
    Rejected {
        errors: ValidationErrors,
    },

    #[error("Malformed response: {message}")]
    Contract {
        message: String,
    },
}

impl TransportError {
    /// Field-level validation errors, when the server rejected the payload.
    #[must_use]
    pub const fn validation_errors(&self) -> Option<&ValidationErrors> {
        match self {
            Self::Rejected { errors } => Some(errors),
            _ => None,
        }
    }

    /// Returns true if repeating the request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } | Self::Timeout { .. } => true,
            Self::ServerError { code, .. } => *code >= 500,
            Self::NotFound { .. } | Self::Rejected { .. } | Self::Contract { .. } => false,
        }
    }
}

/// Top-level error type for recache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Normalize error: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Invalid configuration: {message}")]
    Config {
        message: String,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl CacheError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a schema error.
    #[must_use]
    pub const fn is_schema(&self) -> bool {
        matches!(self, Self::Schema(_))
    }

    /// Returns true if this is a normalization error.
    #[must_use]
    pub const fn is_normalize(&self) -> bool {
        matches!(self, Self::Normalize(_))
    }

    /// Returns true if this is a filter error.
    #[must_use]
    pub const fn is_filter(&self) -> bool {
        matches!(self, Self::Filter(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}

/// Result type alias for recache operations.
pub type CacheResult<T> = Result<T, CacheError>;

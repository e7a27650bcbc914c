//! Query filters and page canonicalization.
//!
//! Callers may address a list by 1-based `page`. Internally every query is
//! keyed by zero-based `offset`/`limit`, so `{page: 2}` and
//! `{offset: 10, limit: 10}` (with a page size of 10) are the same query.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FilterError;

const PAGE: &str = "page";
const OFFSET: &str = "offset";
const LIMIT: &str = "limit";

/// A list query filter: arbitrary JSON criteria plus paging keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(Map<String, Value>);

impl Filter {
    /// An empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a filter from a JSON value. `null` is the empty filter.
    ///
    /// Returns `None` for anything other than an object or `null`.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            Value::Null => Some(Self::new()),
            _ => None,
        }
    }

    /// Adds or replaces one criterion.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Reads one criterion.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The underlying JSON object.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Zero-based offset, when present and valid.
    #[must_use]
    pub fn offset(&self) -> Option<u64> {
        self.0.get(OFFSET).and_then(as_count)
    }

    /// Page size, when present and valid.
    #[must_use]
    pub fn limit(&self) -> Option<u64> {
        self.0.get(LIMIT).and_then(as_count)
    }

    /// Replaces a 1-based `page` with `offset`/`limit` windows of `page_size`.
    ///
    /// A filter with no paging keys is treated as page 1. A filter carrying
    /// only one of `offset`/`limit` gets the other filled in.
    ///
    /// # Errors
    /// Returns [`FilterError`] when `page` is not a positive integer, or when
    /// `offset`/`limit` are not non-negative integers.
    pub fn canonicalize(&self, page_size: u64) -> Result<Self, FilterError> {
        let mut map = self.0.clone();

        if let Some(page) = map.remove(PAGE) {
            let offset = as_count(&page)
                .filter(|p| *p >= 1)
                .and_then(|p| (p - 1).checked_mul(page_size))
                .ok_or_else(|| FilterError::InvalidPage {
                    found: page.to_string(),
                })?;
            map.insert(OFFSET.to_string(), Value::from(offset));
            map.insert(LIMIT.to_string(), Value::from(page_size));
            return Ok(Self(map));
        }

        let offset = window(&map, OFFSET)?.unwrap_or(0);
        let limit = window(&map, LIMIT)?.unwrap_or(page_size);
        map.insert(OFFSET.to_string(), Value::from(offset));
        map.insert(LIMIT.to_string(), Value::from(limit));
        Ok(Self(map))
    }

    /// Inverse of [`Filter::canonicalize`]: turns `offset`/`limit` back into a
    /// 1-based `page` (`offset / limit + 1`).
    ///
    /// Returns `None` when the filter has no usable window.
    #[must_use]
    pub fn to_paged(&self) -> Option<Self> {
        let page = self.page()?;
        let mut map = self.0.clone();
        map.remove(OFFSET);
        map.remove(LIMIT);
        map.insert(PAGE.to_string(), Value::from(page));
        Some(Self(map))
    }

    /// 1-based page number implied by `offset`/`limit`.
    #[must_use]
    pub fn page(&self) -> Option<u64> {
        let limit = self.limit().filter(|l| *l > 0)?;
        Some(self.offset().unwrap_or(0) / limit + 1)
    }
}

impl From<Map<String, Value>> for Filter {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Accepts integers and integer strings (query-string values arrive as text).
fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn window(map: &Map<String, Value>, field: &'static str) -> Result<Option<u64>, FilterError> {
    match map.get(field) {
        None => Ok(None),
        Some(value) => as_count(value)
            .map(Some)
            .ok_or_else(|| FilterError::InvalidWindow {
                field,
                found: value.to_string(),
            }),
    }
}

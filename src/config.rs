//! Cache configuration.

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Default number of entities per page when a filter addresses `page`.
pub const DEFAULT_PAGE_SIZE: u64 = 10;

/// Tunables for [`crate::EntityCache`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Entities per page used to turn `page` into `offset`/`limit`.
    pub page_size: u64,
    /// Relation hops expanded by the read-side views.
    pub denormalize_depth: usize,
    /// Per-subscriber buffer of change notifications.
    pub change_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            denormalize_depth: 1,
            change_capacity: 1024,
        }
    }
}

impl CacheConfig {
    /// Parses a configuration from JSON; missing keys take their defaults.
    pub fn from_json(json: &str) -> CacheResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| CacheError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the cache cannot work with.
    pub fn validate(&self) -> CacheResult<()> {
        if self.page_size == 0 {
            return Err(CacheError::Config {
                message: "pageSize must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

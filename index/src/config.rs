//! Index configuration.
//!
//! Tunables for a tree, loadable from environment variables.
//!
//! # Environment Variables
//!
//! - `CELLBTREE_MAX_KEY_SIZE`: Largest encoded key in bytes (default: `2048`)
//! - `CELLBTREE_MAX_DEPTH`: Deepest descent before the tree is declared
//!   corrupted (default: `64`)
//! - `CELLBTREE_PREFETCH_SIZE`: Entries a cursor buffers per refill
//!   (default: `10000`)
//! - `CELLBTREE_SYNC_ON_COMMIT`: Whether commits sync the page store
//!   (default: `true`)
//! - `CELLBTREE_CHECKPOINT_OPERATIONS`: Commits between automatic journal
//!   checkpoints, `0` disables (default: `1000`)
//! - `CELLBTREE_CHECKPOINT_BYTES`: Journaled bytes between automatic
//!   checkpoints, `0` disables (default: `4194304`)
//!
//! # Invariants
//!
//! - `max_key_size` never exceeds [`IndexConfig::MAX_KEY_SIZE_LIMIT`], so
//!   three maximal leaf entries always fit in one bucket and a split leaves
//!   both halves non-empty
//! - `max_depth` and `prefetch_size` are positive

use crate::btree::bucket::{LEAF_ENTRY_OVERHEAD, POSITIONS_ARRAY_OFFSET};
use std::str::FromStr;

use crate::storage::PAGE_SIZE;
use crate::storage::checkpoint::{DEFAULT_BYTES_THRESHOLD, DEFAULT_OPERATION_THRESHOLD};

/// Tree configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    /// Largest encoded key accepted by `put`.
    pub max_key_size: usize,
    /// Maximum number of levels a descent may visit.
    pub max_depth: usize,
    /// Number of entries a cursor loads per refill.
    pub prefetch_size: usize,
    /// Sync the page store after applying each commit.
    pub sync_on_commit: bool,
    /// Committed operations between automatic journal checkpoints.
    pub checkpoint_operations: u64,
    /// Journaled bytes between automatic journal checkpoints.
    pub checkpoint_bytes: u64,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_key_size: Self::DEFAULT_MAX_KEY_SIZE,
            max_depth: Self::DEFAULT_MAX_DEPTH,
            prefetch_size: Self::DEFAULT_PREFETCH_SIZE,
            sync_on_commit: true,
            checkpoint_operations: DEFAULT_OPERATION_THRESHOLD,
            checkpoint_bytes: DEFAULT_BYTES_THRESHOLD,
        }
    }
}

impl IndexConfig {
    /// Default largest key in bytes.
    pub const DEFAULT_MAX_KEY_SIZE: usize = 2048;
    /// Default maximum descent depth.
    pub const DEFAULT_MAX_DEPTH: usize = 64;
    /// Default cursor prefetch size.
    pub const DEFAULT_PREFETCH_SIZE: usize = 10_000;
    /// Upper bound for `max_key_size`: three maximal leaf entries fit in one bucket.
    pub const MAX_KEY_SIZE_LIMIT: usize = (PAGE_SIZE - POSITIONS_ARRAY_OFFSET) / 3 - LEAF_ENTRY_OVERHEAD;

    /// Load configuration from environment variables, falling back to the
    /// defaults for unset variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but does not parse, or if the
    /// resulting configuration fails [`IndexConfig::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`IndexConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            max_key_size: load_number(&lookup, "CELLBTREE_MAX_KEY_SIZE", defaults.max_key_size)?,
            max_depth: load_number(&lookup, "CELLBTREE_MAX_DEPTH", defaults.max_depth)?,
            prefetch_size: load_number(&lookup, "CELLBTREE_PREFETCH_SIZE", defaults.prefetch_size)?,
            sync_on_commit: load_bool(&lookup, "CELLBTREE_SYNC_ON_COMMIT", defaults.sync_on_commit)?,
            checkpoint_operations: load_number(
                &lookup,
                "CELLBTREE_CHECKPOINT_OPERATIONS",
                defaults.checkpoint_operations,
            )?,
            checkpoint_bytes: load_number(&lookup, "CELLBTREE_CHECKPOINT_BYTES", defaults.checkpoint_bytes)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants listed in the module docs.
    ///
    /// # Errors
    ///
    /// Names the offending environment variable in the returned error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_key_size == 0 || self.max_key_size > Self::MAX_KEY_SIZE_LIMIT {
            return Err(ConfigError::InvalidValue {
                name: "CELLBTREE_MAX_KEY_SIZE".to_string(),
                message: format!(
                    "{} is out of range (must be 1-{})",
                    self.max_key_size,
                    Self::MAX_KEY_SIZE_LIMIT
                ),
            });
        }
        if self.max_depth == 0 {
            return Err(ConfigError::InvalidValue {
                name: "CELLBTREE_MAX_DEPTH".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.prefetch_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "CELLBTREE_PREFETCH_SIZE".to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub const fn with_max_key_size(mut self, max_key_size: usize) -> Self {
        self.max_key_size = max_key_size;
        self
    }

    #[must_use]
    pub const fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    #[must_use]
    pub const fn with_prefetch_size(mut self, prefetch_size: usize) -> Self {
        self.prefetch_size = prefetch_size;
        self
    }

    #[must_use]
    pub const fn with_sync_on_commit(mut self, sync_on_commit: bool) -> Self {
        self.sync_on_commit = sync_on_commit;
        self
    }

    /// Thresholds for automatic journal checkpoints; `0` disables either one.
    #[must_use]
    pub const fn with_checkpoint_thresholds(mut self, operations: u64, bytes: u64) -> Self {
        self.checkpoint_operations = operations;
        self.checkpoint_bytes = bytes;
        self
    }
}

fn load_number<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    let Some(value) = lookup(name) else {
        return Ok(default);
    };
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        message: format!("'{value}' is not a non-negative integer"),
    })
}

fn load_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(value) = lookup(name) else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a boolean"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = IndexConfig::default();
        assert_eq!(config.max_key_size, 2048);
        assert_eq!(config.max_depth, 64);
        assert_eq!(config.prefetch_size, 10_000);
        assert!(config.sync_on_commit);
        assert_eq!(config.checkpoint_operations, 1000);
        assert_eq!(config.checkpoint_bytes, 4 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_key_size_limit() {
        assert_eq!(IndexConfig::MAX_KEY_SIZE_LIMIT, 2699);

        let at_limit = IndexConfig::default().with_max_key_size(IndexConfig::MAX_KEY_SIZE_LIMIT);
        assert!(at_limit.validate().is_ok());

        let over = IndexConfig::default().with_max_key_size(IndexConfig::MAX_KEY_SIZE_LIMIT + 1);
        assert!(matches!(
            over.validate(),
            Err(ConfigError::InvalidValue { name, .. }) if name == "CELLBTREE_MAX_KEY_SIZE"
        ));
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(IndexConfig::default().with_max_depth(0).validate().is_err());
        assert!(IndexConfig::default().with_prefetch_size(0).validate().is_err());
        assert!(IndexConfig::default().with_max_key_size(0).validate().is_err());
    }

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: Vec<(String, String)> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name: &str| vars.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = IndexConfig::from_lookup(env(&[])).expect("load defaults");
        assert_eq!(config, IndexConfig::default());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = IndexConfig::from_lookup(env(&[
            ("CELLBTREE_MAX_KEY_SIZE", " 512 "),
            ("CELLBTREE_PREFETCH_SIZE", "32"),
            ("CELLBTREE_SYNC_ON_COMMIT", "No"),
            ("CELLBTREE_CHECKPOINT_OPERATIONS", "0"),
            ("CELLBTREE_CHECKPOINT_BYTES", "65536"),
        ]))
        .expect("load overrides");

        assert_eq!(config.max_key_size, 512);
        assert_eq!(config.max_depth, IndexConfig::DEFAULT_MAX_DEPTH);
        assert_eq!(config.prefetch_size, 32);
        assert!(!config.sync_on_commit);
        assert_eq!(config.checkpoint_operations, 0);
        assert_eq!(config.checkpoint_bytes, 65_536);
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        assert!(matches!(
            IndexConfig::from_lookup(env(&[("CELLBTREE_MAX_DEPTH", "deep")])),
            Err(ConfigError::InvalidValue { name, .. }) if name == "CELLBTREE_MAX_DEPTH"
        ));
        assert!(matches!(
            IndexConfig::from_lookup(env(&[("CELLBTREE_SYNC_ON_COMMIT", "maybe")])),
            Err(ConfigError::InvalidValue { name, .. }) if name == "CELLBTREE_SYNC_ON_COMMIT"
        ));
        assert!(matches!(
            IndexConfig::from_lookup(env(&[("CELLBTREE_MAX_KEY_SIZE", "4096")])),
            Err(ConfigError::InvalidValue { name, .. }) if name == "CELLBTREE_MAX_KEY_SIZE"
        ));
        assert!(matches!(
            IndexConfig::from_lookup(env(&[("CELLBTREE_CHECKPOINT_BYTES", "-1")])),
            Err(ConfigError::InvalidValue { name, .. }) if name == "CELLBTREE_CHECKPOINT_BYTES"
        ));
    }

    #[test]
    fn test_config_error_display_invalid() {
        let error = ConfigError::InvalidValue {
            name: "TEST_VAR".to_string(),
            message: "bad value".to_string(),
        };
        assert_eq!(error.to_string(), "invalid value for TEST_VAR: bad value");
    }
}

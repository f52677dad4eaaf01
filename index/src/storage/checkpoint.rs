//! Automatic journal checkpoints.
//!
//! Every commit appends full page images to the journal. Once enough
//! operations or bytes have been journaled since the last checkpoint, the
//! manager syncs the page store and resets the journal, which bounds both
//! the journal size and the work recovery has to redo.
//!
//! # Checkpoint Triggers
//!
//! - Committed operation count (default: 1000 operations)
//! - Journaled bytes (default: 4MB)
//! - Manual trigger via [`AtomicOperationsManager::checkpoint`]
//!
//! [`AtomicOperationsManager::checkpoint`]: crate::storage::AtomicOperationsManager::checkpoint

/// Default number of committed operations between checkpoints.
pub const DEFAULT_OPERATION_THRESHOLD: u64 = 1000;

/// Default number of journaled bytes between checkpoints (4MB).
pub const DEFAULT_BYTES_THRESHOLD: u64 = 4 * 1024 * 1024;

/// When to checkpoint automatically.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CheckpointConfig {
    /// Committed operations between automatic checkpoints.
    /// Set to 0 to disable operation-based checkpoints.
    pub operation_threshold: u64,

    /// Journaled bytes between automatic checkpoints.
    /// Set to 0 to disable byte-based checkpoints.
    pub bytes_threshold: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            operation_threshold: DEFAULT_OPERATION_THRESHOLD,
            bytes_threshold: DEFAULT_BYTES_THRESHOLD,
        }
    }
}

impl CheckpointConfig {
    #[must_use]
    pub const fn new(operation_threshold: u64, bytes_threshold: u64) -> Self {
        Self {
            operation_threshold,
            bytes_threshold,
        }
    }

    /// Manual checkpoints only.
    #[must_use]
    pub const fn disabled() -> Self {
        Self::new(0, 0)
    }
}

/// Journal activity since the last checkpoint.
#[derive(Debug, Default)]
pub struct CheckpointState {
    config: CheckpointConfig,
    operations_since_checkpoint: u64,
    bytes_since_checkpoint: u64,
}

impl CheckpointState {
    #[must_use]
    pub const fn new(config: CheckpointConfig) -> Self {
        Self {
            config,
            operations_since_checkpoint: 0,
            bytes_since_checkpoint: 0,
        }
    }

    #[must_use]
    pub const fn config(&self) -> CheckpointConfig {
        self.config
    }

    pub const fn set_config(&mut self, config: CheckpointConfig) {
        self.config = config;
    }

    /// Count one committed operation that journaled `bytes`.
    pub const fn record_commit(&mut self, bytes: u64) {
        self.operations_since_checkpoint += 1;
        self.bytes_since_checkpoint += bytes;
    }

    /// Whether a threshold has been reached.
    #[must_use]
    pub const fn should_checkpoint(&self) -> bool {
        let by_operations = self.config.operation_threshold > 0
            && self.operations_since_checkpoint >= self.config.operation_threshold;
        let by_bytes = self.config.bytes_threshold > 0
            && self.bytes_since_checkpoint >= self.config.bytes_threshold;
        by_operations || by_bytes
    }

    /// Start counting from zero after a checkpoint.
    pub const fn checkpoint_completed(&mut self) {
        self.operations_since_checkpoint = 0;
        self.bytes_since_checkpoint = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_threshold() {
        let mut state = CheckpointState::new(CheckpointConfig::new(3, 0));
        state.record_commit(100);
        state.record_commit(100);
        assert!(!state.should_checkpoint());

        state.record_commit(100);
        assert!(state.should_checkpoint());

        state.checkpoint_completed();
        assert!(!state.should_checkpoint());
    }

    #[test]
    fn test_bytes_threshold() {
        let mut state = CheckpointState::new(CheckpointConfig::new(0, 1000));
        state.record_commit(999);
        assert!(!state.should_checkpoint());

        state.record_commit(1);
        assert!(state.should_checkpoint());
    }

    #[test]
    fn test_disabled_never_triggers() {
        let mut state = CheckpointState::new(CheckpointConfig::disabled());
        for _ in 0..10_000 {
            state.record_commit(u64::from(u32::MAX));
        }
        assert!(!state.should_checkpoint());
    }

    #[test]
    fn test_default_thresholds() {
        let config = CheckpointConfig::default();
        assert_eq!(config.operation_threshold, 1000);
        assert_eq!(config.bytes_threshold, 4 * 1024 * 1024);
    }
}

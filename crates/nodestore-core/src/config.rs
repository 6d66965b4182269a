//! Environment configuration
//!
//! Presets for the common deployment shapes plus `validate()` so a bad
//! configuration is rejected before any file is touched.

use std::time::Duration;

use crate::error::{KvError, KvResult};

/// When the log is forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// fsync after every committed write
    Sync,
    /// fsync only on `sync()`, checkpoint and close
    NoSync,
}

/// Environment configuration with presets
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Create the environment directory and databases when missing
    pub allow_create: bool,
    /// Log sync policy for individual writes
    pub durability: Durability,
    /// Log segment rotation threshold (bytes)
    pub log_rotation_size_bytes: u64,
    /// Write a snapshot once this many log bytes accumulated since the last one
    pub checkpoint_log_bytes: u64,
    /// Background checkpointer cadence; `None` disables the thread
    pub checkpoint_cadence: Option<Duration>,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
}

impl EnvConfig {
    /// Every write is durable before it returns.
    pub fn durable() -> Self {
        Self {
            allow_create: true,
            durability: Durability::Sync,
            log_rotation_size_bytes: 64 * 1024 * 1024,
            checkpoint_log_bytes: 256 * 1024 * 1024,
            checkpoint_cadence: Some(Duration::from_secs(30)),
            max_key_size: 512,
            max_value_size: 32 * 1024 * 1024,
        }
    }

    /// Bulk import: writes hit the page cache, durability comes from
    /// explicit `sync()` and from close.
    pub fn throughput() -> Self {
        Self {
            allow_create: true,
            durability: Durability::NoSync,
            log_rotation_size_bytes: 256 * 1024 * 1024,
            checkpoint_log_bytes: 1024 * 1024 * 1024,
            checkpoint_cadence: Some(Duration::from_secs(60)),
            max_key_size: 512,
            max_value_size: 64 * 1024 * 1024,
        }
    }

    /// Small embedded footprint, no background thread.
    pub fn small() -> Self {
        Self {
            allow_create: true,
            durability: Durability::Sync,
            log_rotation_size_bytes: 4 * 1024 * 1024,
            checkpoint_log_bytes: 16 * 1024 * 1024,
            checkpoint_cadence: None,
            max_key_size: 256,
            max_value_size: 8 * 1024 * 1024,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> KvResult<()> {
        let fail = |msg: &str| -> KvResult<()> { Err(KvError::InvalidConfig(msg.to_string())) };

        if self.log_rotation_size_bytes < 64 * 1024 {
            return fail("log_rotation_size_bytes must be >= 64KB");
        }
        if self.checkpoint_log_bytes < self.log_rotation_size_bytes {
            return fail("checkpoint_log_bytes must be >= log_rotation_size_bytes");
        }
        if let Some(cadence) = self.checkpoint_cadence {
            if cadence.as_millis() == 0 {
                return fail("checkpoint_cadence must be > 0");
            }
        }
        if self.max_key_size == 0 || self.max_key_size > u16::MAX as usize {
            return fail("max_key_size must be in [1, 65535]");
        }
        if self.max_value_size == 0 || self.max_value_size > 256 * 1024 * 1024 {
            return fail("max_value_size must be in [1, 256MB]");
        }
        Ok(())
    }
}

impl Default for EnvConfig {
    fn default() -> Self { Self::durable() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_valid() {
        assert!(EnvConfig::durable().validate().is_ok());
        assert!(EnvConfig::throughput().validate().is_ok());
        assert!(EnvConfig::small().validate().is_ok());
    }

    #[test]
    fn test_default_is_durable() {
        let config = EnvConfig::default();
        assert_eq!(config.durability, Durability::Sync);
        assert!(config.allow_create);
    }

    #[test]
    fn test_rejects_zero_cadence() {
        let mut config = EnvConfig::small();
        config.checkpoint_cadence = Some(Duration::from_millis(0));
        assert!(matches!(config.validate(), Err(KvError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_checkpoint_below_rotation() {
        let mut config = EnvConfig::durable();
        config.checkpoint_log_bytes = config.log_rotation_size_bytes - 1;
        assert!(config.validate().is_err());
    }
}

//! Runtime Configuration
//!
//! Configuration for the managed heap. It can be set programmatically or
//! loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `SAFEC_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SAFEC_SEGMENT_SIZE` | Nominal segment size in bytes (power of two) | 1073741824 (1GB) |
//! | `SAFEC_GC_THRESHOLD` | Requested bytes between collections | 33554432 (32MB) |
//! | `SAFEC_GC` | Enable automatic collection ("true"/"false") | true |
//!
//! # Example
//!
//! ```rust,ignore
//! use safec_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .segment_size(1 << 24)
//!     .gc_threshold(1 << 20)
//!     .build()?;
//! ```

use std::env;

use thiserror::Error;

use crate::os::{align_up, PAGE_SIZE};

/// Smallest accepted segment size.
pub const MIN_SEGMENT_SIZE: usize = 64 * 1024;

/// Memory configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Nominal segment size in bytes. Must be a power of two.
    /// Default: 1GB.
    pub segment_size: usize,

    /// Requested bytes accumulated between automatic collections.
    /// Default: 32MB.
    pub gc_threshold: usize,

    /// Run a collection when the threshold is crossed.
    /// Default: true.
    pub gc_enabled: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            segment_size: 1 << 30,      // 1 GB
            gc_threshold: 32 << 20,     // 32 MB
            gc_enabled: true,
        }
    }
}

impl MemoryConfig {
    /// Number of pages in a segment.
    pub fn pages_per_segment(&self) -> usize {
        self.segment_size / PAGE_SIZE
    }

    /// Bytes of the per-page counter prefix, rounded to whole pages.
    pub fn metadata_size(&self) -> usize {
        align_up(self.pages_per_segment() * std::mem::size_of::<u16>(), PAGE_SIZE)
    }

    /// Largest footprint a single segment can hold.
    pub fn segment_capacity(&self) -> usize {
        self.segment_size - self.metadata_size()
    }

    /// Check the invariants the heap relies on: segments are power-of-two
    /// sized (owner lookup masks addresses) and the threshold is non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.segment_size.is_power_of_two() {
            return Err(ConfigError::InvalidValue {
                field: "memory.segment_size".into(),
                message: "must be a power of two".into(),
            });
        }

        if self.segment_size < MIN_SEGMENT_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "memory.segment_size".into(),
                message: format!("must be at least {MIN_SEGMENT_SIZE} bytes"),
            });
        }

        if self.gc_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "memory.gc_threshold".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(())
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Memory configuration.
    pub memory: MemoryConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults; values that would not validate
    /// are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("SAFEC_SEGMENT_SIZE") {
            if val.is_power_of_two() && val >= MIN_SEGMENT_SIZE {
                config.memory.segment_size = val;
            }
        }

        if let Some(val) = parse_env_usize("SAFEC_GC_THRESHOLD") {
            if val > 0 {
                config.memory.gc_threshold = val;
            }
        }

        if let Some(val) = parse_env_bool("SAFEC_GC") {
            config.memory.gc_enabled = val;
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.memory.validate()
    }
}

/// Configuration error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the nominal segment size in bytes.
    pub fn segment_size(mut self, size: usize) -> Self {
        self.config.memory.segment_size = size;
        self
    }

    /// Set the requested-bytes threshold between collections.
    pub fn gc_threshold(mut self, threshold: usize) -> Self {
        self.config.memory.gc_threshold = threshold;
        self
    }

    /// Enable or disable automatic collection.
    pub fn gc_enabled(mut self, enabled: bool) -> Self {
        self.config.memory.gc_enabled = enabled;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| {
        match s.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.memory.segment_size, 1 << 30);
        assert_eq!(config.memory.gc_threshold, 32 << 20);
        assert!(config.memory.gc_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_metadata_size_is_page_rounded() {
        let memory = MemoryConfig {
            segment_size: 1 << 20,
            ..MemoryConfig::default()
        };
        // 256 pages * 2 bytes rounds up to one page.
        assert_eq!(memory.pages_per_segment(), 256);
        assert_eq!(memory.metadata_size(), PAGE_SIZE);
        assert_eq!(memory.segment_capacity(), (1 << 20) - PAGE_SIZE);

        let default = MemoryConfig::default();
        assert_eq!(default.metadata_size(), 128 * PAGE_SIZE);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .segment_size(1 << 24)
            .gc_threshold(4096)
            .gc_enabled(false)
            .build()
            .unwrap();

        assert_eq!(config.memory.segment_size, 1 << 24);
        assert_eq!(config.memory.gc_threshold, 4096);
        assert!(!config.memory.gc_enabled);
    }

    #[test]
    fn test_validation_segment_not_power_of_two() {
        let result = RuntimeConfig::builder().segment_size(3 << 20).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_segment_too_small() {
        let result = RuntimeConfig::builder().segment_size(4096).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_zero_threshold() {
        let result = RuntimeConfig::builder().gc_threshold(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "memory.segment_size".into(),
            message: "must be a power of two".into(),
        };
        assert!(err.to_string().contains("memory.segment_size"));
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn test_from_env_with_no_vars() {
        env::remove_var("SAFEC_SEGMENT_SIZE");
        env::remove_var("SAFEC_GC_THRESHOLD");
        env::remove_var("SAFEC_GC");

        let config = RuntimeConfig::from_env();
        assert_eq!(config, RuntimeConfig::default());
    }
}

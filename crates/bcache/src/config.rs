//! Cache geometry
//!
//! Compiled-in defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use bcache::config::CacheConfig;
//!
//! // Defaults with env overrides
//! let config = CacheConfig::from_env();
//!
//! // Or customize programmatically
//! let config = CacheConfig::new().nr_buffers(64).nr_request(8);
//! ```

use bcache_core::constants::BLOCKS_PER_PAGE;
use bcache_core::env::env_get;
use bcache_core::ConfigError;

/// Compiled-in defaults
pub mod defaults {
    use bcache_core::constants;

    /// Buffer descriptors in the pool
    pub const NR_BUFFERS: usize = constants::NR_BUFFERS;
    /// Hash buckets; a prime spreads (device ^ block) evenly
    pub const NR_HASH: usize = constants::NR_HASH;
    /// Request table slots
    pub const NR_REQUEST: usize = constants::NR_REQUEST;
}

/// Sizes of the fixed tables, chosen once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Number of buffer descriptors
    pub nr_buffers: usize,
    /// Number of hash buckets
    pub nr_hash: usize,
    /// Number of request slots; writes may use only the first two thirds
    pub nr_request: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl CacheConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `BCACHE_NR_BUFFERS` - Buffer descriptors in the pool
    /// - `BCACHE_NR_HASH` - Hash buckets
    /// - `BCACHE_NR_REQUEST` - Request table slots
    pub fn from_env() -> Self {
        Self {
            nr_buffers: env_get("BCACHE_NR_BUFFERS", defaults::NR_BUFFERS),
            nr_hash: env_get("BCACHE_NR_HASH", defaults::NR_HASH),
            nr_request: env_get("BCACHE_NR_REQUEST", defaults::NR_REQUEST),
        }
    }

    /// Defaults only, no env override.
    pub fn new() -> Self {
        Self {
            nr_buffers: defaults::NR_BUFFERS,
            nr_hash: defaults::NR_HASH,
            nr_request: defaults::NR_REQUEST,
        }
    }

    // Builder methods

    pub fn nr_buffers(mut self, n: usize) -> Self {
        self.nr_buffers = n;
        self
    }

    pub fn nr_hash(mut self, n: usize) -> Self {
        self.nr_hash = n;
        self
    }

    pub fn nr_request(mut self, n: usize) -> Self {
        self.nr_request = n;
        self
    }

    /// Request slots a write may occupy
    pub fn write_limit(&self) -> usize {
        self.nr_request * 2 / 3
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // read_page holds one buffer per block of the page at once
        if self.nr_buffers < BLOCKS_PER_PAGE {
            return Err(ConfigError::InvalidValue("nr_buffers must be >= 4"));
        }
        if self.nr_buffers >= u32::MAX as usize {
            return Err(ConfigError::InvalidValue("nr_buffers must fit in a buffer id"));
        }
        if self.nr_hash == 0 {
            return Err(ConfigError::InvalidValue("nr_hash must be > 0"));
        }
        if self.nr_request < 2 {
            return Err(ConfigError::InvalidValue("nr_request must be >= 2"));
        }
        if self.nr_request >= u32::MAX as usize {
            return Err(ConfigError::InvalidValue("nr_request must fit in a request id"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("Buffer cache configuration:");
        eprintln!("  nr_buffers:   {}", self.nr_buffers);
        eprintln!("  nr_hash:      {}", self.nr_hash);
        eprintln!("  nr_request:   {} ({} for writes)", self.nr_request, self.write_limit());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::new();
        assert_eq!(config.nr_buffers, 256);
        assert_eq!(config.nr_hash, 307);
        assert_eq!(config.nr_request, 32);
        assert_eq!(config.write_limit(), 21);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = CacheConfig::new().nr_buffers(16).nr_hash(7).nr_request(6);

        assert_eq!(config.nr_buffers, 16);
        assert_eq!(config.nr_hash, 7);
        assert_eq!(config.write_limit(), 4);
    }

    #[test]
    fn test_validation() {
        assert!(CacheConfig::new().nr_buffers(3).validate().is_err());
        assert!(CacheConfig::new().nr_hash(0).validate().is_err());
        assert!(CacheConfig::new().nr_request(1).validate().is_err());
        assert!(CacheConfig::new().nr_request(2).validate().is_ok());
    }
}

//! # bcache-core
//!
//! Core types shared by the buffer cache, the request scheduler and the
//! block device drivers.
//!
//! This crate holds no cache logic. It defines the vocabulary the other
//! crates speak: device and slot identifiers, the driver interface, error
//! types, and the ambient helpers (logging, env config, spinlock).
//!
//! ## Modules
//!
//! - `id` - Device, buffer and request identifiers
//! - `driver` - `BlockDriver` trait, `Request`, completion routing
//! - `error` - Error types and the `fatal` path
//! - `spinlock` - Short-section lock guarding block data
//! - `kprint` - Kernel-style leveled logging macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod driver;
pub mod error;
pub mod spinlock;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::{BufferId, DeviceId, RequestId};
pub use driver::{BlockData, BlockDriver, Command, CompletionPort, CompletionSink, IoCommand, Request};
pub use error::{fatal, ConfigError, IoError, IoResult};
pub use spinlock::SpinLock;
pub use env::{env_get, env_get_bool};

/// Structural constants of the block layer
pub mod constants {
    /// Size of one cached block (bytes)
    pub const BLOCK_SIZE: usize = 1024;

    /// log2(BLOCK_SIZE), for byte-offset to block conversion
    pub const BLOCK_SIZE_BITS: u32 = 10;

    /// Hardware transfer unit (bytes)
    pub const SECTOR_SIZE: usize = 512;

    /// Sectors per block. Fixed for every device.
    pub const SECTORS_PER_BLOCK: u32 = (BLOCK_SIZE / SECTOR_SIZE) as u32;

    /// Page size used by `read_page`
    pub const PAGE_SIZE: usize = 4096;

    /// Blocks that make up one page
    pub const BLOCKS_PER_PAGE: usize = PAGE_SIZE / BLOCK_SIZE;

    /// Number of major device numbers (driver table size)
    pub const NR_BLK_DEV: usize = 7;

    /// Default number of request slots
    pub const NR_REQUEST: usize = 32;

    /// Default number of hash buckets (prime)
    pub const NR_HASH: usize = 307;

    /// Default number of buffer descriptors
    pub const NR_BUFFERS: usize = 256;

    /// Retries a driver may spend on one request before failing it
    pub const MAX_ERRORS: u32 = 7;

    /// Highest block whose first sector still fits a `u32` sector number
    pub const MAX_BLOCK: u32 = u32::MAX / SECTORS_PER_BLOCK;
}

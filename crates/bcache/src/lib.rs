//! # bcache
//!
//! Block buffer cache and elevator request scheduler.
//!
//! The cache keeps at most one in-memory copy of every (device, block)
//! pair, hands out referenced buffers, and turns misses and write-backs
//! into requests sorted per device by an elevator. Drivers complete
//! requests asynchronously through [`bcache_core::CompletionSink`].
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use bcache::{BufferCache, CacheConfig};
//! use bcache_core::DeviceId;
//! use bcache_drivers::{RamDisk, RamDiskConfig};
//!
//! let cache = BufferCache::new(CacheConfig::from_env())?;
//! cache.register_driver(1, Arc::new(RamDisk::new(RamDiskConfig::from_env())?))?;
//!
//! let dev = DeviceId::new(1, 1);
//! let buf = cache.read_block(dev, 7)?;
//! cache.with_data_mut(&buf, |data| data[0] = 0xff);
//! cache.write_through(&buf);
//! cache.release(buf);
//! cache.sync_device(Some(dev))?;
//! ```
//!
//! ## Modules
//!
//! - `cache` - The cache API and the request path
//! - `request` - Request table, device queues, elevator
//! - `pool` - Descriptor pool and LRU free list
//! - `index` - (device, block) hash index
//! - `waitset` - Suspend / resume-all primitive
//! - `blockdev` - Byte-offset reads and writes on a raw device
//! - `config` - Table sizes with env overrides
//! - `stats` - Counters

mod index;
mod pool;
mod waitset;

pub mod blockdev;
pub mod cache;
pub mod config;
pub mod request;
pub mod stats;

#[cfg(test)]
mod properties;

pub use blockdev::{block_read, block_write};
pub use cache::{BufferCache, BufferHandle};
pub use config::CacheConfig;
pub use request::QueuedRequest;
pub use stats::CacheStats;

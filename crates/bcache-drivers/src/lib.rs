//! # bcache-drivers
//!
//! Block drivers implementing [`bcache_core::BlockDriver`].
//!
//! | Driver | Completion | Use |
//! |--------|-----------|-----|
//! | [`RamDisk`] | interrupt thread | memory-backed device, fault injection with retries |
//! | [`InlineDisk`] | inside `submit`, or when drained | deterministic tests |

pub mod inline;
pub mod ramdisk;

pub use inline::{InlineDisk, Submission};
pub use ramdisk::{RamDisk, RamDiskConfig, RAMDISK_MAJOR};

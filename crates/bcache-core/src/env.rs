//! Environment variable utilities
//!
//! Cache geometry and driver knobs can be overridden from the environment
//! (`BCACHE_NR_BUFFERS`, `BCACHE_RAMDISK_BLOCKS`, ...). Unset or unparsable
//! values fall back to the compiled-in default.

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// ```ignore
/// let nr_buffers: usize = env_get("BCACHE_NR_BUFFERS", 256);
/// ```
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true. Any other
/// value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `Some(T)` if the variable is set and parses
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

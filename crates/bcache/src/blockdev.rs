//! Byte-granular I/O on a raw block device, through the cache.
//!
//! Reads prefetch the two following blocks. A write that covers a whole
//! block skips the read and overwrites the buffer in place; a partial
//! write reads the block first.

use bcache_core::constants::{BLOCK_SIZE, BLOCK_SIZE_BITS, MAX_BLOCK};
use bcache_core::{DeviceId, IoError, IoResult};

use crate::cache::BufferCache;

/// Block number holding byte `pos`, if it fits a block number
fn block_of(pos: u64) -> Option<u32> {
    u32::try_from(pos >> BLOCK_SIZE_BITS).ok()
}

/// The two blocks after `block` that exist
fn prefetch_hints(block: u32) -> Vec<u32> {
    (1..=2).filter_map(|i| block.checked_add(i)).collect()
}

/// Read `buf.len()` bytes from `device` at `*pos`, advancing `*pos`.
///
/// Returns the bytes transferred. A failure after some bytes were read
/// ends the transfer short; a failure before any returns the error.
pub fn block_read(cache: &BufferCache, device: DeviceId, pos: &mut u64, buf: &mut [u8]) -> IoResult<usize> {
    let mut offset = (*pos & (BLOCK_SIZE as u64 - 1)) as usize;
    let mut read = 0;

    while read < buf.len() {
        let chars = (BLOCK_SIZE - offset).min(buf.len() - read);
        let handle = match block_of(*pos) {
            Some(block) => cache.read_block_ahead(device, block, &prefetch_hints(block)),
            None => Err(IoError::ReadFailed { device, block: u32::MAX }),
        };
        let handle = match handle {
            Ok(h) => h,
            Err(e) if read == 0 => return Err(e),
            Err(_) => break,
        };

        cache.with_data(&handle, |data| {
            buf[read..read + chars].copy_from_slice(&data[offset..offset + chars]);
        });
        cache.release(handle);

        *pos += chars as u64;
        read += chars;
        offset = 0;
    }
    Ok(read)
}

/// Write `buf` to `device` at `*pos`, advancing `*pos`.
///
/// Data goes into the cache and is marked dirty; it reaches the device on
/// eviction or `sync_device`.
pub fn block_write(cache: &BufferCache, device: DeviceId, pos: &mut u64, buf: &[u8]) -> IoResult<usize> {
    let mut offset = (*pos & (BLOCK_SIZE as u64 - 1)) as usize;
    let mut written = 0;

    while written < buf.len() {
        let chars = (BLOCK_SIZE - offset).min(buf.len() - written);
        let whole = chars == BLOCK_SIZE;
        let handle = match block_of(*pos) {
            Some(block) if block > MAX_BLOCK => Err(IoError::WriteFailed { device, block }),
            Some(block) if whole => Ok(cache.get_block(device, block)),
            Some(block) => cache.read_block_ahead(device, block, &prefetch_hints(block)),
            None => Err(IoError::WriteFailed { device, block: u32::MAX }),
        };
        let handle = match handle {
            Ok(h) => h,
            Err(e) if written == 0 => return Err(e),
            Err(_) => break,
        };

        cache.with_data_mut(&handle, |data| {
            data[offset..offset + chars].copy_from_slice(&buf[written..written + chars]);
        });
        if whole {
            cache.mark_uptodate(&handle);
        }
        cache.write_through(&handle);
        cache.release(handle);

        *pos += chars as u64;
        written += chars;
        offset = 0;
    }
    Ok(written)
}

//! The buffer cache.
//!
//! All descriptor metadata, the hash index and the request table live in
//! one `CacheState` behind a single mutex. Holding that mutex is the only
//! way to touch any of it, which is what excludes races between callers
//! and completion handlers running on driver threads. The mutex is
//! released whenever a thread suspends on a wait-set and whenever a
//! request is handed to a driver, so drivers may complete synchronously.
//!
//! Block contents are kept outside the mutex, one spinlocked array per
//! descriptor, shared with drivers through `Request`.
//!
//! Internal helpers take the state guard by value and hand it back,
//! because any of them may have to sleep.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bcache_core::constants::{BLOCKS_PER_PAGE, BLOCK_SIZE, MAX_BLOCK, NR_BLK_DEV, PAGE_SIZE};
use bcache_core::{
    fatal, kdebug, kerror, kinfo, ktrace, kwarn, BlockData, BlockDriver, BufferId, Command,
    CompletionPort, CompletionSink, ConfigError, DeviceId, IoCommand, IoError, IoResult, Request,
    RequestId, SpinLock,
};

use crate::config::CacheConfig;
use crate::index::HashIndex;
use crate::pool::BufferPool;
use crate::request::{QueuedRequest, RequestTable};
use crate::stats::{CacheStats, Counters};
use crate::waitset::{suspend, WaitSet};

type StateGuard<'a> = MutexGuard<'a, CacheState>;

struct CacheState {
    pool: BufferPool,
    index: HashIndex,
    requests: RequestTable,
    /// Threads waiting for any descriptor to become claimable
    buffer_wait: WaitSet,
}

struct CacheInner {
    config: CacheConfig,
    state: Mutex<CacheState>,
    data: Vec<Arc<BlockData>>,
    drivers: SpinLock<[Option<Arc<dyn BlockDriver>>; NR_BLK_DEV]>,
    port: CompletionPort,
    counters: Counters,
}

/// A referenced buffer. Valid until passed to [`BufferCache::release`].
///
/// Handles are plain values: releasing the same handle twice is a
/// reference-count underflow and stops the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    id: BufferId,
    device: DeviceId,
    block: u32,
}

impl BufferHandle {
    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[inline]
    pub fn block(&self) -> u32 {
        self.block
    }
}

/// Shared handle to a buffer cache. Clones refer to the same cache.
#[derive(Clone)]
pub struct BufferCache {
    inner: Arc<CacheInner>,
}

impl BufferCache {
    /// Build a cache with `config.nr_buffers` unbound descriptors.
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let inner = Arc::new_cyclic(|weak: &Weak<CacheInner>| {
            let sink: Weak<dyn CompletionSink> = weak.clone();
            CacheInner {
                state: Mutex::new(CacheState {
                    pool: BufferPool::new(config.nr_buffers),
                    index: HashIndex::new(config.nr_hash),
                    requests: RequestTable::new(config.nr_request),
                    buffer_wait: WaitSet::new(),
                }),
                data: (0..config.nr_buffers)
                    .map(|_| Arc::new(BlockData::new([0; BLOCK_SIZE])))
                    .collect(),
                drivers: SpinLock::new(std::array::from_fn(|_| None)),
                port: CompletionPort::new(sink),
                counters: Counters::default(),
                config,
            }
        });

        kinfo!(
            "{} buffers = {} bytes buffer space, {} hash buckets, {} request slots",
            inner.config.nr_buffers,
            inner.config.nr_buffers * BLOCK_SIZE,
            inner.config.nr_hash,
            inner.config.nr_request
        );
        Ok(BufferCache { inner })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Install the driver serving every device with this major number.
    pub fn register_driver(&self, major: u8, driver: Arc<dyn BlockDriver>) -> Result<(), ConfigError> {
        if major == 0 || major as usize >= NR_BLK_DEV {
            return Err(ConfigError::InvalidValue("major must be in 1..7"));
        }
        kinfo!("major {}: {}", major, driver.name());
        self.inner.drivers.lock()[major as usize] = Some(driver);
        Ok(())
    }

    /// Reference the buffer for (device, block), allocating one if needed.
    /// Does no read: the contents are valid only if `is_uptodate`.
    pub fn get_block(&self, device: DeviceId, block: u32) -> BufferHandle {
        let st = self.inner.lock_state();
        let (_st, id) = self.inner.getblk(st, device, block);
        BufferHandle { id, device, block }
    }

    /// Reference the buffer for (device, block) only if it is cached.
    pub fn find_cached(&self, device: DeviceId, block: u32) -> Option<BufferHandle> {
        let st = self.inner.lock_state();
        let (_st, hit) = self.inner.lookup(st, device, block);
        hit.map(|id| BufferHandle { id, device, block })
    }

    /// Reference an up-to-date buffer for (device, block), reading it if
    /// necessary. On failure no reference is held.
    pub fn read_block(&self, device: DeviceId, block: u32) -> IoResult<BufferHandle> {
        self.read_block_ahead(device, block, &[])
    }

    /// `read_block`, also queueing advisory reads of `hints`.
    ///
    /// Hints are never waited for and hold no reference afterwards; a hint
    /// is dropped when its buffer is busy, no clean buffer is free, or the
    /// request table is short.
    pub fn read_block_ahead(&self, device: DeviceId, block: u32, hints: &[u32]) -> IoResult<BufferHandle> {
        let inner = &*self.inner;
        let st = inner.lock_state();
        let (mut st, id) = inner.getblk(st, device, block);

        if st.pool.get(id).uptodate {
            Counters::bump(&inner.counters.hits);
        } else {
            Counters::bump(&inner.counters.misses);
            let (g, res) = inner.make_request(st, IoCommand::Read, id);
            st = g;
            if let Err(e) = res {
                drop(inner.brelse(st, id));
                return Err(e);
            }
        }

        for &hint in hints {
            let Some(ahead) = CacheInner::try_claim(&mut st, device, hint) else {
                Counters::bump(&inner.counters.ahead_dropped);
                continue;
            };
            let (g, _) = inner.make_request(st, IoCommand::ReadAhead, ahead);
            st = g;
            let d = st.pool.get_mut(ahead);
            d.count -= 1;
            if d.count == 0 {
                st.buffer_wait.resume_all();
            }
        }

        st = inner.wait_on_buffer(st, id);
        if st.pool.get(id).uptodate {
            return Ok(BufferHandle { id, device, block });
        }
        drop(inner.brelse(st, id));
        Err(IoError::ReadFailed { device, block })
    }

    /// Read up to four blocks into one page. Block number 0 is a hole and
    /// leaves its quarter of the page zeroed.
    ///
    /// Every read is queued before any is waited for. Returns the first
    /// failure after all buffers have been released.
    pub fn read_page(
        &self,
        device: DeviceId,
        blocks: [u32; BLOCKS_PER_PAGE],
        page: &mut [u8; PAGE_SIZE],
    ) -> IoResult<()> {
        let inner = &*self.inner;
        let mut held: [Option<BufferId>; BLOCKS_PER_PAGE] = [None; BLOCKS_PER_PAGE];
        let mut first_err = None;

        let mut st = inner.lock_state();
        for (slot, &block) in held.iter_mut().zip(blocks.iter()) {
            if block == 0 {
                continue;
            }
            let (g, id) = inner.getblk(st, device, block);
            st = g;
            if !st.pool.get(id).uptodate {
                let (g, res) = inner.make_request(st, IoCommand::Read, id);
                st = g;
                if let Err(e) = res {
                    first_err.get_or_insert(e);
                }
            }
            *slot = Some(id);
        }

        let mut good = [false; BLOCKS_PER_PAGE];
        for (i, id) in held.iter().enumerate() {
            if let Some(id) = *id {
                st = inner.wait_on_buffer(st, id);
                good[i] = st.pool.get(id).uptodate;
                if !good[i] {
                    first_err.get_or_insert(IoError::ReadFailed { device, block: blocks[i] });
                }
            }
        }
        drop(st);

        // References pin every identity, so the copies need no state lock
        page.fill(0);
        for (i, chunk) in page.chunks_exact_mut(BLOCK_SIZE).enumerate() {
            if let (Some(id), true) = (held[i], good[i]) {
                chunk.copy_from_slice(&inner.data[id.index()].lock()[..]);
            }
        }

        let mut st = inner.lock_state();
        for id in held.iter().flatten() {
            st = inner.brelse(st, *id);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Mark the buffer modified. No I/O happens until it is written back.
    pub fn write_through(&self, handle: &BufferHandle) {
        self.inner.lock_state().pool.get_mut(handle.id).dirty = true;
    }

    /// Declare the buffer's contents valid without reading them, after the
    /// caller has overwritten the whole block.
    pub fn mark_uptodate(&self, handle: &BufferHandle) {
        self.inner.lock_state().pool.get_mut(handle.id).uptodate = true;
    }

    /// Drop one reference. Releasing an unreferenced buffer is fatal.
    pub fn release(&self, handle: BufferHandle) {
        let st = self.inner.lock_state();
        drop(self.inner.brelse(st, handle.id));
    }

    /// Queue a transfer for a referenced buffer (the low-level entry point).
    ///
    /// Does not wait for completion; see [`BufferCache::wait_on_buffer`].
    pub fn submit(&self, command: IoCommand, handle: &BufferHandle) -> IoResult<()> {
        let st = self.inner.lock_state();
        let (_st, res) = self.inner.make_request(st, command, handle.id);
        res
    }

    /// Sleep until no transfer owns the buffer.
    pub fn wait_on_buffer(&self, handle: &BufferHandle) {
        let st = self.inner.lock_state();
        drop(self.inner.wait_on_buffer(st, handle.id));
    }

    /// Write back every dirty buffer of `device` (all devices on `None`)
    /// and wait for the writes to finish.
    pub fn sync_device(&self, device: Option<DeviceId>) -> IoResult<()> {
        let inner = &*self.inner;
        let selected = |d: DeviceId| match device {
            Some(dev) => d == dev,
            None => !d.is_none(),
        };
        let mut first_err = None;
        let mut pending = vec![];

        let mut st = inner.lock_state();
        for id in st.pool.ids().collect::<Vec<_>>() {
            st = inner.wait_on_buffer(st, id);
            let d = st.pool.get(id);
            if !d.dirty || !selected(d.device) {
                continue;
            }
            let (dev, block) = (d.device, d.block);
            let (g, res) = inner.make_request(st, IoCommand::Write, id);
            st = g;
            match res {
                Ok(()) => pending.push((id, dev, block)),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        for (id, dev, block) in pending {
            st = inner.wait_on_buffer(st, id);
            let d = st.pool.get(id);
            if d.is(dev, block) && !d.uptodate && !d.dirty {
                first_err.get_or_insert(IoError::WriteFailed { device: dev, block });
            }
        }
        drop(st);

        kdebug!("sync {:?}: {}", device, if first_err.is_some() { "failed" } else { "done" });
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Forget the contents of every buffer bound to `device`: clears
    /// `uptodate` and `dirty`, leaves identity and reference counts alone.
    pub fn invalidate(&self, device: DeviceId) {
        let inner = &*self.inner;
        let mut st = inner.lock_state();
        for id in st.pool.ids().collect::<Vec<_>>() {
            if st.pool.get(id).device != device {
                continue;
            }
            st = inner.wait_on_buffer(st, id);
            let d = st.pool.get_mut(id);
            if d.device == device {
                if d.count > 0 {
                    kwarn!("invalidating referenced buffer: dev {}, block {}", device, d.block);
                    Counters::bump(&inner.counters.busy_invalidated);
                }
                d.uptodate = false;
                d.dirty = false;
            }
        }
    }

    /// Ask the driver whether removable media changed; invalidate if so.
    pub fn check_media_change(&self, device: DeviceId) -> bool {
        let Some(driver) = self.inner.driver(device.major()) else {
            return false;
        };
        if !driver.media_changed(device) {
            return false;
        }
        kinfo!("disk change detected on device {}", device);
        self.invalidate(device);
        true
    }

    /// Run `f` over the buffer's contents.
    ///
    /// `f` must not call back into the cache.
    pub fn with_data<R>(&self, handle: &BufferHandle, f: impl FnOnce(&[u8; BLOCK_SIZE]) -> R) -> R {
        let data = self.inner.data[handle.id.index()].lock();
        f(&*data)
    }

    /// Run `f` over the buffer's contents, mutably. Pair with `write_through`.
    pub fn with_data_mut<R>(&self, handle: &BufferHandle, f: impl FnOnce(&mut [u8; BLOCK_SIZE]) -> R) -> R {
        let mut data = self.inner.data[handle.id.index()].lock();
        f(&mut *data)
    }

    /// Let requests for `major` pile up (and sort) without dispatching.
    pub fn plug(&self, major: u8) {
        if (major as usize) < NR_BLK_DEV {
            self.inner.lock_state().requests.plug(major);
        }
    }

    /// Resume dispatching on `major`, starting with the sorted head.
    pub fn unplug(&self, major: u8) {
        if major as usize >= NR_BLK_DEV {
            return;
        }
        let mut st = self.inner.lock_state();
        if let Some(head) = st.requests.unplug(major) {
            self.inner.start_request(st, head);
        }
    }

    /// Requests queued on `major`, in service order
    pub fn queue_snapshot(&self, major: u8) -> Vec<QueuedRequest> {
        if major as usize >= NR_BLK_DEV {
            return vec![];
        }
        self.inner.lock_state().requests.snapshot(major)
    }

    pub fn ref_count(&self, handle: &BufferHandle) -> u32 {
        self.inner.lock_state().pool.get(handle.id).count
    }

    pub fn is_dirty(&self, handle: &BufferHandle) -> bool {
        self.inner.lock_state().pool.get(handle.id).dirty
    }

    pub fn is_uptodate(&self, handle: &BufferHandle) -> bool {
        self.inner.lock_state().pool.get(handle.id).uptodate
    }

    pub fn is_locked(&self, handle: &BufferHandle) -> bool {
        self.inner.lock_state().pool.get(handle.id).locked
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::load(&self.inner.counters);
        let st = self.inner.lock_state();
        for (_, d) in st.pool.iter() {
            stats.buffers_in_use += (d.count > 0) as usize;
            stats.buffers_dirty += d.dirty as usize;
        }
        stats.requests_in_use = st.requests.in_use();
        stats
    }

    /// Check the free list and hash index for structural consistency.
    pub fn verify(&self) -> Result<(), &'static str> {
        let st = self.inner.lock_state();
        st.pool.verify_free_list()?;
        st.index.verify(&st.pool)?;
        Ok(())
    }
}

impl CacheInner {
    fn lock_state(&self) -> StateGuard<'_> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn driver(&self, major: u8) -> Option<Arc<dyn BlockDriver>> {
        self.drivers.lock().get(major as usize).and_then(|d| d.clone())
    }

    fn wait_on_buffer<'a>(&'a self, mut st: StateGuard<'a>, id: BufferId) -> StateGuard<'a> {
        while st.pool.get(id).locked {
            st = suspend(st, |s| &mut s.pool.get_mut(id).wait);
        }
        st
    }

    fn unlock_buffer(st: &mut CacheState, id: BufferId) {
        let d = st.pool.get_mut(id);
        if !d.locked {
            kwarn!("free buffer being unlocked");
        }
        d.locked = false;
        d.wait.resume_all();
    }

    /// Hash lookup taking a reference. Waits out any transfer, then
    /// re-checks identity.
    fn lookup<'a>(&'a self, mut st: StateGuard<'a>, device: DeviceId, block: u32) -> (StateGuard<'a>, Option<BufferId>) {
        loop {
            let Some(id) = st.index.find(&st.pool, device, block) else {
                return (st, None);
            };
            st.pool.get_mut(id).count += 1;
            st = self.wait_on_buffer(st, id);
            if st.pool.get(id).is(device, block) {
                return (st, Some(id));
            }
            st.pool.get_mut(id).count -= 1;
        }
    }

    /// Find or claim the descriptor for (device, block), with a reference.
    fn getblk<'a>(&'a self, mut st: StateGuard<'a>, device: DeviceId, block: u32) -> (StateGuard<'a>, BufferId) {
        'repeat: loop {
            let (g, hit) = self.lookup(st, device, block);
            st = g;
            if let Some(id) = hit {
                return (st, id);
            }

            let Some(victim) = st.pool.select_victim() else {
                kdebug!("no free buffers, sleeping");
                st = suspend(st, |s| &mut s.buffer_wait);
                continue;
            };
            st = self.wait_on_buffer(st, victim);
            if st.pool.get(victim).count != 0 {
                continue;
            }
            while st.pool.get(victim).dirty {
                let (g, res) = self.make_request(st, IoCommand::Write, victim);
                st = g;
                if let Err(e) = res {
                    kerror!("discarding dirty block {}: {}", st.pool.get(victim).block, e);
                    st.pool.get_mut(victim).dirty = false;
                }
                st = self.wait_on_buffer(st, victim);
                if st.pool.get(victim).count != 0 {
                    continue 'repeat;
                }
            }
            // Someone may have installed the block while we slept
            if st.index.find(&st.pool, device, block).is_some() {
                continue;
            }

            Self::claim(&mut st, victim, device, block);
            return (st, victim);
        }
    }

    /// `getblk` for read-ahead: never sleeps. Returns a referenced
    /// descriptor that still needs reading, or `None` when the block is
    /// already cached or in flight, or no clean idle descriptor is free.
    fn try_claim(st: &mut CacheState, device: DeviceId, block: u32) -> Option<BufferId> {
        if let Some(id) = st.index.find(&st.pool, device, block) {
            let d = st.pool.get_mut(id);
            if d.locked || d.uptodate {
                return None;
            }
            d.count += 1;
            return Some(id);
        }

        let victim = st.pool.select_victim()?;
        let d = st.pool.get(victim);
        if d.locked || d.dirty {
            return None;
        }
        Self::claim(st, victim, device, block);
        Some(victim)
    }

    /// Rebind an idle descriptor to (device, block) with one reference.
    fn claim(st: &mut CacheState, victim: BufferId, device: DeviceId, block: u32) {
        let CacheState { pool, index, .. } = st;
        {
            let d = pool.get_mut(victim);
            d.count = 1;
            d.dirty = false;
            d.uptodate = false;
        }
        index.remove(pool, victim);
        pool.unlink_free(victim);
        {
            let d = pool.get_mut(victim);
            d.device = device;
            d.block = block;
        }
        index.insert(pool, victim);
        pool.push_free_tail(victim);
        ktrace!("claimed buffer {} for dev {} block {}", victim, device, block);
    }

    fn brelse<'a>(&'a self, st: StateGuard<'a>, id: BufferId) -> StateGuard<'a> {
        let mut st = self.wait_on_buffer(st, id);
        let d = st.pool.get_mut(id);
        if d.count == 0 {
            fatal("Trying to free free buffer");
        }
        d.count -= 1;
        st.buffer_wait.resume_all();
        st
    }

    /// Lock the buffer and queue a transfer for it, unless there is
    /// nothing to do. Advisory commands give up instead of sleeping.
    fn make_request<'a>(&'a self, mut st: StateGuard<'a>, cmd: IoCommand, id: BufferId) -> (StateGuard<'a>, IoResult<()>) {
        let command = cmd.command();
        let device = st.pool.get(id).device;
        if self.driver(device.major()).is_none() {
            let verb = if command == Command::Read { "read" } else { "write" };
            kerror!("Trying to {} nonexistent block-device {}", verb, device);
            return (st, Err(IoError::NoDriver(device)));
        }

        let block = st.pool.get(id).block;
        if block > MAX_BLOCK {
            kerror!("block {} beyond sector range on device {}", block, device);
            let err = match command {
                Command::Read => IoError::ReadFailed { device, block },
                Command::Write => IoError::WriteFailed { device, block },
            };
            return (st, Err(err));
        }

        if cmd.is_ahead() && st.pool.get(id).locked {
            Counters::bump(&self.counters.ahead_dropped);
            return (st, Ok(()));
        }
        st = self.wait_on_buffer(st, id);
        st.pool.get_mut(id).locked = true;

        let (device, block, idle) = {
            let d = st.pool.get(id);
            let idle = match command {
                Command::Write => !d.dirty,
                Command::Read => d.uptodate,
            };
            (d.device, d.block, idle)
        };
        if idle {
            Self::unlock_buffer(&mut st, id);
            return (st, Ok(()));
        }

        let rid = loop {
            if let Some(rid) = st.requests.alloc(command, device, block, id) {
                break rid;
            }
            if cmd.is_ahead() {
                Self::unlock_buffer(&mut st, id);
                Counters::bump(&self.counters.ahead_dropped);
                return (st, Ok(()));
            }
            st = suspend(st, |s| &mut s.requests.wait);
        };

        st.pool.get_mut(id).dirty = false;
        match command {
            Command::Read => Counters::bump(&self.counters.read_requests),
            Command::Write => Counters::bump(&self.counters.write_requests),
        }
        ktrace!("request {}: {:?} dev {} block {}", rid, command, device, block);

        if let Some(head) = st.requests.enqueue(rid) {
            self.start_request(st, head);
            st = self.lock_state();
        }
        (st, Ok(()))
    }

    fn build_request(&self, st: &CacheState, rid: RequestId) -> Request {
        let slot = st.requests.slot(rid);
        Request::new(
            rid,
            slot.device,
            slot.command,
            slot.block,
            Arc::clone(&self.data[slot.buffer.index()]),
            self.port.clone(),
        )
    }

    /// Hand a queue head to its driver. Consumes the guard: the driver
    /// runs without the state lock.
    fn start_request(&self, st: StateGuard<'_>, rid: RequestId) {
        let request = self.build_request(&st, rid);
        drop(st);
        ktrace!("dispatch request {}", rid);
        match self.driver(request.device().major()) {
            Some(driver) => driver.submit(request),
            None => fatal("queued request for a device without a driver"),
        }
    }
}

impl CompletionSink for CacheInner {
    fn end_request(&self, id: RequestId, success: bool) {
        let mut st = self.lock_state();
        let mut done = st.requests.complete(id);

        st.pool.get_mut(done.buffer).uptodate = success;
        Self::unlock_buffer(&mut st, done.buffer);
        if !success {
            Counters::bump(&self.counters.io_errors);
            kerror!("I/O error, dev {}, block {}", done.device, done.block);
        }
        done.waiters.resume_all();
        st.requests.wait.resume_all();

        if let Some(next) = done.next {
            self.start_request(st, next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcache_core::kprint::{set_log_level, LogLevel};
    use bcache_drivers::InlineDisk;

    const DEV: DeviceId = DeviceId::new(3, 0);

    fn cache_with_disk(nr_buffers: usize) -> (BufferCache, Arc<InlineDisk>) {
        set_log_level(LogLevel::Off);
        let cache = BufferCache::new(CacheConfig::new().nr_buffers(nr_buffers).nr_hash(17)).unwrap();
        let disk = Arc::new(InlineDisk::new(64));
        cache.register_driver(3, disk.clone()).unwrap();
        (cache, disk)
    }

    #[test]
    fn test_new_rejects_bad_config() {
        assert!(BufferCache::new(CacheConfig::new().nr_hash(0)).is_err());
    }

    #[test]
    fn test_register_driver_bounds() {
        let (cache, disk) = cache_with_disk(8);
        assert!(cache.register_driver(0, disk.clone()).is_err());
        assert!(cache.register_driver(7, disk).is_err());
    }

    #[test]
    fn test_read_block_fetches_data() {
        let (cache, disk) = cache_with_disk(8);
        disk.write_raw(5, &[0xab; BLOCK_SIZE]);

        let h = cache.read_block(DEV, 5).unwrap();
        assert!(cache.is_uptodate(&h));
        assert!(!cache.is_locked(&h));
        assert_eq!(cache.ref_count(&h), 1);
        assert!(cache.with_data(&h, |d| d.iter().all(|&b| b == 0xab)));

        let subs = disk.submissions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].sector, 10);
        cache.release(h);
        assert_eq!(cache.stats().buffers_in_use, 0);
    }

    #[test]
    fn test_get_block_does_no_io() {
        let (cache, disk) = cache_with_disk(8);
        let h = cache.get_block(DEV, 3);
        assert!(!cache.is_uptodate(&h));
        assert_eq!(disk.submission_count(), 0);

        assert_eq!(cache.find_cached(DEV, 3), Some(h));
        assert_eq!(cache.ref_count(&h), 2);
        assert_eq!(cache.find_cached(DEV, 4), None);
        cache.release(h);
        cache.release(h);
    }

    #[test]
    fn test_read_failure_holds_no_reference() {
        let (cache, disk) = cache_with_disk(8);
        disk.fail_block(9);

        let err = cache.read_block(DEV, 9).unwrap_err();
        assert_eq!(err, IoError::ReadFailed { device: DEV, block: 9 });
        assert_eq!(cache.stats().buffers_in_use, 0);
        assert_eq!(cache.stats().io_errors, 1);
        assert_eq!(cache.stats().requests_in_use, 0);
    }

    #[test]
    fn test_no_driver() {
        let (cache, _disk) = cache_with_disk(8);
        let other = DeviceId::new(2, 0);
        assert_eq!(cache.read_block(other, 1).unwrap_err(), IoError::NoDriver(other));
        assert_eq!(cache.stats().buffers_in_use, 0);
    }

    #[test]
    fn test_block_beyond_sector_range_is_rejected() {
        let (cache, disk) = cache_with_disk(8);
        let block = MAX_BLOCK + 2;

        assert_eq!(cache.read_block(DEV, block), Err(IoError::ReadFailed { device: DEV, block }));
        let h = cache.get_block(DEV, block);
        cache.write_through(&h);
        assert_eq!(cache.submit(IoCommand::Write, &h), Err(IoError::WriteFailed { device: DEV, block }));
        assert!(!cache.is_locked(&h));
        cache.release(h);

        assert_eq!(disk.submission_count(), 0);
        assert_eq!(cache.stats().requests_in_use, 0);
    }

    #[test]
    fn test_hints_skip_dirty_or_busy_buffers() {
        let (cache, disk) = cache_with_disk(4);
        // Three dirty idle buffers and one held: no clean victim for hints
        for block in 1..=3 {
            let h = cache.get_block(DEV, block);
            cache.mark_uptodate(&h);
            cache.write_through(&h);
            cache.release(h);
        }
        let h = cache.read_block_ahead(DEV, 20, &[21, 22]).unwrap();

        assert_eq!(cache.stats().ahead_dropped, 2);
        assert_eq!(cache.find_cached(DEV, 21), None);
        assert_eq!(disk.submission_count(), 1);
        cache.release(h);
    }

    #[test]
    fn test_eviction_writes_back_dirty_victim() {
        let (cache, disk) = cache_with_disk(4);

        for block in 1..=4 {
            let h = cache.get_block(DEV, block);
            cache.with_data_mut(&h, |d| d.fill(block as u8));
            cache.mark_uptodate(&h);
            cache.write_through(&h);
            cache.release(h);
        }
        assert_eq!(disk.submission_count(), 0);

        // Every descriptor is dirty; the LRU one (block 1) is written back
        let h = cache.get_block(DEV, 5);
        assert_eq!(disk.submission_count(), 1);
        assert_eq!(disk.read_raw(1)[0], 1);
        assert_eq!(cache.find_cached(DEV, 1), None);
        cache.release(h);
        assert!(cache.verify().is_ok());
    }

    #[test]
    fn test_sync_device_writes_and_reports_failure() {
        let (cache, disk) = cache_with_disk(8);

        let a = cache.get_block(DEV, 1);
        let b = cache.get_block(DEV, 2);
        for h in [&a, &b] {
            cache.with_data_mut(h, |d| d.fill(0x5a));
            cache.write_through(h);
        }
        disk.fail_block(2);

        assert_eq!(
            cache.sync_device(Some(DEV)),
            Err(IoError::WriteFailed { device: DEV, block: 2 })
        );
        assert!(!cache.is_dirty(&a));
        assert_eq!(disk.read_raw(1)[0], 0x5a);

        // Nothing dirty left: a second sync is a no-op
        let before = disk.submission_count();
        assert!(cache.sync_device(None).is_ok());
        assert_eq!(disk.submission_count(), before);

        cache.release(a);
        cache.release(b);
    }

    #[test]
    fn test_read_page_with_hole() {
        let (cache, disk) = cache_with_disk(8);
        disk.write_raw(7, &[7; BLOCK_SIZE]);
        disk.write_raw(9, &[9; BLOCK_SIZE]);

        let mut page = [0xff; PAGE_SIZE];
        cache.read_page(DEV, [7, 0, 9, 8], &mut page).unwrap();

        assert!(page[..BLOCK_SIZE].iter().all(|&b| b == 7));
        assert!(page[BLOCK_SIZE..2 * BLOCK_SIZE].iter().all(|&b| b == 0));
        assert!(page[2 * BLOCK_SIZE..3 * BLOCK_SIZE].iter().all(|&b| b == 9));
        assert_eq!(disk.submission_count(), 3);
        assert_eq!(cache.stats().buffers_in_use, 0);
    }

    #[test]
    fn test_media_change_invalidates() {
        let (cache, disk) = cache_with_disk(8);
        let h = cache.read_block(DEV, 2).unwrap();
        cache.release(h);

        assert!(!cache.check_media_change(DEV));
        disk.set_media_changed(DEV);
        assert!(cache.check_media_change(DEV));
        assert!(!cache.is_uptodate(&h));
        assert!(!cache.check_media_change(DEV));
    }

    #[test]
    #[should_panic(expected = "Trying to free free buffer")]
    fn test_double_release_is_fatal() {
        let (cache, _disk) = cache_with_disk(8);
        let h = cache.get_block(DEV, 1);
        cache.release(h);
        cache.release(h);
    }
}

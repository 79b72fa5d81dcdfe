//! Whole-cache behaviour: identity, reference counting, write-back,
//! elevator order, slot reservation, invalidation, and concurrent use
//! against the interrupt-driven RAM disk.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bcache_core::constants::BLOCK_SIZE;
use bcache_core::kprint::{set_log_level, LogLevel};
use bcache_core::{Command, DeviceId, IoCommand};
use bcache_drivers::{InlineDisk, RamDisk, RamDiskConfig, RAMDISK_MAJOR};

use crate::{BufferCache, CacheConfig};

const HD: DeviceId = DeviceId::new(3, 0);
const RD: DeviceId = DeviceId::new(RAMDISK_MAJOR, 1);

fn inline_cache(config: CacheConfig) -> (BufferCache, Arc<InlineDisk>) {
    set_log_level(LogLevel::Off);
    let cache = BufferCache::new(config).unwrap();
    let disk = Arc::new(InlineDisk::new(256));
    cache.register_driver(3, disk.clone()).unwrap();
    (cache, disk)
}

fn ramdisk_cache(config: CacheConfig) -> (BufferCache, Arc<RamDisk>) {
    set_log_level(LogLevel::Off);
    let cache = BufferCache::new(config).unwrap();
    let disk = Arc::new(RamDisk::new(RamDiskConfig::from_env().blocks(64)).unwrap());
    cache.register_driver(RAMDISK_MAJOR, disk.clone()).unwrap();
    (cache, disk)
}

fn small() -> CacheConfig {
    CacheConfig::new().nr_buffers(16).nr_hash(13)
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("condition not reached");
}

#[test]
fn concurrent_reads_share_one_descriptor() {
    let (cache, disk) = ramdisk_cache(small());
    disk.load(12, &[0x3c; BLOCK_SIZE]);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || cache.read_block(RD, 12).unwrap())
        })
        .collect();
    let got: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(got.iter().all(|h| h.id() == got[0].id()));
    assert_eq!(cache.ref_count(&got[0]), 4);
    assert!(cache.with_data(&got[0], |d| d[0] == 0x3c));
    assert!(cache.verify().is_ok());

    for h in got {
        cache.release(h);
    }
    assert_eq!(cache.stats().buffers_in_use, 0);
}

#[test]
fn references_are_symmetric() {
    let (cache, _disk) = inline_cache(small());
    let handles: Vec<_> = (0..3).map(|_| cache.read_block(HD, 4).unwrap()).collect();
    assert_eq!(cache.ref_count(&handles[0]), 3);

    for h in &handles {
        cache.release(*h);
    }
    assert_eq!(cache.ref_count(&handles[0]), 0);
    // Identity survives the last release
    let found = cache.find_cached(HD, 4).unwrap();
    assert_eq!(found.id(), handles[0].id());
    cache.release(found);
}

#[test]
#[should_panic(expected = "Trying to free free buffer")]
fn double_release_panics() {
    let (cache, _disk) = inline_cache(small());
    let h = cache.read_block(HD, 1).unwrap();
    cache.release(h);
    cache.release(h);
}

#[test]
fn cache_hit_avoids_io() {
    let (cache, disk) = inline_cache(small());

    let h = cache.read_block(HD, 30).unwrap();
    cache.release(h);
    let h = cache.read_block(HD, 30).unwrap();
    cache.release(h);

    assert_eq!(disk.submission_count(), 1);
    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));
}

#[test]
fn write_back_is_idempotent() {
    let (cache, disk) = inline_cache(small());
    let h = cache.read_block(HD, 8).unwrap();
    cache.with_data_mut(&h, |d| d[0] = 0xee);
    cache.write_through(&h);
    disk.clear_submissions();

    cache.sync_device(Some(HD)).unwrap();
    assert_eq!(disk.submission_count(), 1);
    assert!(!cache.is_dirty(&h));

    cache.sync_device(Some(HD)).unwrap();
    cache.submit(IoCommand::Write, &h).unwrap();
    assert_eq!(disk.submission_count(), 1);
    assert_eq!(disk.read_raw(8)[0], 0xee);
    cache.release(h);
}

#[test]
fn elevator_orders_plugged_queue() {
    let (cache, disk) = inline_cache(small());

    let w = cache.get_block(HD, 2);
    cache.write_through(&w);

    cache.plug(3);
    let reads: Vec<_> = [25, 5, 15].iter().map(|&b| cache.get_block(HD, b)).collect();
    for h in &reads {
        cache.submit(IoCommand::Read, h).unwrap();
    }
    cache.submit(IoCommand::Write, &w).unwrap();

    let queued: Vec<_> = cache.queue_snapshot(3).iter().map(|r| (r.command, r.sector)).collect();
    assert_eq!(
        queued,
        vec![(Command::Read, 10), (Command::Read, 30), (Command::Read, 50), (Command::Write, 4)]
    );
    assert_eq!(disk.submission_count(), 0);

    cache.unplug(3);
    let served: Vec<_> = disk.submissions().iter().map(|s| s.sector).collect();
    assert_eq!(served, vec![10, 30, 50, 4]);
    assert!(cache.queue_snapshot(3).is_empty());

    for h in reads {
        assert!(cache.is_uptodate(&h));
        cache.release(h);
    }
    cache.release(w);
}

#[test]
fn elevator_never_displaces_active_head() {
    let (cache, disk) = inline_cache(small());
    disk.pause();

    let handles: Vec<_> = [25, 5, 15].iter().map(|&b| cache.get_block(HD, b)).collect();
    for h in &handles {
        cache.submit(IoCommand::Read, h).unwrap();
    }
    let queued: Vec<_> = cache.queue_snapshot(3).iter().map(|r| r.sector).collect();
    assert_eq!(queued, vec![50, 10, 30]);

    assert_eq!(disk.resume(), 1);
    let served: Vec<_> = disk.submissions().iter().map(|s| s.sector).collect();
    assert_eq!(served, vec![50, 10, 30]);
    for h in handles {
        cache.release(h);
    }
}

#[test]
fn reads_proceed_while_writes_hold_their_quota() {
    let (cache, disk) = inline_cache(CacheConfig::new().nr_buffers(40).nr_hash(13).nr_request(32));
    disk.pause();

    let writes: Vec<_> = (0..21)
        .map(|b| {
            let h = cache.get_block(HD, 100 + b);
            cache.write_through(&h);
            cache.submit(IoCommand::Write, &h).unwrap();
            h
        })
        .collect();
    assert_eq!(cache.stats().requests_in_use, 21);

    // A 22nd write has to wait for a slot
    let blocked = {
        let cache = cache.clone();
        thread::spawn(move || {
            let h = cache.get_block(HD, 200);
            cache.write_through(&h);
            cache.submit(IoCommand::Write, &h).unwrap();
            cache.wait_on_buffer(&h);
            cache.release(h);
        })
    };

    // ...while reads still find slots
    let read = cache.get_block(HD, 7);
    cache.submit(IoCommand::Read, &read).unwrap();
    assert_eq!(cache.stats().requests_in_use, 22);

    thread::sleep(Duration::from_millis(20));
    assert!(!blocked.is_finished());
    assert_eq!(cache.stats().requests_in_use, 22);

    disk.resume();
    blocked.join().unwrap();
    cache.wait_on_buffer(&read);
    assert!(cache.is_uptodate(&read));
    assert_eq!(cache.stats().requests_in_use, 0);

    cache.release(read);
    for h in writes {
        cache.release(h);
    }
}

#[test]
fn read_ahead_is_dropped_not_blocked() {
    let (cache, disk) = inline_cache(small().nr_request(3));
    disk.pause();

    // Busy buffer
    let busy = cache.get_block(HD, 1);
    cache.submit(IoCommand::Read, &busy).unwrap();
    cache.submit(IoCommand::ReadAhead, &busy).unwrap();
    assert_eq!(disk.submission_count(), 1);

    // Full table
    let others: Vec<_> = [2, 3].iter().map(|&b| cache.get_block(HD, b)).collect();
    for h in &others {
        cache.submit(IoCommand::Read, h).unwrap();
    }
    assert_eq!(cache.stats().requests_in_use, 3);
    let hint = cache.get_block(HD, 4);
    cache.submit(IoCommand::ReadAhead, &hint).unwrap();
    assert!(!cache.is_locked(&hint));
    assert!(!cache.is_uptodate(&hint));
    assert_eq!(cache.stats().ahead_dropped, 2);

    disk.resume();
    for h in others.into_iter().chain([busy, hint]) {
        cache.release(h);
    }
}

#[test]
fn read_ahead_never_waits_for_a_buffer() {
    // Every descriptor but one is held; the primary read takes the last
    // one and the hint has nothing to claim.
    let (cache, disk) = inline_cache(CacheConfig::new().nr_buffers(4).nr_hash(5));
    let held: Vec<_> = (0..3).map(|b| cache.get_block(HD, b)).collect();

    let reader = {
        let cache = cache.clone();
        thread::spawn(move || {
            let h = cache.read_block_ahead(HD, 10, &[11]).unwrap();
            cache.release(h);
        })
    };
    wait_until(|| reader.is_finished());
    reader.join().unwrap();

    assert_eq!(cache.stats().ahead_dropped, 1);
    assert_eq!(cache.find_cached(HD, 11), None);
    assert_eq!(disk.submission_count(), 1);
    for h in held {
        cache.release(h);
    }
}

#[test]
fn ramdisk_block_beyond_sector_range_is_not_aliased() {
    let (cache, disk) = ramdisk_cache(small());
    disk.load(1, &[0x77; BLOCK_SIZE]);

    assert!(cache.read_block(RD, 0x8000_0001).is_err());
    let h = cache.read_block(RD, 1).unwrap();
    assert!(cache.with_data(&h, |d| d[0] == 0x77));
    cache.release(h);
    assert!(cache.verify().is_ok());
}

#[test]
fn invalidate_forces_fresh_read_and_keeps_counts() {
    let (cache, disk) = inline_cache(small());
    let h = cache.read_block(HD, 11).unwrap();
    cache.write_through(&h);

    let idle = cache.read_block(HD, 12).unwrap();
    cache.release(idle);

    cache.invalidate(HD);
    assert_eq!(cache.ref_count(&h), 1);
    assert!(!cache.is_uptodate(&h));
    assert!(!cache.is_dirty(&h));
    // Only the referenced buffer is reported
    assert_eq!(cache.stats().busy_invalidated, 1);
    cache.release(h);

    let again = cache.read_block(HD, 11).unwrap();
    assert_eq!(again.id(), h.id());
    assert_eq!(disk.submission_count(), 3);
    cache.release(again);
}

#[test]
fn exhausted_pool_waits_for_release() {
    let (cache, _disk) = inline_cache(CacheConfig::new().nr_buffers(4).nr_hash(5));
    let held: Vec<_> = (0..4).map(|b| cache.get_block(HD, b)).collect();

    let waiter = {
        let cache = cache.clone();
        thread::spawn(move || {
            let h = cache.get_block(HD, 50);
            cache.release(h);
        })
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!waiter.is_finished());

    cache.release(held[0]);
    waiter.join().unwrap();
    for h in &held[1..] {
        cache.release(*h);
    }
    assert!(cache.verify().is_ok());
}

#[test]
fn concurrent_writers_survive_eviction() {
    // 4 threads x 8 blocks through an 8-buffer pool: constant eviction
    // with write-back completed on the RAM disk's interrupt thread.
    let (cache, disk) = ramdisk_cache(CacheConfig::new().nr_buffers(8).nr_hash(7));

    let workers: Vec<_> = (0..4u32)
        .map(|t| {
            let cache = cache.clone();
            thread::spawn(move || {
                for i in 0..40u32 {
                    let block = t * 8 + i % 8;
                    let h = cache.read_block(RD, block).unwrap();
                    cache.with_data_mut(&h, |d| d[0] += 1);
                    cache.write_through(&h);
                    cache.release(h);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    cache.sync_device(None).unwrap();
    for block in 0..32 {
        assert_eq!(disk.read_raw(block)[0], 5, "block {}", block);
    }
    assert!(cache.verify().is_ok());
    wait_until(|| cache.stats().requests_in_use == 0);
}

#[test]
fn ramdisk_errors_surface_as_read_failures() {
    let (cache, disk) = ramdisk_cache(small());
    disk.inject_faults(3, None);
    assert!(cache.read_block(RD, 3).is_err());

    // Transient faults are absorbed by driver retries
    disk.inject_faults(4, Some(2));
    let h = cache.read_block(RD, 4).unwrap();
    cache.release(h);
    assert_eq!(disk.retries() as u32, (bcache_core::constants::MAX_ERRORS - 1) + 2);
}

//! Buffer cache end-to-end smoke test
//!
//! Drives the whole stack against the interrupt-driven RAM disk:
//!   Part A: block identity, hits and reference counts
//!   Part B: write-back, sync and eviction under a small pool
//!   Part C: elevator order with a plugged queue
//!   Part D: media change and invalidation
//!   Part E: byte-granular block device I/O and page reads
//!   Part F: error propagation from the driver
//!
//! Run: ./target/release/bcache-smoke
//! Pool sizes come from BCACHE_NR_BUFFERS / BCACHE_NR_HASH / BCACHE_NR_REQUEST.

use std::sync::Arc;
use std::thread;

use bcache::{block_read, block_write, BufferCache, CacheConfig};
use bcache_core::constants::{BLOCK_SIZE, PAGE_SIZE};
use bcache_core::{Command, DeviceId, IoCommand};
use bcache_drivers::{RamDisk, RamDiskConfig, RAMDISK_MAJOR};

const RD: DeviceId = DeviceId::new(RAMDISK_MAJOR, 1);

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

// ════════════════════════════════════════════════════════════
// Part A: Identity
// ════════════════════════════════════════════════════════════

fn test_identity(t: &mut TestRunner, cache: &BufferCache, disk: &RamDisk) {
    t.section("Part A: Block Identity and References");

    disk.load(10, &[0x5a; BLOCK_SIZE]);
    let a = match cache.read_block(RD, 10) {
        Ok(h) => h,
        Err(e) => {
            t.fail("read_block(10)", &e.to_string());
            return;
        }
    };
    t.check("read_block returns disk contents", cache.with_data(&a, |d| d.iter().all(|&b| b == 0x5a)), "bad data");

    let before = cache.stats();
    let b = cache.read_block(RD, 10);
    let after = cache.stats();
    match b {
        Ok(b) => {
            t.check("second read maps to same buffer", a.id() == b.id(), "different descriptor");
            t.check("second read is a hit", after.hits == before.hits + 1, "hit not counted");
            t.check("two references held", cache.ref_count(&a) == 2, &format!("count {}", cache.ref_count(&a)));
            cache.release(b);
        }
        Err(e) => t.fail("second read_block(10)", &e.to_string()),
    }
    cache.release(a);
    t.check("references drop to zero", cache.ref_count(&a) == 0, "leaked reference");

    let shared: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || cache.read_block(RD, 11).map(|h| (h.id(), h)))
        })
        .collect();
    let mut ids = vec![];
    for h in shared {
        match h.join() {
            Ok(Ok((id, h))) => {
                ids.push(id);
                cache.release(h);
            }
            _ => t.fail("concurrent read_block(11)", "reader failed"),
        }
    }
    t.check("concurrent readers share a descriptor", ids.windows(2).all(|w| w[0] == w[1]), "duplicate identity");
}

// ════════════════════════════════════════════════════════════
// Part B: Write-back
// ════════════════════════════════════════════════════════════

fn test_write_back(t: &mut TestRunner, cache: &BufferCache, disk: &RamDisk) {
    t.section("Part B: Write-back, Sync and Eviction");

    let h = cache.get_block(RD, 20);
    cache.with_data_mut(&h, |d| d.fill(0xc3));
    cache.mark_uptodate(&h);
    cache.write_through(&h);
    t.check("modified buffer is dirty", cache.is_dirty(&h), "dirty flag not set");
    t.check("disk untouched before sync", disk.read_raw(20)[0] == 0, "written early");

    t.check("sync_device succeeds", cache.sync_device(Some(RD)).is_ok(), "sync failed");
    t.check("sync reaches the medium", disk.read_raw(20)[0] == 0xc3, "data not on disk");
    t.check("buffer clean after sync", !cache.is_dirty(&h), "still dirty");
    cache.release(h);

    // Walk far more blocks than the pool holds; every dirty victim is written back
    let n = cache.config().nr_buffers as u32 * 2;
    for block in 100..100 + n {
        let h = cache.get_block(RD, block);
        cache.with_data_mut(&h, |d| d[0] = block as u8);
        cache.mark_uptodate(&h);
        cache.write_through(&h);
        cache.release(h);
    }
    let ok = cache.sync_device(None).is_ok();
    let on_disk = (100..100 + n).all(|b| disk.read_raw(b)[0] == b as u8);
    t.check("evicted dirty blocks survive", ok && on_disk, "lost write-back");
    t.check("pool structure intact", cache.verify().is_ok(), "verify failed");
}

// ════════════════════════════════════════════════════════════
// Part C: Elevator
// ════════════════════════════════════════════════════════════

fn test_elevator(t: &mut TestRunner, cache: &BufferCache) {
    t.section("Part C: Elevator Order");

    cache.plug(RAMDISK_MAJOR);
    let handles: Vec<_> = [25, 5, 15].iter().map(|&b| cache.get_block(RD, b)).collect();
    for h in &handles {
        if let Err(e) = cache.submit(IoCommand::Read, h) {
            t.fail("queue read", &e.to_string());
        }
    }
    let queued: Vec<_> = cache
        .queue_snapshot(RAMDISK_MAJOR)
        .iter()
        .filter(|r| r.command == Command::Read)
        .map(|r| r.sector)
        .collect();
    t.check("plugged queue sorted by sector", queued == vec![10, 30, 50], &format!("{:?}", queued));

    cache.unplug(RAMDISK_MAJOR);
    for h in &handles {
        cache.wait_on_buffer(h);
    }
    t.check("queue drains after unplug", handles.iter().all(|h| cache.is_uptodate(h)), "stale buffer");
    for h in handles {
        cache.release(h);
    }
}

// ════════════════════════════════════════════════════════════
// Part D: Media change
// ════════════════════════════════════════════════════════════

fn test_invalidate(t: &mut TestRunner, cache: &BufferCache, disk: &RamDisk) {
    t.section("Part D: Invalidation");

    disk.load(30, &[1; BLOCK_SIZE]);
    let h = match cache.read_block(RD, 30) {
        Ok(h) => h,
        Err(e) => {
            t.fail("read_block(30)", &e.to_string());
            return;
        }
    };
    disk.load(30, &[2; BLOCK_SIZE]);
    t.check("cached copy is stale", cache.with_data(&h, |d| d[0]) == 1, "unexpected refresh");

    cache.invalidate(RD);
    t.check("invalidate keeps references", cache.ref_count(&h) == 1, "count changed");
    t.check("invalidate clears uptodate", !cache.is_uptodate(&h), "still uptodate");
    cache.release(h);

    match cache.read_block(RD, 30) {
        Ok(h) => {
            t.check("re-read sees new medium", cache.with_data(&h, |d| d[0]) == 2, "old contents");
            cache.release(h);
        }
        Err(e) => t.fail("re-read block 30", &e.to_string()),
    }
    t.check("ramdisk reports no media change", !cache.check_media_change(RD), "spurious change");
}

// ════════════════════════════════════════════════════════════
// Part E: Block device I/O
// ════════════════════════════════════════════════════════════

fn test_blockdev(t: &mut TestRunner, cache: &BufferCache) {
    t.section("Part E: Block Device and Page I/O");

    let src: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
    let mut pos = 1500;
    let wrote = block_write(cache, RD, &mut pos, &src);
    t.check("block_write spans blocks", wrote == Ok(3000) && pos == 4500, &format!("{:?} pos {}", wrote, pos));

    let mut dst = vec![0u8; 3000];
    let mut pos = 1500;
    let read = block_read(cache, RD, &mut pos, &mut dst);
    t.check("block_read returns written bytes", read == Ok(3000) && dst == src, "mismatch");

    let mut page = [0xffu8; PAGE_SIZE];
    let res = cache.read_page(RD, [1, 0, 2, 3], &mut page);
    let hole = page[BLOCK_SIZE..2 * BLOCK_SIZE].iter().all(|&b| b == 0);
    t.check("read_page fills holes with zeroes", res.is_ok() && hole, "hole not zeroed");
    t.check(
        "read_page copies block 2 into slot 2",
        page[2 * BLOCK_SIZE..3 * BLOCK_SIZE] == src[548..548 + BLOCK_SIZE],
        "wrong block",
    );
}

// ════════════════════════════════════════════════════════════
// Part F: Errors
// ════════════════════════════════════════════════════════════

fn test_errors(t: &mut TestRunner, cache: &BufferCache, disk: &RamDisk) {
    t.section("Part F: Error Propagation");

    disk.inject_faults(40, None);
    t.check("permanent fault fails the read", cache.read_block(RD, 40).is_err(), "read succeeded");

    disk.inject_faults(41, Some(3));
    match cache.read_block(RD, 41) {
        Ok(h) => {
            t.pass("transient fault absorbed by retries");
            cache.release(h);
        }
        Err(e) => t.fail("transient fault absorbed by retries", &e.to_string()),
    }
    disk.clear_faults();

    let beyond = disk.blocks() as u32 + 5;
    t.check("read past the end fails", cache.read_block(RD, beyond).is_err(), "out of range read");
    t.check("unregistered major fails", cache.read_block(DeviceId::new(5, 0), 0).is_err(), "no error");
}

fn main() {
    println!("=== Buffer Cache Smoke Test ===");

    let config = CacheConfig::from_env();
    config.print();

    let mut t = TestRunner::new();

    let cache = match BufferCache::new(config) {
        Ok(c) => c,
        Err(e) => {
            println!("\nFATAL: cache config rejected: {}", e);
            std::process::exit(1);
        }
    };
    let disk = match RamDisk::new(RamDiskConfig::from_env()) {
        Ok(d) => Arc::new(d),
        Err(e) => {
            println!("\nFATAL: ramdisk failed to start: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = cache.register_driver(RAMDISK_MAJOR, disk.clone()) {
        println!("\nFATAL: register_driver: {}", e);
        std::process::exit(1);
    }

    test_identity(&mut t, &cache, &disk);
    test_write_back(&mut t, &cache, &disk);
    test_elevator(&mut t, &cache);
    test_invalidate(&mut t, &cache, &disk);
    test_blockdev(&mut t, &cache);
    test_errors(&mut t, &cache, &disk);

    println!();
    cache.stats().print();

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}

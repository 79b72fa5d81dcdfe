//! `RamDisk`: memory-backed block device with an interrupt thread.
//!
//! `submit` only pushes the request onto a bounded controller queue and
//! kicks the interrupt thread. The interrupt thread performs the copy and
//! calls `Request::end`, so completions always arrive on a thread other
//! than the submitter's, as they would from real hardware.
//!
//! Only minor 1 exists. Requests for any other minor, or past the end of
//! the disk, fail immediately.
//!
//! Faults can be injected per block: a faulting transfer is retried on
//! the interrupt thread and failed for good after `MAX_ERRORS` attempts.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use bcache_core::constants::{BLOCK_SIZE, MAX_ERRORS};
use bcache_core::{env_get, kdebug, kerror, BlockDriver, Command, ConfigError, Request, SpinLock};

/// Conventional major number of the RAM disk
pub const RAMDISK_MAJOR: u8 = 1;

/// Minor number of the only RAM disk unit
const RAMDISK_MINOR: u8 = 1;

/// Fault count meaning "fail every attempt"
const PERMANENT: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RamDiskConfig {
    /// Disk size in blocks
    pub blocks: usize,
    /// Controller queue capacity
    pub queue_depth: usize,
}

impl Default for RamDiskConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RamDiskConfig {
    /// Defaults with environment overrides.
    ///
    /// - `BCACHE_RAMDISK_BLOCKS` - Disk size in blocks (default 2048)
    /// - `BCACHE_RAMDISK_QUEUE_DEPTH` - Controller queue capacity (default 64)
    pub fn from_env() -> Self {
        Self {
            blocks: env_get("BCACHE_RAMDISK_BLOCKS", 2048),
            queue_depth: env_get("BCACHE_RAMDISK_QUEUE_DEPTH", 64),
        }
    }

    pub fn blocks(mut self, n: usize) -> Self {
        self.blocks = n;
        self
    }

    pub fn queue_depth(mut self, n: usize) -> Self {
        self.queue_depth = n;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.blocks == 0 {
            return Err(ConfigError::InvalidValue("ramdisk blocks must be > 0"));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::InvalidValue("ramdisk queue_depth must be > 0"));
        }
        Ok(())
    }
}

struct RamDiskInner {
    storage: SpinLock<Vec<u8>>,
    /// Controller queue: submit -> interrupt thread
    queue: ArrayQueue<Request>,
    /// Remaining injected failures per block
    faults: SpinLock<HashMap<u32, u32>>,
    shutdown: AtomicBool,
    completed: AtomicU64,
    retries: AtomicU64,
}

pub struct RamDisk {
    inner: Arc<RamDiskInner>,
    irq: Option<thread::JoinHandle<()>>,
}

impl RamDisk {
    /// Allocate a zeroed disk and start its interrupt thread.
    pub fn new(config: RamDiskConfig) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let inner = Arc::new(RamDiskInner {
            storage: SpinLock::new(vec![0; config.blocks * BLOCK_SIZE]),
            queue: ArrayQueue::new(config.queue_depth),
            faults: SpinLock::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        });

        let irq = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("ramdisk-irq".into())
                .spawn(move || irq_loop(inner))?
        };

        kdebug!("ramdisk: {} blocks", config.blocks);
        Ok(RamDisk { inner, irq: Some(irq) })
    }

    /// Disk size in blocks
    pub fn blocks(&self) -> usize {
        self.inner.storage.lock().len() / BLOCK_SIZE
    }

    /// Write directly to the medium, bypassing the request path. Bytes
    /// past the end of the disk are ignored.
    pub fn load(&self, block: u32, data: &[u8]) {
        let mut storage = self.inner.storage.lock();
        let start = block as usize * BLOCK_SIZE;
        if start >= storage.len() {
            return;
        }
        let n = data.len().min(storage.len() - start);
        storage[start..start + n].copy_from_slice(&data[..n]);
    }

    /// Read one block directly from the medium.
    pub fn read_raw(&self, block: u32) -> [u8; BLOCK_SIZE] {
        let storage = self.inner.storage.lock();
        let start = block as usize * BLOCK_SIZE;
        let mut out = [0u8; BLOCK_SIZE];
        out.copy_from_slice(&storage[start..start + BLOCK_SIZE]);
        out
    }

    /// Make the next `attempts` transfers of `block` fail.
    ///
    /// Fewer than `MAX_ERRORS` attempts are absorbed by retries; `None`
    /// fails every attempt.
    pub fn inject_faults(&self, block: u32, attempts: Option<u32>) {
        self.inner.faults.lock().insert(block, attempts.unwrap_or(PERMANENT));
    }

    pub fn clear_faults(&self) {
        self.inner.faults.lock().clear();
    }

    /// Requests finished (successfully or not)
    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    /// Transfer attempts repeated after an error
    pub fn retries(&self) -> u64 {
        self.inner.retries.load(Ordering::Relaxed)
    }

    fn kick(&self) {
        if let Some(irq) = &self.irq {
            irq.thread().unpark();
        }
    }
}

impl BlockDriver for RamDisk {
    fn name(&self) -> &'static str {
        "ramdisk"
    }

    fn submit(&self, request: Request) {
        if self.inner.shutdown.load(Ordering::Relaxed) {
            request.end(false);
            return;
        }
        if let Err(request) = self.inner.queue.push(request) {
            kerror!("ramdisk: controller queue full, failing request {}", request.id());
            request.end(false);
            return;
        }
        self.kick();
    }
}

impl Drop for RamDisk {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(irq) = self.irq.take() {
            // The last cache reference can be dropped from inside a
            // completion, i.e. on the interrupt thread itself.
            if irq.thread().id() == thread::current().id() {
                return;
            }
            irq.thread().unpark();
            let _ = irq.join();
        }
    }
}

/// Interrupt thread main loop. Drains the queue before honouring shutdown.
fn irq_loop(inner: Arc<RamDiskInner>) {
    loop {
        match inner.queue.pop() {
            Some(request) => service(&inner, request),
            None => {
                if inner.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                thread::park_timeout(Duration::from_millis(1));
            }
        }
    }
}

fn service(inner: &RamDiskInner, mut request: Request) {
    loop {
        let success = match transfer(inner, &request) {
            Ok(()) => true,
            Err(Fault::Permanent) => false,
            Err(Fault::Transient) => {
                let errors = request.record_error();
                if errors < MAX_ERRORS {
                    inner.retries.fetch_add(1, Ordering::Relaxed);
                    kdebug!("ramdisk: retrying block {} (attempt {})", request.block(), errors + 1);
                    continue;
                }
                kerror!("ramdisk: block {} failed after {} attempts", request.block(), errors);
                false
            }
        };
        inner.completed.fetch_add(1, Ordering::Relaxed);
        request.end(success);
        return;
    }
}

enum Fault {
    /// Request can never succeed (bad minor, out of range)
    Permanent,
    /// Medium error, worth retrying
    Transient,
}

fn transfer(inner: &RamDiskInner, request: &Request) -> Result<(), Fault> {
    if request.device().minor() != RAMDISK_MINOR {
        kerror!("ramdisk: no unit {}", request.device());
        return Err(Fault::Permanent);
    }
    {
        let mut faults = inner.faults.lock();
        if let Some(left) = faults.get_mut(&request.block()) {
            if *left > 0 {
                if *left != PERMANENT {
                    *left -= 1;
                }
                return Err(Fault::Transient);
            }
        }
    }

    let mut storage = inner.storage.lock();
    let start = request.byte_offset() as usize;
    let end = start + request.len();
    if end > storage.len() {
        kerror!("ramdisk: block {} beyond end of disk", request.block());
        return Err(Fault::Permanent);
    }
    match request.command() {
        Command::Read => request.write_buffer(&storage[start..end]),
        Command::Write => request.read_buffer(&mut storage[start..end]),
    }
    Ok(())
}

//! `InlineDisk`: synchronous driver for tests.
//!
//! Completes each request inside `submit`, on the caller's thread, and
//! records every submission. Pausing the disk parks requests instead, so
//! a test can observe queue state with transfers in flight and then
//! finish them one at a time.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use bcache_core::constants::BLOCK_SIZE;
use bcache_core::{ktrace, BlockDriver, Command, DeviceId, Request, SpinLock};

/// One request as the driver received it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub command: Command,
    pub device: DeviceId,
    pub block: u32,
    pub sector: u32,
}

pub struct InlineDisk {
    storage: SpinLock<Vec<u8>>,
    paused: AtomicBool,
    pending: SpinLock<VecDeque<Request>>,
    log: SpinLock<Vec<Submission>>,
    failing: SpinLock<HashSet<u32>>,
    changed: SpinLock<HashSet<DeviceId>>,
}

impl InlineDisk {
    /// A zeroed disk of `blocks` blocks. Every minor maps to the same medium.
    pub fn new(blocks: usize) -> Self {
        InlineDisk {
            storage: SpinLock::new(vec![0; blocks * BLOCK_SIZE]),
            paused: AtomicBool::new(false),
            pending: SpinLock::new(VecDeque::new()),
            log: SpinLock::new(Vec::new()),
            failing: SpinLock::new(HashSet::new()),
            changed: SpinLock::new(HashSet::new()),
        }
    }

    /// Hold requests until `complete_next` or `resume`.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Stop holding requests and finish everything held. Returns how many.
    pub fn resume(&self) -> usize {
        self.paused.store(false, Ordering::SeqCst);
        let mut n = 0;
        while self.complete_next() {
            n += 1;
        }
        n
    }

    /// Finish the oldest held request. `false` if none was held.
    pub fn complete_next(&self) -> bool {
        // Completion may re-enter submit; the pending lock must be free
        let next = self.pending.lock().pop_front();
        match next {
            Some(request) => {
                self.perform(request);
                true
            }
            None => false,
        }
    }

    /// Requests currently held
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.log.lock().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.log.lock().len()
    }

    pub fn clear_submissions(&self) {
        self.log.lock().clear();
    }

    pub fn write_raw(&self, block: u32, data: &[u8]) {
        let mut storage = self.storage.lock();
        let start = block as usize * BLOCK_SIZE;
        let n = data.len().min(BLOCK_SIZE);
        storage[start..start + n].copy_from_slice(&data[..n]);
    }

    pub fn read_raw(&self, block: u32) -> [u8; BLOCK_SIZE] {
        let storage = self.storage.lock();
        let start = block as usize * BLOCK_SIZE;
        let mut out = [0u8; BLOCK_SIZE];
        out.copy_from_slice(&storage[start..start + BLOCK_SIZE]);
        out
    }

    /// Fail every transfer of `block` until healed
    pub fn fail_block(&self, block: u32) {
        self.failing.lock().insert(block);
    }

    pub fn heal_block(&self, block: u32) {
        self.failing.lock().remove(&block);
    }

    /// Report a media change for `device` on the next check
    pub fn set_media_changed(&self, device: DeviceId) {
        self.changed.lock().insert(device);
    }

    fn perform(&self, request: Request) {
        let ok = !self.failing.lock().contains(&request.block()) && {
            let mut storage = self.storage.lock();
            let start = request.byte_offset() as usize;
            let end = start + request.len();
            if end > storage.len() {
                false
            } else {
                match request.command() {
                    Command::Read => request.write_buffer(&storage[start..end]),
                    Command::Write => request.read_buffer(&mut storage[start..end]),
                }
                true
            }
        };
        ktrace!("inline: request {} {}", request.id(), if ok { "done" } else { "failed" });
        request.end(ok);
    }
}

impl BlockDriver for InlineDisk {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn submit(&self, request: Request) {
        self.log.lock().push(Submission {
            command: request.command(),
            device: request.device(),
            block: request.block(),
            sector: request.sector(),
        });
        if self.paused.load(Ordering::SeqCst) {
            self.pending.lock().push_back(request);
        } else {
            self.perform(request);
        }
    }

    fn media_changed(&self, device: DeviceId) -> bool {
        self.changed.lock().remove(&device)
    }
}

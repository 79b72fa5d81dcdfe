//! Block driver interface.
//!
//! A driver receives [`Request`]s from the cache's scheduler, performs the
//! transfer against its medium, and finishes each request exactly once by
//! calling [`Request::end`]. Completion may happen synchronously inside
//! `submit` or later from another thread ("interrupt" context).
//!
//! # Implementors
//!
//! - `RamDisk` (bcache-drivers): memory-backed medium completed from a
//!   dedicated interrupt thread, with retry-until-`MAX_ERRORS` fault handling.
//! - `InlineDisk` (bcache-drivers): completes inside `submit`, or holds
//!   requests until the caller drains them. Used to drive tests step by step.

use std::sync::{Arc, Weak};

use crate::constants::{BLOCK_SIZE, SECTORS_PER_BLOCK, SECTOR_SIZE};
use crate::id::{DeviceId, RequestId};
use crate::spinlock::SpinLock;

/// Contents of one cached block, shared between the cache and a driver
/// for the duration of a transfer.
pub type BlockData = SpinLock<[u8; BLOCK_SIZE]>;

/// Transfer direction of a queued request.
///
/// Reads order before writes in the elevator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Command {
    Read = 0,
    Write = 1,
}

/// What a caller asks of `submit`: a transfer, optionally as a hint.
///
/// The `*Ahead` variants are advisory. They are dropped instead of blocking
/// when the buffer is busy or the request table is short of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoCommand {
    Read,
    Write,
    ReadAhead,
    WriteAhead,
}

impl IoCommand {
    /// Direction once the hint flag is stripped
    #[inline]
    pub fn command(self) -> Command {
        match self {
            IoCommand::Read | IoCommand::ReadAhead => Command::Read,
            IoCommand::Write | IoCommand::WriteAhead => Command::Write,
        }
    }

    #[inline]
    pub fn is_ahead(self) -> bool {
        matches!(self, IoCommand::ReadAhead | IoCommand::WriteAhead)
    }
}

/// Receives request completions.
///
/// Implemented by the buffer cache. `end_request` may be called from any
/// thread and must not be re-entered for the same id.
pub trait CompletionSink: Send + Sync {
    /// Finish request `id`. `success == false` marks the buffer not up to date.
    fn end_request(&self, id: RequestId, success: bool);
}

/// Weak route from a request back to the cache that issued it.
///
/// Weak so that an in-flight request does not keep a dropped cache alive.
#[derive(Clone)]
pub struct CompletionPort {
    sink: Weak<dyn CompletionSink>,
}

impl CompletionPort {
    pub fn new(sink: Weak<dyn CompletionSink>) -> Self {
        CompletionPort { sink }
    }

    /// Deliver a completion. Dropped with a warning if the cache is gone.
    pub fn complete(&self, id: RequestId, success: bool) {
        match self.sink.upgrade() {
            Some(sink) => sink.end_request(id, success),
            None => crate::kwarn!("completion for request {} after cache shutdown", id),
        }
    }
}

/// One block transfer handed to a driver.
///
/// Not `Clone`: ending a request consumes it, so a request completes at
/// most once.
pub struct Request {
    id: RequestId,
    device: DeviceId,
    command: Command,
    sector: u32,
    nr_sectors: u32,
    block: u32,
    buffer: Arc<BlockData>,
    errors: u32,
    port: CompletionPort,
}

impl Request {
    /// Build the request for one whole block of `device`.
    ///
    /// Blocks past `MAX_BLOCK` get a saturated sector number, which no
    /// driver can serve.
    pub fn new(
        id: RequestId,
        device: DeviceId,
        command: Command,
        block: u32,
        buffer: Arc<BlockData>,
        port: CompletionPort,
    ) -> Self {
        Request {
            id,
            device,
            command,
            sector: block.saturating_mul(SECTORS_PER_BLOCK),
            nr_sectors: SECTORS_PER_BLOCK,
            block,
            buffer,
            errors: 0,
            port,
        }
    }

    #[inline]
    pub fn id(&self) -> RequestId {
        self.id
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[inline]
    pub fn command(&self) -> Command {
        self.command
    }

    /// First sector of the transfer
    #[inline]
    pub fn sector(&self) -> u32 {
        self.sector
    }

    #[inline]
    pub fn nr_sectors(&self) -> u32 {
        self.nr_sectors
    }

    #[inline]
    pub fn block(&self) -> u32 {
        self.block
    }

    /// Byte offset of the transfer on the medium
    #[inline]
    pub fn byte_offset(&self) -> u64 {
        self.sector as u64 * SECTOR_SIZE as u64
    }

    /// Transfer length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.nr_sectors as usize * SECTOR_SIZE
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nr_sectors == 0
    }

    /// Copy the buffer's contents out (write path: buffer to medium).
    pub fn read_buffer(&self, dst: &mut [u8]) {
        let data = self.buffer.lock();
        let n = dst.len().min(BLOCK_SIZE);
        dst[..n].copy_from_slice(&data[..n]);
    }

    /// Fill the buffer (read path: medium to buffer).
    pub fn write_buffer(&self, src: &[u8]) {
        let mut data = self.buffer.lock();
        let n = src.len().min(BLOCK_SIZE);
        data[..n].copy_from_slice(&src[..n]);
    }

    /// Failed attempts so far
    #[inline]
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Count one failed attempt and return the new total.
    pub fn record_error(&mut self) -> u32 {
        self.errors = self.errors.saturating_add(1);
        self.errors
    }

    /// Finish the request and hand the result to the cache.
    pub fn end(self, success: bool) {
        self.port.complete(self.id, success);
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("command", &self.command)
            .field("sector", &self.sector)
            .field("nr_sectors", &self.nr_sectors)
            .field("errors", &self.errors)
            .finish()
    }
}

/// A block device driver, registered in the cache under one major number.
pub trait BlockDriver: Send + Sync {
    /// Short name for diagnostics
    fn name(&self) -> &'static str;

    /// Start (or queue) the transfer. Must eventually call `request.end()`.
    ///
    /// Called without any cache lock held, so the driver may complete the
    /// request synchronously from inside this call.
    fn submit(&self, request: Request);

    /// Whether the medium behind `device` was swapped since the last check.
    ///
    /// Reading the flag clears it. Fixed media never change.
    fn media_changed(&self, _device: DeviceId) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        ends: Mutex<Vec<(RequestId, bool)>>,
    }

    impl CompletionSink for Recorder {
        fn end_request(&self, id: RequestId, success: bool) {
            self.ends.lock().unwrap().push((id, success));
        }
    }

    fn port_to(sink: &Arc<Recorder>) -> CompletionPort {
        let sink: Arc<dyn CompletionSink> = sink.clone();
        CompletionPort::new(Arc::downgrade(&sink))
    }

    #[test]
    fn test_io_command_strips_hint() {
        assert_eq!(IoCommand::ReadAhead.command(), Command::Read);
        assert_eq!(IoCommand::WriteAhead.command(), Command::Write);
        assert!(IoCommand::WriteAhead.is_ahead());
        assert!(!IoCommand::Write.is_ahead());
        assert!(Command::Read < Command::Write);
    }

    #[test]
    fn test_request_geometry() {
        let sink = Arc::new(Recorder { ends: Mutex::new(vec![]) });
        let buf = Arc::new(BlockData::new([0; BLOCK_SIZE]));
        let req = Request::new(RequestId::new(4), DeviceId::new(1, 1), Command::Read, 5, buf, port_to(&sink));

        assert_eq!(req.sector(), 10);
        assert_eq!(req.nr_sectors(), 2);
        assert_eq!(req.byte_offset(), 5 * BLOCK_SIZE as u64);
        assert_eq!(req.len(), BLOCK_SIZE);
    }

    #[test]
    fn test_request_transfer_and_end() {
        let sink = Arc::new(Recorder { ends: Mutex::new(vec![]) });
        let buf = Arc::new(BlockData::new([0; BLOCK_SIZE]));
        let mut req = Request::new(RequestId::new(2), DeviceId::new(3, 0), Command::Write, 0, buf.clone(), port_to(&sink));

        req.write_buffer(&[7u8; BLOCK_SIZE]);
        assert_eq!(buf.lock()[BLOCK_SIZE - 1], 7);

        let mut out = [0u8; BLOCK_SIZE];
        req.read_buffer(&mut out);
        assert!(out.iter().all(|&b| b == 7));

        assert_eq!(req.record_error(), 1);
        assert_eq!(req.record_error(), 2);
        req.end(false);

        assert_eq!(*sink.ends.lock().unwrap(), vec![(RequestId::new(2), false)]);
    }

    #[test]
    fn test_port_outliving_sink() {
        let sink = Arc::new(Recorder { ends: Mutex::new(vec![]) });
        let port = port_to(&sink);
        drop(sink);
        crate::kprint::set_log_level(crate::kprint::LogLevel::Off);
        port.complete(RequestId::new(0), true);
    }
}

//! Request table, per-major device queues and the elevator.
//!
//! A fixed table of request slots is shared by every device. Each major
//! number owns a singly linked queue threaded through the slots; the head
//! of an active queue is the request its driver is working on.
//!
//! Reads may claim any slot. Writes are limited to the first two thirds of
//! the table so a burst of write-back can never starve reads.
//!
//! A queue can be plugged: requests accumulate and are sorted without
//! being handed to the driver until the queue is unplugged. An
//! undispatched head may still be displaced by a request that sorts
//! before it; a dispatched one never is.

use bcache_core::constants::{NR_BLK_DEV, SECTORS_PER_BLOCK};
use bcache_core::{fatal, BufferId, Command, DeviceId, RequestId};

use crate::waitset::WaitSet;

/// Sort key of a queued request, as the elevator sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedRequest {
    pub command: Command,
    pub device: DeviceId,
    pub sector: u32,
}

impl QueuedRequest {
    /// Elevator order: reads before writes, then device, then sector.
    #[inline]
    pub fn precedes(&self, other: &QueuedRequest) -> bool {
        (self.command, self.device, self.sector) < (other.command, other.device, other.sector)
    }
}

pub(crate) struct RequestSlot {
    /// `NONE` marks a free slot
    pub device: DeviceId,
    pub command: Command,
    pub sector: u32,
    pub block: u32,
    pub buffer: BufferId,
    pub waiters: WaitSet,
    next: RequestId,
}

impl RequestSlot {
    fn free() -> Self {
        RequestSlot {
            device: DeviceId::NONE,
            command: Command::Read,
            sector: 0,
            block: 0,
            buffer: BufferId::NONE,
            waiters: WaitSet::new(),
            next: RequestId::NONE,
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.device.is_none()
    }

    fn key(&self) -> QueuedRequest {
        QueuedRequest { command: self.command, device: self.device, sector: self.sector }
    }
}

#[derive(Clone, Copy)]
struct DeviceQueue {
    head: RequestId,
    /// The head has been handed to the driver
    active: bool,
    plugged: bool,
}

impl DeviceQueue {
    const EMPTY: DeviceQueue = DeviceQueue { head: RequestId::NONE, active: false, plugged: false };
}

/// What the completion path needs once a slot is freed
pub(crate) struct Finished {
    pub device: DeviceId,
    pub block: u32,
    pub buffer: BufferId,
    pub waiters: WaitSet,
    /// New queue head to hand to the driver
    pub next: Option<RequestId>,
}

pub(crate) struct RequestTable {
    slots: Vec<RequestSlot>,
    queues: [DeviceQueue; NR_BLK_DEV],
    write_limit: usize,
    in_use: usize,
    /// Threads waiting for a free slot
    pub wait: WaitSet,
}

impl RequestTable {
    pub fn new(nr_request: usize) -> Self {
        RequestTable {
            slots: (0..nr_request).map(|_| RequestSlot::free()).collect(),
            queues: [DeviceQueue::EMPTY; NR_BLK_DEV],
            write_limit: nr_request * 2 / 3,
            in_use: 0,
            wait: WaitSet::new(),
        }
    }

    #[inline]
    pub fn slot(&self, id: RequestId) -> &RequestSlot {
        &self.slots[id.index()]
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Claim a free slot for one block transfer, scanning down from the
    /// command's limit. `None` when every eligible slot is taken.
    ///
    /// The caller keeps `block` within `MAX_BLOCK`.
    pub fn alloc(
        &mut self,
        command: Command,
        device: DeviceId,
        block: u32,
        buffer: BufferId,
    ) -> Option<RequestId> {
        let limit = match command {
            Command::Read => self.slots.len(),
            Command::Write => self.write_limit,
        };
        let index = (0..limit).rev().find(|&i| self.slots[i].is_free())?;

        let slot = &mut self.slots[index];
        slot.device = device;
        slot.command = command;
        slot.block = block;
        slot.sector = block.saturating_mul(SECTORS_PER_BLOCK);
        slot.buffer = buffer;
        slot.next = RequestId::NONE;
        self.in_use += 1;
        Some(RequestId::new(index as u32))
    }

    /// Sort a filled slot into its device queue. Returns the request to
    /// hand to the driver, if the queue just became active.
    pub fn enqueue(&mut self, id: RequestId) -> Option<RequestId> {
        let key = self.slot(id).key();
        let major = key.device.major() as usize;
        let queue = self.queues[major];

        if queue.head.is_none() {
            self.queues[major].head = id;
            if queue.plugged {
                return None;
            }
            self.queues[major].active = true;
            return Some(id);
        }

        if !queue.active && key.precedes(&self.slot(queue.head).key()) {
            self.slots[id.index()].next = queue.head;
            self.queues[major].head = id;
            return None;
        }

        let mut tmp = queue.head;
        loop {
            let next = self.slot(tmp).next;
            if next.is_none() {
                break;
            }
            let cur = self.slot(tmp).key();
            let after = self.slot(next).key();
            if (cur.precedes(&key) || !cur.precedes(&after)) && key.precedes(&after) {
                break;
            }
            tmp = next;
        }
        self.slots[id.index()].next = self.slot(tmp).next;
        self.slots[tmp.index()].next = id;
        None
    }

    /// Retire the active head of its queue and free the slot.
    pub fn complete(&mut self, id: RequestId) -> Finished {
        if id.index() >= self.slots.len() || self.slot(id).is_free() {
            fatal("completion for a free request slot");
        }
        let major = self.slot(id).device.major() as usize;
        let queue = self.queues[major];
        if queue.head != id || !queue.active {
            fatal("request list destroyed");
        }

        let slot = &mut self.slots[id.index()];
        let finished_next = slot.next;
        let mut finished = Finished {
            device: slot.device,
            block: slot.block,
            buffer: slot.buffer,
            waiters: slot.waiters.take(),
            next: None,
        };
        *slot = RequestSlot::free();
        self.in_use -= 1;

        let q = &mut self.queues[major];
        q.head = finished_next;
        if q.head.is_none() || q.plugged {
            q.active = false;
        } else {
            finished.next = Some(q.head);
        }
        finished
    }

    /// Hold back new dispatches on `major` until `unplug`.
    pub fn plug(&mut self, major: u8) {
        self.queues[major as usize].plugged = true;
    }

    /// Release a plugged queue. Returns the head to dispatch, if any.
    pub fn unplug(&mut self, major: u8) -> Option<RequestId> {
        let q = &mut self.queues[major as usize];
        q.plugged = false;
        if q.head.is_some() && !q.active {
            q.active = true;
            return Some(q.head);
        }
        None
    }

    /// Queue contents in service order
    pub fn snapshot(&self, major: u8) -> Vec<QueuedRequest> {
        let mut out = vec![];
        let mut cur = self.queues[major as usize].head;
        while cur.is_some() {
            out.push(self.slot(cur).key());
            cur = self.slot(cur).next;
        }
        out
    }
}

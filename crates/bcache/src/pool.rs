//! Buffer descriptor pool and the LRU free list.
//!
//! Every descriptor is created once and lives for the life of the cache;
//! only its identity and flags change. All descriptors sit on one
//! circular, doubly linked free list at all times. Claiming a descriptor
//! moves it to the tail, so scanning from the head visits the least
//! recently claimed buffers first.
//!
//! Links are `BufferId` indices into the pool. A `NONE` link on a
//! descriptor that should be on the list means the list was corrupted.

use bcache_core::{fatal, BufferId, DeviceId};

use crate::waitset::WaitSet;

/// Metadata of one cached block. The bytes live outside the state lock.
pub(crate) struct Descriptor {
    pub device: DeviceId,
    pub block: u32,
    pub dirty: bool,
    pub uptodate: bool,
    /// An I/O transfer owns the data
    pub locked: bool,
    pub count: u32,
    /// Threads waiting for `locked` to clear
    pub wait: WaitSet,
    pub hash_prev: BufferId,
    pub hash_next: BufferId,
    pub prev_free: BufferId,
    pub next_free: BufferId,
}

impl Descriptor {
    fn unbound() -> Self {
        Descriptor {
            device: DeviceId::NONE,
            block: 0,
            dirty: false,
            uptodate: false,
            locked: false,
            count: 0,
            wait: WaitSet::new(),
            hash_prev: BufferId::NONE,
            hash_next: BufferId::NONE,
            prev_free: BufferId::NONE,
            next_free: BufferId::NONE,
        }
    }

    /// Cost of repurposing: dirty needs a write-back, locked needs a wait.
    #[inline]
    pub fn badness(&self) -> u32 {
        2 * self.dirty as u32 + self.locked as u32
    }

    #[inline]
    pub fn is(&self, device: DeviceId, block: u32) -> bool {
        self.device == device && self.block == block
    }
}

pub(crate) struct BufferPool {
    descs: Vec<Descriptor>,
    free_head: BufferId,
}

impl BufferPool {
    pub fn new(nr_buffers: usize) -> Self {
        let n = nr_buffers as u32;
        let mut descs: Vec<Descriptor> = (0..n).map(|_| Descriptor::unbound()).collect();
        for i in 0..n {
            let d = &mut descs[i as usize];
            d.prev_free = BufferId::new((i + n - 1) % n);
            d.next_free = BufferId::new((i + 1) % n);
        }
        BufferPool {
            descs,
            free_head: if n == 0 { BufferId::NONE } else { BufferId::new(0) },
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.descs.len()
    }

    #[inline]
    pub fn get(&self, id: BufferId) -> &Descriptor {
        &self.descs[id.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: BufferId) -> &mut Descriptor {
        &mut self.descs[id.index()]
    }

    pub fn ids(&self) -> impl Iterator<Item = BufferId> {
        (0..self.descs.len() as u32).map(BufferId::new)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BufferId, &Descriptor)> {
        self.descs.iter().enumerate().map(|(i, d)| (BufferId::new(i as u32), d))
    }

    /// One pass over the free list from the head: the unreferenced
    /// descriptor with the lowest badness, stopping early at a clean,
    /// unlocked one.
    pub fn select_victim(&self) -> Option<BufferId> {
        let mut best: Option<(BufferId, u32)> = None;
        let mut cur = self.free_head;
        for _ in 0..self.descs.len() {
            let d = self.get(cur);
            if d.count == 0 {
                let badness = d.badness();
                if best.map_or(true, |(_, b)| badness < b) {
                    best = Some((cur, badness));
                    if badness == 0 {
                        break;
                    }
                }
            }
            cur = d.next_free;
        }
        best.map(|(id, _)| id)
    }

    pub fn unlink_free(&mut self, id: BufferId) {
        let (prev, next) = {
            let d = self.get(id);
            (d.prev_free, d.next_free)
        };
        if prev.is_none() || next.is_none() {
            fatal("free block list corrupted");
        }
        self.get_mut(prev).next_free = next;
        self.get_mut(next).prev_free = prev;
        if self.free_head == id {
            self.free_head = if next == id { BufferId::NONE } else { next };
        }
        let d = self.get_mut(id);
        d.prev_free = BufferId::NONE;
        d.next_free = BufferId::NONE;
    }

    /// Insert just before the head, i.e. at the most-recent end.
    pub fn push_free_tail(&mut self, id: BufferId) {
        if self.free_head.is_none() {
            self.free_head = id;
            let d = self.get_mut(id);
            d.prev_free = id;
            d.next_free = id;
            return;
        }
        let head = self.free_head;
        let tail = self.get(head).prev_free;
        {
            let d = self.get_mut(id);
            d.prev_free = tail;
            d.next_free = head;
        }
        self.get_mut(tail).next_free = id;
        self.get_mut(head).prev_free = id;
    }

    /// Walk the free list and check it is one cycle over every descriptor.
    pub fn verify_free_list(&self) -> Result<(), &'static str> {
        if self.descs.is_empty() {
            return Ok(());
        }
        let mut seen = vec![false; self.descs.len()];
        let mut cur = self.free_head;
        for _ in 0..self.descs.len() {
            if cur.is_none() || cur.index() >= seen.len() {
                return Err("free list link out of range");
            }
            if seen[cur.index()] {
                return Err("free list cycles early");
            }
            seen[cur.index()] = true;
            let next = self.get(cur).next_free;
            if next.is_none() || self.get(next).prev_free != cur {
                return Err("free list back-link mismatch");
            }
            cur = next;
        }
        if cur != self.free_head {
            return Err("free list does not close");
        }
        Ok(())
    }

    #[cfg(test)]
    fn free_order(&self) -> Vec<u32> {
        let mut out = vec![];
        let mut cur = self.free_head;
        for _ in 0..self.descs.len() {
            out.push(cur.as_u32());
            cur = self.get(cur).next_free;
        }
        out
    }
}

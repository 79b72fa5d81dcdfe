//! Hash index over (device, block).
//!
//! Chained buckets, `(device ^ block) % nr_hash`. The chain links live in
//! the descriptors themselves; this table only holds bucket heads.
//! Unbound descriptors (`DeviceId::NONE`) are never hashed.

use bcache_core::{BufferId, DeviceId};

use crate::pool::BufferPool;

pub(crate) struct HashIndex {
    buckets: Vec<BufferId>,
}

impl HashIndex {
    pub fn new(nr_hash: usize) -> Self {
        HashIndex { buckets: vec![BufferId::NONE; nr_hash] }
    }

    #[inline]
    pub fn bucket(&self, device: DeviceId, block: u32) -> usize {
        ((device.as_u16() as u32) ^ block) as usize % self.buckets.len()
    }

    pub fn find(&self, pool: &BufferPool, device: DeviceId, block: u32) -> Option<BufferId> {
        let mut cur = self.buckets[self.bucket(device, block)];
        while cur.is_some() {
            let d = pool.get(cur);
            if d.is(device, block) {
                return Some(cur);
            }
            cur = d.hash_next;
        }
        None
    }

    /// Link `id` at the front of the chain for its current identity.
    pub fn insert(&mut self, pool: &mut BufferPool, id: BufferId) {
        let (device, block) = {
            let d = pool.get(id);
            (d.device, d.block)
        };
        if device.is_none() {
            return;
        }
        let slot = self.bucket(device, block);
        let head = self.buckets[slot];
        {
            let d = pool.get_mut(id);
            d.hash_prev = BufferId::NONE;
            d.hash_next = head;
        }
        if head.is_some() {
            pool.get_mut(head).hash_prev = id;
        }
        self.buckets[slot] = id;
    }

    /// Unlink `id` from the chain of its current identity.
    pub fn remove(&mut self, pool: &mut BufferPool, id: BufferId) {
        let (device, block, prev, next) = {
            let d = pool.get(id);
            (d.device, d.block, d.hash_prev, d.hash_next)
        };
        if device.is_none() {
            return;
        }
        if prev.is_some() {
            pool.get_mut(prev).hash_next = next;
        }
        if next.is_some() {
            pool.get_mut(next).hash_prev = prev;
        }
        let slot = self.bucket(device, block);
        if self.buckets[slot] == id {
            self.buckets[slot] = next;
        }
        let d = pool.get_mut(id);
        d.hash_prev = BufferId::NONE;
        d.hash_next = BufferId::NONE;
    }

    /// Check chain placement and (device, block) uniqueness.
    /// Returns the number of hashed descriptors.
    pub fn verify(&self, pool: &BufferPool) -> Result<usize, &'static str> {
        let mut seen = std::collections::HashSet::new();
        let mut nodes = 0usize;
        for (slot, &head) in self.buckets.iter().enumerate() {
            let mut cur = head;
            let mut prev = BufferId::NONE;
            while cur.is_some() {
                let d = pool.get(cur);
                if d.hash_prev != prev {
                    return Err("hash chain back-link mismatch");
                }
                if d.device.is_none() || self.bucket(d.device, d.block) != slot {
                    return Err("descriptor hashed into the wrong bucket");
                }
                if !seen.insert((d.device, d.block)) {
                    return Err("two descriptors cache the same block");
                }
                nodes += 1;
                if nodes > pool.len() {
                    return Err("hash chains hold more nodes than the pool");
                }
                prev = cur;
                cur = d.hash_next;
            }
        }
        Ok(nodes)
    }
}

//! Buffer-address index for large-object caches.
//!
//! Large-layout slabs keep their metadata off the page, so a freed buffer
//! address alone does not name its bufctl. Each large cache carries one of
//! these fixed-bucket chained hashes mapping buffer address to bufctl. The
//! table record and its nodes live in the internal hash and hash-node
//! caches, so the index is itself slab-allocated.

use core::ptr::{self, NonNull};

use log::trace;

use crate::{AllocFlags, AllocationError, Bufctl, CacheHeap, PageProvider, Rawlink};

const NUM_BUCKETS: usize = 32;

/// Chained hash from buffer address to bufctl, with a fixed power-of-two
/// bucket count.
#[repr(C)]
pub(crate) struct BufHash {
    buckets: [Rawlink<HashNode>; NUM_BUCKETS],
}

/// One chained entry.
#[repr(C)]
pub(crate) struct HashNode {
    /// Address of the buffer, the key.
    bufaddr: *mut u8,
    /// The bufctl controlling that buffer.
    value: Rawlink<Bufctl>,
    next: Rawlink<HashNode>,
}

/// Buffer addresses are multiples of the object size, so the low bits of
/// the key carry no information; fold upper bits down before taking the
/// bucket.
#[inline]
fn bucket_index(bufaddr: *mut u8) -> usize {
    let addr = bufaddr as usize;
    ((addr >> 3) ^ (addr >> 13)) % NUM_BUCKETS
}

impl<P: PageProvider> CacheHeap<P> {
    /// Allocates an empty table from the hash cache.
    pub(crate) unsafe fn hash_create(
        &mut self,
        flags: AllocFlags,
    ) -> Result<*mut BufHash, AllocationError> {
        let hash_cache = Self::handle(self.hash_cache);
        let hash = self.alloc(hash_cache, flags)?.cast::<BufHash>().as_ptr();
        hash.write(BufHash {
            buckets: [Rawlink::none(); NUM_BUCKETS],
        });
        trace!("created hash table {:p}", hash);
        Ok(hash)
    }

    /// Frees every node, then the table itself.
    pub(crate) unsafe fn hash_destroy(&mut self, hash: *mut BufHash) {
        let node_cache = Self::handle(self.hash_node_cache);
        for bucket in 0..NUM_BUCKETS {
            let mut node = (*hash).buckets[bucket].as_ptr();
            while !node.is_null() {
                let next = (*node).next.as_ptr();
                self.free(node_cache, NonNull::new_unchecked(node as *mut u8));
                node = next;
            }
        }
        let hash_cache = Self::handle(self.hash_cache);
        self.free(hash_cache, NonNull::new_unchecked(hash as *mut u8));
    }

    /// Records `bufaddr -> ctl`. The key must not already be present.
    pub(crate) unsafe fn hash_insert(
        &mut self,
        hash: *mut BufHash,
        bufaddr: *mut u8,
        ctl: *mut Bufctl,
        flags: AllocFlags,
    ) -> Result<(), AllocationError> {
        let node_cache = Self::handle(self.hash_node_cache);
        let node = self.alloc(node_cache, flags)?.cast::<HashNode>().as_ptr();
        let bucket = bucket_index(bufaddr);
        node.write(HashNode {
            bufaddr,
            value: Rawlink::from_raw(ctl),
            next: (*hash).buckets[bucket],
        });
        (*hash).buckets[bucket] = Rawlink::from_raw(node);
        Ok(())
    }

    /// Looks up the bufctl for `bufaddr`, if one is recorded.
    pub(crate) unsafe fn hash_get(
        &self,
        hash: *mut BufHash,
        bufaddr: *mut u8,
    ) -> Option<NonNull<Bufctl>> {
        let mut node = (*hash).buckets[bucket_index(bufaddr)].as_ptr();
        while !node.is_null() {
            if (*node).bufaddr == bufaddr {
                return NonNull::new((*node).value.as_ptr());
            }
            node = (*node).next.as_ptr();
        }
        None
    }

    /// Total number of recorded entries.
    #[cfg(test)]
    pub(crate) unsafe fn hash_len(&self, hash: *mut BufHash) -> usize {
        let mut entries = 0;
        for bucket in 0..NUM_BUCKETS {
            let mut node = (*hash).buckets[bucket].as_ptr();
            while !node.is_null() {
                entries += 1;
                node = (*node).next.as_ptr();
            }
        }
        entries
    }

    /// Drops the entry for `bufaddr`; a missing key is a no-op.
    pub(crate) unsafe fn hash_remove(&mut self, hash: *mut BufHash, bufaddr: *mut u8) {
        let bucket = bucket_index(bufaddr);
        let mut prev: *mut HashNode = ptr::null_mut();
        let mut node = (*hash).buckets[bucket].as_ptr();
        while !node.is_null() {
            if (*node).bufaddr == bufaddr {
                let next = (*node).next;
                if prev.is_null() {
                    (*hash).buckets[bucket] = next;
                } else {
                    (*prev).next = next;
                }
                let node_cache = Self::handle(self.hash_node_cache);
                self.free(node_cache, NonNull::new_unchecked(node as *mut u8));
                return;
            }
            prev = node;
            node = (*node).next.as_ptr();
        }
    }
}

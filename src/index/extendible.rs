use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use log::debug;

use crate::concurrency::Transaction;
use crate::error::Result;
use crate::index::bucket::{bucket_array_size, BucketPage};
use crate::index::directory::{DirectoryPage, MAX_DEPTH};
use crate::index::key::{KeyComparator, KeyHasher, Storable};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::PageId;

/// A disk-resident extendible hash table mapping keys to sets of values.
///
/// The table is a directory page plus a dynamically growing and shrinking
/// set of bucket pages, all owned by the buffer pool: every page access goes
/// through fetch/new and is paired with exactly one unpin, marked dirty iff
/// the page bytes were modified. Buckets that overflow are split, doubling
/// the directory when the overflowing bucket already uses every global
/// depth bit; buckets that drain empty are merged back into their split
/// image, halving the directory when no bucket uses the top bit anymore.
///
/// Concurrency is two-level. The table latch serializes structural changes
/// (split, merge) against everything else, while lookups and fast-path
/// inserts only share it. The per-page latch of each bucket page guards the
/// actual byte access, and is never held across a buffer pool call.
pub struct ExtendibleHashIndex<K, V, C, H> {
    buffer_pool: Arc<BufferPoolManager>,
    directory_page_id: PageId,
    comparator: C,
    hasher: H,
    table_latch: RwLock<()>,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, C, H> ExtendibleHashIndex<K, V, C, H>
where
    K: Storable,
    V: Storable,
    C: KeyComparator<K>,
    H: KeyHasher<K>,
{
    /// Create an empty hash table: a directory at global depth 0 whose only
    /// slot points at a fresh bucket with local depth 0. The directory page
    /// id is the handle a catalog would persist to find the table again.
    pub fn new(buffer_pool: Arc<BufferPoolManager>, comparator: C, hasher: H) -> Result<Self> {
        let dir_page = buffer_pool.new_page()?;
        let directory_page_id = dir_page.read()?.id;

        let bucket_page = match buffer_pool.new_page() {
            Ok(page) => page,
            Err(err) => {
                buffer_pool.unpin_page(directory_page_id, false);
                return Err(err);
            }
        };
        let bucket_page_id = bucket_page.read()?.id;

        {
            let mut guard = dir_page.write()?;
            let mut dir = DirectoryPage::new(guard.data.as_mut_slice());
            dir.set_page_id(directory_page_id);
            dir.set_bucket_page_id(0, bucket_page_id);
            dir.set_local_depth(0, 0);
        }
        buffer_pool.unpin_page(bucket_page_id, true);
        buffer_pool.unpin_page(directory_page_id, true);

        Ok(ExtendibleHashIndex {
            buffer_pool,
            directory_page_id,
            comparator,
            hasher,
            table_latch: RwLock::new(()),
            _marker: PhantomData,
        })
    }

    /// Page id of the directory page, the table's persistent anchor.
    pub fn directory_page_id(&self) -> PageId {
        self.directory_page_id
    }

    /// Collect every value stored under the key.
    pub fn get_value(&self, _txn: &Transaction, key: &K) -> Result<Vec<V>> {
        let _table = self.table_latch.read()?;

        let dir_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
        let bucket_page_id = {
            let guard = dir_page.read()?;
            let dir = DirectoryPage::new(guard.data.as_slice());
            let slot = (self.hasher.hash(key) & dir.global_depth_mask()) as usize;
            dir.bucket_page_id(slot)
        };

        let bucket_page = match self.buffer_pool.fetch_page(bucket_page_id) {
            Ok(page) => page,
            Err(err) => {
                self.buffer_pool.unpin_page(self.directory_page_id, false);
                return Err(err);
            }
        };
        let values = {
            let guard = bucket_page.read()?;
            let bucket = BucketPage::<_, K, V>::new(guard.data.as_slice());
            bucket.get_value(key, &self.comparator)
        };
        self.buffer_pool.unpin_page(bucket_page_id, false);
        self.buffer_pool.unpin_page(self.directory_page_id, false);
        Ok(values)
    }

    /// Insert the pair. Returns false when an equal (key, value) pair is
    /// already present; a full bucket triggers a split instead of failing.
    pub fn insert(&self, txn: &Transaction, key: &K, value: &V) -> Result<bool> {
        let inserted = {
            let _table = self.table_latch.read()?;

            let dir_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
            let bucket_page_id = {
                let guard = dir_page.read()?;
                let dir = DirectoryPage::new(guard.data.as_slice());
                let slot = (self.hasher.hash(key) & dir.global_depth_mask()) as usize;
                dir.bucket_page_id(slot)
            };

            let bucket_page = match self.buffer_pool.fetch_page(bucket_page_id) {
                Ok(page) => page,
                Err(err) => {
                    self.buffer_pool.unpin_page(self.directory_page_id, false);
                    return Err(err);
                }
            };
            let inserted = {
                let mut guard = bucket_page.write()?;
                let mut bucket = BucketPage::<_, K, V>::new(guard.data.as_mut_slice());
                bucket.insert(key, value, &self.comparator)
            };
            self.buffer_pool.unpin_page(self.directory_page_id, false);
            self.buffer_pool.unpin_page(bucket_page_id, inserted);
            inserted
        };
        if inserted {
            return Ok(true);
        }
        // the bucket refused the pair: either a duplicate, or a full bucket
        // that needs splitting. Settle it under the exclusive latch.
        self.split_insert(txn, key, value)
    }

    /// Split buckets until the pending pair fits, growing the directory as
    /// needed. Runs as a loop: each round re-acquires the exclusive latch,
    /// so semantics match a tail-recursive retry without unbounded stack.
    fn split_insert(&self, _txn: &Transaction, key: &K, value: &V) -> Result<bool> {
        loop {
            let _table = self.table_latch.write()?;

            let dir_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
            // the target may have changed while the exclusive latch was
            // awaited: re-route before doing anything irreversible.
            let (slot, old_bucket_page_id) = {
                let guard = dir_page.read()?;
                let dir = DirectoryPage::new(guard.data.as_slice());
                let slot = (self.hasher.hash(key) & dir.global_depth_mask()) as usize;
                (slot, dir.bucket_page_id(slot))
            };

            let old_bucket_page = match self.buffer_pool.fetch_page(old_bucket_page_id) {
                Ok(page) => page,
                Err(err) => {
                    self.buffer_pool.unpin_page(self.directory_page_id, false);
                    return Err(err);
                }
            };

            // re-check: a concurrent writer may have inserted the same pair
            // or drained a slot since the fast path failed.
            let (duplicate, inserted) = {
                let mut guard = old_bucket_page.write()?;
                let mut bucket = BucketPage::<_, K, V>::new(guard.data.as_mut_slice());
                let mut duplicate = false;
                for i in 0..bucket_array_size::<K, V>() {
                    if bucket.is_readable(i)
                        && self.comparator.compare(&bucket.key_at(i), key) == Ordering::Equal
                        && bucket.value_at(i) == *value
                    {
                        duplicate = true;
                        break;
                    }
                }
                if duplicate {
                    (true, false)
                } else {
                    (false, bucket.insert(key, value, &self.comparator))
                }
            };
            if duplicate || inserted {
                self.buffer_pool.unpin_page(old_bucket_page_id, inserted);
                self.buffer_pool.unpin_page(self.directory_page_id, false);
                return Ok(inserted);
            }

            // the bucket is genuinely full. Grow the directory first when
            // the bucket already uses every global depth bit.
            let mut dir_dirty = false;
            let local_depth = {
                let guard = dir_page.read()?;
                let dir = DirectoryPage::new(guard.data.as_slice());
                dir.local_depth(slot)
            };
            {
                let mut guard = dir_page.write()?;
                let mut dir = DirectoryPage::new(guard.data.as_mut_slice());
                if local_depth == dir.global_depth() {
                    assert!(
                        dir.global_depth() < MAX_DEPTH,
                        "cannot split bucket page {}: directory is at max depth {}",
                        old_bucket_page_id,
                        MAX_DEPTH
                    );
                    let size = dir.size();
                    for i in 0..size {
                        dir.set_bucket_page_id(i | size, dir.bucket_page_id(i));
                        dir.set_local_depth(i | size, dir.local_depth(i));
                    }
                    dir.incr_global_depth();
                    dir_dirty = true;
                    debug!("hash index directory grew to global depth {}", dir.global_depth());
                }
            }

            let new_bucket_page = match self.buffer_pool.new_page() {
                Ok(page) => page,
                Err(err) => {
                    self.buffer_pool.unpin_page(old_bucket_page_id, false);
                    self.buffer_pool.unpin_page(self.directory_page_id, dir_dirty);
                    return Err(err);
                }
            };
            let new_bucket_page_id = new_bucket_page.read()?.id;

            // move every entry whose next hash bit selects the sibling
            let mask = (1u32 << (local_depth + 1)) - 1;
            let sibling_low = ((slot as u32) ^ (1 << local_depth)) & mask;
            let mut moved = false;
            {
                let mut old_guard = old_bucket_page.write()?;
                let mut new_guard = new_bucket_page.write()?;
                let mut old_bucket = BucketPage::<_, K, V>::new(old_guard.data.as_mut_slice());
                let mut new_bucket = BucketPage::<_, K, V>::new(new_guard.data.as_mut_slice());
                for i in 0..bucket_array_size::<K, V>() {
                    if !old_bucket.is_readable(i) {
                        continue;
                    }
                    let entry_key = old_bucket.key_at(i);
                    if self.hasher.hash(&entry_key) & mask == sibling_low {
                        let entry_value = old_bucket.value_at(i);
                        new_bucket.insert(&entry_key, &entry_value, &self.comparator);
                        old_bucket.remove_at(i);
                        moved = true;
                    }
                }
            }

            // fan out the directory pointers: several slots may alias the
            // old bucket, and each gets the deeper depth plus whichever of
            // the two pages its own low bits select.
            {
                let mut guard = dir_page.write()?;
                let mut dir = DirectoryPage::new(guard.data.as_mut_slice());
                for i in 0..dir.size() {
                    if dir.bucket_page_id(i) != old_bucket_page_id {
                        continue;
                    }
                    dir.set_local_depth(i, local_depth + 1);
                    if (i as u32) & mask == sibling_low {
                        dir.set_bucket_page_id(i, new_bucket_page_id);
                    }
                }
            }
            debug!(
                "split bucket page {} into {} at local depth {}",
                old_bucket_page_id,
                new_bucket_page_id,
                local_depth + 1
            );

            // route the pending pair to whichever half owns it now. It can
            // still fail when every entry hashed into one half; the next
            // round splits deeper.
            let target_is_new = {
                let guard = dir_page.read()?;
                let dir = DirectoryPage::new(guard.data.as_slice());
                let target = (self.hasher.hash(key) & dir.global_depth_mask()) as usize;
                dir.bucket_page_id(target) == new_bucket_page_id
            };
            let inserted = {
                let page = if target_is_new { &new_bucket_page } else { &old_bucket_page };
                let mut guard = page.write()?;
                let mut bucket = BucketPage::<_, K, V>::new(guard.data.as_mut_slice());
                bucket.insert(key, value, &self.comparator)
            };

            self.buffer_pool.unpin_page(old_bucket_page_id, moved || (inserted && !target_is_new));
            self.buffer_pool.unpin_page(new_bucket_page_id, moved || (inserted && target_is_new));
            self.buffer_pool.unpin_page(self.directory_page_id, true);

            if inserted {
                return Ok(true);
            }
        }
    }

    /// Remove the pair. Returns whether it was present; a removal that
    /// drains a bucket empty triggers a merge attempt.
    pub fn remove(&self, txn: &Transaction, key: &K, value: &V) -> Result<bool> {
        let removed = {
            let _table = self.table_latch.write()?;

            let dir_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
            let bucket_page_id = {
                let guard = dir_page.read()?;
                let dir = DirectoryPage::new(guard.data.as_slice());
                let slot = (self.hasher.hash(key) & dir.global_depth_mask()) as usize;
                dir.bucket_page_id(slot)
            };

            let bucket_page = match self.buffer_pool.fetch_page(bucket_page_id) {
                Ok(page) => page,
                Err(err) => {
                    self.buffer_pool.unpin_page(self.directory_page_id, false);
                    return Err(err);
                }
            };
            let removed = {
                let mut guard = bucket_page.write()?;
                let mut bucket = BucketPage::<_, K, V>::new(guard.data.as_mut_slice());
                bucket.remove(key, value, &self.comparator)
            };
            self.buffer_pool.unpin_page(self.directory_page_id, false);
            self.buffer_pool.unpin_page(bucket_page_id, removed);
            removed
        };
        if removed {
            self.merge(txn, key)?;
        }
        Ok(removed)
    }

    /// Fold empty buckets into their split images, shrinking the directory
    /// whenever no bucket uses the top global depth bit anymore. Loops so a
    /// merge that shrinks the directory can cascade into further merges
    /// along the key's routing path.
    fn merge(&self, _txn: &Transaction, key: &K) -> Result<()> {
        let _table = self.table_latch.write()?;

        let dir_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
        let hash = self.hasher.hash(key);
        let mut dir_dirty = false;
        loop {
            let (slot, bucket_page_id, local_depth) = {
                let guard = dir_page.read()?;
                let dir = DirectoryPage::new(guard.data.as_slice());
                let slot = (hash & dir.global_depth_mask()) as usize;
                (slot, dir.bucket_page_id(slot), dir.local_depth(slot))
            };
            if local_depth == 0 {
                break;
            }

            let bucket_page = match self.buffer_pool.fetch_page(bucket_page_id) {
                Ok(page) => page,
                Err(err) => {
                    self.buffer_pool.unpin_page(self.directory_page_id, dir_dirty);
                    return Err(err);
                }
            };
            let empty = {
                let guard = bucket_page.read()?;
                let bucket = BucketPage::<_, K, V>::new(guard.data.as_slice());
                bucket.is_empty()
            };
            self.buffer_pool.unpin_page(bucket_page_id, false);
            if !empty {
                break;
            }

            // only merge into a split image at the same depth
            let (partner_page_id, mergeable) = {
                let guard = dir_page.read()?;
                let dir = DirectoryPage::new(guard.data.as_slice());
                let partner = dir.split_image_index(slot);
                let partner_page_id = dir.bucket_page_id(partner);
                let mergeable = dir.local_depth(partner) == local_depth
                    && partner_page_id != bucket_page_id;
                (partner_page_id, mergeable)
            };
            if !mergeable {
                break;
            }

            {
                let mut guard = dir_page.write()?;
                let mut dir = DirectoryPage::new(guard.data.as_mut_slice());
                for i in 0..dir.size() {
                    let page_id = dir.bucket_page_id(i);
                    if page_id == bucket_page_id || page_id == partner_page_id {
                        dir.set_bucket_page_id(i, partner_page_id);
                        dir.decr_local_depth(i);
                    }
                }
                if dir.can_shrink() {
                    dir.decr_global_depth();
                    debug!("hash index directory shrank to global depth {}", dir.global_depth());
                }
            }
            dir_dirty = true;
            if let Err(err) = self.buffer_pool.delete_page(bucket_page_id) {
                self.buffer_pool.unpin_page(self.directory_page_id, dir_dirty);
                return Err(err);
            }
            debug!("merged empty bucket page {} into {}", bucket_page_id, partner_page_id);
        }
        self.buffer_pool.unpin_page(self.directory_page_id, dir_dirty);
        Ok(())
    }

    /// Current global depth of the directory.
    pub fn global_depth(&self) -> Result<u32> {
        let _table = self.table_latch.read()?;
        let dir_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
        let depth = {
            let guard = dir_page.read()?;
            DirectoryPage::new(guard.data.as_slice()).global_depth()
        };
        self.buffer_pool.unpin_page(self.directory_page_id, false);
        Ok(depth)
    }

    /// Check the directory invariants, failing with a description of the
    /// first violation found.
    pub fn verify_integrity(&self) -> Result<()> {
        let _table = self.table_latch.read()?;
        let dir_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
        let result = {
            let guard = dir_page.read()?;
            DirectoryPage::new(guard.data.as_slice()).verify_integrity()
        };
        self.buffer_pool.unpin_page(self.directory_page_id, false);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::key::{IdentityHasher, MurmurHasher, OrdComparator, Rid};
    use crate::storage::memory::Memory;

    type TestIndex<H> = ExtendibleHashIndex<i32, Rid, OrdComparator, H>;

    fn new_index<H: KeyHasher<i32>>(pool_size: usize, hasher: H) -> Result<TestIndex<H>> {
        let bpm = Arc::new(BufferPoolManager::new(Box::new(Memory::new()), pool_size));
        ExtendibleHashIndex::new(bpm, OrdComparator, hasher)
    }

    // capacity of an (i32, Rid) bucket page
    const CAP: i32 = bucket_array_size::<i32, Rid>() as i32;

    #[test]
    fn test_new_index_is_empty() -> Result<()> {
        let txn = Transaction::default();
        let index = new_index(8, MurmurHasher::default())?;
        assert_eq!(0, index.global_depth()?);
        index.verify_integrity()?;
        assert!(index.get_value(&txn, &1)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_insert_get_remove() -> Result<()> {
        let txn = Transaction::default();
        let index = new_index(16, MurmurHasher::default())?;

        for i in 0..1000 {
            assert!(index.insert(&txn, &i, &Rid::new(i, 0))?);
        }
        index.verify_integrity()?;
        for i in 0..1000 {
            assert_eq!(vec![Rid::new(i, 0)], index.get_value(&txn, &i)?);
        }
        assert!(index.get_value(&txn, &1000)?.is_empty());

        // remove the even keys, the odd ones must survive
        for i in (0..1000).step_by(2) {
            assert!(index.remove(&txn, &i, &Rid::new(i, 0))?);
        }
        index.verify_integrity()?;
        for i in 0..1000 {
            let want = if i % 2 == 0 { vec![] } else { vec![Rid::new(i, 0)] };
            assert_eq!(want, index.get_value(&txn, &i)?);
        }
        // removing an absent pair fails without side effects
        assert!(!index.remove(&txn, &0, &Rid::new(0, 0))?);
        Ok(())
    }

    #[test]
    fn test_duplicate_pair_is_refused() -> Result<()> {
        let txn = Transaction::default();
        let index = new_index(8, MurmurHasher::default())?;

        assert!(index.insert(&txn, &42, &Rid::new(1, 1))?);
        assert!(!index.insert(&txn, &42, &Rid::new(1, 1))?);
        assert_eq!(vec![Rid::new(1, 1)], index.get_value(&txn, &42)?);

        // same key, different value is a separate entry
        assert!(index.insert(&txn, &42, &Rid::new(1, 2))?);
        assert_eq!(2, index.get_value(&txn, &42)?.len());
        Ok(())
    }

    #[test]
    fn test_first_split_grows_directory() -> Result<()> {
        let txn = Transaction::default();
        let index = new_index(8, IdentityHasher)?;

        // at depth 0 every key routes to the single bucket; one key past
        // capacity forces the first split
        for i in 0..CAP {
            assert!(index.insert(&txn, &i, &Rid::new(i, 0))?);
        }
        assert_eq!(0, index.global_depth()?);

        assert!(index.insert(&txn, &CAP, &Rid::new(CAP, 0))?);
        assert_eq!(1, index.global_depth()?);
        index.verify_integrity()?;

        for i in 0..=CAP {
            assert_eq!(vec![Rid::new(i, 0)], index.get_value(&txn, &i)?);
        }
        Ok(())
    }

    #[test]
    fn test_skewed_keys_split_until_they_separate() -> Result<()> {
        let txn = Transaction::default();
        let index = new_index(16, IdentityHasher)?;

        // all keys are even: the first split moves nothing and must cascade
        // to depth 2 before the halves separate
        for i in 0..=CAP {
            assert!(index.insert(&txn, &(4 * i), &Rid::new(i, 0))?);
        }
        assert!(index.global_depth()? >= 2);
        index.verify_integrity()?;
        for i in 0..=CAP {
            assert_eq!(vec![Rid::new(i, 0)], index.get_value(&txn, &(4 * i))?);
        }
        Ok(())
    }

    #[test]
    fn test_merge_and_shrink() -> Result<()> {
        let txn = Transaction::default();
        let index = new_index(16, IdentityHasher)?;

        // sequential keys split the even and odd buckets once each,
        // reaching depth 2 with four live buckets
        let n = 2 * CAP + 33;
        for i in 0..=n {
            assert!(index.insert(&txn, &i, &Rid::new(i, 0))?);
        }
        assert_eq!(2, index.global_depth()?);
        index.verify_integrity()?;

        // drain residue class by residue class; each emptied bucket merges
        // with its split image, and the directory shrinks once no bucket
        // needs the top bit
        let expected_depth = [2, 1, 0, 0];
        for residue in 0..4 {
            for i in (residue..=n).step_by(4) {
                assert!(index.remove(&txn, &i, &Rid::new(i, 0))?);
            }
            index.verify_integrity()?;
            assert_eq!(expected_depth[residue as usize], index.global_depth()?);
        }

        for i in 0..=n {
            assert!(index.get_value(&txn, &i)?.is_empty());
        }
        Ok(())
    }

    #[test]
    fn test_pool_exhaustion_surfaces_as_error() -> Result<()> {
        let txn = Transaction::default();
        // two frames: directory plus one bucket fit, a split cannot
        let index = new_index(2, IdentityHasher)?;
        for i in 0..CAP {
            assert!(index.insert(&txn, &i, &Rid::new(i, 0))?);
        }
        let err = index.insert(&txn, &CAP, &Rid::new(CAP, 0));
        assert_eq!(Err(crate::error::Error::BufferPoolNoAvailableFrame), err.map(|_| ()));
        // lookups still work afterwards: nothing stayed pinned
        assert_eq!(vec![Rid::new(0, 0)], index.get_value(&txn, &0)?);
        Ok(())
    }
}

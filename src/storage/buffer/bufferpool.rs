use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::{Error, Result};
use crate::storage::page::{FrameId, Page, PageId};
use crate::storage::DiskStorage;

use super::replacer::{Replacer, SyncLruReplacer};

/// The buffer pool is responsible for moving physical pages back and forth
/// from main memory to disk. It allows the system to operate on databases
/// that are larger than the amount of memory available.
///
/// The buffer pool's operations are transparent to other parts of the
/// system. For example, the system asks the buffer pool for a page using its
/// unique identifier (page id) and it does not know whether that page is
/// already in memory or whether it has to be retrieved from disk.
///
/// Page ids are allocated with a stride: an instance that is one of
/// `num_instances` hands out only ids where `id % num_instances` equals its
/// own index, so several instances can share one page id space.
struct BufferPool {
    pool_size: usize,
    /// disk engine holding the persisted pages.
    storage: Box<dyn DiskStorage>,
    /// array of buffer pool pages. use the array index as
    /// FrameId, i.e., the FrameId is in range: [0, pool_size).
    pages: Vec<Arc<Page>>,
    /// page table for keeping track of buffer pool pages.
    page_table: HashMap<PageId, FrameId>,
    /// list of free frames that don't have any pages on them.
    free_list: VecDeque<FrameId>,
    /// Replacer to find unpinned pages for replacement.
    replacer: Arc<dyn Replacer>,
    /// The next page id to be allocated by this instance.
    /// TODO: persist this info later.
    next_page_id: PageId,
    num_instances: usize,
    instance_index: usize,
}

impl BufferPool {
    fn new(
        storage: Box<dyn DiskStorage>,
        pool_size: usize,
        num_instances: usize,
        instance_index: usize,
    ) -> Self {
        assert!(num_instances > 0, "buffer pool must belong to at least one instance");
        assert!(
            instance_index < num_instances,
            "instance index {} out of range for {} instances",
            instance_index,
            num_instances
        );
        let mut pages = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        let page_table = HashMap::new();
        let replacer: Arc<dyn Replacer> = Arc::new(SyncLruReplacer::new(pool_size));
        for i in 0..pool_size {
            pages.push(Arc::new(Page::new()));
            // initially, every page is in the free list
            free_list.push_back(i);
        }
        BufferPool {
            pool_size,
            storage,
            pages,
            page_table,
            free_list,
            replacer,
            next_page_id: instance_index as PageId,
            num_instances,
            instance_index,
        }
    }

    /// Create a new page in the buffer pool, return the newly created page or
    /// an error if all frames are currently in use and not evictable (in
    /// another word, pinned).
    ///
    /// Pick the replacement frame from either the free list or the replacer
    /// (always find from the free list first), and then call allocate_page to
    /// get a new page id. If the replacement frame has a dirty page, write it
    /// back to the storage first. reset the memory and metadata for the new
    /// page, and pin the frame so the replacer wouldn't evict it before the
    /// caller unpins it.
    fn new_page(&mut self) -> Result<Arc<Page>> {
        let frame_id = self.pick_replacement()?;

        let page = Arc::clone(&self.pages[frame_id]);
        let mut guard = page.write()?;
        let prev_page_id = guard.id;

        // flush the in-memory page/frame to storage if it is dirty.
        if guard.is_dirty {
            debug!("evicting dirty page {} from frame {}", prev_page_id, frame_id);
            self.storage.write_page(prev_page_id, &guard.data)?;
        }
        // clean page frame first
        guard.reset();
        // allocating new page id
        let new_page_id = self.allocate_page();
        // set the page with new page id
        guard.id = new_page_id;
        // pin the new page with initial value 1
        guard.pin_count = 1;
        // unlink the old page from page table
        self.page_table.remove(&prev_page_id);
        // link the new page with frame into page table
        self.page_table.insert(new_page_id, frame_id);
        self.replacer.pin(frame_id);

        drop(guard);
        Ok(page)
    }

    /// Fetch the requested page with the given page id from the buffer pool.
    /// return no available frame error if the page needs to be fetched from
    /// disk but all frames are currently in use and not evictable (in other
    /// words, pinned).
    ///
    /// First search for page_id in the buffer pool. if not found, pick a
    /// replacement from either the free list or the replacer (always find
    /// from the free list first), read the page from disk with storage and
    /// replace the old page in the frame. similar to new_page, if the old
    /// page is dirty, write it back to the storage first.
    fn fetch_page(&mut self, page_id: PageId) -> Result<Arc<Page>> {
        // check if page table has the page id
        if let Some(&frame_id) = self.page_table.get(&page_id) {
            // we have the page frame in buffer pool already, increase
            // pin count, remove it from the eviction candidates, then
            // return it.
            let page = Arc::clone(&self.pages[frame_id]);
            let mut guard = page.write()?;
            guard.pin_count += 1;
            self.replacer.pin(frame_id);

            drop(guard);
            return Ok(page);
        }

        // page not found, pick a replacement frame
        let frame_id = self.pick_replacement()?;
        let page = Arc::clone(&self.pages[frame_id]);
        let mut guard = page.write()?;
        let prev_page_id = guard.id;

        // flush the in-memory page/frame to storage if it is dirty.
        if guard.is_dirty {
            debug!("evicting dirty page {} from frame {}", prev_page_id, frame_id);
            self.storage.write_page(prev_page_id, &guard.data)?;
        }

        // clean page frame first, then fill it from disk
        guard.reset();
        self.storage.read_page(page_id, guard.data.as_mut_slice())?;
        guard.id = page_id;
        guard.pin_count = 1;
        // unlink the old page from page table
        self.page_table.remove(&prev_page_id);
        // link the new page with frame into page table
        self.page_table.insert(page_id, frame_id);
        self.replacer.pin(frame_id);

        drop(guard);
        Ok(page)
    }

    /// Flush the target page to storage if it is dirty. The dirty flag is
    /// deliberately left set, re-flushes are idempotent at the disk layer.
    ///
    /// Return false if the page cannot be found in the page table, true
    /// otherwise.
    fn flush_page(&mut self, page_id: PageId) -> Result<bool> {
        let frame_id = match self.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(false),
        };
        let page = Arc::clone(&self.pages[frame_id]);
        let guard = page.read()?;
        if guard.is_dirty {
            self.storage.write_page(guard.id, &guard.data)?;
        }
        Ok(true)
    }

    /// Flush every mapped, dirty page in the buffer pool to storage.
    fn flush_all_pages(&mut self) -> Result<()> {
        for (_, &frame_id) in self.page_table.iter() {
            let page = &self.pages[frame_id];
            let guard = page.read()?;
            if guard.is_dirty {
                self.storage.write_page(guard.id, &guard.data)?;
            }
        }
        Ok(())
    }

    /// Delete a page from the buffer pool. if the page is not in the buffer
    /// pool, do nothing and return true. if the page is pinned and cannot be
    /// deleted, return false immediately.
    ///
    /// After deleting the page from the page table, stop tracking the frame
    /// in the replacer and add the frame back to the free list. Also reset
    /// the page frame's memory and metadata. Disk-side deallocation is left
    /// to a vacuum process.
    fn delete_page(&mut self, page_id: PageId) -> Result<bool> {
        let frame_id = match self.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(true),
        };
        let page = Arc::clone(&self.pages[frame_id]);
        // acquire the write lock up front, RwLock has no way to upgrade a
        // read lock to a write lock.
        let mut guard = page.write()?;
        if guard.pin_count > 0 {
            return Ok(false);
        }
        if guard.is_dirty {
            self.storage.write_page(guard.id, &guard.data)?;
        }
        // clean page frame first
        guard.reset();
        // remove from replacer candidates
        self.replacer.pin(frame_id);
        // unlink the page from page table
        self.page_table.remove(&page_id);
        // add back to free list
        self.free_list.push_back(frame_id);

        Ok(true)
    }

    /// Unpin the target page from the buffer pool, setting the dirty flag on
    /// the page if the caller modified it. If page_id is not in the buffer
    /// pool, return false.
    ///
    /// Decrement the pin count of the page. If the pin count reaches 0, the
    /// frame becomes evictable by the replacer. Unpinning a page whose pin
    /// count is already 0 violates the pin protocol and panics.
    fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let frame_id = match self.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return false,
        };
        let page = &self.pages[frame_id];
        let mut guard = page.write().unwrap();
        guard.is_dirty |= is_dirty;
        assert!(guard.pin_count > 0, "unpinning page {} with zero pin count", page_id);
        guard.pin_count -= 1;
        if guard.pin_count == 0 {
            self.replacer.unpin(frame_id);
        }
        true
    }

    /// Pick the frame to hold a new or fetched page: the free list first,
    /// then a victim from the replacer.
    fn pick_replacement(&mut self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_list.pop_front() {
            return Ok(frame_id);
        }
        match self.replacer.victim() {
            Some(frame_id) => Ok(frame_id),
            None => Err(Error::BufferPoolNoAvailableFrame),
        }
    }

    fn allocate_page(&mut self) -> PageId {
        let page_id = self.next_page_id;
        self.next_page_id += self.num_instances as PageId;
        debug_assert_eq!(page_id as usize % self.num_instances, self.instance_index);
        page_id
    }
}

/// Buffer pool manager wraps a buffer pool with a mutex for concurrent
/// access, basically all the heavy lifting happens in the buffer pool.
///
/// The latch is released before any returned page is handed to the caller;
/// the pin taken by new_page/fetch_page is what keeps the frame from being
/// evicted while the caller reads or writes page bytes.
pub struct BufferPoolManager {
    inner: Mutex<BufferPool>,
    pool_size: usize,
}

impl BufferPoolManager {
    /// A stand-alone pool owning the whole page id space.
    pub fn new(storage: Box<dyn DiskStorage>, pool_size: usize) -> Self {
        Self::with_instances(storage, pool_size, 1, 0)
    }

    /// A pool that is instance `instance_index` out of `num_instances`
    /// sharing one page id space, allocating ids with a stride.
    pub fn with_instances(
        storage: Box<dyn DiskStorage>,
        pool_size: usize,
        num_instances: usize,
        instance_index: usize,
    ) -> Self {
        let inner = BufferPool::new(storage, pool_size, num_instances, instance_index);
        BufferPoolManager { inner: Mutex::new(inner), pool_size }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Create a new pinned page in the buffer pool.
    pub fn new_page(&self) -> Result<Arc<Page>> {
        let mut inner = self.inner.lock()?;
        inner.new_page()
    }

    /// Fetch the requested page with the given page id from the buffer pool,
    /// pinning it.
    pub fn fetch_page(&self, page_id: PageId) -> Result<Arc<Page>> {
        let mut inner = self.inner.lock()?;
        inner.fetch_page(page_id)
    }

    /// Flush the target page to storage if it is dirty. Returns whether the
    /// page was present in the pool.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let mut inner = self.inner.lock()?;
        inner.flush_page(page_id)
    }

    /// Flush every mapped, dirty page in the buffer pool to storage.
    pub fn flush_all_pages(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.flush_all_pages()
    }

    /// Delete a page from the buffer pool. if the page is not in the buffer
    /// pool, do nothing and return true. if the page is pinned and cannot be
    /// deleted, return false immediately.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut inner = self.inner.lock()?;
        inner.delete_page(page_id)
    }

    /// Unpin the target page from the buffer pool, recording whether the
    /// caller dirtied it. Returns false if the page is not in the pool.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.unpin_page(page_id, is_dirty)
    }
}

/// A façade over several buffer pool instances sharing one page id space.
///
/// Each page id is owned by the instance at `page_id % num_instances`, which
/// matches the id stride used by BufferPool::allocate_page, so routing is a
/// pure function of the page id. new_page requests are spread round-robin
/// over the instances, starting from a different instance each call.
pub struct ParallelBufferPoolManager {
    pools: Vec<BufferPoolManager>,
    next_instance: AtomicUsize,
}

impl ParallelBufferPoolManager {
    /// Build one pool instance per supplied disk engine handle. The handles
    /// are expected to refer to the same underlying disk.
    pub fn new(storages: Vec<Box<dyn DiskStorage>>, pool_size: usize) -> Result<Self> {
        if storages.is_empty() {
            return Err(Error::value("parallel buffer pool needs at least one instance"));
        }
        let num_instances = storages.len();
        let pools = storages
            .into_iter()
            .enumerate()
            .map(|(i, storage)| {
                BufferPoolManager::with_instances(storage, pool_size, num_instances, i)
            })
            .collect();
        Ok(ParallelBufferPoolManager { pools, next_instance: AtomicUsize::new(0) })
    }

    /// Total number of frames across all instances.
    pub fn pool_size(&self) -> usize {
        self.pools.iter().map(|p| p.pool_size()).sum()
    }

    fn pool_for(&self, page_id: PageId) -> &BufferPoolManager {
        &self.pools[page_id as usize % self.pools.len()]
    }

    /// Create a new pinned page in one of the instances, trying each
    /// instance at most once starting from a rotating index.
    pub fn new_page(&self) -> Result<Arc<Page>> {
        let start = self.next_instance.fetch_add(1, Ordering::Relaxed);
        for i in 0..self.pools.len() {
            let pool = &self.pools[(start + i) % self.pools.len()];
            match pool.new_page() {
                Ok(page) => return Ok(page),
                Err(Error::BufferPoolNoAvailableFrame) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::BufferPoolNoAvailableFrame)
    }

    pub fn fetch_page(&self, page_id: PageId) -> Result<Arc<Page>> {
        self.pool_for(page_id).fetch_page(page_id)
    }

    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        self.pool_for(page_id).flush_page(page_id)
    }

    pub fn flush_all_pages(&self) -> Result<()> {
        for pool in &self.pools {
            pool.flush_all_pages()?;
        }
        Ok(())
    }

    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        self.pool_for(page_id).delete_page(page_id)
    }

    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.pool_for(page_id).unpin_page(page_id, is_dirty)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::storage::memory::Memory;
    use crate::storage::page::{INVALID_PAGE_ID, PAGE_SIZE};

    use super::*;

    #[test]
    fn test_buffer_pool_basic() -> Result<()> {
        let pool_size = 10;
        let bpm = BufferPoolManager::new(Box::new(Memory::new()), pool_size);

        // Scenario: The buffer pool is empty, we should be able to create a
        // new page.
        let page0 = bpm.new_page()?;
        let page0_id = page0.read()?.id;
        assert_eq!(0, page0_id);

        // Scenario: Once we have a page, we should be able to read and write
        // its content.
        let mut guard = page0.write()?;
        guard.data[..5].copy_from_slice(b"hello");
        drop(guard);
        let guard = page0.read()?;
        assert_eq!(b"hello", &guard.data[..5]);
        drop(guard);

        // Scenario: we should be able to create pages until we fill up the
        // buffer pool.
        for _ in 1..pool_size {
            assert!(bpm.new_page().is_ok());
        }
        // Scenario: Once the buffer pool is full, we should not be able to
        // create any new page.
        for _ in pool_size..pool_size * 2 {
            assert_eq!(Err(Error::BufferPoolNoAvailableFrame), bpm.new_page().map(|_| ()));
        }
        // Scenario: After unpinning pages {0, 1, 2, 3, 4} and pinning
        // another 4 new pages, there would still be one buffer page left for
        // reading page 0.
        for i in 0..5 {
            assert!(bpm.unpin_page(i, true));
        }
        for _ in 0..4 {
            assert!(bpm.new_page().is_ok());
        }
        // Scenario: we should be able to fetch the data we wrote a while ago.
        let page0 = bpm.fetch_page(0)?;
        let guard = page0.read()?;
        assert_eq!(b"hello", &guard.data[..5]);
        drop(guard);
        // Scenario: if we unpin page 0 and then make a new page, all the
        // buffer pages should now be pinned. Fetching page 0 should fail.
        assert!(bpm.unpin_page(0, true));
        assert!(bpm.new_page().is_ok());
        assert_eq!(Err(Error::BufferPoolNoAvailableFrame), bpm.fetch_page(0).map(|_| ()));

        Ok(())
    }

    #[test]
    fn test_flush_writes_through_without_clearing_dirty() -> Result<()> {
        let disk = Memory::new();
        let observer = disk.clone();
        let bpm = BufferPoolManager::new(Box::new(disk), 4);

        let page = bpm.new_page()?;
        let page_id = {
            let mut guard = page.write()?;
            guard.data[..3].copy_from_slice(b"abc");
            guard.id
        };
        assert!(bpm.unpin_page(page_id, true));
        assert!(bpm.flush_page(page_id)?);

        // the disk now holds the written bytes
        let mut buf = vec![0; PAGE_SIZE];
        observer.read_page(page_id, &mut buf)?;
        assert_eq!(b"abc", &buf[..3]);

        // the dirty flag survives the flush
        assert!(page.read()?.is_dirty);

        // flushing an unknown page reports not mapped
        assert!(!bpm.flush_page(999)?);
        Ok(())
    }

    #[test]
    fn test_eviction_follows_lru_order() -> Result<()> {
        let disk = Memory::new();
        let bpm = BufferPoolManager::new(Box::new(disk), 3);

        // create p1, p2, p3 and unpin them in that order
        let mut ids = vec![];
        for _ in 0..3 {
            let page = bpm.new_page()?;
            let id = page.read()?.id;
            ids.push(id);
        }
        for &id in &ids {
            assert!(bpm.unpin_page(id, false));
        }

        // two more pages evict p1 then p2
        bpm.new_page()?;
        bpm.new_page()?;

        // p3 must still be resident: fetching it cannot require eviction,
        // and both remaining frames are pinned.
        let p3 = bpm.fetch_page(ids[2])?;
        assert_eq!(ids[2], p3.read()?.id);
        Ok(())
    }

    #[test]
    fn test_page_survives_eviction() -> Result<()> {
        let bpm = BufferPoolManager::new(Box::new(Memory::new()), 2);

        let page = bpm.new_page()?;
        let page_id = {
            let mut guard = page.write()?;
            guard.data[100] = 0x5a;
            guard.id
        };
        drop(page);
        assert!(bpm.unpin_page(page_id, true));

        // force the page out by churning through the pool
        for _ in 0..4 {
            let p = bpm.new_page()?;
            let id = p.read()?.id;
            assert!(bpm.unpin_page(id, false));
        }

        // the evicted page reads back with the written content
        let page = bpm.fetch_page(page_id)?;
        assert_eq!(0x5a, page.read()?.data[100]);
        Ok(())
    }

    #[test]
    fn test_delete_page() -> Result<()> {
        let bpm = BufferPoolManager::new(Box::new(Memory::new()), 4);

        // deleting a page that is not resident succeeds trivially
        assert!(bpm.delete_page(123)?);

        let page = bpm.new_page()?;
        let page_id = page.read()?.id;

        // pinned pages cannot be deleted
        assert!(!bpm.delete_page(page_id)?);

        assert!(bpm.unpin_page(page_id, false));
        assert!(bpm.delete_page(page_id)?);

        // the frame is reusable: the pool accepts a full set of new pages
        for _ in 0..4 {
            assert!(bpm.new_page().is_ok());
        }
        Ok(())
    }

    #[test]
    fn test_stride_page_allocation() -> Result<()> {
        let disk = Memory::new();
        let bpm = BufferPoolManager::with_instances(Box::new(disk), 4, 3, 1);
        for _ in 0..4 {
            let page = bpm.new_page()?;
            let id = page.read()?.id;
            assert_eq!(1, id % 3);
            assert!(bpm.unpin_page(id, false));
        }
        Ok(())
    }

    #[test]
    fn test_parallel_buffer_pool() -> Result<()> {
        let disk = Memory::new();
        let storages: Vec<Box<dyn DiskStorage>> =
            (0..3).map(|_| Box::new(disk.clone()) as Box<dyn DiskStorage>).collect();
        let pbpm = ParallelBufferPoolManager::new(storages, 2)?;
        assert_eq!(6, pbpm.pool_size());

        // fill every instance, collecting distinct page ids
        let mut ids = HashSet::new();
        for _ in 0..6 {
            let page = pbpm.new_page()?;
            let mut guard = page.write()?;
            let id = guard.id;
            guard.data[..4].copy_from_slice(&id.to_le_bytes());
            drop(guard);
            assert!(ids.insert(id));
        }
        assert_eq!(Err(Error::BufferPoolNoAvailableFrame), pbpm.new_page().map(|_| ()));

        // pages route back to the instance that allocated them
        for &id in &ids {
            assert!(pbpm.unpin_page(id, true));
        }
        for &id in &ids {
            let page = pbpm.fetch_page(id)?;
            assert_eq!(&page.read()?.data[..4], id.to_le_bytes());
            assert!(pbpm.unpin_page(id, false));
        }
        Ok(())
    }

    /// Check the structural invariants of the pool: every frame is either
    /// free, or mapped; mapped frames agree with the page table on their id;
    /// the replacer tracks exactly the mapped frames with zero pins.
    fn check_invariants(pool: &BufferPool) {
        let mapped: HashSet<FrameId> = pool.page_table.values().copied().collect();
        let free: HashSet<FrameId> = pool.free_list.iter().copied().collect();
        assert!(mapped.is_disjoint(&free));
        assert_eq!(pool.pool_size, mapped.len() + free.len());

        let mut evictable = 0;
        for (&page_id, &frame_id) in pool.page_table.iter() {
            let guard = pool.pages[frame_id].read().unwrap();
            assert_eq!(page_id, guard.id);
            assert!(guard.pin_count >= 0);
            if guard.pin_count == 0 {
                evictable += 1;
            }
        }
        for &frame_id in &free {
            let guard = pool.pages[frame_id].read().unwrap();
            assert_eq!(INVALID_PAGE_ID, guard.id);
            assert_eq!(0, guard.pin_count);
        }
        assert_eq!(evictable, pool.replacer.size());
    }

    #[test]
    fn test_random_ops_hold_invariants() -> Result<()> {
        let mut pool = BufferPool::new(Box::new(Memory::new()), 8, 1, 0);
        let mut rng = StdRng::seed_from_u64(0x5eed);
        // page id -> number of pins this test holds
        let mut pins: HashMap<PageId, u32> = HashMap::new();
        let mut known: Vec<PageId> = vec![];

        for _ in 0..2000 {
            match rng.gen_range(0..4) {
                0 => {
                    if let Ok(page) = pool.new_page() {
                        let id = page.read()?.id;
                        known.push(id);
                        *pins.entry(id).or_default() += 1;
                    }
                }
                1 => {
                    if let Some(&id) = known.get(rng.gen_range(0..known.len().max(1))) {
                        if pool.fetch_page(id).is_ok() {
                            *pins.entry(id).or_default() += 1;
                        }
                    }
                }
                2 => {
                    let pinned: Vec<PageId> = pins
                        .iter()
                        .filter(|(_, &count)| count > 0)
                        .map(|(&id, _)| id)
                        .collect();
                    if let Some(&id) = pinned.get(rng.gen_range(0..pinned.len().max(1))) {
                        assert!(pool.unpin_page(id, rng.gen_bool(0.5)));
                        *pins.get_mut(&id).unwrap() -= 1;
                    }
                }
                _ => {
                    if let Some(&id) = known.get(rng.gen_range(0..known.len().max(1))) {
                        if pins.get(&id).copied().unwrap_or(0) == 0 && pool.delete_page(id)? {
                            known.retain(|&k| k != id);
                            pins.remove(&id);
                        }
                    }
                }
            }
            check_invariants(&pool);
        }
        Ok(())
    }
}

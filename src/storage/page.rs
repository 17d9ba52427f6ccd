use std::ops::Deref;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::codec::bincodec;

/// Page ids are assigned by the buffer pool and never reused within a run.
pub type PageId = i32;

/// Frames are slots in the buffer pool's page array, in `[0, pool_size)`.
pub type FrameId = usize;

/// Size of a data page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Sentinel page id for "no page".
pub const INVALID_PAGE_ID: PageId = -1;

/// Key under which a page is stored in the disk engine.
#[derive(Copy, Clone, Serialize, Deserialize)]
pub enum Key {
    PageId(PageId),
}

impl Key {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = bincodec::serialize(self)?;
        Ok(bytes)
    }
}

/// The actual page data that include in-memory metadata like the dirty bit
/// and pin count etc. and the on-disk content bytes.
pub struct PageData {
    pub id: PageId,
    pub data: Vec<u8>,
    pub is_dirty: bool,
    pub pin_count: i32,
}

impl PageData {
    fn new() -> Self {
        Self { id: INVALID_PAGE_ID, data: vec![0; PAGE_SIZE], is_dirty: false, pin_count: 0 }
    }

    /// Reset the frame to its initial state: no page, clean, unpinned,
    /// all content bytes zeroed.
    pub fn reset(&mut self) {
        self.id = INVALID_PAGE_ID;
        self.is_dirty = false;
        self.pin_count = 0;
        self.data.fill(0);
    }
}

/// Page act as the container of the actual page data for providing
/// concurrent access protection. The inner `RwLock` doubles as the per-page
/// latch: readers of page bytes hold the read half, mutators the write half.
pub struct Page {
    inner: RwLock<PageData>,
}

impl Page {
    /// Allocate a page frame in memory with PAGE_SIZE zeroed content bytes
    /// and init the metadata accordingly.
    pub fn new() -> Self {
        Page { inner: RwLock::new(PageData::new()) }
    }
}

impl Default for Page {
    fn default() -> Self {
        Page::new()
    }
}

impl Deref for Page {
    type Target = RwLock<PageData>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

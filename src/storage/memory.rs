use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::storage::page::{Key, PageId};
use crate::storage::DiskStorage;

/// An in-memory disk engine backed by a B-tree map keyed by the encoded
/// page key. Cloning yields a handle onto the same underlying pages, which
/// lets tests observe what the buffer pool flushed.
#[derive(Clone, Debug)]
pub struct Memory {
    pages: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl Memory {
    pub fn new() -> Memory {
        Memory { pages: Arc::new(RwLock::new(BTreeMap::new())) }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Memory::new()
    }
}

impl DiskStorage for Memory {
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        let key = Key::PageId(page_id).encode()?;
        let pages = self.pages.read()?;
        match pages.get(&key) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_page(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        let key = Key::PageId(page_id).encode()?;
        let mut pages = self.pages.write()?;
        pages.insert(key, data.to_vec());
        Ok(())
    }
}

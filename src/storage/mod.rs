use std::fmt::Debug;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::storage::page::PageId;

pub mod buffer;
pub mod codec;
pub mod memory;
pub mod page;

/// A page-addressed disk engine. Pages are fixed-size byte blocks keyed by
/// page id; reads and writes are synchronous and whole-page.
///
/// The trait is designed as `trait object` compatible so the buffer pool can
/// own any engine behind a `Box<dyn DiskStorage>`.
pub trait DiskStorage: Debug + Send + Sync {
    /// Fill `buf` with the content of the given page. A page that has never
    /// been written reads back as all zeroes.
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()>;

    /// Persist the content of the given page, overwriting any previous
    /// version.
    fn write_page(&mut self, page_id: PageId, data: &[u8]) -> Result<()>;
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StorageType {
    Memory,
}

pub fn new_storage(typ: StorageType) -> Result<Box<dyn DiskStorage>> {
    match typ {
        StorageType::Memory => Ok(Box::new(memory::Memory::new())),
    }
}

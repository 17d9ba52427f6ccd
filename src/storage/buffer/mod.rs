pub mod bufferpool;
pub mod replacer;

pub use bufferpool::{BufferPoolManager, ParallelBufferPoolManager};
pub use replacer::{Replacer, SyncLruReplacer};

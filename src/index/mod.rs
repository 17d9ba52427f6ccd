//! Disk-resident extendible hash index.
//!
//! The index lives entirely in pages owned by the buffer pool: one
//! directory page routing hashed keys by their low bits, and one bucket
//! page per bucket holding bit-packed (key, value) slots. See
//! [`extendible::ExtendibleHashIndex`] for the operational contract.

pub mod bucket;
pub mod directory;
pub mod extendible;
pub mod key;

pub use extendible::ExtendibleHashIndex;
pub use key::{
    IdentityHasher, KeyComparator, KeyHasher, MurmurHasher, OrdComparator, Rid, Storable,
};

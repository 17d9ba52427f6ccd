//! Transaction context threaded through index operations.
//!
//! The index does not implement transactional locking yet; operations take a
//! transaction reference so that page-level lock acquisition can be recorded
//! here later without changing the index surface.

/// An opaque transaction handle. Index operations forward it untouched.
#[derive(Debug, Default)]
pub struct Transaction {
    id: u64,
}

impl Transaction {
    pub fn new(id: u64) -> Self {
        Transaction { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

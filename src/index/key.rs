use std::cmp::Ordering;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::storage::page::PageId;

/// A fixed-size value that can live inside an index page.
///
/// The encoding is the on-page representation: it must be stable across
/// runs, and `decode_from` must be the exact inverse of `encode_into` for a
/// buffer of `SIZE` bytes.
pub trait Storable: Copy + Debug + PartialEq + Send + Sync + 'static {
    /// Encoded size in bytes. Page layouts reserve exactly this much per
    /// field.
    const SIZE: usize;

    fn encode_into(&self, buf: &mut [u8]);

    fn decode_from(buf: &[u8]) -> Self;
}

macro_rules! storable_int {
    ($($t:ty),*) => {
        $(impl Storable for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn encode_into(&self, buf: &mut [u8]) {
                buf[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }

            fn decode_from(buf: &[u8]) -> Self {
                let mut bytes = [0u8; Self::SIZE];
                bytes.copy_from_slice(&buf[..Self::SIZE]);
                <$t>::from_le_bytes(bytes)
            }
        })*
    };
}

storable_int!(i32, i64, u32, u64);

/// A record id: the location of a tuple as (page id, slot number). The
/// canonical value type stored in the index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Rid { page_id, slot }
    }
}

impl Storable for Rid {
    const SIZE: usize = 8;

    fn encode_into(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.page_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.slot.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        let mut page_id = [0u8; 4];
        let mut slot = [0u8; 4];
        page_id.copy_from_slice(&buf[..4]);
        slot.copy_from_slice(&buf[4..8]);
        Rid { page_id: PageId::from_le_bytes(page_id), slot: u32::from_le_bytes(slot) }
    }
}

/// Three-way key comparison. Must be a pure function of its arguments.
pub trait KeyComparator<K>: Send + Sync {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Compares keys through their Ord implementation.
#[derive(Copy, Clone, Debug, Default)]
pub struct OrdComparator;

impl<K: Ord + Send + Sync> KeyComparator<K> for OrdComparator {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Hashes a key down to the 32 bits the directory routes on. Must be a pure
/// function of the key.
pub trait KeyHasher<K>: Send + Sync {
    fn hash(&self, key: &K) -> u32;
}

/// MurmurHash3 (x86, 32-bit) over the key's stable encoding.
#[derive(Copy, Clone, Debug, Default)]
pub struct MurmurHasher {
    seed: u32,
}

impl MurmurHasher {
    pub fn new(seed: u32) -> Self {
        MurmurHasher { seed }
    }
}

impl<K: Storable> KeyHasher<K> for MurmurHasher {
    fn hash(&self, key: &K) -> u32 {
        let mut buf = vec![0u8; K::SIZE];
        key.encode_into(&mut buf);
        murmur3_x86_32(&buf, self.seed)
    }
}

/// Hashes an integer key to itself. Only useful in tests that need full
/// control over which directory slot a key routes to.
#[derive(Copy, Clone, Debug, Default)]
pub struct IdentityHasher;

impl KeyHasher<i32> for IdentityHasher {
    fn hash(&self, key: &i32) -> u32 {
        *key as u32
    }
}

impl KeyHasher<i64> for IdentityHasher {
    fn hash(&self, key: &i64) -> u32 {
        *key as u32
    }
}

impl KeyHasher<u32> for IdentityHasher {
    fn hash(&self, key: &u32) -> u32 {
        *key
    }
}

fn murmur3_x86_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in chunks.by_ref() {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let mut k = 0u32;
    for (i, &b) in chunks.remainder().iter().enumerate() {
        k |= (b as u32) << (8 * i);
    }
    if k != 0 {
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

//! Bincodec is binary encoding for rust values. For details, see:
//! https://github.com/bincode-org/bincode
//!
//! By default, the bincode::(de)serialize functions use fixed-length integer
//! encoding, despite DefaultOptions using variable-length encoding. This
//! module provides simple wrappers for these functions that use big-endian
//! variable-length encoding and the other defaults, so encoded page keys
//! sort by page id in the disk engine's key space.
use bincode::{DefaultOptions, Options};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let res = DefaultOptions::new().with_big_endian().with_varint_encoding().serialize(value)?;
    Ok(res)
}

pub fn deserialize<'a, T: Deserialize<'a>>(input: &'a [u8]) -> Result<T> {
    let res = DefaultOptions::new().with_big_endian().with_varint_encoding().deserialize(input)?;
    Ok(res)
}

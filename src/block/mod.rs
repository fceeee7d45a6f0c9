//! Generic block engine shared by the resource table and dex containers.

pub mod align;
pub mod leb;
pub mod reader;
pub mod tree;

use num_traits::{NumCast, ToPrimitive};
use std::fmt::Display;

use crate::error::DexResult;

pub use align::AlignPad;
pub use reader::BlockReader;
pub use tree::{BlockTree, Field, NodeId, NodeKind, Patch, Width};

/// A self-delimiting structure that reads from and writes to a byte stream.
pub trait Block: Sized
{
    fn read_bytes(reader: &mut BlockReader<'_>) -> DexResult<Self>;

    /// Appends the encoded block and returns the number of bytes written.
    fn write_bytes(&self, buffer: &mut Vec<u8>) -> usize;

    fn count_bytes(&self) -> usize
    {
        let mut scratch = Vec::new();
        self.write_bytes(&mut scratch)
    }
}

/// Checked narrowing of a computed size, count or index into a fixed-width slot.
pub fn narrow<T, V>(value: V, what: &str) -> DexResult<T>
where
    T: NumCast,
    V: ToPrimitive + Display + Copy,
{
    match <T as NumCast>::from(value) {
        Some(v) => Ok(v),
        None => fail!(Format, "{} value {} does not fit its slot", what, value),
    }
}

// Basic type writing
pub fn write_u1(buffer: &mut Vec<u8>, val: u8) -> usize
{
    buffer.push(val);
    1
}

pub fn write_u2(buffer: &mut Vec<u8>, val: u16) -> usize
{
    buffer.extend_from_slice(&val.to_le_bytes());
    2
}

pub fn write_u4(buffer: &mut Vec<u8>, val: u32) -> usize
{
    buffer.extend_from_slice(&val.to_le_bytes());
    4
}

pub fn write_uleb128(buffer: &mut Vec<u8>, val: u32) -> usize
{
    let encoded = leb::encode_uleb128(val);
    let c = encoded.len();
    buffer.extend(encoded);
    c
}

pub fn write_uleb128p1(buffer: &mut Vec<u8>, val: i64) -> usize
{
    let encoded = leb::encode_uleb128p1(val);
    let c = encoded.len();
    buffer.extend(encoded);
    c
}

pub fn write_sleb128(buffer: &mut Vec<u8>, val: i32) -> usize
{
    let encoded = leb::encode_sleb128(val);
    let c = encoded.len();
    buffer.extend(encoded);
    c
}

pub fn write_x(buffer: &mut Vec<u8>, val: &[u8]) -> usize
{
    buffer.extend_from_slice(val);
    val.len()
}

/// Overwrites a little-endian u32 already present in `buffer`.
pub fn put_u4(buffer: &mut [u8], at: usize, val: u32)
{
    buffer[at..at + 4].copy_from_slice(&val.to_le_bytes());
}

pub fn put_u2(buffer: &mut [u8], at: usize, val: u16)
{
    buffer[at..at + 2].copy_from_slice(&val.to_le_bytes());
}

pub fn get_u4(buffer: &[u8], at: usize) -> Option<u32>
{
    buffer.get(at..at + 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn get_u2(buffer: &[u8], at: usize) -> Option<u16>
{
    buffer.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

//! Walks the entries of a resource TYPE chunk to rewrite global string references.

use std::collections::HashSet;

use crate::block::{get_u2, get_u4, put_u4};
use crate::error::DexResult;

const FLAG_SPARSE: u8 = 0x01;
const FLAG_OFFSET16: u8 = 0x02;

const ENTRY_FLAG_COMPLEX: u16 = 0x0001;
const ENTRY_FLAG_COMPACT: u16 = 0x0008;

const NO_ENTRY: u32 = 0xFFFF_FFFF;
const NO_ENTRY16: u16 = 0xFFFF;

const MAP_SIZE: usize = 12;

/// Res_value data type of an index into the table's global string pool.
pub const TYPE_STRING: u8 = 0x03;

fn u2(chunk: &[u8], at: usize) -> DexResult<u16> {
    match get_u2(chunk, at) {
        Some(v) => Ok(v),
        None => fail!(Format, "Type chunk field at 0x{:x} beyond {} bytes", at, chunk.len()),
    }
}

fn u4(chunk: &[u8], at: usize) -> DexResult<u32> {
    match get_u4(chunk, at) {
        Some(v) => Ok(v),
        None => fail!(Format, "Type chunk field at 0x{:x} beyond {} bytes", at, chunk.len()),
    }
}

/// Entry offsets of a type chunk, relative to its entries start.
fn entry_offsets(chunk: &[u8]) -> DexResult<Vec<usize>> {
    let header_size = u2(chunk, 2)? as usize;
    let flags = *chunk.get(9).unwrap_or(&0);
    let count = u4(chunk, 12)? as usize;
    let mut offsets = Vec::new();
    for i in 0..count {
        if flags & FLAG_SPARSE != 0 {
            offsets.push(u2(chunk, header_size + i * 4 + 2)? as usize * 4);
        } else if flags & FLAG_OFFSET16 != 0 {
            let v = u2(chunk, header_size + i * 2)?;
            if v != NO_ENTRY16 {
                offsets.push(v as usize * 4);
            }
        } else {
            let v = u4(chunk, header_size + i * 4)?;
            if v != NO_ENTRY {
                offsets.push(v as usize);
            }
        }
    }
    Ok(offsets)
}

/// Rewrites every string-typed value in `chunk` through `map`; returns the number rewritten.
pub fn remap_type_strings<F>(chunk: &mut [u8], mut map: F) -> DexResult<usize>
where
    F: FnMut(u32) -> DexResult<u32>,
{
    let entries_start = u4(chunk, 16)? as usize;
    let mut seen = HashSet::new();
    let mut rewritten = 0;
    for offset in entry_offsets(chunk)? {
        let entry = entries_start + offset;
        if !seen.insert(entry) {
            continue;
        }
        let size = u2(chunk, entry)? as usize;
        let flags = u2(chunk, entry + 2)?;
        let mut values = Vec::new();
        if flags & ENTRY_FLAG_COMPACT != 0 {
            values.push(((flags >> 8) as u8, entry + 4));
        } else if flags & ENTRY_FLAG_COMPLEX != 0 {
            let count = u4(chunk, entry + 12)? as usize;
            for i in 0..count {
                let value = entry + size + i * MAP_SIZE + 4;
                values.push((*chunk.get(value + 3).unwrap_or(&0), value + 4));
            }
        } else {
            let value = entry + size;
            values.push((*chunk.get(value + 3).unwrap_or(&0), value + 4));
        }
        for (data_type, at) in values {
            if data_type != TYPE_STRING {
                continue;
            }
            let old = u4(chunk, at)?;
            let new = map(old)?;
            if new != old {
                put_u4(chunk, at, new);
            }
            rewritten += 1;
        }
    }
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::android::chunk::{begin_chunk, finalize_chunk, write_u16, write_u32, ChunkType};

    fn simple_entry(buf: &mut Vec<u8>, key: u32, data_type: u8, data: u32) {
        write_u16(buf, 8);
        write_u16(buf, 0);
        write_u32(buf, key);
        write_u16(buf, 8);
        buf.push(0);
        buf.push(data_type);
        write_u32(buf, data);
    }

    fn type_chunk(flags: u8, offsets: &[u32], entries: &[u8]) -> Vec<u8> {
        let header_size = 20 + 4;
        let mut buf = Vec::new();
        let start = begin_chunk(&mut buf, ChunkType::Type, header_size as u16);
        buf.push(1);
        buf.push(flags);
        write_u16(&mut buf, 0);
        write_u32(&mut buf, offsets.len() as u32);
        write_u32(&mut buf, (header_size + offsets.len() * 4) as u32);
        write_u32(&mut buf, 4); // config size
        for o in offsets {
            write_u32(&mut buf, *o);
        }
        buf.extend_from_slice(entries);
        finalize_chunk(&mut buf, start);
        buf
    }

    #[test]
    fn remaps_simple_and_shared_entries() {
        let mut entries = Vec::new();
        simple_entry(&mut entries, 0, TYPE_STRING, 5);
        simple_entry(&mut entries, 1, 0x10, 5);
        let mut chunk = type_chunk(0, &[0, NO_ENTRY, 16, 0], &entries);
        let n = remap_type_strings(&mut chunk, |i| Ok(i + 100)).unwrap();
        assert_eq!(n, 1);
        let entries_start = u4(&chunk, 16).unwrap() as usize;
        assert_eq!(u4(&chunk, entries_start + 12).unwrap(), 105);
        assert_eq!(u4(&chunk, entries_start + 28).unwrap(), 5);
    }

    #[test]
    fn remaps_complex_map_values() {
        let mut entries = Vec::new();
        write_u16(&mut entries, 16);
        write_u16(&mut entries, ENTRY_FLAG_COMPLEX);
        write_u32(&mut entries, 0);
        write_u32(&mut entries, 0); // parent
        write_u32(&mut entries, 2); // count
        for (t, d) in [(TYPE_STRING, 1u32), (TYPE_STRING, 2)] {
            write_u32(&mut entries, 0x0101_0000);
            write_u16(&mut entries, 8);
            entries.push(0);
            entries.push(t);
            write_u32(&mut entries, d);
        }
        let mut chunk = type_chunk(0, &[0], &entries);
        let n = remap_type_strings(&mut chunk, |i| Ok(i * 10)).unwrap();
        assert_eq!(n, 2);
        let base = u4(&chunk, 16).unwrap() as usize + 16;
        assert_eq!(u4(&chunk, base + 8).unwrap(), 10);
        assert_eq!(u4(&chunk, base + 20).unwrap(), 20);
    }

    #[test]
    fn errors_propagate_from_the_mapping() {
        let mut entries = Vec::new();
        simple_entry(&mut entries, 0, TYPE_STRING, 9);
        let mut chunk = type_chunk(0, &[0], &entries);
        let err = remap_type_strings(&mut chunk, |_| Err(err!(IndexOutOfRange, "no string"))).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IndexOutOfRange);
    }
}

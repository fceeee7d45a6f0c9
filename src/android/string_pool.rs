use bitflags::bitflags;
use log::{debug, trace};
use std::collections::HashMap;

use crate::android::chunk::{align_to_four, begin_chunk, finalize_chunk, write_u16, write_u32, ChunkHeader, ChunkType};
use crate::block::BlockReader;
use crate::error::DexResult;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PoolFlags: u32 {
        const SORTED = 0x0000_0001;
        const UTF8 = 0x0000_0100;
    }
}

const POOL_HEADER_SIZE: u16 = 28;
const MAX_UTF8_LENGTH: usize = 0x7FFF;
const MAX_UTF16_LENGTH: usize = 0x7FFF_FFFF;

/// A resource string pool.
///
/// Styles are kept as raw bytes: their offsets are relative to the styles
/// area, so they survive a re-encode of the string data unchanged. A pool that
/// was never modified writes back the bytes it was read from.
#[derive(Debug, Clone)]
pub struct StringPool {
    flags: PoolFlags,
    strings: Vec<String>,
    index: HashMap<String, u32>,
    style_offsets: Vec<u32>,
    style_data: Vec<u8>,
    original: Vec<u8>,
    modified: bool,
}

impl StringPool {
    /// Creates an empty pool; it is encoded from scratch on first write.
    pub fn new(utf8: bool) -> Self {
        let flags = if utf8 { PoolFlags::UTF8 } else { PoolFlags::empty() };
        StringPool {
            flags,
            strings: Vec::new(),
            index: HashMap::new(),
            style_offsets: Vec::new(),
            style_data: Vec::new(),
            original: Vec::new(),
            modified: true,
        }
    }

    /// Parses a complete string pool chunk.
    pub fn read(bytes: &[u8]) -> DexResult<Self> {
        let mut reader = BlockReader::new(bytes);
        let header = ChunkHeader::read(&mut reader)?;
        if header.chunk_type != ChunkType::StringPool {
            fail!(Format, "Expected a string pool chunk, found {:?}", header.chunk_type);
        }
        if header.header_size < POOL_HEADER_SIZE {
            fail!(Format, "String pool header of {} bytes is too short", header.header_size);
        }
        let string_count = reader.read_u4()? as usize;
        let style_count = reader.read_u4()? as usize;
        let flags = PoolFlags::from_bits_retain(reader.read_u4()?);
        let strings_start = reader.read_u4()? as usize;
        let styles_start = reader.read_u4()? as usize;
        let chunk_end = header.end();

        reader.seek(header.header_size as usize)?;
        let mut string_offsets = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            string_offsets.push(reader.read_u4()? as usize);
        }
        let mut style_offsets = Vec::with_capacity(style_count);
        for _ in 0..style_count {
            style_offsets.push(reader.read_u4()?);
        }

        let is_utf8 = flags.contains(PoolFlags::UTF8);
        let mut strings = Vec::with_capacity(string_count);
        for (i, offset) in string_offsets.into_iter().enumerate() {
            let absolute = strings_start + offset;
            let text = if is_utf8 {
                read_utf8_string(bytes, absolute, chunk_end)
            } else {
                read_utf16_string(bytes, absolute, chunk_end)
            };
            strings.push(text.map_err(|e| e.with_context(format!("string {}", i)))?);
        }

        let style_data = if style_count > 0 {
            if styles_start < strings_start || styles_start > chunk_end {
                fail!(Format, "Styles start 0x{:x} outside the string pool", styles_start);
            }
            bytes[styles_start..chunk_end].to_vec()
        } else {
            Vec::new()
        };

        debug!("read string pool: {} strings, {} styles, flags {:?}", strings.len(), style_count, flags);
        let mut pool = StringPool {
            flags,
            strings,
            index: HashMap::new(),
            style_offsets,
            style_data,
            original: bytes[..chunk_end].to_vec(),
            modified: false,
        };
        pool.rebuild_index();
        Ok(pool)
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, s) in self.strings.iter().enumerate() {
            self.index.entry(s.clone()).or_insert(i as u32);
        }
    }

    pub fn flags(&self) -> PoolFlags {
        self.flags
    }

    pub fn is_utf8(&self) -> bool {
        self.flags.contains(PoolFlags::UTF8)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn style_count(&self) -> usize {
        self.style_offsets.len()
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn get(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(|s| s.as_str())
    }

    /// First index holding `value`.
    pub fn index_of(&self, value: &str) -> Option<u32> {
        self.index.get(value).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.strings.iter().map(|s| s.as_str())
    }

    fn check_encodable(&self, value: &str) -> DexResult<()> {
        let units = value.encode_utf16().count();
        if self.is_utf8() {
            if units > MAX_UTF8_LENGTH || value.len() > MAX_UTF8_LENGTH {
                fail!(InvalidKey, "String of {} bytes is too long for a UTF-8 pool", value.len());
            }
        } else if units > MAX_UTF16_LENGTH {
            fail!(InvalidKey, "String of {} units is too long for a UTF-16 pool", units);
        }
        Ok(())
    }

    /// Returns the index of `value`, appending it when absent.
    pub fn get_or_create(&mut self, value: &str) -> DexResult<u32> {
        if let Some(index) = self.index_of(value) {
            return Ok(index);
        }
        self.check_encodable(value)?;
        let index = self.strings.len() as u32;
        self.strings.push(value.to_string());
        self.index.insert(value.to_string(), index);
        self.flags.remove(PoolFlags::SORTED);
        self.modified = true;
        trace!("added pool string {} {:?}", index, value);
        Ok(index)
    }

    /// Replaces the string at `index` in place; references to the index now see `value`.
    pub fn set(&mut self, index: u32, value: &str) -> DexResult<()> {
        if index as usize >= self.strings.len() {
            fail!(IndexOutOfRange, "String index {} beyond pool of {}", index, self.strings.len());
        }
        self.check_encodable(value)?;
        if self.strings[index as usize] == value {
            return Ok(());
        }
        self.strings[index as usize] = value.to_string();
        self.rebuild_index();
        self.flags.remove(PoolFlags::SORTED);
        self.modified = true;
        Ok(())
    }

    /// The encoded chunk: the original bytes when untouched.
    pub fn to_chunk(&self) -> Vec<u8> {
        if !self.modified {
            return self.original.clone();
        }
        let is_utf8 = self.is_utf8();
        let mut string_data = Vec::new();
        let mut offsets = Vec::with_capacity(self.strings.len());
        for s in &self.strings {
            offsets.push(string_data.len() as u32);
            if is_utf8 {
                write_utf8_string(&mut string_data, s);
            } else {
                write_utf16_string(&mut string_data, s);
            }
        }
        align_to_four(&mut string_data);

        let table_size = (self.strings.len() + self.style_offsets.len()) as u32 * 4;
        let strings_start = if self.strings.is_empty() { 0 } else { POOL_HEADER_SIZE as u32 + table_size };
        let styles_start = if self.style_offsets.is_empty() {
            0
        } else {
            POOL_HEADER_SIZE as u32 + table_size + string_data.len() as u32
        };

        let mut chunk = Vec::new();
        let start = begin_chunk(&mut chunk, ChunkType::StringPool, POOL_HEADER_SIZE);
        write_u32(&mut chunk, self.strings.len() as u32);
        write_u32(&mut chunk, self.style_offsets.len() as u32);
        write_u32(&mut chunk, self.flags.bits());
        write_u32(&mut chunk, strings_start);
        write_u32(&mut chunk, styles_start);
        for offset in offsets {
            write_u32(&mut chunk, offset);
        }
        for offset in &self.style_offsets {
            write_u32(&mut chunk, *offset);
        }
        chunk.extend_from_slice(&string_data);
        chunk.extend_from_slice(&self.style_data);
        finalize_chunk(&mut chunk, start);
        chunk
    }
}

fn read_utf8_string(data: &[u8], offset: usize, limit: usize) -> DexResult<String> {
    let mut cursor = offset;
    let (_, len_bytes) = read_utf8_length(data, cursor, limit)?;
    cursor += len_bytes;
    let (byte_len, byte_len_size) = read_utf8_length(data, cursor, limit)?;
    cursor += byte_len_size;
    if cursor + byte_len >= limit {
        fail!(Format, "UTF-8 string at 0x{:x} exceeds chunk bounds", offset);
    }
    let slice = &data[cursor..cursor + byte_len];
    if data[cursor + byte_len] != 0 {
        fail!(Format, "UTF-8 string at 0x{:x} missing terminator", offset);
    }
    match std::str::from_utf8(slice) {
        Ok(text) => Ok(text.to_string()),
        Err(_) => cesu8::from_java_cesu8(slice)
            .map(|s| s.into_owned())
            .map_err(|_| err!(Format, "Invalid UTF-8 string data at 0x{:x}", offset)),
    }
}

fn read_utf16_string(data: &[u8], offset: usize, limit: usize) -> DexResult<String> {
    let mut cursor = offset;
    let (char_count, header_bytes) = read_utf16_length(data, cursor, limit)?;
    cursor += header_bytes;
    let byte_len = char_count * 2;
    if cursor + byte_len + 2 > limit {
        fail!(Format, "UTF-16 string at 0x{:x} exceeds chunk bounds", offset);
    }
    let units: Vec<u16> = data[cursor..cursor + byte_len]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    cursor += byte_len;
    if data[cursor] != 0 || data[cursor + 1] != 0 {
        fail!(Format, "UTF-16 string at 0x{:x} missing terminator", offset);
    }
    String::from_utf16(&units).map_err(|e| err!(Format, "Invalid UTF-16 string at 0x{:x}: {}", offset, e))
}

fn read_utf8_length(data: &[u8], offset: usize, limit: usize) -> DexResult<(usize, usize)> {
    if offset >= limit {
        fail!(Format, "Invalid UTF-8 length offset 0x{:x}", offset);
    }
    let first = data[offset];
    if (first & 0x80) == 0 {
        Ok((first as usize, 1))
    } else {
        if offset + 1 >= limit {
            fail!(Format, "Truncated UTF-8 length at 0x{:x}", offset);
        }
        let second = data[offset + 1];
        Ok(((((first & 0x7F) as usize) << 8) | second as usize, 2))
    }
}

fn read_utf16_length(data: &[u8], offset: usize, limit: usize) -> DexResult<(usize, usize)> {
    if offset + 2 > limit {
        fail!(Format, "Invalid UTF-16 length offset 0x{:x}", offset);
    }
    let first = u16::from_le_bytes([data[offset], data[offset + 1]]);
    if (first & 0x8000) == 0 {
        Ok((first as usize, 2))
    } else {
        if offset + 4 > limit {
            fail!(Format, "Truncated UTF-16 length at 0x{:x}", offset);
        }
        let second = u16::from_le_bytes([data[offset + 2], data[offset + 3]]);
        Ok(((((first & 0x7FFF) as usize) << 16) | second as usize, 4))
    }
}

fn write_utf8_length(buf: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        buf.push(len as u8);
    } else {
        buf.push(0x80 | ((len >> 8) as u8 & 0x7F));
        buf.push((len & 0xFF) as u8);
    }
}

fn write_utf8_string(buf: &mut Vec<u8>, text: &str) {
    write_utf8_length(buf, text.encode_utf16().count());
    write_utf8_length(buf, text.len());
    buf.extend_from_slice(text.as_bytes());
    buf.push(0);
}

fn write_utf16_string(buf: &mut Vec<u8>, text: &str) {
    let units: Vec<u16> = text.encode_utf16().collect();
    let len = units.len();
    if len < 0x8000 {
        write_u16(buf, len as u16);
    } else {
        write_u16(buf, 0x8000 | ((len >> 16) as u16 & 0x7FFF));
        write_u16(buf, (len & 0xFFFF) as u16);
    }
    for unit in units {
        write_u16(buf, unit);
    }
    write_u16(buf, 0);
}

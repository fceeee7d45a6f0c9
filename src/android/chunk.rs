use log::warn;

use crate::block::{BlockReader, BlockTree, Field, NodeId, Patch};
use crate::config::ReadOptions;
use crate::error::DexResult;

/// Resource chunk tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkType {
    Null,
    StringPool,
    Table,
    Xml,
    XmlResourceMap,
    Package,
    Type,
    Spec,
    Library,
    Overlayable,
    OverlayablePolicy,
    StagedAlias,
    Unknown(u16),
}

impl ChunkType {
    pub fn from_code(code: u16) -> ChunkType {
        match code {
            0x0000 => ChunkType::Null,
            0x0001 => ChunkType::StringPool,
            0x0002 => ChunkType::Table,
            0x0003 => ChunkType::Xml,
            0x0180 => ChunkType::XmlResourceMap,
            0x0200 => ChunkType::Package,
            0x0201 => ChunkType::Type,
            0x0202 => ChunkType::Spec,
            0x0203 => ChunkType::Library,
            0x0204 => ChunkType::Overlayable,
            0x0205 => ChunkType::OverlayablePolicy,
            0x0206 => ChunkType::StagedAlias,
            other => ChunkType::Unknown(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            ChunkType::Null => 0x0000,
            ChunkType::StringPool => 0x0001,
            ChunkType::Table => 0x0002,
            ChunkType::Xml => 0x0003,
            ChunkType::XmlResourceMap => 0x0180,
            ChunkType::Package => 0x0200,
            ChunkType::Type => 0x0201,
            ChunkType::Spec => 0x0202,
            ChunkType::Library => 0x0203,
            ChunkType::Overlayable => 0x0204,
            ChunkType::OverlayablePolicy => 0x0205,
            ChunkType::StagedAlias => 0x0206,
            ChunkType::Unknown(code) => *code,
        }
    }

    /// Tag stored on the block node of a chunk of this type.
    pub fn tag(&self) -> u32 {
        self.code() as u32
    }
}

/// Tag of leaf nodes holding bytes between or after chunks.
pub const GAP_TAG: u32 = 0xFFFF_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_type: ChunkType,
    pub header_size: u16,
    pub chunk_size: u32,
    pub start: usize,
}

impl ChunkHeader {
    pub const SIZE: usize = 8;

    pub fn end(&self) -> usize {
        self.start + self.chunk_size as usize
    }

    /// Reads and validates a chunk header without consuming the chunk body.
    pub fn read(reader: &mut BlockReader<'_>) -> DexResult<ChunkHeader> {
        let start = reader.position();
        if reader.remaining() < Self::SIZE {
            fail!(Format, "Truncated chunk header at 0x{:x}", start);
        }
        let chunk_type = ChunkType::from_code(reader.read_u2()?);
        let header_size = reader.read_u2()?;
        let chunk_size = reader.read_u4()?;
        if (header_size as usize) < Self::SIZE || chunk_size < header_size as u32 {
            fail!(Format, "Invalid sizing for {:?} chunk at 0x{:x}: header {} of {}", chunk_type, start, header_size, chunk_size);
        }
        if chunk_size as usize > reader.remaining() + Self::SIZE {
            fail!(Format, "{:?} chunk at 0x{:x} extends past its parent", chunk_type, start);
        }
        Ok(ChunkHeader { chunk_type, header_size, chunk_size, start })
    }
}

/// Reads the next chunk in full and leaves the reader after it.
pub fn read_chunk<'a>(reader: &mut BlockReader<'a>) -> DexResult<(ChunkHeader, &'a [u8])> {
    let header = ChunkHeader::read(reader)?;
    reader.seek(header.start)?;
    let bytes = reader.peek_x(header.chunk_size as usize)?;
    reader.seek(header.end())?;
    Ok((header, bytes))
}

/// A chunk kept verbatim: a header leaf and a body leaf under one container.
pub fn opaque_chunk(tree: &mut BlockTree, header: &ChunkHeader, bytes: &[u8]) -> DexResult<NodeId> {
    let node = tree.new_container(header.chunk_type.tag());
    let head = tree.new_leaf(header.chunk_type.tag(), bytes[..header.header_size as usize].to_vec());
    let body = tree.new_leaf(header.chunk_type.tag(), bytes[header.header_size as usize..].to_vec());
    tree.add_child(node, head)?;
    tree.add_child(node, body)?;
    tree.add_patch(node, Patch::Size(Field::u32(head, 4)))?;
    Ok(node)
}

/// Checks an unrecognised chunk against the read options before it is preserved.
pub fn admit_unknown(header: &ChunkHeader, options: &ReadOptions) -> DexResult<()> {
    if let ChunkType::Unknown(code) = header.chunk_type {
        if !options.preserve_unknown {
            fail!(UnsupportedFormat, "Unknown chunk type 0x{:04x} at 0x{:x}", code, header.start);
        }
        warn!("preserving unknown chunk type 0x{:04x} at 0x{:x} ({} bytes)", code, header.start, header.chunk_size);
    }
    Ok(())
}

/// Reads the chunks between the reader's position and `end` with `visit`.
///
/// Trailing bytes too short for a chunk header become a gap leaf.
pub fn read_children<'a, F>(reader: &mut BlockReader<'a>, end: usize, tree: &mut BlockTree, parent: NodeId, mut visit: F) -> DexResult<()>
where
    F: FnMut(&mut BlockTree, ChunkHeader, &'a [u8]) -> DexResult<Option<NodeId>>,
{
    while reader.position() < end {
        if end - reader.position() < ChunkHeader::SIZE {
            let gap = reader.read_x(end - reader.position())?;
            warn!("keeping {} trailing bytes at 0x{:x}", gap.len(), reader.position() - gap.len());
            let leaf = tree.new_leaf(GAP_TAG, gap);
            tree.add_child(parent, leaf)?;
            break;
        }
        let (header, bytes) = read_chunk(reader)?;
        if header.end() > end {
            fail!(Format, "{:?} chunk at 0x{:x} overruns its parent ending at 0x{:x}", header.chunk_type, header.start, end);
        }
        if let Some(node) = visit(tree, header, bytes)? {
            tree.add_child(parent, node)?;
        }
    }
    Ok(())
}

pub(crate) fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn align_to_four(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

pub(crate) fn begin_chunk(buf: &mut Vec<u8>, chunk_type: ChunkType, header_size: u16) -> usize {
    let start = buf.len();
    write_u16(buf, chunk_type.code());
    write_u16(buf, header_size);
    write_u32(buf, 0); // placeholder for chunk size
    start
}

pub(crate) fn finalize_chunk(buf: &mut Vec<u8>, chunk_start: usize) {
    align_to_four(buf);
    let size = (buf.len() - chunk_start) as u32;
    buf[chunk_start + 4..chunk_start + 8].copy_from_slice(&size.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn header_sizes_are_validated() {
        let mut buf = Vec::new();
        let start = begin_chunk(&mut buf, ChunkType::Library, 12);
        write_u32(&mut buf, 0);
        finalize_chunk(&mut buf, start);
        let header = ChunkHeader::read(&mut BlockReader::new(&buf)).unwrap();
        assert_eq!(header.chunk_type, ChunkType::Library);
        assert_eq!(header.chunk_size, 12);

        let bad = [0x03, 0x02, 0x10, 0x00, 0x08, 0x00, 0x00, 0x00];
        assert_eq!(ChunkHeader::read(&mut BlockReader::new(&bad)).unwrap_err().kind(), ErrorKind::Format);

        let long = [0x01, 0x00, 0x08, 0x00, 0x40, 0x00, 0x00, 0x00];
        assert_eq!(ChunkHeader::read(&mut BlockReader::new(&long)).unwrap_err().kind(), ErrorKind::Format);
    }

    #[test]
    fn unknown_chunks_respect_options() {
        let header = ChunkHeader { chunk_type: ChunkType::from_code(0x7f01), header_size: 8, chunk_size: 8, start: 0 };
        assert!(admit_unknown(&header, &ReadOptions::default()).is_ok());
        let strict = ReadOptions { preserve_unknown: false, ..ReadOptions::default() };
        assert_eq!(admit_unknown(&header, &strict).unwrap_err().kind(), ErrorKind::UnsupportedFormat);
    }

    #[test]
    fn opaque_chunk_round_trips() {
        let mut buf = Vec::new();
        let start = begin_chunk(&mut buf, ChunkType::Spec, 16);
        write_u32(&mut buf, 0x0101);
        write_u32(&mut buf, 1);
        write_u32(&mut buf, 0x4000_0000);
        finalize_chunk(&mut buf, start);

        let mut tree = BlockTree::new();
        let mut reader = BlockReader::new(&buf);
        let (header, bytes) = read_chunk(&mut reader).unwrap();
        let node = opaque_chunk(&mut tree, &header, bytes).unwrap();
        assert_eq!(tree.refresh(node).unwrap(), buf.len() as u64);
        let mut out = Vec::new();
        tree.write_bytes(node, &mut out);
        assert_eq!(out, buf);
    }
}

use log::{debug, warn};

use crate::android::chunk::{admit_unknown, opaque_chunk, read_chunk, read_children, write_u16, write_u32, ChunkHeader, ChunkType};
use crate::android::entry::remap_type_strings;
use crate::android::string_pool::StringPool;
use crate::block::{BlockReader, BlockTree, Field, NodeId, Patch};
use crate::config::ReadOptions;
use crate::error::DexResult;

pub const PACKAGE_HEADER_SIZE: u16 = 288;
const MIN_PACKAGE_HEADER_SIZE: u16 = 284;
const NAME_AT: usize = 12;
const NAME_UNITS: usize = 128;
const TYPE_STRINGS_AT: usize = 268;
const KEY_STRINGS_AT: usize = 276;

/// A string pool owned by a package together with the leaf that serializes it.
#[derive(Debug, Clone)]
pub struct PoolSlot {
    pub pool: StringPool,
    pub node: NodeId,
}

/// One PACKAGE chunk of a resource table.
#[derive(Debug, Clone)]
pub struct PackageBlock {
    id: u32,
    name: String,
    node: NodeId,
    header: NodeId,
    type_strings: Option<PoolSlot>,
    key_strings: Option<PoolSlot>,
    chunks: Vec<(ChunkType, NodeId)>,
}

fn check_name(name: &str) -> DexResult<()> {
    let units = name.encode_utf16().count();
    if units >= NAME_UNITS {
        fail!(InvalidKey, "Package name {:?} has {} UTF-16 units, the limit is {}", name, units, NAME_UNITS - 1);
    }
    Ok(())
}

fn decode_name(header: &[u8]) -> String {
    let units: Vec<u16> = header[NAME_AT..NAME_AT + NAME_UNITS * 2]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|u| *u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

impl PackageBlock {
    /// Builds an empty package with fresh type and key string pools.
    pub fn new(tree: &mut BlockTree, id: u32, name: &str) -> DexResult<PackageBlock> {
        check_name(name)?;
        let mut head = Vec::with_capacity(PACKAGE_HEADER_SIZE as usize);
        write_u16(&mut head, ChunkType::Package.code());
        write_u16(&mut head, PACKAGE_HEADER_SIZE);
        write_u32(&mut head, 0); // chunk size
        write_u32(&mut head, id);
        head.resize(PACKAGE_HEADER_SIZE as usize, 0);

        let node = tree.new_container(ChunkType::Package.tag());
        let header = tree.new_leaf(ChunkType::Package.tag(), head);
        tree.add_child(node, header)?;
        tree.add_patch(node, Patch::Size(Field::u32(header, 4)))?;

        let mut slots = Vec::new();
        for at in [TYPE_STRINGS_AT, KEY_STRINGS_AT] {
            let pool = StringPool::new(true);
            let leaf = tree.new_leaf(ChunkType::StringPool.tag(), pool.to_chunk());
            tree.add_child(node, leaf)?;
            tree.add_patch(node, Patch::RelativeOffset { of: leaf, field: Field::u32(header, at) })?;
            slots.push(PoolSlot { pool, node: leaf });
        }
        let key_strings = slots.pop();
        let type_strings = slots.pop();

        let mut package = PackageBlock { id, name: name.to_string(), node, header, type_strings, key_strings, chunks: Vec::new() };
        package.refresh(tree)?;
        Ok(package)
    }

    /// Parses a complete PACKAGE chunk into `tree`; the returned package's node is detached.
    pub fn read(tree: &mut BlockTree, bytes: &[u8], options: &ReadOptions) -> DexResult<PackageBlock> {
        let mut reader = BlockReader::new(bytes);
        let header = ChunkHeader::read(&mut reader)?;
        if header.header_size < MIN_PACKAGE_HEADER_SIZE {
            fail!(Format, "Package header of {} bytes is too short", header.header_size);
        }
        let head = bytes[..header.header_size as usize].to_vec();
        let id = reader.read_u4()?;
        let name = decode_name(&head);
        reader.seek(TYPE_STRINGS_AT)?;
        let type_strings_at = reader.read_u4()? as usize;
        reader.seek(KEY_STRINGS_AT)?;
        let key_strings_at = reader.read_u4()? as usize;

        let node = tree.new_container(ChunkType::Package.tag());
        let head_node = tree.new_leaf(ChunkType::Package.tag(), head);
        tree.add_child(node, head_node)?;
        tree.add_patch(node, Patch::Size(Field::u32(head_node, 4)))?;

        let mut type_strings = None;
        let mut key_strings = None;
        let mut chunks = Vec::new();
        reader.seek(header.header_size as usize)?;
        read_children(&mut reader, header.end(), tree, node, |tree, child, body| {
            let relative = child.start;
            if child.chunk_type == ChunkType::StringPool && (relative == type_strings_at || relative == key_strings_at) {
                let pool = StringPool::read(body)?;
                let leaf = tree.new_leaf(ChunkType::StringPool.tag(), body.to_vec());
                let at = if relative == type_strings_at { TYPE_STRINGS_AT } else { KEY_STRINGS_AT };
                tree.add_patch(node, Patch::RelativeOffset { of: leaf, field: Field::u32(head_node, at) })?;
                let slot = Some(PoolSlot { pool, node: leaf });
                if relative == type_strings_at {
                    type_strings = slot;
                } else {
                    key_strings = slot;
                }
                return Ok(Some(leaf));
            }
            admit_unknown(&child, options)?;
            if child.chunk_type == ChunkType::StringPool {
                warn!("package 0x{:02x} has an unreferenced string pool at 0x{:x}", id, relative);
            }
            let chunk = opaque_chunk(tree, &child, body)?;
            chunks.push((child.chunk_type, chunk));
            Ok(Some(chunk))
        })
        .map_err(|e| e.with_context(format!("package 0x{:02x}", id)))?;

        debug!("read package 0x{:02x} {:?} with {} chunks", id, name, chunks.len());
        Ok(PackageBlock { id, name, node, header: head_node, type_strings, key_strings, chunks })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn type_strings(&self) -> Option<&StringPool> {
        self.type_strings.as_ref().map(|s| &s.pool)
    }

    pub fn key_strings(&self) -> Option<&StringPool> {
        self.key_strings.as_ref().map(|s| &s.pool)
    }

    pub fn type_strings_mut(&mut self) -> Option<&mut StringPool> {
        self.type_strings.as_mut().map(|s| &mut s.pool)
    }

    pub fn key_strings_mut(&mut self) -> Option<&mut StringPool> {
        self.key_strings.as_mut().map(|s| &mut s.pool)
    }

    /// Chunks other than the two pools, in stream order.
    pub fn chunks(&self) -> &[(ChunkType, NodeId)] {
        &self.chunks
    }

    pub fn chunk_count(&self, chunk_type: ChunkType) -> usize {
        self.chunks.iter().filter(|(t, _)| *t == chunk_type).count()
    }

    /// Appends a chunk read from `bytes` after the package's existing chunks.
    pub fn push_chunk(&mut self, tree: &mut BlockTree, bytes: &[u8]) -> DexResult<NodeId> {
        let mut reader = BlockReader::new(bytes);
        let (header, body) = read_chunk(&mut reader)?;
        if !reader.is_empty() {
            fail!(Format, "{} bytes follow the {:?} chunk", reader.remaining(), header.chunk_type);
        }
        if matches!(header.chunk_type, ChunkType::Table | ChunkType::Package | ChunkType::StringPool) {
            fail!(Format, "A {:?} chunk cannot be added to a package", header.chunk_type);
        }
        let node = opaque_chunk(tree, &header, body)?;
        tree.add_child(self.node, node)?;
        self.chunks.push((header.chunk_type, node));
        Ok(node)
    }

    pub fn rename(&mut self, name: &str) -> DexResult<()> {
        check_name(name)?;
        self.name = name.to_string();
        Ok(())
    }

    /// Writes id and name into the header and re-encodes modified pools.
    pub fn refresh(&mut self, tree: &mut BlockTree) -> DexResult<()> {
        let head = tree.leaf_mut(self.header)?;
        head[8..12].copy_from_slice(&self.id.to_le_bytes());
        let mut units: Vec<u16> = self.name.encode_utf16().collect();
        units.resize(NAME_UNITS, 0);
        for (i, unit) in units.iter().enumerate() {
            let at = NAME_AT + i * 2;
            head[at..at + 2].copy_from_slice(&unit.to_le_bytes());
        }
        for slot in [&self.type_strings, &self.key_strings].into_iter().flatten() {
            if slot.pool.is_modified() {
                tree.set_leaf(slot.node, slot.pool.to_chunk())?;
            }
        }
        Ok(())
    }

    /// Re-targets this package's node ids onto a copy imported from `from` as `node`.
    pub(crate) fn rebind(&self, from: &BlockTree, tree: &BlockTree, node: NodeId) -> DexResult<PackageBlock> {
        let old = from.children(self.node);
        let new = tree.children(node);
        let map = |id: NodeId| -> DexResult<NodeId> {
            match old.iter().position(|c| *c == id).and_then(|i| new.get(i)) {
                Some(n) => Ok(*n),
                None => fail!(Format, "Package 0x{:02x} lost a child during import", self.id),
            }
        };
        let rebind_slot = |slot: &Option<PoolSlot>| -> DexResult<Option<PoolSlot>> {
            match slot {
                Some(s) => Ok(Some(PoolSlot { pool: s.pool.clone(), node: map(s.node)? })),
                None => Ok(None),
            }
        };
        let mut chunks = Vec::with_capacity(self.chunks.len());
        for (t, c) in &self.chunks {
            chunks.push((*t, map(*c)?));
        }
        Ok(PackageBlock {
            id: self.id,
            name: self.name.clone(),
            node,
            header: map(self.header)?,
            type_strings: rebind_slot(&self.type_strings)?,
            key_strings: rebind_slot(&self.key_strings)?,
            chunks,
        })
    }

    /// Rewrites global string indexes held by the package's TYPE entries.
    pub fn remap_global_strings<F>(&self, tree: &mut BlockTree, mut map: F) -> DexResult<usize>
    where
        F: FnMut(u32) -> DexResult<u32>,
    {
        let mut rewritten = 0;
        for (chunk_type, node) in &self.chunks {
            if *chunk_type != ChunkType::Type {
                continue;
            }
            let (head, body) = match tree.children(*node) {
                [head, body] => (*head, *body),
                _ => fail!(Format, "Type chunk node is not a header and body pair"),
            };
            let mut bytes = tree.leaf(head)?.to_vec();
            let split = bytes.len();
            bytes.extend_from_slice(tree.leaf(body)?);
            rewritten += remap_type_strings(&mut bytes, &mut map)?;
            let rest = bytes.split_off(split);
            tree.set_leaf(head, bytes)?;
            tree.set_leaf(body, rest)?;
        }
        Ok(rewritten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn new_package_serializes_and_reads_back() {
        let mut tree = BlockTree::new();
        let mut package = PackageBlock::new(&mut tree, 0x7f, "com.example.app").unwrap();
        package.type_strings_mut().unwrap().get_or_create("string").unwrap();
        package.key_strings_mut().unwrap().get_or_create("app_name").unwrap();
        package.refresh(&mut tree).unwrap();
        let len = tree.refresh(package.node()).unwrap();
        let mut bytes = Vec::new();
        tree.write_bytes(package.node(), &mut bytes);
        assert_eq!(bytes.len() as u64, len);

        let mut other = BlockTree::new();
        let read = PackageBlock::read(&mut other, &bytes, &ReadOptions::default()).unwrap();
        assert_eq!(read.id(), 0x7f);
        assert_eq!(read.name(), "com.example.app");
        assert_eq!(read.type_strings().unwrap().get(0), Some("string"));
        assert_eq!(read.key_strings().unwrap().get(0), Some("app_name"));
        assert!(read.chunks().is_empty());

        other.refresh(read.node()).unwrap();
        let mut again = Vec::new();
        other.write_bytes(read.node(), &mut again);
        assert_eq!(again, bytes);
    }

    #[test]
    fn pool_offsets_are_patched() {
        let mut tree = BlockTree::new();
        let mut package = PackageBlock::new(&mut tree, 1, "p").unwrap();
        package.type_strings_mut().unwrap().get_or_create("attr").unwrap();
        package.refresh(&mut tree).unwrap();
        tree.refresh(package.node()).unwrap();
        let head = package.header;
        assert_eq!(tree.read_field(Field::u32(head, TYPE_STRINGS_AT)).unwrap(), PACKAGE_HEADER_SIZE as u32);
        let key_at = PACKAGE_HEADER_SIZE as u64 + tree.length(package.type_strings.as_ref().unwrap().node).unwrap();
        assert_eq!(tree.read_field(Field::u32(head, KEY_STRINGS_AT)).unwrap() as u64, key_at);
    }

    #[test]
    fn names_are_limited_to_127_units() {
        let mut tree = BlockTree::new();
        assert_eq!(PackageBlock::new(&mut tree, 1, &"a".repeat(128)).unwrap_err().kind(), ErrorKind::InvalidKey);
        let mut package = PackageBlock::new(&mut tree, 1, &"a".repeat(127)).unwrap();
        assert_eq!(package.rename(&"b".repeat(200)).unwrap_err().kind(), ErrorKind::InvalidKey);
        assert_eq!(package.name(), "a".repeat(127));
    }

    #[test]
    fn short_headers_are_rejected() {
        let mut bytes = Vec::new();
        write_u16(&mut bytes, ChunkType::Package.code());
        write_u16(&mut bytes, 12);
        write_u32(&mut bytes, 12);
        write_u32(&mut bytes, 0x7f);
        let mut tree = BlockTree::new();
        let err = PackageBlock::read(&mut tree, &bytes, &ReadOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }
}

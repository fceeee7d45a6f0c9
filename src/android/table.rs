use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::android::chunk::{admit_unknown, opaque_chunk, read_children, write_u16, write_u32, ChunkHeader, ChunkType};
use crate::android::package::PackageBlock;
use crate::android::string_pool::StringPool;
use crate::block::{BlockReader, BlockTree, Field, NodeId, Patch};
use crate::config::ReadOptions;
use crate::error::DexResult;

const TABLE_HEADER_SIZE: u16 = 12;
const PACKAGE_COUNT_AT: usize = 8;

/// Tag of the container grouping the table's packages.
const PACKAGES_TAG: u32 = 0xFFFF_0200;

/// A compiled resource table (`resources.arsc`).
///
/// The table chunk's children are the global string pool, the packages and
/// any other chunks, which are kept verbatim in the order they were read.
#[derive(Debug, Clone)]
pub struct TableBlock {
    tree: BlockTree,
    root: NodeId,
    strings: StringPool,
    strings_node: NodeId,
    packages: Vec<PackageBlock>,
    packages_node: NodeId,
}

impl TableBlock {
    /// An empty table with a UTF-8 global string pool and no packages.
    pub fn new() -> DexResult<Self> {
        let mut tree = BlockTree::new();
        let root = tree.new_container(ChunkType::Table.tag());
        let mut head = Vec::with_capacity(TABLE_HEADER_SIZE as usize);
        write_u16(&mut head, ChunkType::Table.code());
        write_u16(&mut head, TABLE_HEADER_SIZE);
        write_u32(&mut head, 0);
        write_u32(&mut head, 0);
        let header = tree.new_leaf(ChunkType::Table.tag(), head);
        let strings = StringPool::new(true);
        let strings_node = tree.new_leaf(ChunkType::StringPool.tag(), strings.to_chunk());
        let packages_node = tree.new_container(PACKAGES_TAG);
        tree.add_child(root, header)?;
        tree.add_child(root, strings_node)?;
        tree.add_child(root, packages_node)?;
        tree.add_patch(root, Patch::Size(Field::u32(header, 4)))?;
        tree.add_patch(root, Patch::ChildCount { of: packages_node, field: Field::u32(header, PACKAGE_COUNT_AT) })?;
        Ok(TableBlock { tree, root, strings, strings_node, packages: Vec::new(), packages_node })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> DexResult<Self> {
        let bytes = fs::read(path.as_ref())?;
        Self::from_bytes(&bytes).map_err(|e| e.with_context(format!("{}", path.as_ref().display())))
    }

    pub fn from_bytes(bytes: &[u8]) -> DexResult<Self> {
        Self::from_bytes_with(bytes, &ReadOptions::default())
    }

    pub fn from_bytes_with(bytes: &[u8], options: &ReadOptions) -> DexResult<Self> {
        let mut reader = BlockReader::new(bytes);
        let header = ChunkHeader::read(&mut reader)?;
        if header.chunk_type != ChunkType::Table {
            fail!(Format, "Expected a resource table chunk, found {:?}", header.chunk_type);
        }
        if header.header_size < TABLE_HEADER_SIZE {
            fail!(Format, "Table header of {} bytes is too short", header.header_size);
        }
        if header.end() != bytes.len() {
            if options.strict_sizes {
                fail!(Format, "Table declares {} bytes but the stream holds {}", header.chunk_size, bytes.len());
            }
            warn!("ignoring {} bytes after the resource table", bytes.len() - header.end());
        }
        let declared_packages = reader.read_u4()?;

        let mut tree = BlockTree::new();
        let root = tree.new_container(ChunkType::Table.tag());
        let head = tree.new_leaf(ChunkType::Table.tag(), bytes[..header.header_size as usize].to_vec());
        tree.add_child(root, head)?;
        let packages_node = tree.new_container(PACKAGES_TAG);
        tree.add_patch(root, Patch::Size(Field::u32(head, 4)))?;
        tree.add_patch(root, Patch::ChildCount { of: packages_node, field: Field::u32(head, PACKAGE_COUNT_AT) })?;

        let mut strings = None;
        let mut packages = Vec::new();
        let mut packages_placed = false;
        reader.seek(header.header_size as usize)?;
        read_children(&mut reader, header.end(), &mut tree, root, |tree, child, body| {
            match child.chunk_type {
                ChunkType::StringPool if strings.is_none() => {
                    let pool = StringPool::read(body).map_err(|e| e.with_context("global string pool"))?;
                    let leaf = tree.new_leaf(ChunkType::StringPool.tag(), body.to_vec());
                    strings = Some((pool, leaf));
                    Ok(Some(leaf))
                }
                ChunkType::Package => {
                    let package = PackageBlock::read(tree, body, options)?;
                    tree.add_child(packages_node, package.node())?;
                    packages.push(package);
                    if packages_placed {
                        Ok(None)
                    } else {
                        packages_placed = true;
                        Ok(Some(packages_node))
                    }
                }
                _ => {
                    admit_unknown(&child, options)?;
                    debug!("keeping {:?} chunk at 0x{:x} verbatim", child.chunk_type, child.start);
                    Ok(Some(opaque_chunk(tree, &child, body)?))
                }
            }
        })?;
        if !packages_placed {
            tree.add_child(root, packages_node)?;
        }
        let (strings, strings_node) = match strings {
            Some(s) => s,
            None => fail!(Format, "Resource table has no global string pool"),
        };
        if declared_packages as usize != packages.len() {
            if options.strict_sizes {
                fail!(Format, "Table declares {} packages but holds {}", declared_packages, packages.len());
            }
            warn!("table declares {} packages but holds {}", declared_packages, packages.len());
        }
        info!("read resource table: {} strings, {} packages", strings.len(), packages.len());
        Ok(TableBlock { tree, root, strings, strings_node, packages, packages_node })
    }

    /// Recomputes every header, size and offset so the tree serializes consistently.
    pub fn refresh(&mut self) -> DexResult<u64> {
        for package in &mut self.packages {
            package.refresh(&mut self.tree)?;
        }
        if self.strings.is_modified() {
            self.tree.set_leaf(self.strings_node, self.strings.to_chunk())?;
        }
        self.tree.refresh(self.root)
    }

    pub fn to_bytes(&mut self) -> DexResult<Vec<u8>> {
        let size = self.refresh()?;
        let mut bytes = Vec::with_capacity(size as usize);
        self.tree.write_bytes(self.root, &mut bytes);
        Ok(bytes)
    }

    pub fn write_to_file<P: AsRef<Path>>(&mut self, path: P) -> DexResult<()> {
        let bytes = self.to_bytes()?;
        fs::write(path, bytes)?;
        Ok(())
    }

    pub fn tree(&self) -> &BlockTree {
        &self.tree
    }

    pub fn strings(&self) -> &StringPool {
        &self.strings
    }

    pub fn strings_mut(&mut self) -> &mut StringPool {
        &mut self.strings
    }

    pub fn packages(&self) -> &[PackageBlock] {
        &self.packages
    }

    pub fn package(&self, id: u32) -> Option<&PackageBlock> {
        self.packages.iter().find(|p| p.id() == id)
    }

    pub fn package_mut(&mut self, id: u32) -> Option<&mut PackageBlock> {
        self.packages.iter_mut().find(|p| p.id() == id)
    }

    /// Returns the package with `id`, creating an empty one named `name` when absent.
    pub fn get_or_create_package(&mut self, id: u32, name: &str) -> DexResult<&mut PackageBlock> {
        let index = match self.packages.iter().position(|p| p.id() == id) {
            Some(index) => index,
            None => {
                if id > 0xFF {
                    fail!(InvalidKey, "Package id 0x{:x} does not fit a resource id", id);
                }
                let package = PackageBlock::new(&mut self.tree, id, name)?;
                self.tree.add_child(self.packages_node, package.node())?;
                debug!("created package 0x{:02x} {:?}", id, name);
                self.packages.push(package);
                self.packages.len() - 1
            }
        };
        Ok(&mut self.packages[index])
    }

    /// Appends a SPEC, TYPE or other typed chunk to the package with `id`.
    pub fn push_package_chunk(&mut self, id: u32, bytes: &[u8]) -> DexResult<NodeId> {
        match self.packages.iter_mut().find(|p| p.id() == id) {
            Some(package) => package.push_chunk(&mut self.tree, bytes),
            None => fail!(InvalidKey, "No package with id 0x{:02x}", id),
        }
    }

    pub fn rename_package(&mut self, id: u32, name: &str) -> DexResult<()> {
        match self.package_mut(id) {
            Some(package) => package.rename(name),
            None => fail!(InvalidKey, "No package with id 0x{:02x}", id),
        }
    }

    pub fn remove_package(&mut self, id: u32) -> DexResult<PackageBlock> {
        let index = match self.packages.iter().position(|p| p.id() == id) {
            Some(index) => index,
            None => fail!(InvalidKey, "No package with id 0x{:02x}", id),
        };
        let package = self.packages.remove(index);
        self.tree.remove(package.node())?;
        Ok(package)
    }

    /// Orders packages by id, in memory and in the serialized stream.
    pub fn sort_packages(&mut self) -> DexResult<()> {
        self.packages.sort_by_key(|p| p.id());
        let ids: HashMap<NodeId, u32> = self.packages.iter().map(|p| (p.node(), p.id())).collect();
        self.tree.sort_children_by_key(self.packages_node, |_, node| ids.get(&node).copied())
    }

    /// Appends copies of `other`'s packages, re-pointing their global string
    /// references into this table's pool. Returns the number of packages added.
    ///
    /// A package id already present fails with InvalidKey; packages merged
    /// before it stay merged.
    pub fn merge(&mut self, other: &TableBlock) -> DexResult<usize> {
        let mut merged = 0;
        for package in &other.packages {
            if self.package(package.id()).is_some() {
                fail!(InvalidKey, "Package 0x{:02x} already exists", package.id());
            }
            let node = self.tree.import(&other.tree, package.node())?;
            let copy = package.rebind(&other.tree, &self.tree, node)?;
            let strings = &mut self.strings;
            let rewritten = copy.remap_global_strings(&mut self.tree, |index| match other.strings.get(index) {
                Some(value) => strings.get_or_create(value),
                None => fail!(IndexOutOfRange, "Global string {} beyond pool of {}", index, other.strings.len()),
            })
            .map_err(|e| e.with_context(format!("package 0x{:02x}", package.id())))?;
            self.tree.add_child(self.packages_node, node)?;
            debug!("merged package 0x{:02x} ({} string values remapped)", package.id(), rewritten);
            self.packages.push(copy);
            merged += 1;
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn empty_table_round_trips() {
        let mut table = TableBlock::new().unwrap();
        let bytes = table.to_bytes().unwrap();
        assert_eq!(&bytes[0..2], &[0x02, 0x00]);
        assert_eq!(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize, bytes.len());
        let mut read = TableBlock::from_bytes(&bytes).unwrap();
        assert!(read.packages().is_empty());
        assert_eq!(read.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn leading_chunk_must_be_a_table() {
        let pool = StringPool::new(false).to_chunk();
        assert_eq!(TableBlock::from_bytes(&pool).unwrap_err().kind(), ErrorKind::Format);
    }

    #[test]
    fn package_count_follows_the_package_array() {
        let mut table = TableBlock::new().unwrap();
        table.get_or_create_package(0x7f, "app").unwrap();
        table.get_or_create_package(0x02, "lib").unwrap();
        let bytes = table.to_bytes().unwrap();
        assert_eq!(u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), 2);
        table.remove_package(0x02).unwrap();
        let bytes = table.to_bytes().unwrap();
        assert_eq!(u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), 1);
        assert_eq!(table.remove_package(0x02).unwrap_err().kind(), ErrorKind::InvalidKey);
    }

    #[test]
    fn get_or_create_package_is_idempotent() {
        let mut table = TableBlock::new().unwrap();
        table.get_or_create_package(0x7f, "app").unwrap();
        table.get_or_create_package(0x7f, "other").unwrap();
        assert_eq!(table.packages().len(), 1);
        assert_eq!(table.package(0x7f).unwrap().name(), "app");
        assert_eq!(table.get_or_create_package(0x100, "x").unwrap_err().kind(), ErrorKind::InvalidKey);
    }

    #[test]
    fn package_count_mismatch_respects_strictness() {
        let mut table = TableBlock::new().unwrap();
        table.get_or_create_package(0x7f, "app").unwrap();
        let mut bytes = table.to_bytes().unwrap();
        bytes[8] = 3;
        assert_eq!(TableBlock::from_bytes(&bytes).unwrap_err().kind(), ErrorKind::Format);
        let lenient = ReadOptions { strict_sizes: false, ..ReadOptions::default() };
        let read = TableBlock::from_bytes_with(&bytes, &lenient).unwrap();
        assert_eq!(read.packages().len(), 1);
    }
}

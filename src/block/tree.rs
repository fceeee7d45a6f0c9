//! Arena-backed block tree with a bottom-up refresh protocol.
//!
//! Nodes own a contiguous extent of the serialized stream. Containers own an
//! ordered list of children and have no bytes of their own, leaves hold raw
//! bytes, and alignment nodes pad the stream so the next sibling starts on a
//! boundary. Header fields that depend on the final layout (declared size,
//! child counts, offsets to sub-blocks) are expressed as [`Patch`]es attached to
//! a container and rewritten by [`BlockTree::refresh`] once every size is known.

use log::trace;

use crate::block::{narrow, AlignPad};
use crate::error::DexResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind
{
    Container,
    Leaf(Vec<u8>),
    Align(AlignPad),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width
{
    U8,
    U16,
    U32,
}

/// A little-endian slot inside a leaf node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field
{
    pub node: NodeId,
    pub at: usize,
    pub width: Width,
}

impl Field
{
    pub fn u16(node: NodeId, at: usize) -> Field
    {
        Field { node, at, width: Width::U16 }
    }

    pub fn u32(node: NodeId, at: usize) -> Field
    {
        Field { node, at, width: Width::U32 }
    }
}

/// Post-refresh header fix-ups owned by a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Patch
{
    /// The owning container's own length.
    Size(Field),
    /// Number of children of `of`.
    ChildCount { of: NodeId, field: Field },
    /// Offset of `of` relative to the owning container's start; 0 when `of` is detached.
    RelativeOffset { of: NodeId, field: Field },
    /// Length of `of`.
    Length { of: NodeId, field: Field },
}

#[derive(Debug, Clone)]
struct Node
{
    kind: NodeKind,
    tag: u32,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    offset: u64,
    length: u64,
    patches: Vec<Patch>,
}

#[derive(Debug, Clone, Default)]
pub struct BlockTree
{
    nodes: Vec<Option<Node>>,
}

impl BlockTree
{
    pub fn new() -> Self
    {
        BlockTree { nodes: Vec::new() }
    }

    fn alloc(&mut self, kind: NodeKind, tag: u32) -> NodeId
    {
        let length = match &kind {
            NodeKind::Leaf(bytes) => bytes.len() as u64,
            _ => 0,
        };
        self.nodes.push(Some(Node {
            kind,
            tag,
            parent: None,
            children: Vec::new(),
            offset: 0,
            length,
            patches: Vec::new(),
        }));
        NodeId(self.nodes.len() - 1)
    }

    pub fn new_container(&mut self, tag: u32) -> NodeId
    {
        self.alloc(NodeKind::Container, tag)
    }

    pub fn new_leaf(&mut self, tag: u32, bytes: Vec<u8>) -> NodeId
    {
        self.alloc(NodeKind::Leaf(bytes), tag)
    }

    pub fn new_align(&mut self, pad: AlignPad) -> NodeId
    {
        self.alloc(NodeKind::Align(pad), 0)
    }

    fn node(&self, id: NodeId) -> DexResult<&Node>
    {
        match self.nodes.get(id.0).and_then(|n| n.as_ref()) {
            Some(n) => Ok(n),
            None => fail!(IndexOutOfRange, "Block node {} is not live", id.0),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> DexResult<&mut Node>
    {
        match self.nodes.get_mut(id.0).and_then(|n| n.as_mut()) {
            Some(n) => Ok(n),
            None => fail!(IndexOutOfRange, "Block node {} is not live", id.0),
        }
    }

    pub fn contains(&self, id: NodeId) -> bool
    {
        matches!(self.nodes.get(id.0), Some(Some(_)))
    }

    pub fn kind(&self, id: NodeId) -> DexResult<&NodeKind>
    {
        Ok(&self.node(id)?.kind)
    }

    pub fn tag(&self, id: NodeId) -> DexResult<u32>
    {
        Ok(self.node(id)?.tag)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId>
    {
        self.node(id).ok().and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId]
    {
        match self.node(id) {
            Ok(n) => &n.children,
            Err(_) => &[],
        }
    }

    /// Offset from the start of the last refreshed root.
    pub fn offset(&self, id: NodeId) -> DexResult<u64>
    {
        Ok(self.node(id)?.offset)
    }

    /// Length as of the last refresh (leaves always report their byte count).
    pub fn length(&self, id: NodeId) -> DexResult<u64>
    {
        Ok(self.node(id)?.length)
    }

    pub fn leaf(&self, id: NodeId) -> DexResult<&[u8]>
    {
        match &self.node(id)?.kind {
            NodeKind::Leaf(bytes) => Ok(bytes),
            _ => fail!(Format, "Block node {} is not a leaf", id.0),
        }
    }

    pub fn leaf_mut(&mut self, id: NodeId) -> DexResult<&mut Vec<u8>>
    {
        match &mut self.node_mut(id)?.kind {
            NodeKind::Leaf(bytes) => Ok(bytes),
            _ => fail!(Format, "Block node {} is not a leaf", id.0),
        }
    }

    pub fn set_leaf(&mut self, id: NodeId, bytes: Vec<u8>) -> DexResult<()>
    {
        let node = self.node_mut(id)?;
        match &mut node.kind {
            NodeKind::Leaf(old) => {
                node.length = bytes.len() as u64;
                *old = bytes;
                Ok(())
            }
            _ => fail!(Format, "Block node {} is not a leaf", id.0),
        }
    }

    pub fn add_patch(&mut self, id: NodeId, patch: Patch) -> DexResult<()>
    {
        self.node_mut(id)?.patches.push(patch);
        Ok(())
    }

    fn is_ancestor(&self, candidate: NodeId, of: NodeId) -> bool
    {
        let mut cur = Some(of);
        while let Some(id) = cur {
            if id == candidate {
                return true;
            }
            cur = self.parent(id);
        }
        false
    }

    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> DexResult<()>
    {
        let len = self.node(parent)?.children.len();
        self.insert_child(parent, len, child)
    }

    /// Inserts a detached node; siblings are renumbered lazily at the next refresh.
    pub fn insert_child(&mut self, parent: NodeId, index: usize, child: NodeId) -> DexResult<()>
    {
        if self.node(child)?.parent.is_some() {
            fail!(Format, "Block node {} already has a parent", child.0);
        }
        if self.is_ancestor(child, parent) {
            fail!(Format, "Block node {} cannot become its own descendant", child.0);
        }
        let p = self.node_mut(parent)?;
        if !matches!(p.kind, NodeKind::Container) {
            fail!(Format, "Block node {} cannot own children", parent.0);
        }
        if index > p.children.len() {
            fail!(IndexOutOfRange, "Child index {} beyond {} children", index, p.children.len());
        }
        p.children.insert(index, child);
        self.node_mut(child)?.parent = Some(parent);
        Ok(())
    }

    /// Unlinks `id` from its parent, keeping the subtree alive.
    pub fn detach(&mut self, id: NodeId) -> DexResult<()>
    {
        if let Some(parent) = self.node_mut(id)?.parent.take() {
            self.node_mut(parent)?.children.retain(|c| *c != id);
        }
        Ok(())
    }

    /// Detaches `id` and frees it with all of its descendants.
    pub fn remove(&mut self, id: NodeId) -> DexResult<()>
    {
        self.detach(id)?;
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(cur.0).and_then(|n| n.take()) {
                stack.extend(node.children);
            }
        }
        Ok(())
    }

    /// Reorders the children of `parent` by a caller-supplied key.
    pub fn sort_children_by_key<K, F>(&mut self, parent: NodeId, mut key: F) -> DexResult<()>
    where
        K: Ord,
        F: FnMut(&BlockTree, NodeId) -> K,
    {
        let mut children = self.node(parent)?.children.clone();
        children.sort_by_cached_key(|c| key(self, *c));
        self.node_mut(parent)?.children = children;
        Ok(())
    }

    /// Recomputes every length and offset below `root`, then runs the patches bottom-up.
    ///
    /// Repeated calls without intervening mutation produce identical bytes.
    pub fn refresh(&mut self, root: NodeId) -> DexResult<u64>
    {
        let end = self.layout(root, 0)?;
        self.apply_patches(root)?;
        trace!("refreshed block tree at node {} to {} bytes", root.0, end);
        Ok(end)
    }

    fn layout(&mut self, id: NodeId, offset: u64) -> DexResult<u64>
    {
        let (length, children) = {
            let node = self.node(id)?;
            match &node.kind {
                NodeKind::Leaf(bytes) => (Some(bytes.len() as u64), Vec::new()),
                NodeKind::Align(pad) => (Some(pad.size_at(offset)), Vec::new()),
                NodeKind::Container => (None, node.children.clone()),
            }
        };
        let length = match length {
            Some(l) => l,
            None => {
                let mut cur = offset;
                for child in children {
                    cur = self.layout(child, cur)?;
                }
                cur - offset
            }
        };
        let node = self.node_mut(id)?;
        node.offset = offset;
        node.length = length;
        Ok(offset + length)
    }

    fn apply_patches(&mut self, id: NodeId) -> DexResult<()>
    {
        let children = self.node(id)?.children.clone();
        for child in children {
            self.apply_patches(child)?;
        }
        let (patches, offset, length) = {
            let node = self.node(id)?;
            (node.patches.clone(), node.offset, node.length)
        };
        for patch in patches {
            let (field, value) = match patch {
                Patch::Size(field) => (field, length),
                Patch::ChildCount { of, field } => (field, self.node(of)?.children.len() as u64),
                Patch::Length { of, field } => (field, self.node(of)?.length),
                Patch::RelativeOffset { of, field } => {
                    let value = match self.node(of) {
                        Ok(target) if target.parent.is_some() => target.offset.wrapping_sub(offset),
                        _ => 0,
                    };
                    (field, value)
                }
            };
            self.write_field(field, value)?;
        }
        Ok(())
    }

    pub fn write_field(&mut self, field: Field, value: u64) -> DexResult<()>
    {
        let bytes = self.leaf_mut(field.node)?;
        let width = match field.width {
            Width::U8 => 1,
            Width::U16 => 2,
            Width::U32 => 4,
        };
        if field.at + width > bytes.len() {
            fail!(Format, "Patch at {} overruns a {} byte header", field.at, bytes.len());
        }
        match field.width {
            Width::U8 => bytes[field.at] = narrow::<u8, u64>(value, "header field")?,
            Width::U16 => {
                let v: u16 = narrow(value, "header field")?;
                bytes[field.at..field.at + 2].copy_from_slice(&v.to_le_bytes());
            }
            Width::U32 => {
                let v: u32 = narrow(value, "header field")?;
                bytes[field.at..field.at + 4].copy_from_slice(&v.to_le_bytes());
            }
        }
        Ok(())
    }

    pub fn read_field(&self, field: Field) -> DexResult<u32>
    {
        let bytes = self.leaf(field.node)?;
        let v = match field.width {
            Width::U8 => bytes.get(field.at).map(|b| *b as u32),
            Width::U16 => crate::block::get_u2(bytes, field.at).map(|v| v as u32),
            Width::U32 => crate::block::get_u4(bytes, field.at),
        };
        match v {
            Some(v) => Ok(v),
            None => fail!(Format, "Field at {} beyond a {} byte header", field.at, bytes.len()),
        }
    }

    /// Serializes `id` in structural order. Padding nodes emit the size computed by the last refresh.
    pub fn write_bytes(&self, id: NodeId, buffer: &mut Vec<u8>) -> usize
    {
        let node = match self.node(id) {
            Ok(n) => n,
            Err(_) => return 0,
        };
        match &node.kind {
            NodeKind::Leaf(bytes) => {
                buffer.extend_from_slice(bytes);
                bytes.len()
            }
            NodeKind::Align(pad) => {
                buffer.resize(buffer.len() + node.length as usize, pad.fill);
                node.length as usize
            }
            NodeKind::Container => node.children.iter().map(|c| self.write_bytes(*c, buffer)).sum(),
        }
    }

    pub fn count_bytes(&self, id: NodeId) -> u64
    {
        self.node(id).map(|n| n.length).unwrap_or(0)
    }

    /// Deep-copies a subtree from another tree, remapping the patches it owns.
    pub fn import(&mut self, other: &BlockTree, id: NodeId) -> DexResult<NodeId>
    {
        let mut mapping = Vec::new();
        let copy = self.import_node(other, id, &mut mapping)?;
        for (old, new) in &mapping {
            let patches = other.node(*old)?.patches.clone();
            let remap = |n: NodeId| mapping.iter().find(|(o, _)| *o == n).map(|(_, m)| *m);
            let mut remapped = Vec::with_capacity(patches.len());
            for patch in patches {
                let p = match patch {
                    Patch::Size(f) => remap(f.node).map(|node| Patch::Size(Field { node, ..f })),
                    Patch::ChildCount { of, field } => remap(of).zip(remap(field.node))
                        .map(|(of, node)| Patch::ChildCount { of, field: Field { node, ..field } }),
                    Patch::RelativeOffset { of, field } => remap(of).zip(remap(field.node))
                        .map(|(of, node)| Patch::RelativeOffset { of, field: Field { node, ..field } }),
                    Patch::Length { of, field } => remap(of).zip(remap(field.node))
                        .map(|(of, node)| Patch::Length { of, field: Field { node, ..field } }),
                };
                match p {
                    Some(p) => remapped.push(p),
                    None => fail!(Format, "Patch on block node {} points outside the imported subtree", old.0),
                }
            }
            self.node_mut(*new)?.patches = remapped;
        }
        Ok(copy)
    }

    fn import_node(&mut self, other: &BlockTree, id: NodeId, mapping: &mut Vec<(NodeId, NodeId)>) -> DexResult<NodeId>
    {
        let src = other.node(id)?;
        let copy = self.alloc(src.kind.clone(), src.tag);
        {
            let n = self.node_mut(copy)?;
            n.offset = src.offset;
            n.length = src.length;
        }
        mapping.push((id, copy));
        for child in &src.children {
            let c = self.import_node(other, *child, mapping)?;
            self.add_child(copy, c)?;
        }
        Ok(copy)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::block::get_u4;

    // [type u16, header_size u16, size u32, count u32]
    fn chunk(tree: &mut BlockTree) -> (NodeId, NodeId, NodeId)
    {
        let root = tree.new_container(2);
        let header = tree.new_leaf(0, vec![2, 0, 12, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let body = tree.new_container(0);
        tree.add_child(root, header).unwrap();
        tree.add_child(root, body).unwrap();
        tree.add_patch(root, Patch::Size(Field::u32(header, 4))).unwrap();
        tree.add_patch(root, Patch::ChildCount { of: body, field: Field::u32(header, 8) }).unwrap();
        (root, header, body)
    }

    fn bytes(tree: &BlockTree, root: NodeId) -> Vec<u8>
    {
        let mut out = Vec::new();
        tree.write_bytes(root, &mut out);
        out
    }

    #[test]
    fn refresh_patches_size_and_count()
    {
        let mut tree = BlockTree::new();
        let (root, header, body) = chunk(&mut tree);
        let a = tree.new_leaf(0, vec![1, 2, 3]);
        let pad = tree.new_align(AlignPad::default());
        let b = tree.new_leaf(0, vec![9; 4]);
        tree.add_child(body, a).unwrap();
        tree.add_child(body, pad).unwrap();
        tree.add_child(body, b).unwrap();

        assert_eq!(tree.refresh(root).unwrap(), 20);
        let out = bytes(&tree, root);
        assert_eq!(out.len(), 20);
        assert_eq!(get_u4(&out, 4), Some(20));
        assert_eq!(get_u4(&out, 8), Some(3));
        assert_eq!(tree.offset(b).unwrap(), 16);
        assert_eq!(tree.length(pad).unwrap(), 1);
        assert_eq!(tree.read_field(Field::u32(header, 4)).unwrap(), 20);

        tree.refresh(root).unwrap();
        assert_eq!(bytes(&tree, root), out);
    }

    #[test]
    fn relative_offset_follows_moves()
    {
        let mut tree = BlockTree::new();
        let (root, header, body) = chunk(&mut tree);
        let a = tree.new_leaf(0, vec![0; 8]);
        let b = tree.new_leaf(0, vec![0; 4]);
        tree.add_child(body, a).unwrap();
        tree.add_child(body, b).unwrap();
        tree.add_patch(root, Patch::RelativeOffset { of: b, field: Field::u32(header, 8) }).unwrap();
        // the later patch wins over the child count
        tree.refresh(root).unwrap();
        assert_eq!(tree.read_field(Field::u32(header, 8)).unwrap(), 20);

        tree.detach(a).unwrap();
        assert_eq!(tree.parent(a), None);
        assert!(tree.contains(a));
        tree.refresh(root).unwrap();
        assert_eq!(tree.read_field(Field::u32(header, 8)).unwrap(), 12);
        assert_eq!(tree.read_field(Field::u32(header, 4)).unwrap(), 16);

        tree.remove(b).unwrap();
        assert!(!tree.contains(b));
        tree.refresh(root).unwrap();
        assert_eq!(tree.read_field(Field::u32(header, 8)).unwrap(), 0);
    }

    #[test]
    fn rejects_cycles_and_double_parents()
    {
        let mut tree = BlockTree::new();
        let (root, _, body) = chunk(&mut tree);
        assert!(tree.add_child(body, root).is_err());
        let leaf = tree.new_leaf(0, vec![1]);
        tree.add_child(body, leaf).unwrap();
        assert!(tree.add_child(root, leaf).is_err());
        assert!(tree.add_child(leaf, root).is_err());
        let stray = tree.new_leaf(0, vec![0]);
        assert!(tree.insert_child(body, 5, stray).is_err());
        assert_eq!(tree.parent(stray), None);
    }

    #[test]
    fn import_copies_subtree_with_patches()
    {
        let mut src = BlockTree::new();
        let (root, _, body) = chunk(&mut src);
        let leaf = src.new_leaf(7, vec![5; 6]);
        src.add_child(body, leaf).unwrap();
        src.refresh(root).unwrap();

        let mut dst = BlockTree::new();
        let filler = dst.new_leaf(0, vec![0; 3]);
        let copy = dst.import(&src, root).unwrap();
        assert_ne!(copy, root);
        let extra = dst.new_leaf(0, vec![1; 2]);
        let copied_body = dst.children(copy)[1];
        dst.add_child(copied_body, extra).unwrap();
        dst.refresh(copy).unwrap();
        let out = bytes(&dst, copy);
        assert_eq!(get_u4(&out, 4), Some(20));
        assert_eq!(get_u4(&out, 8), Some(2));
        assert!(dst.contains(filler));
        assert_eq!(bytes(&src, root).len(), 18);
    }
}

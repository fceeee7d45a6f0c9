//! Arena storage for one category of dex items.
//!
//! Items live in slots that never move, so an [`Id`] stays valid across
//! insertion, removal and sorting. The wire identity (position in the section)
//! is derived from the current order and recomputed on every structural change.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::dex::reference::NO_INDEX;
use crate::error::DexResult;

/// Map-list type codes and their layout rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SectionType {
    Header,
    StringId,
    TypeId,
    ProtoId,
    FieldId,
    MethodId,
    ClassDef,
    CallSiteId,
    MethodHandle,
    MapList,
    TypeList,
    AnnotationSetRefList,
    AnnotationSet,
    ClassData,
    CodeItem,
    StringData,
    DebugInfo,
    Annotation,
    EncodedArray,
    AnnotationsDirectory,
    HiddenApi,
    Unknown(u16),
}

impl SectionType {
    pub fn from_code(code: u16) -> SectionType {
        match code {
            0x0000 => SectionType::Header,
            0x0001 => SectionType::StringId,
            0x0002 => SectionType::TypeId,
            0x0003 => SectionType::ProtoId,
            0x0004 => SectionType::FieldId,
            0x0005 => SectionType::MethodId,
            0x0006 => SectionType::ClassDef,
            0x0007 => SectionType::CallSiteId,
            0x0008 => SectionType::MethodHandle,
            0x1000 => SectionType::MapList,
            0x1001 => SectionType::TypeList,
            0x1002 => SectionType::AnnotationSetRefList,
            0x1003 => SectionType::AnnotationSet,
            0x2000 => SectionType::ClassData,
            0x2001 => SectionType::CodeItem,
            0x2002 => SectionType::StringData,
            0x2003 => SectionType::DebugInfo,
            0x2004 => SectionType::Annotation,
            0x2005 => SectionType::EncodedArray,
            0x2006 => SectionType::AnnotationsDirectory,
            0xF000 => SectionType::HiddenApi,
            other => SectionType::Unknown(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            SectionType::Header => 0x0000,
            SectionType::StringId => 0x0001,
            SectionType::TypeId => 0x0002,
            SectionType::ProtoId => 0x0003,
            SectionType::FieldId => 0x0004,
            SectionType::MethodId => 0x0005,
            SectionType::ClassDef => 0x0006,
            SectionType::CallSiteId => 0x0007,
            SectionType::MethodHandle => 0x0008,
            SectionType::MapList => 0x1000,
            SectionType::TypeList => 0x1001,
            SectionType::AnnotationSetRefList => 0x1002,
            SectionType::AnnotationSet => 0x1003,
            SectionType::ClassData => 0x2000,
            SectionType::CodeItem => 0x2001,
            SectionType::StringData => 0x2002,
            SectionType::DebugInfo => 0x2003,
            SectionType::Annotation => 0x2004,
            SectionType::EncodedArray => 0x2005,
            SectionType::AnnotationsDirectory => 0x2006,
            SectionType::HiddenApi => 0xF000,
            SectionType::Unknown(code) => *code,
        }
    }

    /// Byte alignment of every item in the section.
    pub fn alignment(&self) -> u64 {
        match self {
            SectionType::StringData
            | SectionType::DebugInfo
            | SectionType::Annotation
            | SectionType::EncodedArray
            | SectionType::ClassData => 1,
            _ => 4,
        }
    }

    /// Fixed-size id sections addressed by index rather than offset.
    pub fn is_id_section(&self) -> bool {
        matches!(self,
            SectionType::StringId | SectionType::TypeId | SectionType::ProtoId
            | SectionType::FieldId | SectionType::MethodId | SectionType::ClassDef
            | SectionType::CallSiteId | SectionType::MethodHandle)
    }

    /// Position in the read order that satisfies forward references.
    pub fn read_rank(&self) -> u32 {
        match self {
            SectionType::Header => 0,
            SectionType::MapList => 1,
            SectionType::StringId => 2,
            SectionType::StringData => 3,
            SectionType::TypeId => 4,
            SectionType::TypeList => 5,
            SectionType::ProtoId => 6,
            SectionType::FieldId => 7,
            SectionType::MethodId => 8,
            SectionType::ClassDef => 9,
            SectionType::CallSiteId => 10,
            SectionType::MethodHandle => 11,
            SectionType::DebugInfo => 12,
            SectionType::CodeItem => 13,
            SectionType::ClassData => 14,
            _ => 15,
        }
    }
}

impl fmt::Display for SectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionType::Unknown(code) => write!(f, "section 0x{:04x}", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Stable handle to an item in a [`Section`].
pub struct Id<T> {
    slot: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    fn new(slot: usize) -> Self {
        Id { slot: slot as u32, _marker: PhantomData }
    }

    pub fn slot(&self) -> usize {
        self.slot as usize
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot
    }
}

impl<T> Eq for Id<T> {}

impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
    }
}

impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.slot.cmp(&other.slot)
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.slot)
    }
}

pub struct Section<T> {
    kind: SectionType,
    slots: Vec<Option<T>>,
    order: Vec<Id<T>>,
    positions: Vec<u32>,
    offsets: Vec<u32>,
    origins: Vec<u32>,
    by_offset: HashMap<u32, Id<T>>,
    offset: u32,
}

impl<T: fmt::Debug> fmt::Debug for Section<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Section")
            .field("kind", &self.kind)
            .field("count", &self.order.len())
            .field("offset", &self.offset)
            .finish()
    }
}

impl<T> Section<T> {
    pub fn new(kind: SectionType) -> Self {
        Section {
            kind,
            slots: Vec::new(),
            order: Vec::new(),
            positions: Vec::new(),
            offsets: Vec::new(),
            origins: Vec::new(),
            by_offset: HashMap::new(),
            offset: 0,
        }
    }

    pub fn kind(&self) -> SectionType {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// File offset of the section as of the last read or layout.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: u32) {
        self.offset = offset;
    }

    fn renumber(&mut self) {
        for (pos, id) in self.order.iter().enumerate() {
            self.positions[id.slot()] = pos as u32;
        }
    }

    fn alloc(&mut self, item: T) -> Id<T> {
        self.slots.push(Some(item));
        self.positions.push(NO_INDEX);
        self.offsets.push(0);
        self.origins.push(0);
        Id::new(self.slots.len() - 1)
    }

    /// Appends an item at the next free index.
    pub fn push(&mut self, item: T) -> Id<T> {
        let id = self.alloc(item);
        self.positions[id.slot()] = self.order.len() as u32;
        self.order.push(id);
        id
    }

    /// Inserts at `index`, shifting every later item up by one.
    pub fn insert(&mut self, index: usize, item: T) -> DexResult<Id<T>> {
        if index > self.order.len() {
            fail!(IndexOutOfRange, "Insert at {} beyond {} items of {}", index, self.order.len(), self.kind);
        }
        let id = self.alloc(item);
        self.order.insert(index, id);
        self.renumber();
        Ok(id)
    }

    /// Appends an item read from `offset`, recording it as its origin.
    pub fn push_read(&mut self, item: T, offset: u32) -> Id<T> {
        let id = self.push(item);
        self.origins[id.slot()] = offset;
        self.set_item_offset(id, offset);
        id
    }

    pub fn remove(&mut self, id: Id<T>) -> Option<T> {
        let item = self.slots.get_mut(id.slot())?.take()?;
        self.order.retain(|i| *i != id);
        self.positions[id.slot()] = NO_INDEX;
        let off = self.offsets[id.slot()];
        if self.by_offset.get(&off) == Some(&id) {
            self.by_offset.remove(&off);
        }
        self.renumber();
        Some(item)
    }

    pub fn contains(&self, id: Id<T>) -> bool {
        matches!(self.slots.get(id.slot()), Some(Some(_)))
    }

    /// Item at a wire index; `NO_INDEX` and out-of-range indices are the absent sentinel.
    pub fn get(&self, index: u32) -> Option<Id<T>> {
        if index == NO_INDEX {
            return None;
        }
        self.order.get(index as usize).copied()
    }

    /// Positional access that treats a missing index as an error.
    pub fn at(&self, index: u32) -> DexResult<Id<T>> {
        match self.get(index) {
            Some(id) => Ok(id),
            None => fail!(IndexOutOfRange, "Index {} out of range for {} with {} items", index, self.kind, self.order.len()),
        }
    }

    /// Current wire index of a live item.
    pub fn index_of(&self, id: Id<T>) -> Option<u32> {
        if !self.contains(id) {
            return None;
        }
        Some(self.positions[id.slot()])
    }

    pub fn item(&self, id: Id<T>) -> Option<&T> {
        self.slots.get(id.slot()).and_then(|s| s.as_ref())
    }

    pub fn item_mut(&mut self, id: Id<T>) -> Option<&mut T> {
        self.slots.get_mut(id.slot()).and_then(|s| s.as_mut())
    }

    /// Item whose current offset is `offset`.
    pub fn get_at(&self, offset: u32) -> Option<Id<T>> {
        self.by_offset.get(&offset).copied()
    }

    pub fn offset_of(&self, id: Id<T>) -> Option<u32> {
        if !self.contains(id) {
            return None;
        }
        Some(self.offsets[id.slot()])
    }

    /// Offset the item was read from, 0 for items created in memory.
    pub fn origin_of(&self, id: Id<T>) -> Option<u32> {
        if !self.contains(id) {
            return None;
        }
        Some(self.origins[id.slot()])
    }

    pub fn set_item_offset(&mut self, id: Id<T>, offset: u32) {
        if !self.contains(id) {
            return;
        }
        let old = self.offsets[id.slot()];
        if self.by_offset.get(&old) == Some(&id) {
            self.by_offset.remove(&old);
        }
        self.offsets[id.slot()] = offset;
        self.by_offset.insert(offset, id);
    }

    /// Ids in wire order.
    pub fn ids(&self) -> &[Id<T>] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> + '_ {
        self.order.iter().filter_map(move |id| self.item(*id).map(|item| (*id, item)))
    }

    /// Every live item, in storage order rather than wire order.
    pub fn items_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        self.slots.iter_mut().flatten()
    }

    /// Moves a live item to a new position.
    pub fn move_to(&mut self, id: Id<T>, index: usize) -> DexResult<()> {
        if !self.contains(id) {
            fail!(IndexOutOfRange, "Item {:?} is not in {}", id, self.kind);
        }
        if index >= self.order.len() {
            fail!(IndexOutOfRange, "Move to {} beyond {} items of {}", index, self.order.len(), self.kind);
        }
        self.order.retain(|i| *i != id);
        self.order.insert(index, id);
        self.renumber();
        Ok(())
    }

    pub fn sort_by<F>(&mut self, mut compare: F)
    where
        F: FnMut(&T, &T) -> Ordering,
    {
        let slots = &self.slots;
        self.order.sort_by(|a, b| match (slots[a.slot()].as_ref(), slots[b.slot()].as_ref()) {
            (Some(x), Some(y)) => compare(x, y),
            _ => Ordering::Equal,
        });
        self.renumber();
    }

    /// Replaces the order with a permutation of the live ids.
    pub fn reorder(&mut self, order: Vec<Id<T>>) -> DexResult<()> {
        let mut seen = vec![false; self.slots.len()];
        for id in &order {
            if !self.contains(*id) || seen[id.slot()] {
                fail!(IndexOutOfRange, "Reorder of {} names {:?} twice or not at all", self.kind, id);
            }
            seen[id.slot()] = true;
        }
        if order.len() != self.order.len() {
            fail!(IndexOutOfRange, "Reorder of {} has {} ids for {} items", self.kind, order.len(), self.order.len());
        }
        self.order = order;
        self.renumber();
        Ok(())
    }
}

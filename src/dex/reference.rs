//! Integer slots that name items in another section.
//!
//! A reference caches the item it resolves to and only turns it back into an
//! integer when the container refreshes, so renumbering caused by later
//! inserts, removals or sorts is picked up through the cached [`Id`].

use std::fmt;

use crate::dex::section::{Id, Section};

/// Wire sentinel for "no item".
pub const NO_INDEX: u32 = 0xFFFF_FFFF;

pub struct IndexReference<T> {
    raw: u32,
    item: Option<Id<T>>,
}

impl<T> Clone for IndexReference<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for IndexReference<T> {}

impl<T> PartialEq for IndexReference<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw && self.item == other.item
    }
}

impl<T> Eq for IndexReference<T> {}

impl<T> fmt::Debug for IndexReference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.item {
            Some(id) => write!(f, "IndexReference({} -> {:?})", self.raw, id),
            None => write!(f, "IndexReference({})", self.raw),
        }
    }
}

impl<T> Default for IndexReference<T> {
    fn default() -> Self {
        IndexReference::absent()
    }
}

impl<T> IndexReference<T> {
    /// Reference holding a raw wire index, resolved on first use.
    pub fn new(raw: u32) -> Self {
        IndexReference { raw, item: None }
    }

    pub fn absent() -> Self {
        IndexReference { raw: NO_INDEX, item: None }
    }

    /// Reference to an in-memory item; the index is written at the next refresh.
    pub fn to(item: Id<T>) -> Self {
        IndexReference { raw: NO_INDEX, item: Some(item) }
    }

    pub fn get(&self) -> u32 {
        self.raw
    }

    /// Overwrites the raw slot and drops the cached item.
    pub fn set(&mut self, index: u32) {
        self.raw = index;
        self.item = None;
    }

    /// Cached item, without consulting the section.
    pub fn peek(&self) -> Option<Id<T>> {
        self.item
    }

    /// Resolves the raw slot through `section` on first call and caches the result.
    pub fn item(&mut self, section: &Section<T>) -> Option<Id<T>> {
        if self.item.is_none() {
            self.item = section.get(self.raw);
        }
        self.item
    }

    /// `None` writes the sentinel immediately; an item defers its index to refresh.
    pub fn set_item(&mut self, item: Option<Id<T>>) {
        match item {
            Some(id) => self.item = Some(id),
            None => {
                self.item = None;
                self.raw = NO_INDEX;
            }
        }
    }

    /// Writes the cached item's current index into the slot.
    ///
    /// A cached item that has since been removed leaves the sentinel behind.
    pub fn refresh(&mut self, section: &Section<T>) {
        if let Some(id) = self.item {
            match section.index_of(id) {
                Some(index) => self.raw = index,
                None => {
                    self.raw = NO_INDEX;
                    self.item = None;
                }
            }
        }
    }

    pub fn is_absent(&self) -> bool {
        self.item.is_none() && self.raw == NO_INDEX
    }
}

/// Offset-addressed twin of [`IndexReference`]; 0 is the absent value.
pub struct OffsetReference<T> {
    raw: u32,
    item: Option<Id<T>>,
}

impl<T> Clone for OffsetReference<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for OffsetReference<T> {}

impl<T> PartialEq for OffsetReference<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw && self.item == other.item
    }
}

impl<T> Eq for OffsetReference<T> {}

impl<T> fmt::Debug for OffsetReference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OffsetReference(0x{:x}, {:?})", self.raw, self.item)
    }
}

impl<T> Default for OffsetReference<T> {
    fn default() -> Self {
        OffsetReference::absent()
    }
}

impl<T> OffsetReference<T> {
    pub fn new(raw: u32) -> Self {
        OffsetReference { raw, item: None }
    }

    pub fn absent() -> Self {
        OffsetReference { raw: 0, item: None }
    }

    pub fn to(item: Id<T>) -> Self {
        OffsetReference { raw: 0, item: Some(item) }
    }

    pub fn get(&self) -> u32 {
        self.raw
    }

    pub fn peek(&self) -> Option<Id<T>> {
        self.item
    }

    pub fn item(&mut self, section: &Section<T>) -> Option<Id<T>> {
        if self.item.is_none() && self.raw != 0 {
            self.item = section.get_at(self.raw);
        }
        self.item
    }

    pub fn set_item(&mut self, item: Option<Id<T>>) {
        self.item = item;
        if item.is_none() {
            self.raw = 0;
        }
    }

    pub fn refresh(&mut self, section: &Section<T>) {
        if let Some(id) = self.item {
            match section.offset_of(id) {
                Some(offset) => self.raw = offset,
                None => {
                    self.raw = 0;
                    self.item = None;
                }
            }
        }
    }

    pub fn is_absent(&self) -> bool {
        self.item.is_none() && self.raw == 0
    }
}

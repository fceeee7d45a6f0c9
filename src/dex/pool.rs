//! Key-deduplicated view over a [`Section`].

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::hash::Hash;

use log::debug;

use crate::dex::section::{Id, Section, SectionType};
use crate::error::DexResult;

/// A section whose items are unique by a value key.
///
/// The key map is only trusted while the pool is fresh; the owning container
/// marks it stale after edits that can change keys (renaming a string changes
/// the key of every type, proto, field and method built on it) and rebuilds it
/// before the next lookup.
pub struct IdPool<K, T> {
    section: Section<T>,
    keys: HashMap<K, Id<T>>,
    stale: bool,
}

impl<K: Debug, T: Debug> Debug for IdPool<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdPool")
            .field("section", &self.section)
            .field("keys", &self.keys.len())
            .field("stale", &self.stale)
            .finish()
    }
}

impl<K, T> IdPool<K, T>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new(kind: SectionType) -> Self {
        IdPool { section: Section::new(kind), keys: HashMap::new(), stale: false }
    }

    pub fn section(&self) -> &Section<T> {
        &self.section
    }

    /// Mutable access that cannot change keys: sorting, offsets, reference refresh.
    pub fn section_mut(&mut self) -> &mut Section<T> {
        &mut self.section
    }

    pub fn len(&self) -> usize {
        self.section.len()
    }

    pub fn is_empty(&self) -> bool {
        self.section.is_empty()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn invalidate(&mut self) {
        self.stale = true;
    }

    /// Looks up an item by key; a stale pool answers nothing.
    pub fn get(&self, key: &K) -> Option<Id<T>> {
        if self.stale {
            return None;
        }
        self.keys.get(key).copied()
    }

    /// Returns the item with an equal key, or appends `make()` at the next free index.
    pub fn get_or_create_with<F>(&mut self, key: K, make: F) -> DexResult<(Id<T>, bool)>
    where
        F: FnOnce() -> T,
    {
        if self.stale {
            fail!(InvalidKey, "Key map of {} must be rebuilt before lookup of {:?}", self.section.kind(), key);
        }
        if let Some(id) = self.keys.get(&key) {
            return Ok((*id, false));
        }
        let id = self.section.push(make());
        self.keys.insert(key, id);
        Ok((id, true))
    }

    /// Appends an item read from the wire; duplicates are caught by [`IdPool::rebuild`].
    pub fn push_read(&mut self, item: T, offset: u32) -> Id<T> {
        self.stale = true;
        self.section.push_read(item, offset)
    }

    /// Re-keys a single item, failing without change if another item already owns `key`.
    pub fn rekey(&mut self, id: Id<T>, old: &K, key: K) -> DexResult<()> {
        if let Some(existing) = self.keys.get(&key) {
            if *existing != id {
                fail!(InvalidKey, "{:?} already exists in {}", key, self.section.kind());
            }
            return Ok(());
        }
        if self.keys.get(old) == Some(&id) {
            self.keys.remove(old);
        }
        self.keys.insert(key, id);
        Ok(())
    }

    pub fn remove(&mut self, id: Id<T>) -> Option<T> {
        let item = self.section.remove(id)?;
        self.keys.retain(|_, v| *v != id);
        Some(item)
    }

    /// Replaces the key map from freshly computed keys.
    pub fn rebuild<I>(&mut self, entries: I) -> DexResult<()>
    where
        I: IntoIterator<Item = (K, Id<T>)>,
    {
        let mut keys = HashMap::with_capacity(self.section.len());
        for (key, id) in entries {
            if let Some(other) = keys.insert(key.clone(), id) {
                if other != id {
                    fail!(InvalidKey, "Duplicate key {:?} in {}", key, self.section.kind());
                }
            }
        }
        debug!("rebuilt {} key map with {} entries", self.section.kind(), keys.len());
        self.keys = keys;
        self.stale = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn get_or_create_dedupes() {
        let mut pool: IdPool<String, String> = IdPool::new(SectionType::StringId);
        let keys = ["b", "a", "b", "c", "a", "a"];
        let mut ids = Vec::new();
        for k in keys {
            let (id, _) = pool.get_or_create_with(k.to_string(), || k.to_string()).unwrap();
            ids.push(id);
        }
        assert_eq!(pool.len(), 3);
        assert_eq!(ids[0], ids[2]);
        assert_eq!(ids[1], ids[4]);
        assert_eq!(ids[1], ids[5]);
        let (_, created) = pool.get_or_create_with("c".to_string(), || unreachable!()).unwrap();
        assert!(!created);
        let mut values: Vec<&String> = pool.section().iter().map(|(_, v)| v).collect();
        values.dedup();
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn stale_pool_refuses_lookup_until_rebuilt() {
        let mut pool: IdPool<String, String> = IdPool::new(SectionType::StringId);
        let x = pool.push_read("x".to_string(), 0x70);
        assert!(pool.get(&"x".to_string()).is_none());
        assert!(pool.get_or_create_with("y".to_string(), || "y".to_string()).is_err());
        pool.rebuild(vec![("x".to_string(), x)]).unwrap();
        assert_eq!(pool.get(&"x".to_string()), Some(x));
    }

    #[test]
    fn rebuild_detects_duplicates_and_rekey_collisions() {
        let mut pool: IdPool<String, String> = IdPool::new(SectionType::TypeId);
        let a = pool.push_read("La;".to_string(), 0);
        let b = pool.push_read("La;".to_string(), 4);
        let e = pool.rebuild(vec![("La;".to_string(), a), ("La;".to_string(), b)]).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidKey);

        pool.rebuild(vec![("La;".to_string(), a), ("Lb;".to_string(), b)]).unwrap();
        assert!(pool.rekey(b, &"Lb;".to_string(), "La;".to_string()).is_err());
        assert_eq!(pool.get(&"Lb;".to_string()), Some(b));
        pool.rekey(b, &"Lb;".to_string(), "Lc;".to_string()).unwrap();
        assert_eq!(pool.get(&"Lc;".to_string()), Some(b));
        assert_eq!(pool.get(&"Lb;".to_string()), None);
        pool.remove(a);
        assert_eq!(pool.get(&"La;".to_string()), None);
    }
}

//! Open-addressed hash table keyed by interned strings.
//!
//! Linear probing over a power-of-two capacity that doubles from 8; deleted
//! slots become tombstones so probe chains stay intact. Because keys are
//! interned, key comparison is handle identity; the one contents-based
//! lookup, `find_string`, exists solely for the interner.

use super::object::{ObjRef, StrRef};
use super::value::Value;

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Option<StrRef>,
    value: Value,
}

impl Entry {
    /// An empty slot is key-less with a nil value; a tombstone is key-less
    /// with `true`.
    fn empty() -> Entry {
        Entry {
            key: None,
            value: Value::nil(),
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && !self.value.is_nil()
    }
}

/// Load factor 3/4, measured including tombstones.
const MAX_LOAD_NUMERATOR: usize = 3;
const MAX_LOAD_DENOMINATOR: usize = 4;

#[derive(Debug, Default)]
pub struct Table {
    entries: Vec<Entry>,
    count: usize,
    count_with_tombstones: usize,
}

impl Table {
    pub fn new() -> Table {
        Table {
            entries: Vec::new(),
            count: 0,
            count_with_tombstones: 0,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Occupied slots including tombstones; this is what the load factor
    /// check measures.
    pub fn count_with_tombstones(&self) -> usize {
        self.count_with_tombstones
    }

    /// Probe for `key`, returning the index of its entry or of the slot an
    /// insertion should use (the first tombstone seen, else the terminating
    /// empty slot). Termination is guaranteed by the load factor.
    fn find_slot(entries: &[Entry], key: StrRef) -> usize {
        let capacity = entries.len();
        let mut index = key.hash as usize % capacity;
        let mut tombstone: Option<usize> = None;

        loop {
            let entry = &entries[index];
            match entry.key {
                Some(k) if k.obj == key.obj => return index,
                Some(_) => {}
                None => {
                    if entry.value.is_nil() {
                        return tombstone.unwrap_or(index);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    pub fn get(&self, key: StrRef) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[Self::find_slot(&self.entries, key)];
        entry.key.map(|_| entry.value)
    }

    /// Update an existing entry. Returns whether the key was present; an
    /// absent key is left absent.
    pub fn set(&mut self, key: StrRef, value: Value) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_slot(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.value = value;
        true
    }

    /// Upsert. Returns whether the key was new.
    pub fn insert(&mut self, key: StrRef, value: Value) -> bool {
        if (self.count_with_tombstones + 1) * MAX_LOAD_DENOMINATOR
            > self.capacity() * MAX_LOAD_NUMERATOR
        {
            let new_capacity = if self.capacity() < 8 {
                8
            } else {
                self.capacity() * 2
            };
            self.adjust_capacity(new_capacity);
        }

        let index = Self::find_slot(&self.entries, key);
        let entry = &mut self.entries[index];
        let new_key = entry.key.is_none();
        let was_empty = new_key && entry.value.is_nil();
        entry.key = Some(key);
        entry.value = value;

        if new_key {
            self.count += 1;
            if was_empty {
                self.count_with_tombstones += 1;
            }
        }
        new_key
    }

    /// Replace the entry with a tombstone so probe chains survive. Returns
    /// whether the key was present.
    pub fn remove(&mut self, key: StrRef) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_slot(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::bool(true);
        self.count -= 1;
        true
    }

    /// Bulk upsert of every live entry of `other`. Returns how many keys
    /// were new.
    pub fn insert_all(&mut self, other: &Table) -> usize {
        let mut added = 0;
        for (key, value) in other.iter() {
            if self.insert(key, value) {
                added += 1;
            }
        }
        added
    }

    /// Contents-based lookup used only while interning: probes by the
    /// precomputed hash and compares actual bytes via `text_of`. Returns the
    /// unique interned key, if any.
    pub fn find_string<'a>(
        &self,
        s: &str,
        hash: u32,
        text_of: impl Fn(ObjRef) -> &'a str,
    ) -> Option<StrRef> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                Some(k) => {
                    if k.hash == hash && text_of(k.obj) == s {
                        return Some(k);
                    }
                }
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    /// Iterate over live entries.
    pub fn iter(&self) -> impl Iterator<Item = (StrRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Tombstone every entry whose key fails the predicate. Used to drop
    /// unmarked strings from the intern table after the GC's mark phase.
    pub fn retain(&mut self, mut keep: impl FnMut(StrRef) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !keep(key) {
                    entry.key = None;
                    entry.value = Value::bool(true);
                    self.count -= 1;
                }
            }
        }
    }

    /// Rehash into a table of `new_capacity`: live entries are reinserted,
    /// tombstones dropped, so the tombstone count resets to the live count.
    fn adjust_capacity(&mut self, new_capacity: usize) {
        let mut new_entries = vec![Entry::empty(); new_capacity];
        let mut new_count = 0;

        for entry in &self.entries {
            let Some(key) = entry.key else { continue };
            let index = Self::find_slot(&new_entries, key);
            new_entries[index] = Entry {
                key: Some(key),
                value: entry.value,
            };
            new_count += 1;
        }

        self.entries = new_entries;
        self.count = new_count;
        self.count_with_tombstones = new_count;
    }
}

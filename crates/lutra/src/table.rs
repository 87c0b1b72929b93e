//! Open-addressed hash table keyed by interned strings.
//!
//! Keys are string handles compared by identity, with their precomputed
//! hash stored alongside each entry; the table never needs to look at the
//! string bytes except through [`Table::find_key_with`], which is how the
//! intern set locates an existing string for new text. Collisions are
//! resolved by linear probing. Deletions leave tombstones, which are
//! distinct from empty slots and count toward the load factor so that
//! probe chains stay bounded; a rehash discards them.

use crate::object::ObjRef;
use crate::value::Value;

const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;
const INITIAL_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy)]
enum Entry {
    Empty,
    Tombstone,
    Full { key: ObjRef, hash: u32, value: Value },
}

#[derive(Debug, Default)]
pub struct Table {
    /// Live entries plus tombstones.
    count: usize,
    /// Always empty or a power of two.
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        match self.entries[self.find_slot(key, hash)] {
            Entry::Full { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Insert or overwrite. Returns `true` when the key was not present.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.entries.len() * MAX_LOAD_NUM {
            self.grow();
        }

        let slot = self.find_slot(key, hash);
        let is_new = match self.entries[slot] {
            Entry::Empty => {
                // Tombstones already count, so only a truly empty slot
                // raises the load.
                self.count += 1;
                true
            }
            Entry::Tombstone => true,
            Entry::Full { .. } => false,
        };
        self.entries[slot] = Entry::Full { key, hash, value };
        is_new
    }

    /// Remove a key, leaving a tombstone. Returns `true` if it was present.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let slot = self.find_slot(key, hash);
        match self.entries[slot] {
            Entry::Full { .. } => {
                self.entries[slot] = Entry::Tombstone;
                true
            }
            _ => false,
        }
    }

    /// Copy every entry into `other` (used for method inheritance).
    pub fn add_all_into(&self, other: &mut Table) {
        for (key, hash, value) in self.entries() {
            other.set(key, hash, value);
        }
    }

    /// Probe by hash, comparing candidate keys with `eq`. This is the
    /// interning lookup: `eq` checks the actual string bytes, everything
    /// else is identity-free probing.
    pub fn find_key_with(&self, hash: u32, mut eq: impl FnMut(ObjRef) -> bool) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            match self.entries[index] {
                Entry::Empty => return None,
                Entry::Tombstone => {}
                Entry::Full { key, hash: h, .. } => {
                    if h == hash && eq(key) {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Iterate live `(key, hash, value)` entries.
    pub fn entries(&self) -> impl Iterator<Item = (ObjRef, u32, Value)> + '_ {
        self.entries.iter().filter_map(|entry| match *entry {
            Entry::Full { key, hash, value } => Some((key, hash, value)),
            _ => None,
        })
    }

    /// Size in bytes of the entry array, for the GC's heap accounting.
    pub fn footprint(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<Entry>()
    }

    /// Index of the entry for `key`, or of the slot where it would be
    /// inserted (the first tombstone on the probe path, if any, else the
    /// terminating empty slot). Requires a non-empty entry array.
    fn find_slot(&self, key: ObjRef, hash: u32) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone = None;
        loop {
            match self.entries[index] {
                Entry::Empty => return tombstone.unwrap_or(index),
                Entry::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Entry::Full { key: k, .. } => {
                    if k == key {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Double the capacity and rehash. Tombstones are dropped, so `count`
    /// becomes the live-entry count.
    fn grow(&mut self) {
        let capacity = if self.entries.is_empty() {
            INITIAL_CAPACITY
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![Entry::Empty; capacity]);
        self.count = 0;
        for entry in old {
            if let Entry::Full { key, hash, value } = entry {
                let slot = self.find_slot(key, hash);
                self.entries[slot] = Entry::Full { key, hash, value };
                self.count += 1;
            }
        }
    }
}

/// FNV-1a, the hash every interned string carries.
pub fn hash_str(text: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for &byte in text.as_bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> ObjRef {
        ObjRef(n)
    }

    #[test]
    fn set_get_overwrite() {
        let mut table = Table::new();
        assert!(table.set(key(1), 10, Value::Number(1.0)));
        assert!(!table.set(key(1), 10, Value::Number(2.0)));
        assert_eq!(table.get(key(1), 10), Some(Value::Number(2.0)));
        assert_eq!(table.get(key(2), 20), None);
    }

    #[test]
    fn delete_leaves_probe_chain_intact() {
        let mut table = Table::new();
        // Three keys with identical hashes probe into one chain.
        table.set(key(1), 7, Value::Number(1.0));
        table.set(key(2), 7, Value::Number(2.0));
        table.set(key(3), 7, Value::Number(3.0));

        assert!(table.delete(key(2), 7));
        assert!(!table.delete(key(2), 7));
        // The tombstone must not hide the key past it.
        assert_eq!(table.get(key(3), 7), Some(Value::Number(3.0)));
        // Reinsertion reuses the tombstone.
        assert!(table.set(key(2), 7, Value::Number(4.0)));
        assert_eq!(table.get(key(2), 7), Some(Value::Number(4.0)));
    }

    #[test]
    fn growth_preserves_entries() {
        let mut table = Table::new();
        for i in 0..100 {
            table.set(key(i), i.wrapping_mul(0x9e3779b9), Value::Number(i as f64));
        }
        for i in 0..100 {
            assert_eq!(
                table.get(key(i), i.wrapping_mul(0x9e3779b9)),
                Some(Value::Number(i as f64))
            );
        }
    }

    #[test]
    fn add_all_copies_entries() {
        let mut from = Table::new();
        from.set(key(1), 1, Value::Bool(true));
        from.set(key(2), 2, Value::Nil);

        let mut to = Table::new();
        to.set(key(2), 2, Value::Bool(false));
        from.add_all_into(&mut to);

        assert_eq!(to.get(key(1), 1), Some(Value::Bool(true)));
        // Copied entries overwrite.
        assert_eq!(to.get(key(2), 2), Some(Value::Nil));
    }

    #[test]
    fn find_key_with_skips_tombstones() {
        let mut table = Table::new();
        table.set(key(1), 5, Value::Nil);
        table.set(key(2), 5, Value::Nil);
        table.delete(key(1), 5);
        assert_eq!(table.find_key_with(5, |k| k == key(2)), Some(key(2)));
        assert_eq!(table.find_key_with(5, |k| k == key(1)), None);
    }

    #[test]
    fn fnv1a_reference_values() {
        assert_eq!(hash_str(""), 2166136261);
        assert_eq!(hash_str("a"), 0xe40c292c);
    }
}

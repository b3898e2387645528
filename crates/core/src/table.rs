//! Open-addressing, linear-probe hash map keyed by interned strings.
//!
//! Key equality is pointer identity — legal only because every key is an
//! interned `ObjString`, so two equal strings are always the same
//! allocation (§4.4). Used for the global-variable map, every class's
//! method table, every instance's field table, and (via `find_key`) the
//! string intern set itself.

use crate::object::{ObjRef, ObjString};
use crate::value::Value;

const LOAD_FACTOR_MAX: f64 = 0.75;

#[derive(Clone, Copy)]
enum Slot {
    Empty,
    Tombstone,
    Occupied(ObjRef, Value),
}

pub struct Table {
    slots: Vec<Slot>,
    count: usize, // occupied + tombstones
    live: usize,  // occupied only
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Table {
        Table {
            slots: Vec::new(),
            count: 0,
            live: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn find_slot(slots: &[Slot], key: ObjRef, hash: u32) -> usize {
        let cap = slots.len();
        let mut index = (hash as usize) & (cap - 1);
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &slots[index] {
                Slot::Empty => return first_tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                Slot::Occupied(k, _) => {
                    if *k == key {
                        return index;
                    }
                }
            }
            index = (index + 1) & (cap - 1);
        }
    }

    fn grow(&mut self) {
        let new_cap = if self.slots.is_empty() {
            8
        } else {
            self.slots.len() * 2
        };
        let mut new_slots: Vec<Slot> = (0..new_cap).map(|_| Slot::Empty).collect();
        self.live = 0;
        for slot in std::mem::take(&mut self.slots) {
            if let Slot::Occupied(k, v) = slot {
                let hash = unsafe { k.as_string().hash };
                let idx = Self::find_slot(&new_slots, k, hash);
                new_slots[idx] = Slot::Occupied(k, v);
                self.live += 1;
            }
        }
        self.slots = new_slots;
        self.count = self.live;
    }

    /// Inserts or overwrites `key -> value`. Returns `true` if `key` was
    /// newly added (didn't already have an entry).
    pub fn set(&mut self, key: ObjRef, value: Value) -> bool {
        if self.slots.is_empty() || (self.count + 1) as f64 > self.capacity() as f64 * LOAD_FACTOR_MAX
        {
            self.grow();
        }
        let hash = unsafe { key.as_string().hash };
        let idx = Self::find_slot(&self.slots, key, hash);
        let is_new = !matches!(self.slots[idx], Slot::Occupied(..));
        let was_tombstone = matches!(self.slots[idx], Slot::Tombstone);
        self.slots[idx] = Slot::Occupied(key, value);
        if is_new {
            self.live += 1;
            if !was_tombstone {
                self.count += 1;
            }
        }
        is_new
    }

    pub fn get(&self, key: ObjRef) -> Option<Value> {
        if self.slots.is_empty() {
            return None;
        }
        let hash = unsafe { key.as_string().hash };
        let idx = Self::find_slot(&self.slots, key, hash);
        match self.slots[idx] {
            Slot::Occupied(_, v) => Some(v),
            _ => None,
        }
    }

    pub fn contains(&self, key: ObjRef) -> bool {
        self.get(key).is_some()
    }

    pub fn delete(&mut self, key: ObjRef) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let hash = unsafe { key.as_string().hash };
        let idx = Self::find_slot(&self.slots, key, hash);
        if matches!(self.slots[idx], Slot::Occupied(..)) {
            self.slots[idx] = Slot::Tombstone;
            self.live -= 1;
            true
        } else {
            false
        }
    }

    /// Looks up an interned string by raw bytes/hash without first
    /// allocating a candidate `ObjString` — used by the intern set.
    pub fn find_key(&self, bytes: &[u8], hash: u32) -> Option<ObjRef> {
        if self.slots.is_empty() {
            return None;
        }
        let cap = self.slots.len();
        let mut index = (hash as usize) & (cap - 1);
        loop {
            match &self.slots[index] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Occupied(k, _) => {
                    let s: &ObjString = unsafe { k.as_string() };
                    if s.hash == hash && s.as_bytes() == bytes {
                        return Some(*k);
                    }
                }
            }
            index = (index + 1) & (cap - 1);
        }
    }

    /// Removes every entry whose key is unmarked — run before sweeping so
    /// the intern set never outlives the strings it indexes (weak-key
    /// invariant, §4.5).
    pub fn remove_unmarked_keys(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Slot::Occupied(k, _) = slot {
                if !k.is_marked() {
                    *slot = Slot::Tombstone;
                    self.live -= 1;
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied(k, v) => Some((*k, *v)),
            _ => None,
        })
    }
}

use std::collections::HashMap;

use crate::posted::PostedFile;

struct Slot<V> {
    key: String,
    values: Vec<V>,
}

/// Ordered multimap: distinct keys keep first-insertion order, values under a
/// key keep call order. The key index and the positional list stay consistent
/// across removals.
pub struct OrderedMultimap<V> {
    index: HashMap<String, usize>,
    slots: Vec<Slot<V>>,
}

impl<V> OrderedMultimap<V> {
    pub fn new() -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns true when the key is new.
    pub fn add(&mut self, key: &str, value: V) -> bool {
        match self.index.get(key) {
            Some(&pos) => {
                self.slots[pos].values.push(value);
                false
            }
            None => {
                self.index.insert(key.to_string(), self.slots.len());
                self.slots.push(Slot {
                    key: key.to_string(),
                    values: vec![value],
                });
                true
            }
        }
    }

    /// Replaces all of `key`'s values with exactly one.
    pub fn set(&mut self, key: &str, value: V) -> bool {
        match self.index.get(key) {
            Some(&pos) => {
                self.slots[pos].values.clear();
                self.slots[pos].values.push(value);
                false
            }
            None => {
                self.index.insert(key.to_string(), self.slots.len());
                self.slots.push(Slot {
                    key: key.to_string(),
                    values: vec![value],
                });
                true
            }
        }
    }

    pub fn key_at(&self, index: usize) -> Option<&str> {
        self.slots.get(index).map(|slot| slot.key.as_str())
    }

    pub fn values_at(&self, index: usize) -> Option<&[V]> {
        self.slots.get(index).map(|slot| slot.values.as_slice())
    }

    pub fn values(&self, key: &str) -> Option<&[V]> {
        let pos = *self.index.get(key)?;
        Some(self.slots[pos].values.as_slice())
    }

    pub fn all_keys(&self) -> Vec<String> {
        self.slots.iter().map(|slot| slot.key.clone()).collect()
    }

    /// Removes `key` and re-indexes every later position.
    pub fn remove(&mut self, key: &str) -> bool {
        let Some(pos) = self.index.remove(key) else {
            return false;
        };
        self.slots.remove(pos);
        for slot_pos in self.index.values_mut() {
            if *slot_pos > pos {
                *slot_pos -= 1;
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
    }
}

impl<V> Default for OrderedMultimap<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// String-valued form/query collection. Keyed lookup joins multiple values
/// with commas; positional lookup is index-based.
#[derive(Default)]
pub struct NameValueCollection {
    inner: OrderedMultimap<String>,
}

impl NameValueCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn add(&mut self, key: &str, value: impl Into<String>) -> bool {
        self.inner.add(key, value.into())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> bool {
        self.inner.set(key, value.into())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.values(key).map(|values| values.join(","))
    }

    pub fn get_at(&self, index: usize) -> Option<String> {
        self.inner.values_at(index).map(|values| values.join(","))
    }

    pub fn key_at(&self, index: usize) -> Option<&str> {
        self.inner.key_at(index)
    }

    pub fn values(&self, key: &str) -> Option<&[String]> {
        self.inner.values(key)
    }

    pub fn values_at(&self, index: usize) -> Option<&[String]> {
        self.inner.values_at(index)
    }

    pub fn all_keys(&self) -> Vec<String> {
        self.inner.all_keys()
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.inner.remove(key)
    }

    pub fn clear(&mut self) {
        self.inner.clear()
    }
}

/// Uploaded-file collection keyed by form field name.
#[derive(Default)]
pub struct FileCollection {
    inner: OrderedMultimap<PostedFile>,
}

impl FileCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn add(&mut self, key: &str, value: PostedFile) -> bool {
        self.inner.add(key, value)
    }

    pub fn get(&self, key: &str) -> Option<&PostedFile> {
        self.inner.values(key).and_then(|values| values.first())
    }

    pub fn get_at(&self, index: usize) -> Option<&PostedFile> {
        self.inner.values_at(index).and_then(|values| values.first())
    }

    pub fn key_at(&self, index: usize) -> Option<&str> {
        self.inner.key_at(index)
    }

    pub fn get_multiple(&self, key: &str) -> Option<&[PostedFile]> {
        self.inner.values(key)
    }

    pub fn all_keys(&self) -> Vec<String> {
        self.inner.all_keys()
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.inner.remove(key)
    }
}

/// Assembles `k=v&k=v2` pairs from every key/value in call order. Values are
/// not URL encoded.
pub fn to_query_string(coll: &NameValueCollection) -> String {
    let mut out = String::new();
    for index in 0..coll.len() {
        let Some(key) = coll.key_at(index) else {
            continue;
        };
        let Some(values) = coll.values_at(index) else {
            continue;
        };
        for value in values {
            if !out.is_empty() {
                out.push('&');
            }
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
    }
    out
}

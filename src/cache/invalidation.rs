//! Tag Index
//!
//! Two-way mapping between invalidation tags and the keys carrying them.
//! Updated in the same operation that writes or removes the entry, while
//! that key's lock is held.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;

#[derive(Debug, Default)]
struct TagMaps {
    by_tag: HashMap<String, HashSet<String>>,
    by_key: HashMap<String, BTreeSet<String>>,
}

impl TagMaps {
    fn detach(&mut self, key: &str) -> BTreeSet<String> {
        let tags = self.by_key.remove(key).unwrap_or_default();
        for tag in &tags {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        tags
    }
}

/// Tag -> keys index
#[derive(Debug, Default)]
pub struct TagIndex {
    maps: RwLock<TagMaps>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tags of `key`, replacing whatever it carried before
    pub fn register(&self, key: &str, tags: &BTreeSet<String>) {
        let mut maps = self.maps.write();
        maps.detach(key);
        if tags.is_empty() {
            return;
        }
        for tag in tags {
            maps.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        maps.by_key.insert(key.to_string(), tags.clone());
    }

    /// Drop every mapping of `key`, returning the tags it had
    pub fn unregister(&self, key: &str) -> BTreeSet<String> {
        self.maps.write().detach(key)
    }

    /// Keys currently registered under `tag`, sorted
    pub fn keys_for(&self, tag: &str) -> Vec<String> {
        let maps = self.maps.read();
        let mut keys: Vec<String> = maps
            .by_tag
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Keys registered under any of `tags`, each once, sorted
    pub fn keys_for_any<S: AsRef<str>>(&self, tags: &[S]) -> Vec<String> {
        let maps = self.maps.read();
        let keys: BTreeSet<String> = tags
            .iter()
            .filter_map(|tag| maps.by_tag.get(tag.as_ref()))
            .flat_map(|keys| keys.iter().cloned())
            .collect();
        keys.into_iter().collect()
    }

    pub fn tags_for(&self, key: &str) -> BTreeSet<String> {
        self.maps
            .read()
            .by_key
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tag_count(&self) -> usize {
        self.maps.read().by_tag.len()
    }

    pub fn key_count(&self) -> usize {
        self.maps.read().by_key.len()
    }

    pub fn clear(&self) {
        let mut maps = self.maps.write();
        maps.by_tag.clear();
        maps.by_key.clear();
    }
}

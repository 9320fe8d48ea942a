//! Node List
//!
//! An ordered list of evaluable things with a nickname index. The environment
//! evaluates its list front to back each block, and groups keep their members
//! in one too.

use crate::error::{Error, Result};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Entry<K> {
    key: K,
    nickname: Option<String>,
    // Insertion sequence, for falling back to the latest holder of a nickname
    seq: u64,
}

/// Ordered nodes plus a nickname index
#[derive(Debug, Clone)]
pub struct NodeList<K> {
    entries: Vec<Entry<K>>,
    named: HashMap<String, K>,
    next_seq: u64,
}

impl<K> Default for NodeList<K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            named: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<K: Copy + PartialEq> NodeList<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the front
    pub fn head(&mut self, key: K, nickname: Option<&str>) -> usize {
        self.insert(0, key, nickname)
    }

    /// Insert at the back
    pub fn tail(&mut self, key: K, nickname: Option<&str>) -> usize {
        self.insert(self.entries.len(), key, nickname)
    }

    /// Insert at `index`, clamped to the list length
    pub fn at(&mut self, index: usize, key: K, nickname: Option<&str>) -> usize {
        self.insert(index.min(self.entries.len()), key, nickname)
    }

    /// Insert immediately before `reference`
    pub fn before(&mut self, reference: K, key: K, nickname: Option<&str>) -> Result<usize> {
        let index = self.index_of(reference).ok_or(Error::NotInList)?;
        Ok(self.insert(index, key, nickname))
    }

    /// Insert immediately after `reference`
    pub fn after(&mut self, reference: K, key: K, nickname: Option<&str>) -> Result<usize> {
        let index = self.index_of(reference).ok_or(Error::NotInList)?;
        Ok(self.insert(index + 1, key, nickname))
    }

    /// Remove the first occurrence of `key`, returning where it was
    pub fn remove(&mut self, key: K) -> Result<usize> {
        let index = self.index_of(key).ok_or(Error::NotInList)?;
        let entry = self.entries.remove(index);

        if let Some(nickname) = entry.nickname {
            if self.named.get(&nickname) == Some(&key) {
                let fallback = self
                    .entries
                    .iter()
                    .filter(|e| e.nickname.as_deref() == Some(nickname.as_str()))
                    .max_by_key(|e| e.seq)
                    .map(|e| e.key);
                match fallback {
                    Some(previous) => {
                        self.named.insert(nickname, previous);
                    }
                    None => {
                        self.named.remove(&nickname);
                    }
                }
            }
        }
        Ok(index)
    }

    pub fn index_of(&self, key: K) -> Option<usize> {
        self.entries.iter().position(|e| e.key == key)
    }

    pub fn contains(&self, key: K) -> bool {
        self.index_of(key).is_some()
    }

    /// The most recently inserted node under `nickname`
    pub fn named(&self, nickname: &str) -> Option<K> {
        self.named.get(nickname).copied()
    }

    pub fn get(&self, index: usize) -> Option<K> {
        self.entries.get(index).map(|e| e.key)
    }

    pub fn iter(&self) -> impl Iterator<Item = K> + '_ {
        self.entries.iter().map(|e| e.key)
    }

    pub fn to_vec(&self) -> Vec<K> {
        self.iter().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.named.clear();
    }

    fn insert(&mut self, index: usize, key: K, nickname: Option<&str>) -> usize {
        if let Some(nickname) = nickname {
            self.named.insert(nickname.to_string(), key);
        }
        self.entries.insert(
            index,
            Entry {
                key,
                nickname: nickname.map(str::to_string),
                seq: self.next_seq,
            },
        );
        self.next_seq += 1;
        index
    }
}

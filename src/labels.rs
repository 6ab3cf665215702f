//! Gesture vocabulary: name ↔ class index.
//!
//! Indices are append-only. A name keeps its index for the lifetime of the
//! map file and a new name always gets `max + 1`, so class outputs of older
//! models keep meaning the same gesture.

use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    error::{DuplicateIndex, StoreError},
    store::write_atomic,
};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, usize>",
    into = "BTreeMap<String, usize>"
)]
pub struct LabelMap {
    by_name: BTreeMap<String, usize>,
    by_index: BTreeMap<usize, String>,
}

impl LabelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, index: usize) -> Option<&str> {
        self.by_index.get(&index).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn max_index(&self) -> Option<usize> {
        self.by_index.keys().next_back().copied()
    }

    /// Entries in class-index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.by_index
            .iter()
            .map(|(index, name)| (*index, name.as_str()))
    }

    /// Returns the index bound to `name`, binding the next free index first
    /// if the name is new.
    pub fn append(&mut self, name: &str) -> usize {
        if let Some(index) = self.index_of(name) {
            return index;
        }
        let index = self.max_index().map_or(0, |max| max + 1);
        self.by_name.insert(name.to_string(), index);
        self.by_index.insert(index, name.to_string());
        index
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let json = fs::read_to_string(path).map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let json = self.to_json().map_err(|source| StoreError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
        write_atomic(path, json.as_bytes()).map_err(|source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl TryFrom<BTreeMap<String, usize>> for LabelMap {
    type Error = DuplicateIndex;

    fn try_from(by_name: BTreeMap<String, usize>) -> Result<Self, Self::Error> {
        let mut by_index = BTreeMap::new();
        for (name, index) in &by_name {
            if let Some(first) = by_index.insert(*index, name.clone()) {
                return Err(DuplicateIndex {
                    index: *index,
                    first,
                    second: name.clone(),
                });
            }
        }
        Ok(Self { by_name, by_index })
    }
}

impl From<LabelMap> for BTreeMap<String, usize> {
    fn from(map: LabelMap) -> Self {
        map.by_name
    }
}

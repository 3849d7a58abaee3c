//! Service facts — the key/value attributes a service is announced and
//! queried by.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::KeyValuePair;

/// An unordered set of facts. A key appears at most once; inserting an
/// existing key replaces its value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactSet(BTreeMap<String, String>);

impl FactSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True when every fact in `query` is present here with the same value.
    /// An empty query matches everything.
    pub fn contains_all(&self, query: &FactSet) -> bool {
        query.0.iter().all(|(k, v)| self.0.get(k) == Some(v))
    }

    pub fn to_pairs(&self) -> Vec<KeyValuePair> {
        self.0
            .iter()
            .map(|(key, value)| KeyValuePair {
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }

    pub fn from_pairs(pairs: &[KeyValuePair]) -> Self {
        pairs
            .iter()
            .map(|p| (p.key.clone(), p.value.clone()))
            .collect()
    }
}

impl<K, V> FromIterator<(K, V)> for FactSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

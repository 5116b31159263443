//! Label-to-key lookup
//!
//! The pool rotates opaque labels (`key-1`, `key-2`, ...) so that status
//! endpoints and logs never carry key material. The ring maps a granted label
//! back to its secret at the moment the upstream request is built.

use common::Secret;

#[derive(Debug)]
pub struct KeyRing {
    entries: Vec<(String, Secret<String>)>,
}

impl KeyRing {
    /// Label keys `key-1..key-N` in the order given.
    pub fn new(keys: Vec<Secret<String>>) -> Self {
        let entries = keys
            .into_iter()
            .enumerate()
            .map(|(idx, key)| (format!("key-{}", idx + 1), key))
            .collect();
        Self { entries }
    }

    /// Labels in rotation order, for constructing the pool.
    pub fn labels(&self) -> Vec<String> {
        self.entries.iter().map(|(label, _)| label.clone()).collect()
    }

    pub fn get(&self, label: &str) -> Option<&Secret<String>> {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, key)| key)
    }

    /// (label, redacted hint) pairs for startup logging.
    pub fn hints(&self) -> impl Iterator<Item = (&str, String)> {
        self.entries
            .iter()
            .map(|(label, key)| (label.as_str(), key.hint()))
    }
}
